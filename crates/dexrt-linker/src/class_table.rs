//! Per-loader class table.
//!
//! A hashed set of classes keyed by descriptor and its modified-UTF-8 hash.
//! The table is generational: `freeze_snapshot` seals every present entry
//! into the frozen ("zygote") generations and directs later insertions to a
//! fresh generation, while lookup still sees all generations. External
//! synchronization (the class-loaders lock) guards all access.
use dexrt_types::ClassRef;
use hashbrown::hash_table::{Entry, HashTable};

pub struct ClassTable {
    generations: Vec<HashTable<ClassRef>>,
}

impl Default for ClassTable {
    fn default() -> Self {
        ClassTable::new()
    }
}

impl ClassTable {
    pub fn new() -> Self {
        ClassTable { generations: vec![HashTable::new()] }
    }

    fn rehash(class: &ClassRef) -> u64 {
        class.hash() as u64
    }

    /// Descriptor lookup across all generations, newest first (the newest
    /// generation holds any replacement of a retired class).
    pub fn lookup(&self, descriptor: &str, hash: u32) -> Option<ClassRef> {
        for generation in self.generations.iter().rev() {
            if let Some(class) =
                generation.find(hash as u64, |c| c.descriptor() == descriptor)
            {
                return Some(*class);
            }
        }
        None
    }

    /// Inserts into the newest generation. Returns false if a class with
    /// the same descriptor is already present in any generation.
    pub fn insert(&mut self, class: ClassRef) -> bool {
        let descriptor = class.descriptor();
        let hash = class.hash();
        if self.lookup(descriptor, hash).is_some() {
            return false;
        }
        let newest = self.generations.last_mut().unwrap();
        newest.insert_unique(hash as u64, class, Self::rehash);
        true
    }

    /// Replaces the entry for `descriptor` in place. Returns the previous
    /// class; used for the transient swap of a temp class for its final
    /// class.
    pub fn update(&mut self, descriptor: &str, new_class: ClassRef) -> Option<ClassRef> {
        let hash = new_class.hash();
        debug_assert_eq!(descriptor, new_class.descriptor());
        for generation in self.generations.iter_mut().rev() {
            if let Some(slot) = generation.find_mut(hash as u64, |c| c.descriptor() == descriptor)
            {
                return Some(std::mem::replace(slot, new_class));
            }
        }
        None
    }

    pub fn remove(&mut self, descriptor: &str, hash: u32) -> bool {
        for generation in self.generations.iter_mut().rev() {
            match generation.entry(hash as u64, |c| c.descriptor() == descriptor, Self::rehash) {
                Entry::Occupied(entry) => {
                    entry.remove();
                    return true;
                }
                Entry::Vacant(_) => continue,
            }
        }
        false
    }

    pub fn visit(&self, mut visitor: impl FnMut(ClassRef)) {
        for generation in &self.generations {
            for class in generation.iter() {
                visitor(*class);
            }
        }
    }

    /// Seals the current contents: all present entries become part of the
    /// frozen generations, and later insertions go to a new generation.
    pub fn freeze_snapshot(&mut self) {
        self.generations.push(HashTable::new());
    }

    /// Classes in frozen generations.
    pub fn num_zygote_classes(&self) -> usize {
        self.generations[..self.generations.len() - 1]
            .iter()
            .map(|g| g.len())
            .sum()
    }

    /// Classes inserted since the last freeze (or ever, if never frozen).
    pub fn num_non_zygote_classes(&self) -> usize {
        self.generations.last().unwrap().len()
    }

    pub fn len(&self) -> usize {
        self.generations.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
