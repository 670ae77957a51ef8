//! String interning for resolved string constants.
//!
//! Resolved strings are handed out as `&'static str` so dex-cache slots can
//! hold them without ownership. Interned storage is leaked deliberately;
//! string constants live for the life of the process.
use dashmap::DashMap;

#[derive(Default)]
pub struct InternTable {
    strings: DashMap<&'static str, ()>,
}

impl InternTable {
    pub fn new() -> Self {
        InternTable::default()
    }

    pub fn intern(&self, s: &str) -> &'static str {
        if let Some(entry) = self.strings.get(s) {
            return *entry.key();
        }
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        match self.strings.entry(leaked) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                // Lost a race; the duplicate leak is tolerated.
                *e.key()
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let key = *e.key();
                e.insert(());
                key
            }
        }
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let table = InternTable::new();
        let a = table.intern("hello");
        let b = table.intern("hello");
        assert!(std::ptr::eq(a, b));
        assert_eq!(table.len(), 1);
        let c = table.intern("world");
        assert!(!std::ptr::eq(a, c));
    }
}
