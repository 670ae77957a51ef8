//! Per-loader linear allocation.
//!
//! Classes, member arrays, and dex caches are allocated into the arena of
//! the loader that owns them and are never freed individually; the whole
//! arena is destroyed when the loader is torn down. Growing a member array
//! (miranda/default method append) allocates a replacement block and leaves
//! the old block in place, so stale handles stay dereferenceable until
//! teardown.
//!
//! On hosts with 32-bit dispatch pointers the backing storage would need to
//! sit in the low 4 GiB; the allocation seam here is where such a pool
//! would plug in.
use dexrt_types::{ArtField, ArtMethod, Class, ClassRef, DexCache, DexCacheRef};
use dexrt_utils::sync::Mutex;
use std::ptr::NonNull;

#[derive(Default)]
struct Blocks {
    classes: Vec<Box<Class>>,
    fields: Vec<Box<[ArtField]>>,
    methods: Vec<Box<[ArtMethod]>>,
    dex_caches: Vec<Box<DexCache>>,
}

#[derive(Default)]
pub struct LinearAlloc {
    blocks: Mutex<Blocks>,
}

impl LinearAlloc {
    pub fn new() -> Self {
        LinearAlloc::default()
    }

    /// Number of classes allocated here. Diagnostic only.
    pub fn num_classes(&self) -> usize {
        self.blocks.lock().classes.len()
    }

    pub fn alloc_class(&self, class: Class) -> ClassRef {
        let boxed = Box::new(class);
        let ptr = NonNull::from(&*boxed);
        self.blocks.lock().classes.push(boxed);
        ClassRef::from_raw(ptr)
    }

    pub fn alloc_fields(&self, fields: Vec<ArtField>) -> &'static [ArtField] {
        let boxed: Box<[ArtField]> = fields.into_boxed_slice();
        // The box's heap storage never moves; the slice stays valid until
        // the arena is dropped with its loader.
        let slice: &'static [ArtField] = unsafe { &*(&*boxed as *const [ArtField]) };
        self.blocks.lock().fields.push(boxed);
        slice
    }

    pub fn alloc_methods(&self, methods: Vec<ArtMethod>) -> &'static [ArtMethod] {
        let boxed: Box<[ArtMethod]> = methods.into_boxed_slice();
        let slice: &'static [ArtMethod] = unsafe { &*(&*boxed as *const [ArtMethod]) };
        self.blocks.lock().methods.push(boxed);
        slice
    }

    pub fn alloc_dex_cache(&self, cache: DexCache) -> DexCacheRef {
        let boxed = Box::new(cache);
        let ptr = NonNull::from(&*boxed);
        self.blocks.lock().dex_caches.push(boxed);
        DexCacheRef::from_raw(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexrt_types::LoaderId;

    #[test]
    fn allocations_are_address_stable() {
        let arena = LinearAlloc::new();
        let first = arena.alloc_class(Class::new("La/A;", LoaderId::BOOT));
        let first_ptr = first.as_ptr();
        for i in 0..128 {
            arena.alloc_class(Class::new(&format!("La/C{i};"), LoaderId::BOOT));
        }
        assert_eq!(first.as_ptr(), first_ptr);
        assert_eq!(first.descriptor(), "La/A;");
        assert_eq!(arena.num_classes(), 129);
    }
}
