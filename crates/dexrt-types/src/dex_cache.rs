//! Per-container resolution cache.
use crate::{
    class::{Class, ClassRef},
    field::{ArtField, FieldRef},
    method::{ArtMethod, MethodRef},
};
use dexrt_dex::DexFile;
use dexrt_utils::{
    sync::{Arc, AtomicPtr, Ordering},
    DexFieldIndex, DexMethodIndex, StringIndex, TypeIndex,
};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
    sync::OnceLock,
};

/// Resolution cache for one registered container: container index ->
/// resolved entity.
///
/// Slots are written with relaxed atomics; racing resolvers of the same
/// index always produce the identical entity, so the last writer wins with
/// the same value. There is no eviction: once non-null, a slot is stable
/// for the lifetime of the container.
pub struct DexCache {
    dex: Arc<DexFile>,
    strings: Box<[OnceLock<&'static str>]>,
    types: Box<[AtomicPtr<Class>]>,
    methods: Box<[AtomicPtr<ArtMethod>]>,
    fields: Box<[AtomicPtr<ArtField>]>,
}

impl DexCache {
    pub fn new(dex: Arc<DexFile>) -> Self {
        let strings = (0..dex.num_strings()).map(|_| OnceLock::new()).collect();
        let types = (0..dex.num_types())
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        let methods = (0..dex.num_methods())
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        let fields = (0..dex.num_fields())
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        DexCache { dex, strings, types, methods, fields }
    }

    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex
    }

    pub fn resolved_string(&self, idx: StringIndex) -> Option<&'static str> {
        self.strings.get(idx.as_usize()).and_then(|slot| slot.get().copied())
    }

    pub fn set_resolved_string(&self, idx: StringIndex, value: &'static str) {
        // First writer wins; racing writers carry the same interned value.
        let _ = self.strings[idx.as_usize()].set(value);
    }

    pub fn resolved_type(&self, idx: TypeIndex) -> Option<ClassRef> {
        self.types
            .get(idx.as_usize())
            .and_then(|slot| NonNull::new(slot.load(Ordering::Relaxed)))
            .map(ClassRef::from_raw)
    }

    pub fn set_resolved_type(&self, idx: TypeIndex, class: ClassRef) {
        self.types[idx.as_usize()].store(class.as_ptr(), Ordering::Relaxed);
    }

    pub fn resolved_method(&self, idx: DexMethodIndex) -> Option<MethodRef> {
        self.methods
            .get(idx.as_usize())
            .and_then(|slot| NonNull::new(slot.load(Ordering::Relaxed)))
            .map(MethodRef::from_raw)
    }

    pub fn set_resolved_method(&self, idx: DexMethodIndex, method: MethodRef) {
        self.methods[idx.as_usize()].store(method.as_ptr(), Ordering::Relaxed);
    }

    pub fn resolved_field(&self, idx: DexFieldIndex) -> Option<FieldRef> {
        self.fields
            .get(idx.as_usize())
            .and_then(|slot| NonNull::new(slot.load(Ordering::Relaxed)))
            .map(FieldRef::from_raw)
    }

    pub fn set_resolved_field(&self, idx: DexFieldIndex, field: FieldRef) {
        self.fields[idx.as_usize()].store(field.as_ptr(), Ordering::Relaxed);
    }

    pub fn num_resolved_methods(&self) -> usize {
        self.methods.len()
    }

    /// Visits every resolved class in this cache.
    pub fn visit_resolved_types(&self, mut visitor: impl FnMut(ClassRef)) {
        for slot in self.types.iter() {
            if let Some(ptr) = NonNull::new(slot.load(Ordering::Relaxed)) {
                visitor(ClassRef::from_raw(ptr));
            }
        }
    }
}

impl Debug for DexCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DexCache")
            .field("location", &self.dex.location())
            .finish()
    }
}

/// Identity handle to a [`DexCache`] in arena storage.
#[derive(Copy, Clone)]
pub struct DexCacheRef(NonNull<DexCache>);

unsafe impl Send for DexCacheRef {}
unsafe impl Sync for DexCacheRef {}

impl DexCacheRef {
    pub fn from_raw(ptr: NonNull<DexCache>) -> Self {
        DexCacheRef(ptr)
    }

    pub fn as_ptr(self) -> *mut DexCache {
        self.0.as_ptr()
    }
}

impl std::ops::Deref for DexCacheRef {
    type Target = DexCache;

    fn deref(&self) -> &DexCache {
        // Arena storage is live for the lifetime of the owning loader.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for DexCacheRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for DexCacheRef {}

impl Debug for DexCacheRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}
