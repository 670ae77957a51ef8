use crate::{class::Class, class::ClassRef, flags::AccessFlags};
use dexrt_dex::{descriptor::is_reference_descriptor, DexFile, PrimitiveKind};
use dexrt_utils::{
    sync::{Arc, AtomicPtr, AtomicU32, Ordering},
    DexFieldIndex,
};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// Offset value meaning "not yet laid out".
pub const FIELD_OFFSET_UNSET: u32 = u32::MAX;

/// A field descriptor. Lives in per-loader arena storage; never freed
/// individually.
pub struct ArtField {
    /// Back-reference to the declaring class. Updated when a temp class is
    /// retired in favor of its final class.
    declaring_class: AtomicPtr<Class>,
    access_flags: AtomicU32,
    dex: Arc<DexFile>,
    dex_field_index: DexFieldIndex,
    /// Byte offset of the field within instance data or the static area.
    offset: AtomicU32,
}

impl ArtField {
    pub fn new(dex: Arc<DexFile>, dex_field_index: DexFieldIndex, access_flags: u32) -> Self {
        ArtField {
            declaring_class: AtomicPtr::new(std::ptr::null_mut()),
            access_flags: AtomicU32::new(access_flags),
            dex,
            dex_field_index,
            offset: AtomicU32::new(FIELD_OFFSET_UNSET),
        }
    }

    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex
    }

    pub fn dex_field_index(&self) -> DexFieldIndex {
        self.dex_field_index
    }

    pub fn declaring_class(&self) -> Option<ClassRef> {
        NonNull::new(self.declaring_class.load(Ordering::Acquire)).map(ClassRef::from_raw)
    }

    pub fn set_declaring_class(&self, class: ClassRef) {
        self.declaring_class.store(class.as_ptr(), Ordering::Release);
    }

    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_bits_retain(self.access_flags.load(Ordering::Relaxed))
    }

    pub fn is_static(&self) -> bool {
        self.access_flags().contains(AccessFlags::STATIC)
    }

    pub fn is_volatile(&self) -> bool {
        self.access_flags().contains(AccessFlags::VOLATILE)
    }

    pub fn name(&self) -> &str {
        self.dex.field_name(self.dex_field_index)
    }

    pub fn type_descriptor(&self) -> &str {
        self.dex.field_type_descriptor(self.dex_field_index)
    }

    pub fn is_reference(&self) -> bool {
        is_reference_descriptor(self.type_descriptor())
    }

    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        dexrt_dex::descriptor::primitive_kind(self.type_descriptor())
    }

    /// Storage size in bytes: primitive size or the heap-reference size.
    pub fn size(&self) -> usize {
        match self.primitive_kind() {
            Some(kind) => kind.size(),
            None => crate::HEAP_REFERENCE_SIZE,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset: u32) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

impl Debug for ArtField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_descriptor(), self.name())
    }
}

/// Identity handle to an [`ArtField`] in arena storage.
#[derive(Copy, Clone)]
pub struct FieldRef(NonNull<ArtField>);

unsafe impl Send for FieldRef {}
unsafe impl Sync for FieldRef {}

impl FieldRef {
    pub fn from_raw(ptr: NonNull<ArtField>) -> Self {
        FieldRef(ptr)
    }

    pub fn as_ptr(self) -> *mut ArtField {
        self.0.as_ptr()
    }
}

impl std::ops::Deref for FieldRef {
    type Target = ArtField;

    fn deref(&self) -> &ArtField {
        // Arena storage is live for the lifetime of the owning loader.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for FieldRef {}

impl std::hash::Hash for FieldRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Debug for FieldRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}
