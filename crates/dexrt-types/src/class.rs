use crate::{
    dex_cache::DexCacheRef,
    error::LinkError,
    field::ArtField,
    flags::{AccessFlags, ClassFlags},
    method::{ArtMethod, MethodRef},
    status::ClassStatus,
    storage::FieldStorage,
};
use dexrt_dex::{descriptor::modified_utf8_hash, DexFile, PrimitiveKind, Signature};
use dexrt_utils::{
    sync::{
        Arc, AtomicI8, AtomicPtr, AtomicU32, AtomicU64, Condvar, Mutex, MutexGuard, Ordering,
        RwLock,
    },
    ClassDefIndex,
};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// Identity of a class loader. Zero is the boot loader.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub u64);

impl LoaderId {
    pub const BOOT: LoaderId = LoaderId(0);

    pub fn is_boot(self) -> bool {
        self == LoaderId::BOOT
    }
}

/// Back-pointers into the defining container.
#[derive(Clone)]
pub struct ClassContainer {
    pub dex: Arc<DexFile>,
    pub class_def: ClassDefIndex,
    pub dex_cache: DexCacheRef,
}

/// One row of the interface dispatch table.
#[derive(Clone)]
pub struct IfTableEntry {
    pub interface: ClassRef,
    /// Parallel to the interface's virtual methods; filled during interface
    /// method linking, empty for marker interfaces.
    pub methods: Vec<MethodRef>,
}

/// Interface dispatch table. For any pair of interfaces `I extends J` in
/// the table, `J` precedes `I`.
#[derive(Clone, Default)]
pub struct IfTable {
    pub entries: Vec<IfTableEntry>,
}

impl IfTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn interface(&self, i: usize) -> ClassRef {
        self.entries[i].interface
    }

    pub fn contains(&self, interface: ClassRef) -> bool {
        self.entries.iter().any(|e| e.interface == interface)
    }
}

/// One slot of the fixed-size interface method table.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ImtEntry {
    Unimplemented,
    /// Hash collision between unrelated methods; dispatch falls back to a
    /// slow itable walk.
    Conflict,
    Method(MethodRef),
}

/// Per-class monitor: definition, verification, initialization, and
/// retirement all serialize on this, and blocked threads wait here.
///
/// Waits are uninterruptible by design; interruption is deferred to the
/// caller after the class is safe, never dropped mid-protocol.
pub struct ClassMonitor {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ClassMonitor {
    fn new() -> Self {
        ClassMonitor { lock: Mutex::new(()), cond: Condvar::new() }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn wait(&self, guard: &mut MutexGuard<'_, ()>) {
        self.cond.wait(guard);
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

/// A loaded type.
///
/// Created by the loader or one of the synthesis paths, mutated only by the
/// thread holding the class monitor while in a non-terminal status, and
/// immutable once it reaches `Initialized`, `Error`, or `Retired`. Lives in
/// per-loader arena storage and is referenced by identity ([`ClassRef`]).
pub struct Class {
    descriptor: Box<str>,
    hash: u32,
    loader: LoaderId,
    primitive: Option<PrimitiveKind>,

    status: AtomicI8,
    access_flags: AtomicU32,
    class_flags: AtomicU32,
    /// Id of the thread driving definition/initialization; meaningful while
    /// the status is non-terminal.
    clinit_thread_id: AtomicU64,

    super_class: AtomicPtr<Class>,
    component_type: AtomicPtr<Class>,

    object_size: AtomicU32,
    reference_instance_offsets: AtomicU32,
    num_reference_instance_fields: AtomicU32,
    num_reference_static_fields: AtomicU32,

    container: RwLock<Option<ClassContainer>>,

    ifields: RwLock<&'static [ArtField]>,
    sfields: RwLock<&'static [ArtField]>,
    direct_methods: RwLock<&'static [ArtMethod]>,
    virtual_methods: RwLock<&'static [ArtMethod]>,

    vtable: RwLock<Arc<[MethodRef]>>,
    iftable: RwLock<Arc<IfTable>>,
    imt: RwLock<Option<Arc<[ImtEntry]>>>,

    /// Directly-declared interfaces for classes without a container
    /// (arrays, proxies). Container-backed classes read theirs from the
    /// class def.
    direct_interfaces: RwLock<Option<Arc<[ClassRef]>>>,

    statics: RwLock<Option<FieldStorage>>,

    /// The stored failure, replayed on later accesses of an `Error` class.
    failure: RwLock<Option<LinkError>>,

    monitor: ClassMonitor,
}

impl Class {
    pub fn new(descriptor: &str, loader: LoaderId) -> Class {
        Class {
            hash: modified_utf8_hash(descriptor),
            descriptor: descriptor.into(),
            loader,
            primitive: None,
            status: AtomicI8::new(ClassStatus::NotReady.as_i8()),
            access_flags: AtomicU32::new(0),
            class_flags: AtomicU32::new(0),
            clinit_thread_id: AtomicU64::new(0),
            super_class: AtomicPtr::new(std::ptr::null_mut()),
            component_type: AtomicPtr::new(std::ptr::null_mut()),
            object_size: AtomicU32::new(0),
            reference_instance_offsets: AtomicU32::new(0),
            num_reference_instance_fields: AtomicU32::new(0),
            num_reference_static_fields: AtomicU32::new(0),
            container: RwLock::new(None),
            ifields: RwLock::new(&[]),
            sfields: RwLock::new(&[]),
            direct_methods: RwLock::new(&[]),
            virtual_methods: RwLock::new(&[]),
            vtable: RwLock::new(Arc::from(Vec::new())),
            iftable: RwLock::new(Arc::new(IfTable::default())),
            imt: RwLock::new(None),
            direct_interfaces: RwLock::new(None),
            statics: RwLock::new(None),
            failure: RwLock::new(None),
            monitor: ClassMonitor::new(),
        }
    }

    pub fn new_primitive(kind: PrimitiveKind) -> Class {
        let mut class = Class::new(kind.descriptor(), LoaderId::BOOT);
        class.primitive = Some(kind);
        class.access_flags = AtomicU32::new(
            (AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT).bits(),
        );
        class
    }

    pub fn self_ref(&self) -> ClassRef {
        ClassRef::from_raw(NonNull::from(self))
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    pub fn primitive_kind(&self) -> Option<PrimitiveKind> {
        self.primitive
    }

    pub fn pretty(&self) -> String {
        dexrt_dex::descriptor_to_dot(&self.descriptor)
    }

    // --- status machine ---

    pub fn status(&self) -> ClassStatus {
        ClassStatus::from_i8(self.status.load(Ordering::Acquire))
    }

    /// Transitions the status and wakes all monitor waiters.
    ///
    /// The caller must not hold the class monitor; the transition takes it
    /// briefly so waiters cannot miss the notification.
    pub fn set_status(&self, new: ClassStatus) {
        let _guard = self.monitor.lock();
        debug_assert!(
            new == ClassStatus::Error
                || new == ClassStatus::Retired
                || new >= self.status()
                // Runtime re-verification may soft-fail again.
                || (new == ClassStatus::RetryVerificationAtRuntime
                    && self.status() == ClassStatus::VerifyingAtRuntime),
            "non-monotonic status transition {:?} -> {:?} for {}",
            self.status(),
            new,
            self.descriptor
        );
        self.status.store(new.as_i8(), Ordering::Release);
        self.monitor.notify_all();
    }

    pub fn monitor(&self) -> &ClassMonitor {
        &self.monitor
    }

    /// Atomically claims the transition `Verified -> Initializing` for the
    /// given thread. Fails if any other transition happened first.
    pub fn try_begin_initializing(&self, thread_id: u64) -> bool {
        let _guard = self.monitor.lock();
        if ClassStatus::from_i8(self.status.load(Ordering::Acquire)) != ClassStatus::Verified {
            return false;
        }
        self.clinit_thread_id.store(thread_id, Ordering::Release);
        self.status
            .store(ClassStatus::Initializing.as_i8(), Ordering::Release);
        self.monitor.notify_all();
        true
    }

    pub fn is_erroneous(&self) -> bool {
        self.status() == ClassStatus::Error
    }

    pub fn is_retired(&self) -> bool {
        self.status() == ClassStatus::Retired
    }

    pub fn is_loaded(&self) -> bool {
        self.status() >= ClassStatus::Loaded
    }

    pub fn is_resolved(&self) -> bool {
        self.status() >= ClassStatus::Resolved
    }

    pub fn is_verified(&self) -> bool {
        self.status() >= ClassStatus::Verified
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ClassStatus::Initialized
    }

    pub fn clinit_thread_id(&self) -> u64 {
        self.clinit_thread_id.load(Ordering::Acquire)
    }

    pub fn set_clinit_thread_id(&self, tid: u64) {
        self.clinit_thread_id.store(tid, Ordering::Release);
    }

    // --- flags ---

    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_bits_retain(self.access_flags.load(Ordering::Relaxed))
    }

    pub fn set_access_flags(&self, flags: AccessFlags) {
        self.access_flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn class_flags(&self) -> ClassFlags {
        ClassFlags::from_bits_retain(self.class_flags.load(Ordering::Relaxed))
    }

    pub fn add_class_flags(&self, flags: ClassFlags) {
        self.class_flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags().contains(AccessFlags::INTERFACE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags().contains(AccessFlags::FINAL)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags().contains(AccessFlags::ABSTRACT)
    }

    pub fn is_public(&self) -> bool {
        self.access_flags().contains(AccessFlags::PUBLIC)
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive.is_some()
    }

    pub fn is_array(&self) -> bool {
        self.descriptor.starts_with('[')
    }

    pub fn is_temp(&self) -> bool {
        self.class_flags().contains(ClassFlags::TEMP)
    }

    pub fn is_proxy(&self) -> bool {
        self.class_flags().contains(ClassFlags::PROXY)
    }

    pub fn has_default_methods(&self) -> bool {
        self.class_flags().contains(ClassFlags::HAS_DEFAULT_METHODS)
    }

    pub fn is_variable_size(&self) -> bool {
        self.class_flags().contains(ClassFlags::VARIABLE_SIZE)
    }

    pub fn is_instantiable(&self) -> bool {
        !self.is_interface() && !self.is_abstract() && !self.is_primitive()
    }

    // --- hierarchy ---

    pub fn super_class(&self) -> Option<ClassRef> {
        NonNull::new(self.super_class.load(Ordering::Acquire)).map(ClassRef::from_raw)
    }

    pub fn set_super_class(&self, super_class: ClassRef) {
        self.super_class.store(super_class.as_ptr(), Ordering::Release);
    }

    pub fn component_type(&self) -> Option<ClassRef> {
        NonNull::new(self.component_type.load(Ordering::Acquire)).map(ClassRef::from_raw)
    }

    pub fn set_component_type(&self, component: ClassRef) {
        self.component_type.store(component.as_ptr(), Ordering::Release);
    }

    /// Walks `self` and its supers looking for `other`.
    pub fn is_subclass_of(&self, other: ClassRef) -> bool {
        let mut current = Some(self.self_ref());
        while let Some(c) = current {
            if c == other {
                return true;
            }
            current = c.super_class();
        }
        false
    }

    /// The assignability relation of the type system: identity, class
    /// subtyping, interface implementation, and array covariance.
    pub fn is_assignable_from(&self, src: ClassRef) -> bool {
        let dst = self.self_ref();
        if dst == src {
            return true;
        }
        if self.is_interface() {
            return src.implements(dst);
        }
        if self.is_array() {
            if !src.is_array() {
                return false;
            }
            let (Some(dst_comp), Some(src_comp)) = (self.component_type(), src.component_type())
            else {
                return false;
            };
            return dst_comp.is_assignable_from(src_comp);
        }
        src.is_subclass_of(dst)
    }

    /// Does `self` transitively implement `iface`? Requires `self`'s itable
    /// to be set up (any status >= the interface-table phase of linking).
    pub fn implements(&self, iface: ClassRef) -> bool {
        if self.is_interface() && self.self_ref() == iface {
            return true;
        }
        self.iftable().contains(iface)
    }

    // --- container back-pointers ---

    pub fn set_container(&self, container: ClassContainer) {
        *self.container.write() = Some(container);
    }

    pub fn dex_file(&self) -> Option<Arc<DexFile>> {
        self.container.read().as_ref().map(|c| c.dex.clone())
    }

    pub fn class_def_index(&self) -> Option<ClassDefIndex> {
        self.container.read().as_ref().map(|c| c.class_def)
    }

    pub fn dex_cache(&self) -> Option<DexCacheRef> {
        self.container.read().as_ref().map(|c| c.dex_cache)
    }

    // --- layout results ---

    pub fn object_size(&self) -> u32 {
        self.object_size.load(Ordering::Relaxed)
    }

    pub fn set_object_size(&self, size: u32) {
        self.object_size.store(size, Ordering::Relaxed);
    }

    pub fn reference_instance_offsets(&self) -> u32 {
        self.reference_instance_offsets.load(Ordering::Relaxed)
    }

    pub fn set_reference_instance_offsets(&self, offsets: u32) {
        self.reference_instance_offsets.store(offsets, Ordering::Relaxed);
    }

    pub fn num_reference_instance_fields(&self) -> u32 {
        self.num_reference_instance_fields.load(Ordering::Relaxed)
    }

    pub fn set_num_reference_instance_fields(&self, n: u32) {
        self.num_reference_instance_fields.store(n, Ordering::Relaxed);
    }

    pub fn num_reference_static_fields(&self) -> u32 {
        self.num_reference_static_fields.load(Ordering::Relaxed)
    }

    pub fn set_num_reference_static_fields(&self, n: u32) {
        self.num_reference_static_fields.store(n, Ordering::Relaxed);
    }

    // --- members ---

    pub fn instance_fields(&self) -> &'static [ArtField] {
        *self.ifields.read()
    }

    pub fn set_instance_fields(&self, fields: &'static [ArtField]) {
        *self.ifields.write() = fields;
    }

    pub fn static_fields(&self) -> &'static [ArtField] {
        *self.sfields.read()
    }

    pub fn set_static_fields(&self, fields: &'static [ArtField]) {
        *self.sfields.write() = fields;
    }

    pub fn direct_methods(&self) -> &'static [ArtMethod] {
        *self.direct_methods.read()
    }

    pub fn set_direct_methods(&self, methods: &'static [ArtMethod]) {
        *self.direct_methods.write() = methods;
    }

    pub fn virtual_methods(&self) -> &'static [ArtMethod] {
        *self.virtual_methods.read()
    }

    pub fn set_virtual_methods(&self, methods: &'static [ArtMethod]) {
        *self.virtual_methods.write() = methods;
    }

    pub fn vtable(&self) -> Arc<[MethodRef]> {
        self.vtable.read().clone()
    }

    pub fn vtable_len(&self) -> usize {
        self.vtable.read().len()
    }

    pub fn set_vtable(&self, vtable: Arc<[MethodRef]>) {
        *self.vtable.write() = vtable;
    }

    pub fn iftable(&self) -> Arc<IfTable> {
        self.iftable.read().clone()
    }

    pub fn iftable_len(&self) -> usize {
        self.iftable.read().len()
    }

    pub fn set_iftable(&self, iftable: Arc<IfTable>) {
        *self.iftable.write() = iftable;
    }

    pub fn direct_interfaces_override(&self) -> Option<Arc<[ClassRef]>> {
        self.direct_interfaces.read().clone()
    }

    pub fn set_direct_interfaces_override(&self, interfaces: Arc<[ClassRef]>) {
        *self.direct_interfaces.write() = Some(interfaces);
    }

    pub fn imt(&self) -> Option<Arc<[ImtEntry]>> {
        self.imt.read().clone()
    }

    pub fn set_imt(&self, imt: Arc<[ImtEntry]>) {
        debug_assert_eq!(imt.len(), crate::IMT_SIZE);
        *self.imt.write() = Some(imt);
    }

    // --- static storage ---

    pub fn prepare_statics(&self, size: usize) {
        *self.statics.write() = Some(FieldStorage::new(size));
    }

    pub fn statics(&self) -> dexrt_utils::sync::RwLockReadGuard<'_, Option<FieldStorage>> {
        self.statics.read()
    }

    pub fn statics_mut(&self) -> dexrt_utils::sync::RwLockWriteGuard<'_, Option<FieldStorage>> {
        self.statics.write()
    }

    // --- failure replay ---

    pub fn set_failure(&self, error: LinkError) {
        let mut failure = self.failure.write();
        // The first failure wins; later errors observe the stored one.
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    pub fn failure(&self) -> Option<LinkError> {
        self.failure.read().clone()
    }

    // --- member lookup ---

    pub fn find_declared_direct_method(&self, name: &str, sig: &Signature<'_>) -> Option<MethodRef> {
        self.direct_methods()
            .iter()
            .find(|m| m.name() == name && &m.signature() == sig)
            .map(MethodRef::from_ref)
    }

    pub fn find_declared_virtual_method(&self, name: &str, sig: &Signature<'_>) -> Option<MethodRef> {
        self.virtual_methods()
            .iter()
            .find(|m| m.name() == name && &m.signature() == sig)
            .map(MethodRef::from_ref)
    }

    pub fn find_direct_method(&self, name: &str, sig: &Signature<'_>) -> Option<MethodRef> {
        let mut current = Some(self.self_ref());
        while let Some(c) = current {
            if let Some(m) = c.find_declared_direct_method(name, sig) {
                return Some(m);
            }
            current = c.super_class();
        }
        None
    }

    pub fn find_virtual_method(&self, name: &str, sig: &Signature<'_>) -> Option<MethodRef> {
        let mut current = Some(self.self_ref());
        while let Some(c) = current {
            if let Some(m) = c.find_declared_virtual_method(name, sig) {
                return Some(m);
            }
            current = c.super_class();
        }
        None
    }

    /// Interface-kind lookup: declared methods, then super chain, then the
    /// transitive interface table.
    pub fn find_interface_method(&self, name: &str, sig: &Signature<'_>) -> Option<MethodRef> {
        if let Some(m) = self.find_virtual_method(name, sig) {
            return Some(m);
        }
        let iftable = self.iftable();
        for entry in iftable.entries.iter() {
            if let Some(m) = entry.interface.find_declared_virtual_method(name, sig) {
                return Some(m);
            }
        }
        None
    }

    pub fn find_declared_instance_field(&self, name: &str, type_descriptor: &str) -> Option<&ArtField> {
        self.instance_fields()
            .iter()
            .find(|f| f.name() == name && f.type_descriptor() == type_descriptor)
    }

    pub fn find_declared_static_field(&self, name: &str, type_descriptor: &str) -> Option<&ArtField> {
        self.static_fields()
            .iter()
            .find(|f| f.name() == name && f.type_descriptor() == type_descriptor)
    }

    pub fn find_instance_field(&self, name: &str, type_descriptor: &str) -> Option<&ArtField> {
        let mut current = Some(self.self_ref());
        while let Some(c) = current {
            if let Some(f) = c.get().find_declared_instance_field(name, type_descriptor) {
                return Some(f);
            }
            current = c.super_class();
        }
        None
    }

    /// Static fields may come from the class itself, its interfaces, or its
    /// supers, in that order.
    pub fn find_static_field(&self, name: &str, type_descriptor: &str) -> Option<&ArtField> {
        if let Some(f) = self.find_declared_static_field(name, type_descriptor) {
            return Some(f);
        }
        let iftable = self.iftable();
        for entry in iftable.entries.iter() {
            if let Some(f) = entry.interface.get().find_declared_static_field(name, type_descriptor)
            {
                return Some(f);
            }
        }
        let mut current = self.super_class();
        while let Some(c) = current {
            if let Some(f) = c.get().find_declared_static_field(name, type_descriptor) {
                return Some(f);
            }
            current = c.super_class();
        }
        None
    }

    pub fn find_class_initializer(&self) -> Option<MethodRef> {
        self.direct_methods()
            .iter()
            .find(|m| {
                m.is_static() && m.name() == "<clinit>" && m.signature().parameters.is_empty()
            })
            .map(MethodRef::from_ref)
    }

    // --- access checks ---

    fn package_of(descriptor: &str) -> &str {
        match descriptor.rfind('/') {
            Some(pos) => &descriptor[1..pos],
            None => "",
        }
    }

    pub fn is_in_same_package(&self, other: &Class) -> bool {
        self.loader == other.loader
            && Class::package_of(&self.descriptor) == Class::package_of(&other.descriptor)
    }

    pub fn can_access(&self, other: &Class) -> bool {
        other.is_public() || self.is_in_same_package(other)
    }

    pub fn can_access_member(&self, declaring: ClassRef, member_flags: AccessFlags) -> bool {
        if member_flags.is_public() {
            return true;
        }
        if member_flags.contains(AccessFlags::PRIVATE) {
            return declaring == self.self_ref();
        }
        if member_flags.contains(AccessFlags::PROTECTED) && self.is_subclass_of(declaring) {
            return true;
        }
        self.is_in_same_package(declaring.get())
    }
}

impl Debug for Class {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}]", self.descriptor, self.status())
    }
}

/// Identity handle to a [`Class`] in arena storage.
///
/// Classes form a cyclic graph (the class-class references itself), so
/// cross-references are raw arena pointers, never owning.
#[derive(Copy, Clone)]
pub struct ClassRef(NonNull<Class>);

unsafe impl Send for ClassRef {}
unsafe impl Sync for ClassRef {}

impl ClassRef {
    pub fn from_raw(ptr: NonNull<Class>) -> Self {
        ClassRef(ptr)
    }

    pub fn as_ptr(self) -> *mut Class {
        self.0.as_ptr()
    }

    pub fn get(self) -> &'static Class {
        // Arena storage is live for the lifetime of the owning loader.
        unsafe { &*self.0.as_ptr() }
    }
}

impl std::ops::Deref for ClassRef {
    type Target = Class;

    fn deref(&self) -> &Class {
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for ClassRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ClassRef {}

impl std::hash::Hash for ClassRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Debug for ClassRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}
