use crate::{class::Class, class::ClassRef, flags::AccessFlags};
use dexrt_dex::{DexFile, Signature};
use dexrt_utils::{
    sync::{Arc, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering},
    DexMethodIndex,
};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// The dispatch kinds of a method invocation site.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InvokeKind {
    Direct,
    Static,
    Virtual,
    Interface,
    Super,
}

/// Where execution enters a method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    /// Not yet linked.
    None,
    /// Bridge into the interpreter.
    InterpreterBridge,
    /// Generic stub for native methods without compiled wrappers.
    GenericNativeStub,
    /// Trampoline that resolves (and possibly initializes) before the first
    /// real call; installed on static methods until class init completes.
    ResolutionTrampoline,
    /// Slow-path lookup through the itable on IMT collisions.
    ImtConflictTrampoline,
    /// Forwarding handler for proxy methods.
    ProxyInvoke,
    /// Ahead-of-time compiled code at an opaque address.
    AotCode(usize),
}

const EP_NONE: u8 = 0;
const EP_INTERPRETER: u8 = 1;
const EP_GENERIC_NATIVE: u8 = 2;
const EP_RESOLUTION: u8 = 3;
const EP_IMT_CONFLICT: u8 = 4;
const EP_PROXY: u8 = 5;
const EP_AOT: u8 = 6;

/// A method descriptor. Lives in per-loader arena storage; never freed
/// individually.
pub struct ArtMethod {
    /// Back-reference to the declaring class. Updated when a temp class is
    /// retired in favor of its final class.
    declaring_class: AtomicPtr<Class>,
    access_flags: AtomicU32,
    dex: Arc<DexFile>,
    dex_method_index: DexMethodIndex,
    /// Dispatch index: the vtable slot for virtual methods, the declaration
    /// order index for interface methods.
    method_index: AtomicU32,
    entrypoint_kind: AtomicU8,
    aot_code: AtomicUsize,
    /// For proxy methods, the interface method this was cloned from. Name
    /// and signature queries go through the prototype.
    proxy_prototype: AtomicPtr<ArtMethod>,
}

/// Dispatch index value meaning "not yet assigned".
pub const METHOD_INDEX_UNSET: u32 = u32::MAX;

impl ArtMethod {
    pub fn new(dex: Arc<DexFile>, dex_method_index: DexMethodIndex, access_flags: u32) -> Self {
        ArtMethod {
            declaring_class: AtomicPtr::new(std::ptr::null_mut()),
            access_flags: AtomicU32::new(access_flags),
            dex,
            dex_method_index,
            method_index: AtomicU32::new(METHOD_INDEX_UNSET),
            entrypoint_kind: AtomicU8::new(EP_NONE),
            aot_code: AtomicUsize::new(0),
            proxy_prototype: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Clone for synthesis and for relocation into a grown method array:
    /// container identity and dispatch state both carry over.
    pub fn copy_of(other: &ArtMethod) -> ArtMethod {
        let m = ArtMethod::new(
            other.dex.clone(),
            other.dex_method_index,
            other.access_flags.load(Ordering::Relaxed),
        );
        m.declaring_class
            .store(other.declaring_class.load(Ordering::Relaxed), Ordering::Relaxed);
        m.method_index
            .store(other.method_index.load(Ordering::Relaxed), Ordering::Relaxed);
        m.entrypoint_kind
            .store(other.entrypoint_kind.load(Ordering::Relaxed), Ordering::Relaxed);
        m.aot_code.store(other.aot_code.load(Ordering::Relaxed), Ordering::Relaxed);
        m.proxy_prototype
            .store(other.proxy_prototype.load(Ordering::Relaxed), Ordering::Relaxed);
        m
    }

    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex
    }

    pub fn dex_method_index(&self) -> DexMethodIndex {
        self.dex_method_index
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

    pub fn add_access_flags(&self, flags: AccessFlags) {
        self.access_flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_access_flags(&self, flags: AccessFlags) {
        self.access_flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub fn is_static(&self) -> bool {
        self.access_flags().contains(AccessFlags::STATIC)
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags().contains(AccessFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.access_flags().contains(AccessFlags::NATIVE)
    }

    pub fn is_final(&self) -> bool {
        self.access_flags().contains(AccessFlags::FINAL)
    }

    pub fn is_public(&self) -> bool {
        self.access_flags().contains(AccessFlags::PUBLIC)
    }

    pub fn is_private(&self) -> bool {
        self.access_flags().contains(AccessFlags::PRIVATE)
    }

    pub fn is_constructor(&self) -> bool {
        self.access_flags().contains(AccessFlags::CONSTRUCTOR)
    }

    pub fn is_miranda(&self) -> bool {
        self.access_flags().contains(AccessFlags::MIRANDA)
    }

    pub fn is_default(&self) -> bool {
        self.access_flags().contains(AccessFlags::DEFAULT)
    }

    pub fn is_default_conflicting(&self) -> bool {
        self.access_flags().contains(AccessFlags::DEFAULT_CONFLICT)
    }

    pub fn is_preverified(&self) -> bool {
        self.access_flags().contains(AccessFlags::PREVERIFIED)
    }

    /// A vtable slot holding a default or miranda method may be replaced by
    /// a better default implementation from a subclass's interfaces.
    pub fn is_overridable_by_default_method(&self) -> bool {
        self.is_default() || self.is_miranda() || self.is_default_conflicting()
    }

    pub fn method_index(&self) -> u32 {
        self.method_index.load(Ordering::Relaxed)
    }

    pub fn set_method_index(&self, index: u32) {
        self.method_index.store(index, Ordering::Relaxed);
    }

    pub fn proxy_prototype(&self) -> Option<&ArtMethod> {
        let ptr = self.proxy_prototype.load(Ordering::Acquire);
        // Prototype methods live in arena storage with loader lifetime.
        unsafe { ptr.as_ref() }
    }

    pub fn set_proxy_prototype(&self, prototype: MethodRef) {
        self.proxy_prototype.store(prototype.as_ptr(), Ordering::Release);
    }

    /// The method used for name/signature queries: the proxy prototype for
    /// proxy methods, the method itself otherwise.
    pub fn interface_method_if_proxy(&self) -> &ArtMethod {
        self.proxy_prototype().unwrap_or(self)
    }

    pub fn name(&self) -> &str {
        let m = self.interface_method_if_proxy();
        m.dex.method_name(m.dex_method_index)
    }

    pub fn signature(&self) -> Signature<'_> {
        let m = self.interface_method_if_proxy();
        m.dex.method_signature(m.dex_method_index)
    }

    pub fn pretty(&self) -> String {
        let m = self.interface_method_if_proxy();
        m.dex.pretty_method(m.dex_method_index)
    }

    pub fn entry_point(&self) -> EntryPoint {
        match self.entrypoint_kind.load(Ordering::Acquire) {
            EP_NONE => EntryPoint::None,
            EP_INTERPRETER => EntryPoint::InterpreterBridge,
            EP_GENERIC_NATIVE => EntryPoint::GenericNativeStub,
            EP_RESOLUTION => EntryPoint::ResolutionTrampoline,
            EP_IMT_CONFLICT => EntryPoint::ImtConflictTrampoline,
            EP_PROXY => EntryPoint::ProxyInvoke,
            EP_AOT => EntryPoint::AotCode(self.aot_code.load(Ordering::Acquire)),
            other => unreachable!("invalid entrypoint kind {other}"),
        }
    }

    pub fn set_entry_point(&self, entry: EntryPoint) {
        let kind = match entry {
            EntryPoint::None => EP_NONE,
            EntryPoint::InterpreterBridge => EP_INTERPRETER,
            EntryPoint::GenericNativeStub => EP_GENERIC_NATIVE,
            EntryPoint::ResolutionTrampoline => EP_RESOLUTION,
            EntryPoint::ImtConflictTrampoline => EP_IMT_CONFLICT,
            EntryPoint::ProxyInvoke => EP_PROXY,
            EntryPoint::AotCode(addr) => {
                self.aot_code.store(addr, Ordering::Release);
                EP_AOT
            }
        };
        self.entrypoint_kind.store(kind, Ordering::Release);
    }

    /// Raises an incompatible-class-change error if this method's shape does
    /// not match the invoke kind used at the call site.
    pub fn matches_invoke_kind(&self, kind: InvokeKind) -> bool {
        match kind {
            InvokeKind::Static => self.is_static(),
            InvokeKind::Direct => !self.is_static(),
            InvokeKind::Virtual | InvokeKind::Super | InvokeKind::Interface => !self.is_static(),
        }
    }
}

impl Debug for ArtMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pretty())
    }
}

/// Identity handle to an [`ArtMethod`] in arena storage.
#[derive(Copy, Clone)]
pub struct MethodRef(NonNull<ArtMethod>);

unsafe impl Send for MethodRef {}
unsafe impl Sync for MethodRef {}

impl MethodRef {
    pub fn from_raw(ptr: NonNull<ArtMethod>) -> Self {
        MethodRef(ptr)
    }

    pub fn from_ref(method: &ArtMethod) -> Self {
        MethodRef(NonNull::from(method))
    }

    pub fn as_ptr(self) -> *mut ArtMethod {
        self.0.as_ptr()
    }
}

impl std::ops::Deref for MethodRef {
    type Target = ArtMethod;

    fn deref(&self) -> &ArtMethod {
        // Arena storage is live for the lifetime of the owning loader.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MethodRef {}

impl std::hash::Hash for MethodRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Debug for MethodRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}
