//! Contracts with the surrounding runtime.
//!
//! The verifier, interpreter/JIT, and garbage collector are external
//! services; the linker reaches them through these traits. Policy that
//! affects linking (interpret-only mode, verification, AOT compilation) is
//! read once at construction.
use dexrt_types::{ClassRef, LinkError, MethodRef};

/// Outcome of verifying one class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyResult {
    NoFailure,
    /// Something could not be proven statically; verification must be
    /// re-attempted at runtime.
    SoftFailure,
    HardFailure,
}

pub trait Verifier: Send + Sync {
    fn verify_class(&self, class: ClassRef) -> VerifyResult;

    /// Probe for ahead-of-time verification results. `true` means the class
    /// was verified when its container was compiled and needs no work now.
    fn verify_using_image(&self, _class: ClassRef) -> bool {
        false
    }
}

/// Verifier that accepts everything. The runtime installs the real one.
pub struct AcceptingVerifier;

impl Verifier for AcceptingVerifier {
    fn verify_class(&self, _class: ClassRef) -> VerifyResult {
        VerifyResult::NoFailure
    }
}

/// Failure of an invoked class initializer.
#[derive(Debug, Clone)]
pub enum ClinitFailure {
    /// The initializer threw a non-Error exception; the initializer
    /// protocol wraps it.
    Exception(String),
    /// The initializer threw an Error-kind failure; it propagates
    /// unwrapped.
    Error(LinkError),
}

pub trait Interpreter: Send + Sync {
    /// Runs a class initializer to completion.
    fn invoke_clinit(&self, method: MethodRef) -> Result<(), ClinitFailure>;

    /// Compiled code address for a method, if the AOT image has one.
    fn get_quick_code(&self, _method: MethodRef) -> Option<usize> {
        None
    }
}

/// Interpreter stub that treats every initializer as a successful no-op.
pub struct NopInterpreter;

impl Interpreter for NopInterpreter {
    fn invoke_clinit(&self, _method: MethodRef) -> Result<(), ClinitFailure> {
        Ok(())
    }
}

pub trait GcHooks: Send + Sync {
    /// Card-marking notification after a reference-slot update inside an
    /// already-reachable class.
    fn write_barrier(&self, _class: ClassRef) {}
}

pub struct NopGcHooks;

impl GcHooks for NopGcHooks {}

/// Runtime policy captured at bootstrap.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Every method executes through the interpreter bridge.
    pub interpret_only: bool,
    /// This runtime is the AOT compiler, not an executing runtime.
    pub aot_compiler: bool,
    /// Run the verifier at all. Off means classes are trusted.
    pub verify: bool,
    /// Pointer width this runtime links for; must match an adopted image.
    pub image_pointer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            interpret_only: false,
            aot_compiler: false,
            verify: true,
            image_pointer_size: std::mem::size_of::<usize>(),
        }
    }
}
