//! Entrypoint policy.
//!
//! Each method's quick entrypoint is chosen at link time and revisited once
//! its class finishes initialization:
//!
//! | method shape              | AOT code | mode           | entrypoint            |
//! |---------------------------|----------|----------------|-----------------------|
//! | abstract                  | -        | -              | interpreter bridge    |
//! | native                    | no       | -              | generic native stub   |
//! | native                    | yes      | -              | AOT code              |
//! | static, non-constructor   | -        | before init    | resolution trampoline |
//! | any                       | -        | interpret-only | interpreter bridge    |
//! | normal                    | yes      | -              | AOT code              |
//! | normal                    | no       | -              | interpreter bridge    |
use crate::{hooks::Interpreter, hooks::RuntimeConfig, ClassLinker};
use dexrt_types::{ArtMethod, ClassRef, EntryPoint, MethodRef};
use tracing::debug;

/// Trampoline addresses carried by an AOT image header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrampolineSet {
    pub resolution: usize,
    pub imt_conflict: usize,
    pub generic_native: usize,
    pub to_interpreter: usize,
}

/// Must the method run through the interpreter bridge?
fn needs_interpreter(config: &RuntimeConfig, method: &ArtMethod, has_quick_code: bool) -> bool {
    if config.interpret_only {
        return true;
    }
    !has_quick_code && !method.is_native()
}

/// Chooses the quick entrypoint for a freshly loaded method.
pub(crate) fn link_code(
    config: &RuntimeConfig,
    interpreter: &dyn Interpreter,
    method: &ArtMethod,
    has_code_item: bool,
) {
    if config.aot_compiler {
        // The compiler never executes; entrypoints stay unset.
        return;
    }
    debug_assert_eq!(method.entry_point(), EntryPoint::None);

    let quick_code = if config.interpret_only {
        None
    } else {
        interpreter.get_quick_code(MethodRef::from_ref(method))
    };

    if method.is_abstract() {
        method.set_entry_point(EntryPoint::InterpreterBridge);
        return;
    }

    if method.is_static() && !method.is_constructor() {
        // Replaced by the real target once the class initializes; the
        // trampoline forces initialization on first call.
        method.set_entry_point(EntryPoint::ResolutionTrampoline);
        return;
    }

    if let Some(code) = quick_code {
        method.set_entry_point(EntryPoint::AotCode(code));
        return;
    }

    if method.is_native() {
        method.set_entry_point(EntryPoint::GenericNativeStub);
        return;
    }

    let _ = has_code_item;
    debug_assert!(needs_interpreter(config, method, quick_code.is_some()));
    method.set_entry_point(EntryPoint::InterpreterBridge);
}

impl ClassLinker {
    /// Re-runs the entrypoint policy for static methods after class
    /// initialization, replacing resolution trampolines with real targets.
    pub(crate) fn fixup_static_trampolines(&self, klass: ClassRef) {
        debug_assert!(klass.is_initialized());
        let direct = klass.direct_methods();
        if direct.is_empty() {
            return;
        }
        if self.config().aot_compiler {
            return;
        }
        for method in direct {
            if !method.is_static() || method.is_constructor() {
                continue;
            }
            let quick_code = if self.config().interpret_only {
                None
            } else {
                self.interpreter().get_quick_code(MethodRef::from_ref(method))
            };
            let entry = match quick_code {
                Some(code) => EntryPoint::AotCode(code),
                None if method.is_native() => EntryPoint::GenericNativeStub,
                None => EntryPoint::InterpreterBridge,
            };
            method.set_entry_point(entry);
        }
        debug!(class = %klass.pretty(), "static trampolines replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NopInterpreter;
    use dexrt_dex::DexFileBuilder;
    use dexrt_types::AccessFlags;
    use dexrt_utils::DexMethodIndex;
    use std::sync::Arc as StdArc;

    fn method_with_flags(flags: AccessFlags) -> ArtMethod {
        let mut builder = DexFileBuilder::new("ep.dex");
        builder.method("La/A;", "m", "V", &[]);
        let dex: StdArc<dexrt_dex::DexFile> = builder.build();
        ArtMethod::new(dex, DexMethodIndex::new(0), flags.bits())
    }

    struct CompiledEverything;
    impl Interpreter for CompiledEverything {
        fn invoke_clinit(&self, _m: MethodRef) -> Result<(), crate::hooks::ClinitFailure> {
            Ok(())
        }
        fn get_quick_code(&self, _m: MethodRef) -> Option<usize> {
            Some(0xC0DE)
        }
    }

    #[test]
    fn abstract_methods_enter_the_interpreter() {
        let config = RuntimeConfig::default();
        let m = method_with_flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT);
        link_code(&config, &NopInterpreter, &m, false);
        assert_eq!(m.entry_point(), EntryPoint::InterpreterBridge);
    }

    #[test]
    fn static_methods_start_on_the_resolution_trampoline() {
        let config = RuntimeConfig::default();
        let m = method_with_flags(AccessFlags::PUBLIC | AccessFlags::STATIC);
        link_code(&config, &CompiledEverything, &m, true);
        assert_eq!(m.entry_point(), EntryPoint::ResolutionTrampoline);
    }

    #[test]
    fn static_constructors_are_not_trampolined() {
        let config = RuntimeConfig::default();
        let m = method_with_flags(
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
        );
        link_code(&config, &CompiledEverything, &m, true);
        assert_eq!(m.entry_point(), EntryPoint::AotCode(0xC0DE));
    }

    #[test]
    fn native_methods_use_the_generic_stub_without_code() {
        let config = RuntimeConfig::default();
        let m = method_with_flags(AccessFlags::PUBLIC | AccessFlags::NATIVE);
        link_code(&config, &NopInterpreter, &m, false);
        assert_eq!(m.entry_point(), EntryPoint::GenericNativeStub);

        let compiled = method_with_flags(AccessFlags::PUBLIC | AccessFlags::NATIVE);
        link_code(&config, &CompiledEverything, &compiled, false);
        assert_eq!(compiled.entry_point(), EntryPoint::AotCode(0xC0DE));
    }

    #[test]
    fn interpret_only_forces_the_bridge() {
        let config = RuntimeConfig { interpret_only: true, ..RuntimeConfig::default() };
        let m = method_with_flags(AccessFlags::PUBLIC);
        link_code(&config, &CompiledEverything, &m, true);
        assert_eq!(m.entry_point(), EntryPoint::InterpreterBridge);
    }

    #[test]
    fn normal_methods_prefer_aot_code() {
        let config = RuntimeConfig::default();
        let m = method_with_flags(AccessFlags::PUBLIC);
        link_code(&config, &CompiledEverything, &m, true);
        assert_eq!(m.entry_point(), EntryPoint::AotCode(0xC0DE));

        let interpreted = method_with_flags(AccessFlags::PUBLIC);
        link_code(&config, &NopInterpreter, &interpreted, true);
        assert_eq!(interpreted.entry_point(), EntryPoint::InterpreterBridge);
    }
}
