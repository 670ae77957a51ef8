//! Verification gating and resolution error discipline.
mod common;

use common::*;
use dexrt_dex::DexFileBuilder;
use dexrt_linker::{
    ClassLinker, NopGcHooks, NopInterpreter, RuntimeConfig, Verifier, VerifyResult,
};
use dexrt_types::{ClassRef, ClassStatus, InvokeKind, LinkError};

/// Applies a fixed verdict to application classes; boot classes pass.
struct FixedVerifier(VerifyResult);

impl Verifier for FixedVerifier {
    fn verify_class(&self, class: ClassRef) -> VerifyResult {
        if class.descriptor().starts_with("La/") {
            self.0
        } else {
            VerifyResult::NoFailure
        }
    }
}

struct ImagePreverified;

impl Verifier for ImagePreverified {
    fn verify_class(&self, _class: ClassRef) -> VerifyResult {
        panic!("image-preverified classes must not be verified again");
    }

    fn verify_using_image(&self, _class: ClassRef) -> bool {
        true
    }
}

fn linker_with_verifier(config: RuntimeConfig, verifier: Box<dyn Verifier>) -> ClassLinker {
    let linker = ClassLinker::new(
        config,
        verifier,
        Box::new(NopInterpreter),
        Box::new(NopGcHooks),
    );
    linker
        .init_without_image(vec![core_dex()])
        .expect("bootstrap failed");
    linker
}

fn simple_app_dex() -> std::sync::Arc<dexrt_dex::DexFile> {
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    b.build()
}

#[test]
fn hard_verification_failure_poisons_the_class() {
    let linker = linker_with_verifier(
        RuntimeConfig::default(),
        Box::new(FixedVerifier(VerifyResult::HardFailure)),
    );
    let app = linker.create_class_loader(None, vec![simple_app_dex()]);
    let class = linker.find_class("La/C;", Some(&app)).unwrap();

    let err = linker.ensure_initialized(class, true, true).unwrap_err();
    assert!(matches!(err, LinkError::Verify { ref descriptor, .. } if descriptor == "La/C;"));
    assert_eq!(class.status(), ClassStatus::Error);

    // The stored failure replays on the next attempt.
    let replay = linker.ensure_initialized(class, true, true).unwrap_err();
    assert_eq!(err, replay);
}

#[test]
fn soft_failure_at_runtime_still_initializes() {
    let linker = linker_with_verifier(
        RuntimeConfig::default(),
        Box::new(FixedVerifier(VerifyResult::SoftFailure)),
    );
    let app = linker.create_class_loader(None, vec![simple_app_dex()]);
    let class = linker.find_class("La/C;", Some(&app)).unwrap();

    assert!(linker.ensure_initialized(class, true, true).unwrap());
    assert_eq!(class.status(), ClassStatus::Initialized);
    // Soft-failed classes run without the verified fast paths.
    assert!(!class.virtual_methods()[0].is_preverified());
}

#[test]
fn soft_failure_at_compile_time_retries_at_runtime() {
    let linker = linker_with_verifier(
        RuntimeConfig { aot_compiler: true, ..RuntimeConfig::default() },
        Box::new(FixedVerifier(VerifyResult::SoftFailure)),
    );
    let app = linker.create_class_loader(None, vec![simple_app_dex()]);
    let class = linker.find_class("La/C;", Some(&app)).unwrap();

    // Initialization declines without error.
    assert!(!linker.ensure_initialized(class, true, true).unwrap());
    assert_eq!(class.status(), ClassStatus::RetryVerificationAtRuntime);
}

#[test]
fn passing_verification_marks_methods_preverified() {
    let linker = boot_linker();
    let app = linker.create_class_loader(None, vec![simple_app_dex()]);
    let class = linker.find_class("La/C;", Some(&app)).unwrap();
    assert!(linker.ensure_initialized(class, true, true).unwrap());
    assert!(class.virtual_methods()[0].is_preverified());
}

#[test]
fn image_preverified_classes_skip_the_verifier() {
    let linker = linker_with_verifier(
        RuntimeConfig::default(),
        Box::new(ImagePreverified),
    );
    let app = linker.create_class_loader(None, vec![simple_app_dex()]);
    let class = linker.find_class("La/C;", Some(&app)).unwrap();
    assert!(linker.ensure_initialized(class, true, true).unwrap());
    assert!(class.virtual_methods()[0].is_preverified());
}

#[test]
fn circular_hierarchies_are_rejected() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/A;").access_flags(ACC_PUBLIC).super_class("La/B;").finish();
    b.class("La/B;").access_flags(ACC_PUBLIC).super_class("La/A;").finish();
    let app = linker.create_class_loader(None, vec![b.build()]);

    let first = linker.find_class("La/A;", Some(&app)).unwrap_err();
    assert!(matches!(first, LinkError::NoClassDefFound { .. }));

    // The stored cause on the cycle entry is the circularity itself.
    let second = linker.find_class("La/A;", Some(&app)).unwrap_err();
    assert!(matches!(second, LinkError::ClassCircularity(_)));
}

#[test]
fn field_resolution_distinguishes_staticness() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    let static_idx = b.field("La/C;", "I", "s");
    let instance_idx = b.field("La/C;", "I", "x");
    let secret_idx = b.field("La/Other;", "I", "secret");
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .static_field("s", "I", ACC_PUBLIC | ACC_STATIC)
        .instance_field("x", "I", ACC_PUBLIC)
        .finish();
    b.class("Lb/Other;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .finish();
    b.class("La/Other;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .instance_field("secret", "I", ACC_PRIVATE)
        .finish();
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    let outsider = linker.find_class("Lb/Other;", Some(&app)).unwrap();
    linker.find_class("La/Other;", Some(&app)).unwrap();
    let dex_cache = linker.find_dex_cache(&dex).unwrap();

    let s = linker
        .resolve_field(dex_cache, static_idx, app.id(), Some(c), true)
        .unwrap();
    assert!(s.is_static());
    let x = linker
        .resolve_field(dex_cache, instance_idx, app.id(), Some(c), false)
        .unwrap();
    assert!(!x.is_static());

    // Accessing with the wrong staticness is an incompatible change.
    assert!(matches!(
        linker.resolve_field(dex_cache, instance_idx, app.id(), Some(c), true),
        Err(LinkError::IncompatibleClassChange(_))
    ));

    // Private members of an unrelated class are inaccessible.
    assert!(matches!(
        linker.resolve_field(dex_cache, secret_idx, app.id(), Some(outsider), false),
        Err(LinkError::IllegalAccess(_))
    ));
}

#[test]
fn interface_invokes_require_interfaces() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    let m_idx = b.method("La/C;", "m", "I", &[]);
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    let dex_cache = linker.find_dex_cache(&dex).unwrap();

    assert!(matches!(
        linker.resolve_method(dex_cache, m_idx, app.id(), Some(c), InvokeKind::Interface),
        Err(LinkError::IncompatibleClassChange(_))
    ));
    assert!(linker
        .resolve_method(dex_cache, m_idx, app.id(), Some(c), InvokeKind::Virtual)
        .is_ok());
}
