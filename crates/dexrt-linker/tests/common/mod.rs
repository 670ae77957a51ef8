//! Shared fixtures: a minimal boot container and a bootstrapped linker.
#![allow(dead_code)]
use dexrt_dex::{DexFile, DexFileBuilder};
use dexrt_linker::{ClassLinker, RuntimeConfig};
use std::sync::Arc;

pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_PRIVATE: u32 = 0x0002;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_FINAL: u32 = 0x0010;
pub const ACC_INTERFACE: u32 = 0x0200;
pub const ACC_ABSTRACT: u32 = 0x0400;
pub const ACC_CONSTRUCTOR: u32 = 0x1_0000;

/// The boot container: just enough of the core library for bootstrap to
/// close the type graph.
pub fn core_dex() -> Arc<DexFile> {
    let mut b = DexFileBuilder::new("core.dex");
    b.class("Ljava/lang/Object;")
        .access_flags(ACC_PUBLIC)
        .direct_method("<init>", "V", &[], ACC_PUBLIC | ACC_CONSTRUCTOR)
        .virtual_method("equals", "Z", &["Ljava/lang/Object;"], ACC_PUBLIC)
        .virtual_method("hashCode", "I", &[], ACC_PUBLIC)
        .virtual_method("toString", "Ljava/lang/String;", &[], ACC_PUBLIC)
        .finish();
    b.class("Ljava/lang/Class;")
        .access_flags(ACC_PUBLIC | ACC_FINAL)
        .super_class("Ljava/lang/Object;")
        .instance_field("name", "Ljava/lang/String;", ACC_PRIVATE)
        .finish();
    b.class("Ljava/lang/String;")
        .access_flags(ACC_PUBLIC | ACC_FINAL)
        .super_class("Ljava/lang/Object;")
        .instance_field("count", "I", ACC_PRIVATE)
        .virtual_method("hashCode", "I", &[], ACC_PUBLIC)
        .virtual_method("length", "I", &[], ACC_PUBLIC)
        .finish();
    b.class("Ljava/lang/ref/Reference;")
        .access_flags(ACC_PUBLIC | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .instance_field("pendingNext", "Ljava/lang/ref/Reference;", 0)
        .instance_field("queue", "Ljava/lang/Object;", 0)
        .instance_field("queueNext", "Ljava/lang/ref/Reference;", 0)
        .instance_field("referent", "Ljava/lang/Object;", 0)
        .finish();
    b.class("Ljava/lang/DexCache;")
        .access_flags(ACC_PUBLIC | ACC_FINAL)
        .super_class("Ljava/lang/Object;")
        .finish();
    b.class("Ljava/lang/Cloneable;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .finish();
    b.class("Ljava/io/Serializable;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .finish();
    b.class("Ljava/lang/ref/SoftReference;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/ref/Reference;")
        .finish();
    b.class("Ljava/lang/ref/WeakReference;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/ref/Reference;")
        .finish();
    b.class("Ljava/lang/reflect/Proxy;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .direct_method(
            "<init>",
            "V",
            &["Ljava/lang/reflect/InvocationHandler;"],
            ACC_PUBLIC | ACC_CONSTRUCTOR,
        )
        .finish();
    b.build()
}

/// Routes linker traces to the test harness; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn boot_linker() -> ClassLinker {
    init_tracing();
    boot_linker_with(RuntimeConfig::default())
}

pub fn boot_linker_with(config: RuntimeConfig) -> ClassLinker {
    let linker = ClassLinker::with_defaults(config);
    linker
        .init_without_image(vec![core_dex()])
        .expect("bootstrap failed");
    linker
}
