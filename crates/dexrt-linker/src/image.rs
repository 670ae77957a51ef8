//! Ahead-of-time image binding.
//!
//! An image is the pre-linked boot class state produced by the compiler:
//! class roots, per-container caches, trampoline addresses, and the method
//! section. Adopting one replaces bootstrap - nothing is re-linked.
use crate::{entrypoints::TrampolineSet, ClassLinker, ClassRoots};
use dexrt_types::{ClassRef, DexCacheRef, EntryPoint, LinkError, LinkResult, MethodRef};

#[derive(Copy, Clone, Debug)]
pub struct ImageHeader {
    pub pointer_size: usize,
    pub trampolines: TrampolineSet,
}

/// An adopted image. In a full runtime this is a mapped file; the linker
/// only depends on this access shape.
pub struct AotImage {
    pub header: ImageHeader,
    /// `image_root(kClassRoots)`: the well-known classes in serialization
    /// order.
    pub class_roots: Vec<ClassRef>,
    /// `image_root(kDexCaches)`.
    pub dex_caches: Vec<DexCacheRef>,
    /// The image's class table section: every class linked into the image.
    pub class_table: Vec<ClassRef>,
    /// The methods section, iterable for entrypoint rewriting.
    pub methods: Vec<MethodRef>,
}

impl AotImage {
    /// Captures a bootstrapped linker's boot state in image shape; this is
    /// the image writer's output as the binder consumes it.
    pub fn capture(linker: &ClassLinker, trampolines: TrampolineSet) -> AotImage {
        let class_roots = linker
            .class_roots()
            .expect("capturing an image of an unbootstrapped linker")
            .to_vec();
        let dex_caches = linker.registered_dex_caches();
        let mut class_table = Vec::new();
        let mut methods = Vec::new();
        linker.visit_classes(&mut |class| {
            class_table.push(class);
            for method in class.direct_methods().iter().chain(class.virtual_methods()) {
                methods.push(MethodRef::from_ref(method));
            }
        });
        AotImage {
            header: ImageHeader {
                pointer_size: linker.config().image_pointer_size,
                trampolines,
            },
            class_roots,
            dex_caches,
            class_table,
            methods,
        }
    }

    /// Section membership probe used by the sanity sweep.
    pub fn contains_class(&self, class: ClassRef) -> bool {
        self.class_table.contains(&class) || self.class_roots.contains(&class)
    }
}

impl ClassLinker {
    /// Adopts a pre-linked image instead of bootstrapping.
    ///
    /// A pointer-size mismatch on an executing (non-compiler) runtime is
    /// fatal: nothing in the image can be used.
    pub fn init_from_image(&self, image: &AotImage, sanity_check: bool) -> LinkResult<()> {
        assert!(!self.init_done(), "linker already initialized");
        if !self.config().aot_compiler
            && image.header.pointer_size != self.config().image_pointer_size
        {
            panic!(
                "image pointer size {} does not match runtime pointer size {}",
                image.header.pointer_size,
                self.config().image_pointer_size
            );
        }

        let roots = ClassRoots::from_slice(&image.class_roots)
            .ok_or_else(|| LinkError::ClassFormat("malformed image class roots".into()))?;

        // Register every image container and adopt its cache. Image
        // storage is immortal.
        {
            let mut caches = self.dex_lock().write();
            for &cache in &image.dex_caches {
                if !caches.iter().any(|c| {
                    dexrt_utils::sync::Arc::ptr_eq(c.cache.dex_file(), cache.dex_file())
                }) {
                    caches.push(crate::RegisteredDex { cache, owner: None });
                }
            }
        }
        self.set_boot_class_path(
            image.dex_caches.iter().map(|c| c.dex_file().clone()).collect(),
        );

        // Move the image classes into the boot class table.
        {
            let mut registry = self.class_loaders().write();
            for &class in &image.class_table {
                registry.boot_table.insert(class);
            }
            for &cache in &image.dex_caches {
                cache.visit_resolved_types(|class| {
                    registry.boot_table.insert(class);
                });
            }
            for &root in &image.class_roots {
                registry.boot_table.insert(root);
            }
        }

        // Arrays keep sharing the itable the image linked them with.
        self.set_array_iftable(roots.class_array.iftable());
        self.set_class_roots(roots);
        self.set_trampolines(image.header.trampolines);

        if sanity_check {
            self.sanity_check_image(image)?;
        }

        // An interpret-only runtime never runs compiled code; every image
        // method falls back to the interpreter bridge.
        if self.config().interpret_only {
            for &method in &image.methods {
                method.set_entry_point(EntryPoint::InterpreterBridge);
            }
        }

        self.set_init_done();
        Ok(())
    }

    /// Object-graph sweep over the adopted state: every class reachable
    /// from the boot table must be resolved and belong to the image.
    fn sanity_check_image(&self, image: &AotImage) -> LinkResult<()> {
        let mut failure = None;
        self.visit_classes(&mut |class| {
            if failure.is_some() {
                return;
            }
            if !class.is_resolved() && !class.is_primitive() {
                failure = Some(format!("image class {} is not resolved", class.pretty()));
                return;
            }
            if !image.contains_class(class) {
                failure = Some(format!("class {} is not part of the image", class.pretty()));
            }
        });
        match failure {
            Some(message) => Err(LinkError::ClassFormat(message)),
            None => Ok(()),
        }
    }

    pub fn registered_dex_caches(&self) -> Vec<DexCacheRef> {
        self.dex_lock()
            .read()
            .iter()
            .filter(|c| c.is_live())
            .map(|c| c.cache)
            .collect()
    }
}
