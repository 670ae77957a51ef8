//! Bootstrap: hand-building the bottom of the type system.
//!
//! Before `find_class` can work, the self-referential core of the type
//! graph is constructed by hand: the class-class, the root object, the
//! array of classes, the primitive classes, the string, reference, and
//! dex-cache classes, and the primitive arrays. Each container-backed root
//! is then replayed through `find_system_class` to finalize its container
//! back-pointers; a replay that produces a different class is fatal.
use crate::{ClassLinker, ClassRoots};
use dexrt_dex::{DexFile, PrimitiveKind};
use dexrt_types::{
    AccessFlags, Class, ClassFlags, ClassRef, ClassStatus, IfTable, IfTableEntry, LinkError,
    LinkResult, LoaderId,
};
use dexrt_utils::sync::Arc;
use tracing::info;

const CLASS_DESCRIPTOR: &str = "Ljava/lang/Class;";
const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";
const STRING_DESCRIPTOR: &str = "Ljava/lang/String;";
const REFERENCE_DESCRIPTOR: &str = "Ljava/lang/ref/Reference;";
const DEX_CACHE_DESCRIPTOR: &str = "Ljava/lang/DexCache;";
const CLASS_ARRAY_DESCRIPTOR: &str = "[Ljava/lang/Class;";
const CLONEABLE_DESCRIPTOR: &str = "Ljava/lang/Cloneable;";
const SERIALIZABLE_DESCRIPTOR: &str = "Ljava/io/Serializable;";

const PRIMITIVE_KINDS: [PrimitiveKind; 9] = [
    PrimitiveKind::Boolean,
    PrimitiveKind::Byte,
    PrimitiveKind::Char,
    PrimitiveKind::Short,
    PrimitiveKind::Int,
    PrimitiveKind::Long,
    PrimitiveKind::Float,
    PrimitiveKind::Double,
    PrimitiveKind::Void,
];

const REFERENCE_KIND_DESCRIPTORS: [&str; 4] = [
    "Ljava/lang/ref/SoftReference;",
    "Ljava/lang/ref/WeakReference;",
    "Ljava/lang/ref/FinalizerReference;",
    "Ljava/lang/ref/PhantomReference;",
];

impl ClassLinker {
    /// Builds the runtime's type system from the boot class path alone.
    pub fn init_without_image(&self, boot_class_path: Vec<Arc<DexFile>>) -> LinkResult<()> {
        assert!(!self.init_done(), "linker already initialized");
        assert!(self.class_roots().is_none(), "bootstrap ran twice");
        self.set_boot_class_path(boot_class_path);
        let alloc = self.boot_alloc().clone();

        // Hand-built core. The class-class's own class is itself; that
        // self-reference is the reason lookup cannot be used yet.
        let object = alloc.alloc_class(Class::new(OBJECT_DESCRIPTOR, LoaderId::BOOT));
        let class_class = alloc.alloc_class(Class::new(CLASS_DESCRIPTOR, LoaderId::BOOT));
        class_class.set_super_class(object);
        let string = alloc.alloc_class(Class::new(STRING_DESCRIPTOR, LoaderId::BOOT));
        string.set_super_class(object);
        let reference = alloc.alloc_class(Class::new(REFERENCE_DESCRIPTOR, LoaderId::BOOT));
        reference.set_super_class(object);
        let dex_cache_class = alloc.alloc_class(Class::new(DEX_CACHE_DESCRIPTOR, LoaderId::BOOT));
        dex_cache_class.set_super_class(object);

        let mut primitives = [object; 9];
        for kind in PRIMITIVE_KINDS {
            let class = alloc.alloc_class(Class::new_primitive(kind));
            class.set_status(ClassStatus::Initialized);
            primitives[crate::primitive_root_index(kind)] = class;
            self.insert_class(class);
        }

        let class_array = self.alloc_boot_array(CLASS_ARRAY_DESCRIPTOR, class_class, false);
        let mut primitive_arrays = Vec::with_capacity(8);
        for kind in PRIMITIVE_KINDS {
            if kind == PrimitiveKind::Void {
                continue;
            }
            let descriptor = format!("[{}", kind.descriptor());
            let component = primitives[crate::primitive_root_index(kind)];
            primitive_arrays.push((descriptor, self.alloc_boot_array_component(component, true)));
        }

        self.set_class_roots(ClassRoots {
            object,
            class_class,
            string,
            reference,
            dex_cache_class,
            class_array,
            primitives,
        });

        // Register the hand-built, container-backed classes for replay.
        {
            let mut prealloc = self.boot_prealloc_map().lock();
            prealloc.insert(OBJECT_DESCRIPTOR.into(), object);
            prealloc.insert(CLASS_DESCRIPTOR.into(), class_class);
            prealloc.insert(STRING_DESCRIPTOR.into(), string);
            prealloc.insert(REFERENCE_DESCRIPTOR.into(), reference);
            prealloc.insert(DEX_CACHE_DESCRIPTOR.into(), dex_cache_class);
        }

        // Replay. Ordering is forced by the allocation dependencies: the
        // object root must link before anything that copies its vtable.
        for (descriptor, hand_built) in [
            (OBJECT_DESCRIPTOR, object),
            (CLASS_DESCRIPTOR, class_class),
            (STRING_DESCRIPTOR, string),
            (REFERENCE_DESCRIPTOR, reference),
            (DEX_CACHE_DESCRIPTOR, dex_cache_class),
        ] {
            let replayed = self.find_system_class(descriptor)?;
            if replayed != hand_built {
                panic!("bootstrap replay produced a different class for {descriptor}");
            }
        }

        // The marker interfaces every array implements, and the single
        // itable all arrays share.
        let cloneable = self.find_system_class(CLONEABLE_DESCRIPTOR)?;
        let serializable = self.find_system_class(SERIALIZABLE_DESCRIPTOR)?;
        if !cloneable.is_interface() || !serializable.is_interface() {
            return Err(LinkError::ClassFormat(
                "array marker types are not interfaces".into(),
            ));
        }
        self.set_array_iftable(Arc::new(IfTable {
            entries: vec![
                IfTableEntry { interface: cloneable, methods: Vec::new() },
                IfTableEntry { interface: serializable, methods: Vec::new() },
            ],
        }));

        // Finalize the hand-built arrays now that the object root is
        // linked, then replay them through lookup.
        let array_interfaces: Arc<[ClassRef]> = Arc::from(vec![cloneable, serializable]);
        let mut arrays: Vec<(String, ClassRef)> = vec![(CLASS_ARRAY_DESCRIPTOR.into(), class_array)];
        arrays.extend(primitive_arrays);
        for (descriptor, array) in arrays {
            array.set_super_class(self.class_roots().unwrap().object);
            array.set_vtable(object.vtable());
            if let Some(imt) = object.imt() {
                array.set_imt(imt);
            }
            array.set_iftable(self.array_iftable().unwrap().clone());
            array.set_direct_interfaces_override(array_interfaces.clone());
            array.set_status(ClassStatus::Resolved);
            array.set_status(ClassStatus::Initialized);
            let replayed = self.find_system_class(&descriptor)?;
            if replayed != array {
                panic!("bootstrap replay produced a different class for {descriptor}");
            }
        }

        self.finish_init()
    }

    fn alloc_boot_array(
        &self,
        descriptor: &str,
        component: ClassRef,
        primitive: bool,
    ) -> ClassRef {
        debug_assert!(descriptor.starts_with('['));
        let alloc = self.boot_alloc().clone();
        let class = Class::new(descriptor, LoaderId::BOOT);
        class.set_access_flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT | AccessFlags::FINAL);
        let kind = if primitive { ClassFlags::PRIMITIVE_ARRAY } else { ClassFlags::OBJECT_ARRAY };
        class.add_class_flags(kind | ClassFlags::NO_REFERENCE_FIELDS | ClassFlags::VARIABLE_SIZE);
        let class = alloc.alloc_class(class);
        class.set_component_type(component);
        self.insert_class(class);
        class
    }

    fn alloc_boot_array_component(&self, component: ClassRef, primitive: bool) -> ClassRef {
        let descriptor = format!("[{}", component.descriptor());
        self.alloc_boot_array(&descriptor, component, primitive)
    }

    /// Validates the reference root, loads the known reference kinds, and
    /// flips the runtime into the fully-bootstrapped state.
    fn finish_init(&self) -> LinkResult<()> {
        let roots = self.class_roots().unwrap().clone();

        // The reference root must carry the specially-treated referent
        // field; layout already excluded it from the scanned set.
        let has_referent = roots
            .reference
            .instance_fields()
            .iter()
            .any(|f| f.name() == "referent");
        if !has_referent {
            return Err(LinkError::ClassFormat(
                "reference root does not declare a referent field".into(),
            ));
        }

        // The reference kinds must load before subclassing the reference
        // root becomes forbidden.
        for descriptor in REFERENCE_KIND_DESCRIPTORS {
            let defined = self
                .boot_class_path()
                .iter()
                .any(|dex| dex.find_class_def(descriptor).is_some());
            if defined {
                self.find_system_class(descriptor)?;
            }
        }

        self.set_init_done();
        self.boot_prealloc_map().lock().clear();

        // Root class initializers run while the runtime is still single
        // threaded.
        for class in [
            roots.object,
            roots.class_class,
            roots.string,
            roots.reference,
            roots.dex_cache_class,
        ] {
            self.ensure_initialized(class, true, true)?;
        }
        info!(classes = self.boot_alloc().num_classes(), "bootstrap complete");
        Ok(())
    }
}
