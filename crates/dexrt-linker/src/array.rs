//! Array class synthesis.
//!
//! Array classes have no container entry; they are created on demand from
//! their descriptor. All of them share one global itable (Cloneable and
//! Serializable) and the root object's vtable.
use crate::{loaders::ClassLoader, stats::LinkerStats, ClassLinker};
use dexrt_types::{
    AccessFlags, Class, ClassFlags, ClassRef, ClassStatus, LinkError, LinkResult, LoaderId,
};
use dexrt_utils::sync::Arc;
use tracing::debug;

impl ClassLinker {
    /// Creates (or finds) the array class for `descriptor`, which must
    /// start with `[`.
    pub(crate) fn create_array_class(
        &self,
        descriptor: &str,
        hash: u32,
        loader: Option<&Arc<ClassLoader>>,
    ) -> LinkResult<ClassRef> {
        debug_assert!(descriptor.starts_with('['));
        let component_descriptor = &descriptor[1..];
        if component_descriptor == "V" {
            return Err(LinkError::ClassFormat("array of void".into()));
        }
        let component = self.find_class(component_descriptor, loader)?;

        // The array's owning loader is the component's loader, which may
        // sit higher in the delegation chain than the requester; the class
        // may therefore already exist even though the requester's lookup
        // missed.
        let array_loader = component.loader();
        if array_loader != loader.map(|l| l.id()).unwrap_or(LoaderId::BOOT) {
            if let Some(existing) = self.lookup_class(descriptor, hash, array_loader) {
                return Ok(existing);
            }
        }

        let roots = self.class_roots().expect("array synthesis before bootstrap");
        let object = roots.object;
        let alloc = self.alloc_for(array_loader);

        let class = Class::new(descriptor, array_loader);
        // Access is derived from the component, then forced abstract and
        // final with any interface bit stripped.
        let component_access = component.access_flags()
            & (AccessFlags::PUBLIC | AccessFlags::PRIVATE | AccessFlags::PROTECTED);
        class.set_access_flags(
            (component_access | AccessFlags::ABSTRACT | AccessFlags::FINAL)
                .difference(AccessFlags::INTERFACE),
        );
        let kind_flag = if component.is_primitive() {
            ClassFlags::PRIMITIVE_ARRAY
        } else {
            ClassFlags::OBJECT_ARRAY
        };
        class.add_class_flags(
            kind_flag | ClassFlags::NO_REFERENCE_FIELDS | ClassFlags::VARIABLE_SIZE,
        );
        let class = alloc.alloc_class(class);
        class.set_component_type(component);
        class.set_super_class(object);
        class.set_vtable(object.vtable());
        if let Some(imt) = object.imt() {
            class.set_imt(imt);
        }

        // Every array implements the same two fixed interfaces through the
        // globally shared itable.
        let array_iftable = self
            .array_iftable()
            .expect("array synthesis before the marker interfaces loaded")
            .clone();
        let interfaces: Vec<ClassRef> =
            array_iftable.entries.iter().map(|e| e.interface).collect();
        class.set_iftable(array_iftable);
        class.set_direct_interfaces_override(Arc::from(interfaces));

        class.set_status(ClassStatus::Resolved);
        class.set_status(ClassStatus::Initialized);

        if let Some(existing) = self.insert_class(class) {
            // Another thread synthesized the same array concurrently; the
            // abandoned class stays in the arena.
            return Ok(existing);
        }
        LinkerStats::bump(&self.stats().arrays_synthesized);
        debug!(class = descriptor, "synthesized array class");
        Ok(class)
    }
}
