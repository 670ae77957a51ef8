//! Proxy class synthesis.
//!
//! A proxy class is built from a chosen name, an interface list, and the
//! method prototypes to forward. Its single constructor is copied from the
//! fixed proxy parent; every virtual method is a clone of a prototype
//! retargeted at the new class with the proxy-invoke entrypoint.
use crate::{loaders::ClassLoader, stats::LinkerStats, ClassLinker};
use dexrt_dex::DexFileBuilder;
use dexrt_types::{
    AccessFlags, ArtMethod, Class, ClassContainer, ClassFlags, ClassRef, ClassStatus, EntryPoint,
    LinkError, LinkResult, LoaderId, MethodRef,
};
use dexrt_utils::{sync::current_thread_id, sync::Arc, ClassDefIndex};
use tracing::debug;

pub(crate) const PROXY_PARENT_DESCRIPTOR: &str = "Ljava/lang/reflect/Proxy;";

impl ClassLinker {
    /// Synthesizes a proxy class implementing `interfaces`, forwarding the
    /// given method prototypes. `throws` is the per-method declared-throws
    /// matrix and must parallel `prototypes`.
    pub fn create_proxy_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
        interfaces: &[ClassRef],
        prototypes: &[MethodRef],
        throws: &[Vec<ClassRef>],
    ) -> LinkResult<ClassRef> {
        if throws.len() != prototypes.len() {
            return Err(LinkError::ClassFormat(format!(
                "proxy throws matrix has {} rows for {} methods",
                throws.len(),
                prototypes.len()
            )));
        }
        let parent = match self.proxy_parent_class() {
            Some(parent) => parent,
            None => {
                let parent = self.find_system_class(PROXY_PARENT_DESCRIPTOR)?;
                self.set_proxy_parent_class(parent);
                parent
            }
        };

        let loader_id = loader.map(|l| l.id()).unwrap_or(LoaderId::BOOT);
        let alloc = self.alloc_for(loader_id);

        // Proxies have no container entry of their own; a synthetic
        // single-class container carries the two static fields every proxy
        // gets: slot 0 the interface list, slot 1 the throws matrix.
        let mut builder = DexFileBuilder::new(format!("<proxy:{descriptor}>"));
        const PROXY_FIELD_FLAGS: u32 = 0x1A; // private static final
        builder
            .class(descriptor)
            .access_flags((AccessFlags::PUBLIC | AccessFlags::FINAL).bits())
            .static_field("interfaces", "[Ljava/lang/Class;", PROXY_FIELD_FLAGS)
            .static_field("throws", "[[Ljava/lang/Class;", PROXY_FIELD_FLAGS)
            .finish();
        let proxy_dex = builder.build();
        let dex_cache = self.register_dex_file(&proxy_dex, &alloc);
        let def_idx = ClassDefIndex::new(0);
        let def = proxy_dex.class_def(def_idx);

        let class = alloc.alloc_class(Class::new(descriptor, loader_id));
        class.set_access_flags(AccessFlags::PUBLIC | AccessFlags::FINAL);
        class.add_class_flags(ClassFlags::PROXY | ClassFlags::TEMP);
        class.set_container(ClassContainer {
            dex: proxy_dex.clone(),
            class_def: def_idx,
            dex_cache,
        });
        class.set_clinit_thread_id(current_thread_id());
        class.set_status(ClassStatus::Idx);
        class.set_super_class(parent);
        class.set_direct_interfaces_override(interfaces.iter().copied().collect());

        if self.insert_class(class).is_some() {
            return Err(LinkError::Linkage(format!(
                "proxy class {} already present",
                class.pretty()
            )));
        }

        // Static fields come from the synthetic container.
        let sfields: Vec<dexrt_types::ArtField> = def
            .class_data
            .static_fields
            .iter()
            .map(|f| dexrt_types::ArtField::new(proxy_dex.clone(), f.field_idx, f.access_flags))
            .collect();
        let sfields = alloc.alloc_fields(sfields);
        for field in sfields {
            field.set_declaring_class(class);
        }
        class.set_static_fields(sfields);

        // Exactly one direct method: the constructor, copied from the
        // proxy parent.
        let parent_constructor = parent
            .direct_methods()
            .iter()
            .find(|m| m.is_constructor() && !m.is_static())
            .ok_or_else(|| {
                LinkError::Linkage("proxy parent has no instance constructor".into())
            })?;
        let constructor = ArtMethod::copy_of(parent_constructor);
        constructor.clear_access_flags(AccessFlags::PROTECTED | AccessFlags::PRIVATE);
        constructor.add_access_flags(AccessFlags::PUBLIC);
        let direct = alloc.alloc_methods(vec![constructor]);
        for method in direct {
            method.set_declaring_class(class);
        }
        class.set_direct_methods(direct);

        // Virtual methods are prototype clones dispatching through the
        // proxy-invoke handler.
        let mut virtuals: Vec<ArtMethod> = Vec::with_capacity(prototypes.len());
        for &prototype in prototypes {
            let method = ArtMethod::copy_of(&prototype);
            method.clear_access_flags(
                AccessFlags::ABSTRACT | AccessFlags::DEFAULT | AccessFlags::PREVERIFIED,
            );
            method.add_access_flags(AccessFlags::FINAL);
            method.set_proxy_prototype(prototype);
            method.set_entry_point(EntryPoint::ProxyInvoke);
            virtuals.push(method);
        }
        let virtuals = alloc.alloc_methods(virtuals);
        for method in virtuals {
            method.set_declaring_class(class);
        }
        class.set_virtual_methods(virtuals);
        class.set_status(ClassStatus::Loaded);

        // The normal link pipeline runs next and swaps the temp class for
        // the final one in the table.
        let final_class = match self.link_class(class, Some(interfaces), &alloc) {
            Ok(final_class) => final_class,
            Err(error) => {
                class.set_failure(error.clone());
                class.set_status(ClassStatus::Error);
                return Err(error);
            }
        };
        debug_assert!(final_class.is_resolved());
        debug_assert!(class.is_retired());
        LinkerStats::bump(&self.stats().proxies_synthesized);
        debug!(class = descriptor, "synthesized proxy class");
        Ok(final_class)
    }
}
