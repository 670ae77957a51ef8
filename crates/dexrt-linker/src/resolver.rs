//! Index-based resolution: the cache-front for strings, types, methods,
//! and fields during execution.
//!
//! Every operation probes the container's resolution cache first, delegates
//! to class lookup on a miss, and back-fills the cache. Racing resolvers of
//! the same index produce the identical entity, so cache writes commute.
use crate::{stats::LinkerStats, ClassLinker};
use dexrt_types::{
    ClassRef, DexCacheRef, FieldRef, InvokeKind, LinkError, LinkResult, LoaderId, MethodRef,
};
use dexrt_utils::{DexFieldIndex, DexMethodIndex, StringIndex, TypeIndex};

impl ClassLinker {
    /// Resolves a string constant, interning it on first use.
    pub fn resolve_string(&self, dex_cache: DexCacheRef, idx: StringIndex) -> LinkResult<&'static str> {
        if let Some(resolved) = dex_cache.resolved_string(idx) {
            return Ok(resolved);
        }
        let raw = dex_cache
            .dex_file()
            .get_string(idx)
            .map_err(|e| LinkError::ClassFormat(e.to_string()))?;
        let interned = self.intern_string(raw);
        dex_cache.set_resolved_string(idx, interned);
        Ok(interned)
    }

    /// Resolves a type index against a loader. A missing class is promoted
    /// to no-class-def-found, wrapping the original failure as the cause.
    pub fn resolve_type(
        &self,
        dex_cache: DexCacheRef,
        idx: TypeIndex,
        loader: LoaderId,
    ) -> LinkResult<ClassRef> {
        if let Some(resolved) = dex_cache.resolved_type(idx) {
            LinkerStats::bump(&self.stats().type_cache_hits);
            return Ok(resolved);
        }
        LinkerStats::bump(&self.stats().type_cache_misses);
        let descriptor = dex_cache
            .dex_file()
            .get_type_descriptor(idx)
            .map_err(|e| LinkError::ClassFormat(e.to_string()))?
            .to_string();
        let loader_handle = self.loader_handle(loader);
        let resolved = self
            .find_class(&descriptor, loader_handle.as_ref())
            .map_err(|error| {
                let already_wrapped = matches!(
                    &error,
                    LinkError::NoClassDefFound { descriptor: d, .. } if *d == descriptor
                );
                if already_wrapped {
                    error
                } else {
                    LinkError::no_class_def_caused(descriptor.clone(), error)
                }
            })?;
        dex_cache.set_resolved_type(idx, resolved);
        Ok(resolved)
    }

    /// Resolves a method reference for an invoke of the given kind,
    /// enforcing the incompatible-class-change discipline.
    pub fn resolve_method(
        &self,
        dex_cache: DexCacheRef,
        idx: DexMethodIndex,
        loader: LoaderId,
        referrer: Option<ClassRef>,
        invoke_kind: InvokeKind,
    ) -> LinkResult<MethodRef> {
        if let Some(resolved) = dex_cache.resolved_method(idx) {
            LinkerStats::bump(&self.stats().method_cache_hits);
            self.check_invoke_kind(resolved, invoke_kind)?;
            return Ok(resolved);
        }
        LinkerStats::bump(&self.stats().method_cache_misses);

        let dex = dex_cache.dex_file().clone();
        let method_id = dex
            .get_method_id(idx)
            .map_err(|e| LinkError::ClassFormat(e.to_string()))?;
        let klass = self.resolve_type(dex_cache, method_id.class_idx, loader)?;
        if klass.is_erroneous() {
            return Err(self.earlier_failure(klass));
        }

        let name = dex.method_name(idx);
        let signature = dex.method_signature(idx);
        let resolved = match invoke_kind {
            InvokeKind::Direct | InvokeKind::Static => klass.find_direct_method(name, &signature),
            InvokeKind::Virtual | InvokeKind::Super => {
                if klass.is_interface() {
                    return Err(LinkError::IncompatibleClassChange(format!(
                        "virtual invoke of interface method {}",
                        dex.pretty_method(idx)
                    )));
                }
                klass.find_virtual_method(name, &signature)
            }
            InvokeKind::Interface => {
                if !klass.is_interface() {
                    return Err(LinkError::IncompatibleClassChange(format!(
                        "interface invoke of class method {}",
                        dex.pretty_method(idx)
                    )));
                }
                klass.find_interface_method(name, &signature)
            }
        };
        let resolved = resolved.ok_or_else(|| {
            LinkError::Linkage(format!("no such method {}", dex.pretty_method(idx)))
        })?;

        self.check_invoke_kind(resolved, invoke_kind)?;
        if let Some(referrer) = referrer {
            let declaring = resolved.declaring_class().unwrap();
            if !referrer.get().can_access_member(declaring, resolved.access_flags()) {
                return Err(LinkError::IllegalAccess(format!(
                    "method {} is not accessible from {}",
                    resolved.pretty(),
                    referrer.pretty()
                )));
            }
        }

        dex_cache.set_resolved_method(idx, resolved);
        Ok(resolved)
    }

    fn check_invoke_kind(&self, method: MethodRef, invoke_kind: InvokeKind) -> LinkResult<()> {
        if !method.matches_invoke_kind(invoke_kind) {
            return Err(LinkError::IncompatibleClassChange(format!(
                "{} invoked as {:?}",
                method.pretty(),
                invoke_kind
            )));
        }
        Ok(())
    }

    /// Resolves a field reference, distinguishing static from instance
    /// access.
    pub fn resolve_field(
        &self,
        dex_cache: DexCacheRef,
        idx: DexFieldIndex,
        loader: LoaderId,
        referrer: Option<ClassRef>,
        is_static: bool,
    ) -> LinkResult<FieldRef> {
        if let Some(resolved) = dex_cache.resolved_field(idx) {
            LinkerStats::bump(&self.stats().field_cache_hits);
            if resolved.is_static() != is_static {
                return Err(LinkError::IncompatibleClassChange(format!(
                    "field {} accessed with wrong staticness",
                    resolved.name()
                )));
            }
            return Ok(resolved);
        }
        LinkerStats::bump(&self.stats().field_cache_misses);

        let dex = dex_cache.dex_file().clone();
        let field_id = dex
            .get_field_id(idx)
            .map_err(|e| LinkError::ClassFormat(e.to_string()))?;
        let klass = self.resolve_type(dex_cache, field_id.class_idx, loader)?;
        if klass.is_erroneous() {
            return Err(self.earlier_failure(klass));
        }

        let name = dex.field_name(idx);
        let type_descriptor = dex.field_type_descriptor(idx);
        let resolved = if is_static {
            klass.get().find_static_field(name, type_descriptor)
        } else {
            klass.get().find_instance_field(name, type_descriptor)
        };
        // A field found with the opposite staticness is an incompatible
        // class change, not a missing field.
        let resolved = match resolved {
            Some(field) => field,
            None => {
                let other = if is_static {
                    klass.get().find_instance_field(name, type_descriptor)
                } else {
                    klass.get().find_static_field(name, type_descriptor)
                };
                return Err(match other {
                    Some(_) => LinkError::IncompatibleClassChange(format!(
                        "field {}.{} accessed with wrong staticness",
                        klass.pretty(),
                        name
                    )),
                    None => LinkError::Linkage(format!(
                        "no such field {}.{}: {}",
                        klass.pretty(),
                        name,
                        type_descriptor
                    )),
                });
            }
        };

        if let Some(referrer) = referrer {
            let declaring = resolved.declaring_class().unwrap();
            if !referrer.get().can_access_member(declaring, resolved.access_flags()) {
                return Err(LinkError::IllegalAccess(format!(
                    "field {}.{} is not accessible from {}",
                    declaring.pretty(),
                    resolved.name(),
                    referrer.pretty()
                )));
            }
        }

        let field_ref = FieldRef::from_raw(std::ptr::NonNull::from(resolved));
        dex_cache.set_resolved_field(idx, field_ref);
        Ok(field_ref)
    }

    /// Resolves every type named by the catch handlers of a class's
    /// methods, so exception dispatch never faults on resolution.
    pub fn resolve_class_exception_handler_types(&self, klass: ClassRef) -> LinkResult<()> {
        let Some(dex) = klass.dex_file() else { return Ok(()) };
        let dex_cache = klass.dex_cache().unwrap();
        let def = dex.class_def(klass.class_def_index().unwrap());
        let methods = def
            .class_data
            .direct_methods
            .iter()
            .chain(def.class_data.virtual_methods.iter());
        for method in methods {
            let Some(code) = &method.code else { continue };
            for &handler_type in &code.handler_types {
                self.resolve_type(dex_cache, handler_type, klass.loader())?;
            }
        }
        Ok(())
    }
}
