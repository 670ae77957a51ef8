//! Class lookup, definition, and the resolution protocol.
use crate::{arena::LinearAlloc, entrypoints, loaders::ClassLoader, stats::LinkerStats, ClassLinker};
use dexrt_dex::{modified_utf8_hash, ClassData, DexFile, PrimitiveKind};
use dexrt_types::{
    AccessFlags, ArtField, ArtMethod, Class, ClassContainer, ClassFlags, ClassRef, ClassStatus,
    DexCache, DexCacheRef, LinkError, LinkResult, LoaderId, MethodRef,
};
use dexrt_utils::{sync::current_thread_id, sync::Arc, ClassDefIndex};
use smallvec::SmallVec;
use tracing::{debug, warn};

impl ClassLinker {
    /// Resolves a descriptor to a class through the loader chain, defining
    /// it on first use.
    pub fn find_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
    ) -> LinkResult<ClassRef> {
        debug_assert!(!descriptor.is_empty(), "descriptor is empty string");
        let mut chars = descriptor.chars();
        if let (Some(c), None) = (chars.next(), chars.clone().next()) {
            // Only primitive descriptors are one character; they are not
            // backed by containers.
            return self.find_primitive_class(c);
        }
        let hash = modified_utf8_hash(descriptor);
        let loader_id = loader.map(|l| l.id()).unwrap_or(LoaderId::BOOT);

        if let Some(klass) = self.lookup_class(descriptor, hash, loader_id) {
            return self.ensure_resolved(descriptor, klass);
        }
        if descriptor.starts_with('[') {
            return self.create_array_class(descriptor, hash, loader);
        }
        match loader {
            None => match self.find_in_boot_class_path(descriptor)? {
                Some(klass) => Ok(klass),
                None => Err(LinkError::no_class_def(descriptor)),
            },
            Some(loader) => match self.find_in_loader_chain(descriptor, hash, loader)? {
                Some(klass) => Ok(klass),
                None => Err(LinkError::no_class_def(descriptor)),
            },
        }
    }

    /// `find_class` against the boot loader.
    pub fn find_system_class(&self, descriptor: &str) -> LinkResult<ClassRef> {
        self.find_class(descriptor, None)
    }

    pub fn find_primitive_class(&self, descriptor_char: char) -> LinkResult<ClassRef> {
        let kind = PrimitiveKind::from_descriptor_char(descriptor_char)
            .ok_or_else(|| LinkError::no_class_def(descriptor_char.to_string()))?;
        let roots = self
            .class_roots()
            .expect("primitive lookup before bootstrap");
        Ok(roots.primitive(kind))
    }

    /// Pure table probe; no loading.
    pub fn lookup_class(&self, descriptor: &str, hash: u32, loader: LoaderId) -> Option<ClassRef> {
        let registry = self.class_loaders().read();
        registry.table_for(loader)?.lookup(descriptor, hash)
    }

    fn find_in_boot_class_path(&self, descriptor: &str) -> LinkResult<Option<ClassRef>> {
        let boot_path = self.boot_class_path();
        for dex in &boot_path {
            if let Some(def_idx) = dex.find_class_def(descriptor) {
                return self.define_class(descriptor, None, dex, def_idx).map(Some);
            }
        }
        Ok(None)
    }

    /// Parent-first delegation through a user loader chain, ending at the
    /// boot class path.
    fn find_in_loader_chain(
        &self,
        descriptor: &str,
        hash: u32,
        loader: &Arc<ClassLoader>,
    ) -> LinkResult<Option<ClassRef>> {
        let from_parent = match loader.parent() {
            Some(parent) => self.find_in_loader_chain(descriptor, hash, parent)?,
            None => {
                if let Some(klass) = self.lookup_class(descriptor, hash, LoaderId::BOOT) {
                    Some(self.ensure_resolved(descriptor, klass)?)
                } else {
                    self.find_in_boot_class_path(descriptor)?
                }
            }
        };
        if from_parent.is_some() {
            return Ok(from_parent);
        }
        if let Some(klass) = self.lookup_class(descriptor, hash, loader.id()) {
            return Ok(Some(self.ensure_resolved(descriptor, klass)?));
        }
        for dex in loader.dex_files() {
            if let Some(def_idx) = dex.find_class_def(descriptor) {
                return self
                    .define_class(descriptor, Some(loader), dex, def_idx)
                    .map(Some);
            }
        }
        Ok(None)
    }

    /// Waits until `klass` is usable: temp classes must be retired and
    /// relooked up, classes mid-resolution must finish on their thread, and
    /// erroneous classes replay their stored failure.
    pub(crate) fn ensure_resolved(
        &self,
        descriptor: &str,
        mut klass: ClassRef,
    ) -> LinkResult<ClassRef> {
        // Re-entry by the resolving thread itself means the super or
        // interface graph is circular. Checked before any wait so the
        // defining thread can never block on its own placeholder.
        if !klass.is_resolved()
            && !klass.is_erroneous()
            && klass.clinit_thread_id() == current_thread_id()
        {
            let error = LinkError::ClassCircularity(descriptor.to_string());
            klass.set_failure(error.clone());
            klass.set_status(ClassStatus::Error);
            return Err(error);
        }

        // Temp classes must be waited out and the final class fetched from
        // the table.
        if self.init_done() && klass.is_temp() {
            debug_assert!(!klass.is_resolved());
            if klass.is_erroneous() {
                return Err(self.earlier_failure(klass));
            }
            {
                let mut guard = klass.monitor().lock();
                while !klass.is_retired() && !klass.is_erroneous() {
                    klass.monitor().wait(&mut guard);
                }
            }
            if klass.is_erroneous() {
                return Err(self.earlier_failure(klass));
            }
            debug_assert!(klass.is_retired());
            klass = self
                .lookup_class(descriptor, klass.hash(), klass.loader())
                .ok_or_else(|| LinkError::no_class_def(descriptor))?;
        }

        if !klass.is_resolved() && !klass.is_erroneous() {
            let mut guard = klass.monitor().lock();
            while !klass.is_resolved() && !klass.is_erroneous() {
                // Deliberately uninterruptible; interruption is re-raised
                // by the caller once the class is safe.
                klass.monitor().wait(&mut guard);
            }
        }

        if klass.is_erroneous() {
            return Err(self.earlier_failure(klass));
        }
        debug_assert!(klass.is_resolved(), "{klass:?}");
        Ok(klass)
    }

    /// The failure replayed for a class already in `Error`. The stored
    /// cause is re-raised as-is; only a stored `NoClassDefFound` (or no
    /// stored cause at all) morphs into the generic replay error.
    pub(crate) fn earlier_failure(&self, klass: ClassRef) -> LinkError {
        debug_assert!(klass.is_erroneous());
        match klass.failure() {
            Some(LinkError::NoClassDefFound { .. }) | None => {
                LinkError::EarlierFailure(klass.descriptor().to_string())
            }
            Some(error) => error,
        }
    }

    /// Defines a class from a container entry: allocate, insert, load
    /// members and supertypes, then link.
    pub(crate) fn define_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
        dex: &Arc<DexFile>,
        def_idx: ClassDefIndex,
    ) -> LinkResult<ClassRef> {
        let loader_id = loader.map(|l| l.id()).unwrap_or(LoaderId::BOOT);
        let alloc = self.alloc_for(loader_id);

        // Bootstrap hand-builds the bottom of the type graph; replaying
        // those descriptors finishes the hand-built class instead of
        // allocating a second one.
        let prealloc = if self.init_done() {
            None
        } else {
            self.take_boot_prealloc(descriptor)
        };
        let is_prealloc = prealloc.is_some();
        let klass =
            prealloc.unwrap_or_else(|| alloc.alloc_class(Class::new(descriptor, loader_id)));
        LinkerStats::bump(&self.stats().classes_defined);

        let dex_cache = self.register_dex_file(dex, &alloc);
        let def = dex.class_def(def_idx);
        klass.set_container(ClassContainer { dex: dex.clone(), class_def: def_idx, dex_cache });
        klass.set_access_flags(AccessFlags::from_bits_retain(def.access_flags));
        self.set_descriptor_class_flags(klass);
        // Regular classes are defined as placeholders and replaced by a
        // correctly-sized final class once linking knows the embedded table
        // sizes; interfaces and abstract classes carry no embedded tables.
        if !is_prealloc && klass.is_instantiable() {
            klass.add_class_flags(ClassFlags::TEMP);
        }
        klass.set_status(ClassStatus::Idx);
        klass.set_clinit_thread_id(current_thread_id());

        if let Some(existing) = self.insert_class(klass) {
            // Raced with another definition of the same descriptor; wait on
            // the winner.
            return self.ensure_resolved(descriptor, existing);
        }

        // Members load after insertion so every arena allocation is
        // reachable from the table for root visits.
        if let Err(error) = self.load_class_members(klass, dex, &def.class_data, &alloc) {
            klass.set_failure(error.clone());
            klass.set_status(ClassStatus::Error);
            return Err(error);
        }
        if let Err(error) = self.load_super_and_interfaces(klass) {
            klass.set_failure(error.clone());
            klass.set_status(ClassStatus::Error);
            return Err(error);
        }
        debug_assert!(klass.is_loaded());

        match self.link_class(klass, None, &alloc) {
            Ok(final_class) => {
                debug_assert!(final_class.is_resolved());
                Ok(final_class)
            }
            Err(error) => {
                klass.set_failure(error.clone());
                klass.set_status(ClassStatus::Error);
                Err(error)
            }
        }
    }

    fn take_boot_prealloc(&self, descriptor: &str) -> Option<ClassRef> {
        self.boot_prealloc_map().lock().get(descriptor).copied()
    }

    fn set_descriptor_class_flags(&self, klass: ClassRef) {
        let flags = match klass.descriptor() {
            "Ljava/lang/String;" => ClassFlags::STRING | ClassFlags::VARIABLE_SIZE,
            "Ljava/lang/ClassLoader;" => ClassFlags::CLASS_LOADER,
            "Ljava/lang/DexCache;" => ClassFlags::DEX_CACHE,
            "Ljava/lang/ref/Reference;" => ClassFlags::WEAK_REFERENCE,
            "Ljava/lang/ref/SoftReference;" => ClassFlags::SOFT_REFERENCE,
            "Ljava/lang/ref/WeakReference;" => ClassFlags::WEAK_REFERENCE,
            "Ljava/lang/ref/FinalizerReference;" => ClassFlags::FINALIZER_REFERENCE,
            "Ljava/lang/ref/PhantomReference;" => ClassFlags::PHANTOM_REFERENCE,
            _ => return,
        };
        klass.add_class_flags(flags);
    }

    /// Inserts into the owning loader's table. Returns the racing class if
    /// one beat us to the descriptor.
    pub(crate) fn insert_class(&self, klass: ClassRef) -> Option<ClassRef> {
        {
            let mut registry = self.class_loaders().write();
            let table = registry
                .table_for_mut(klass.loader())
                .expect("class belongs to an unregistered loader");
            if let Some(existing) = table.lookup(klass.descriptor(), klass.hash()) {
                return Some(existing);
            }
            let inserted = table.insert(klass);
            debug_assert!(inserted);
        }
        self.record_new_root(klass);
        self.gc_hooks().write_barrier(klass);
        None
    }

    pub fn remove_class(&self, descriptor: &str, loader: LoaderId) -> bool {
        let hash = modified_utf8_hash(descriptor);
        let mut registry = self.class_loaders().write();
        registry
            .table_for_mut(loader)
            .map(|t| t.remove(descriptor, hash))
            .unwrap_or(false)
    }

    /// Builds the field and method descriptor arrays from the class data.
    fn load_class_members(
        &self,
        klass: ClassRef,
        dex: &Arc<DexFile>,
        data: &ClassData,
        alloc: &LinearAlloc,
    ) -> LinkResult<()> {
        if dex.class_def(klass.class_def_index().unwrap()).static_values.len()
            > data.static_fields.len()
        {
            return Err(LinkError::ClassFormat(format!(
                "more static values than static fields in {}",
                klass.pretty()
            )));
        }

        let sfields: Vec<ArtField> = ClassData::unique_fields(&data.static_fields)
            .map(|f| ArtField::new(dex.clone(), f.field_idx, f.access_flags))
            .collect();
        let ifields: Vec<ArtField> = ClassData::unique_fields(&data.instance_fields)
            .map(|f| ArtField::new(dex.clone(), f.field_idx, f.access_flags))
            .collect();
        if sfields.len() != data.static_fields.len()
            || ifields.len() != data.instance_fields.len()
        {
            warn!(class = %klass.pretty(), "duplicate field entries ignored");
        }

        let load_methods = |encoded: &[dexrt_dex::EncodedMethod]| -> Vec<ArtMethod> {
            ClassData::unique_methods(encoded)
                .map(|m| {
                    let method = ArtMethod::new(dex.clone(), m.method_idx, m.access_flags);
                    let has_code = m.code.is_some();
                    entrypoints::link_code(self.config(), self.interpreter(), &method, has_code);
                    method
                })
                .collect()
        };
        let direct = load_methods(&data.direct_methods);
        let virtuals = load_methods(&data.virtual_methods);

        // A non-root class declaring finalize()V is finalizable.
        if klass.descriptor() != "Ljava/lang/Object;" {
            let finalizable = virtuals.iter().any(|m| {
                m.name() == "finalize"
                    && m.signature().parameters.is_empty()
                    && m.signature().return_type == "V"
            });
            if finalizable {
                klass.add_class_flags(ClassFlags::FINALIZABLE);
            }
        }

        let sfields = alloc.alloc_fields(sfields);
        let ifields = alloc.alloc_fields(ifields);
        let direct = alloc.alloc_methods(direct);
        let virtuals = alloc.alloc_methods(virtuals);
        for field in sfields.iter().chain(ifields.iter()) {
            field.set_declaring_class(klass);
        }
        for method in direct.iter().chain(virtuals.iter()) {
            method.set_declaring_class(klass);
        }
        klass.set_static_fields(sfields);
        klass.set_instance_fields(ifields);
        klass.set_direct_methods(direct);
        klass.set_virtual_methods(virtuals);
        Ok(())
    }

    /// Resolves the super class and the directly-declared interfaces.
    fn load_super_and_interfaces(&self, klass: ClassRef) -> LinkResult<()> {
        debug_assert_eq!(klass.status(), ClassStatus::Idx);
        let dex = klass.dex_file().unwrap();
        let dex_cache = klass.dex_cache().unwrap();
        let def_idx = klass.class_def_index().unwrap();
        let def = dex.class_def(def_idx);

        match def.superclass_idx {
            Some(super_idx) => {
                let super_class = self.resolve_type(dex_cache, super_idx, klass.loader())?;
                klass.set_super_class(super_class);
                self.gc_hooks().write_barrier(klass);
                if klass.is_interface() && super_class.descriptor() != "Ljava/lang/Object;" {
                    return Err(LinkError::ClassFormat(format!(
                        "interface {} has non-root super class",
                        klass.pretty()
                    )));
                }
            }
            None => {
                if klass.descriptor() != "Ljava/lang/Object;" {
                    return Err(LinkError::ClassFormat(format!(
                        "class {} has no superclass entry",
                        klass.pretty()
                    )));
                }
            }
        }

        for &iface_idx in &def.interfaces {
            let interface = self.resolve_type(dex_cache, iface_idx, klass.loader())?;
            if !interface.is_interface() {
                return Err(LinkError::IncompatibleClassChange(format!(
                    "class {} implements non-interface class {}",
                    klass.pretty(),
                    interface.pretty()
                )));
            }
        }

        klass.set_status(ClassStatus::Loaded);
        Ok(())
    }

    /// Runs the link pipeline. For temp classes, builds the final class,
    /// swaps it into the table, retires the temp, and fixes the member
    /// back-pointers.
    pub(crate) fn link_class(
        &self,
        klass: ClassRef,
        interfaces: Option<&[ClassRef]>,
        alloc: &LinearAlloc,
    ) -> LinkResult<ClassRef> {
        klass.set_status(ClassStatus::Resolving);
        let imt = self.link_methods(klass, interfaces, alloc)?;
        crate::layout::link_instance_fields(klass)?;
        let static_size = crate::layout::link_static_fields(klass)?;
        crate::layout::create_reference_instance_offsets(&klass);
        klass.prepare_statics(static_size as usize);

        if !klass.is_temp() {
            // Only instantiable classes carry an embedded IMT; subclasses
            // of abstract classes reconstruct theirs from the itable.
            if let Some(imt) = imt {
                if klass.is_instantiable() {
                    klass.set_imt(Arc::from(imt));
                }
            }
            klass.set_status(ClassStatus::Resolved);
            return Ok(klass);
        }

        // The temp class served as the placeholder during loading; now that
        // table sizes are known, build the final class and retire the temp.
        let final_class = alloc.alloc_class(Class::new(klass.descriptor(), klass.loader()));
        final_class.set_access_flags(klass.access_flags());
        final_class
            .add_class_flags(klass.class_flags().difference(ClassFlags::TEMP));
        if let Some(super_class) = klass.super_class() {
            final_class.set_super_class(super_class);
        }
        if let Some(component) = klass.component_type() {
            final_class.set_component_type(component);
        }
        if let Some(container) = klass.dex_file().map(|dex| ClassContainer {
            dex,
            class_def: klass.class_def_index().unwrap(),
            dex_cache: klass.dex_cache().unwrap(),
        }) {
            final_class.set_container(container);
        }
        final_class.set_object_size(klass.object_size());
        final_class.set_reference_instance_offsets(klass.reference_instance_offsets());
        final_class.set_num_reference_instance_fields(klass.num_reference_instance_fields());
        final_class.set_num_reference_static_fields(klass.num_reference_static_fields());
        final_class.set_clinit_thread_id(klass.clinit_thread_id());

        // Member storage moves wholesale; only the declaring-class
        // back-pointers change, under the temp's monitor window.
        let sfields = klass.static_fields();
        let ifields = klass.instance_fields();
        let direct = klass.direct_methods();
        let virtuals = klass.virtual_methods();
        for field in sfields.iter().chain(ifields.iter()) {
            field.set_declaring_class(final_class);
        }
        for method in direct.iter().chain(virtuals.iter()) {
            method.set_declaring_class(final_class);
        }
        final_class.set_static_fields(sfields);
        final_class.set_instance_fields(ifields);
        final_class.set_direct_methods(direct);
        final_class.set_virtual_methods(virtuals);
        final_class.set_vtable(klass.vtable());
        final_class.set_iftable(klass.iftable());
        if let Some(override_list) = klass.direct_interfaces_override() {
            final_class.set_direct_interfaces_override(override_list);
        }
        if let Some(imt) = imt {
            final_class.set_imt(Arc::from(imt));
        }
        final_class.prepare_statics(static_size as usize);

        {
            let mut registry = self.class_loaders().write();
            let table = registry
                .table_for_mut(klass.loader())
                .expect("class belongs to an unregistered loader");
            let previous = table.update(klass.descriptor(), final_class);
            debug_assert_eq!(previous, Some(klass));
        }
        self.record_new_root(final_class);
        LinkerStats::bump(&self.stats().classes_retired);
        debug!(class = %klass.pretty(), "retiring temp class");
        klass.set_status(ClassStatus::Retired);
        final_class.set_status(ClassStatus::Resolved);
        self.gc_hooks().write_barrier(final_class);
        Ok(final_class)
    }

    /// Registers a container, creating its resolution cache in the owning
    /// loader's arena on first registration.
    pub fn register_dex_file(&self, dex: &Arc<DexFile>, alloc: &Arc<LinearAlloc>) -> DexCacheRef {
        if let Some(cache) = self.find_dex_cache(dex) {
            return cache;
        }
        // Allocate outside the write lock; a racing registration wins and
        // the loser's cache simply stays unused in its arena.
        let cache = alloc.alloc_dex_cache(DexCache::new(dex.clone()));
        let owner = if Arc::ptr_eq(alloc, self.boot_alloc()) {
            None
        } else {
            Some(Arc::downgrade(alloc))
        };
        let mut caches = self.dex_lock().write();
        if let Some(existing) = caches
            .iter()
            .find(|c| c.is_live() && Arc::ptr_eq(c.cache.dex_file(), dex))
        {
            return existing.cache;
        }
        caches.push(crate::RegisteredDex { cache, owner });
        cache
    }

    pub fn find_dex_cache(&self, dex: &Arc<DexFile>) -> Option<DexCacheRef> {
        self.dex_lock()
            .read()
            .iter()
            .find(|c| c.is_live() && Arc::ptr_eq(c.cache.dex_file(), dex))
            .map(|c| c.cache)
    }

    /// Drops registrations whose owning arena is gone.
    pub(crate) fn purge_dead_dex_caches(&self) {
        self.dex_lock().write().retain(|c| c.is_live());
    }

    /// The directly-declared interfaces of a class, resolved.
    pub(crate) fn direct_interfaces(
        &self,
        klass: ClassRef,
    ) -> LinkResult<SmallVec<[ClassRef; 8]>> {
        if let Some(list) = klass.direct_interfaces_override() {
            return Ok(list.iter().copied().collect());
        }
        let Some(dex_cache) = klass.dex_cache() else {
            return Ok(SmallVec::new());
        };
        let dex = klass.dex_file().unwrap();
        let def = dex.class_def(klass.class_def_index().unwrap());
        def.interfaces
            .iter()
            .map(|&idx| self.resolve_type(dex_cache, idx, klass.loader()))
            .collect()
    }

    /// Raises the lazily-recorded incompatible-class-change failure carried
    /// by default-conflict markers; dispatch calls this before invoking.
    pub fn ensure_invokable(&self, method: MethodRef) -> LinkResult<()> {
        if method.is_default_conflicting() {
            return Err(LinkError::IncompatibleClassChange(format!(
                "conflicting default method implementations of {}",
                method.pretty()
            )));
        }
        Ok(())
    }

    pub(crate) fn record_new_root(&self, klass: ClassRef) {
        if self.log_new_roots() {
            self.new_class_roots_log().lock().push(klass);
        }
    }
}
