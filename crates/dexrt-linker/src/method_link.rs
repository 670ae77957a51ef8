//! Method linking: vtable construction, the interface lookup table,
//! default-method resolution, miranda synthesis, and the IMT.
use crate::{arena::LinearAlloc, ClassLinker};
use dexrt_dex::modified_utf8_hash;
use dexrt_types::{
    AccessFlags, ArtMethod, ClassFlags, ClassRef, IfTable, IfTableEntry, ImtEntry, LinkError,
    LinkResult, MethodRef, IMT_SIZE, MAX_VTABLE_LENGTH,
};
use dexrt_utils::sync::Arc;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Name-and-signature equality, comparing through proxy prototypes.
pub(crate) fn same_name_and_signature(a: &ArtMethod, b: &ArtMethod) -> bool {
    let a = a.interface_method_if_proxy();
    let b = b.interface_method_if_proxy();
    if Arc::ptr_eq(a.dex_file(), b.dex_file()) {
        let a_id = a.dex_file().method_id(a.dex_method_index());
        let b_id = b.dex_file().method_id(b.dex_method_index());
        return a_id.name_idx == b_id.name_idx && a_id.proto_idx == b_id.proto_idx;
    }
    a.name() == b.name() && a.signature() == b.signature()
}

const INVALID_INDEX: u32 = u32::MAX;
const REMOVED_INDEX: u32 = u32::MAX - 1;

/// Scratch hash over a class's declared virtual methods, used to find
/// overrides of super vtable slots. Linear probing with two sentinels:
/// empty and removed.
struct LinkVirtualHashTable<'a> {
    virtuals: &'a [ArtMethod],
    table: Vec<u32>,
}

impl<'a> LinkVirtualHashTable<'a> {
    fn new(virtuals: &'a [ArtMethod], hash_size: usize) -> Self {
        LinkVirtualHashTable { virtuals, table: vec![INVALID_INDEX; hash_size] }
    }

    fn add(&mut self, virtual_method_index: u32) {
        let method = &self.virtuals[virtual_method_index as usize];
        let name = method.interface_method_if_proxy().name();
        let hash = modified_utf8_hash(name) as usize;
        let mut index = hash % self.table.len();
        while self.table[index] != INVALID_INDEX {
            index += 1;
            if index == self.table.len() {
                index = 0;
            }
        }
        self.table[index] = virtual_method_index;
    }

    fn find_and_remove(&mut self, method: &ArtMethod) -> Option<u32> {
        let name = method.interface_method_if_proxy().name();
        let hash = modified_utf8_hash(name) as usize;
        let mut index = hash % self.table.len();
        loop {
            let value = self.table[index];
            // Linear probing keeps blocks contiguous: an empty slot ends
            // the block and means not-found.
            if value == INVALID_INDEX {
                return None;
            }
            if value != REMOVED_INDEX {
                let candidate = &self.virtuals[value as usize];
                if same_name_and_signature(candidate, method) {
                    self.table[index] = REMOVED_INDEX;
                    return Some(value);
                }
            }
            index += 1;
            if index == self.table.len() {
                index = 0;
            }
        }
    }
}

/// What a super vtable slot holding a default method should become once
/// default and miranda methods have been copied into the class.
#[derive(Copy, Clone, Debug)]
pub(crate) enum DefaultTranslation {
    Method(MethodRef),
    Conflict,
}

/// Outcome of default-method selection for one target method.
enum DefaultMethodResult {
    Found(MethodRef),
    NotFound,
    Conflict { chosen: MethodRef, conflicting: MethodRef },
}

/// Outcome of the backward implementation scan for one interface method.
enum ImplSearch {
    NotFound,
    /// A matching method that is neither abstract nor public.
    NotPublic(MethodRef),
    /// A matching default method; selection decides whether a better one
    /// exists.
    Default(MethodRef),
    Implementation(MethodRef),
}

fn search_implementation(
    candidates: impl Iterator<Item = MethodRef>,
    interface_method: &ArtMethod,
) -> ImplSearch {
    for candidate in candidates {
        if !same_name_and_signature(&candidate, interface_method) {
            continue;
        }
        if !candidate.is_abstract() && !candidate.is_public() {
            return ImplSearch::NotPublic(candidate);
        }
        if candidate.is_default() {
            return ImplSearch::Default(candidate);
        }
        return ImplSearch::Implementation(candidate);
    }
    ImplSearch::NotFound
}

/// Places `method` into an IMT slot: empty slots take the method, a slot
/// holding the same name and signature is an overridden super entry and is
/// overwritten, anything else collapses to the conflict sentinel.
fn set_imt_ref(slot: &mut ImtEntry, method: MethodRef) {
    match *slot {
        ImtEntry::Unimplemented => *slot = ImtEntry::Method(method),
        ImtEntry::Conflict => {}
        ImtEntry::Method(existing) => {
            if same_name_and_signature(&existing, &method) {
                *slot = ImtEntry::Method(method);
            } else {
                *slot = ImtEntry::Conflict;
            }
        }
    }
}

impl ClassLinker {
    /// The full method-link pipeline:
    /// LinkSuperClass -> SetupInterfaceTable -> LinkVirtualMethods ->
    /// LinkInterfaceMethods. Returns the IMT for non-interface classes.
    pub(crate) fn link_methods(
        &self,
        class: ClassRef,
        interfaces: Option<&[ClassRef]>,
        alloc: &LinearAlloc,
    ) -> LinkResult<Option<Vec<ImtEntry>>> {
        self.link_super_class(class)?;
        self.setup_interface_lookup_table(class, interfaces)?;
        // The interface table goes first: vtable entries may need to be
        // updated with new default-method implementations found there.
        let mut default_translations = FxHashMap::default();
        self.link_virtual_methods(class, &mut default_translations)?;
        self.link_interface_methods(class, &default_translations, alloc)
    }

    /// Validates the super class and propagates inherited class flags.
    fn link_super_class(&self, class: ClassRef) -> LinkResult<()> {
        debug_assert!(!class.is_primitive());
        let super_class = match class.super_class() {
            Some(s) => s,
            None => {
                if class.descriptor() == "Ljava/lang/Object;" {
                    return Ok(());
                }
                return Err(LinkError::Linkage(format!(
                    "class {} has no super class",
                    class.pretty()
                )));
            }
        };
        if class.descriptor() == "Ljava/lang/Object;" {
            return Err(LinkError::ClassFormat(
                "root object class cannot have a super class".into(),
            ));
        }
        if super_class.is_final() || super_class.is_interface() {
            return Err(LinkError::IncompatibleClassChange(format!(
                "class {} extends {} {}",
                class.pretty(),
                if super_class.is_interface() { "interface" } else { "final class" },
                super_class.pretty()
            )));
        }
        if !class.get().can_access(super_class.get()) {
            return Err(LinkError::IllegalAccess(format!(
                "class {} cannot access its super class {}",
                class.pretty(),
                super_class.pretty()
            )));
        }
        // Once bootstrap finished, nothing may subclass the reference root
        // directly; the known reference kinds were all loaded before then.
        if self.init_done() && self.is_reference_root(super_class) {
            return Err(LinkError::Linkage(format!(
                "class {} attempts to subclass the reference root",
                class.pretty()
            )));
        }

        let super_flags = super_class.class_flags();
        let mut inherited = super_flags
            & (ClassFlags::CLASS_LOADER
                | ClassFlags::SOFT_REFERENCE
                | ClassFlags::WEAK_REFERENCE
                | ClassFlags::FINALIZER_REFERENCE
                | ClassFlags::PHANTOM_REFERENCE);
        if super_flags.contains(ClassFlags::FINALIZABLE) {
            inherited |= ClassFlags::FINALIZABLE;
        }
        if !inherited.is_empty() {
            class.add_class_flags(inherited);
        }
        Ok(())
    }

    /// Computes the transitive interface set in subinterface-after-
    /// superinterface order: for any `I extends J`, `J` precedes `I`.
    fn setup_interface_lookup_table(
        &self,
        class: ClassRef,
        interfaces: Option<&[ClassRef]>,
    ) -> LinkResult<()> {
        let super_class = class.super_class();
        let super_ifcount = super_class.map(|s| s.iftable_len()).unwrap_or(0);

        let direct: SmallVec<[ClassRef; 8]> = match interfaces {
            Some(list) => list.iter().copied().collect(),
            None => self.direct_interfaces(class)?,
        };

        if direct.is_empty() {
            if super_ifcount == 0 {
                return Ok(());
            }
            // Same interfaces as the parent; if all of them are marker
            // interfaces the parent's table can be shared outright.
            let super_iftable = super_class.unwrap().iftable();
            let has_non_marker = super_iftable
                .entries
                .iter()
                .any(|e| !e.interface.virtual_methods().is_empty());
            if !has_non_marker {
                class.set_iftable(super_iftable);
                return Ok(());
            }
        }

        for interface in &direct {
            if !interface.is_interface() {
                return Err(LinkError::IncompatibleClassChange(format!(
                    "class {} implements non-interface class {}",
                    class.pretty(),
                    interface.pretty()
                )));
            }
        }

        let capacity = super_ifcount
            + direct.len()
            + direct.iter().map(|i| i.iftable_len()).sum::<usize>();
        let mut entries: Vec<IfTableEntry> = Vec::with_capacity(capacity);
        let mut seen: FxHashSet<ClassRef> = FxHashSet::default();

        // The prefix is the super's transitive set, in the super's order.
        if let Some(super_class) = super_class {
            for entry in super_class.iftable().entries.iter() {
                seen.insert(entry.interface);
                entries.push(IfTableEntry { interface: entry.interface, methods: Vec::new() });
            }
        }

        for &interface in &direct {
            if seen.contains(&interface) {
                continue;
            }
            // Super-interfaces first, then the interface itself.
            for super_entry in interface.iftable().entries.iter() {
                if seen.insert(super_entry.interface) {
                    entries.push(IfTableEntry {
                        interface: super_entry.interface,
                        methods: Vec::new(),
                    });
                }
            }
            seen.insert(interface);
            entries.push(IfTableEntry { interface, methods: Vec::new() });
        }

        // De-dup collapsed entries in place above; assert the documented
        // order actually holds.
        if cfg!(debug_assertions) {
            for i in 0..entries.len() {
                for j in (i + 1)..entries.len() {
                    debug_assert!(
                        !entries[j].interface.is_assignable_from(entries[i].interface),
                        "interface {} precedes its super-interface {}",
                        entries[i].interface.pretty(),
                        entries[j].interface.pretty(),
                    );
                }
            }
        }

        class.set_iftable(Arc::new(IfTable { entries }));
        Ok(())
    }

    /// Builds the vtable: the super's table with overrides applied, new
    /// methods appended, and default-method updates recorded for the
    /// interface pass.
    fn link_virtual_methods(
        &self,
        class: ClassRef,
        default_translations: &mut FxHashMap<usize, DefaultTranslation>,
    ) -> LinkResult<()> {
        let virtuals = class.virtual_methods();
        let num_virtual = virtuals.len();

        if class.is_interface() {
            // No vtable; each declared method's index is its declaration
            // order position.
            if num_virtual >= MAX_VTABLE_LENGTH {
                return Err(LinkError::ClassFormat(format!(
                    "too many methods on interface: {num_virtual}"
                )));
            }
            let mut has_defaults = false;
            for (i, method) in virtuals.iter().enumerate() {
                method.set_method_index(i as u32);
                if !method.is_abstract() {
                    method.add_access_flags(AccessFlags::DEFAULT);
                    has_defaults = true;
                }
            }
            // Marked so initialization need not rescan the methods.
            if has_defaults {
                class.add_class_flags(ClassFlags::HAS_DEFAULT_METHODS);
            }
            return Ok(());
        }

        let Some(super_class) = class.super_class() else {
            // The root: every declared virtual method gets a fresh slot.
            if num_virtual >= MAX_VTABLE_LENGTH {
                return Err(LinkError::ClassFormat(format!("too many methods: {num_virtual}")));
            }
            let vtable: Vec<MethodRef> = virtuals
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    m.set_method_index(i as u32);
                    MethodRef::from_ref(m)
                })
                .collect();
            class.set_vtable(Arc::from(vtable));
            return Ok(());
        };

        let super_vtable = super_class.vtable();
        let super_vtable_length = super_vtable.len();
        // No new methods and no new interfaces means no slot can change;
        // share the super's table.
        if num_virtual == 0 && super_class.iftable_len() == class.iftable_len() {
            class.set_vtable(super_vtable);
            return Ok(());
        }

        let mut vtable: Vec<MethodRef> = super_vtable.to_vec();
        vtable.reserve(num_virtual);

        let hash_table_size = num_virtual * 3 + 1;
        let mut hash_table = LinkVirtualHashTable::new(virtuals, hash_table_size);
        for i in 0..num_virtual {
            hash_table.add(i as u32);
        }

        for (j, &super_method) in super_vtable.iter().enumerate() {
            if let Some(hash_index) = hash_table.find_and_remove(&super_method) {
                let virtual_method = &virtuals[hash_index as usize];
                let declaring = super_method
                    .declaring_class()
                    .expect("super vtable method has no declaring class");
                if class.get().can_access_member(declaring, super_method.access_flags()) {
                    if super_method.is_final() {
                        return Err(LinkError::Linkage(format!(
                            "method {} overrides final method in class {}",
                            virtual_method.pretty(),
                            declaring.pretty()
                        )));
                    }
                    vtable[j] = MethodRef::from_ref(virtual_method);
                    virtual_method.set_method_index(j as u32);
                } else {
                    warn!(
                        method = %virtual_method.pretty(),
                        super_class = %declaring.pretty(),
                        "method would incorrectly override a package-private method it cannot access"
                    );
                }
            } else if super_method.is_default() {
                // Not directly overridden, but a more specific default
                // implementation may exist among this class's interfaces.
                match self.find_default_method_implementation(&super_method, class)? {
                    DefaultMethodResult::Found(default_method) => {
                        if default_method.declaring_class() != super_method.declaring_class() {
                            // The replacement has to live in this class's
                            // own virtuals; the copy does not exist until
                            // the interface pass, so note the slot for a
                            // later fixup.
                            default_translations
                                .insert(j, DefaultTranslation::Method(default_method));
                            debug!(
                                slot = j,
                                method = %super_method.pretty(),
                                replacement = %default_method.pretty(),
                                "default method overrides inherited default"
                            );
                        }
                    }
                    DefaultMethodResult::NotFound => {}
                    DefaultMethodResult::Conflict { chosen, conflicting } => {
                        debug!(
                            slot = j,
                            a = %chosen.pretty(),
                            b = %conflicting.pretty(),
                            "conflicting default implementations; recording conflict slot"
                        );
                        default_translations.insert(j, DefaultTranslation::Conflict);
                    }
                }
            }
        }

        // Append methods that did not override anything.
        for method in virtuals.iter() {
            let method_index = method.method_index() as usize;
            if method_index < super_vtable_length
                && vtable[method_index] == MethodRef::from_ref(method)
            {
                continue;
            }
            method.set_method_index(vtable.len() as u32);
            vtable.push(MethodRef::from_ref(method));
        }

        if vtable.len() >= MAX_VTABLE_LENGTH {
            return Err(LinkError::ClassFormat(format!(
                "too many methods defined on class: {}",
                vtable.len()
            )));
        }
        class.set_vtable(Arc::from(vtable));
        Ok(())
    }

    /// Walks the itable backwards looking for the most specific
    /// non-abstract implementation of `target`. The table order guarantees
    /// subinterfaces are seen before their superinterfaces; scanning
    /// continues after a hit to detect conflicting unrelated defaults.
    fn find_default_method_implementation(
        &self,
        target: &ArtMethod,
        class: ClassRef,
    ) -> LinkResult<DefaultMethodResult> {
        let iftable = class.iftable();
        let mut chosen: Option<(MethodRef, ClassRef)> = None;

        for entry in iftable.entries.iter().rev() {
            let interface = entry.interface;
            for method in interface.virtual_methods() {
                if method.is_abstract() || !same_name_and_signature(method, target) {
                    continue;
                }
                debug_assert!(method.is_public(), "non-public interface default");
                match chosen {
                    Some((chosen_method, chosen_iface)) => {
                        if interface.get().is_assignable_from(chosen_iface) {
                            // Masked by the more specific choice.
                            break;
                        }
                        return Ok(DefaultMethodResult::Conflict {
                            chosen: chosen_method,
                            conflicting: MethodRef::from_ref(method),
                        });
                    }
                    None => {
                        chosen = Some((MethodRef::from_ref(method), interface));
                        break;
                    }
                }
            }
        }

        Ok(match chosen {
            Some((method, _)) => DefaultMethodResult::Found(method),
            None => DefaultMethodResult::NotFound,
        })
    }

    /// Fills the itable method arrays and the IMT, synthesizing miranda,
    /// default-copy, and conflict-marker methods as needed, then grows the
    /// class's virtual method array and fixes every table that referenced
    /// the moved methods.
    fn link_interface_methods(
        &self,
        class: ClassRef,
        default_translations: &FxHashMap<usize, DefaultTranslation>,
        alloc: &LinearAlloc,
    ) -> LinkResult<Option<Vec<ImtEntry>>> {
        if class.is_interface() {
            return Ok(None);
        }

        let iftable = class.iftable();
        let ifcount = iftable.len();
        let super_class = class.super_class();
        let super_ifcount = super_class.map(|s| s.iftable_len()).unwrap_or(0);

        let mut imt: Vec<ImtEntry> = vec![ImtEntry::Unimplemented; IMT_SIZE];
        if let Some(super_class) = super_class {
            if let Some(super_imt) = super_class.imt() {
                imt.copy_from_slice(&super_imt);
            } else {
                // No IMT on the super (it is abstract); reconstruct one
                // from its itable. Defaults and mirandas are skipped so a
                // subclass override can take the slot.
                let super_iftable = super_class.iftable();
                for entry in super_iftable.entries.iter() {
                    let interface_methods = entry.interface.virtual_methods();
                    for (j, &method) in entry.methods.iter().enumerate() {
                        if method.is_default() || method.is_miranda() {
                            continue;
                        }
                        let interface_method = &interface_methods[j];
                        let imt_index =
                            interface_method.dex_method_index().as_usize() % IMT_SIZE;
                        match imt[imt_index] {
                            ImtEntry::Unimplemented => imt[imt_index] = ImtEntry::Method(method),
                            ImtEntry::Method(_) => imt[imt_index] = ImtEntry::Conflict,
                            ImtEntry::Conflict => {}
                        }
                    }
                }
            }
        }

        // Working copies of the per-interface method arrays. Arrays for
        // interfaces inherited from the super start as copies of the
        // super's and get extended; new interfaces start empty.
        let super_iftable = super_class.map(|s| s.iftable());
        let mut method_arrays: Vec<Vec<Option<MethodRef>>> = Vec::with_capacity(ifcount);
        for (i, entry) in iftable.entries.iter().enumerate() {
            let num_methods = entry.interface.virtual_methods().len();
            if num_methods == 0 {
                method_arrays.push(Vec::new());
            } else if i < super_ifcount {
                let super_methods = &super_iftable.as_ref().unwrap().entries[i].methods;
                debug_assert_eq!(super_methods.len(), num_methods);
                method_arrays.push(super_methods.iter().map(|&m| Some(m)).collect());
            } else {
                method_arrays.push(vec![None; num_methods]);
            }
        }

        let vtable = class.vtable();
        let virtuals = class.virtual_methods();
        let mut mirandas: Vec<Box<ArtMethod>> = Vec::new();
        let mut defaults: Vec<MethodRef> = Vec::new();
        let mut conflicts: Vec<Box<ArtMethod>> = Vec::new();

        for i in 0..ifcount {
            let interface = iftable.entries[i].interface;
            let interface_methods = interface.virtual_methods();
            if interface_methods.is_empty() {
                continue;
            }
            let super_interface = i < super_ifcount;

            for (j, interface_method) in interface_methods.iter().enumerate() {
                let imt_index = interface_method.dex_method_index().as_usize() % IMT_SIZE;
                let mut found_impl = false;
                let mut found_default_impl: Option<MethodRef> = None;

                // Find the implementing method, favoring the subclass: walk
                // back from the end. An interface inherited from the super
                // can only be re-implemented by this class's own methods;
                // a new interface may be implemented anywhere in the
                // vtable.
                let search = if super_interface {
                    search_implementation(
                        virtuals.iter().rev().map(MethodRef::from_ref),
                        interface_method,
                    )
                } else {
                    search_implementation(vtable.iter().rev().copied(), interface_method)
                };
                match search {
                    ImplSearch::NotPublic(candidate) => {
                        return Err(LinkError::IllegalAccess(format!(
                            "method {} implementing interface method {} is not public",
                            candidate.pretty(),
                            interface_method.pretty()
                        )));
                    }
                    ImplSearch::Default(candidate) => {
                        // A newer, better default might exist; defer to the
                        // default-method scan but remember this one.
                        found_default_impl = Some(candidate);
                    }
                    ImplSearch::Implementation(candidate) => {
                        found_impl = true;
                        method_arrays[i][j] = Some(candidate);
                        set_imt_ref(&mut imt[imt_index], candidate);
                    }
                    ImplSearch::NotFound => {}
                }

                if !found_impl {
                    // Run default selection when the interface is new here,
                    // or when the inherited slot is itself replaceable by a
                    // default.
                    let overridable_slot = !super_interface
                        || method_arrays[i][j]
                            .map(|m| m.is_overridable_by_default_method())
                            .unwrap_or(true);
                    if overridable_slot {
                        match self.find_default_method_implementation(interface_method, class)? {
                            DefaultMethodResult::Found(selected) => {
                                let current = match found_default_impl {
                                    Some(existing)
                                        if existing.declaring_class()
                                            == selected.declaring_class() =>
                                    {
                                        // Same implementation the class
                                        // already carries; no new copy.
                                        existing
                                    }
                                    _ => {
                                        defaults.push(selected);
                                        selected
                                    }
                                };
                                method_arrays[i][j] = Some(current);
                                set_imt_ref(&mut imt[imt_index], current);
                                found_impl = true;
                            }
                            DefaultMethodResult::Conflict { chosen, conflicting } => {
                                // Record the conflict; it is raised on the
                                // first dispatch, not here.
                                debug!(
                                    method = %interface_method.pretty(),
                                    a = %chosen.pretty(),
                                    b = %conflicting.pretty(),
                                    "conflicting default implementations"
                                );
                                let marker = Self::find_or_create_synthetic(
                                    &mut conflicts,
                                    interface_method,
                                    AccessFlags::DEFAULT_CONFLICT,
                                );
                                method_arrays[i][j] = Some(marker);
                                set_imt_ref(&mut imt[imt_index], marker);
                                found_impl = true;
                            }
                            DefaultMethodResult::NotFound => {}
                        }
                    }
                }

                if !found_impl && !super_interface {
                    // Nothing implements it: synthesize an abstract miranda
                    // method so the tables stay well formed.
                    let miranda = Self::find_or_create_synthetic(
                        &mut mirandas,
                        interface_method,
                        AccessFlags::MIRANDA,
                    );
                    method_arrays[i][j] = Some(miranda);
                }
            }
        }

        if !mirandas.is_empty() || !defaults.is_empty() || !conflicts.is_empty() {
            let old_method_count = virtuals.len();
            let new_method_count =
                old_method_count + mirandas.len() + defaults.len() + conflicts.len();

            // Reallocate the virtual method array in the arena; the runtime
            // requires every vtable method of a class to live in that
            // class's own method storage.
            let mut new_virtuals: Vec<ArtMethod> = Vec::with_capacity(new_method_count);
            for method in virtuals.iter() {
                new_virtuals.push(ArtMethod::copy_of(method));
            }
            for miranda in &mirandas {
                debug_assert!(miranda.is_abstract(), "miranda method must be abstract");
                new_virtuals.push(ArtMethod::copy_of(miranda));
            }
            for &default in &defaults {
                let copy = ArtMethod::copy_of(&default);
                copy.add_access_flags(AccessFlags::DEFAULT);
                // This class has not been verified, whatever the original
                // declaring interface's state was.
                copy.clear_access_flags(AccessFlags::PREVERIFIED);
                new_virtuals.push(copy);
            }
            for conflict in &conflicts {
                new_virtuals.push(ArtMethod::copy_of(conflict));
            }

            let new_slice = alloc.alloc_methods(new_virtuals);
            for method in new_slice {
                method.set_declaring_class(class);
            }

            // Map every moved method to its relocated copy.
            let mut move_table: FxHashMap<MethodRef, MethodRef> =
                FxHashMap::with_capacity_and_hasher(new_method_count, Default::default());
            let old_refs = virtuals
                .iter()
                .map(MethodRef::from_ref)
                .chain(mirandas.iter().map(|m| MethodRef::from_ref(m)))
                .chain(defaults.iter().copied())
                .chain(conflicts.iter().map(|m| MethodRef::from_ref(m)));
            for (old_ref, new_method) in old_refs.zip(new_slice.iter()) {
                move_table.insert(old_ref, MethodRef::from_ref(new_method));
            }

            class.set_virtual_methods(new_slice);

            let old_vtable_count = vtable.len();
            let mut new_vtable: Vec<MethodRef> =
                Vec::with_capacity(old_vtable_count + new_method_count - old_method_count);
            new_vtable.extend(vtable.iter().copied());
            for new_method in &new_slice[old_method_count..] {
                new_method.set_method_index(new_vtable.len() as u32);
                new_vtable.push(MethodRef::from_ref(new_method));
            }

            // Rewrite old vtable slots: first apply recorded default
            // translations, then chase everything through the move table.
            for (slot, entry) in new_vtable.iter_mut().enumerate().take(old_vtable_count) {
                let mut translated = *entry;
                let mut require_move = false;
                match default_translations.get(&slot) {
                    Some(DefaultTranslation::Method(m)) => {
                        translated = *m;
                        require_move = true;
                    }
                    Some(DefaultTranslation::Conflict) => {
                        let marker = conflicts
                            .iter()
                            .find(|c| same_name_and_signature(c, &translated))
                            .expect("conflict translation without marker");
                        translated = MethodRef::from_ref(marker);
                        require_move = true;
                    }
                    None => {}
                }
                match move_table.get(&translated) {
                    Some(&new_method) => *entry = new_method,
                    None => debug_assert!(!require_move, "translated method was not relocated"),
                }
            }
            class.set_vtable(Arc::from(new_vtable));

            // Old copies of this class's methods are stale now; fix the
            // itable arrays and the IMT.
            for array in method_arrays.iter_mut() {
                for slot in array.iter_mut().flatten() {
                    if let Some(&new_method) = move_table.get(slot) {
                        *slot = new_method;
                    }
                }
            }
            for slot in imt.iter_mut() {
                if let ImtEntry::Method(m) = slot {
                    if let Some(&new_method) = move_table.get(m) {
                        *slot = ImtEntry::Method(new_method);
                    }
                }
            }
        }

        // Publish the finished itable.
        let entries: Vec<IfTableEntry> = iftable
            .entries
            .iter()
            .zip(method_arrays)
            .map(|(entry, methods)| IfTableEntry {
                interface: entry.interface,
                methods: methods
                    .into_iter()
                    .map(|m| m.expect("itable slot left unfilled"))
                    .collect(),
            })
            .collect();
        class.set_iftable(Arc::new(IfTable { entries }));

        Ok(Some(imt))
    }

    /// Reuses a synthesized method with the same name and signature or
    /// clones a fresh one from the interface method.
    fn find_or_create_synthetic(
        pool: &mut Vec<Box<ArtMethod>>,
        interface_method: &ArtMethod,
        extra_flags: AccessFlags,
    ) -> MethodRef {
        if let Some(existing) = pool
            .iter()
            .find(|m| same_name_and_signature(m, interface_method))
        {
            return MethodRef::from_ref(existing);
        }
        let synthetic = Box::new(ArtMethod::copy_of(interface_method));
        synthetic.add_access_flags(extra_flags);
        let method_ref = MethodRef::from_ref(&synthetic);
        pool.push(synthetic);
        method_ref
    }
}
