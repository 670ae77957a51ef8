//! Class verification gating and the initialization protocol.
//!
//! `ensure_initialized` drives a class through
//! Verified -> Initializing -> Initialized with the per-class monitor and
//! clinit-thread-id guarding against concurrent and re-entrant
//! initialization. Supertypes initialize first, then every directly
//! implemented interface that declares default methods, then the static
//! constants decode, then the class initializer runs through the
//! interpreter.
use crate::{hooks::ClinitFailure, hooks::VerifyResult, stats::LinkerStats, ClassLinker};
use dexrt_dex::EncodedValue;
use dexrt_types::{
    AccessFlags, ClassFlags, ClassRef, ClassStatus, FieldRef, LinkError, LinkResult, MethodRef,
    StaticRef,
};
use dexrt_utils::sync::current_thread_id;
use std::{ptr::NonNull, time::Instant};
use tracing::{debug, info};

impl ClassLinker {
    /// Brings `klass` to `Initialized` if policy allows.
    ///
    /// Returns `Ok(true)` when the class is initialized on return,
    /// `Ok(false)` when policy (`can_init_statics` / `can_init_parents`)
    /// or a compile-time soft verification failure declined the work, and
    /// an error when the class is or becomes erroneous.
    pub fn ensure_initialized(
        &self,
        klass: ClassRef,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> LinkResult<bool> {
        // Initialized is terminal, so the lock-free fast path is sound; a
        // stale read only costs re-checking below.
        if klass.is_initialized() {
            return Ok(true);
        }
        self.initialize_class(klass, can_init_statics, can_init_parents)
    }

    fn initialize_class(
        &self,
        klass: ClassRef,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> LinkResult<bool> {
        if !self.can_we_initialize_class(klass, can_init_statics, can_init_parents) {
            return Ok(false);
        }

        let thread_id = current_thread_id();
        loop {
            match klass.status() {
                ClassStatus::Initialized => return Ok(true),
                ClassStatus::Error => return Err(self.earlier_failure(klass)),
                ClassStatus::Initializing => {
                    if klass.clinit_thread_id() == thread_id {
                        // Re-entrant initialization higher up this thread's
                        // stack; proceed as if initialized.
                        return Ok(true);
                    }
                    if self.wait_for_initialize_class(klass)? {
                        return Ok(true);
                    }
                    // Status regressed observation; re-examine.
                }
                status if status < ClassStatus::Verified => {
                    debug_assert!(klass.is_resolved(), "{klass:?}");
                    self.verify_class(klass)?;
                    if !klass.is_verified() {
                        // Compile-time soft failure; verification retries
                        // at runtime.
                        debug_assert_eq!(
                            klass.status(),
                            ClassStatus::RetryVerificationAtRuntime
                        );
                        return Ok(false);
                    }
                }
                _ => {
                    debug_assert!(klass.is_verified());
                    if let Err(error) = self.validate_super_class_descriptors(klass) {
                        return Err(self.fail_initialization(klass, error));
                    }
                    if klass.try_begin_initializing(thread_id) {
                        break;
                    }
                }
            }
        }

        // This thread owns the initialization from here on.
        let t0 = Instant::now();

        // Super classes first, as the initialization order demands.
        if !klass.is_interface() {
            if let Some(super_class) = klass.super_class() {
                if !super_class.is_initialized() {
                    debug_assert!(can_init_parents);
                    match self.initialize_class(super_class, can_init_statics, true) {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(self.fail_initialization(
                                klass,
                                LinkError::Linkage(format!(
                                    "super class {} of {} declined initialization",
                                    super_class.pretty(),
                                    klass.pretty()
                                )),
                            ));
                        }
                        Err(error) => {
                            debug_assert!(super_class.is_erroneous());
                            return Err(self.fail_initialization(klass, error));
                        }
                    }
                }
            }

            // Then every direct superinterface carrying default methods.
            let direct_interfaces = match self.direct_interfaces(klass) {
                Ok(list) => list,
                Err(error) => return Err(self.fail_initialization(klass, error)),
            };
            for interface in direct_interfaces {
                if interface.class_flags().contains(ClassFlags::RECURSIVELY_INITIALIZED) {
                    continue;
                }
                match self.initialize_default_interface_recursive(
                    interface,
                    can_init_statics,
                    can_init_parents,
                ) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(self.fail_initialization(
                            klass,
                            LinkError::Linkage(format!(
                                "interface {} of {} declined initialization",
                                interface.pretty(),
                                klass.pretty()
                            )),
                        ));
                    }
                    Err(error) => return Err(self.fail_initialization(klass, error)),
                }
            }
        }

        if let Err(error) = self.initialize_static_fields(klass, can_init_statics) {
            return Err(self.fail_initialization(klass, error));
        }

        if let Some(clinit) = klass.find_class_initializer() {
            debug_assert!(can_init_statics);
            debug!(class = %klass.pretty(), "running class initializer");
            match self.interpreter().invoke_clinit(clinit) {
                Ok(()) => {}
                Err(ClinitFailure::Exception(message)) => {
                    // Non-Error exceptions get wrapped; the class is
                    // permanently broken either way.
                    let error = LinkError::ExceptionInInitializer {
                        descriptor: klass.descriptor().to_string(),
                        message,
                    };
                    return Err(self.fail_initialization(klass, error));
                }
                Err(ClinitFailure::Error(error)) => {
                    return Err(self.fail_initialization(klass, error));
                }
            }
        }

        LinkerStats::bump(&self.stats().class_init_count);
        LinkerStats::add(
            &self.stats().class_init_time_ns,
            t0.elapsed().as_nanos() as u64,
        );
        klass.set_status(ClassStatus::Initialized);
        info!(class = %klass.pretty(), "initialized");
        // Static methods can drop their resolution trampolines now.
        self.fixup_static_trampolines(klass);
        Ok(true)
    }

    /// Marks the class erroneous, stores the failure for replay, and wakes
    /// all waiters.
    fn fail_initialization(&self, klass: ClassRef, error: LinkError) -> LinkError {
        klass.set_failure(error.clone());
        klass.set_status(ClassStatus::Error);
        error
    }

    /// Blocks until the initializing thread finishes. `Ok(true)` means the
    /// class is initialized; `Ok(false)` means the status changed some
    /// other way and the caller should re-examine.
    fn wait_for_initialize_class(&self, klass: ClassRef) -> LinkResult<bool> {
        let thread_id = current_thread_id();
        {
            let mut guard = klass.monitor().lock();
            while klass.status() == ClassStatus::Initializing
                && klass.clinit_thread_id() != thread_id
            {
                // Uninterruptible: initialization must complete even if
                // this thread was interrupted; interruption is re-raised
                // by the caller afterwards.
                klass.monitor().wait(&mut guard);
            }
        }
        match klass.status() {
            ClassStatus::Initialized => Ok(true),
            // The initializer failed; every waiter observes the stored
            // failure.
            ClassStatus::Error => Err(self.earlier_failure(klass)),
            _ => Ok(false),
        }
    }

    /// Policy gate: without `can_init_statics`, anything that would run a
    /// class initializer or decode constants refuses; without
    /// `can_init_parents`, an uninitialized supertype refuses.
    fn can_we_initialize_class(
        &self,
        klass: ClassRef,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> bool {
        if can_init_statics && can_init_parents {
            return true;
        }
        if !can_init_statics {
            if klass.find_class_initializer().is_some() {
                return false;
            }
            if !klass.static_fields().is_empty() {
                if let (Some(dex), Some(def_idx)) = (klass.dex_file(), klass.class_def_index()) {
                    if !dex.class_def(def_idx).static_values.is_empty() {
                        return false;
                    }
                }
            }
            if !klass.is_interface() {
                let iftable = klass.iftable();
                for entry in iftable.entries.iter() {
                    if entry.interface.has_default_methods()
                        && !self.can_we_initialize_class(
                            entry.interface,
                            can_init_statics,
                            can_init_parents,
                        )
                    {
                        return false;
                    }
                }
            }
        }
        if klass.is_interface() || klass.super_class().is_none() {
            return true;
        }
        let super_class = klass.super_class().unwrap();
        if !can_init_parents && !super_class.is_initialized() {
            return false;
        }
        self.can_we_initialize_class(super_class, can_init_statics, can_init_parents)
    }

    /// Runs down the interface tree in declaration order, initializing
    /// every interface that declares default methods. The recursion marker
    /// is a traversal shortcut only and must never be read as
    /// initialization status.
    fn initialize_default_interface_recursive(
        &self,
        interface: ClassRef,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> LinkResult<bool> {
        debug_assert!(interface.is_interface());
        for super_interface in self.direct_interfaces(interface)? {
            if super_interface
                .class_flags()
                .contains(ClassFlags::RECURSIVELY_INITIALIZED)
            {
                continue;
            }
            if !self.initialize_default_interface_recursive(
                super_interface,
                can_init_statics,
                can_init_parents,
            )? {
                return Ok(false);
            }
        }

        let mut result = true;
        // Interfaces without default methods must not be initialized here;
        // interface initialization is never triggered by implementors
        // alone.
        if interface.has_default_methods() {
            result = self.ensure_initialized(interface, can_init_statics, can_init_parents)?;
        }
        if result {
            interface.add_class_flags(ClassFlags::RECURSIVELY_INITIALIZED);
        }
        Ok(result)
    }

    /// Backfills the resolution cache for the class's own static fields and
    /// decodes the container's constant values into static storage.
    fn initialize_static_fields(&self, klass: ClassRef, can_init_statics: bool) -> LinkResult<()> {
        let sfields = klass.static_fields();
        if sfields.is_empty() {
            return Ok(());
        }
        let (Some(dex), Some(def_idx), Some(dex_cache)) =
            (klass.dex_file(), klass.class_def_index(), klass.dex_cache())
        else {
            return Ok(());
        };

        // Eagerly publish the fields so later resolution skips the search.
        for field in sfields {
            let idx = field.dex_field_index();
            if dex_cache.resolved_field(idx).is_none() {
                dex_cache.set_resolved_field(idx, FieldRef::from_raw(NonNull::from(field)));
            } else {
                debug_assert_eq!(
                    dex_cache.resolved_field(idx).map(|f| f.as_ptr()),
                    Some(field as *const _ as *mut _)
                );
            }
        }

        let def = dex.class_def(def_idx);
        if def.static_values.is_empty() {
            return Ok(());
        }
        debug_assert!(can_init_statics);
        let _ = can_init_statics;

        let mut statics = klass.statics_mut();
        let storage = statics.as_mut().expect("static storage prepared during linking");
        for (value, field) in def.static_values.iter().zip(sfields.iter()) {
            let offset = field.offset();
            match *value {
                EncodedValue::Boolean(v) => storage.set_i8(offset, v as i8),
                EncodedValue::Byte(v) => storage.set_i8(offset, v),
                EncodedValue::Short(v) => storage.set_i16(offset, v),
                EncodedValue::Char(v) => storage.set_u16(offset, v),
                EncodedValue::Int(v) => storage.set_i32(offset, v),
                EncodedValue::Long(v) => storage.set_i64(offset, v),
                EncodedValue::Float(v) => storage.set_f32(offset, v),
                EncodedValue::Double(v) => storage.set_f64(offset, v),
                EncodedValue::String(idx) => {
                    let resolved = self.resolve_string(dex_cache, idx)?;
                    storage.set_reference(offset, StaticRef::String(resolved));
                }
                EncodedValue::Null => storage.set_reference(offset, StaticRef::Null),
            }
        }
        Ok(())
    }

    /// Verification gating: runs the external verifier (or the image
    /// probe) and moves the status to `Verified`,
    /// `RetryVerificationAtRuntime`, or `Error`.
    pub fn verify_class(&self, klass: ClassRef) -> LinkResult<()> {
        // Wait out a verification already running elsewhere.
        {
            let mut guard = klass.monitor().lock();
            while matches!(
                klass.status(),
                ClassStatus::Verifying | ClassStatus::VerifyingAtRuntime
            ) {
                klass.monitor().wait(&mut guard);
            }
        }
        if klass.is_verified() {
            return Ok(());
        }
        if klass.is_erroneous() {
            return Err(self.earlier_failure(klass));
        }
        let at_runtime = klass.status() == ClassStatus::RetryVerificationAtRuntime;
        debug_assert!(klass.status() == ClassStatus::Resolved || at_runtime, "{klass:?}");

        // A class whose super failed verification can never verify.
        if let Some(super_class) = klass.super_class() {
            if !super_class.is_verified() && !super_class.is_erroneous() {
                self.verify_class(super_class)?;
            }
            if super_class.is_erroneous() {
                let error = LinkError::Verify {
                    descriptor: klass.descriptor().to_string(),
                    message: format!("super class {} is erroneous", super_class.pretty()),
                };
                klass.set_failure(error.clone());
                klass.set_status(ClassStatus::Error);
                return Err(error);
            }
        }

        if !self.config().verify {
            self.ensure_preverified_methods(klass);
            klass.set_status(ClassStatus::Verified);
            return Ok(());
        }

        // Classes verified when their container was compiled skip the work.
        if self.verifier().verify_using_image(klass) {
            self.ensure_preverified_methods(klass);
            klass.set_status(ClassStatus::Verified);
            return Ok(());
        }

        klass.set_status(if at_runtime {
            ClassStatus::VerifyingAtRuntime
        } else {
            ClassStatus::Verifying
        });
        match self.verifier().verify_class(klass) {
            VerifyResult::NoFailure => {
                self.ensure_preverified_methods(klass);
                klass.set_status(ClassStatus::Verified);
                Ok(())
            }
            VerifyResult::SoftFailure => {
                // Make exception dispatch safe even though the fast paths
                // stay off. Failures here surface again at dispatch, so
                // they do not poison the class.
                if let Err(error) = self.resolve_class_exception_handler_types(klass) {
                    debug!(
                        class = %klass.pretty(),
                        %error,
                        "could not resolve exception handler types"
                    );
                }
                if self.config().aot_compiler {
                    klass.set_status(ClassStatus::RetryVerificationAtRuntime);
                } else {
                    klass.set_status(ClassStatus::Verified);
                }
                Ok(())
            }
            VerifyResult::HardFailure => {
                let error = LinkError::Verify {
                    descriptor: klass.descriptor().to_string(),
                    message: "hard verification failure".into(),
                };
                klass.set_failure(error.clone());
                klass.set_status(ClassStatus::Error);
                Err(error)
            }
        }
    }

    fn ensure_preverified_methods(&self, klass: ClassRef) {
        for method in klass.direct_methods().iter().chain(klass.virtual_methods()) {
            method.add_access_flags(AccessFlags::PREVERIFIED);
        }
    }

    /// Cross-loader signature agreement: every type named in a signature
    /// shared between this class and a supertype from a different loader
    /// must resolve identically in both loaders.
    fn validate_super_class_descriptors(&self, klass: ClassRef) -> LinkResult<()> {
        if let Some(super_class) = klass.super_class() {
            if klass.loader() != super_class.loader() {
                let vtable = klass.vtable();
                for &method in vtable.iter().take(super_class.vtable_len()) {
                    if method.declaring_class() == Some(klass) {
                        self.check_signature_types_agree(klass, super_class, method)?;
                    }
                }
            }
        }
        let iftable = klass.iftable();
        for entry in iftable.entries.iter() {
            if entry.interface.loader() != klass.loader() {
                for &method in entry.methods.iter() {
                    if method.declaring_class() == Some(klass) {
                        self.check_signature_types_agree(klass, entry.interface, method)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_signature_types_agree(
        &self,
        klass: ClassRef,
        other: ClassRef,
        method: MethodRef,
    ) -> LinkResult<()> {
        let signature = method.signature();
        let types = std::iter::once(signature.return_type).chain(signature.parameters.iter().copied());
        for descriptor in types {
            if dexrt_dex::descriptor::primitive_kind(descriptor).is_some() {
                continue;
            }
            let ours = self.find_class(descriptor, self.loader_handle(klass.loader()).as_ref())?;
            let theirs = self.find_class(descriptor, self.loader_handle(other.loader()).as_ref())?;
            if ours != theirs {
                return Err(LinkError::Linkage(format!(
                    "{} resolves {} differently than {} does",
                    klass.pretty(),
                    dexrt_dex::descriptor_to_dot(descriptor),
                    other.pretty()
                )));
            }
        }
        Ok(())
    }
}
