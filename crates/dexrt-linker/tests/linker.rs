//! End-to-end scenarios against a bootstrapped linker.
mod common;

use common::*;
use dexrt_dex::DexFileBuilder;
use dexrt_linker::{AotImage, RuntimeConfig, TrampolineSet, VisitRootFlags};
use dexrt_types::{
    AccessFlags, ClassFlags, ClassStatus, EntryPoint, ImtEntry, InvokeKind, LinkError, LoaderId,
    StaticRef, IMT_SIZE, OBJECT_HEADER_SIZE,
};
use std::sync::Arc;

#[test]
fn boot_object_is_initialized() {
    let linker = boot_linker();
    let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
    assert_eq!(object.status(), ClassStatus::Initialized);
    assert!(object.super_class().is_none());
    assert_eq!(object.object_size(), OBJECT_HEADER_SIZE);
    assert!(object.instance_fields().is_empty());

    // Lookup is idempotent on identity.
    let again = linker.find_system_class("Ljava/lang/Object;").unwrap();
    assert_eq!(object, again);
}

#[test]
fn primitive_array_synthesis() {
    let linker = boot_linker();
    let int_array = linker.find_system_class("[I").unwrap();
    let int_class = linker.find_system_class("I").unwrap();
    let object = linker.find_system_class("Ljava/lang/Object;").unwrap();

    assert_eq!(int_array.component_type(), Some(int_class));
    assert_eq!(int_array.super_class(), Some(object));
    assert_eq!(int_array.iftable_len(), 2);
    // All array classes share the one global itable.
    let shared = linker.array_iftable().unwrap();
    assert!(Arc::ptr_eq(&int_array.iftable(), shared));
    let object_array = linker.find_system_class("[Ljava/lang/Object;").unwrap();
    assert!(Arc::ptr_eq(&object_array.iftable(), shared));

    let flags = int_array.access_flags();
    assert!(flags.contains(AccessFlags::PUBLIC | AccessFlags::ABSTRACT | AccessFlags::FINAL));
    assert!(!flags.contains(AccessFlags::INTERFACE));
    assert!(int_array.class_flags().contains(ClassFlags::NO_REFERENCE_FIELDS));
    assert_eq!(int_array.status(), ClassStatus::Initialized);

    // Nested arrays recurse on the component.
    let nested = linker.find_system_class("[[I").unwrap();
    assert_eq!(nested.component_type(), Some(int_array));

    // The array's loader is the component's loader, not the requester's.
    let app = linker.create_class_loader(None, vec![]);
    let via_app = linker.find_class("[I", Some(&app)).unwrap();
    assert_eq!(via_app, int_array);
    assert_eq!(via_app.loader(), LoaderId::BOOT);

    assert!(matches!(
        linker.find_system_class("[V"),
        Err(LinkError::ClassFormat(_))
    ));
}

#[test]
fn missing_class_reports_no_class_def() {
    let linker = boot_linker();
    let app = linker.create_class_loader(None, vec![]);
    let err = linker.find_class("Lfoo/NoSuch;", Some(&app)).unwrap_err();
    match &err {
        LinkError::NoClassDefFound { descriptor, .. } => {
            assert_eq!(descriptor, "Lfoo/NoSuch;");
        }
        other => panic!("expected NoClassDefFound, got {other:?}"),
    }
    assert!(err.to_string().contains("Lfoo/NoSuch;"));
}

#[test]
fn erroneous_class_replays_its_failure() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Broken;")
        .access_flags(ACC_PUBLIC)
        .super_class("La/Missing;")
        .finish();
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex]);

    let first = linker.find_class("La/Broken;", Some(&app)).unwrap_err();
    assert!(matches!(first, LinkError::NoClassDefFound { .. }));

    // The class stays in the table in Error status; a stored
    // NoClassDefFound replays as the generic earlier-failure error.
    let second = linker.find_class("La/Broken;", Some(&app)).unwrap_err();
    assert!(matches!(second, LinkError::EarlierFailure(ref d) if d == "La/Broken;"));
}

#[test]
fn instance_field_layout_through_the_full_pipeline() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Mixed;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .instance_field("l", "J", ACC_PUBLIC)
        .instance_field("b", "B", ACC_PUBLIC)
        .instance_field("r", "Ljava/lang/Object;", ACC_PUBLIC)
        .instance_field("i", "I", ACC_PUBLIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let class = linker.find_class("La/Mixed;", Some(&app)).unwrap();

    let offset = |name: &str| {
        class
            .instance_fields()
            .iter()
            .find(|f| f.name() == name)
            .unwrap()
            .offset()
    };
    assert_eq!(offset("r"), 8);
    assert_eq!(offset("l"), 16);
    assert_eq!(offset("i"), 24);
    assert_eq!(offset("b"), 28);
    assert_eq!(class.object_size(), 32);
    assert_eq!(class.reference_instance_offsets(), 0b1);
    let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
    assert!(class.object_size() >= object.object_size());
    // The super was fully linked before this class advanced past Loaded.
    assert!(object.status() >= ClassStatus::Resolved);
}

#[test]
fn virtual_methods_override_super_slots() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Base;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .virtual_method("foo", "I", &[], ACC_PUBLIC)
        .virtual_method("locked", "V", &[], ACC_PUBLIC | ACC_FINAL)
        .finish();
    b.class("La/Derived;")
        .access_flags(ACC_PUBLIC)
        .super_class("La/Base;")
        .virtual_method("foo", "I", &[], ACC_PUBLIC)
        .virtual_method("bar", "V", &[], ACC_PUBLIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);

    let base = linker.find_class("La/Base;", Some(&app)).unwrap();
    let derived = linker.find_class("La/Derived;", Some(&app)).unwrap();

    // Same slot, new implementation; new methods append.
    assert_eq!(derived.vtable_len(), base.vtable_len() + 1);
    let foo = derived
        .find_declared_virtual_method("foo", &base.virtual_methods()[0].signature())
        .unwrap();
    let slot = foo.method_index() as usize;
    assert!(slot < base.vtable_len());
    assert_eq!(derived.vtable()[slot], foo);
    assert_eq!(base.vtable()[slot].declaring_class(), Some(base));
}

#[test]
fn overriding_a_final_method_is_a_linkage_error() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Base;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .virtual_method("locked", "V", &[], ACC_PUBLIC | ACC_FINAL)
        .finish();
    b.class("La/Bad;")
        .access_flags(ACC_PUBLIC)
        .super_class("La/Base;")
        .virtual_method("locked", "V", &[], ACC_PUBLIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    assert!(matches!(
        linker.find_class("La/Bad;", Some(&app)),
        Err(LinkError::Linkage(_))
    ));
}

#[test]
fn extending_a_final_class_is_an_incompatible_change() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Bad;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/String;")
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    assert!(matches!(
        linker.find_class("La/Bad;", Some(&app)),
        Err(LinkError::IncompatibleClassChange(_))
    ));
}

#[test]
fn interface_table_orders_super_interfaces_first() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/J;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("j", "V", &[], ACC_PUBLIC | ACC_ABSTRACT)
        .finish();
    b.class("La/I;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .interface("La/J;")
        .virtual_method("i", "V", &[], ACC_PUBLIC | ACC_ABSTRACT)
        .finish();
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .interface("La/I;")
        .virtual_method("i", "V", &[], ACC_PUBLIC)
        .virtual_method("j", "V", &[], ACC_PUBLIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    let i = linker.find_class("La/I;", Some(&app)).unwrap();
    let j = linker.find_class("La/J;", Some(&app)).unwrap();

    let iftable = c.iftable();
    let positions: Vec<usize> = [j, i]
        .iter()
        .map(|iface| {
            let hits: Vec<usize> = iftable
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.interface == *iface)
                .map(|(k, _)| k)
                .collect();
            assert_eq!(hits.len(), 1, "interface appears exactly once");
            hits[0]
        })
        .collect();
    // J is a super-interface of I and must precede it.
    assert!(positions[0] < positions[1]);
}

#[test]
fn unimplemented_interface_methods_get_mirandas() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/I;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC | ACC_ABSTRACT)
        .finish();
    b.class("La/A;")
        .access_flags(ACC_PUBLIC | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .interface("La/I;")
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let a = linker.find_class("La/A;", Some(&app)).unwrap();

    let miranda: Vec<_> = a.virtual_methods().iter().filter(|m| m.is_miranda()).collect();
    assert_eq!(miranda.len(), 1);
    assert_eq!(miranda[0].name(), "m");
    assert!(miranda[0].is_abstract());
    // The miranda landed in the vtable and the itable points at it.
    let idx = miranda[0].method_index() as usize;
    assert_eq!(a.vtable()[idx].name(), "m");
    let iftable = a.iftable();
    let entry = iftable.entries.iter().find(|e| e.interface.descriptor() == "La/I;").unwrap();
    assert!(entry.methods[0].is_miranda());
}

#[test]
fn default_methods_are_copied_into_implementors() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/I;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .interface("La/I;")
        .finish();
    let m_idx = b.method("La/C;", "m", "I", &[]);
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);

    let i = linker.find_class("La/I;", Some(&app)).unwrap();
    assert!(i.has_default_methods());
    let c = linker.find_class("La/C;", Some(&app)).unwrap();

    let copy = c.virtual_methods().iter().find(|m| m.name() == "m").unwrap();
    assert!(copy.is_default());
    assert_eq!(copy.declaring_class(), Some(c));

    // Virtual resolution reaches the copy and it is invokable.
    let dex_cache = linker.find_dex_cache(&dex).unwrap();
    let resolved = linker
        .resolve_method(dex_cache, m_idx, app.id(), Some(c), InvokeKind::Virtual)
        .unwrap();
    assert!(resolved.is_default());
    linker.ensure_invokable(resolved).unwrap();
}

#[test]
fn conflicting_defaults_fail_lazily_at_dispatch() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/I1;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    b.class("La/I2;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .interface("La/I1;")
        .interface("La/I2;")
        .finish();
    let m_idx = b.method("La/C;", "m", "I", &[]);
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);

    // Definition and initialization both succeed; the conflict is latent.
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    assert!(linker.ensure_initialized(c, true, true).unwrap());

    let dex_cache = linker.find_dex_cache(&dex).unwrap();
    let resolved = linker
        .resolve_method(dex_cache, m_idx, app.id(), Some(c), InvokeKind::Virtual)
        .unwrap();
    assert!(resolved.is_default_conflicting());
    assert!(matches!(
        linker.ensure_invokable(resolved),
        Err(LinkError::IncompatibleClassChange(_))
    ));
}

#[test]
fn imt_slots_fill_and_collide() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    // 65 default methods: with consecutive method ids, exactly one IMT
    // slot double-hits and degrades to the conflict sentinel.
    let mut iface = b.class("La/Big;").access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT);
    iface = iface.super_class("Ljava/lang/Object;");
    for k in 0..=IMT_SIZE {
        iface = iface.virtual_method(&format!("m{k}"), "I", &[], ACC_PUBLIC);
    }
    iface.finish();
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .interface("La/Big;")
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    let big = linker.find_class("La/Big;", Some(&app)).unwrap();

    let imt = c.imt().expect("instantiable class carries an IMT");
    assert_eq!(imt.len(), IMT_SIZE);

    let first = &big.virtual_methods()[0];
    let last = &big.virtual_methods()[IMT_SIZE];
    let collision_slot = first.dex_method_index().as_usize() % IMT_SIZE;
    assert_eq!(last.dex_method_index().as_usize() % IMT_SIZE, collision_slot);
    assert_eq!(imt[collision_slot], ImtEntry::Conflict);

    let second = &big.virtual_methods()[1];
    match imt[second.dex_method_index().as_usize() % IMT_SIZE] {
        ImtEntry::Method(m) => {
            assert_eq!(m.name(), "m1");
            assert_eq!(m.declaring_class(), Some(c));
        }
        other => panic!("expected a method entry, got {other:?}"),
    }
}

#[test]
fn static_constants_decode_on_initialization() {
    use dexrt_dex::EncodedValue;
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    let greeting = b.string("hello");
    b.class("La/S;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .static_field("answer", "I", ACC_PUBLIC | ACC_STATIC | ACC_FINAL)
        .static_field("big", "J", ACC_PUBLIC | ACC_STATIC | ACC_FINAL)
        .static_field("greeting", "Ljava/lang/String;", ACC_PUBLIC | ACC_STATIC | ACC_FINAL)
        .static_value(EncodedValue::Int(42))
        .static_value(EncodedValue::Long(-7))
        .static_value(EncodedValue::String(greeting))
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let class = linker.find_class("La/S;", Some(&app)).unwrap();
    assert!(linker.ensure_initialized(class, true, true).unwrap());

    let field = |name: &str| {
        class
            .static_fields()
            .iter()
            .find(|f| f.name() == name)
            .unwrap()
            .offset()
    };
    let statics = class.statics();
    let storage = statics.as_ref().unwrap();
    assert_eq!(storage.get_i32(field("answer")), 42);
    assert_eq!(storage.get_i64(field("big")), -7);
    assert_eq!(storage.get_reference(field("greeting")), StaticRef::String("hello"));
}

#[test]
fn static_trampolines_are_fixed_up_after_init() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/S;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .direct_method("helper", "V", &[], ACC_PUBLIC | ACC_STATIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let class = linker.find_class("La/S;", Some(&app)).unwrap();

    let helper = &class.direct_methods()[0];
    assert_eq!(helper.entry_point(), EntryPoint::ResolutionTrampoline);

    assert!(linker.ensure_initialized(class, true, true).unwrap());
    assert_eq!(helper.entry_point(), EntryPoint::InterpreterBridge);
}

#[test]
fn supertypes_are_initialized_with_the_class() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/I;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("m", "I", &[], ACC_PUBLIC)
        .finish();
    b.class("La/Base;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .finish();
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("La/Base;")
        .interface("La/I;")
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();
    assert!(linker.ensure_initialized(c, true, true).unwrap());

    let base = linker.find_class("La/Base;", Some(&app)).unwrap();
    let i = linker.find_class("La/I;", Some(&app)).unwrap();
    assert_eq!(base.status(), ClassStatus::Initialized);
    // Direct superinterfaces with defaults initialize alongside.
    assert_eq!(i.status(), ClassStatus::Initialized);
    assert!(i.class_flags().contains(ClassFlags::RECURSIVELY_INITIALIZED));
}

#[test]
fn temp_classes_are_retired_and_replaced() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .instance_field("x", "I", ACC_PUBLIC)
        .virtual_method("foo", "I", &[], ACC_PUBLIC)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let retired_before = linker.stats().snapshot().classes_retired;
    let c = linker.find_class("La/C;", Some(&app)).unwrap();

    assert!(!c.is_temp());
    assert_eq!(linker.stats().snapshot().classes_retired, retired_before + 1);
    // The table holds exactly the final class.
    assert_eq!(linker.lookup_class("La/C;", c.hash(), app.id()), Some(c));
    // Member back-pointers were rewritten to the final class.
    for method in c.virtual_methods() {
        assert_eq!(method.declaring_class(), Some(c));
    }
    for field in c.instance_fields() {
        assert_eq!(field.declaring_class(), Some(c));
    }
}

#[test]
fn proxy_classes_forward_through_the_invoke_handler() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/I;")
        .access_flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
        .super_class("Ljava/lang/Object;")
        .virtual_method("ping", "I", &[], ACC_PUBLIC | ACC_ABSTRACT)
        .virtual_method("pong", "V", &["I"], ACC_PUBLIC | ACC_ABSTRACT)
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let i = linker.find_class("La/I;", Some(&app)).unwrap();

    let prototypes: Vec<_> = i
        .virtual_methods()
        .iter()
        .map(dexrt_types::MethodRef::from_ref)
        .collect();
    let throws = vec![Vec::new(), Vec::new()];
    let proxy = linker
        .create_proxy_class("L$Proxy0;", Some(&app), &[i], &prototypes, &throws)
        .unwrap();

    assert!(proxy.is_proxy());
    assert!(proxy.is_resolved());
    let parent = linker.find_system_class("Ljava/lang/reflect/Proxy;").unwrap();
    assert_eq!(proxy.super_class(), Some(parent));

    // One constructor, copied from the parent.
    assert_eq!(proxy.direct_methods().len(), 1);
    assert!(proxy.direct_methods()[0].is_constructor());

    // Virtual methods are prototype clones behind the proxy handler.
    for (method, prototype) in proxy.virtual_methods().iter().zip(&prototypes) {
        assert_eq!(method.entry_point(), EntryPoint::ProxyInvoke);
        assert_eq!(method.name(), prototype.name());
        assert!(method.is_final());
        assert_eq!(method.declaring_class(), Some(proxy));
    }

    // The two synthesized statics come in fixed order.
    let sfields = proxy.static_fields();
    assert_eq!(sfields.len(), 2);
    assert_eq!(sfields[0].name(), "interfaces");
    assert_eq!(sfields[1].name(), "throws");
    assert!(sfields[0].offset() < sfields[1].offset());

    // Interface dispatch rows point at the proxy's clones.
    let iftable = proxy.iftable();
    let row = iftable.entries.iter().find(|e| e.interface == i).unwrap();
    for method in &row.methods {
        assert_eq!(method.declaring_class(), Some(proxy));
    }
}

#[test]
fn image_adoption_skips_relinking() {
    let source = boot_linker();
    // Touch a few classes so the image has content beyond the roots.
    source.find_system_class("[I").unwrap();
    let image = AotImage::capture(&source, TrampolineSet::default());

    let adopted = dexrt_linker::ClassLinker::with_defaults(RuntimeConfig::default());
    adopted.init_from_image(&image, true).unwrap();
    assert!(adopted.init_done());
    assert_eq!(adopted.trampolines(), Some(TrampolineSet::default()));

    // Identity is preserved: the adopted runtime sees the image's classes.
    let object_a = source.find_system_class("Ljava/lang/Object;").unwrap();
    let object_b = adopted.find_system_class("Ljava/lang/Object;").unwrap();
    assert_eq!(object_a, object_b);

    // New work still happens locally.
    let array = adopted.find_system_class("[J").unwrap();
    assert_eq!(array.status(), ClassStatus::Initialized);
}

#[test]
fn interpret_only_runtimes_reset_image_entrypoints() {
    let source = boot_linker();
    let image = AotImage::capture(&source, TrampolineSet::default());

    let adopted = dexrt_linker::ClassLinker::with_defaults(RuntimeConfig {
        interpret_only: true,
        ..RuntimeConfig::default()
    });
    adopted.init_from_image(&image, false).unwrap();
    for &method in &image.methods {
        assert_eq!(method.entry_point(), EntryPoint::InterpreterBridge);
    }
}

#[test]
fn root_visiting_sees_boot_classes_and_logs_new_ones() {
    let linker = boot_linker();
    let object = linker.find_system_class("Ljava/lang/Object;").unwrap();

    let mut seen = Vec::new();
    linker.visit_roots(&mut |c| seen.push(c), VisitRootFlags::ALL_ROOTS);
    assert!(seen.contains(&object));

    linker.visit_roots(&mut |_| {}, VisitRootFlags::START_LOGGING_NEW);
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/Fresh;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .finish();
    let app = linker.create_class_loader(None, vec![b.build()]);
    let fresh = linker.find_class("La/Fresh;", Some(&app)).unwrap();

    let mut new_roots = Vec::new();
    linker.visit_roots(&mut |c| new_roots.push(c), VisitRootFlags::NEW_ROOTS);
    assert!(new_roots.contains(&fresh));
    assert!(!new_roots.contains(&object));

    linker.visit_roots(
        &mut |_| {},
        VisitRootFlags::CLEAR_LOG | VisitRootFlags::STOP_LOGGING_NEW,
    );
    let mut after_clear = Vec::new();
    linker.visit_roots(&mut |c| after_clear.push(c), VisitRootFlags::NEW_ROOTS);
    assert!(after_clear.is_empty());
}

#[test]
fn dead_class_loaders_are_torn_down() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .finish();
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);
    let id = app.id();
    linker.find_class("La/C;", Some(&app)).unwrap();
    assert!(linker.class_table_stats(id).is_some());

    assert_eq!(linker.cleanup_class_loaders(), 0);
    drop(app);
    assert_eq!(linker.cleanup_class_loaders(), 1);
    assert!(linker.class_table_stats(id).is_none());
}

#[test]
fn frozen_tables_keep_counting_correctly() {
    let linker = boot_linker();
    let (zygote_before, live_before) = linker.class_table_stats(LoaderId::BOOT).unwrap();
    assert_eq!(zygote_before, 0);
    assert!(live_before > 0);

    linker.move_class_tables_to_pre_zygote();
    let (zygote, live) = linker.class_table_stats(LoaderId::BOOT).unwrap();
    assert_eq!(zygote, live_before);
    assert_eq!(live, 0);

    linker.find_system_class("[[S").unwrap();
    let (zygote_after, live_after) = linker.class_table_stats(LoaderId::BOOT).unwrap();
    assert_eq!(zygote_after, zygote);
    assert_eq!(live_after, 1);

    // Frozen entries are still found.
    linker.find_system_class("Ljava/lang/String;").unwrap();
}

#[test]
fn invoke_kind_mismatches_are_incompatible_changes() {
    let linker = boot_linker();
    let mut b = DexFileBuilder::new("app.dex");
    b.class("La/C;")
        .access_flags(ACC_PUBLIC)
        .super_class("Ljava/lang/Object;")
        .direct_method("s", "V", &[], ACC_PUBLIC | ACC_STATIC)
        .finish();
    let s_idx = b.method("La/C;", "s", "V", &[]);
    let dex = b.build();
    let app = linker.create_class_loader(None, vec![dex.clone()]);
    let c = linker.find_class("La/C;", Some(&app)).unwrap();

    let dex_cache = linker.find_dex_cache(&dex).unwrap();
    assert!(linker
        .resolve_method(dex_cache, s_idx, app.id(), Some(c), InvokeKind::Static)
        .is_ok());
    assert!(matches!(
        linker.resolve_method(dex_cache, s_idx, app.id(), Some(c), InvokeKind::Direct),
        Err(LinkError::IncompatibleClassChange(_))
    ));
}
