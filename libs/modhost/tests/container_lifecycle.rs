//! Install/update/uninstall admission control and lifecycle scenarios.

use std::sync::Arc;

use semver::Version;

use modhost::test_support::{pkg_module, ramp_and_wait, test_container};
use modhost::{
    AdminPermission, CollisionHook, CollisionMode, ContainerError, Module, ModuleEvent,
    StartOptions, State, SYSTEM_MODULE,
};

#[test]
fn install_at_the_same_location_returns_the_existing_module() {
    let (container, adaptor) = test_container();
    let first = container
        .install(None, "file:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();
    let second = container
        .install(None, "file:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let installs = adaptor
        .module_events()
        .iter()
        .filter(|(e, m)| *e == ModuleEvent::Installed && *m == first.id())
        .count();
    assert_eq!(installs, 1, "no Installed event for the second call");
}

#[test]
fn duplicate_identity_at_a_new_location_is_rejected() {
    let (container, _) = test_container();
    let origin = container
        .install(None, "file:origin", pkg_module("mod.origin", "1.0.0", &[], &[]), None)
        .unwrap();
    container
        .install(None, "file:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();

    let err = container
        .install(
            Some(&origin),
            "file:b",
            pkg_module("mod.a", "1.0.0", &[], &[]),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ContainerError::DuplicateModule { name, .. } if name == "mod.a"));
}

#[test]
fn collision_hook_may_clear_the_candidates() {
    struct AllowEverything;
    impl CollisionHook for AllowEverything {
        fn filter_collisions(
            &self,
            mode: CollisionMode,
            _target: &Arc<Module>,
            candidates: &mut Vec<Arc<Module>>,
        ) {
            assert_eq!(mode, CollisionMode::Installing);
            candidates.clear();
        }
    }

    let (container, adaptor) = test_container();
    adaptor.set_collision_hook(Arc::new(AllowEverything));
    let origin = container
        .install(None, "file:origin", pkg_module("mod.origin", "1.0.0", &[], &[]), None)
        .unwrap();
    let first = container
        .install(None, "file:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();
    let second = container
        .install(
            Some(&origin),
            "file:b",
            pkg_module("mod.a", "1.0.0", &[], &[]),
            None,
        )
        .unwrap();
    assert_ne!(first.id(), second.id());
}

#[test]
fn existing_module_invisible_to_the_origin_is_rejected() {
    let (container, adaptor) = test_container();
    let origin = container
        .install(None, "file:origin", pkg_module("mod.origin", "1.0.0", &[], &[]), None)
        .unwrap();
    container
        .install(None, "file:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();

    adaptor.restrict_visibility(&["file:origin"]);
    let err = container
        .install(
            Some(&origin),
            "file:a",
            pkg_module("mod.a", "1.0.0", &[], &[]),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, ContainerError::RejectedByHook { .. }));
}

#[test]
fn update_of_an_active_module_stops_updates_and_resumes() {
    let (container, adaptor) = test_container();
    ramp_and_wait(&container, 1);
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.b"]), None)
        .unwrap();
    let b = container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.b"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    b.start(StartOptions::persistent()).unwrap();
    assert_eq!(b.state(), State::Active);
    let old_revision = b.current_revision().unwrap();

    container
        .update(&b, pkg_module("mod.b", "1.1.0", &["pkg.b"], &[]), None)
        .unwrap();

    assert_eq!(b.state(), State::Active, "transiently resumed");
    assert_eq!(b.version().unwrap(), Version::parse("1.1.0").unwrap());
    let events = adaptor.module_events_for(b.id());
    assert!(
        events.ends_with(&[
            ModuleEvent::Stopped,
            ModuleEvent::Unresolved,
            ModuleEvent::Updated,
            ModuleEvent::Resolved,
            ModuleEvent::Started,
        ]),
        "unexpected event tail: {events:?}"
    );

    // The old revision stays removal-pending, and the dependent keeps its
    // wire to it until a refresh.
    let pending = container.removal_pending();
    assert!(pending.iter().any(|r| r.id() == old_revision.id()));
    let a_wiring = container
        .database()
        .wiring(a.current_revision().unwrap().id())
        .unwrap();
    assert!(
        a_wiring
            .required_wires()
            .iter()
            .any(|w| w.provider().id() == old_revision.id())
    );
}

#[test]
fn a_failing_stop_terminates_the_update() {
    let (container, adaptor) = test_container();
    ramp_and_wait(&container, 1);
    let b = container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.b"], &[]), None)
        .unwrap();
    b.start(StartOptions::persistent()).unwrap();
    adaptor.activator("loc:b").unwrap().fail_stops(true);

    let err = container
        .update(&b, pkg_module("mod.b", "1.1.0", &["pkg.b"], &[]), None)
        .unwrap_err();
    assert!(matches!(err, ContainerError::Activator(_)));
    assert_eq!(b.version().unwrap(), Version::parse("1.0.0").unwrap());
    assert_eq!(b.state(), State::Resolved);
}

#[test]
fn uninstall_publishes_the_transition_chain_and_frees_the_location() {
    let (container, adaptor) = test_container();
    ramp_and_wait(&container, 1);
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &["pkg.a"], &[]), None)
        .unwrap();
    a.start(StartOptions::persistent()).unwrap();

    container.uninstall(&a).unwrap();
    assert_eq!(a.state(), State::Uninstalled);
    assert!(container.database().module_at("loc:a").is_none());
    let events = adaptor.module_events_for(a.id());
    assert!(
        events.ends_with(&[
            ModuleEvent::Stopped,
            ModuleEvent::Unresolved,
            ModuleEvent::Uninstalled,
        ]),
        "unexpected event tail: {events:?}"
    );

    let err = container.uninstall(&a).unwrap_err();
    assert!(matches!(err, ContainerError::Uninstalled { .. }));
}

#[test]
fn refresh_after_uninstall_discards_the_revisions() {
    let (container, _) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &["pkg.a"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    container.uninstall(&a).unwrap();
    assert!(!container.removal_pending().is_empty());

    container.refresh(Some(&[Arc::clone(&a)])).unwrap();
    assert_eq!(a.state(), State::Uninstalled);
    assert!(a.revisions().all().is_empty());
    assert!(container.removal_pending().is_empty());
}

#[test]
fn the_system_module_cannot_be_uninstalled() {
    let (container, _) = test_container();
    let system = container.database().module(SYSTEM_MODULE).unwrap();
    assert!(matches!(
        container.uninstall(&system),
        Err(ContainerError::SystemModule)
    ));
    assert_ne!(system.state(), State::Uninstalled);
}

#[test]
fn lifecycle_operations_require_the_admin_permission() {
    let (container, adaptor) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &[]), None)
        .unwrap();
    adaptor.deny_permission(AdminPermission::Lifecycle);

    let err = container
        .update(&a, pkg_module("mod.a", "1.1.0", &[], &[]), None)
        .unwrap_err();
    assert!(matches!(
        err,
        ContainerError::PermissionDenied(AdminPermission::Lifecycle)
    ));
    let err = container.uninstall(&a).unwrap_err();
    assert!(matches!(
        err,
        ContainerError::PermissionDenied(AdminPermission::Lifecycle)
    ));
    assert_eq!(a.state(), State::Installed);
}

#[test]
fn mutations_advance_the_revisions_timestamp() {
    let (container, _) = test_container();
    let db = container.database();
    let t0 = db.revisions_timestamp();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &["pkg.a"], &[]), None)
        .unwrap();
    let t1 = db.revisions_timestamp();
    assert!(t1 > t0);
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    let t2 = db.revisions_timestamp();
    assert!(t2 > t1);
    container
        .update(&a, pkg_module("mod.a", "1.1.0", &["pkg.a"], &[]), None)
        .unwrap();
    let t3 = db.revisions_timestamp();
    assert!(t3 > t2);
    container.refresh(Some(&[Arc::clone(&a)])).unwrap();
    let t4 = db.revisions_timestamp();
    assert!(t4 > t3);
    container.uninstall(&a).unwrap();
    assert!(db.revisions_timestamp() > t4);

    assert!(modhost::database::location_bijection_holds(db));
}
