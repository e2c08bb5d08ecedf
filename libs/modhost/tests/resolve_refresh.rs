//! Resolve engine, refresh closure, and dynamic package resolution.

use std::sync::Arc;

use semver::Version;

use modhost::test_support::{
    fragment_module, pkg_module, ramp_and_wait, test_container, test_container_with_system,
    wait_for, RecordingListener,
};
use modhost::{
    AdminPermission, Capability, ContainerError, ContainerEvent, EventListener, ModuleEvent,
    Requirement, RevisionBuilder, StartOptions, State, HOST_NAMESPACE, PACKAGE_NAMESPACE,
    SYSTEM_MODULE,
};

#[test]
fn resolve_wires_requirements_to_capabilities() {
    let (container, adaptor) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.b"]), None)
        .unwrap();
    let b = container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.b"], &[]), None)
        .unwrap();

    container.resolve(&[Arc::clone(&a)], true).unwrap();

    assert_eq!(a.state(), State::Resolved);
    assert_eq!(b.state(), State::Resolved);
    for module in [&a, &b] {
        let events = adaptor.module_events_for(module.id());
        assert!(events.contains(&ModuleEvent::Resolved));
    }

    let a_rev = a.current_revision().unwrap();
    let b_rev = b.current_revision().unwrap();
    let a_wiring = container.database().wiring(a_rev.id()).unwrap();
    let package_wire = a_wiring
        .required_wires()
        .into_iter()
        .find(|w| w.capability().namespace == PACKAGE_NAMESPACE)
        .expect("a package wire");
    assert_eq!(package_wire.provider().id(), b_rev.id());
    let b_wiring = container.database().wiring(b_rev.id()).unwrap();
    assert!(
        b_wiring
            .provided_wires()
            .iter()
            .any(|w| w.requirer().id() == a_rev.id())
    );
}

#[test]
fn resolve_is_idempotent_once_done() {
    let (container, adaptor) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &["pkg.a"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    container.resolve(&[], false).unwrap();

    let resolutions = adaptor
        .module_events_for(a.id())
        .into_iter()
        .filter(|e| *e == ModuleEvent::Resolved)
        .count();
    assert_eq!(resolutions, 1);
}

#[test]
fn mandatory_triggers_that_cannot_resolve_fail() {
    let (container, _) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.missing"]), None)
        .unwrap();
    let err = container.resolve(&[Arc::clone(&a)], true).unwrap_err();
    assert!(matches!(err, ContainerError::Resolution { .. }));
    assert_eq!(a.state(), State::Installed);
}

#[test]
fn optional_requirements_do_not_block_resolution() {
    let (container, _) = test_container();
    let a = container
        .install(
            None,
            "loc:a",
            RevisionBuilder::new()
                .symbolic_name("mod.a")
                .version(Version::new(1, 0, 0))
                .requirement(Requirement::package("pkg.missing").optional()),
            None,
        )
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    assert_eq!(a.state(), State::Resolved);
}

#[test]
fn resolve_modules_facade_reports_unresolved_members() {
    let (container, _) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.missing"]), None)
        .unwrap();
    assert!(!container.resolve_modules(Some(&[Arc::clone(&a)])).unwrap());

    container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.missing"], &[]), None)
        .unwrap();
    assert!(container.resolve_modules(None).unwrap());
    assert_eq!(a.state(), State::Resolved);
}

#[test]
fn refresh_unresolves_the_closure_and_restarts_active_triggers() {
    let (container, adaptor) = test_container();
    ramp_and_wait(&container, 1);
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.b"]), None)
        .unwrap();
    let b = container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.b"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    a.start(StartOptions::persistent()).unwrap();
    b.start(StartOptions::persistent()).unwrap();
    container
        .update(&b, pkg_module("mod.b", "1.1.0", &["pkg.b"], &[]), None)
        .unwrap();
    assert!(!container.removal_pending().is_empty());
    let marker = adaptor.module_events().len();

    container.refresh(Some(&[Arc::clone(&b)])).unwrap();

    assert_eq!(a.state(), State::Active);
    assert_eq!(b.state(), State::Active);
    assert!(container.removal_pending().is_empty());
    assert_eq!(b.revisions().all().len(), 1);

    let after: Vec<(ModuleEvent, u64)> = adaptor.module_events().split_off(marker);
    for module in [&a, &b] {
        let events: Vec<ModuleEvent> = after
            .iter()
            .filter(|(_, id)| *id == module.id())
            .map(|(e, _)| *e)
            .collect();
        let unresolved_at = events
            .iter()
            .position(|e| *e == ModuleEvent::Unresolved)
            .expect("an Unresolved event");
        let resolved_at = events
            .iter()
            .position(|e| *e == ModuleEvent::Resolved)
            .expect("a Resolved event");
        let started_at = events
            .iter()
            .position(|e| *e == ModuleEvent::Started)
            .expect("a Started event");
        assert!(unresolved_at < resolved_at && resolved_at < started_at);
    }

    // The dependent was re-wired to the new revision.
    let a_wiring = container
        .database()
        .wiring(a.current_revision().unwrap().id())
        .unwrap();
    assert!(
        a_wiring
            .required_wires()
            .iter()
            .any(|w| w.provider().id() == b.current_revision().unwrap().id())
    );
}

#[test]
fn refresh_without_a_seed_starts_from_removal_pending() {
    let (container, _) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &[], &["pkg.b"]), None)
        .unwrap();
    let b = container
        .install(None, "loc:b", pkg_module("mod.b", "1.0.0", &["pkg.b"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();
    container
        .update(&b, pkg_module("mod.b", "1.1.0", &["pkg.b"], &[]), None)
        .unwrap();
    assert!(!container.removal_pending().is_empty());

    container.refresh(None).unwrap();
    assert!(container.removal_pending().is_empty());
    assert_eq!(a.state(), State::Resolved);
    assert_eq!(b.revisions().all().len(), 1);
}

#[test]
fn dependency_closure_is_monotone_and_closed() {
    let (container, _) = test_container();
    let p = container
        .install(None, "loc:p", pkg_module("mod.p", "1.0.0", &["pkg.p"], &[]), None)
        .unwrap();
    let q = container
        .install(None, "loc:q", pkg_module("mod.q", "1.0.0", &["pkg.q"], &["pkg.p"]), None)
        .unwrap();
    let r = container
        .install(None, "loc:r", pkg_module("mod.r", "1.0.0", &[], &["pkg.q"]), None)
        .unwrap();
    let s = container
        .install(None, "loc:s", pkg_module("mod.s", "1.0.0", &[], &[]), None)
        .unwrap();
    container.resolve(&[], false).unwrap();

    let ids = |modules: &[Arc<modhost::Module>]| -> Vec<u64> {
        let mut ids: Vec<u64> = modules.iter().map(|m| m.id()).collect();
        ids.sort_unstable();
        ids
    };

    let of_p = container.dependency_closure(&[Arc::clone(&p)]);
    assert_eq!(ids(&of_p), vec![p.id(), q.id(), r.id()]);
    let of_q = container.dependency_closure(&[Arc::clone(&q)]);
    assert_eq!(ids(&of_q), vec![q.id(), r.id()]);
    let of_s = container.dependency_closure(&[Arc::clone(&s)]);
    assert_eq!(ids(&of_s), vec![s.id()]);

    let union = container.dependency_closure(&[Arc::clone(&p), Arc::clone(&s)]);
    for id in ids(&of_p).iter().chain(ids(&of_s).iter()) {
        assert!(ids(&union).contains(id));
    }
}

#[test]
fn dynamic_resolution_appends_a_tail_wire() {
    let (container, _) = test_container();
    let d = container
        .install(
            None,
            "loc:d",
            RevisionBuilder::new()
                .symbolic_name("mod.d")
                .version(Version::new(1, 0, 0))
                .capability(Capability::host("mod.d"))
                .requirement(Requirement::dynamic_package("com.dyn.*")),
            None,
        )
        .unwrap();
    let p = container
        .install(None, "loc:p", pkg_module("mod.p", "1.0.0", &["com.dyn.api"], &[]), None)
        .unwrap();
    container.resolve(&[], false).unwrap();
    let d_rev = d.current_revision().unwrap();
    let before = container
        .database()
        .wiring(d_rev.id())
        .unwrap()
        .required_wires()
        .len();

    let wire = container
        .resolve_dynamic("com.dyn.api", &d_rev)
        .unwrap()
        .expect("a dynamic wire");

    assert_eq!(wire.capability().namespace, PACKAGE_NAMESPACE);
    assert_eq!(wire.capability().attribute("package"), Some("com.dyn.api"));
    assert!(Arc::ptr_eq(wire.requirer(), &d_rev));
    assert_eq!(wire.provider().id(), p.current_revision().unwrap().id());

    let live = container
        .database()
        .wiring(d_rev.id())
        .unwrap()
        .required_wires();
    assert_eq!(live.len(), before + 1);
    assert!(Arc::ptr_eq(live.last().unwrap(), &wire));

    // Packages outside the declared pattern are not wired.
    assert!(container.resolve_dynamic("other.pkg", &d_rev).unwrap().is_none());
}

#[test]
fn dynamic_resolution_rejects_fragments_and_unresolved_revisions() {
    let (container, _) = test_container();
    let plain = container
        .install(
            None,
            "loc:plain",
            RevisionBuilder::new()
                .symbolic_name("mod.plain")
                .version(Version::new(1, 0, 0))
                .requirement(Requirement::dynamic_package("*")),
            None,
        )
        .unwrap();
    // Not resolved yet.
    let rev = plain.current_revision().unwrap();
    assert!(container.resolve_dynamic("anything", &rev).unwrap().is_none());

    let host = container
        .install(None, "loc:host", pkg_module("mod.host", "1.0.0", &[], &[]), None)
        .unwrap();
    let fragment = container
        .install(None, "loc:frag", fragment_module("mod.frag", "mod.host"), None)
        .unwrap();
    container.resolve(&[Arc::clone(&fragment)], true).unwrap();
    let frag_rev = fragment.current_revision().unwrap();
    assert!(
        container
            .resolve_dynamic("anything", &frag_rev)
            .unwrap()
            .is_none()
    );
    drop(host);
}

#[test]
fn fragments_attach_to_their_host_and_join_its_closure() {
    let (container, _) = test_container();
    let host = container
        .install(None, "loc:host", pkg_module("mod.host", "1.0.0", &[], &[]), None)
        .unwrap();
    let fragment = container
        .install(None, "loc:frag", fragment_module("mod.frag", "mod.host"), None)
        .unwrap();
    container.resolve(&[Arc::clone(&fragment)], true).unwrap();

    let frag_wiring = container
        .database()
        .wiring(fragment.current_revision().unwrap().id())
        .unwrap();
    let host_wire = frag_wiring
        .required_wires()
        .into_iter()
        .find(|w| w.capability().namespace == HOST_NAMESPACE)
        .expect("a host wire");
    assert_eq!(
        host_wire.provider().id(),
        host.current_revision().unwrap().id()
    );

    let of_host = container.dependency_closure(&[Arc::clone(&host)]);
    assert!(of_host.iter().any(|m| m.id() == fragment.id()));
    let of_fragment = container.dependency_closure(&[Arc::clone(&fragment)]);
    assert!(of_fragment.iter().any(|m| m.id() == host.id()));
}

#[test]
fn refreshing_a_system_hosted_fragment_is_a_no_op() {
    let (container, adaptor) = test_container();
    let fragment = container
        .install(None, "loc:sf", fragment_module("mod.sf", "system.module"), None)
        .unwrap();
    container.resolve(&[Arc::clone(&fragment)], true).unwrap();
    assert_eq!(fragment.state(), State::Resolved);
    let marker = adaptor.module_events().len();

    container.refresh(Some(&[Arc::clone(&fragment)])).unwrap();
    assert_eq!(fragment.state(), State::Resolved);
    let after = adaptor.module_events().split_off(marker);
    assert!(
        after
            .iter()
            .all(|(e, id)| !(*id == fragment.id() && *e == ModuleEvent::Unresolved))
    );
}

#[test]
fn refreshing_a_dependency_of_the_active_system_module_goes_async() {
    let (container, adaptor) = test_container_with_system(
        RevisionBuilder::new()
            .symbolic_name("system.module")
            .version(Version::new(1, 0, 0))
            .capability(Capability::host("system.module"))
            .requirement(Requirement::package("boot.pkg")),
    );
    ramp_and_wait(&container, 1);
    let boot = container
        .install(None, "loc:boot", pkg_module("mod.boot", "1.0.0", &["boot.pkg"], &[]), None)
        .unwrap();
    let system = container.database().module(SYSTEM_MODULE).unwrap();
    system.start(StartOptions::persistent()).unwrap();
    assert_eq!(system.state(), State::Active);

    container.refresh(Some(&[Arc::clone(&boot)])).unwrap();

    wait_for("the system refresh signal", || {
        adaptor.refreshed_system_count() == 1
    });
    wait_for("the refresh flag to clear", || {
        !container.is_refreshing_system_module()
    });
    assert_eq!(system.state(), State::Resolved);
    // The caller-side refresh did not unresolve anything.
    assert_eq!(boot.state(), State::Resolved);
}

#[test]
fn refresh_modules_facade_notifies_listeners() {
    let (container, _) = test_container();
    let a = container
        .install(None, "loc:a", pkg_module("mod.a", "1.0.0", &["pkg.a"], &[]), None)
        .unwrap();
    container.resolve(&[Arc::clone(&a)], true).unwrap();

    let listener = RecordingListener::new();
    container
        .refresh_modules(
            Some(vec![Arc::clone(&a)]),
            vec![Arc::clone(&listener) as EventListener],
        )
        .unwrap();
    wait_for("the refresh event", || {
        listener
            .events()
            .iter()
            .any(|(e, _, _)| *e == ContainerEvent::Refresh)
    });
    assert_eq!(a.state(), State::Resolved);
}

#[test]
fn wiring_facade_requires_the_resolve_permission() {
    let (container, adaptor) = test_container();
    adaptor.deny_permission(AdminPermission::Resolve);
    let err = container.refresh_modules(None, Vec::new()).unwrap_err();
    assert!(matches!(
        err,
        ContainerError::PermissionDenied(AdminPermission::Resolve)
    ));
    let err = container.resolve_modules(None).unwrap_err();
    assert!(matches!(
        err,
        ContainerError::PermissionDenied(AdminPermission::Resolve)
    ));
}
