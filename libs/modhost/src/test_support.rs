//! Test utilities for container integration tests.
//!
//! Provides a recording adaptor that captures published events, per-module
//! counting activators, a greedy capability-matching resolver good enough to
//! exercise the container engines, and small scenario builders.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use semver::Version;

use crate::adaptor::{CollisionHook, ContainerAdaptor};
use crate::container::ModuleContainer;
use crate::error::{AdminPermission, ContainerError};
use crate::events::{ContainerEvent, ContainerListener, EventListener, ModuleEvent};
use crate::module::{Module, ModuleActivator, ModuleId};
use crate::resolver::{DeltaWiring, ModuleResolver};
use crate::revision::{
    Capability, HOST_NAMESPACE, ModuleRevision, Requirement, RevisionBuilder,
};
use crate::wiring::{ModuleWire, ModuleWiring};

// ---------------------------------------------------------------------------
// Recording adaptor
// ---------------------------------------------------------------------------

/// Adaptor that records every published event and hands out counting
/// activators.
#[derive(Default)]
pub struct RecordingAdaptor {
    module_events: Mutex<Vec<(ModuleEvent, ModuleId)>>,
    container_events: Mutex<Vec<(ContainerEvent, ModuleId, Option<String>)>>,
    activators: Mutex<HashMap<String, Arc<TestActivator>>>,
    /// `None`: everything is visible. `Some(set)`: only these locations are
    /// visible to any origin.
    visible_locations: Mutex<Option<HashSet<String>>>,
    collision_hook: Mutex<Option<Arc<dyn CollisionHook>>>,
    denied: Mutex<HashSet<AdminPermission>>,
    properties: Mutex<HashMap<String, String>>,
    refreshed_system: AtomicUsize,
}

impl RecordingAdaptor {
    #[must_use]
    pub fn new() -> Self {
        RecordingAdaptor::default()
    }

    /// All module events in publication order.
    #[must_use]
    pub fn module_events(&self) -> Vec<(ModuleEvent, ModuleId)> {
        self.module_events.lock().clone()
    }

    /// Module events for one module, in publication order.
    #[must_use]
    pub fn module_events_for(&self, id: ModuleId) -> Vec<ModuleEvent> {
        self.module_events
            .lock()
            .iter()
            .filter(|(_, m)| *m == id)
            .map(|(e, _)| *e)
            .collect()
    }

    /// All container events in publication order.
    #[must_use]
    pub fn container_events(&self) -> Vec<(ContainerEvent, ModuleId)> {
        self.container_events
            .lock()
            .iter()
            .map(|(e, m, _)| (*e, *m))
            .collect()
    }

    /// How many container `Error` events have been published.
    #[must_use]
    pub fn error_events(&self) -> usize {
        self.container_events
            .lock()
            .iter()
            .filter(|(e, _, _)| *e == ContainerEvent::Error)
            .count()
    }

    /// The counting activator created for the module at `location`.
    #[must_use]
    pub fn activator(&self, location: &str) -> Option<Arc<TestActivator>> {
        self.activators.lock().get(location).cloned()
    }

    /// Restrict visibility to the given locations (for any origin).
    pub fn restrict_visibility(&self, locations: &[&str]) {
        *self.visible_locations.lock() =
            Some(locations.iter().map(|l| (*l).to_owned()).collect());
    }

    pub fn set_collision_hook(&self, hook: Arc<dyn CollisionHook>) {
        *self.collision_hook.lock() = Some(hook);
    }

    pub fn deny_permission(&self, permission: AdminPermission) {
        self.denied.lock().insert(permission);
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties
            .lock()
            .insert(key.to_owned(), value.to_owned());
    }

    /// How often the system-module refresh path signalled completion.
    #[must_use]
    pub fn refreshed_system_count(&self) -> usize {
        self.refreshed_system.load(Ordering::SeqCst)
    }
}

impl ContainerAdaptor for RecordingAdaptor {
    fn publish_module_event(
        &self,
        event: ModuleEvent,
        module: &Arc<Module>,
        _origin: Option<&Arc<Module>>,
    ) {
        tracing::debug!(event = ?event, module = module.id(), "module event");
        self.module_events.lock().push((event, module.id()));
    }

    fn publish_container_event(
        &self,
        event: ContainerEvent,
        module: &Arc<Module>,
        error: Option<&ContainerError>,
        listeners: &[EventListener],
    ) {
        tracing::debug!(event = ?event, module = module.id(), "container event");
        self.container_events
            .lock()
            .push((event, module.id(), error.map(ToString::to_string)));
        for listener in listeners {
            listener.container_event(event, module, error);
        }
    }

    fn collision_hook(&self) -> Option<Arc<dyn CollisionHook>> {
        self.collision_hook.lock().clone()
    }

    fn is_visible(&self, _origin: &Arc<Module>, target: &Arc<Module>) -> bool {
        match &*self.visible_locations.lock() {
            None => true,
            Some(visible) => visible.contains(target.location()),
        }
    }

    fn get_property(&self, key: &str) -> Option<String> {
        self.properties.lock().get(key).cloned()
    }

    fn check_permission(&self, _module: &Arc<Module>, permission: AdminPermission) -> bool {
        !self.denied.lock().contains(&permission)
    }

    fn create_activator(&self, location: &str, _id: ModuleId) -> Box<dyn ModuleActivator> {
        let activator = Arc::new(TestActivator::default());
        self.activators
            .lock()
            .insert(location.to_owned(), Arc::clone(&activator));
        Box::new(SharedActivator(activator))
    }

    fn refreshed_system_module(&self) {
        self.refreshed_system.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Activators and listeners
// ---------------------------------------------------------------------------

/// Counting activator; can be told to fail its next transitions.
#[derive(Default)]
pub struct TestActivator {
    started: AtomicUsize,
    stopped: AtomicUsize,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

impl TestActivator {
    #[must_use]
    pub fn starts(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }
}

struct SharedActivator(Arc<TestActivator>);

impl ModuleActivator for SharedActivator {
    fn start(&self) -> anyhow::Result<()> {
        if self.0.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("activator start failure (requested by test)");
        }
        self.0.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        if self.0.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("activator stop failure (requested by test)");
        }
        self.0.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Listener recording the container events delivered to it.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(ContainerEvent, ModuleId, Option<String>)>>,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<(ContainerEvent, ModuleId, Option<String>)> {
        self.events.lock().clone()
    }
}

impl ContainerListener for RecordingListener {
    fn container_event(
        &self,
        event: ContainerEvent,
        module: &Arc<Module>,
        error: Option<&ContainerError>,
    ) {
        self.events
            .lock()
            .push((event, module.id(), error.map(ToString::to_string)));
    }
}

// ---------------------------------------------------------------------------
// Simple resolver
// ---------------------------------------------------------------------------

/// Greedy capability matcher.
///
/// Good enough to drive the container engines in tests: package and host
/// requirements are matched by attribute equality against wired current
/// revisions and the candidates of the same round, preferring providers with
/// the lowest module id. Fragment revisions only receive their `host` wire;
/// their remaining requirements are not merged into the host.
pub struct SimpleResolver;

impl SimpleResolver {
    fn wired_provider(
        requirement: &Requirement,
        wirings: &DeltaWiring,
    ) -> Option<(Arc<ModuleRevision>, Capability)> {
        let mut best: Option<(Arc<ModuleRevision>, Capability)> = None;
        for wiring in wirings.values() {
            if !wiring.is_current() {
                continue;
            }
            for capability in wiring.capabilities() {
                if requirement.matches(&capability) {
                    let revision = Arc::clone(wiring.revision());
                    let better = best
                        .as_ref()
                        .is_none_or(|(b, _)| revision.module().id() < b.module().id());
                    if better {
                        best = Some((revision, capability));
                    }
                }
            }
        }
        best
    }

    fn candidate_provider(
        requirement: &Requirement,
        requirer: &Arc<ModuleRevision>,
        candidates: &[Arc<ModuleRevision>],
    ) -> Option<(Arc<ModuleRevision>, Capability)> {
        let mut best: Option<(Arc<ModuleRevision>, Capability)> = None;
        for candidate in candidates {
            if candidate.id() == requirer.id() {
                continue;
            }
            for capability in candidate.capabilities() {
                if requirement.matches(capability) {
                    let better = best
                        .as_ref()
                        .is_none_or(|(b, _)| candidate.module().id() < b.module().id());
                    if better {
                        best = Some((Arc::clone(candidate), capability.clone()));
                    }
                }
            }
        }
        best
    }

    fn provider_for(
        requirement: &Requirement,
        requirer: &Arc<ModuleRevision>,
        candidates: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
    ) -> Option<(Arc<ModuleRevision>, Capability)> {
        Self::wired_provider(requirement, wirings)
            .or_else(|| Self::candidate_provider(requirement, requirer, candidates))
    }

    fn wired_requirements(revision: &ModuleRevision) -> Vec<Requirement> {
        revision
            .requirements()
            .iter()
            .filter(|r| {
                if revision.is_fragment() {
                    r.namespace == HOST_NAMESPACE
                } else {
                    !r.is_dynamic()
                }
            })
            .cloned()
            .collect()
    }

    fn satisfiable(
        revision: &Arc<ModuleRevision>,
        candidates: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
    ) -> bool {
        Self::wired_requirements(revision).iter().all(|req| {
            req.is_optional()
                || Self::provider_for(req, revision, candidates, wirings).is_some()
        })
    }

    /// Clone an existing wiring's content into a fresh delta entry so the
    /// container can fold it back in place.
    fn delta_copy(existing: &ModuleWiring) -> Arc<ModuleWiring> {
        ModuleWiring::new(
            Arc::clone(existing.revision()),
            existing.capabilities(),
            existing.requirements(),
            existing.provided_wires(),
            existing.required_wires(),
        )
    }
}

impl ModuleResolver for SimpleResolver {
    fn resolve_delta(
        &self,
        triggers: &[Arc<ModuleRevision>],
        triggers_mandatory: bool,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
        _db: &crate::database::ModuleDatabase,
    ) -> anyhow::Result<DeltaWiring> {
        let mut placed: Vec<Arc<ModuleRevision>> = unresolved.to_vec();
        placed.sort_by_key(|r| r.module().id());
        placed.dedup_by_key(|r| r.id());

        // Drop candidates until every survivor's mandatory requirements are
        // satisfiable within the round.
        loop {
            let snapshot = placed.clone();
            let before = placed.len();
            placed.retain(|rev| Self::satisfiable(rev, &snapshot, wirings));
            if placed.len() == before {
                break;
            }
        }

        if triggers_mandatory {
            for trigger in triggers {
                let resolved = wirings.contains_key(&trigger.id())
                    || placed.iter().any(|r| r.id() == trigger.id());
                if !resolved {
                    anyhow::bail!(
                        "unable to resolve mandatory module '{}'",
                        trigger.symbolic_name()
                    );
                }
            }
        }

        let mut delta = DeltaWiring::new();
        for revision in &placed {
            delta.insert(
                revision.id(),
                ModuleWiring::new(
                    Arc::clone(revision),
                    revision.capabilities().to_vec(),
                    revision.requirements().to_vec(),
                    Vec::new(),
                    Vec::new(),
                ),
            );
        }
        for revision in &placed {
            for requirement in Self::wired_requirements(revision) {
                let Some((provider, capability)) =
                    Self::provider_for(&requirement, revision, &placed, wirings)
                else {
                    continue; // optional and unmatched
                };
                let wire = ModuleWire::new(
                    Arc::clone(revision),
                    requirement,
                    Arc::clone(&provider),
                    capability,
                );
                if let Some(requirer_wiring) = delta.get(&revision.id()) {
                    requirer_wiring.add_required_wire(Arc::clone(&wire));
                }
                if let Some(provider_wiring) = delta.get(&provider.id()) {
                    provider_wiring.add_provided_wire(wire);
                } else if let Some(existing) = wirings.get(&provider.id()) {
                    let copy = Self::delta_copy(existing);
                    copy.add_provided_wire(wire);
                    delta.insert(provider.id(), copy);
                }
            }
        }
        Ok(delta)
    }

    fn resolve_dynamic_delta(
        &self,
        requirement: &Requirement,
        revision: &Arc<ModuleRevision>,
        _unresolved: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
        _db: &crate::database::ModuleDatabase,
    ) -> anyhow::Result<DeltaWiring> {
        let mut delta = DeltaWiring::new();
        let Some(existing) = wirings.get(&revision.id()) else {
            return Ok(delta);
        };
        let provider = {
            let mut best: Option<(Arc<ModuleRevision>, Capability)> = None;
            for wiring in wirings.values() {
                if !wiring.is_current() || wiring.revision().id() == revision.id() {
                    continue;
                }
                for capability in wiring.capabilities() {
                    if requirement.matches(&capability) {
                        let rev = Arc::clone(wiring.revision());
                        let better = best
                            .as_ref()
                            .is_none_or(|(b, _)| rev.module().id() < b.module().id());
                        if better {
                            best = Some((rev, capability));
                        }
                    }
                }
            }
            best
        };
        let Some((provider, capability)) = provider else {
            return Ok(delta);
        };

        let fresh = Self::delta_copy(existing);
        let wire = ModuleWire::new(
            Arc::clone(revision),
            requirement.clone(),
            Arc::clone(&provider),
            capability,
        );
        fresh.add_required_wire(Arc::clone(&wire));
        delta.insert(revision.id(), fresh);

        if let Some(provider_existing) = wirings.get(&provider.id()) {
            let provider_fresh = Self::delta_copy(provider_existing);
            provider_fresh.add_provided_wire(wire);
            delta.insert(provider.id(), provider_fresh);
        }
        Ok(delta)
    }
}

// ---------------------------------------------------------------------------
// Scenario builders
// ---------------------------------------------------------------------------

/// A fresh, opened container with a resolved-on-demand system module, a
/// [`SimpleResolver`], and a [`RecordingAdaptor`].
#[must_use]
pub fn test_container() -> (Arc<ModuleContainer>, Arc<RecordingAdaptor>) {
    test_container_with_system(
        RevisionBuilder::new()
            .symbolic_name("system.module")
            .version(Version::new(1, 0, 0))
            .capability(Capability::host("system.module")),
    )
}

/// Same as [`test_container`], with a caller-supplied system module
/// revision.
#[must_use]
pub fn test_container_with_system(
    system: RevisionBuilder,
) -> (Arc<ModuleContainer>, Arc<RecordingAdaptor>) {
    let adaptor = Arc::new(RecordingAdaptor::new());
    let container = ModuleContainer::new(
        Arc::clone(&adaptor) as Arc<dyn ContainerAdaptor>,
        Arc::new(SimpleResolver),
    );
    container.install_system_module(system, None);
    container.open().expect("open a fresh container");
    (container, adaptor)
}

/// Poll `cond` until it holds, panicking after five seconds.
///
/// # Panics
/// When the condition does not hold within the deadline.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !cond() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

/// Queue a start-level ramp and block until its `StartLevel` event lands.
pub fn ramp_and_wait(container: &Arc<ModuleContainer>, target: u32) {
    let listener = RecordingListener::new();
    container
        .start_level()
        .activate(target, vec![Arc::clone(&listener) as EventListener])
        .expect("queue a start-level ramp");
    wait_for("start-level ramp", || {
        listener
            .events()
            .iter()
            .any(|(event, _, _)| *event == ContainerEvent::StartLevel)
    });
}

/// Builder for a plain module exporting `provides` and importing `requires`.
#[must_use]
pub fn pkg_module(name: &str, version: &str, provides: &[&str], requires: &[&str]) -> RevisionBuilder {
    let mut builder = RevisionBuilder::new()
        .symbolic_name(name)
        .version(Version::parse(version).expect("valid test version"))
        .capability(Capability::host(name));
    for pkg in provides {
        builder = builder.capability(Capability::package(pkg));
    }
    for pkg in requires {
        builder = builder.requirement(Requirement::package(pkg));
    }
    builder
}

/// Builder for a fragment attaching to `host`.
#[must_use]
pub fn fragment_module(name: &str, host: &str) -> RevisionBuilder {
    RevisionBuilder::new()
        .symbolic_name(name)
        .version(Version::new(1, 0, 0))
        .fragment()
        .requirement(Requirement::host(host))
}
