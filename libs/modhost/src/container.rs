//! The module container: lifecycle orchestration over the capability graph.
//!
//! Admission control serializes installers through keyed location/name
//! locks. The resolve and refresh engines run optimistically: snapshot under
//! the database read lock, compute with no locks held, then validate the
//! revisions timestamp under the write lock before committing. A stale
//! snapshot retries; the write lock guarantees forward progress.
//!
//! Lock order (never acquire against it): keyed location/name locks, then
//! per-module state-change locks (iteration order forward, reverse for
//! refresh so release matches stop order), then the database read or write
//! lock, then engine-internal monitors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::adaptor::{CollisionMode, ContainerAdaptor};
use crate::database::{DbReadGuard, ModuleDatabase, SortKey};
use crate::dispatcher::Dispatcher;
use crate::error::{AdminPermission, ContainerError};
use crate::events::{ContainerEvent, EventListener, ModuleEvent};
use crate::lockset::LockSet;
use crate::module::{
    Module, ModuleId, STATE_CHANGE_TIMEOUT, SYSTEM_MODULE, StartOptions, State, StopOptions,
    Transition,
};
use crate::resolver::{DeltaWiring, ModuleResolver};
use crate::revision::{
    HOST_NAMESPACE, ModuleRevision, PACKAGE_ATTR, PACKAGE_NAMESPACE, Requirement, RevisionBuilder,
    RevisionInfo,
};
use crate::startlevel::StartLevelEngine;
use crate::wiring::ModuleWire;

/// Location of the system module (id 0).
pub const SYSTEM_MODULE_LOCATION: &str = "modhost.system";

enum ResolveOutcome {
    Done,
    Retry,
}

/// The container core: installs, updates, uninstalls, resolves, refreshes,
/// and start-level-orders a dynamic population of modules.
pub struct ModuleContainer {
    adaptor: Arc<dyn ContainerAdaptor>,
    resolver: Arc<dyn ModuleResolver>,
    db: Arc<ModuleDatabase>,
    location_locks: LockSet<String>,
    name_locks: LockSet<String>,
    start_level: StartLevelEngine,
    refresh_dispatcher: Dispatcher,
    /// Guards the single in-flight asynchronous system-module refresh.
    refreshing_system: Mutex<bool>,
    me: Weak<ModuleContainer>,
}

impl ModuleContainer {
    #[must_use]
    pub fn new(adaptor: Arc<dyn ContainerAdaptor>, resolver: Arc<dyn ModuleResolver>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ModuleContainer>| ModuleContainer {
            adaptor,
            resolver,
            db: Arc::new(ModuleDatabase::new()),
            location_locks: LockSet::new(),
            name_locks: LockSet::new(),
            start_level: StartLevelEngine::new(me.clone()),
            refresh_dispatcher: Dispatcher::new("modhost-refresh"),
            refreshing_system: Mutex::new(false),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn database(&self) -> &Arc<ModuleDatabase> {
        &self.db
    }

    #[must_use]
    pub fn adaptor(&self) -> &Arc<dyn ContainerAdaptor> {
        &self.adaptor
    }

    #[must_use]
    pub fn start_level(&self) -> &StartLevelEngine {
        &self.start_level
    }

    pub(crate) fn publish_error(&self, module: &Arc<Module>, error: &ContainerError) {
        self.adaptor
            .publish_container_event(ContainerEvent::Error, module, Some(error), &[]);
    }

    fn check_admin(&self, permission: AdminPermission) -> Result<(), ContainerError> {
        if let Some(system) = self.db.module(SYSTEM_MODULE) {
            if !self.adaptor.check_permission(&system, permission) {
                return Err(ContainerError::PermissionDenied(permission));
            }
        }
        Ok(())
    }

    // === Admission control ===============================================

    /// Install the system module (id 0) at [`SYSTEM_MODULE_LOCATION`].
    /// Returns the existing module when already installed.
    pub fn install_system_module(
        &self,
        builder: RevisionBuilder,
        info: Option<RevisionInfo>,
    ) -> Arc<Module> {
        if let Some(existing) = self.db.module(SYSTEM_MODULE) {
            return existing;
        }
        self.db.install(
            SYSTEM_MODULE_LOCATION,
            builder,
            info,
            |id| self.adaptor.create_activator(SYSTEM_MODULE_LOCATION, id),
            self.me.clone(),
            true,
        )
    }

    /// Install a module at `location`.
    ///
    /// When a module already occupies the location it is returned as-is
    /// (without invoking the builder's identity against the database and
    /// without an `Installed` event), provided it is visible to `origin`.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when the location or name lock times
    /// out, [`ContainerError::RejectedByHook`] when the existing module is
    /// invisible to `origin`, and [`ContainerError::DuplicateModule`] when a
    /// module with the same `(name, version)` survives the collision hook.
    pub fn install(
        &self,
        origin: Option<&Arc<Module>>,
        location: &str,
        builder: RevisionBuilder,
        info: Option<RevisionInfo>,
    ) -> Result<Arc<Module>, ContainerError> {
        let name = builder.name().map(str::to_owned);
        let Some(_location_lock) = self
            .location_locks
            .lock(location.to_owned(), STATE_CHANGE_TIMEOUT)
        else {
            return Err(ContainerError::StateChange {
                key: location.to_owned(),
            });
        };
        let _name_lock = match &name {
            Some(name) => {
                let Some(guard) = self.name_locks.lock(name.clone(), STATE_CHANGE_TIMEOUT) else {
                    return Err(ContainerError::StateChange { key: name.clone() });
                };
                Some(guard)
            }
            None => None,
        };

        let version = builder.build_version();
        let (existing, mut candidates) = {
            let db = self.db.read();
            let existing = db.module_at(location);
            let candidates = match (&existing, &name) {
                (None, Some(name)) => db.collision_candidates(name, &version, None),
                _ => Vec::new(),
            };
            (existing, candidates)
        };

        if let Some(existing) = existing {
            if let Some(origin) = origin {
                if !self.adaptor.is_visible(origin, &existing) {
                    return Err(ContainerError::RejectedByHook {
                        location: location.to_owned(),
                    });
                }
            }
            tracing::debug!(location, "install found an existing module");
            return Ok(existing);
        }

        // The window between the read above and the database commit is
        // tolerated: the location and name locks serialize every installer
        // of the same identity.
        if !candidates.is_empty() {
            if let Some(origin) = origin {
                if let Some(hook) = self.adaptor.collision_hook() {
                    hook.filter_collisions(CollisionMode::Installing, origin, &mut candidates);
                }
            }
            if !candidates.is_empty() {
                return Err(ContainerError::DuplicateModule {
                    name: name.unwrap_or_default(),
                    version,
                });
            }
        }

        let module = self.db.install(
            location,
            builder,
            info,
            |id| self.adaptor.create_activator(location, id),
            self.me.clone(),
            false,
        );
        tracing::info!(module = module.id(), location, "installed module");
        self.adaptor
            .publish_module_event(ModuleEvent::Installed, &module, origin);
        Ok(module)
    }

    /// Update a module to a new revision, stopping and transiently resuming
    /// it when it was active.
    ///
    /// # Errors
    /// [`ContainerError::PermissionDenied`] without the lifecycle
    /// permission, [`ContainerError::StateChange`] on lock timeouts,
    /// [`ContainerError::Uninstalled`], [`ContainerError::Activator`] when
    /// the transient stop fails, and [`ContainerError::DuplicateModule`]
    /// when the new identity collides. A failed resume after the update is
    /// reported as a container `Error` event, not returned.
    pub fn update(
        &self,
        module: &Arc<Module>,
        builder: RevisionBuilder,
        info: Option<RevisionInfo>,
    ) -> Result<(), ContainerError> {
        if !self.adaptor.check_permission(module, AdminPermission::Lifecycle) {
            return Err(ContainerError::PermissionDenied(AdminPermission::Lifecycle));
        }
        let name = builder.name().map(str::to_owned);
        let _name_lock = match &name {
            Some(name) => {
                let Some(guard) = self.name_locks.lock(name.clone(), STATE_CHANGE_TIMEOUT) else {
                    return Err(ContainerError::StateChange { key: name.clone() });
                };
                Some(guard)
            }
            None => None,
        };

        let resume = {
            let _transition = module.lock_transition(Transition::Updated)?;
            if module.state() == State::Uninstalled {
                return Err(ContainerError::Uninstalled {
                    location: module.location().to_owned(),
                });
            }
            let previous = module.state();
            if previous.in_active_set() {
                module.stop(StopOptions::transient())?;
            }
            if previous.in_resolved_set() {
                module.set_state(State::Installed);
                self.adaptor
                    .publish_module_event(ModuleEvent::Unresolved, module, Some(module));
            }

            if let Some(name) = &name {
                let version = builder.build_version();
                let mut candidates =
                    self.db
                        .read()
                        .collision_candidates(name, &version, Some(module.id()));
                if !candidates.is_empty() {
                    if let Some(hook) = self.adaptor.collision_hook() {
                        hook.filter_collisions(CollisionMode::Updating, module, &mut candidates);
                    }
                    if !candidates.is_empty() {
                        return Err(ContainerError::DuplicateModule {
                            name: name.clone(),
                            version,
                        });
                    }
                }
            }

            self.db.update(module, builder, info);
            tracing::info!(module = module.id(), "updated module");
            self.adaptor
                .publish_module_event(ModuleEvent::Updated, module, Some(module));
            previous.in_active_set()
        };

        if resume {
            if let Err(error) = module.start(StartOptions::resume()) {
                tracing::warn!(
                    module = module.id(),
                    error = %error,
                    "failed to resume module after update"
                );
                self.publish_error(module, &error);
            }
        }
        Ok(())
    }

    /// Uninstall a module. Its revisions stay removal-pending until the next
    /// refresh.
    ///
    /// # Errors
    /// [`ContainerError::PermissionDenied`] without the lifecycle
    /// permission, [`ContainerError::SystemModule`] for the system module,
    /// [`ContainerError::StateChange`] on lock timeout, and
    /// [`ContainerError::Uninstalled`] when already uninstalled. A failed
    /// transient stop is reported as a container `Error` event.
    pub fn uninstall(&self, module: &Arc<Module>) -> Result<(), ContainerError> {
        if !self.adaptor.check_permission(module, AdminPermission::Lifecycle) {
            return Err(ContainerError::PermissionDenied(AdminPermission::Lifecycle));
        }
        if module.id() == SYSTEM_MODULE {
            return Err(ContainerError::SystemModule);
        }
        let _transition = module.lock_transition(Transition::Uninstalled)?;
        if module.state() == State::Uninstalled {
            return Err(ContainerError::Uninstalled {
                location: module.location().to_owned(),
            });
        }
        let previous = module.state();
        if previous.in_active_set() {
            if let Err(error) = module.stop(StopOptions::transient()) {
                self.publish_error(module, &error);
            }
        }
        if previous.in_resolved_set() {
            module.set_state(State::Installed);
            self.adaptor
                .publish_module_event(ModuleEvent::Unresolved, module, Some(module));
        }
        self.db.uninstall(module);
        module.set_state(State::Uninstalled);
        tracing::info!(module = module.id(), location = %module.location(), "uninstalled module");
        self.adaptor
            .publish_module_event(ModuleEvent::Uninstalled, module, Some(module));
        Ok(())
    }

    // === Resolve engine ==================================================

    /// Resolve `triggers` (and opportunistically everything unresolved).
    ///
    /// Loops the snapshot/compute/commit round until it commits; a
    /// timestamp conflict retries against the newer state.
    ///
    /// # Errors
    /// [`ContainerError::Resolution`] from the resolver, or when the system
    /// module is being refreshed; [`ContainerError::StateChange`] when a
    /// resolved module's transition lock times out.
    pub fn resolve(&self, triggers: &[Arc<Module>], mandatory: bool) -> Result<(), ContainerError> {
        self.resolve_with_restart(triggers, mandatory, false)
    }

    fn resolve_with_restart(
        &self,
        triggers: &[Arc<Module>],
        mandatory: bool,
        restart_triggers: bool,
    ) -> Result<(), ContainerError> {
        if self.is_refreshing_system_module() {
            return Err(ContainerError::resolution(
                "the system module is being refreshed",
            ));
        }
        loop {
            match self.resolve_and_apply(triggers, mandatory, restart_triggers)? {
                ResolveOutcome::Done => return Ok(()),
                ResolveOutcome::Retry => {
                    tracing::debug!("resolve retry: revisions timestamp advanced");
                }
            }
        }
    }

    fn resolve_and_apply(
        &self,
        triggers: &[Arc<Module>],
        mandatory: bool,
        restart_triggers: bool,
    ) -> Result<ResolveOutcome, ContainerError> {
        // Phase A: optimistic snapshot.
        let (timestamp, wirings, trigger_revisions, unresolved) = {
            let db = self.db.read();
            let timestamp = db.revisions_timestamp();
            let wirings = db.wirings_clone();
            let trigger_revisions: Vec<Arc<ModuleRevision>> = triggers
                .iter()
                .filter(|m| m.state() != State::Uninstalled)
                .filter_map(|m| m.current_revision())
                .collect();
            let unresolved = Self::unresolved_revisions(&db, &wirings);
            (timestamp, wirings, trigger_revisions, unresolved)
        };

        // Phase B: pure compute, no locks held.
        let delta = self
            .resolver
            .resolve_delta(&trigger_revisions, mandatory, &unresolved, &wirings, &self.db)
            .map_err(|source| ContainerError::Resolution { source })?;
        if delta.is_empty() {
            return Ok(ResolveOutcome::Done);
        }
        let mut modules_resolved: Vec<Arc<Module>> = delta
            .iter()
            .filter(|(id, _)| !wirings.contains_key(id))
            .map(|(_, wiring)| wiring.revision().module())
            .collect();

        // Phase C: validate and commit.
        self.apply_delta(
            delta,
            &mut modules_resolved,
            triggers,
            timestamp,
            restart_triggers,
        )
    }

    fn unresolved_revisions(
        db: &DbReadGuard<'_>,
        wirings: &DeltaWiring,
    ) -> Vec<Arc<ModuleRevision>> {
        db.modules()
            .iter()
            .filter(|m| m.state() != State::Uninstalled)
            .filter_map(|m| m.current_revision())
            .filter(|r| !wirings.contains_key(&r.id()))
            .collect()
    }

    fn apply_delta(
        &self,
        mut delta: DeltaWiring,
        modules_resolved: &mut Vec<Arc<Module>>,
        triggers: &[Arc<Module>],
        timestamp: u64,
        restart_triggers: bool,
    ) -> Result<ResolveOutcome, ContainerError> {
        // Deterministic acquisition order across concurrent resolvers.
        modules_resolved.sort_by_key(|m| m.id());
        let mut guards = Vec::with_capacity(modules_resolved.len());
        for module in modules_resolved.iter() {
            guards.push(module.lock_transition(Transition::Resolved)?);
        }

        {
            let mut db = self.db.write();
            if db.revisions_timestamp() != timestamp {
                return Ok(ResolveOutcome::Retry);
            }
            // A revision that already carries a wiring keeps its published
            // object: fold the delta's content into it in place.
            for (revision, wiring) in &mut delta {
                if let Some(existing) = db.wiring(*revision) {
                    existing.update_from(&**wiring);
                    *wiring = existing;
                }
            }
            db.merge_wiring(delta);
            db.sort_modules(modules_resolved, &[SortKey::ByDependency, SortKey::ByStartLevel]);
        }

        for module in modules_resolved.iter() {
            module.set_state(State::Resolved);
        }
        drop(guards);
        for module in modules_resolved.iter() {
            tracing::debug!(module = module.id(), "resolved module");
            self.adaptor
                .publish_module_event(ModuleEvent::Resolved, module, Some(module));
        }

        if restart_triggers {
            for trigger in triggers {
                if trigger.id() == SYSTEM_MODULE || !trigger.state().in_resolved_set() {
                    continue;
                }
                if let Err(error) = trigger.start(StartOptions::resume()) {
                    self.publish_error(trigger, &error);
                }
            }
        }

        // Auto-start everything that just became resolved, except the system
        // module, triggers restarted above, and modules whose `Started`
        // transition is already underway on this thread.
        for module in modules_resolved.iter() {
            if module.id() == SYSTEM_MODULE {
                continue;
            }
            if restart_triggers && triggers.iter().any(|t| Arc::ptr_eq(t, module)) {
                continue;
            }
            if module.holds_transition(Transition::Started) {
                continue;
            }
            if let Err(error) = module.start(StartOptions::auto_start_resume()) {
                self.publish_error(module, &error);
            }
        }
        Ok(ResolveOutcome::Done)
    }

    // === Dynamic resolve =================================================

    /// Wire one dynamic `package` requirement of a resolved revision on
    /// demand.
    ///
    /// Returns the new tail wire, or `None` when the revision is a fragment,
    /// is unresolved, declares no covering dynamic requirement, or no
    /// provider exists.
    ///
    /// # Errors
    /// [`ContainerError::Resolution`] when the resolver produced an
    /// inconsistent dynamic wire, or when the system module is being
    /// refreshed.
    pub fn resolve_dynamic(
        &self,
        package_name: &str,
        revision: &Arc<ModuleRevision>,
    ) -> Result<Option<Arc<ModuleWire>>, ContainerError> {
        if self.is_refreshing_system_module() {
            return Err(ContainerError::resolution(
                "the system module is being refreshed",
            ));
        }
        if revision.is_fragment() {
            return Ok(None);
        }
        let projected: Vec<Requirement> = revision
            .requirements()
            .iter()
            .filter(|r| r.namespace == PACKAGE_NAMESPACE)
            .filter_map(|r| r.dynamic_projection(package_name))
            .collect();
        if projected.is_empty() {
            return Ok(None);
        }

        loop {
            let (timestamp, wirings, unresolved, existing_required) = {
                let db = self.db.read();
                let wirings = db.wirings_clone();
                let Some(wiring) = wirings.get(&revision.id()) else {
                    return Ok(None);
                };
                let existing_required = wiring.required_wires();
                let unresolved = Self::unresolved_revisions(&db, &wirings);
                (db.revisions_timestamp(), wirings, unresolved, existing_required)
            };

            let mut chosen: Option<DeltaWiring> = None;
            for requirement in &projected {
                match self.resolver.resolve_dynamic_delta(
                    requirement,
                    revision,
                    &unresolved,
                    &wirings,
                    &self.db,
                ) {
                    Ok(delta) if delta.contains_key(&revision.id()) => {
                        chosen = Some(delta);
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::debug!(
                            package = package_name,
                            error = %error,
                            "dynamic resolve candidate failed"
                        );
                    }
                }
            }
            let Some(delta) = chosen else {
                return Ok(None);
            };

            let tail = Self::validate_dynamic_delta(
                &delta,
                revision,
                &existing_required,
                package_name,
            )?;

            let mut modules_resolved: Vec<Arc<Module>> = delta
                .iter()
                .filter(|(id, _)| !wirings.contains_key(id))
                .map(|(_, wiring)| wiring.revision().module())
                .collect();
            match self.apply_delta(delta, &mut modules_resolved, &[], timestamp, false)? {
                ResolveOutcome::Retry => {
                    tracing::debug!("dynamic resolve retry: revisions timestamp advanced");
                }
                ResolveOutcome::Done => return Ok(Some(tail)),
            }
        }
    }

    /// The delta must grow the revision's required list by exactly one tail
    /// wire for the requested package.
    fn validate_dynamic_delta(
        delta: &DeltaWiring,
        revision: &Arc<ModuleRevision>,
        existing_required: &[Arc<ModuleWire>],
        package_name: &str,
    ) -> Result<Arc<ModuleWire>, ContainerError> {
        let inconsistent = || {
            ContainerError::resolution(format!(
                "resolver produced an inconsistent dynamic wire for package '{package_name}'"
            ))
        };
        let wiring = delta.get(&revision.id()).ok_or_else(inconsistent)?;
        let required = wiring.required_wires();
        if required.len() != existing_required.len() + 1 {
            return Err(inconsistent());
        }
        let prefix_unchanged = required
            .iter()
            .zip(existing_required.iter())
            .all(|(a, b)| Arc::ptr_eq(a, b));
        let Some(tail) = required.last() else {
            return Err(inconsistent());
        };
        let tail_ok = Arc::ptr_eq(tail.requirer(), revision)
            && tail.capability().namespace == PACKAGE_NAMESPACE
            && tail.capability().attribute(PACKAGE_ATTR) == Some(package_name);
        if !prefix_unchanged || !tail_ok {
            return Err(inconsistent());
        }
        Ok(Arc::clone(tail))
    }

    // === Refresh engine ==================================================

    /// Refresh `initial` (or, when `None`, everything removal-pending):
    /// unresolve the refresh closure, then re-resolve and restart the
    /// surviving triggers.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when a trigger's transition lock
    /// times out and [`ContainerError::Resolution`] from the re-resolve.
    pub fn refresh(&self, initial: Option<&[Arc<Module>]>) -> Result<(), ContainerError> {
        let triggers = self.unresolve(initial)?;
        if self.is_refreshing_system_module() {
            // The asynchronous system refresh took over.
            return Ok(());
        }
        self.resolve_with_restart(&triggers, false, true)
    }

    fn unresolve(
        &self,
        initial: Option<&[Arc<Module>]>,
    ) -> Result<Vec<Arc<Module>>, ContainerError> {
        loop {
            if let Some(triggers) = self.unresolve0(initial)? {
                return Ok(triggers);
            }
            tracing::debug!("refresh retry: revisions timestamp advanced");
        }
    }

    #[allow(clippy::too_many_lines)]
    fn unresolve0(
        &self,
        initial: Option<&[Arc<Module>]>,
    ) -> Result<Option<Vec<Arc<Module>>>, ContainerError> {
        let timestamp;
        let mut wiring_copy;
        let mut refresh_triggers;
        let mut to_remove_wirings = Vec::new();
        let to_remove_wire_lists;
        let mut to_remove_revisions = Vec::new();
        {
            let db = self.db.read();
            let mut initial_set = initial.map(<[Arc<Module>]>::to_vec);
            Self::check_system_extension_refresh(initial_set.as_mut(), &db);
            timestamp = db.revisions_timestamp();
            wiring_copy = db.wirings_clone();
            refresh_triggers = Self::refresh_closure_in(initial_set.as_deref(), &db);

            let mut wire_lists = HashMap::new();
            for module in &refresh_triggers {
                for revision in module.revisions().all() {
                    if let Some(wiring) = wiring_copy.remove(&revision.id()) {
                        // Wires into providers that survive the refresh get
                        // stripped from the provider's side.
                        for wire in wiring.required_wires() {
                            let provider_id = wire.provider().id();
                            if let Some(provider_wiring) = wiring_copy.get(&provider_id) {
                                wire_lists
                                    .entry(provider_id)
                                    .or_insert_with(|| (Arc::clone(provider_wiring), Vec::new()))
                                    .1
                                    .push(wire);
                            }
                        }
                        to_remove_wirings.push(wiring);
                    }
                    if !revision.is_current() {
                        to_remove_revisions.push(revision);
                    }
                }
            }
            to_remove_wire_lists = wire_lists;
            refresh_triggers.retain(|m| m.state() != State::Uninstalled);
            db.sort_modules(&mut refresh_triggers, &[SortKey::ByStartLevel, SortKey::ByDependency]);
        }

        if refresh_triggers
            .iter()
            .any(|m| m.id() == SYSTEM_MODULE && m.state().in_active_set())
        {
            // Never unresolve the active system module on the caller's
            // thread; hand the whole container restart to the dedicated
            // refresh thread and report nothing left to re-resolve.
            self.refresh_system_module_async();
            return Ok(Some(Vec::new()));
        }

        // Lock in reverse order so release matches stop order.
        let mut guards = Vec::with_capacity(refresh_triggers.len());
        for module in refresh_triggers.iter().rev() {
            guards.push(module.lock_transition(Transition::Unresolved)?);
        }

        let mut was_active: HashSet<ModuleId> = HashSet::new();
        for module in refresh_triggers.iter().rev() {
            let previous = module.state();
            if previous == State::Active {
                was_active.insert(module.id());
            }
            if previous.in_active_set() {
                if let Err(error) = module.stop(StopOptions::transient()) {
                    tracing::warn!(
                        module = module.id(),
                        error = %error,
                        "failed to stop module for refresh"
                    );
                    self.publish_error(module, &error);
                }
            }
        }
        for module in &refresh_triggers {
            assert!(
                !module.state().in_active_set(),
                "module {} is still active after the refresh stop pass",
                module.id()
            );
        }

        {
            let mut db = self.db.write();
            if db.revisions_timestamp() != timestamp {
                return Ok(None);
            }
            for (provider_wiring, wires) in to_remove_wire_lists.values() {
                provider_wiring.remove_provided_wires(wires);
                for wire in wires {
                    wire.invalidate();
                }
            }
            for revision in &to_remove_revisions {
                db.remove_revision(revision);
            }
            for wiring in &to_remove_wirings {
                wiring.invalidate();
            }
            db.set_wirings(wiring_copy);
        }

        let mut unresolved_events = Vec::new();
        for module in &refresh_triggers {
            if module.state() == State::Resolved {
                module.set_state(State::Installed);
                unresolved_events.push(Arc::clone(module));
            }
        }
        drop(guards);
        for module in &unresolved_events {
            self.adaptor
                .publish_module_event(ModuleEvent::Unresolved, module, Some(module));
        }

        // Only triggers that were exactly ACTIVE before the stop pass are
        // restarted by the caller's re-resolve.
        let restart: Vec<Arc<Module>> = refresh_triggers
            .into_iter()
            .filter(|m| was_active.contains(&m.id()))
            .collect();
        Ok(Some(restart))
    }

    /// Trim the initial refresh set: the active system module is never
    /// unresolved directly, and neither is a resolved fragment hosted by it
    /// (that would needlessly shut the whole container down).
    fn check_system_extension_refresh(
        initial: Option<&mut Vec<Arc<Module>>>,
        db: &DbReadGuard<'_>,
    ) {
        let Some(initial) = initial else {
            return;
        };
        initial.retain(|module| {
            if module.id() == SYSTEM_MODULE && module.state().in_active_set() {
                return false;
            }
            if module.state().in_resolved_set() {
                if let Some(revision) = module.current_revision() {
                    if revision.is_fragment() {
                        if let Some(wiring) = db.wiring(revision.id()) {
                            let hosted_by_system = wiring.required_wires().iter().any(|w| {
                                w.capability().namespace == HOST_NAMESPACE
                                    && w.provider().module().id() == SYSTEM_MODULE
                            });
                            if hosted_by_system {
                                return false;
                            }
                        }
                    }
                }
            }
            true
        });
    }

    /// The transitive set of modules that must be unresolved together:
    /// every requirer across provided wires, and for fragment revisions
    /// every host across required `host` wires. A `None` seed starts from
    /// the removal-pending revisions.
    fn refresh_closure_in(
        initial: Option<&[Arc<Module>]>,
        db: &DbReadGuard<'_>,
    ) -> Vec<Arc<Module>> {
        let mut stack: Vec<Arc<Module>> = match initial {
            Some(modules) => modules.to_vec(),
            None => db.removal_pending().iter().map(|r| r.module()).collect(),
        };
        let mut seen: HashSet<ModuleId> = HashSet::new();
        let mut closure = Vec::new();
        while let Some(module) = stack.pop() {
            if !seen.insert(module.id()) {
                continue;
            }
            for revision in module.revisions().all() {
                let Some(wiring) = db.wiring(revision.id()) else {
                    continue;
                };
                for wire in wiring.provided_wires() {
                    stack.push(wire.requirer().module());
                }
                if revision.is_fragment() {
                    for wire in wiring.required_wires() {
                        if wire.capability().namespace == HOST_NAMESPACE {
                            stack.push(wire.provider().module());
                        }
                    }
                }
            }
            closure.push(module);
        }
        closure
    }

    // === System-module refresh ===========================================

    /// Whether the one-shot asynchronous system-module refresh is in
    /// flight. Unrelated resolves are refused while it is.
    #[must_use]
    pub fn is_refreshing_system_module(&self) -> bool {
        *self.refreshing_system.lock()
    }

    fn refresh_system_module_async(&self) {
        {
            let mut flag = self.refreshing_system.lock();
            if *flag {
                return;
            }
            *flag = true;
        }
        tracing::info!("scheduling asynchronous system module refresh");
        let Some(container) = self.me.upgrade() else {
            *self.refreshing_system.lock() = false;
            return;
        };
        let spawned = std::thread::Builder::new()
            .name("modhost-system-refresh".to_owned())
            .spawn(move || container.refresh_system_module());
        if spawned.is_err() {
            tracing::error!("failed to spawn the system refresh thread");
            *self.refreshing_system.lock() = false;
        }
    }

    fn refresh_system_module(&self) {
        if let Some(system) = self.db.module(SYSTEM_MODULE) {
            if let Err(error) = system.stop(StopOptions::transient()) {
                self.publish_error(&system, &error);
            }
        }
        self.adaptor.refreshed_system_module();
        *self.refreshing_system.lock() = false;
        tracing::info!("system module refresh complete");
    }

    // === Wiring facade ===================================================

    /// Queue a refresh job on the dedicated dispatcher. The `Refresh`
    /// container event reaches `listeners` even when the refresh failed;
    /// any error is delivered as an `Error` event first.
    ///
    /// # Errors
    /// [`ContainerError::PermissionDenied`] without the resolve permission
    /// and [`ContainerError::Closed`] when the dispatcher is closed.
    pub fn refresh_modules(
        &self,
        modules: Option<Vec<Arc<Module>>>,
        listeners: Vec<EventListener>,
    ) -> Result<(), ContainerError> {
        self.check_admin(AdminPermission::Resolve)?;
        let Some(container) = self.me.upgrade() else {
            return Err(ContainerError::Closed);
        };
        self.refresh_dispatcher.dispatch(move || {
            let result = container.refresh(modules.as_deref());
            let Some(system) = container.database().module(SYSTEM_MODULE) else {
                tracing::warn!("refresh finished on a container without a system module");
                return;
            };
            if let Err(error) = &result {
                container.adaptor().publish_container_event(
                    ContainerEvent::Error,
                    &system,
                    Some(error),
                    &listeners,
                );
            }
            container.adaptor().publish_container_event(
                ContainerEvent::Refresh,
                &system,
                None,
                &listeners,
            );
        })
    }

    /// Resolve the given modules (or all of them); `true` iff every module
    /// in the set carries a wiring afterwards. A resolution failure answers
    /// `false` instead of an error.
    ///
    /// # Errors
    /// [`ContainerError::PermissionDenied`] without the resolve permission
    /// and [`ContainerError::StateChange`] on lock timeout.
    pub fn resolve_modules(
        &self,
        modules: Option<&[Arc<Module>]>,
    ) -> Result<bool, ContainerError> {
        self.check_admin(AdminPermission::Resolve)?;
        let targets: Vec<Arc<Module>> = match modules {
            Some(modules) => modules.to_vec(),
            None => self.db.modules(),
        };
        match self.resolve(&targets, false) {
            Ok(()) => {}
            Err(ContainerError::Resolution { source }) => {
                tracing::debug!(error = %source, "resolve_modules: resolution failed");
                return Ok(false);
            }
            Err(other) => return Err(other),
        }
        let db = self.db.read();
        Ok(targets.iter().all(|m| {
            m.current_revision()
                .is_some_and(|r| db.wiring(r.id()).is_some())
        }))
    }

    /// Snapshot of the removal-pending revisions.
    #[must_use]
    pub fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
        self.db.read().removal_pending()
    }

    /// Snapshot of the refresh closure of `initial`.
    #[must_use]
    pub fn dependency_closure(&self, initial: &[Arc<Module>]) -> Vec<Arc<Module>> {
        let db = self.db.read();
        Self::refresh_closure_in(Some(initial), &db)
    }

    // === Load / unload ===================================================

    /// Open the container: reset the dispatchers and synchronize module
    /// states with the persisted wirings. Runs once per container instance,
    /// never concurrently with resolve or refresh.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when a module's transition lock
    /// times out.
    pub fn open(&self) -> Result<(), ContainerError> {
        *self.refreshing_system.lock() = false;
        self.start_level.open();
        self.refresh_dispatcher.open();
        self.load_modules()
    }

    fn load_modules(&self) -> Result<(), ContainerError> {
        let db = self.db.read();
        let mut guards = Vec::new();
        for module in db.modules() {
            guards.push(module.lock_transition(Transition::Resolved)?);
            let resolved = module
                .current_revision()
                .is_some_and(|r| db.wiring(r.id()).is_some());
            module.set_state(if resolved {
                State::Resolved
            } else {
                State::Installed
            });
        }
        for wiring in db.wirings_clone().values() {
            wiring.validate();
        }
        drop(guards);
        tracing::info!("container opened");
        Ok(())
    }

    /// Close the container: shut both dispatchers down and unload every
    /// non-system module.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when a module's transition lock
    /// times out.
    pub fn close(&self) -> Result<(), ContainerError> {
        self.refresh_dispatcher.close();
        self.start_level.close();
        self.unload_modules()?;
        tracing::info!("container closed");
        Ok(())
    }

    fn unload_modules(&self) -> Result<(), ContainerError> {
        let db = self.db.read();
        for module in db.modules() {
            if module.id() == SYSTEM_MODULE {
                continue;
            }
            let _transition = module.lock_transition(Transition::Uninstalled)?;
            module.set_state(State::Uninstalled);
        }
        for wiring in db.wirings_clone().values() {
            wiring.invalidate();
        }
        Ok(())
    }

    /// Reset to the cold-start state: system module installed, everything
    /// else uninstalled, all wirings invalidated.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when a module's transition lock
    /// times out.
    pub fn set_initial_module_states(&self) -> Result<(), ContainerError> {
        let db = self.db.read();
        for module in db.modules() {
            if module.id() == SYSTEM_MODULE {
                let _transition = module.lock_transition(Transition::Resolved)?;
                module.set_state(State::Installed);
            } else {
                let _transition = module.lock_transition(Transition::Uninstalled)?;
                module.set_state(State::Uninstalled);
            }
        }
        for wiring in db.wirings_clone().values() {
            wiring.invalidate();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ModuleContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContainer")
            .field("modules", &self.db.modules().len())
            .field("active_start_level", &self.start_level.active_level())
            .field("refreshing_system", &self.is_refreshing_system_module())
            .finish()
    }
}
