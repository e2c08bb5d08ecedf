//! The in-memory module database: the only mutable shared graph.
//!
//! All mutations happen under the write lock; readers take the read lock and
//! snapshot what they need. The *revisions timestamp* advances on every
//! mutation that changes the set of modules, revisions, or wirings, driving
//! the optimistic concurrency of the resolve and refresh engines. Start-level
//! and activation-setting changes do not advance it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use semver::Version;

use crate::container::ModuleContainer;
use crate::module::{Module, ModuleActivator, ModuleId, State, SYSTEM_MODULE};
use crate::revision::{Capability, ModuleRevision, RevisionBuilder, RevisionId, RevisionInfo};
use crate::wiring::ModuleWiring;

/// Sort keys understood by [`DbReadGuard::sort_modules`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortKey {
    /// Providers before their requirers (derived from current wirings).
    ByDependency,
    /// Ascending start level (stable).
    ByStartLevel,
}

#[derive(Copy, Clone, Debug, Default)]
struct ActivationSettings {
    auto_start: bool,
    lazy: bool,
}

struct DbState {
    modules_by_id: BTreeMap<ModuleId, Arc<Module>>,
    modules_by_location: HashMap<String, ModuleId>,
    wirings: HashMap<RevisionId, Arc<ModuleWiring>>,
    /// Capability index by namespace; entries leave the index as soon as
    /// their revision stops being a candidate for new resolutions.
    capabilities: HashMap<String, Vec<(Arc<ModuleRevision>, Capability)>>,
    settings: HashMap<ModuleId, ActivationSettings>,
    initial_start_level: u32,
}

impl DbState {
    fn index_capabilities(&mut self, revision: &Arc<ModuleRevision>) {
        for capability in revision.capabilities() {
            self.capabilities
                .entry(capability.namespace.clone())
                .or_default()
                .push((Arc::clone(revision), capability.clone()));
        }
    }

    fn unindex_capabilities(&mut self, revision: &Arc<ModuleRevision>) {
        for capability in revision.capabilities() {
            if let Some(entries) = self.capabilities.get_mut(&capability.namespace) {
                entries.retain(|(rev, _)| !Arc::ptr_eq(rev, revision));
            }
        }
    }

    fn sorted_modules(&self) -> Vec<Arc<Module>> {
        self.modules_by_id.values().cloned().collect()
    }

    /// Stable dependency reorder of one slice: providers first. Cycles keep
    /// their incoming order.
    fn dependency_order(&self, run: &mut [Arc<Module>]) {
        let index: HashMap<ModuleId, usize> =
            run.iter().enumerate().map(|(i, m)| (m.id(), i)).collect();
        let mut indegree = vec![0usize; run.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); run.len()];
        for (i, module) in run.iter().enumerate() {
            let Some(revision) = module.current_revision() else {
                continue;
            };
            let Some(wiring) = self.wirings.get(&revision.id()) else {
                continue;
            };
            for wire in wiring.required_wires() {
                let provider = wire.provider().module();
                if provider.id() == module.id() {
                    continue;
                }
                if let Some(&p) = index.get(&provider.id()) {
                    edges[p].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut order = Vec::with_capacity(run.len());
        let mut queue: Vec<usize> = (0..run.len()).filter(|&i| indegree[i] == 0).collect();
        let mut at = 0;
        while at < queue.len() {
            let u = queue[at];
            at += 1;
            order.push(u);
            for &w in &edges[u] {
                indegree[w] -= 1;
                if indegree[w] == 0 {
                    queue.push(w);
                }
            }
        }
        // Anything left participates in a cycle; keep its incoming order.
        for i in 0..run.len() {
            if indegree[i] > 0 {
                order.push(i);
            }
        }
        let sorted: Vec<Arc<Module>> = order.iter().map(|&i| Arc::clone(&run[i])).collect();
        run.clone_from_slice(&sorted);
    }

    fn sort_modules(&self, modules: &mut [Arc<Module>], keys: &[SortKey]) {
        if keys.contains(&SortKey::ByStartLevel) {
            modules.sort_by_key(|m| m.start_level());
        }
        if keys.contains(&SortKey::ByDependency) {
            let mut start = 0;
            while start < modules.len() {
                let mut end = start + 1;
                if keys.contains(&SortKey::ByStartLevel) {
                    let level = modules[start].start_level();
                    while end < modules.len() && modules[end].start_level() == level {
                        end += 1;
                    }
                } else {
                    end = modules.len();
                }
                self.dependency_order(&mut modules[start..end]);
                start = end;
            }
        }
    }
}

/// Persistent in-memory store of modules, revisions, wirings, and start-level
/// assignments.
pub struct ModuleDatabase {
    state: RwLock<DbState>,
    timestamp: AtomicU64,
    next_module: AtomicU64,
    next_revision: AtomicU64,
}

impl Default for ModuleDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDatabase {
    #[must_use]
    pub fn new() -> Self {
        ModuleDatabase {
            state: RwLock::new(DbState {
                modules_by_id: BTreeMap::new(),
                modules_by_location: HashMap::new(),
                wirings: HashMap::new(),
                capabilities: HashMap::new(),
                settings: HashMap::new(),
                initial_start_level: 1,
            }),
            timestamp: AtomicU64::new(0),
            next_module: AtomicU64::new(1),
            next_revision: AtomicU64::new(0),
        }
    }

    /// The monotone revisions timestamp.
    #[must_use]
    pub fn revisions_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    fn bump_timestamp(&self) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
    }

    fn next_revision_id(&self) -> RevisionId {
        RevisionId(self.next_revision.fetch_add(1, Ordering::AcqRel))
    }

    /// Take the read lock.
    #[must_use]
    pub fn read(&self) -> DbReadGuard<'_> {
        DbReadGuard {
            db: self,
            state: self.state.read(),
        }
    }

    /// Take the write lock. Holding state-change locks while acquiring it is
    /// allowed; the reverse order is not.
    #[must_use]
    pub fn write(&self) -> DbWriteGuard<'_> {
        DbWriteGuard {
            db: self,
            state: self.state.write(),
        }
    }

    pub(crate) fn install(
        &self,
        location: &str,
        builder: RevisionBuilder,
        info: Option<RevisionInfo>,
        activator: impl FnOnce(ModuleId) -> Box<dyn ModuleActivator>,
        container: Weak<ModuleContainer>,
        system: bool,
    ) -> Arc<Module> {
        let id = if system {
            SYSTEM_MODULE
        } else {
            self.next_module.fetch_add(1, Ordering::AcqRel)
        };
        // The activator factory is external code; call it before taking the
        // write lock.
        let activator = activator(id);
        let mut state = self.state.write();
        let start_level = if system { 0 } else { state.initial_start_level };
        let module = Module::new(id, location.to_owned(), start_level, activator, container);
        let revision = builder.build(self.next_revision_id(), module.revisions(), info);
        module.revisions().push_current(Arc::clone(&revision));
        state.modules_by_id.insert(id, Arc::clone(&module));
        state.modules_by_location.insert(location.to_owned(), id);
        state.index_capabilities(&revision);
        self.bump_timestamp();
        tracing::debug!(module = id, location, "database: installed module");
        module
    }

    pub(crate) fn update(
        &self,
        module: &Arc<Module>,
        builder: RevisionBuilder,
        info: Option<RevisionInfo>,
    ) {
        let mut state = self.state.write();
        if let Some(old) = module.current_revision() {
            state.unindex_capabilities(&old);
        }
        let revision = builder.build(self.next_revision_id(), module.revisions(), info);
        module.revisions().push_current(Arc::clone(&revision));
        state.index_capabilities(&revision);
        self.bump_timestamp();
        tracing::debug!(module = module.id(), "database: updated module");
    }

    pub(crate) fn uninstall(&self, module: &Arc<Module>) {
        let mut state = self.state.write();
        for revision in module.revisions().all() {
            state.unindex_capabilities(&revision);
        }
        state.modules_by_id.remove(&module.id());
        state.modules_by_location.remove(module.location());
        module.revisions().mark_uninstalled();
        self.bump_timestamp();
        tracing::debug!(module = module.id(), "database: uninstalled module");
    }

    pub(crate) fn set_activation_settings(&self, id: ModuleId, auto_start: bool, lazy: bool) {
        let mut state = self.state.write();
        state
            .settings
            .insert(id, ActivationSettings { auto_start, lazy });
    }

    /// The persisted auto-start setting.
    #[must_use]
    pub fn auto_start(&self, id: ModuleId) -> bool {
        self.state
            .read()
            .settings
            .get(&id)
            .is_some_and(|s| s.auto_start)
    }

    /// The persisted lazy-activation setting.
    #[must_use]
    pub fn lazy_activation(&self, id: ModuleId) -> bool {
        self.state.read().settings.get(&id).is_some_and(|s| s.lazy)
    }

    pub(crate) fn set_start_level(&self, module: &Arc<Module>, level: u32) {
        module.store_start_level(level);
    }

    /// The start level assigned to newly installed modules.
    #[must_use]
    pub fn initial_module_start_level(&self) -> u32 {
        self.state.read().initial_start_level
    }

    pub fn set_initial_module_start_level(&self, level: u32) {
        self.state.write().initial_start_level = level;
    }

    /// Convenience snapshot of all modules, by id.
    #[must_use]
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.read().modules()
    }

    /// Convenience lookup by id.
    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.read().module(id)
    }

    /// Convenience lookup by location.
    #[must_use]
    pub fn module_at(&self, location: &str) -> Option<Arc<Module>> {
        self.read().module_at(location)
    }

    /// Convenience wiring lookup.
    #[must_use]
    pub fn wiring(&self, revision: RevisionId) -> Option<Arc<ModuleWiring>> {
        self.read().wiring(revision)
    }

    /// All modules sorted by `keys`.
    #[must_use]
    pub fn sorted_modules(&self, keys: &[SortKey]) -> Vec<Arc<Module>> {
        let guard = self.read();
        let mut modules = guard.modules();
        guard.sort_modules(&mut modules, keys);
        modules
    }
}

/// Read access to the database; the lock is held until dropped.
pub struct DbReadGuard<'a> {
    db: &'a ModuleDatabase,
    state: RwLockReadGuard<'a, DbState>,
}

macro_rules! shared_read_ops {
    ($guard:ident) => {
        impl $guard<'_> {
            /// The revisions timestamp at this point in time.
            #[must_use]
            pub fn revisions_timestamp(&self) -> u64 {
                self.db.revisions_timestamp()
            }

            /// All modules ordered by id.
            #[must_use]
            pub fn modules(&self) -> Vec<Arc<Module>> {
                self.state.sorted_modules()
            }

            #[must_use]
            pub fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
                self.state.modules_by_id.get(&id).cloned()
            }

            #[must_use]
            pub fn module_at(&self, location: &str) -> Option<Arc<Module>> {
                let id = self.state.modules_by_location.get(location)?;
                self.state.modules_by_id.get(id).cloned()
            }

            /// The wiring of `revision`, if it is resolved.
            #[must_use]
            pub fn wiring(&self, revision: RevisionId) -> Option<Arc<ModuleWiring>> {
                self.state.wirings.get(&revision).cloned()
            }

            /// Shallow clone of the wiring map; the wiring objects are
            /// shared, which the optimistic timestamp validation accounts
            /// for.
            #[must_use]
            pub fn wirings_clone(&self) -> HashMap<RevisionId, Arc<ModuleWiring>> {
                self.state.wirings.clone()
            }

            /// Current modules whose current revision carries the given
            /// identity, excluding `exclude`.
            #[must_use]
            pub fn collision_candidates(
                &self,
                name: &str,
                version: &Version,
                exclude: Option<ModuleId>,
            ) -> Vec<Arc<Module>> {
                self.state
                    .modules_by_id
                    .values()
                    .filter(|m| Some(m.id()) != exclude)
                    .filter(|m| {
                        m.current_revision().is_some_and(|r| {
                            r.symbolic_name() == name && r.version() == version
                        })
                    })
                    .cloned()
                    .collect()
            }

            /// Capability index entries for a namespace; candidates for new
            /// resolutions.
            #[must_use]
            pub fn capabilities_in(
                &self,
                namespace: &str,
            ) -> Vec<(Arc<ModuleRevision>, Capability)> {
                self.state
                    .capabilities
                    .get(namespace)
                    .cloned()
                    .unwrap_or_default()
            }

            /// Revisions that are no longer current but whose wirings are
            /// still present.
            #[must_use]
            pub fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
                self.state
                    .wirings
                    .values()
                    .filter(|w| !w.is_current())
                    .map(|w| Arc::clone(w.revision()))
                    .collect()
            }

            /// Sort `modules` in place by the given keys.
            pub fn sort_modules(&self, modules: &mut [Arc<Module>], keys: &[SortKey]) {
                self.state.sort_modules(modules, keys);
            }
        }
    };
}

shared_read_ops!(DbReadGuard);
shared_read_ops!(DbWriteGuard);

/// Exclusive access to the database; the lock is held until dropped.
pub struct DbWriteGuard<'a> {
    db: &'a ModuleDatabase,
    state: RwLockWriteGuard<'a, DbState>,
}

impl DbWriteGuard<'_> {
    /// Merge a resolve delta into the wiring map.
    pub fn merge_wiring(&mut self, delta: HashMap<RevisionId, Arc<ModuleWiring>>) {
        for (revision, wiring) in delta {
            self.state.wirings.insert(revision, wiring);
        }
        self.db.bump_timestamp();
    }

    /// Replace the wiring map with a pruned copy (refresh commit).
    pub fn set_wirings(&mut self, wirings: HashMap<RevisionId, Arc<ModuleWiring>>) {
        self.state.wirings = wirings;
        self.db.bump_timestamp();
    }

    /// Remove a revision's capabilities from the index.
    pub fn remove_capabilities(&mut self, revision: &Arc<ModuleRevision>) {
        self.state.unindex_capabilities(revision);
    }

    /// Detach a discarded revision from its revisions container and drop its
    /// capabilities.
    pub fn remove_revision(&mut self, revision: &Arc<ModuleRevision>) {
        revision.revisions().remove(revision);
        self.state.unindex_capabilities(revision);
        self.db.bump_timestamp();
    }
}

/// Cheap location-bijection check used by property tests: every
/// non-uninstalled module is reachable through its location.
#[must_use]
pub fn location_bijection_holds(db: &ModuleDatabase) -> bool {
    let guard = db.read();
    guard.modules().iter().all(|m| {
        m.state() == State::Uninstalled
            || guard
                .module_at(m.location())
                .is_some_and(|found| Arc::ptr_eq(&found, m))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_monotone_across_mutations() {
        let db = ModuleDatabase::new();
        let t0 = db.revisions_timestamp();
        let module = db.install(
            "loc:a",
            RevisionBuilder::new().symbolic_name("a"),
            None,
            |_| Box::new(crate::module::NoopActivator),
            Weak::new(),
            false,
        );
        let t1 = db.revisions_timestamp();
        assert!(t1 > t0);
        db.update(&module, RevisionBuilder::new().symbolic_name("a"), None);
        let t2 = db.revisions_timestamp();
        assert!(t2 > t1);
        db.uninstall(&module);
        assert!(db.revisions_timestamp() > t2);
    }

    #[test]
    fn update_replaces_indexed_capabilities() {
        let db = ModuleDatabase::new();
        let module = db.install(
            "loc:a",
            RevisionBuilder::new()
                .symbolic_name("a")
                .capability(Capability::package("pkg.old")),
            None,
            |_| Box::new(crate::module::NoopActivator),
            Weak::new(),
            false,
        );
        db.update(
            &module,
            RevisionBuilder::new()
                .symbolic_name("a")
                .capability(Capability::package("pkg.new")),
            None,
        );
        let guard = db.read();
        let packages: Vec<String> = guard
            .capabilities_in(crate::revision::PACKAGE_NAMESPACE)
            .iter()
            .filter_map(|(_, c)| c.attribute("package").map(str::to_owned))
            .collect();
        assert_eq!(packages, vec!["pkg.new".to_owned()]);
    }

    #[test]
    fn uninstall_frees_the_location() {
        let db = ModuleDatabase::new();
        let module = db.install(
            "loc:a",
            RevisionBuilder::new().symbolic_name("a"),
            None,
            |_| Box::new(crate::module::NoopActivator),
            Weak::new(),
            false,
        );
        assert!(db.module_at("loc:a").is_some());
        db.uninstall(&module);
        assert!(db.module_at("loc:a").is_none());
        assert!(module.revisions().is_uninstalled());
    }
}
