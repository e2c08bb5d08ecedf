//! Wirings and wires: the resolved state of the capability graph.
//!
//! Wires are shared records held by both endpoint wirings; there are no
//! owning back-references, so the graph stays cycle-free. Invalidation is a
//! one-way, idempotent flag: an invalidated wiring answers every lookup with
//! an empty result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::revision::{Capability, ModuleRevision, Requirement};

/// A directed binding between a requirement and a capability.
pub struct ModuleWire {
    requirer: Arc<ModuleRevision>,
    requirement: Requirement,
    provider: Arc<ModuleRevision>,
    capability: Capability,
    valid: AtomicBool,
}

impl ModuleWire {
    #[must_use]
    pub fn new(
        requirer: Arc<ModuleRevision>,
        requirement: Requirement,
        provider: Arc<ModuleRevision>,
        capability: Capability,
    ) -> Arc<Self> {
        Arc::new(ModuleWire {
            requirer,
            requirement,
            provider,
            capability,
            valid: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn requirer(&self) -> &Arc<ModuleRevision> {
        &self.requirer
    }

    #[must_use]
    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<ModuleRevision> {
        &self.provider
    }

    #[must_use]
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Idempotent; a dead wire stays dead.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ModuleWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleWire")
            .field("namespace", &self.capability.namespace)
            .field("requirer", &self.requirer.id())
            .field("provider", &self.provider.id())
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct WiringState {
    capabilities: Vec<Capability>,
    requirements: Vec<Requirement>,
    provided: Vec<Arc<ModuleWire>>,
    required: Vec<Arc<ModuleWire>>,
}

/// The resolved binding of one revision.
///
/// Published wirings may be mutated in place only while the caller holds the
/// module database's write lock; wirings still under construction by a
/// resolver are free.
pub struct ModuleWiring {
    revision: Arc<ModuleRevision>,
    state: RwLock<WiringState>,
    valid: AtomicBool,
}

impl ModuleWiring {
    #[must_use]
    pub fn new(
        revision: Arc<ModuleRevision>,
        capabilities: Vec<Capability>,
        requirements: Vec<Requirement>,
        provided: Vec<Arc<ModuleWire>>,
        required: Vec<Arc<ModuleWire>>,
    ) -> Arc<Self> {
        Arc::new(ModuleWiring {
            revision,
            state: RwLock::new(WiringState {
                capabilities,
                requirements,
                provided,
                required,
            }),
            valid: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The effective capabilities after resolution; empty once invalidated.
    #[must_use]
    pub fn capabilities(&self) -> Vec<Capability> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.state.read().capabilities.clone()
    }

    /// The effective requirements after resolution; empty once invalidated.
    #[must_use]
    pub fn requirements(&self) -> Vec<Requirement> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.state.read().requirements.clone()
    }

    /// Wires through which other revisions consume this revision's
    /// capabilities; empty once invalidated.
    #[must_use]
    pub fn provided_wires(&self) -> Vec<Arc<ModuleWire>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.state.read().provided.clone()
    }

    /// Wires through which this revision consumes capabilities; empty once
    /// invalidated.
    #[must_use]
    pub fn required_wires(&self) -> Vec<Arc<ModuleWire>> {
        if !self.is_valid() {
            return Vec::new();
        }
        self.state.read().required.clone()
    }

    /// A wiring is current iff it is valid and its revision is the current
    /// revision of a non-uninstalled module.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.is_valid() && self.revision.is_current()
    }

    /// A wiring is in use while it is current or another wiring still
    /// consumes it.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.is_current() || !self.provided_wires().is_empty()
    }

    /// Replace this wiring's content with `other`'s. Used when a resolve
    /// delta carries fresh state for an already-published wiring; the caller
    /// holds the database write lock.
    pub fn update_from(&self, other: &ModuleWiring) {
        let incoming = other.state.read();
        let mut state = self.state.write();
        state.capabilities = incoming.capabilities.clone();
        state.requirements = incoming.requirements.clone();
        state.provided = incoming.provided.clone();
        state.required = incoming.required.clone();
    }

    pub fn add_provided_wire(&self, wire: Arc<ModuleWire>) {
        self.state.write().provided.push(wire);
    }

    /// Append a wire at the tail of the required list (dynamic resolution
    /// grows the list only at the tail).
    pub fn add_required_wire(&self, wire: Arc<ModuleWire>) {
        self.state.write().required.push(wire);
    }

    /// Strip `wires` from the provided list without invalidating the wiring
    /// itself; used when a dependent is refreshed away while this provider
    /// survives.
    pub fn remove_provided_wires(&self, wires: &[Arc<ModuleWire>]) {
        let mut state = self.state.write();
        state
            .provided
            .retain(|w| !wires.iter().any(|dead| Arc::ptr_eq(w, dead)));
    }

    /// Invalidate this wiring and every wire it holds. Idempotent.
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            let state = self.state.read();
            for wire in state.provided.iter().chain(state.required.iter()) {
                wire.invalidate();
            }
        }
    }

    /// Consistency check applied when wirings are loaded at container open.
    pub(crate) fn validate(&self) {
        let state = self.state.read();
        for wire in &state.provided {
            debug_assert!(
                Arc::ptr_eq(wire.provider(), &self.revision),
                "provided wire does not point back at this revision"
            );
        }
        for wire in &state.required {
            debug_assert!(
                Arc::ptr_eq(wire.requirer(), &self.revision),
                "required wire does not point back at this revision"
            );
        }
    }
}

impl std::fmt::Debug for ModuleWiring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ModuleWiring")
            .field("revision", &self.revision.id())
            .field("valid", &self.is_valid())
            .field("provided", &state.provided.len())
            .field("required", &state.required.len())
            .finish()
    }
}
