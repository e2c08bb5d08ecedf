//! The resolver contract.
//!
//! The resolver is an external collaborator: a pure function from triggers,
//! unresolved revisions, and the current wirings to a *delta wiring*. The
//! container snapshots its inputs under the database read lock, invokes the
//! resolver with no locks held, and validates the snapshot against the
//! revisions timestamp before committing the delta.

use std::collections::HashMap;
use std::sync::Arc;

use crate::database::ModuleDatabase;
use crate::revision::{ModuleRevision, Requirement, RevisionId};
use crate::wiring::ModuleWiring;

/// A minimal set of wiring changes produced by the resolver.
///
/// Entries for revisions that already have a published wiring carry fresh
/// wiring objects whose content replaces the published one in place; entries
/// for newly resolved revisions carry their brand-new wiring.
pub type DeltaWiring = HashMap<RevisionId, Arc<ModuleWiring>>;

/// Constraint solver over capabilities and requirements.
pub trait ModuleResolver: Send + Sync {
    /// Compute the delta wiring for a resolve round.
    ///
    /// `triggers` must resolve when `triggers_mandatory`; `unresolved` lists
    /// every other candidate revision; `wirings` is the snapshot the delta is
    /// computed against. An empty delta means nothing left to do.
    ///
    /// # Errors
    /// A resolution failure; the container wraps it into
    /// [`crate::ContainerError::Resolution`].
    fn resolve_delta(
        &self,
        triggers: &[Arc<ModuleRevision>],
        triggers_mandatory: bool,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
        db: &ModuleDatabase,
    ) -> anyhow::Result<DeltaWiring>;

    /// Compute a delta that satisfies one projected dynamic `package`
    /// requirement of an already-resolved revision, or an empty delta when
    /// no provider exists.
    ///
    /// # Errors
    /// A resolution failure for this candidate requirement.
    fn resolve_dynamic_delta(
        &self,
        requirement: &Requirement,
        revision: &Arc<ModuleRevision>,
        unresolved: &[Arc<ModuleRevision>],
        wirings: &DeltaWiring,
        db: &ModuleDatabase,
    ) -> anyhow::Result<DeltaWiring>;
}
