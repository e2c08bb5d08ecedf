//! ModHost — the module container core of a dynamic component runtime.
//!
//! The container installs, updates, uninstalls, resolves, refreshes, and
//! start-level-orders a population of modules whose dependencies form a
//! capability/requirement graph. Consistency is guaranteed by optimistic
//! concurrency against the database's monotone revisions timestamp: engines
//! snapshot under the read lock, compute with no locks held, and validate
//! the timestamp under the write lock before committing.
//!
//! The constraint solver ([`resolver::ModuleResolver`]), the host
//! environment ([`adaptor::ContainerAdaptor`]), and the per-module lifecycle
//! driver ([`module::ModuleActivator`]) are external collaborators supplied
//! by the embedder.

pub mod adaptor;
pub mod container;
pub mod database;
mod dispatcher;
pub mod error;
pub mod events;
pub mod lockset;
pub mod module;
pub mod resolver;
pub mod revision;
pub mod startlevel;
pub mod test_support;
pub mod wiring;

pub use adaptor::{CollisionHook, CollisionMode, ContainerAdaptor};
pub use container::{ModuleContainer, SYSTEM_MODULE_LOCATION};
pub use database::{ModuleDatabase, SortKey};
pub use error::{AdminPermission, ContainerError};
pub use events::{ContainerEvent, ContainerListener, EventListener, ModuleEvent};
pub use module::{
    Module, ModuleActivator, ModuleId, NoopActivator, StartOptions, State, StopOptions,
    SYSTEM_MODULE, Transition,
};
pub use resolver::{DeltaWiring, ModuleResolver};
pub use revision::{
    Capability, FRAGMENT_TYPE, HOST_NAMESPACE, ModuleRevision, ModuleRevisions,
    PACKAGE_NAMESPACE, Requirement, RevisionBuilder, RevisionId, RevisionInfo,
};
pub use startlevel::{
    BEGINNING_START_LEVEL_PROP, StartLevelEngine, USE_BEGINNING_START_LEVEL,
};
pub use wiring::{ModuleWire, ModuleWiring};
