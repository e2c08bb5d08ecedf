//! Module and container event kinds.

use std::sync::Arc;

use crate::error::ContainerError;
use crate::module::Module;

/// Lifecycle events published for a single module.
///
/// Publication order for a given module preserves its state transitions
/// (`Installed` before `Resolved`, `Unresolved` before a later `Resolved`,
/// and so on).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModuleEvent {
    Installed,
    Updated,
    Uninstalled,
    Resolved,
    Unresolved,
    Started,
    Stopped,
}

/// Container-wide events.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerEvent {
    /// A refresh job finished (delivered even when the refresh failed).
    Refresh,
    /// A framework start-level ramp finished.
    StartLevel,
    /// A lifecycle error the container swallowed during orchestration.
    Error,
}

/// Callback receiving container events for a specific operation.
///
/// Listeners are invoked from the background worker that executed the
/// operation; they must not re-enter the container.
pub trait ContainerListener: Send + Sync {
    fn container_event(
        &self,
        event: ContainerEvent,
        module: &Arc<Module>,
        error: Option<&ContainerError>,
    );
}

/// Shared handle to a [`ContainerListener`].
pub type EventListener = Arc<dyn ContainerListener>;
