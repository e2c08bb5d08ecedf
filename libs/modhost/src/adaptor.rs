//! The container adaptor: everything the container asks its host
//! environment for.
//!
//! The adaptor is an external collaborator. Its event methods are
//! fire-and-forget and must be thread-safe; they are called while the
//! container may be holding state-change locks and therefore must not
//! re-enter the container.

use std::sync::Arc;

use crate::error::{AdminPermission, ContainerError};
use crate::events::{ContainerEvent, EventListener, ModuleEvent};
use crate::module::{Module, ModuleActivator, ModuleId, NoopActivator};

/// Which admission operation is consulting the collision hook.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollisionMode {
    Installing,
    Updating,
}

/// Untrusted hook consulted when an install/update would create a second
/// module with an existing `(symbolic name, version)` identity.
///
/// The hook may remove candidates in place to allow the operation to
/// proceed. It may block arbitrarily; the container calls it outside the
/// database read lock.
pub trait CollisionHook: Send + Sync {
    fn filter_collisions(
        &self,
        mode: CollisionMode,
        target: &Arc<Module>,
        candidates: &mut Vec<Arc<Module>>,
    );
}

/// Host-environment surface consumed by the container.
pub trait ContainerAdaptor: Send + Sync {
    /// Publish a module lifecycle event. `origin` is the module that caused
    /// the event (the installer for `Installed`, the module itself
    /// otherwise).
    fn publish_module_event(
        &self,
        event: ModuleEvent,
        module: &Arc<Module>,
        origin: Option<&Arc<Module>>,
    );

    /// Publish a container event. Implementations deliver the event to the
    /// supplied operation `listeners` in addition to any global listeners
    /// the environment maintains.
    fn publish_container_event(
        &self,
        event: ContainerEvent,
        module: &Arc<Module>,
        error: Option<&ContainerError>,
        listeners: &[EventListener],
    );

    /// The collision hook, if the environment installed one.
    fn collision_hook(&self) -> Option<Arc<dyn CollisionHook>> {
        None
    }

    /// Whether `target` is visible to the context that `origin` installs
    /// from. Install returns the existing module at a location only when it
    /// is visible to the origin.
    fn is_visible(&self, origin: &Arc<Module>, target: &Arc<Module>) -> bool {
        let _ = (origin, target);
        true
    }

    /// String configuration lookup. The container recognizes
    /// [`crate::startlevel::BEGINNING_START_LEVEL_PROP`].
    fn get_property(&self, key: &str) -> Option<String> {
        let _ = key;
        None
    }

    /// Admin permission check for privileged operations.
    fn check_permission(&self, module: &Arc<Module>, permission: AdminPermission) -> bool {
        let _ = (module, permission);
        true
    }

    /// Create the lifecycle driver for a module being installed. The
    /// activator performs the actual `start`/`stop` work.
    fn create_activator(&self, location: &str, id: ModuleId) -> Box<dyn ModuleActivator> {
        let _ = (location, id);
        Box::new(NoopActivator)
    }

    /// Signal from the asynchronous system-module refresh path: the system
    /// module has been stopped and the environment should re-launch it.
    fn refreshed_system_module(&self) {}
}
