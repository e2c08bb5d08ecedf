//! Error taxonomy for container operations.

use semver::Version;
use thiserror::Error;

/// Admin permissions checked before privileged container operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AdminPermission {
    /// Required for `update` and `uninstall`.
    Lifecycle,
    /// Required for the wiring facade's `refresh_modules` / `resolve_modules`.
    Resolve,
}

impl std::fmt::Display for AdminPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminPermission::Lifecycle => write!(f, "lifecycle"),
            AdminPermission::Resolve => write!(f, "resolve"),
        }
    }
}

/// Errors surfaced by container operations.
///
/// Lifecycle errors raised by module activators while the container is
/// orchestrating (resolve auto-start, refresh stop, start-level ramp) are
/// *not* represented here; those are published as container `Error` events
/// and the orchestration continues.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// A state-change or keyed lock could not be acquired within the timeout.
    #[error("timed out waiting for a state change on '{key}'")]
    StateChange { key: String },

    /// The collision hook rejected the operation.
    #[error("operation on '{location}' rejected by the collision hook")]
    RejectedByHook { location: String },

    /// A module with the same symbolic name and version is already installed.
    #[error("a module named '{name}' at version {version} is already installed")]
    DuplicateModule { name: String, version: Version },

    /// Resolution failed, either in the resolver or because the container
    /// synthesized an inconsistency (dynamic wire mismatch, resolve during a
    /// system-module refresh).
    #[error("resolution failed")]
    Resolution {
        #[source]
        source: anyhow::Error,
    },

    /// The adaptor denied an admin permission.
    #[error("admin permission denied: {0}")]
    PermissionDenied(AdminPermission),

    /// The target module is uninstalled.
    #[error("module at '{location}' is uninstalled")]
    Uninstalled { location: String },

    /// The operation is not permitted on the system module.
    #[error("operation not permitted on the system module")]
    SystemModule,

    /// A transient start was requested below the active start level.
    #[error("module at '{location}' cannot be started transiently below its start level")]
    StartLevelGate { location: String },

    /// An invalid start-level operation (level < 1, or targeting the system
    /// module).
    #[error("invalid start level operation: {reason}")]
    InvalidStartLevel { reason: String },

    /// The engine's dispatcher has been closed; reopen the container first.
    #[error("the container is closed")]
    Closed,

    /// A module activator failed while the caller asked for the outcome.
    #[error("module activator failed")]
    Activator(#[source] anyhow::Error),
}

impl ContainerError {
    pub(crate) fn resolution(reason: impl Into<String>) -> Self {
        ContainerError::Resolution {
            source: anyhow::Error::msg(reason.into()),
        }
    }
}
