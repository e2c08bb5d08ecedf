//! The start-level state machine and its background dispatcher.
//!
//! The active start level ramps toward a target in unit steps on a dedicated
//! single-consumer worker. Upward steps start modules at the new level,
//! lazy-activation modules first; downward steps stop modules above the new
//! level in reverse dependency order. Per-module start-level changes are
//! dispatched through the same worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::container::ModuleContainer;
use crate::database::SortKey;
use crate::dispatcher::Dispatcher;
use crate::error::ContainerError;
use crate::events::{ContainerEvent, EventListener};
use crate::module::{Module, SYSTEM_MODULE, StartOptions, State, StopOptions};

/// Configuration key for the beginning start level used by
/// [`USE_BEGINNING_START_LEVEL`].
pub const BEGINNING_START_LEVEL_PROP: &str = "framework.beginning.startlevel";

/// Sentinel target asking the engine to read its target from configuration
/// (default 1).
pub const USE_BEGINNING_START_LEVEL: u32 = u32::MAX;

/// Start-level orchestration for one container.
pub struct StartLevelEngine {
    container: Weak<ModuleContainer>,
    /// 0 means "not activated".
    active: AtomicU32,
    dispatcher: Dispatcher,
    /// Serializes framework-level ramps.
    ramp: Mutex<()>,
}

impl StartLevelEngine {
    pub(crate) fn new(container: Weak<ModuleContainer>) -> Self {
        StartLevelEngine {
            container,
            active: AtomicU32::new(0),
            dispatcher: Dispatcher::new("modhost-start-level"),
            ramp: Mutex::new(()),
        }
    }

    /// The active start level; 0 until the engine has been activated.
    #[must_use]
    pub fn active_level(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn open(&self) {
        self.dispatcher.open();
    }

    pub(crate) fn close(&self) {
        self.dispatcher.close();
    }

    fn container(&self) -> Result<Arc<ModuleContainer>, ContainerError> {
        self.container.upgrade().ok_or(ContainerError::Closed)
    }

    /// Assign a module's start level and queue the per-module start-level
    /// event.
    ///
    /// # Errors
    /// [`ContainerError::InvalidStartLevel`] for the system module or a
    /// level below 1, [`ContainerError::Uninstalled`], and
    /// [`ContainerError::Closed`] when the dispatcher is closed.
    pub fn set_module_start_level(
        &self,
        module: &Arc<Module>,
        level: u32,
    ) -> Result<(), ContainerError> {
        if module.id() == SYSTEM_MODULE {
            return Err(ContainerError::InvalidStartLevel {
                reason: "the system module's start level cannot change".to_owned(),
            });
        }
        if level < 1 {
            return Err(ContainerError::InvalidStartLevel {
                reason: format!("start level must be positive, got {level}"),
            });
        }
        if module.state() == State::Uninstalled {
            return Err(ContainerError::Uninstalled {
                location: module.location().to_owned(),
            });
        }
        if module.start_level() == level {
            return Ok(());
        }
        let container = self.container()?;
        container.database().set_start_level(module, level);
        tracing::debug!(module = module.id(), level, "queueing module start-level change");
        let module = Arc::clone(module);
        self.dispatcher
            .dispatch(move || Self::process_module_event(&container, &module, level))
    }

    /// Queue a framework-wide ramp toward `level`.
    ///
    /// # Errors
    /// [`ContainerError::InvalidStartLevel`] for a level below 1 or when the
    /// engine has not been activated, and [`ContainerError::Closed`] when
    /// the dispatcher is closed.
    pub fn set_start_level(
        &self,
        level: u32,
        listeners: Vec<EventListener>,
    ) -> Result<(), ContainerError> {
        if level < 1 || level == USE_BEGINNING_START_LEVEL {
            return Err(ContainerError::InvalidStartLevel {
                reason: format!("start level must be positive, got {level}"),
            });
        }
        if self.active_level() == 0 {
            return Err(ContainerError::InvalidStartLevel {
                reason: "the start level engine has not been activated".to_owned(),
            });
        }
        self.queue_framework_event(level, listeners)
    }

    /// Begin start-level processing from an inactive engine, ramping toward
    /// `target`. Pass [`USE_BEGINNING_START_LEVEL`] to read the target from
    /// the `framework.beginning.startlevel` property (default 1).
    ///
    /// # Errors
    /// [`ContainerError::Closed`] when the dispatcher is closed.
    pub fn activate(
        &self,
        target: u32,
        listeners: Vec<EventListener>,
    ) -> Result<(), ContainerError> {
        self.queue_framework_event(target, listeners)
    }

    fn queue_framework_event(
        &self,
        target: u32,
        listeners: Vec<EventListener>,
    ) -> Result<(), ContainerError> {
        let container = self.container()?;
        tracing::debug!(target, "queueing framework start-level ramp");
        self.dispatcher
            .dispatch(move || Self::process_framework_event(&container, target, &listeners))
    }

    fn beginning_level(container: &ModuleContainer) -> u32 {
        match container.adaptor().get_property(BEGINNING_START_LEVEL_PROP) {
            None => 1,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    value = %raw,
                    "invalid {BEGINNING_START_LEVEL_PROP}; defaulting to 1"
                );
                1
            }),
        }
    }

    /// FRAMEWORK_STARTLEVEL processing, on the dispatcher worker.
    fn process_framework_event(
        container: &Arc<ModuleContainer>,
        target: u32,
        listeners: &[EventListener],
    ) {
        let engine = container.start_level();
        let target = if target == USE_BEGINNING_START_LEVEL {
            Self::beginning_level(container)
        } else {
            target
        };
        let _serial = engine.ramp.lock();
        tracing::info!(from = engine.active_level(), to = target, "start-level ramp");
        loop {
            if container.is_refreshing_system_module() {
                tracing::warn!("start-level ramp aborted: system module refresh in progress");
                return;
            }
            let current = engine.active_level();
            if current == target {
                break;
            }
            if current < target {
                let next = current + 1;
                engine.active.store(next, Ordering::Release);
                if !Self::start_modules_at(container, next) {
                    return;
                }
            } else {
                engine.active.store(current - 1, Ordering::Release);
                if !Self::stop_modules_at(container, current) {
                    return;
                }
            }
        }
        if let Some(system) = container.database().module(SYSTEM_MODULE) {
            container.adaptor().publish_container_event(
                ContainerEvent::StartLevel,
                &system,
                None,
                listeners,
            );
        }
    }

    /// One upward step: start modules whose level equals `level`, lazy
    /// activation first. Returns `false` when aborted by a system refresh.
    fn start_modules_at(container: &Arc<ModuleContainer>, level: u32) -> bool {
        let modules = container
            .database()
            .sorted_modules(&[SortKey::ByStartLevel]);
        for lazy_pass in [true, false] {
            for module in &modules {
                if container.is_refreshing_system_module() {
                    return false;
                }
                let module_level = module.start_level();
                if module_level < level || module.id() == SYSTEM_MODULE {
                    continue;
                }
                if module_level > level {
                    break;
                }
                if container.database().lazy_activation(module.id()) != lazy_pass {
                    continue;
                }
                if let Err(error) = module.start(StartOptions::auto_start_resume()) {
                    tracing::warn!(
                        module = module.id(),
                        level,
                        error = %error,
                        "failed to start module during ramp"
                    );
                    container.publish_error(module, &error);
                }
            }
        }
        true
    }

    /// One downward step: stop active modules whose level equals
    /// `stopping_level`, most dependent first. Returns `false` when aborted
    /// by a system refresh.
    fn stop_modules_at(container: &Arc<ModuleContainer>, stopping_level: u32) -> bool {
        let modules = container
            .database()
            .sorted_modules(&[SortKey::ByStartLevel, SortKey::ByDependency]);
        for module in modules.iter().rev() {
            if container.is_refreshing_system_module() {
                return false;
            }
            if module.start_level() != stopping_level || module.id() == SYSTEM_MODULE {
                continue;
            }
            if module.state().in_active_set() {
                if let Err(error) = module.stop(StopOptions::transient()) {
                    tracing::warn!(
                        module = module.id(),
                        level = stopping_level,
                        error = %error,
                        "failed to stop module during ramp"
                    );
                    container.publish_error(module, &error);
                }
            }
        }
        true
    }

    /// MODULE_STARTLEVEL processing, on the dispatcher worker. Never mutates
    /// the active level.
    fn process_module_event(container: &Arc<ModuleContainer>, module: &Arc<Module>, level: u32) {
        let engine = container.start_level();
        if engine.active_level() < level {
            if module.state().in_active_set() {
                if let Err(error) = module.stop(StopOptions::transient()) {
                    container.publish_error(module, &error);
                }
            }
        } else if let Err(error) = module.start(StartOptions::auto_start_resume()) {
            container.publish_error(module, &error);
        }
    }
}
