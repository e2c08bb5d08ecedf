//! The module entity: identity, lifecycle state, and the per-module
//! state-change lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use semver::Version;

use crate::container::ModuleContainer;
use crate::error::ContainerError;
use crate::events::ModuleEvent;
use crate::revision::{ModuleRevision, ModuleRevisions};

/// Module identity. Dense, assigned at install time.
pub type ModuleId = u64;

/// Reserved identity of the system module. It exists while the container is
/// open, cannot be uninstalled by the ordinary flow, and refreshing it is a
/// distinguished asynchronous operation.
pub const SYSTEM_MODULE: ModuleId = 0;

/// How long lock acquisition waits before failing with a state-change error.
pub(crate) const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Discrete lifecycle states.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl State {
    /// `{Starting, Active, Stopping}`.
    #[must_use]
    pub fn in_active_set(self) -> bool {
        matches!(self, State::Starting | State::Active | State::Stopping)
    }

    /// `{Resolved} ∪ ACTIVE_SET`.
    #[must_use]
    pub fn in_resolved_set(self) -> bool {
        self == State::Resolved || self.in_active_set()
    }
}

/// The transition kind a state-change lock is held for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Installed,
    Resolved,
    Unresolved,
    Updated,
    Uninstalled,
    Started,
    Stopped,
}

struct LockInner {
    owner: Option<ThreadId>,
    tags: Vec<Transition>,
    waiters: usize,
}

/// Per-module state-change lock.
///
/// Reentrant for the owning thread; each acquisition pushes the transition
/// kind being attempted onto a tag stack so `holds` can answer "is this
/// thread mid-`Started` on this module". Cross-tag re-entrance is required:
/// refresh stops modules while holding their `Unresolved` transition, and
/// `start` resolves through the container while holding `Started`.
struct StateChangeLock {
    inner: Mutex<LockInner>,
    freed: Condvar,
}

impl StateChangeLock {
    fn new() -> Self {
        StateChangeLock {
            inner: Mutex::new(LockInner {
                owner: None,
                tags: Vec::new(),
                waiters: 0,
            }),
            freed: Condvar::new(),
        }
    }

    fn lock(&self, kind: Transition, timeout: Duration) -> bool {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(me);
                    inner.tags.push(kind);
                    return true;
                }
                Some(owner) if owner == me => {
                    inner.tags.push(kind);
                    return true;
                }
                Some(_) => {
                    inner.waiters += 1;
                    let timed_out = self.freed.wait_until(&mut inner, deadline).timed_out();
                    inner.waiters -= 1;
                    if timed_out && inner.owner.is_some() {
                        return false;
                    }
                }
            }
        }
    }

    fn unlock(&self, kind: Transition) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.owner, Some(thread::current().id()));
        if let Some(at) = inner.tags.iter().rposition(|t| *t == kind) {
            inner.tags.remove(at);
        }
        if inner.tags.is_empty() {
            inner.owner = None;
            if inner.waiters > 0 {
                self.freed.notify_all();
            }
        }
    }

    fn holds(&self, kind: Transition) -> bool {
        let inner = self.inner.lock();
        inner.owner == Some(thread::current().id()) && inner.tags.contains(&kind)
    }
}

/// RAII release of one transition acquisition.
pub(crate) struct TransitionGuard {
    module: Arc<Module>,
    kind: Transition,
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.module.lock.unlock(self.kind);
    }
}

/// Options for [`Module::start`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Do not persist activation settings.
    pub transient: bool,
    /// Only start when the module is marked auto-start.
    pub transient_if_auto_start: bool,
    /// Resume after a transient stop; gated on the persisted auto-start
    /// setting and never persists.
    pub transient_resume: bool,
    /// Record the lazy activation policy when persisting settings.
    pub use_activation_policy: bool,
}

impl StartOptions {
    /// A persistent start (records the auto-start setting).
    #[must_use]
    pub fn persistent() -> Self {
        StartOptions::default()
    }

    /// A persistent start recording the lazy activation policy.
    #[must_use]
    pub fn lazy() -> Self {
        StartOptions {
            use_activation_policy: true,
            ..StartOptions::default()
        }
    }

    #[must_use]
    pub fn transient() -> Self {
        StartOptions {
            transient: true,
            ..StartOptions::default()
        }
    }

    /// Transient resume after a refresh or update stop. Unlike a plain
    /// transient start, a resume below the active start level is not an
    /// error; the ramp picks the module up later.
    #[must_use]
    pub fn resume() -> Self {
        StartOptions {
            transient_resume: true,
            ..StartOptions::default()
        }
    }

    /// The auto-start probe used after resolve and by the start-level ramp.
    #[must_use]
    pub fn auto_start_resume() -> Self {
        StartOptions {
            transient_if_auto_start: true,
            transient_resume: true,
            ..StartOptions::default()
        }
    }
}

/// Options for [`Module::stop`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Do not clear persisted activation settings.
    pub transient: bool,
}

impl StopOptions {
    #[must_use]
    pub fn transient() -> Self {
        StopOptions { transient: true }
    }

    #[must_use]
    pub fn persistent() -> Self {
        StopOptions::default()
    }
}

/// Per-module lifecycle driver. Supplied by the adaptor at install time; the
/// container invokes it outside the database lock, so it may block.
pub trait ModuleActivator: Send + Sync {
    /// # Errors
    /// Failures surface as [`ContainerError::Activator`] to direct callers
    /// and as container `Error` events during orchestration.
    fn start(&self) -> anyhow::Result<()>;

    /// # Errors
    /// Failures surface as [`ContainerError::Activator`] to direct callers
    /// and as container `Error` events during orchestration.
    fn stop(&self) -> anyhow::Result<()>;
}

/// Activator that does nothing; the default for adaptors without a
/// lifecycle implementation.
pub struct NoopActivator;

impl ModuleActivator for NoopActivator {
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A long-lived component with identity, lifecycle state, and one current
/// revision.
pub struct Module {
    id: ModuleId,
    location: String,
    state: RwLock<State>,
    start_level: AtomicU32,
    revisions: Arc<ModuleRevisions>,
    activator: Box<dyn ModuleActivator>,
    lock: StateChangeLock,
    container: Weak<ModuleContainer>,
}

impl Module {
    pub(crate) fn new(
        id: ModuleId,
        location: String,
        start_level: u32,
        activator: Box<dyn ModuleActivator>,
        container: Weak<ModuleContainer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Module>| Module {
            id,
            location,
            state: RwLock::new(State::Installed),
            start_level: AtomicU32::new(start_level),
            revisions: Arc::new(ModuleRevisions::new(me.clone())),
            activator,
            lock: StateChangeLock::new(),
            container,
        })
    }

    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.write() = state;
    }

    #[must_use]
    pub fn start_level(&self) -> u32 {
        self.start_level.load(Ordering::Acquire)
    }

    pub(crate) fn store_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::Release);
    }

    #[must_use]
    pub fn revisions(&self) -> &Arc<ModuleRevisions> {
        &self.revisions
    }

    /// The current revision, or `None` once uninstalled.
    #[must_use]
    pub fn current_revision(&self) -> Option<Arc<ModuleRevision>> {
        self.revisions.current()
    }

    /// The symbolic name of the current revision.
    #[must_use]
    pub fn symbolic_name(&self) -> Option<String> {
        self.current_revision()
            .map(|r| r.symbolic_name().to_owned())
    }

    /// The version of the current revision.
    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.current_revision().map(|r| r.version().clone())
    }

    fn container(&self) -> Result<Arc<ModuleContainer>, ContainerError> {
        self.container.upgrade().ok_or(ContainerError::Closed)
    }

    pub(crate) fn lock_transition(
        self: &Arc<Self>,
        kind: Transition,
    ) -> Result<TransitionGuard, ContainerError> {
        if self.lock.lock(kind, STATE_CHANGE_TIMEOUT) {
            Ok(TransitionGuard {
                module: Arc::clone(self),
                kind,
            })
        } else {
            tracing::debug!(
                module = self.id,
                location = %self.location,
                transition = ?kind,
                "state change lock timed out"
            );
            Err(ContainerError::StateChange {
                key: self.location.clone(),
            })
        }
    }

    /// Whether the current thread holds this module's state-change lock for
    /// `kind`. Used to suppress reentrant starts while a `Started`
    /// transition is already underway on this thread.
    #[must_use]
    pub fn holds_transition(&self, kind: Transition) -> bool {
        self.lock.holds(kind)
    }

    fn check_valid(&self) -> Result<(), ContainerError> {
        if self.state() == State::Uninstalled {
            return Err(ContainerError::Uninstalled {
                location: self.location.clone(),
            });
        }
        Ok(())
    }

    /// Start this module.
    ///
    /// Persists activation settings unless the start is transient, gates on
    /// the auto-start setting for `transient_if_auto_start` /
    /// `transient_resume`, gates on the active start level, resolves the
    /// module if it is merely installed, and finally drives the activator.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when the transition lock times out,
    /// [`ContainerError::Uninstalled`], [`ContainerError::StartLevelGate`]
    /// for a transient start below the active level,
    /// [`ContainerError::Resolution`] when the module cannot be resolved,
    /// and [`ContainerError::Activator`] when the activator fails.
    pub fn start(self: &Arc<Self>, options: StartOptions) -> Result<(), ContainerError> {
        let container = self.container()?;
        if self.holds_transition(Transition::Started) {
            tracing::debug!(module = self.id, "suppressing reentrant start");
            return Ok(());
        }
        let _transition = self.lock_transition(Transition::Started)?;
        self.check_valid()?;

        if !options.transient && !options.transient_resume {
            container
                .database()
                .set_activation_settings(self.id, true, options.use_activation_policy);
        }
        if (options.transient_if_auto_start || options.transient_resume)
            && !container.database().auto_start(self.id)
        {
            return Ok(());
        }

        if self.id != SYSTEM_MODULE && container.start_level().active_level() < self.start_level()
        {
            if options.transient {
                return Err(ContainerError::StartLevelGate {
                    location: self.location.clone(),
                });
            }
            // The ramp starts this module once its level is reached.
            return Ok(());
        }

        if self.state() == State::Installed {
            container.resolve(std::slice::from_ref(self), true)?;
            if !self.state().in_resolved_set() {
                return Err(ContainerError::resolution(format!(
                    "could not resolve module at '{}'",
                    self.location
                )));
            }
        }
        if self.state() == State::Active {
            return Ok(());
        }

        self.set_state(State::Starting);
        match self.activator.start() {
            Ok(()) => {
                self.set_state(State::Active);
                tracing::info!(module = self.id, location = %self.location, "started module");
                container
                    .adaptor()
                    .publish_module_event(ModuleEvent::Started, self, Some(self));
                Ok(())
            }
            Err(error) => {
                self.set_state(State::Resolved);
                tracing::warn!(
                    module = self.id,
                    location = %self.location,
                    error = %error,
                    "module activator failed to start"
                );
                Err(ContainerError::Activator(error))
            }
        }
    }

    /// Stop this module, clearing persisted activation settings unless the
    /// stop is transient.
    ///
    /// # Errors
    /// [`ContainerError::StateChange`] when the transition lock times out,
    /// [`ContainerError::Uninstalled`], and [`ContainerError::Activator`]
    /// when the activator fails (the module still lands in `Resolved`).
    pub fn stop(self: &Arc<Self>, options: StopOptions) -> Result<(), ContainerError> {
        let container = self.container()?;
        let _transition = self.lock_transition(Transition::Stopped)?;
        self.check_valid()?;

        if !options.transient {
            container
                .database()
                .set_activation_settings(self.id, false, false);
        }
        if !self.state().in_active_set() {
            return Ok(());
        }

        self.set_state(State::Stopping);
        let result = self.activator.stop();
        self.set_state(State::Resolved);
        tracing::info!(module = self.id, location = %self.location, "stopped module");
        container
            .adaptor()
            .publish_module_event(ModuleEvent::Stopped, self, Some(self));
        result.map_err(ContainerError::Activator)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .field("start_level", &self.start_level())
            .finish_non_exhaustive()
    }
}
