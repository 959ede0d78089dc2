//! Top-level lifecycle of the supervised core.
//!
//! The [`Orchestrator`] owns the main [`ProcessControl`], the health monitor loop
//! and the automatic rollback, and fronts the [`UpgradeCoordinator`] for callers.
//! Its public operations never fail past their boundary for lifecycle changes:
//! `start`, `stop` and `restart` return the resulting [`LifecycleState`], which is
//! [`LifecycleState::Error`] when something went wrong. Every transition is also
//! published to subscribers (see [`StateChannel`]).
//!
//! # Health Monitoring
//!
//! After a successful start a monitor task wakes every `health.interval_secs`.
//! It only probes while the state is `running`. A passing probe resets the
//! consecutive failure counter; a failing one increments it, and once
//! `health.failure_threshold` is reached [`Orchestrator::rollback_if_needed`]
//! runs. A rollback that happened restarts the core, which spawns a fresh monitor,
//! so the old loop exits.
//!
//! Stopping cancels the monitor before the process is signalled so a deliberate
//! shutdown is never observed as a health failure.
//!
//! # Serialization
//!
//! Lifecycle operations (start, stop, restart, rollback, version switch) run one
//! at a time behind an internal async mutex. Moving the current pointer also
//! requires the upgrade lock, so a rollback never races an install; a rollback that
//! finds an install in progress is deferred to the next monitor cycle.

pub mod state;

use crate::config::{SupervisorConfig, core_config};
use crate::core::{Result, SupervisorError};
use crate::health::{HealthChecker, HealthProbe};
use crate::process::{ProcessControl, ProcessInfo, ProcessSupervisor};
use crate::release::{ReleaseCache, ReleaseProvider, ReleaseSource};
use crate::store::{StateStore, VersionStore};
use crate::upgrade::{InstallOutcome, InstallPhase, InstallReporter, UpgradeCoordinator};
use crate::utils::platform::HostPlatform;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use state::{LifecycleState, StateChannel, StateReceiver};

struct MonitorHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Collaborators of an [`Orchestrator`].
pub struct Components {
    pub process: Arc<dyn ProcessControl>,
    pub health: Arc<dyn HealthProbe>,
    pub state: Arc<StateStore>,
    pub coordinator: Arc<UpgradeCoordinator>,
}

/// Supervises the current version and rolls back unhealthy ones.
pub struct Orchestrator {
    config: SupervisorConfig,
    store: VersionStore,
    process: Arc<dyn ProcessControl>,
    health: Arc<dyn HealthProbe>,
    state: Arc<StateStore>,
    coordinator: Arc<UpgradeCoordinator>,
    lifecycle: Arc<StateChannel>,
    monitor: Mutex<Option<MonitorHandle>>,
    ops: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: SupervisorConfig, components: Components) -> Arc<Self> {
        Arc::new(Self {
            store: components.coordinator.store().clone(),
            process: components.process,
            health: components.health,
            state: components.state,
            coordinator: components.coordinator,
            lifecycle: Arc::new(StateChannel::new(LifecycleState::Idle)),
            monitor: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// Wire the production components for `config` on this host.
    pub fn from_config(config: SupervisorConfig) -> Result<Arc<Self>> {
        let host = HostPlatform::detect()?;
        let layout = config.layout();
        let releases: Arc<dyn ReleaseProvider> = Arc::new(ReleaseSource::new(
            &config.release,
            ReleaseCache::new(layout.cache_file()),
        )?);
        let state = Arc::new(StateStore::load(layout.state_file())?);
        let health: Arc<dyn HealthProbe> = Arc::new(HealthChecker::new(&config.health)?);
        let main = Arc::new(ProcessSupervisor::new(
            config.host.clone(),
            layout.versions_dir(),
            layout.core_log(),
            layout.tmp_dir(),
        ));
        let dry_run = Arc::new(ProcessSupervisor::new(
            config.host.clone(),
            layout.versions_dir(),
            layout.dry_run_log(),
            layout.tmp_dir(),
        ));
        let coordinator = Arc::new(UpgradeCoordinator::new(
            config.clone(),
            host,
            releases,
            state.clone(),
            dry_run,
            health.clone(),
        )?);

        Ok(Self::new(
            config,
            Components {
                process: main,
                health,
                state,
                coordinator,
            },
        ))
    }

    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &VersionStore {
        &self.store
    }

    #[must_use]
    pub fn coordinator(&self) -> &UpgradeCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    /// Observe lifecycle transitions, starting with the current state.
    pub fn subscribe(&self) -> StateReceiver {
        self.lifecycle.subscribe()
    }

    /// Start the current version and begin health monitoring.
    pub async fn start(self: &Arc<Self>) -> LifecycleState {
        let _ops = self.ops.lock().await;
        self.start_locked().await
    }

    /// Stop monitoring, then stop the process.
    pub async fn stop(&self) -> LifecycleState {
        let _ops = self.ops.lock().await;
        self.stop_locked().await
    }

    pub async fn restart(self: &Arc<Self>) -> LifecycleState {
        let _ops = self.ops.lock().await;
        let stopped = self.stop_locked().await;
        if stopped.is_error() {
            return stopped;
        }
        self.start_locked().await
    }

    /// Roll back to the last-known-good version once the failure threshold is
    /// reached.
    ///
    /// No-op below the threshold, without a last-known-good version, or when the
    /// current version already is the last-known-good one (the failure counter is
    /// reset in that case). The core is restarted on the rolled-back version only if
    /// it was supervised before. Returns whether a rollback happened.
    pub async fn rollback_if_needed(self: &Arc<Self>) -> Result<bool> {
        let _ops = self.ops.lock().await;
        self.threshold_rollback_locked().await
    }

    async fn threshold_rollback_locked(self: &Arc<Self>) -> Result<bool> {
        let failures = self.state.snapshot().consecutive_failures;
        if failures < self.config.health.failure_threshold {
            debug!(
                "{} consecutive failures, threshold {}; no rollback",
                failures, self.config.health.failure_threshold
            );
            return Ok(false);
        }
        self.rollback_locked(false).await
    }

    /// Roll back to the last-known-good version regardless of the failure counter.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RollbackFailed`] when no last-known-good version
    /// is recorded or the switch fails.
    pub async fn force_rollback(self: &Arc<Self>) -> Result<bool> {
        let _ops = self.ops.lock().await;
        self.rollback_locked(true).await
    }

    /// Make installed `version` current, restarting the core if it runs.
    pub async fn use_version(self: &Arc<Self>, version: &str) -> Result<LifecycleState> {
        let _ops = self.ops.lock().await;
        let guard = self.coordinator.lock().try_acquire().await?;
        let was_running = self.process.is_running().await;

        self.store.set_current(version)?;
        self.state.reset_failures()?;
        drop(guard);
        info!("Switched current version to {}", version);

        if !was_running {
            return Ok(self.lifecycle.current());
        }
        let stopped = self.stop_locked().await;
        if let LifecycleState::Error(e) = stopped {
            return Err(e);
        }
        match self.start_locked().await {
            LifecycleState::Error(e) => Err(e),
            state => Ok(state),
        }
    }

    /// Install release `version`, restarting onto it if it was promoted while the
    /// core runs.
    pub async fn install(
        self: &Arc<Self>,
        version: &str,
        set_active: bool,
        reporter: InstallReporter,
    ) -> Result<InstallOutcome> {
        let before = self.lifecycle.current();
        let reporter = self.observe_install(version, reporter);
        let result = self.coordinator.install(version, set_active, &reporter).await;
        self.after_install(before, result).await
    }

    /// Install a local binary as `version`; see [`Orchestrator::install`].
    pub async fn install_from_file(
        self: &Arc<Self>,
        path: &Path,
        version: &str,
        set_active: bool,
        reporter: InstallReporter,
    ) -> Result<InstallOutcome> {
        let before = self.lifecycle.current();
        let reporter = self.observe_install(version, reporter);
        let result = self.coordinator.install_from_file(path, version, set_active, &reporter).await;
        self.after_install(before, result).await
    }

    /// Publish `Installing` for every phase, and `Testing` with the dry-run
    /// instance once it is up.
    fn observe_install(&self, version: &str, reporter: InstallReporter) -> InstallReporter {
        let lifecycle = self.lifecycle.clone();
        let inner = reporter.on_phase.clone();
        let version = version.to_string();
        let reporter = reporter.with_phase(Arc::new(move |phase| {
            if !matches!(phase, InstallPhase::DryRun | InstallPhase::Done) {
                lifecycle.publish(LifecycleState::Installing {
                    version: version.clone(),
                    phase,
                });
            }
            if let Some(inner) = &inner {
                inner(phase);
            }
        }));

        let lifecycle = self.lifecycle.clone();
        let inner = reporter.on_dry_run.clone();
        reporter.with_dry_run(Arc::new(move |version: &str, info: &ProcessInfo| {
            lifecycle.publish(LifecycleState::Testing {
                version: version.to_string(),
                pid: info.pid,
                port: info.port,
            });
            if let Some(inner) = &inner {
                inner(version, info);
            }
        }))
    }

    async fn after_install(
        self: &Arc<Self>,
        before: LifecycleState,
        result: Result<InstallOutcome>,
    ) -> Result<InstallOutcome> {
        match result {
            Ok(outcome) => {
                let _ops = self.ops.lock().await;
                if outcome.activated && self.process.is_running().await {
                    info!("Restarting onto {}", outcome.version);
                    self.stop_locked().await;
                    self.start_locked().await;
                } else {
                    self.lifecycle.publish(self.settled_state(before).await);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.lifecycle.publish(LifecycleState::Error(e.clone()));
                if self.process.is_running().await {
                    self.lifecycle.publish(before);
                }
                Err(e)
            }
        }
    }

    /// `before` if it still describes a live process, else idle.
    async fn settled_state(&self, before: LifecycleState) -> LifecycleState {
        match before {
            LifecycleState::Running { .. } if self.process.is_running().await => before,
            LifecycleState::Error(_) => before,
            _ => LifecycleState::Idle,
        }
    }

    async fn start_locked(self: &Arc<Self>) -> LifecycleState {
        if let Some(info) = self.process.current().await {
            debug!("Core already running (pid {})", info.pid);
            return self.lifecycle.current();
        }

        self.lifecycle.publish(LifecycleState::Starting);
        let state = match self.launch().await {
            Ok(running) => {
                self.spawn_monitor();
                running
            }
            Err(e) => {
                error!("Failed to start core: {}", e);
                LifecycleState::Error(e)
            }
        };
        self.lifecycle.publish(state.clone());
        state
    }

    async fn launch(&self) -> Result<LifecycleState> {
        let layout = self.config.layout();
        let config_path = core_config::ensure_core_config(
            &layout.core_config(),
            self.config.port,
            self.config.legacy_config.as_deref(),
        )?;
        let (version, executable) = self.store.current_executable()?;
        self.coordinator.inspector().validate(&executable)?;

        let info = self.process.start(&executable, &config_path, self.config.port).await?;
        info!("Core {} running (pid {}, port {})", version, info.pid, info.port);
        Ok(LifecycleState::Running {
            version,
            pid: info.pid,
            port: info.port,
            started_at: info.started_at,
        })
    }

    async fn stop_locked(&self) -> LifecycleState {
        self.cancel_monitor();
        if !self.process.is_running().await {
            self.lifecycle.publish(LifecycleState::Idle);
            return LifecycleState::Idle;
        }

        self.lifecycle.publish(LifecycleState::Stopping);
        let state = match self.process.stop().await {
            Ok(()) => LifecycleState::Idle,
            Err(e) => {
                error!("Failed to stop core: {}", e);
                LifecycleState::Error(e)
            }
        };
        self.lifecycle.publish(state.clone());
        state
    }

    async fn rollback_locked(self: &Arc<Self>, force: bool) -> Result<bool> {
        let snapshot = self.state.snapshot();
        let Some(target) = snapshot.last_known_good else {
            if force {
                return Err(SupervisorError::RollbackFailed {
                    reason: "no last-known-good version is recorded".to_string(),
                });
            }
            warn!("Health threshold reached but no last-known-good version is recorded");
            return Ok(false);
        };

        let current = self.store.current()?;
        if current.as_deref() == Some(target.as_str()) {
            info!("Current version {} is already the last known good", target);
            self.state.reset_failures()?;
            return Ok(false);
        }

        let guard = match self.coordinator.lock().try_acquire().await {
            Ok(guard) => guard,
            Err(SupervisorError::UpgradeInProgress) if !force => {
                info!("Install in progress, deferring rollback");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !self.store.is_installed(&target) {
            return Err(SupervisorError::RollbackFailed {
                reason: format!("last-known-good version {target} is no longer installed"),
            });
        }

        let restart = self.lifecycle.current().is_running() || self.process.is_running().await;
        let from = current.unwrap_or_else(|| "none".to_string());
        warn!("Rolling back from {} to {}", from, target);
        self.lifecycle.publish(LifecycleState::RollingBack {
            from,
            to: target.clone(),
        });

        if let LifecycleState::Error(e) = self.stop_locked().await {
            return Err(SupervisorError::RollbackFailed {
                reason: format!("could not stop the running version: {e}"),
            });
        }
        self.store.set_current(&target).map_err(|e| SupervisorError::RollbackFailed {
            reason: e.to_string(),
        })?;
        self.state.reset_failures()?;
        drop(guard);

        if !restart {
            return Ok(true);
        }
        match self.start_locked().await {
            LifecycleState::Error(e) => Err(SupervisorError::RollbackFailed {
                reason: format!("{target} did not start: {e}"),
            }),
            _ => Ok(true),
        }
    }

    fn monitor_slot(&self) -> std::sync::MutexGuard<'_, Option<MonitorHandle>> {
        self.monitor.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn cancel_monitor(&self) {
        if let Some(handle) = self.monitor_slot().take() {
            debug!("Stopping health monitor");
            let _ = handle.cancel.send(true);
            drop(handle.task);
        }
    }

    fn spawn_monitor(self: &Arc<Self>) {
        self.cancel_monitor();
        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(monitor_loop(Arc::downgrade(self), cancelled));
        *self.monitor_slot() = Some(MonitorHandle {
            cancel,
            task,
        });
    }

    /// True while a monitor loop is active.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitor_slot().as_ref().is_some_and(|h| !h.task.is_finished())
    }

    /// One monitor cycle. Returns true when the loop should exit.
    async fn monitor_tick(self: &Arc<Self>, cancelled: &watch::Receiver<bool>) -> bool {
        if !self.lifecycle.current().is_running() {
            return false;
        }

        let alive = self.process.is_running().await;
        let healthy = alive
            && self
                .health
                .is_healthy(&self.config.host, self.config.port, self.config.health.retries)
                .await;
        if *cancelled.borrow() {
            return true;
        }

        if healthy {
            if let Err(e) = self.state.reset_failures() {
                warn!("Failed to persist health state: {}", e);
            }
            return false;
        }

        let failures = match self.state.record_health_failure() {
            Ok(failures) => failures,
            Err(e) => {
                warn!("Failed to persist health state: {}", e);
                return false;
            }
        };
        warn!(
            "Health check failed ({}/{}){}",
            failures,
            self.config.health.failure_threshold,
            if alive { "" } else { ", process exited" }
        );
        if failures < self.config.health.failure_threshold {
            return false;
        }

        // A stop or restart may have won the race for the lock; it cancelled us.
        let _ops = self.ops.lock().await;
        if *cancelled.borrow() {
            debug!("Health monitor cancelled before rolling back");
            return true;
        }
        match self.threshold_rollback_locked().await {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                error!("Automatic rollback failed: {}", e);
                self.lifecycle.publish(LifecycleState::Error(e));
                true
            }
        }
    }
}

async fn monitor_loop(orchestrator: Weak<Orchestrator>, mut cancelled: watch::Receiver<bool>) {
    let interval = match orchestrator.upgrade() {
        Some(o) => o.config.health.interval(),
        None => return,
    };
    debug!("Health monitor started (every {:?})", interval);

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    break;
                }
            }
        }
        if *cancelled.borrow() {
            break;
        }
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        if orchestrator.monitor_tick(&cancelled).await {
            break;
        }
    }
    debug!("Health monitor stopped");
}
