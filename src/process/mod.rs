//! Supervision of the core binary as a child process.
//!
//! A [`ProcessSupervisor`] tracks at most one child. Starting reclaims the target
//! port from orphaned instances of our own (see [`port`]), spawns the binary with
//! `-config <path>` inside its install directory, appends its output to a log file
//! and confirms the child survives a short window before reporting success.
//!
//! Dry runs are the same launch on an ephemeral port with a temporary copy of the
//! configuration that is removed again when the instance stops.

pub mod port;

use crate::config::core_config;
use crate::constants::{PROCESS_POLL_INTERVAL, START_CONFIRM_WINDOW, STOP_GRACE_PERIOD};
use crate::core::{Result, SupervisorError};
use crate::utils::fs::{ensure_dir, remove_file};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Public view of a tracked child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub port: u16,
    pub dry_run: bool,
    pub executable: PathBuf,
    pub config: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle control over a single supervised process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch `executable` with `config`, listening on `port`.
    async fn start(&self, executable: &Path, config: &Path, port: u16) -> Result<ProcessInfo>;

    /// Launch `executable` on an ephemeral port with an overlaid copy of `config`.
    async fn start_dry_run(&self, executable: &Path, config: &Path) -> Result<ProcessInfo>;

    /// Stop the tracked process. Succeeds when nothing is running.
    async fn stop(&self) -> Result<()>;

    /// True while the tracked process is alive.
    async fn is_running(&self) -> bool;

    /// The tracked process, if alive.
    async fn current(&self) -> Option<ProcessInfo>;
}

struct RunningProcess {
    child: Child,
    info: ProcessInfo,
    log: File,
    temp_config: Option<PathBuf>,
}

impl RunningProcess {
    fn note(&mut self, message: &str) {
        let _ = writeln!(self.log, "[corekeep {}] {}", Utc::now().to_rfc3339(), message);
    }

    fn cleanup(&mut self) {
        let _ = self.log.flush();
        if let Some(path) = self.temp_config.take()
            && let Err(e) = remove_file(&path)
        {
            warn!("Failed to remove dry-run configuration {}: {}", path.display(), e);
        }
    }
}

/// Spawns and tracks the core binary.
pub struct ProcessSupervisor {
    host: String,
    versions_dir: PathBuf,
    log_path: PathBuf,
    tmp_dir: PathBuf,
    confirm_window: Duration,
    running: Mutex<Option<RunningProcess>>,
}

impl ProcessSupervisor {
    /// Create a supervisor.
    ///
    /// `versions_dir` identifies orphans of ours when the port is busy, `log_path`
    /// receives the child's output and `tmp_dir` holds dry-run configurations.
    pub fn new(
        host: impl Into<String>,
        versions_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            versions_dir: versions_dir.into(),
            log_path: log_path.into(),
            tmp_dir: tmp_dir.into(),
            confirm_window: START_CONFIRM_WINDOW,
            running: Mutex::new(None),
        }
    }

    /// Override how long a fresh child must survive before start succeeds.
    #[must_use]
    pub const fn with_confirm_window(mut self, window: Duration) -> Self {
        self.confirm_window = window;
        self
    }

    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn launch(
        &self,
        executable: &Path,
        config: &Path,
        port: u16,
        temp_config: Option<PathBuf>,
    ) -> Result<ProcessInfo> {
        let mut slot = self.running.lock().await;
        if let Some(existing) = slot.as_mut() {
            if matches!(existing.child.try_wait(), Ok(None)) {
                return Err(SupervisorError::AlreadyRunning {
                    pid: existing.info.pid,
                });
            }
            existing.note("process exited");
            existing.cleanup();
            *slot = None;
        }

        let result = self.spawn_confirmed(executable, config, port, temp_config.is_some()).await;
        match result {
            Ok((child, info, log)) => {
                info!(
                    "Started {} (pid {}) on port {}{}",
                    executable.display(),
                    info.pid,
                    port,
                    if info.dry_run { " [dry run]" } else { "" }
                );
                *slot = Some(RunningProcess {
                    child,
                    info: info.clone(),
                    log,
                    temp_config,
                });
                Ok(info)
            }
            Err(e) => {
                if let Some(path) = temp_config {
                    let _ = remove_file(&path);
                }
                Err(e)
            }
        }
    }

    async fn spawn_confirmed(
        &self,
        executable: &Path,
        config: &Path,
        port: u16,
        dry_run: bool,
    ) -> Result<(Child, ProcessInfo, File)> {
        if !executable.is_file() {
            return Err(SupervisorError::StartFailed {
                reason: format!("executable {} does not exist", executable.display()),
            });
        }
        port::ensure_port_available(&self.host, port, &self.versions_dir).await?;

        let mut log = self.open_log()?;
        let _ = writeln!(
            log,
            "[corekeep {}] starting {} -config {} (port {})",
            Utc::now().to_rfc3339(),
            executable.display(),
            config.display(),
            port
        );
        let stdout = log.try_clone().map_err(|e| SupervisorError::fs("clone", &self.log_path, &e))?;
        let stderr = log.try_clone().map_err(|e| SupervisorError::fs("clone", &self.log_path, &e))?;

        let mut command = Command::new(executable);
        command
            .arg("-config")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }

        debug!("Spawning {:?}", command);
        let mut child = command.spawn().map_err(|e| SupervisorError::StartFailed {
            reason: format!("failed to spawn {}: {e}", executable.display()),
        })?;

        let started = Instant::now();
        while started.elapsed() < self.confirm_window {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = writeln!(log, "[corekeep {}] exited: {status}", Utc::now().to_rfc3339());
                    return Err(SupervisorError::StartFailed {
                        reason: format!("process exited during startup ({status})"),
                    });
                }
                Ok(None) => tokio::time::sleep(PROCESS_POLL_INTERVAL).await,
                Err(e) => {
                    return Err(SupervisorError::StartFailed {
                        reason: format!("cannot query process status: {e}"),
                    });
                }
            }
        }

        let Some(pid) = child.id() else {
            return Err(SupervisorError::StartTimeout {
                timeout_ms: u64::try_from(self.confirm_window.as_millis()).unwrap_or(u64::MAX),
            });
        };

        let info = ProcessInfo {
            pid,
            port,
            dry_run,
            executable: executable.to_path_buf(),
            config: config.to_path_buf(),
            started_at: Utc::now(),
        };
        Ok((child, info, log))
    }

    fn open_log(&self) -> Result<File> {
        if let Some(parent) = self.log_path.parent() {
            ensure_dir(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| SupervisorError::fs("open log", &self.log_path, &e))
    }

    async fn terminate(child: &mut Child) -> Result<()> {
        let Some(pid) = child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            port::send_signal(pid, false)?;
            let deadline = Instant::now() + STOP_GRACE_PERIOD;
            while Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return Ok(());
                }
                tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
            }
            warn!("Process {} did not exit within {:?}, killing it", pid, STOP_GRACE_PERIOD);
        }

        child.kill().await.map_err(|e| SupervisorError::Other {
            message: format!("failed to kill pid {pid}: {e}"),
        })
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn start(&self, executable: &Path, config: &Path, port: u16) -> Result<ProcessInfo> {
        self.launch(executable, config, port, None).await
    }

    async fn start_dry_run(&self, executable: &Path, config: &Path) -> Result<ProcessInfo> {
        let port = port::allocate_ephemeral_port(&self.host)?;
        ensure_dir(&self.tmp_dir)?;
        let temp_config = self.tmp_dir.join(format!("dry-run-{}.yaml", uuid::Uuid::new_v4()));
        core_config::write_overlay(config, &temp_config, port)?;
        debug!("Dry-run configuration {} on port {}", temp_config.display(), port);

        let config_path = temp_config.clone();
        self.launch(executable, &config_path, port, Some(temp_config)).await
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let pid = running.info.pid;
        let result = match running.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => Self::terminate(&mut running.child).await,
        };
        running.note("process stopped");
        running.cleanup();
        info!("Stopped core process (pid {})", pid);
        result
    }

    async fn is_running(&self) -> bool {
        self.current().await.is_some()
    }

    async fn current(&self) -> Option<ProcessInfo> {
        let mut slot = self.running.lock().await;
        let running = slot.as_mut()?;
        match running.child.try_wait() {
            Ok(None) => Some(running.info.clone()),
            Ok(Some(status)) => {
                warn!("Core process {} exited unexpectedly ({})", running.info.pid, status);
                running.note(&format!("process exited ({status})"));
                running.cleanup();
                *slot = None;
                None
            }
            Err(e) => {
                warn!("Cannot query core process {}: {}", running.info.pid, e);
                Some(running.info.clone())
            }
        }
    }
}
