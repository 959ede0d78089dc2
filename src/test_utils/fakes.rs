//! In-memory implementations of the injected seams.

use crate::core::{Result, SupervisorError};
use crate::health::HealthProbe;
use crate::process::{ProcessControl, ProcessInfo};
use crate::release::{CachePolicy, Release, ReleaseProvider, sort_newest_first};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Release provider serving the releases pushed by a test.
#[derive(Debug, Default)]
pub struct StaticReleases {
    releases: Mutex<Vec<Release>>,
}

impl StaticReleases {
    pub fn push(&self, release: Release) {
        self.releases.lock().expect("releases").push(release);
    }
}

#[async_trait]
impl ReleaseProvider for StaticReleases {
    async fn fetch_releases(&self, _policy: CachePolicy) -> Result<Vec<Release>> {
        let mut releases = self.releases.lock().expect("releases").clone();
        sort_newest_first(&mut releases);
        Ok(releases)
    }

    async fn fetch_release(&self, tag: &str) -> Result<Release> {
        let releases = self.fetch_releases(CachePolicy::ReturnCacheIfFresh).await?;
        let found = if tag == "latest" {
            releases.into_iter().find(|r| !r.prerelease && !r.draft)
        } else {
            releases.into_iter().find(|r| r.tag_name == tag)
        };
        found.ok_or_else(|| SupervisorError::ReleaseNotFound {
            tag: tag.to_string(),
        })
    }
}

/// Process control that records calls instead of spawning.
#[derive(Debug)]
pub struct FakeProcess {
    running: Mutex<Option<ProcessInfo>>,
    starts: Mutex<Vec<ProcessInfo>>,
    start_failures: Mutex<VecDeque<SupervisorError>>,
    stops: AtomicUsize,
    next_pid: AtomicU32,
    start_delay: Mutex<Duration>,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self {
            running: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            start_failures: Mutex::new(VecDeque::new()),
            stops: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
            start_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FakeProcess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next start fail with `error`.
    pub fn fail_next_start(&self, error: SupervisorError) {
        self.start_failures.lock().expect("failures").push_back(error);
    }

    /// Delay every start, to widen race windows in tests.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().expect("delay") = delay;
    }

    /// Every successful start, in order.
    #[must_use]
    pub fn starts(&self) -> Vec<ProcessInfo> {
        self.starts.lock().expect("starts").clone()
    }

    /// Executables of every successful start.
    #[must_use]
    pub fn started_executables(&self) -> Vec<PathBuf> {
        self.starts().into_iter().map(|s| s.executable).collect()
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Simulate the child exiting on its own.
    pub fn crash(&self) {
        *self.running.lock().expect("running") = None;
    }

    async fn record_start(
        &self,
        executable: &Path,
        config: &Path,
        port: u16,
        dry_run: bool,
    ) -> Result<ProcessInfo> {
        let delay = *self.start_delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.start_failures.lock().expect("failures").pop_front() {
            return Err(error);
        }
        let mut running = self.running.lock().expect("running");
        if let Some(info) = running.as_ref() {
            return Err(SupervisorError::AlreadyRunning {
                pid: info.pid,
            });
        }
        let info = ProcessInfo {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            port,
            dry_run,
            executable: executable.to_path_buf(),
            config: config.to_path_buf(),
            started_at: chrono::Utc::now(),
        };
        *running = Some(info.clone());
        self.starts.lock().expect("starts").push(info.clone());
        Ok(info)
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn start(&self, executable: &Path, config: &Path, port: u16) -> Result<ProcessInfo> {
        self.record_start(executable, config, port, false).await
    }

    async fn start_dry_run(&self, executable: &Path, config: &Path) -> Result<ProcessInfo> {
        let port = 40_000 + u16::try_from(self.starts().len() % 1000).unwrap_or(0);
        self.record_start(executable, config, port, true).await
    }

    async fn stop(&self) -> Result<()> {
        if self.running.lock().expect("running").take().is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.lock().expect("running").is_some()
    }

    async fn current(&self) -> Option<ProcessInfo> {
        self.running.lock().expect("running").clone()
    }
}

/// Health probe answering from a switch, or from a queue of scripted answers.
#[derive(Debug)]
pub struct FakeHealth {
    healthy: AtomicBool,
    script: Mutex<VecDeque<bool>>,
    probes: Mutex<Vec<u16>>,
}

impl FakeHealth {
    #[must_use]
    pub fn healthy() -> Self {
        Self::with(true)
    }

    fn with(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            script: Mutex::new(VecDeque::new()),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Answer the next probes with `answers`, then fall back to the switch.
    pub fn script(&self, answers: &[bool]) {
        self.script.lock().expect("script").extend(answers.iter().copied());
    }

    /// Ports probed so far.
    #[must_use]
    pub fn probed_ports(&self) -> Vec<u16> {
        self.probes.lock().expect("probes").clone()
    }

    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.lock().expect("probes").len()
    }
}

#[async_trait]
impl HealthProbe for FakeHealth {
    async fn is_healthy(&self, _host: &str, port: u16, _retries: u32) -> bool {
        self.probes.lock().expect("probes").push(port);
        self.script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or_else(|| self.healthy.load(Ordering::SeqCst))
    }
}
