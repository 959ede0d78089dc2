//! Install and promotion pipeline.
//!
//! The [`UpgradeCoordinator`] turns a release tag, or a local file, into an
//! installed and optionally current version. Every install runs under the
//! exclusive [`UpgradeLock`] and executes its stages strictly in order:
//!
//! ```text
//! 1. Resolve       fetch the release, select the host asset
//! 2. Download      stream the archive into downloads/
//! 3. Verify        resolve the expected SHA-256 and compare (mandatory)
//! 4. Extract       unpack into a scratch dir, validate, copy the executable
//!                  into a staging directory
//! 5. Validate      check format and architecture against the host
//! 6. Sign          ad-hoc re-sign on macOS (best effort)
//! 7. Record        write metadata.json into the staging directory
//! --- only when activating ---
//! 8. Dry run       start the staged binary on an ephemeral port, warm up,
//!                  health check, stop
//! --- always ---
//! 9. Commit        move the staging directory to versions/<version>
//! --- only when activating ---
//! 10. Promote      set current, record last-known-good, prune
//! ```
//!
//! # Failure Handling
//!
//! Any failure discards the staging directory and records a failed attempt with
//! the error code in `state.json` before the error is returned. An installed copy
//! of the same version stays untouched until step 9. Failures of the dry run or
//! the promotion itself are wrapped in [`SupervisorError::PromotionFailed`]. The
//! current pointer only ever moves in step 10, after the dry run passed.
//!
//! Local installs skip steps 1-3 and copy the user supplied binary, or extract it
//! when it is an archive; the remaining stages, including the dry run, are
//! identical.

pub mod lock;

use crate::archive::ArchiveExtractor;
use crate::config::{SupervisorConfig, core_config};
use crate::core::{Result, SupervisorError};
use crate::download::{Downloader, ProgressFn};
use crate::health::HealthProbe;
use crate::inspect::BinaryInspector;
use crate::process::{ProcessControl, ProcessInfo};
use crate::release::{AssetSelector, ReleaseProvider};
use crate::store::{
    InstallSource, StagedVersion, StateStore, VersionMetadata, VersionStore, validate_version_id,
};
use crate::utils::fs::{copy_executable, remove_file};
use crate::utils::platform::{Arch, HostPlatform};
use crate::verification::ChecksumVerifier;
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use lock::{UpgradeGuard, UpgradeLock};

/// Stage of an install, reported as it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    Resolving,
    Downloading,
    Verifying,
    Extracting,
    Validating,
    Signing,
    DryRun,
    Promoting,
    Done,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Resolving => "Resolving release",
            Self::Downloading => "Downloading",
            Self::Verifying => "Verifying checksum",
            Self::Extracting => "Extracting",
            Self::Validating => "Validating binary",
            Self::Signing => "Signing",
            Self::DryRun => "Testing on a temporary port",
            Self::Promoting => "Activating",
            Self::Done => "Done",
        };
        f.write_str(label)
    }
}

/// Callback receiving each [`InstallPhase`].
pub type PhaseFn = Arc<dyn Fn(InstallPhase) + Send + Sync>;

/// Callback receiving the version under test and its dry-run instance once
/// it started.
pub type DryRunFn = Arc<dyn Fn(&str, &ProcessInfo) + Send + Sync>;

/// Optional observers of an install.
#[derive(Clone, Default)]
pub struct InstallReporter {
    pub on_phase: Option<PhaseFn>,
    pub on_download: Option<ProgressFn>,
    pub on_dry_run: Option<DryRunFn>,
}

impl InstallReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_phase(mut self, callback: PhaseFn) -> Self {
        self.on_phase = Some(callback);
        self
    }

    #[must_use]
    pub fn with_download(mut self, callback: ProgressFn) -> Self {
        self.on_download = Some(callback);
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, callback: DryRunFn) -> Self {
        self.on_dry_run = Some(callback);
        self
    }

    fn phase(&self, phase: InstallPhase) {
        debug!("Install phase: {:?}", phase);
        if let Some(callback) = &self.on_phase {
            callback(phase);
        }
    }
}

impl fmt::Debug for InstallReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallReporter")
            .field("on_phase", &self.on_phase.is_some())
            .field("on_download", &self.on_download.is_some())
            .field("on_dry_run", &self.on_dry_run.is_some())
            .finish()
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub version: String,
    pub executable: PathBuf,
    pub sha256: String,
    pub architecture: Arch,
    /// True when the version was promoted to current
    pub activated: bool,
    /// Versions removed by retention after promotion
    pub pruned: Vec<String>,
}

/// Runs installs and promotions. See the module documentation for the pipeline.
pub struct UpgradeCoordinator {
    config: SupervisorConfig,
    releases: Arc<dyn ReleaseProvider>,
    downloader: Downloader,
    extractor: ArchiveExtractor,
    inspector: BinaryInspector,
    selector: AssetSelector,
    store: VersionStore,
    state: Arc<StateStore>,
    dry_run: Arc<dyn ProcessControl>,
    health: Arc<dyn HealthProbe>,
    lock: UpgradeLock,
}

impl UpgradeCoordinator {
    /// Wire a coordinator.
    ///
    /// `dry_run` must be a process controller distinct from the one running the
    /// current version.
    pub fn new(
        config: SupervisorConfig,
        host: HostPlatform,
        releases: Arc<dyn ReleaseProvider>,
        state: Arc<StateStore>,
        dry_run: Arc<dyn ProcessControl>,
        health: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let layout = config.layout();
        let store = VersionStore::new(layout.clone(), host.executable_name(&config.release.binary_name));
        Ok(Self {
            downloader: Downloader::new(layout.downloads_dir())?,
            extractor: ArchiveExtractor::new(layout.tmp_dir()),
            inspector: BinaryInspector::new(host.clone()),
            selector: AssetSelector::new(host),
            lock: UpgradeLock::new(layout.upgrade_lock()),
            store,
            config,
            releases,
            state,
            dry_run,
            health,
        })
    }

    #[must_use]
    pub const fn store(&self) -> &VersionStore {
        &self.store
    }

    /// The upgrade lock, shared with anything else that moves the current pointer.
    #[must_use]
    pub const fn lock(&self) -> &UpgradeLock {
        &self.lock
    }

    #[must_use]
    pub const fn inspector(&self) -> &BinaryInspector {
        &self.inspector
    }

    /// Install release `version` (a tag or `latest`), promoting it when
    /// `set_active`.
    pub async fn install(
        &self,
        version: &str,
        set_active: bool,
        reporter: &InstallReporter,
    ) -> Result<InstallOutcome> {
        let _guard = self.lock.try_acquire().await?;
        info!("Installing {}{}", version, if set_active { "" } else { " (not activating)" });
        self.state.begin_attempt(version)?;

        let mut staged = None;
        let result = self.install_release(version, set_active, reporter, &mut staged).await;
        self.conclude(version, staged, result)
    }

    /// Install the binary (or `.tar.gz` archive) at `path` as `version`.
    pub async fn install_from_file(
        &self,
        path: &Path,
        version: &str,
        set_active: bool,
        reporter: &InstallReporter,
    ) -> Result<InstallOutcome> {
        let _guard = self.lock.try_acquire().await?;
        info!("Installing {} from {}", version, path.display());
        self.state.begin_attempt(version)?;

        let mut staged = None;
        let result = self.install_local(path, version, set_active, reporter, &mut staged).await;
        self.conclude(version, staged, result)
    }

    /// Remove old versions beyond the retention count.
    ///
    /// The current and last-known-good versions are always kept.
    pub async fn prune(&self) -> Result<Vec<String>> {
        let _guard = self.lock.try_acquire().await?;
        let last_known_good = self.state.snapshot().last_known_good;
        let protect: Vec<&str> = last_known_good.as_deref().into_iter().collect();
        self.store.prune(self.config.upgrade.retention, &protect)
    }

    async fn install_release(
        &self,
        requested: &str,
        set_active: bool,
        reporter: &InstallReporter,
        staged: &mut Option<StagedVersion>,
    ) -> Result<InstallOutcome> {
        reporter.phase(InstallPhase::Resolving);
        let release = self.releases.fetch_release(requested).await?;
        let version = release.tag_name.clone();
        validate_version_id(&version)?;
        let asset = self.selector.select(&release)?.clone();
        debug!("Selected asset {} for {}", asset.name, version);

        reporter.phase(InstallPhase::Downloading);
        let archive = self
            .downloader
            .download(&asset.download_url, &asset.name, reporter.on_download.as_ref())
            .await?;

        let installed = self
            .verify_and_extract(&release, &asset, &archive, &version, reporter, staged)
            .await;
        if let Err(e) = remove_file(&archive) {
            warn!("Failed to remove downloaded archive: {}", e);
        }
        let sha256 = installed?;

        let source = InstallSource::Release {
            repo: self.config.release.repo.clone(),
            tag: version.clone(),
            asset: asset.name.clone(),
            url: asset.download_url.clone(),
        };
        self.complete(sha256, source, set_active, reporter, staged).await
    }

    async fn verify_and_extract(
        &self,
        release: &crate::release::Release,
        asset: &crate::release::Asset,
        archive: &Path,
        version: &str,
        reporter: &InstallReporter,
        staged: &mut Option<StagedVersion>,
    ) -> Result<String> {
        reporter.phase(InstallPhase::Verifying);
        let expected = ChecksumVerifier::resolve_expected(release, asset, &self.downloader).await?;
        let sha256 = ChecksumVerifier::verify_checksum(archive, &expected).await?;

        reporter.phase(InstallPhase::Extracting);
        let executable = staged.insert(self.store.stage(version)?).executable.clone();
        self.extractor.install(archive, &self.candidates(), &executable).await?;
        Ok(sha256)
    }

    async fn install_local(
        &self,
        path: &Path,
        version: &str,
        set_active: bool,
        reporter: &InstallReporter,
        staged: &mut Option<StagedVersion>,
    ) -> Result<InstallOutcome> {
        validate_version_id(version)?;
        let source_path = std::fs::canonicalize(path).map_err(|e| SupervisorError::fs("read", path, &e))?;
        if !source_path.is_file() {
            return Err(SupervisorError::InvalidExecutable {
                path: source_path.display().to_string(),
            });
        }

        reporter.phase(InstallPhase::Extracting);
        let executable = staged.insert(self.store.stage(version)?).executable.clone();

        let is_archive = source_path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().to_ascii_lowercase().ends_with(".tar.gz"));
        if is_archive {
            self.extractor.install(&source_path, &self.candidates(), &executable).await?;
        } else {
            copy_executable(&source_path, &executable)?;
        }
        let sha256 = ChecksumVerifier::compute_sha256(&executable).await?;

        let source = InstallSource::Local {
            path: source_path,
        };
        self.complete(sha256, source, set_active, reporter, staged).await
    }

    /// Validate, sign, record, commit and, when activating, gate and promote.
    async fn complete(
        &self,
        sha256: String,
        source: InstallSource,
        set_active: bool,
        reporter: &InstallReporter,
        staged: &mut Option<StagedVersion>,
    ) -> Result<InstallOutcome> {
        let Some(pending) = staged.clone() else {
            return Err(SupervisorError::Other {
                message: "install has no staged files".to_string(),
            });
        };
        let version = pending.version.as_str();

        reporter.phase(InstallPhase::Validating);
        let architecture = self.inspector.validate(&pending.executable)?;

        reporter.phase(InstallPhase::Signing);
        if let Err(e) = self.inspector.resign(&pending.executable).await {
            warn!("Re-signing {} failed, continuing: {}", pending.executable.display(), e);
        }

        let now = Utc::now();
        self.store.write_metadata(
            &pending,
            &VersionMetadata {
                version: version.to_string(),
                installed_at: now,
                validated_at: now,
                source,
                sha256: sha256.clone(),
                architecture,
                binary: self.store.executable_name().to_string(),
            },
        )?;

        if set_active {
            reporter.phase(InstallPhase::DryRun);
            self.dry_run_gate(&pending, reporter)
                .await
                .map_err(|e| promotion_failed(version, e))?;
        }

        let executable = self.store.commit(&pending).map_err(|e| {
            if set_active { promotion_failed(version, e) } else { e }
        })?;
        *staged = None;

        let mut outcome = InstallOutcome {
            version: version.to_string(),
            executable,
            sha256,
            architecture,
            activated: false,
            pruned: Vec::new(),
        };
        if !set_active {
            info!("Installed {} without activating it", version);
            reporter.phase(InstallPhase::Done);
            return Ok(outcome);
        }

        reporter.phase(InstallPhase::Promoting);
        self.store.set_current(version).map_err(|e| promotion_failed(version, e))?;
        self.state.mark_known_good(version)?;
        outcome.activated = true;

        outcome.pruned = match self.store.prune(self.config.upgrade.retention, &[version]) {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Pruning old versions failed: {}", e);
                Vec::new()
            }
        };

        info!("Version {} is now current", version);
        reporter.phase(InstallPhase::Done);
        Ok(outcome)
    }

    /// Start the staged executable on a throwaway port and require it to pass a health
    /// check after the fixed warm-up.
    async fn dry_run_gate(&self, staged: &StagedVersion, reporter: &InstallReporter) -> Result<()> {
        let config_path = core_config::ensure_core_config(
            &self.config.layout().core_config(),
            self.config.port,
            self.config.legacy_config.as_deref(),
        )?;

        let info = self.dry_run.start_dry_run(&staged.executable, &config_path).await?;
        debug!("Dry run started on port {}", info.port);
        if let Some(callback) = &reporter.on_dry_run {
            callback(&staged.version, &info);
        }
        tokio::time::sleep(self.config.upgrade.dry_run_warmup()).await;

        let healthy =
            self.health.is_healthy(&self.config.host, info.port, self.config.health.retries).await;
        if let Err(e) = self.dry_run.stop().await {
            warn!("Failed to stop dry-run instance: {}", e);
        }

        if healthy {
            info!("Dry run passed its health check");
            Ok(())
        } else {
            Err(SupervisorError::HealthCheckFailed {
                port: info.port,
            })
        }
    }

    fn candidates(&self) -> Vec<String> {
        let mut names = vec![self.store.executable_name().to_string()];
        let configured = &self.config.release.binary_name;
        if !names.contains(configured) {
            names.push(configured.clone());
        }
        names
    }

    /// Clean up after a failed attempt and record its outcome.
    fn conclude(
        &self,
        requested: &str,
        staged: Option<StagedVersion>,
        result: Result<InstallOutcome>,
    ) -> Result<InstallOutcome> {
        match result {
            Ok(outcome) => {
                self.state.finish_attempt(&outcome.version, None)?;
                Ok(outcome)
            }
            Err(e) => {
                error!("Install of {} failed: {}", requested, e);
                if let Some(pending) = &staged
                    && let Err(cleanup) = self.store.discard(pending)
                {
                    warn!("Failed to remove staged install of {}: {}", pending.version, cleanup);
                }
                let version = staged.as_ref().map_or(requested, |p| p.version.as_str());
                if let Err(record) = self.state.finish_attempt(version, Some(e.code())) {
                    warn!("Failed to record failed attempt: {}", record);
                }
                Err(e)
            }
        }
    }
}

fn promotion_failed(version: &str, cause: SupervisorError) -> SupervisorError {
    SupervisorError::PromotionFailed {
        version: version.to_string(),
        cause: Box::new(cause),
    }
}
