//! Supervisor settings
//!
//! Settings are read from a TOML file (default `~/.corekeep/corekeep.toml`). Every
//! field has a default, so a missing file yields a fully usable configuration and
//! a partial file only needs the keys it overrides.
//!
//! # Resolution order
//!
//! - Settings file: explicit `--config` path, then `COREKEEP_CONFIG_PATH`, then
//!   `<default root>/corekeep.toml`
//! - Root directory: `COREKEEP_ROOT`, then `root_dir` from the file, then
//!   `~/.corekeep`
//!
//! # Example file
//!
//! ```toml
//! port = 8317
//!
//! [release]
//! repo = "router-for-me/CLIProxyAPI"
//! web_fallback = true
//!
//! [health]
//! interval_secs = 30
//! failure_threshold = 3
//!
//! [upgrade]
//! retention = 3
//! ```
//!
//! The core binary's own YAML configuration is handled by [`core_config`].

pub mod core_config;

use crate::constants::{
    CORE_CONFIG_FILE, CORE_LOG_FILE, CURRENT_POINTER_FILE, DRY_RUN_LOG_FILE, RELEASE_CACHE_FILE,
    SETTINGS_FILE, STATE_FILE,
};
use crate::core::{Result, SupervisorError};
use crate::utils::platform::{get_home_dir, resolve_path};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Environment variable overriding the settings file path.
pub const CONFIG_PATH_ENV: &str = "COREKEEP_CONFIG_PATH";

/// Environment variable overriding the root directory.
pub const ROOT_ENV: &str = "COREKEEP_ROOT";

/// Top-level supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Directory holding versions, cache, logs and state
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Interface the core binary listens on
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the main instance listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pre-existing core configuration to migrate on first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_config: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "ReleaseSettings::is_default")]
    pub release: ReleaseSettings,

    #[serde(default, skip_serializing_if = "HealthSettings::is_default")]
    pub health: HealthSettings,

    #[serde(default, skip_serializing_if = "UpgradeSettings::is_default")]
    pub upgrade: UpgradeSettings,
}

/// Where releases come from and how they are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSettings {
    /// `owner/name` slug of the upstream repository
    #[serde(default = "default_repo")]
    pub repo: String,

    /// Base URL of the structured release API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Base URL of the release web pages used by the fallback
    #[serde(default = "default_web_base")]
    pub web_base: String,

    /// File name of the executable inside release archives
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Prefix of release asset names (`<prefix>_<version>_<os>_<arch>.tar.gz`)
    #[serde(default = "default_asset_prefix")]
    pub asset_prefix: String,

    /// Freshness window of the release cache
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Scrape the public release pages when the API fails
    #[serde(default = "default_web_fallback")]
    pub web_fallback: bool,

    /// Token sent to the release API to raise the rate limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
}

/// Health probing and automatic rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Management endpoint probed on the instance
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Seconds between two monitor cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Probe attempts per health check
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Consecutive failed checks before rolling back
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Timeout of a single probe request
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Install pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSettings {
    /// Installed versions kept besides current and last-known-good
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Fixed wait between dry-run launch and its first health probe
    #[serde(default = "default_dry_run_warmup_secs")]
    pub dry_run_warmup_secs: u64,
}

fn default_root_dir() -> PathBuf {
    default_root().unwrap_or_else(|_| PathBuf::from(".corekeep"))
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8317
}

fn default_repo() -> String {
    "router-for-me/CLIProxyAPI".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_web_base() -> String {
    "https://github.com".to_string()
}

fn default_binary_name() -> String {
    "cli-proxy-api".to_string()
}

fn default_asset_prefix() -> String {
    "CLIProxyAPI".to_string()
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

const fn default_web_fallback() -> bool {
    true
}

fn default_health_path() -> String {
    "/v0/management/debug".to_string()
}

const fn default_interval_secs() -> u64 {
    30
}

const fn default_retries() -> u32 {
    3
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_timeout_ms() -> u64 {
    2_000
}

const fn default_retention() -> usize {
    3
}

const fn default_dry_run_warmup_secs() -> u64 {
    2
}

impl Default for ReleaseSettings {
    fn default() -> Self {
        Self {
            repo: default_repo(),
            api_base: default_api_base(),
            web_base: default_web_base(),
            binary_name: default_binary_name(),
            asset_prefix: default_asset_prefix(),
            cache_ttl_secs: default_cache_ttl_secs(),
            web_fallback: default_web_fallback(),
            github_token: None,
        }
    }
}

impl ReleaseSettings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_interval_secs(),
            retries: default_retries(),
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl HealthSettings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            dry_run_warmup_secs: default_dry_run_warmup_secs(),
        }
    }
}

impl UpgradeSettings {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub const fn dry_run_warmup(&self) -> Duration {
        Duration::from_secs(self.dry_run_warmup_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            host: default_host(),
            port: default_port(),
            legacy_config: None,
            release: ReleaseSettings::default(),
            health: HealthSettings::default(),
            upgrade: UpgradeSettings::default(),
        }
    }
}

/// Default root directory (`~/.corekeep`).
pub fn default_root() -> Result<PathBuf> {
    Ok(get_home_dir()?.join(".corekeep"))
}

impl SupervisorConfig {
    /// Default settings rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root.into(),
            ..Self::default()
        }
    }

    /// Resolve the settings file path from an explicit value or the environment.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV)
            && !env_path.is_empty()
        {
            return resolve_path(&env_path);
        }
        let root = match std::env::var(ROOT_ENV) {
            Ok(root) if !root.is_empty() => resolve_path(&root)?,
            _ => default_root()?,
        };
        Ok(root.join(SETTINGS_FILE))
    }

    /// Load settings, applying the root directory override from the environment.
    ///
    /// A missing file yields the defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit)?;
        let mut config = if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load_from(&path).await?
        } else {
            debug!("No settings file at {}, using defaults", path.display());
            Self::default()
        };

        if let Ok(root) = std::env::var(ROOT_ENV)
            && !root.is_empty()
        {
            config.root_dir = resolve_path(&root)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load settings from a specific file without environment overrides.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).await.map_err(|e| SupervisorError::fs("read", path, &e))?;

        let mut config: Self = toml::from_str(&content).map_err(|e| SupervisorError::Config {
            message: format!("failed to parse {}: {e}", path.display()),
        })?;

        let expanded = resolve_path(&config.root_dir.to_string_lossy())?;
        config.root_dir = expanded;
        Ok(config)
    }

    /// Save settings, restricting permissions on Unix since the file may hold a token.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| SupervisorError::Config {
            message: format!("failed to serialize settings: {e}"),
        })?;

        crate::utils::fs::atomic_write(path, content.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| SupervisorError::fs("set permissions on", path, &e))?;
        }

        Ok(())
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(SupervisorError::Config {
            message,
        });

        let mut parts = self.release.repo.split('/');
        let valid_repo = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
        );
        if !valid_repo {
            return fail(format!("release.repo '{}' must have the form owner/name", self.release.repo));
        }
        if self.release.binary_name.trim().is_empty() {
            return fail("release.binary_name must not be empty".to_string());
        }
        if self.port == 0 {
            return fail("port must be non-zero".to_string());
        }
        if self.health.retries == 0 {
            return fail("health.retries must be at least 1".to_string());
        }
        if self.health.failure_threshold == 0 {
            return fail("health.failure_threshold must be at least 1".to_string());
        }
        if self.health.interval_secs == 0 {
            return fail("health.interval_secs must be at least 1".to_string());
        }
        if self.upgrade.retention == 0 {
            return fail("upgrade.retention must be at least 1".to_string());
        }
        if !self.health.path.starts_with('/') {
            return fail(format!("health.path '{}' must start with '/'", self.health.path));
        }
        Ok(())
    }

    /// Directory layout under the root directory.
    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout::new(&self.root_dir)
    }
}

/// Paths of everything the supervisor stores under its root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn versions_dir(&self) -> PathBuf {
        self.root.join("versions")
    }

    #[must_use]
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    #[must_use]
    pub fn current_pointer(&self) -> PathBuf {
        self.root.join(CURRENT_POINTER_FILE)
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    #[must_use]
    pub fn cache_file(&self) -> PathBuf {
        self.root.join("cache").join(RELEASE_CACHE_FILE)
    }

    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    #[must_use]
    pub fn core_log(&self) -> PathBuf {
        self.logs_dir().join(CORE_LOG_FILE)
    }

    #[must_use]
    pub fn dry_run_log(&self) -> PathBuf {
        self.logs_dir().join(DRY_RUN_LOG_FILE)
    }

    #[must_use]
    pub fn core_config(&self) -> PathBuf {
        self.root.join(CORE_CONFIG_FILE)
    }

    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[must_use]
    pub fn upgrade_lock(&self) -> PathBuf {
        self.root.join(".locks").join("upgrade.lock")
    }
}
