//! Installed version registry.
//!
//! Layout under the root directory:
//!
//! ```text
//! versions/
//!   v1.2.3/
//!     cli-proxy-api      executable (0755)
//!     metadata.json      written only after validation
//!   .staging-<uuid>/     install in progress, never listed
//! current                {"version": "v1.2.3", "updated_at": "..."}
//! ```
//!
//! A version counts as installed only when both its executable and its
//! `metadata.json` exist. Installs are assembled in a staging directory and
//! moved to `versions/<version>` by [`VersionStore::commit`] once they passed
//! every check, so a failed reinstall never touches the installed copy.
//! [`VersionStore::set_current`] refuses to point at anything not installed.

pub mod state;

use crate::config::Layout;
use crate::constants::METADATA_FILE;
use crate::core::{Result, SupervisorError};
use crate::utils::fs::{ensure_dir, read_json_optional, remove_dir_all, write_json_atomic};
use crate::utils::platform::Arch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use state::{AttemptResult, StateStore, SupervisorState, UpgradeAttempt};

/// Where an installed binary came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstallSource {
    Release {
        repo: String,
        tag: String,
        asset: String,
        url: String,
    },
    Local {
        path: PathBuf,
    },
}

/// Contents of `versions/<version>/metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub source: InstallSource,
    pub sha256: String,
    pub architecture: Arch,
    /// Executable file name inside the version directory
    pub binary: String,
}

/// An installed version as listed by [`VersionStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub executable: PathBuf,
    pub sha256: String,
    pub architecture: Arch,
    pub is_current: bool,
}

/// Contents of the `current` pointer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// An install being assembled outside `versions/<version>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedVersion {
    pub version: String,
    pub dir: PathBuf,
    pub executable: PathBuf,
}

const STAGING_PREFIX: &str = ".staging-";
const REPLACED_PREFIX: &str = ".replaced-";

/// On-disk registry of installed versions and the current pointer.
#[derive(Debug, Clone)]
pub struct VersionStore {
    layout: Layout,
    executable_name: String,
}

impl VersionStore {
    #[must_use]
    pub fn new(layout: Layout, executable_name: impl Into<String>) -> Self {
        Self {
            layout,
            executable_name: executable_name.into(),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub fn executable_name(&self) -> &str {
        &self.executable_name
    }

    #[must_use]
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.layout.version_dir(version)
    }

    #[must_use]
    pub fn executable_path(&self, version: &str) -> PathBuf {
        self.version_dir(version).join(&self.executable_name)
    }

    fn metadata_path(&self, version: &str) -> PathBuf {
        self.version_dir(version).join(METADATA_FILE)
    }

    /// True when both the executable and its metadata exist.
    #[must_use]
    pub fn is_installed(&self, version: &str) -> bool {
        self.executable_path(version).is_file() && self.metadata_path(version).is_file()
    }

    /// Create an empty staging directory for a new install of `version`.
    ///
    /// Leftovers of interrupted installs are swept first. Callers hold the upgrade
    /// lock, so no other install can be staging at the same time.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::VersionInUse`] if `version` is current, and
    /// [`SupervisorError::Config`] for identifiers that are not a single path
    /// component.
    pub fn stage(&self, version: &str) -> Result<StagedVersion> {
        validate_version_id(version)?;
        if self.current()?.as_deref() == Some(version) {
            return Err(SupervisorError::VersionInUse {
                version: version.to_string(),
            });
        }

        self.sweep_leftovers();
        let dir = self.layout.versions_dir().join(format!("{STAGING_PREFIX}{}", Uuid::new_v4().simple()));
        ensure_dir(&dir)?;
        debug!("Staging {} in {}", version, dir.display());
        Ok(StagedVersion {
            version: version.to_string(),
            executable: dir.join(&self.executable_name),
            dir,
        })
    }

    /// Write `metadata.json` into a staged install.
    pub fn write_metadata(&self, staged: &StagedVersion, metadata: &VersionMetadata) -> Result<()> {
        if !staged.executable.is_file() {
            return Err(SupervisorError::VersionNotInstalled {
                version: staged.version.clone(),
            });
        }
        write_json_atomic(&staged.dir.join(METADATA_FILE), metadata)
    }

    /// Move a staged install to `versions/<version>`, replacing an installed copy.
    ///
    /// The previous copy is moved aside first and put back if the final rename
    /// fails. Returns the installed executable.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::VersionInUse`] if `version` became current.
    pub fn commit(&self, staged: &StagedVersion) -> Result<PathBuf> {
        if self.current()?.as_deref() == Some(staged.version.as_str()) {
            return Err(SupervisorError::VersionInUse {
                version: staged.version.clone(),
            });
        }

        let target = self.version_dir(&staged.version);
        let displaced = if target.exists() {
            let aside =
                self.layout.versions_dir().join(format!("{REPLACED_PREFIX}{}", Uuid::new_v4().simple()));
            std::fs::rename(&target, &aside).map_err(|e| SupervisorError::fs("move aside", &target, &e))?;
            Some(aside)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(&staged.dir, &target) {
            if let Some(aside) = &displaced
                && let Err(restore) = std::fs::rename(aside, &target)
            {
                warn!("Failed to restore {}: {}", target.display(), restore);
            }
            return Err(SupervisorError::fs("install", &staged.dir, &e));
        }

        if let Some(aside) = displaced
            && let Err(e) = remove_dir_all(&aside)
        {
            warn!("Failed to remove replaced copy of {}: {}", staged.version, e);
        }
        info!("Installed {} into {}", staged.version, target.display());
        Ok(self.executable_path(&staged.version))
    }

    /// Delete a staged install that will not be committed.
    pub fn discard(&self, staged: &StagedVersion) -> Result<()> {
        debug!("Discarding staged install of {}", staged.version);
        remove_dir_all(&staged.dir)
    }

    fn sweep_leftovers(&self) {
        let Ok(entries) = std::fs::read_dir(self.layout.versions_dir()) else {
            return;
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if (name.starts_with(STAGING_PREFIX) || name.starts_with(REPLACED_PREFIX))
                && let Err(e) = remove_dir_all(&entry.path())
            {
                warn!("Failed to remove leftover {}: {}", name, e);
            }
        }
    }

    /// Metadata of `version`, if installed.
    pub fn metadata(&self, version: &str) -> Result<Option<VersionMetadata>> {
        read_json_optional(&self.metadata_path(version))
    }

    /// Version named by the current pointer.
    pub fn current(&self) -> Result<Option<String>> {
        Ok(read_json_optional::<CurrentPointer>(&self.layout.current_pointer())?.map(|p| p.version))
    }

    /// Current version and its executable.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::NotInstalled`] when no version is current
    /// - [`SupervisorError::VersionNotInstalled`] when the current version's files
    ///   are missing
    pub fn current_executable(&self) -> Result<(String, PathBuf)> {
        let version = self.current()?.ok_or(SupervisorError::NotInstalled)?;
        if !self.is_installed(&version) {
            return Err(SupervisorError::VersionNotInstalled {
                version,
            });
        }
        let path = self.executable_path(&version);
        Ok((version, path))
    }

    /// Atomically point `current` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::VersionNotInstalled`] unless `version` is fully
    /// installed.
    pub fn set_current(&self, version: &str) -> Result<()> {
        if !self.is_installed(version) {
            return Err(SupervisorError::VersionNotInstalled {
                version: version.to_string(),
            });
        }
        info!("Setting current version to {}", version);
        write_json_atomic(
            &self.layout.current_pointer(),
            &CurrentPointer {
                version: version.to_string(),
                updated_at: Utc::now(),
            },
        )
    }

    /// Installed versions, newest install first.
    pub fn list(&self) -> Result<Vec<InstalledVersion>> {
        let versions_dir = self.layout.versions_dir();
        let entries = match std::fs::read_dir(&versions_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::fs("list", &versions_dir, &e)),
        };

        let current = self.current()?;
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SupervisorError::fs("list", &versions_dir, &e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let version = entry.file_name().to_string_lossy().into_owned();
            if version.starts_with('.') || !self.is_installed(&version) {
                continue;
            }
            let metadata = match self.metadata(&version) {
                Ok(Some(metadata)) => metadata,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping {} with unreadable metadata: {}", version, e);
                    continue;
                }
            };
            versions.push(InstalledVersion {
                is_current: current.as_deref() == Some(version.as_str()),
                executable: self.executable_path(&version),
                version,
                installed_at: metadata.installed_at,
                sha256: metadata.sha256,
                architecture: metadata.architecture,
            });
        }

        versions.sort_by(|a, b| b.installed_at.cmp(&a.installed_at).then(b.version.cmp(&a.version)));
        Ok(versions)
    }

    /// Delete an installed or partially installed version.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::VersionInUse`] for the current version.
    pub fn remove(&self, version: &str) -> Result<()> {
        validate_version_id(version)?;
        if self.current()?.as_deref() == Some(version) {
            return Err(SupervisorError::VersionInUse {
                version: version.to_string(),
            });
        }
        info!("Removing version {}", version);
        remove_dir_all(&self.version_dir(version))
    }

    /// Remove installed versions beyond the newest `retention`.
    ///
    /// The current version and every version in `protect` are always kept and do not
    /// count against `retention`. Directories without metadata are left alone.
    /// Returns the removed versions.
    pub fn prune(&self, retention: usize, protect: &[&str]) -> Result<Vec<String>> {
        let current = self.current()?;
        let mut keep: HashSet<&str> = protect.iter().copied().collect();
        if let Some(current) = current.as_deref() {
            keep.insert(current);
        }

        let candidates: Vec<InstalledVersion> =
            self.list()?.into_iter().filter(|v| !keep.contains(v.version.as_str())).collect();

        let mut removed = Vec::new();
        for version in candidates.into_iter().skip(retention) {
            self.remove(&version.version)?;
            removed.push(version.version);
        }
        if !removed.is_empty() {
            info!("Pruned {} old version(s): {}", removed.len(), removed.join(", "));
        }
        Ok(removed)
    }
}

/// Version identifiers become directory names and must be a single safe component.
///
/// Names starting with a dot are reserved for staging directories.
pub fn validate_version_id(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && !version.starts_with('.')
        && !version.contains(['/', '\\'])
        && Path::new(version).components().count() == 1;
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::Config {
            message: format!("invalid version identifier '{version}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> VersionStore {
        VersionStore::new(Layout::new(temp.path()), "core")
    }

    fn metadata(version: &str, minutes_ago: i64) -> VersionMetadata {
        let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        VersionMetadata {
            version: version.to_string(),
            installed_at: at,
            validated_at: at,
            source: InstallSource::Local {
                path: PathBuf::from("/tmp/core"),
            },
            sha256: "ab".repeat(32),
            architecture: Arch::Amd64,
            binary: "core".to_string(),
        }
    }

    fn install(store: &VersionStore, version: &str, minutes_ago: i64) {
        let staged = store.stage(version).unwrap();
        std::fs::write(&staged.executable, b"\x7fELF").unwrap();
        store.write_metadata(&staged, &metadata(version, minutes_ago)).unwrap();
        store.commit(&staged).unwrap();
    }

    #[test]
    fn test_set_current_requires_full_install() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        std::fs::create_dir_all(store.version_dir("v1.0.0")).unwrap();
        std::fs::write(store.executable_path("v1.0.0"), b"\x7fELF").unwrap();
        assert!(matches!(
            store.set_current("v1.0.0"),
            Err(SupervisorError::VersionNotInstalled { .. })
        ));
        assert_eq!(store.current().unwrap(), None);

        install(&store, "v1.0.0", 0);
        store.set_current("v1.0.0").unwrap();
        assert_eq!(store.current().unwrap().as_deref(), Some("v1.0.0"));
        let (version, path) = store.current_executable().unwrap();
        assert_eq!(version, "v1.0.0");
        assert_eq!(path, temp.path().join("versions/v1.0.0/core"));
    }

    #[test]
    fn test_discarded_stage_keeps_installed_copy() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        install(&store, "v1.0.0", 10);
        let before = store.metadata("v1.0.0").unwrap().unwrap();

        let staged = store.stage("v1.0.0").unwrap();
        std::fs::write(&staged.executable, b"\x7fELF replacement").unwrap();
        assert!(staged.dir.starts_with(temp.path().join("versions")));
        store.discard(&staged).unwrap();

        assert!(store.is_installed("v1.0.0"));
        assert_eq!(store.metadata("v1.0.0").unwrap().unwrap(), before);
        assert_eq!(std::fs::read(store.executable_path("v1.0.0")).unwrap(), b"\x7fELF");
        assert!(!staged.dir.exists());
    }

    #[test]
    fn test_commit_replaces_installed_copy() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        install(&store, "v1.0.0", 10);

        let staged = store.stage("v1.0.0").unwrap();
        std::fs::write(&staged.executable, b"\x7fELF new").unwrap();
        store.write_metadata(&staged, &metadata("v1.0.0", 0)).unwrap();
        let executable = store.commit(&staged).unwrap();

        assert_eq!(executable, store.executable_path("v1.0.0"));
        assert_eq!(std::fs::read(&executable).unwrap(), b"\x7fELF new");
        let names: Vec<_> = std::fs::read_dir(temp.path().join("versions"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["v1.0.0".to_string()]);
    }

    #[test]
    fn test_current_executable_not_installed() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(store(&temp).current_executable(), Err(SupervisorError::NotInstalled)));
    }

    #[test]
    fn test_current_cannot_be_replaced_or_removed() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        install(&store, "v1.0.0", 0);
        store.set_current("v1.0.0").unwrap();

        assert!(matches!(store.stage("v1.0.0"), Err(SupervisorError::VersionInUse { .. })));
        assert!(matches!(store.remove("v1.0.0"), Err(SupervisorError::VersionInUse { .. })));
        assert!(store.is_installed("v1.0.0"));
    }

    #[test]
    fn test_list_marks_current_and_skips_partial() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        install(&store, "v1.0.0", 10);
        install(&store, "v1.1.0", 5);
        std::fs::create_dir_all(store.version_dir("v2.0.0")).unwrap();
        let staged = store.stage("v3.0.0").unwrap();
        std::fs::write(&staged.executable, b"\x7fELF").unwrap();
        store.write_metadata(&staged, &metadata("v3.0.0", 0)).unwrap();
        store.set_current("v1.0.0").unwrap();

        let listed = store.list().unwrap();
        let names: Vec<_> = listed.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["v1.1.0", "v1.0.0"]);
        assert!(listed[1].is_current);
        assert!(!listed[0].is_current);
    }

    #[test]
    fn test_prune_keeps_current_protected_and_newest() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        for (i, version) in ["v1", "v2", "v3", "v4", "v5"].iter().enumerate() {
            install(&store, version, 50 - i as i64 * 10);
        }
        store.set_current("v5").unwrap();

        let removed = store.prune(1, &["v1"]).unwrap();

        assert_eq!(removed, vec!["v3".to_string(), "v2".to_string()]);
        assert!(store.is_installed("v5"));
        assert!(store.is_installed("v4"));
        assert!(store.is_installed("v1"));
        assert!(!store.version_dir("v2").exists());
    }

    #[test]
    fn test_pointer_is_json() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        install(&store, "v1.2.3", 0);
        store.set_current("v1.2.3").unwrap();

        let raw = std::fs::read_to_string(temp.path().join("current")).unwrap();
        let pointer: CurrentPointer = serde_json::from_str(&raw).unwrap();
        assert_eq!(pointer.version, "v1.2.3");
    }

    #[test]
    fn test_invalid_version_ids() {
        assert!(validate_version_id("v1.2.3").is_ok());
        assert!(validate_version_id("../etc").is_err());
        assert!(validate_version_id("a/b").is_err());
        assert!(validate_version_id("..").is_err());
        assert!(validate_version_id(".staging-1").is_err());
        assert!(validate_version_id("").is_err());
    }
}
