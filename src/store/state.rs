//! Persisted supervisor state.
//!
//! Holds the rollback context that must survive a supervisor restart: the
//! consecutive health-failure counter, the last-known-good version and the record
//! of the most recent install attempt. Every mutation is written through
//! [`atomic_write`](crate::utils::fs::atomic_write) before the call returns.
//!
//! Several processes may share one root, for example a running supervisor and
//! a CLI install. A mutation therefore holds an exclusive [`fs4`] lock on
//! `state.json.lock`, re-reads the file and applies its change to what is on
//! disk, so concurrent writers never drop each other's fields. Snapshots are
//! refreshed from disk as well.

use crate::core::{ErrorCode, Result, SupervisorError};
use crate::utils::fs::{ensure_dir, read_json_optional, write_json_atomic};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of an install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    InProgress,
    Succeeded,
    Failed,
}

/// Record of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAttempt {
    pub version: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub result: AttemptResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// Rollback context persisted in `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_known_good: Option<String>,
    #[serde(default)]
    pub last_attempt: Option<UpgradeAttempt>,
}

/// Shared, persisted [`SupervisorState`].
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<SupervisorState>,
}

impl StateStore {
    /// Load the state from `path`.
    ///
    /// A missing file starts from the default state. An unreadable file is moved
    /// aside to `state.json.corrupt` and replaced by the default state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match read_json_optional::<SupervisorState>(&path) {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!("Discarding unreadable supervisor state at {}: {}", path.display(), e);
                let aside = path.with_extension("json.corrupt");
                let _ = std::fs::rename(&path, &aside);
                SupervisorState::default()
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current state, as last written by any process.
    #[must_use]
    pub fn snapshot(&self) -> SupervisorState {
        let mut guard = self.lock();
        if let Some(on_disk) = self.read_on_disk() {
            *guard = on_disk;
        }
        guard.clone()
    }

    /// Apply `change` to the persisted state and write the result back.
    /// Returns what `change` returned.
    pub fn update<T>(&self, change: impl FnOnce(&mut SupervisorState) -> T) -> Result<T> {
        let mut guard = self.lock();
        let _file_lock = self.lock_file()?;
        let mut next = self.read_on_disk().unwrap_or_else(|| guard.clone());
        let value = change(&mut next);
        write_json_atomic(&self.path, &next)?;
        *guard = next;
        Ok(value)
    }

    /// Increment the consecutive failure counter and return the new value.
    pub fn record_health_failure(&self) -> Result<u32> {
        self.update(|s| {
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            s.consecutive_failures
        })
    }

    /// Reset the consecutive failure counter; no write when already zero.
    pub fn reset_failures(&self) -> Result<()> {
        if self.snapshot().consecutive_failures == 0 {
            return Ok(());
        }
        self.update(|s| s.consecutive_failures = 0)
    }

    /// Record `version` as last-known-good and reset the failure counter.
    pub fn mark_known_good(&self, version: &str) -> Result<()> {
        debug!("Recording {} as last known good", version);
        self.update(|s| {
            s.last_known_good = Some(version.to_string());
            s.consecutive_failures = 0;
        })
    }

    /// Start an attempt record for `version`.
    pub fn begin_attempt(&self, version: &str) -> Result<()> {
        self.update(|s| {
            s.last_attempt = Some(UpgradeAttempt {
                version: version.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                result: AttemptResult::InProgress,
                error_code: None,
            });
        })
    }

    /// Close the current attempt record.
    pub fn finish_attempt(&self, version: &str, error_code: Option<ErrorCode>) -> Result<()> {
        self.update(|s| {
            let started_at = s
                .last_attempt
                .as_ref()
                .filter(|a| a.version == version)
                .map_or_else(Utc::now, |a| a.started_at);
            s.last_attempt = Some(UpgradeAttempt {
                version: version.to_string(),
                started_at,
                finished_at: Some(Utc::now()),
                result: if error_code.is_some() {
                    AttemptResult::Failed
                } else {
                    AttemptResult::Succeeded
                },
                error_code,
            });
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// `None` when the file is missing or unreadable; callers keep memory then.
    fn read_on_disk(&self) -> Option<SupervisorState> {
        match read_json_optional::<SupervisorState>(&self.path) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable supervisor state at {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn lock_file(&self) -> Result<StateFileLock> {
        let path = self.path.with_extension("json.lock");
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SupervisorError::fs("open", &path, &e))?;
        FileExt::lock_exclusive(&file).map_err(|e| SupervisorError::fs("lock", &path, &e))?;
        Ok(StateFileLock {
            file,
            path,
        })
    }
}

/// Held for the duration of one read-modify-write.
struct StateFileLock {
    file: File,
    path: PathBuf,
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "Failed to unlock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_state() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load(temp.path().join("state.json")).unwrap();
        assert_eq!(store.snapshot(), SupervisorState::default());
    }

    #[test]
    fn test_mutations_persist() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        let store = StateStore::load(&path).unwrap();

        assert_eq!(store.record_health_failure().unwrap(), 1);
        assert_eq!(store.record_health_failure().unwrap(), 2);
        store.mark_known_good("v1.0.0").unwrap();

        let reloaded = StateStore::load(&path).unwrap().snapshot();
        assert_eq!(reloaded.consecutive_failures, 0);
        assert_eq!(reloaded.last_known_good.as_deref(), Some("v1.0.0"));
    }

    #[test]
    fn test_attempt_records() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::load(temp.path().join("state.json")).unwrap();

        store.begin_attempt("v2.0.0").unwrap();
        assert_eq!(store.snapshot().last_attempt.unwrap().result, AttemptResult::InProgress);

        store.finish_attempt("v2.0.0", Some(ErrorCode::ChecksumMismatch)).unwrap();
        let attempt = store.snapshot().last_attempt.unwrap();
        assert_eq!(attempt.result, AttemptResult::Failed);
        assert_eq!(attempt.error_code, Some(ErrorCode::ChecksumMismatch));
        assert!(attempt.finished_at.is_some());

        let json = std::fs::read_to_string(store.path()).unwrap();
        assert!(json.contains("CHECKSUM_MISMATCH"));
        assert!(json.contains("\"failed\""));
    }

    #[test]
    fn test_concurrent_handles_keep_each_others_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        let supervisor = StateStore::load(&path).unwrap();
        let cli = StateStore::load(&path).unwrap();

        supervisor.mark_known_good("v1.0.0").unwrap();
        cli.mark_known_good("v2.0.0").unwrap();
        assert_eq!(supervisor.record_health_failure().unwrap(), 1);

        let reloaded = StateStore::load(&path).unwrap().snapshot();
        assert_eq!(reloaded.last_known_good.as_deref(), Some("v2.0.0"));
        assert_eq!(reloaded.consecutive_failures, 1);
        assert_eq!(supervisor.snapshot(), reloaded);
        assert_eq!(cli.snapshot(), reloaded);
    }

    #[test]
    fn test_parallel_failures_are_all_counted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = StateStore::load(&path).unwrap();
                    for _ in 0..10 {
                        store.record_health_failure().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(StateStore::load(&path).unwrap().snapshot().consecutive_failures, 40);
    }

    #[test]
    fn test_corrupt_state_is_moved_aside() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{{{").unwrap();

        let store = StateStore::load(&path).unwrap();

        assert_eq!(store.snapshot(), SupervisorState::default());
        assert!(temp.path().join("state.json.corrupt").exists());
    }
}
