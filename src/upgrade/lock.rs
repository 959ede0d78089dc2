//! Exclusive upgrade lock.
//!
//! Only one install may run at a time, both inside this process and across
//! processes sharing the same root. The in-process half is a `tokio` mutex, the
//! cross-process half an exclusive [`fs4`] lock on `<root>/.locks/upgrade.lock`.
//! Acquisition never waits: a held lock surfaces
//! [`SupervisorError::UpgradeInProgress`] immediately.
//!
//! Both halves are released when the [`UpgradeGuard`] is dropped, so every exit
//! path of an install releases the lock.

use crate::core::{Result, SupervisorError};
use crate::utils::fs::ensure_dir;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Handle to the upgrade lock of one root.
#[derive(Debug, Clone)]
pub struct UpgradeLock {
    path: PathBuf,
    local: Arc<Mutex<()>>,
}

/// Proof of holding the upgrade lock.
#[derive(Debug)]
pub struct UpgradeGuard {
    _local: OwnedMutexGuard<()>,
    file: File,
    path: PathBuf,
}

impl Drop for UpgradeGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "Failed to unlock {}", self.path.display());
        }
        debug!("Upgrade lock released");
    }
}

impl UpgradeLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UpgradeInProgress`] when another install in this
    /// or another process holds it.
    pub async fn try_acquire(&self) -> Result<UpgradeGuard> {
        let local = self.local.clone().try_lock_owned().map_err(|_| {
            debug!("Upgrade lock held in this process");
            SupervisorError::UpgradeInProgress
        })?;

        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<File> {
            if let Some(parent) = path.parent() {
                ensure_dir(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| SupervisorError::fs("open lock file", &path, &e))?;
            match file.try_lock_exclusive() {
                Ok(true) => Ok(file),
                Ok(false) => {
                    debug!("Upgrade lock held by another process");
                    Err(SupervisorError::UpgradeInProgress)
                }
                Err(e) => Err(SupervisorError::fs("lock", &path, &e)),
            }
        })
        .await
        .map_err(|e| SupervisorError::Other {
            message: format!("lock task failed: {e}"),
        })??;

        debug!("Upgrade lock acquired at {}", self.path.display());
        Ok(UpgradeGuard {
            _local: local,
            file,
            path: self.path.clone(),
        })
    }

    /// True if an install currently holds the lock in this process.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.local.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let temp = TempDir::new().unwrap();
        let lock = UpgradeLock::new(temp.path().join(".locks/upgrade.lock"));

        let guard = lock.try_acquire().await.unwrap();
        assert!(lock.is_held());
        assert!(lock.path().exists());

        let err = lock.try_acquire().await.unwrap_err();
        assert!(matches!(err, SupervisorError::UpgradeInProgress));

        drop(guard);
        assert!(!lock.is_held());
        lock.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_lock_excludes_other_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".locks/upgrade.lock");
        let first = UpgradeLock::new(&path);
        let second = UpgradeLock::new(&path);

        let _guard = first.try_acquire().await.unwrap();
        let err = second.try_acquire().await.unwrap_err();
        assert!(matches!(err, SupervisorError::UpgradeInProgress));
    }
}
