//! On-disk release metadata cache.
//!
//! The cache is a single JSON document holding the release list, the time it was
//! fetched, its TTL and the validator (`ETag`) returned with it:
//!
//! ```json
//! { "etag": "\"abc\"", "fetched_at": "2025-01-01T00:00:00Z", "ttl_secs": 3600, "releases": [] }
//! ```
//!
//! Scraped releases carry no validator, so merging them clears `etag` and the next
//! revalidation performs a full reload.

use super::{Release, sort_newest_first};
use crate::core::{Result, SupervisorError};
use crate::utils::fs::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cached release list plus revalidation data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReleases {
    /// Validator returned by the API with this list
    pub etag: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub releases: Vec<Release>,
}

impl CachedReleases {
    #[must_use]
    pub fn new(releases: Vec<Release>, etag: Option<String>, ttl_secs: u64) -> Self {
        Self {
            etag,
            fetched_at: Utc::now(),
            ttl_secs,
            releases,
        }
    }

    /// True while the entry is younger than its TTL.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.fetched_at;
        age.num_seconds() >= 0 && age.num_seconds() < i64::try_from(self.ttl_secs).unwrap_or(i64::MAX)
    }
}

/// Reads and writes the cache document.
#[derive(Debug, Clone)]
pub struct ReleaseCache {
    path: PathBuf,
}

impl ReleaseCache {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cache; `None` when it was never written.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::CacheCorrupted`] if the document cannot be parsed.
    pub fn load(&self) -> Result<Option<CachedReleases>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SupervisorError::fs("read", &self.path, &e)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| SupervisorError::CacheCorrupted {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Replace the cache with a freshly fetched list.
    pub fn store(&self, entry: &CachedReleases) -> Result<()> {
        debug!("Caching {} releases at {}", entry.releases.len(), self.path.display());
        write_json_atomic(&self.path, entry)
    }

    /// Mark the cached list as fetched now, after a "not modified" response.
    pub fn touch(&self, mut entry: CachedReleases, ttl_secs: u64) -> Result<CachedReleases> {
        entry.fetched_at = Utc::now();
        entry.ttl_secs = ttl_secs;
        self.store(&entry)?;
        Ok(entry)
    }

    /// Merge scraped releases into the cache.
    ///
    /// A scraped release replaces the cached one with the same tag unless it carries
    /// no assets while the cached one does. The validator is dropped.
    pub fn merge_scraped(&self, scraped: Vec<Release>, ttl_secs: u64) -> Result<CachedReleases> {
        // Unreadable caches are replaced by the scraped data.
        let existing = self.load().ok().flatten().map(|c| c.releases).unwrap_or_default();

        let mut merged = existing;
        for release in scraped {
            match merged.iter_mut().find(|r| r.tag_name == release.tag_name) {
                Some(slot) => {
                    if !release.assets.is_empty() || slot.assets.is_empty() {
                        let published_at = release.published_at.or(slot.published_at);
                        *slot = Release {
                            published_at,
                            ..release
                        };
                    }
                }
                None => merged.push(release),
            }
        }
        sort_newest_first(&mut merged);

        let entry = CachedReleases::new(merged, None, ttl_secs);
        self.store(&entry)?;
        Ok(entry)
    }
}
