//! Release discovery
//!
//! Releases are read from the upstream release API, cached on disk with a TTL and an
//! `ETag` validator, and, when the API is unavailable and web fallback is enabled,
//! scraped from the public release pages.
//!
//! - [`cache`] - On-disk release cache with freshness and revalidation
//! - [`source`] - API client implementing the four [`CachePolicy`] modes
//! - [`web`] - HTML/Atom scraping fallback
//! - [`selector`] - Picks the asset built for this host

pub mod cache;
pub mod selector;
pub mod source;
pub mod web;

use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cache::{CachedReleases, ReleaseCache};
pub use selector::AssetSelector;
pub use source::ReleaseSource;

/// A published release, identified by its tag.
///
/// Field names follow the upstream API so the same type deserializes API
/// responses and the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    /// Digest published with the asset, e.g. `sha256:<hex>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Release {
    /// Display name, falling back to the tag.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(&self.tag_name)
    }

    /// Find an asset by exact file name.
    #[must_use]
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

/// How [`ReleaseProvider::fetch_releases`] treats the on-disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve the cache while it is within its TTL, otherwise revalidate.
    ReturnCacheIfFresh,
    /// Serve the cache regardless of age; fail when nothing is cached.
    ReturnCacheElseFail,
    /// Always send a conditional request with the stored validator.
    Revalidate,
    /// Always download the full list without a validator.
    Reload,
}

/// Source of release metadata.
///
/// Implemented by [`ReleaseSource`]; tests substitute an in-memory provider.
#[async_trait]
pub trait ReleaseProvider: Send + Sync {
    /// List releases, newest first.
    async fn fetch_releases(&self, policy: CachePolicy) -> Result<Vec<Release>>;

    /// Resolve one release by tag; `latest` names the newest non-prerelease.
    async fn fetch_release(&self, tag: &str) -> Result<Release>;
}

/// Sort releases newest first.
///
/// Publication time decides; releases without one are ordered by semantic version
/// of their tag and placed after dated ones.
pub fn sort_newest_first(releases: &mut [Release]) {
    releases.sort_by(|a, b| match (b.published_at, a.published_at) {
        (Some(b_at), Some(a_at)) => b_at.cmp(&a_at),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => parse_tag(&b.tag_name).cmp(&parse_tag(&a.tag_name)),
    });
}

/// Parse a tag such as `v1.2.3` into a semantic version.
#[must_use]
pub fn parse_tag(tag: &str) -> Option<semver::Version> {
    semver::Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}
