//! Checksum verification for downloaded artifacts.
//!
//! The expected digest comes from one of two places, in order:
//! 1. the digest published with the asset itself (`sha256:<hex>`)
//! 2. a checksum manifest attached to the same release, with lines of the form
//!    `<hex-digest>  <filename>` (a leading `*` on the file name marks binary mode)
//!
//! Verification is mandatory. When neither source yields a digest the install fails
//! with [`SupervisorError::ChecksumMissing`] instead of trusting the artifact.
//!
//! # Examples
//!
//! ```rust,no_run
//! use corekeep::verification::ChecksumVerifier;
//! use std::path::Path;
//!
//! # async fn example() -> corekeep::core::Result<()> {
//! let digest = ChecksumVerifier::compute_sha256(Path::new("core.tar.gz")).await?;
//! ChecksumVerifier::verify_checksum(Path::new("core.tar.gz"), &digest).await?;
//! # Ok(())
//! # }
//! ```

use crate::core::{Result, SupervisorError};
use crate::download::Downloader;
use crate::release::selector::is_checksum_manifest;
use crate::release::{Asset, Release};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// SHA-256 digest computation and comparison.
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    /// Compute the lowercase hex SHA-256 of a file.
    ///
    /// The file is hashed in chunks on the blocking pool, so large artifacts are not
    /// loaded into memory.
    pub async fn compute_sha256(file_path: &Path) -> Result<String> {
        debug!("Computing SHA256 checksum for: {}", file_path.display());
        let path = file_path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut file =
                std::fs::File::open(&path).map_err(|e| SupervisorError::fs("open", &path, &e))?;
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; 64 * 1024];
            loop {
                let read =
                    file.read(&mut buffer).map_err(|e| SupervisorError::fs("read", &path, &e))?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(|e| SupervisorError::Other {
            message: format!("checksum task failed: {e}"),
        })?
    }

    /// Verify a file against an expected digest.
    ///
    /// The expected value may carry a `sha256:` prefix and any letter case. Returns the
    /// computed digest on success.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ChecksumMismatch`] carrying both values on mismatch.
    pub async fn verify_checksum(file_path: &Path, expected: &str) -> Result<String> {
        info!("Verifying checksum for: {}", file_path.display());

        let expected = normalize_digest(expected).ok_or_else(|| SupervisorError::ChecksumMismatch {
            file: file_name(file_path),
            expected: expected.to_string(),
            actual: "<invalid expected digest>".to_string(),
        })?;
        let actual = Self::compute_sha256(file_path).await?;

        if actual != expected {
            return Err(SupervisorError::ChecksumMismatch {
                file: file_name(file_path),
                expected,
                actual,
            });
        }

        info!("Checksum verification successful");
        Ok(actual)
    }

    /// Resolve the expected digest for `asset`.
    ///
    /// Tries the embedded digest first, then every checksum manifest attached to the
    /// release. Manifests that cannot be fetched are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::ChecksumMissing`] when no source lists the asset.
    pub async fn resolve_expected(
        release: &Release,
        asset: &Asset,
        downloader: &Downloader,
    ) -> Result<String> {
        if let Some(digest) = asset.digest.as_deref().and_then(normalize_digest) {
            debug!("Using digest published with {}", asset.name);
            return Ok(digest);
        }

        let dedicated = format!("{}.sha256", asset.name);
        let mut manifests: Vec<&Asset> =
            release.assets.iter().filter(|a| is_checksum_manifest(&a.name)).collect();
        manifests.sort_by_key(|a| a.name != dedicated);

        for manifest in manifests {
            debug!("Fetching checksum manifest {}", manifest.name);
            let content = match downloader.fetch_text(&manifest.download_url).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to fetch checksum manifest {}: {}", manifest.name, e);
                    continue;
                }
            };

            let found = if manifest.name == dedicated {
                parse_single_digest(&content)
                    .or_else(|| parse_manifest(&content, &asset.name))
            } else {
                parse_manifest(&content, &asset.name)
            };

            if let Some(digest) = found {
                debug!("Found checksum for {} in {}", asset.name, manifest.name);
                return Ok(digest);
            }
        }

        Err(SupervisorError::ChecksumMissing {
            asset: asset.name.clone(),
        })
    }
}

/// Strip an optional `sha256:` prefix, lowercase, and require 64 hex digits.
#[must_use]
pub fn normalize_digest(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    let lower = hex_part.to_ascii_lowercase();
    (lower.len() == 64 && lower.chars().all(|c| c.is_ascii_hexdigit())).then_some(lower)
}

/// Find the digest listed for `file_name` in a `<hex>  <name>` manifest.
#[must_use]
pub fn parse_manifest(content: &str, file_name: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let name = name.trim_start_matches('*');
        let name = name.strip_prefix("./").unwrap_or(name);
        if name == file_name || name.rsplit('/').next() == Some(file_name) {
            normalize_digest(digest)
        } else {
            None
        }
    })
}

/// A `.sha256` sidecar may hold only the digest.
fn parse_single_digest(content: &str) -> Option<String> {
    let mut parts = content.split_whitespace();
    let digest = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    normalize_digest(digest)
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
