//! Host asset selection.
//!
//! Selection is by exact suffix (`_<os>_<arch>.tar.gz`). There is no fuzzy
//! matching and no substitution of another architecture here; whether a foreign
//! binary can run under emulation is decided after install by the inspector.

use super::{Asset, Release};
use crate::core::{Result, SupervisorError};
use crate::utils::platform::{HostPlatform, OsToken};
use tracing::debug;

/// Returns true for checksum manifests published next to the archives.
#[must_use]
pub fn is_checksum_manifest(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "checksums.txt"
        || lower.ends_with("_checksums.txt")
        || lower.ends_with(".sha256")
        || lower.ends_with(".sha256sum")
        || lower == "sha256sums"
        || lower == "sha256sums.txt"
}

/// Picks the release asset built for a host.
#[derive(Debug, Clone)]
pub struct AssetSelector {
    host: HostPlatform,
}

impl AssetSelector {
    #[must_use]
    pub const fn new(host: HostPlatform) -> Self {
        Self {
            host,
        }
    }

    /// Return the asset whose name ends with the host suffix.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NoCompatibleAsset`] when nothing matches.
    pub fn select<'a>(&self, release: &'a Release) -> Result<&'a Asset> {
        let suffix = self.host.asset_suffix();
        let foreign: Vec<String> = OsToken::ALL
            .iter()
            .filter(|os| **os != self.host.os)
            .map(|os| format!("_{os}_"))
            .collect();

        let candidate = release
            .assets
            .iter()
            .filter(|a| !is_checksum_manifest(&a.name))
            .filter(|a| !foreign.iter().any(|token| a.name.contains(token.as_str())))
            .find(|a| a.name.ends_with(&suffix));

        match candidate {
            Some(asset) => {
                debug!("Selected asset {} from release {}", asset.name, release.tag_name);
                Ok(asset)
            }
            None => Err(SupervisorError::NoCompatibleAsset {
                tag: release.tag_name.clone(),
                expected_suffix: suffix,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::platform::Arch;

    fn asset(name: &str) -> Asset {
        Asset {
            name: name.to_string(),
            download_url: format!("https://example.com/{name}"),
            size: 1,
            digest: None,
        }
    }

    fn release(names: &[&str]) -> Release {
        Release {
            tag_name: "v1.2.3".to_string(),
            name: None,
            published_at: None,
            prerelease: false,
            draft: false,
            assets: names.iter().map(|n| asset(n)).collect(),
        }
    }

    fn linux_amd64() -> AssetSelector {
        AssetSelector::new(HostPlatform {
            os: OsToken::Linux,
            arch: Arch::Amd64,
            emulation: None,
        })
    }

    #[test]
    fn test_selects_exact_suffix() {
        let release = release(&[
            "checksums.txt",
            "core_1.2.3_darwin_amd64.tar.gz",
            "core_1.2.3_linux_arm64.tar.gz",
            "core_1.2.3_linux_amd64.tar.gz",
            "core_1.2.3_windows_amd64.zip",
        ]);
        let selected = linux_amd64().select(&release).unwrap();
        assert_eq!(selected.name, "core_1.2.3_linux_amd64.tar.gz");
    }

    #[test]
    fn test_manifest_never_selected() {
        let release = release(&["core_1.2.3_linux_amd64.tar.gz.sha256"]);
        assert!(linux_amd64().select(&release).is_err());
    }

    #[test]
    fn test_no_cross_arch_substitution() {
        let release = release(&["core_1.2.3_linux_arm64.tar.gz", "core_1.2.3_darwin_amd64.tar.gz"]);
        let err = linux_amd64().select(&release).unwrap_err();
        match err {
            SupervisorError::NoCompatibleAsset {
                tag,
                expected_suffix,
            } => {
                assert_eq!(tag, "v1.2.3");
                assert_eq!(expected_suffix, "_linux_amd64.tar.gz");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_manifest_names() {
        assert!(is_checksum_manifest("checksums.txt"));
        assert!(is_checksum_manifest("core_1.2.3_checksums.txt"));
        assert!(is_checksum_manifest("SHA256SUMS"));
        assert!(is_checksum_manifest("core.tar.gz.sha256"));
        assert!(!is_checksum_manifest("core_1.2.3_linux_amd64.tar.gz"));
    }
}
