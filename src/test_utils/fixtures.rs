//! Fixture builders: native binary stubs, release archives and prepared roots.

use crate::config::{ReleaseSettings, SupervisorConfig};
use crate::release::{Asset, Release};
use crate::utils::platform::{Arch, HostPlatform, OsToken};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use tempfile::TempDir;

/// Padding so stubs are larger than the other files in fixture archives.
const STUB_SIZE: usize = 4096;

/// Header bytes of an executable for `host`, padded to a few KiB.
///
/// Produces ELF on Linux, 64-bit Mach-O on macOS and PE on Windows, with the
/// machine field set to `host.arch`.
#[must_use]
pub fn native_binary(host: &HostPlatform) -> Vec<u8> {
    binary_for(host.os, host.arch)
}

/// Header bytes of an executable for `os`/`arch`.
#[must_use]
pub fn binary_for(os: OsToken, arch: Arch) -> Vec<u8> {
    let mut bytes = vec![0u8; STUB_SIZE];
    match os {
        OsToken::Linux => {
            let machine: u16 = match arch {
                Arch::Arm64 => 0xb7,
                Arch::I386 => 0x03,
                Arch::Arm => 0x28,
                _ => 0x3e,
            };
            bytes[..4].copy_from_slice(b"\x7fELF");
            bytes[4] = 2;
            bytes[5] = 1;
            bytes[6] = 1;
            bytes[16] = 2;
            bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        }
        OsToken::Darwin => {
            let cputype: u32 = match arch {
                Arch::Arm64 => 0x0100_000c,
                _ => 0x0100_0007,
            };
            bytes[..4].copy_from_slice(&[0xcf, 0xfa, 0xed, 0xfe]);
            bytes[4..8].copy_from_slice(&cputype.to_le_bytes());
        }
        OsToken::Windows => {
            let machine: u16 = match arch {
                Arch::Arm64 => 0xaa64,
                _ => 0x8664,
            };
            bytes[..2].copy_from_slice(b"MZ");
            bytes[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
            bytes[0x80..0x84].copy_from_slice(b"PE\0\0");
            bytes[0x84..0x86].copy_from_slice(&machine.to_le_bytes());
        }
    }
    bytes
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write a gzip-compressed tar at `path` holding `entries` (name, content).
pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).expect("create archive");
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, data) in entries {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).expect("append entry");
    }
    builder.into_inner().expect("finish tar").finish().expect("finish gzip");
}

fn file_url(path: &Path) -> String {
    reqwest::Url::from_file_path(path).expect("absolute fixture path").to_string()
}

/// A release whose single host asset is a real archive on disk.
#[derive(Debug, Clone)]
pub struct ReleaseFixture {
    pub release: Release,
    pub archive: PathBuf,
    pub sha256: String,
    dir: PathBuf,
}

impl ReleaseFixture {
    /// Build `tag` for `host`, packaging `binary` under the configured binary name.
    ///
    /// The asset carries its digest inline, as the release API publishes it.
    #[must_use]
    pub fn build(
        dir: &Path,
        tag: &str,
        host: &HostPlatform,
        settings: &ReleaseSettings,
        binary: &[u8],
    ) -> Self {
        let version = tag.strip_prefix('v').unwrap_or(tag);
        let asset_name = format!("{}_{version}{}", settings.asset_prefix, host.asset_suffix());
        let dir = dir.join(tag);
        std::fs::create_dir_all(&dir).expect("create fixture dir");

        let archive = dir.join(&asset_name);
        let executable = host.executable_name(&settings.binary_name);
        write_tar_gz(
            &archive,
            &[("README.md", b"# core\n".as_slice()), (executable.as_str(), binary)],
        );
        let bytes = std::fs::read(&archive).expect("read archive");
        let sha256 = sha256_hex(&bytes);

        let release = Release {
            tag_name: tag.to_string(),
            name: Some(format!("Release {tag}")),
            published_at: Some(chrono::Utc::now()),
            prerelease: false,
            draft: false,
            assets: vec![Asset {
                name: asset_name,
                download_url: file_url(&archive),
                size: bytes.len() as u64,
                digest: Some(format!("sha256:{sha256}")),
            }],
        };

        Self {
            release,
            archive,
            sha256,
            dir,
        }
    }

    /// Replace the inline digest.
    #[must_use]
    pub fn with_digest(mut self, digest: Option<String>) -> Self {
        self.release.assets[0].digest = digest;
        self
    }

    /// Publish the digest in a `checksums.txt` manifest instead of inline.
    #[must_use]
    pub fn with_checksum_manifest(mut self) -> Self {
        let manifest = self.dir.join("checksums.txt");
        let name = self.release.assets[0].name.clone();
        std::fs::write(&manifest, format!("{}  {name}\n", self.sha256)).expect("write manifest");
        self.release.assets[0].digest = None;
        self.release.assets.push(Asset {
            name: "checksums.txt".to_string(),
            download_url: file_url(&manifest),
            size: 0,
            digest: None,
        });
        self
    }
}

/// A temporary supervisor root with test-friendly settings.
pub struct TestRoot {
    pub temp: TempDir,
    pub config: SupervisorConfig,
}

impl TestRoot {
    /// Root with a zero dry-run warm-up and single-attempt health probes.
    #[must_use]
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp root");
        let mut config = SupervisorConfig::with_root(temp.path().join("root"));
        config.upgrade.dry_run_warmup_secs = 0;
        config.health.retries = 1;
        config.health.interval_secs = 1;
        config.release.web_fallback = false;
        Self {
            temp,
            config,
        }
    }

    /// Directory for fixture artifacts outside the supervisor root.
    #[must_use]
    pub fn artifacts(&self) -> PathBuf {
        let dir = self.temp.path().join("artifacts");
        std::fs::create_dir_all(&dir).expect("create artifacts dir");
        dir
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

impl Default for TestRoot {
    fn default() -> Self {
        Self::new()
    }
}
