//! Host platform detection and path helpers
//!
//! Release assets are named with an OS token and an architecture token
//! (`core_1.2.3_linux_amd64.tar.gz`). This module maps the compile-time target to
//! those tokens, reports whether an emulation layer can run foreign binaries, and
//! resolves user-supplied paths.
//!
//! # Tokens
//!
//! | Target            | OS token  | Arch token |
//! |-------------------|-----------|------------|
//! | `linux`           | `linux`   |            |
//! | `macos`           | `darwin`  |            |
//! | `windows`         | `windows` |            |
//! | `x86_64`          |           | `amd64`    |
//! | `aarch64`         |           | `arm64`    |

use crate::core::{Result, SupervisorError};
use std::path::{Path, PathBuf};

/// Operating system token used in asset names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsToken {
    Linux,
    Darwin,
    Windows,
}

impl OsToken {
    /// Token as it appears in asset names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }

    /// All tokens, used to recognise assets built for another OS.
    pub const ALL: [Self; 3] = [Self::Linux, Self::Darwin, Self::Windows];
}

/// CPU architecture token used in asset names and binary metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Amd64,
    Arm64,
    #[serde(rename = "386")]
    I386,
    Arm,
    Ppc64le,
    Riscv64,
    S390x,
}

impl Arch {
    /// Token as it appears in asset names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::I386 => "386",
            Self::Arm => "arm",
            Self::Ppc64le => "ppc64le",
            Self::Riscv64 => "riscv64",
            Self::S390x => "s390x",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for OsToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An emulation layer able to run binaries built for another architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationLayer {
    /// Human-readable name
    pub name: &'static str,
    /// Architecture of the binaries it can run
    pub origin: Arch,
}

/// Rosetta 2 on Apple Silicon runs x86_64 Mach-O binaries.
pub const ROSETTA: EmulationLayer = EmulationLayer {
    name: "Rosetta 2",
    origin: Arch::Amd64,
};

/// Description of the machine the supervisor runs on.
///
/// Components take a `HostPlatform` by value instead of consulting `cfg!` directly so
/// tests can simulate other hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: OsToken,
    pub arch: Arch,
    /// Emulation layer present on this host, if any
    pub emulation: Option<EmulationLayer>,
}

impl HostPlatform {
    /// Detect the current host.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Config`] on targets no release is published for.
    pub fn detect() -> Result<Self> {
        let os = if cfg!(target_os = "macos") {
            OsToken::Darwin
        } else if cfg!(target_os = "windows") {
            OsToken::Windows
        } else if cfg!(target_os = "linux") {
            OsToken::Linux
        } else {
            return Err(SupervisorError::Config {
                message: format!("unsupported operating system '{}'", std::env::consts::OS),
            });
        };

        let arch = if cfg!(target_arch = "x86_64") {
            Arch::Amd64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            return Err(SupervisorError::Config {
                message: format!("unsupported architecture '{}'", std::env::consts::ARCH),
            });
        };

        let emulation = (os == OsToken::Darwin && arch == Arch::Arm64 && rosetta_installed())
            .then_some(ROSETTA);

        Ok(Self {
            os,
            arch,
            emulation,
        })
    }

    /// Suffix a release asset must end with to run on this host.
    #[must_use]
    pub fn asset_suffix(&self) -> String {
        format!("_{}_{}.tar.gz", self.os, self.arch)
    }

    /// File name of the core executable on this host.
    #[must_use]
    pub fn executable_name(&self, binary_name: &str) -> String {
        if self.os == OsToken::Windows && !binary_name.ends_with(".exe") {
            format!("{binary_name}.exe")
        } else {
            binary_name.to_string()
        }
    }
}

fn rosetta_installed() -> bool {
    Path::new("/Library/Apple/usr/share/rosetta/rosetta").exists()
}

/// Returns true on Windows.
#[must_use]
pub const fn is_windows() -> bool {
    cfg!(windows)
}

/// Returns true if a command is available on `PATH`.
#[must_use]
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Gets the home directory path for the current user.
pub fn get_home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| {
        let platform_help = if is_windows() {
            "check that the USERPROFILE environment variable is set"
        } else {
            "check that the HOME environment variable is set"
        };
        SupervisorError::Config {
            message: format!("could not determine home directory; {platform_help}"),
        }
    })
}

/// Resolves a path with tilde expansion and environment variable substitution.
///
/// # Examples
///
/// ```rust,no_run
/// use corekeep::utils::platform::resolve_path;
///
/// # fn example() -> corekeep::core::Result<()> {
/// let root = resolve_path("~/.corekeep")?;
/// println!("{}", root.display());
/// # Ok(())
/// # }
/// ```
pub fn resolve_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).map_err(|e| SupervisorError::Config {
        message: format!("cannot expand path '{path}': {e}"),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_suffix() {
        let host = HostPlatform {
            os: OsToken::Linux,
            arch: Arch::Amd64,
            emulation: None,
        };
        assert_eq!(host.asset_suffix(), "_linux_amd64.tar.gz");

        let mac = HostPlatform {
            os: OsToken::Darwin,
            arch: Arch::Arm64,
            emulation: Some(ROSETTA),
        };
        assert_eq!(mac.asset_suffix(), "_darwin_arm64.tar.gz");
    }

    #[test]
    fn test_executable_name() {
        let win = HostPlatform {
            os: OsToken::Windows,
            arch: Arch::Amd64,
            emulation: None,
        };
        assert_eq!(win.executable_name("core"), "core.exe");
        assert_eq!(win.executable_name("core.exe"), "core.exe");

        let linux = HostPlatform {
            os: OsToken::Linux,
            arch: Arch::Amd64,
            emulation: None,
        };
        assert_eq!(linux.executable_name("core"), "core");
    }

    #[test]
    fn test_detect_current_host() {
        let host = HostPlatform::detect().unwrap();
        if cfg!(target_arch = "x86_64") {
            assert_eq!(host.arch, Arch::Amd64);
        }
        if cfg!(target_os = "linux") {
            assert_eq!(host.os, OsToken::Linux);
            assert!(host.emulation.is_none());
        }
    }

    #[test]
    fn test_arch_serde_tokens() {
        assert_eq!(serde_json::to_string(&Arch::Amd64).unwrap(), "\"amd64\"");
        assert_eq!(serde_json::to_string(&Arch::I386).unwrap(), "\"386\"");
        let arch: Arch = serde_json::from_str("\"arm64\"").unwrap();
        assert_eq!(arch, Arch::Arm64);
    }

    #[test]
    fn test_resolve_path_tilde() {
        let home = get_home_dir().unwrap();
        assert_eq!(resolve_path("~/x").unwrap(), home.join("x"));
        assert_eq!(resolve_path("/abs/path").unwrap(), PathBuf::from("/abs/path"));
    }
}
