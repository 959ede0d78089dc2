//! Native executable inspection.
//!
//! Reads just enough of an executable's header to tell its format and the CPU
//! architectures it contains:
//!
//! | Format               | Magic                          | Architecture field      |
//! |----------------------|--------------------------------|-------------------------|
//! | ELF                  | `7F 45 4C 46`                  | `e_machine`             |
//! | Mach-O 32/64         | `FEEDFACE`/`FEEDFACF` (either endianness) | `cputype`    |
//! | Mach-O universal     | `CAFEBABE`/`CAFEBABF`          | `cputype` of each slice |
//! | PE                   | `MZ` + `PE\0\0`                | `Machine`               |
//!
//! [`BinaryInspector::validate`] then decides which architecture the host will run
//! the binary as, taking an installed emulation layer into account.

use crate::core::{Result, SupervisorError};
use crate::utils::platform::{Arch, HostPlatform, OsToken, command_exists};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const HEADER_READ_LIMIT: u64 = 64 * 1024;
const MAX_FAT_SLICES: u32 = 30;

/// Executable container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
    MachOUniversal,
    Pe,
}

impl BinaryFormat {
    /// Operating system that loads this format.
    #[must_use]
    pub const fn os(self) -> OsToken {
        match self {
            Self::Elf => OsToken::Linux,
            Self::MachO | Self::MachOUniversal => OsToken::Darwin,
            Self::Pe => OsToken::Windows,
        }
    }
}

/// Parsed header information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub format: BinaryFormat,
    /// Architectures present; empty when the header names an unknown CPU
    pub architectures: Vec<Arch>,
}

/// True if the file starts with a recognised native-executable magic number.
#[must_use]
pub fn has_native_magic(path: &Path) -> bool {
    read_header(path).map(|bytes| detect_format(&bytes).is_some()).unwrap_or(false)
}

/// Recognise the executable format from its leading bytes.
#[must_use]
pub fn detect_format(bytes: &[u8]) -> Option<BinaryFormat> {
    match bytes.get(..4)? {
        [0x7f, b'E', b'L', b'F'] => Some(BinaryFormat::Elf),
        [0xfe, 0xed, 0xfa, 0xce | 0xcf] | [0xce | 0xcf, 0xfa, 0xed, 0xfe] => Some(BinaryFormat::MachO),
        [0xca, 0xfe, 0xba, 0xbe | 0xbf] => {
            // Java class files share this magic; their "slice count" is a class version.
            let count = be_u32(bytes, 4)?;
            (count > 0 && count <= MAX_FAT_SLICES).then_some(BinaryFormat::MachOUniversal)
        }
        [b'M', b'Z', _, _] => {
            let pe_offset = le_u32(bytes, 0x3c)? as usize;
            (bytes.get(pe_offset..pe_offset + 4)? == b"PE\0\0").then_some(BinaryFormat::Pe)
        }
        _ => None,
    }
}

/// Parse the format and architectures of the executable at `path`.
///
/// # Errors
///
/// Returns [`SupervisorError::InvalidExecutable`] for anything that is not a
/// recognised native executable.
pub fn inspect_file(path: &Path) -> Result<BinaryInfo> {
    let bytes = read_header(path)?;
    inspect_bytes(&bytes).ok_or_else(|| SupervisorError::InvalidExecutable {
        path: path.display().to_string(),
    })
}

/// Parse the format and architectures from header bytes.
#[must_use]
pub fn inspect_bytes(bytes: &[u8]) -> Option<BinaryInfo> {
    let format = detect_format(bytes)?;
    let architectures = match format {
        BinaryFormat::Elf => elf_arch(bytes).into_iter().collect(),
        BinaryFormat::MachO => macho_arch(bytes).into_iter().collect(),
        BinaryFormat::MachOUniversal => fat_archs(bytes),
        BinaryFormat::Pe => pe_arch(bytes).into_iter().collect(),
    };
    Some(BinaryInfo {
        format,
        architectures,
    })
}

fn elf_arch(bytes: &[u8]) -> Option<Arch> {
    let little_endian = *bytes.get(5)? == 1;
    let machine = if little_endian { le_u16(bytes, 18)? } else { be_u16(bytes, 18)? };
    match machine {
        0x3e => Some(Arch::Amd64),
        0xb7 => Some(Arch::Arm64),
        0x03 => Some(Arch::I386),
        0x28 => Some(Arch::Arm),
        0x15 if little_endian => Some(Arch::Ppc64le),
        0xf3 => Some(Arch::Riscv64),
        0x16 => Some(Arch::S390x),
        _ => None,
    }
}

fn macho_cpu(cputype: u32) -> Option<Arch> {
    match cputype {
        0x0100_0007 => Some(Arch::Amd64),
        0x0100_000c => Some(Arch::Arm64),
        0x0000_0007 => Some(Arch::I386),
        0x0000_000c => Some(Arch::Arm),
        _ => None,
    }
}

fn macho_arch(bytes: &[u8]) -> Option<Arch> {
    let big_endian = bytes[0] == 0xfe;
    let cputype = if big_endian { be_u32(bytes, 4)? } else { le_u32(bytes, 4)? };
    macho_cpu(cputype)
}

fn fat_archs(bytes: &[u8]) -> Vec<Arch> {
    let is_64 = bytes.get(3) == Some(&0xbf);
    let entry_size = if is_64 { 32 } else { 20 };
    let count = be_u32(bytes, 4).unwrap_or(0) as usize;

    let mut archs = Vec::new();
    for index in 0..count {
        let offset = 8 + index * entry_size;
        if let Some(arch) = be_u32(bytes, offset).and_then(macho_cpu)
            && !archs.contains(&arch)
        {
            archs.push(arch);
        }
    }
    archs
}

fn pe_arch(bytes: &[u8]) -> Option<Arch> {
    let pe_offset = le_u32(bytes, 0x3c)? as usize;
    match le_u16(bytes, pe_offset + 4)? {
        0x8664 => Some(Arch::Amd64),
        0xaa64 => Some(Arch::Arm64),
        0x014c => Some(Arch::I386),
        0x01c4 => Some(Arch::Arm),
        _ => None,
    }
}

fn read_header(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path).map_err(|e| SupervisorError::fs("open", path, &e))?;
    let mut bytes = Vec::new();
    file.take(HEADER_READ_LIMIT)
        .read_to_end(&mut bytes)
        .map_err(|e| SupervisorError::fs("read", path, &e))?;
    Ok(bytes)
}

fn le_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(offset..offset + 2)?.try_into().ok()?))
}

fn be_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(offset..offset + 2)?.try_into().ok()?))
}

fn le_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?))
}

fn be_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?))
}

/// Validates installed binaries against the host.
#[derive(Debug, Clone)]
pub struct BinaryInspector {
    host: HostPlatform,
}

impl BinaryInspector {
    #[must_use]
    pub const fn new(host: HostPlatform) -> Self {
        Self {
            host,
        }
    }

    #[must_use]
    pub const fn host(&self) -> &HostPlatform {
        &self.host
    }

    /// Decide the architecture the host runs `path` as.
    ///
    /// The native architecture wins; otherwise the emulation layer's origin
    /// architecture is accepted when the layer is installed.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::InvalidExecutable`] for non-executables and formats of
    ///   another operating system
    /// - [`SupervisorError::EmulationRequired`] when only an emulated architecture is
    ///   present and the layer is missing
    /// - [`SupervisorError::ArchitectureMismatch`] otherwise
    pub fn validate(&self, path: &Path) -> Result<Arch> {
        let info = inspect_file(path)?;
        debug!("Inspected {}: {:?} {:?}", path.display(), info.format, info.architectures);

        if info.format.os() != self.host.os {
            return Err(SupervisorError::InvalidExecutable {
                path: path.display().to_string(),
            });
        }

        self.choose_arch(&info.architectures)
    }

    fn choose_arch(&self, supported: &[Arch]) -> Result<Arch> {
        if supported.contains(&self.host.arch) {
            return Ok(self.host.arch);
        }

        if let Some(layer) = self.host.emulation
            && supported.contains(&layer.origin)
        {
            info!("Binary will run as {} under {}", layer.origin, layer.name);
            return Ok(layer.origin);
        }

        if self.host.os == OsToken::Darwin
            && self.host.arch == Arch::Arm64
            && supported.contains(&crate::utils::platform::ROSETTA.origin)
        {
            return Err(SupervisorError::EmulationRequired {
                arch: crate::utils::platform::ROSETTA.origin.to_string(),
                layer: crate::utils::platform::ROSETTA.name.to_string(),
            });
        }

        Err(SupervisorError::ArchitectureMismatch {
            host: self.host.arch.to_string(),
            supported: supported.iter().map(ToString::to_string).collect(),
        })
    }

    /// Ad-hoc re-sign a binary on macOS.
    ///
    /// Callers log and ignore the error; a failed signature never aborts an install.
    pub async fn resign(&self, path: &Path) -> Result<()> {
        if self.host.os != OsToken::Darwin || !command_exists("codesign") {
            return Ok(());
        }

        let output = tokio::time::timeout(
            Duration::from_secs(30),
            tokio::process::Command::new("codesign")
                .args(["--force", "--sign", "-"])
                .arg(path)
                .output(),
        )
        .await
        .map_err(|_| SupervisorError::Other {
            message: "codesign timed out".to_string(),
        })?
        .map_err(|e| SupervisorError::Other {
            message: format!("failed to run codesign: {e}"),
        })?;

        if !output.status.success() {
            return Err(SupervisorError::Other {
                message: format!(
                    "codesign exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        debug!("Re-signed {}", path.display());
        Ok(())
    }
}
