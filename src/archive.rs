//! Safe extraction of release archives.
//!
//! Release archives are untrusted input. Extraction happens in a private scratch
//! directory and every entry is checked twice:
//!
//! 1. While reading the archive, each entry path must stay inside the scratch
//!    directory and each link target must resolve inside it. Offending entries
//!    abort extraction before anything is written for them.
//! 2. After extraction, the tree is walked again and every path and symlink target
//!    is re-validated before any file is trusted. Symlinks are resolved on disk
//!    here, so a chain of individually harmless links cannot point outside the
//!    scratch directory, and dangling links are refused.
//!
//! Only then is the executable located (known file names first, then the largest
//! file with a native-executable header) and copied into the version directory.
//! The scratch directory is removed on every exit path.

use crate::core::{Result, SupervisorError};
use crate::inspect::has_native_magic;
use crate::utils::fs::{copy_executable, ensure_dir, is_safe_path, normalize_path};
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Extracts archives and installs the executable they contain.
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    scratch_dir: PathBuf,
}

impl ArchiveExtractor {
    /// Scratch directories are created under `scratch_dir`.
    #[must_use]
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Extract `archive` and copy its executable to `dest`.
    ///
    /// `candidates` lists preferred executable file names, most preferred first.
    pub async fn install(&self, archive: &Path, candidates: &[String], dest: &Path) -> Result<PathBuf> {
        let scratch_dir = self.scratch_dir.clone();
        let archive = archive.to_path_buf();
        let candidates = candidates.to_vec();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || {
            install_blocking(&scratch_dir, &archive, &candidates, &dest)
        })
        .await
        .map_err(|e| SupervisorError::Other {
            message: format!("extraction task failed: {e}"),
        })?
    }
}

fn install_blocking(
    scratch_dir: &Path,
    archive: &Path,
    candidates: &[String],
    dest: &Path,
) -> Result<PathBuf> {
    ensure_dir(scratch_dir)?;
    let scratch = tempfile::Builder::new()
        .prefix("extract-")
        .tempdir_in(scratch_dir)
        .map_err(|e| SupervisorError::fs("create scratch directory in", scratch_dir, &e))?;

    // Canonical root so symlinked temp locations compare correctly.
    let root = std::fs::canonicalize(scratch.path())
        .map_err(|e| SupervisorError::fs("resolve", scratch.path(), &e))?;

    info!("Extracting {}", archive.display());
    extract_tar_gz(archive, &root)?;
    validate_tree(&root)?;

    let binary = find_executable(&root, candidates).ok_or_else(|| SupervisorError::BinaryNotFound {
        archive: archive.display().to_string(),
    })?;
    debug!("Found executable {}", binary.display());

    copy_executable(&binary, dest)?;
    Ok(dest.to_path_buf())
}

/// Extract a gzip-compressed tar archive into `root`, rejecting unsafe entries.
pub fn extract_tar_gz(archive_path: &Path, root: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| SupervisorError::fs("open", archive_path, &e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let corrupt = |e: std::io::Error| SupervisorError::parse(&archive_path.display().to_string(), e);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let entry_path = entry.path().map_err(corrupt)?.into_owned();
        let display = entry_path.display().to_string();

        if entry_path.is_absolute() || !is_safe_path(root, &entry_path) {
            return Err(SupervisorError::PathTraversal {
                entry: display,
            });
        }

        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::Symlink | EntryType::Link) {
            let target = entry
                .link_name()
                .map_err(corrupt)?
                .map(|t| t.into_owned())
                .unwrap_or_default();
            let resolved = if entry_type == EntryType::Link {
                root.join(&target)
            } else {
                resolve_link(&root.join(&entry_path), &target)
            };
            if !is_safe_path(root, &resolved) {
                return Err(SupervisorError::SymlinkEscape {
                    entry: display,
                    target: target.display().to_string(),
                });
            }
        }

        let unpacked = entry.unpack_in(root).map_err(|e| SupervisorError::FileSystem {
            operation: "extract".to_string(),
            path: display.clone(),
            reason: e.to_string(),
        })?;
        if !unpacked {
            return Err(SupervisorError::PathTraversal {
                entry: display,
            });
        }

        // Earlier links may redirect this one; targets that do not exist yet are
        // left to `validate_tree`.
        if entry_type == EntryType::Symlink
            && let Ok(real) = std::fs::canonicalize(root.join(&entry_path))
            && !real.starts_with(root)
        {
            let target = std::fs::read_link(root.join(&entry_path)).unwrap_or_default();
            return Err(SupervisorError::SymlinkEscape {
                entry: display,
                target: target.display().to_string(),
            });
        }
    }

    Ok(())
}

/// Re-validate every extracted path and symlink target under `root`.
///
/// `root` must be canonical. Each symlink must resolve on disk, through any
/// other links, to a path under `root`.
pub fn validate_tree(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| SupervisorError::FileSystem {
            operation: "walk".to_string(),
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path).display().to_string();

        if !is_safe_path(root, path) {
            return Err(SupervisorError::PathTraversal {
                entry: relative,
            });
        }

        if entry.path_is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|e| SupervisorError::fs("read link", path, &e))?;
            let escapes = !is_safe_path(root, &resolve_link(path, &target))
                || !std::fs::canonicalize(path).is_ok_and(|real| real.starts_with(root));
            if escapes {
                return Err(SupervisorError::SymlinkEscape {
                    entry: relative,
                    target: target.display().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn resolve_link(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        normalize_path(target)
    } else {
        let parent = link.parent().unwrap_or(link);
        normalize_path(&parent.join(target))
    }
}

/// Locate the executable inside an extracted tree.
///
/// Regular files whose name matches a candidate win (earlier candidates first, then
/// shallower paths). Otherwise the largest regular file with a native-executable
/// header is chosen. Symlinks are never followed or returned.
#[must_use]
pub fn find_executable(root: &Path, candidates: &[String]) -> Option<PathBuf> {
    let files: Vec<(PathBuf, usize, u64)> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (e.path().to_path_buf(), e.depth(), size)
        })
        .collect();

    for candidate in candidates {
        let best = files
            .iter()
            .filter(|(path, _, _)| {
                path.file_name().is_some_and(|n| n.to_string_lossy() == candidate.as_str())
            })
            .min_by_key(|(_, depth, _)| *depth);
        if let Some((path, _, _)) = best {
            return Some(path.clone());
        }
    }

    files
        .iter()
        .filter(|(path, _, _)| has_native_magic(path))
        .max_by_key(|(_, _, size)| *size)
        .map(|(path, _, _)| path.clone())
}
