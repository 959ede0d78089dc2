//! File system utilities for corekeep
//!
//! Every persistent document the supervisor owns (current pointer, state, release
//! cache, version metadata, settings) is written through [`atomic_write`], so a
//! reader never observes a partially written file.
//!
//! # Atomic Writes
//!
//! 1. Content is written to a uniquely named temporary file beside the target
//! 2. The temporary file is flushed and synced to disk
//! 3. The temporary file is renamed over the target, which is atomic on the same
//!    filesystem
//!
//! # Path Safety
//!
//! [`is_safe_path`] and [`normalize_path`] resolve `..` lexically, which is how the
//! archive extractor confines entries to its extraction directory.

use crate::core::{Result, SupervisorError};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Ensures a directory exists, creating it and its parents if necessary.
///
/// # Errors
///
/// Returns [`SupervisorError::FileSystem`] if the path exists but is not a
/// directory or cannot be created.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(SupervisorError::FileSystem {
                operation: "create directory".to_string(),
                path: path.display().to_string(),
                reason: "path exists but is not a directory".to_string(),
            });
        }
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| SupervisorError::fs("create directory", path, &e))
}

/// Atomically writes bytes to a file using a write-then-rename strategy.
///
/// The parent directory is created when missing. The temporary file carries a
/// random suffix so concurrent writers of the same target never clobber each
/// other's scratch file.
///
/// # Examples
///
/// ```rust,no_run
/// use corekeep::utils::fs::atomic_write;
/// use std::path::Path;
///
/// # fn example() -> corekeep::core::Result<()> {
/// atomic_write(Path::new("/tmp/corekeep/current"), br#"{"version":"v1.2.3"}"#)?;
/// # Ok(())
/// # }
/// ```
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    ensure_dir(parent)?;

    let file_name = path.file_name().map_or_else(
        || "corekeep".to_string(),
        |n| n.to_string_lossy().into_owned(),
    );
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()
    };

    if let Err(e) = write() {
        let _ = fs::remove_file(&temp_path);
        return Err(SupervisorError::fs("write", &temp_path, &e));
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        SupervisorError::fs("rename temp file to", path, &e)
    })
}

/// Serializes `value` as pretty JSON and writes it with [`atomic_write`].
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Reads and deserializes a JSON document, returning `None` when the file is absent.
///
/// # Errors
///
/// Returns [`SupervisorError::FileSystem`] if the file exists but cannot be read, or
/// [`SupervisorError::Parse`] if it is not valid JSON for `T`.
pub fn read_json_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SupervisorError::fs("read", path, &e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| SupervisorError::parse(&path.display().to_string(), e))
}

/// Removes a directory tree, succeeding if it does not exist.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SupervisorError::fs("remove directory", path, &e)),
    }
}

/// Removes a file, succeeding if it does not exist.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SupervisorError::fs("remove file", path, &e)),
    }
}

/// Copies `src` to `dst` and marks the copy executable (0755 on Unix).
///
/// A plain copy is used instead of a rename so the source may live on another
/// filesystem.
pub fn copy_executable(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| SupervisorError::fs("copy", src, &e))?;
    set_executable(dst)
}

/// Sets the executable permission bits on a file.
#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| SupervisorError::fs("set permissions on", path, &e))
}

/// Sets the executable permission bits on a file.
#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Normalizes a path by resolving `.` and `..` components lexically.
///
/// Unlike [`std::fs::canonicalize`] this does not touch the filesystem, so it works
/// for paths that do not exist yet. A `..` at the root is dropped.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else if components.is_empty() {
                    components.push(component);
                }
            }
            c => components.push(c),
        }
    }

    components.iter().collect()
}

/// Checks if a path stays inside the base directory.
///
/// Relative paths are resolved against `base`; both sides are normalized before
/// comparison so `a/../../x` is detected.
///
/// # Examples
///
/// ```rust
/// use corekeep::utils::fs::is_safe_path;
/// use std::path::Path;
///
/// let base = Path::new("/tmp/extract");
/// assert!(is_safe_path(base, Path::new("bin/core")));
/// assert!(!is_safe_path(base, Path::new("../../etc/passwd")));
/// assert!(!is_safe_path(base, Path::new("/etc/passwd")));
/// ```
#[must_use]
pub fn is_safe_path(base: &Path, path: &Path) -> bool {
    let normalized_base = normalize_path(base);
    let normalized_path = if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&base.join(path))
    };

    normalized_path.starts_with(normalized_base)
}

/// Returns the last `lines` lines of a text file.
///
/// Used by `corekeep logs`; invalid UTF-8 is replaced rather than rejected since the
/// log holds raw child output.
pub fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>> {
    let bytes = fs::read(path).map_err(|e| SupervisorError::fs("read", path, &e))?;
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| (*l).to_string()).collect())
}
