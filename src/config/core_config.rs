//! The core binary's own YAML configuration.
//!
//! The supervisor treats the document as opaque except for its top-level `port`
//! key, which it creates, migrates and overlays. Everything else is preserved.

use crate::core::{Result, SupervisorError};
use crate::utils::fs::atomic_write;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PORT_KEY: &str = "port";

/// Make sure the core configuration exists at `path` and listens on `port`.
///
/// - When the file exists its `port` key is updated if it differs.
/// - Otherwise, when `legacy` names an existing file it is migrated (copied with the
///   port overlaid).
/// - Otherwise a minimal document containing only `port` is written.
pub fn ensure_core_config(path: &Path, port: u16, legacy: Option<&Path>) -> Result<PathBuf> {
    if path.exists() {
        let document = read_document(path)?;
        if port_of(&document) != Some(port) {
            info!("Setting port {} in {}", port, path.display());
            write_document(path, &with_port(document, port))?;
        }
        return Ok(path.to_path_buf());
    }

    if let Some(legacy) = legacy.filter(|p| p.exists()) {
        info!("Migrating core configuration from {}", legacy.display());
        let document = read_document(legacy)?;
        write_document(path, &with_port(document, port))?;
        return Ok(path.to_path_buf());
    }

    debug!("Writing default core configuration to {}", path.display());
    write_document(path, &with_port(Value::Mapping(Mapping::new()), port))?;
    Ok(path.to_path_buf())
}

/// Write a copy of `source` to `dest` listening on `port` instead.
pub fn write_overlay(source: &Path, dest: &Path, port: u16) -> Result<()> {
    let document = read_document(source)?;
    write_document(dest, &with_port(document, port))
}

/// The `port` value of the configuration at `path`, if any.
pub fn read_port(path: &Path) -> Result<Option<u16>> {
    Ok(port_of(&read_document(path)?))
}

fn read_document(path: &Path) -> Result<Value> {
    let content =
        std::fs::read_to_string(path).map_err(|e| SupervisorError::fs("read", path, &e))?;
    if content.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    serde_yaml::from_str(&content).map_err(|e| {
        SupervisorError::parse(&format!("core configuration {}", path.display()), e)
    })
}

fn write_document(path: &Path, document: &Value) -> Result<()> {
    let content = serde_yaml::to_string(document)?;
    atomic_write(path, content.as_bytes())
}

fn port_of(document: &Value) -> Option<u16> {
    document.get(PORT_KEY).and_then(Value::as_u64).and_then(|p| u16::try_from(p).ok())
}

fn with_port(document: Value, port: u16) -> Value {
    let mut mapping = match document {
        Value::Mapping(mapping) => mapping,
        _ => Mapping::new(),
    };
    mapping.insert(Value::String(PORT_KEY.to_string()), Value::Number(port.into()));
    Value::Mapping(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_minimal_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");

        ensure_core_config(&path, 8317, None).unwrap();

        assert_eq!(read_port(&path).unwrap(), Some(8317));
    }

    #[test]
    fn test_migrates_legacy_config() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("old.yaml");
        std::fs::write(&legacy, "port: 1234\nauth-dir: /home/me/.auth\n").unwrap();
        let path = temp.path().join("config.yaml");

        ensure_core_config(&path, 8317, Some(&legacy)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("auth-dir"));
        assert_eq!(read_port(&path).unwrap(), Some(8317));
        assert!(legacy.exists());
    }

    #[test]
    fn test_existing_config_port_updated_and_keys_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "port: 1\ndebug: true\n").unwrap();

        ensure_core_config(&path, 9000, None).unwrap();

        let document = read_document(&path).unwrap();
        assert_eq!(port_of(&document), Some(9000));
        assert_eq!(document.get("debug").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn test_overlay_leaves_source_untouched() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("config.yaml");
        std::fs::write(&source, "port: 8317\nlogging: true\n").unwrap();
        let dest = temp.path().join("tmp").join("dry-run.yaml");

        write_overlay(&source, &dest, 45123).unwrap();

        assert_eq!(read_port(&source).unwrap(), Some(8317));
        assert_eq!(read_port(&dest).unwrap(), Some(45123));
        assert!(std::fs::read_to_string(&dest).unwrap().contains("logging"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "port: [unclosed").unwrap();
        assert!(matches!(read_port(&path), Err(SupervisorError::Parse { .. })));
    }
}
