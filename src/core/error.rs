//! Error handling for corekeep
//!
//! This module provides the closed error taxonomy used by every supervisor component
//! and the user-facing presentation layer built on top of it. The design follows two
//! principles:
//! 1. **Strongly-typed errors** so the upgrade pipeline and the lifecycle state machine
//!    can react to specific failure classes (retry, clean up, roll back)
//! 2. **User-friendly messages** with a details line and an actionable suggestion for
//!    CLI users
//!
//! # Architecture
//!
//! - [`SupervisorError`] - Enumerated error types for all failure cases
//! - [`ErrorCode`] - Stable machine-readable code for each variant
//! - [`ErrorContext`] - Wrapper that adds details and a recovery hint
//!
//! # Error Categories
//!
//! - **Network**: [`SupervisorError::Network`], [`SupervisorError::RateLimited`]
//! - **Parsing and cache**: [`SupervisorError::Parse`], [`SupervisorError::CacheCorrupted`],
//!   [`SupervisorError::CacheMissing`]
//! - **Asset selection**: [`SupervisorError::ReleaseNotFound`], [`SupervisorError::NoCompatibleAsset`]
//! - **Download and filesystem**: [`SupervisorError::DownloadFailed`], [`SupervisorError::FileSystem`]
//! - **Checksum**: [`SupervisorError::ChecksumMismatch`], [`SupervisorError::ChecksumMissing`]
//! - **Archive safety**: [`SupervisorError::PathTraversal`], [`SupervisorError::SymlinkEscape`]
//! - **Binary validation**: [`SupervisorError::InvalidExecutable`],
//!   [`SupervisorError::ArchitectureMismatch`], [`SupervisorError::EmulationRequired`]
//! - **Process**: [`SupervisorError::PortInUse`], [`SupervisorError::StartFailed`],
//!   [`SupervisorError::StartTimeout`], [`SupervisorError::HealthCheckFailed`]
//! - **Promotion and rollback**: [`SupervisorError::PromotionFailed`],
//!   [`SupervisorError::RollbackFailed`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use corekeep::core::{SupervisorError, user_friendly_error};
//!
//! let error = SupervisorError::ChecksumMissing {
//!     asset: "core_1.2.3_linux_amd64.tar.gz".to_string(),
//! };
//! assert_eq!(error.code().as_str(), "CHECKSUM_MISSING");
//!
//! let ctx = user_friendly_error(anyhow::Error::from(error));
//! ctx.display();
//! ```

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes.
///
/// Codes are stable across releases and are persisted in the supervisor state
/// (`last_attempt.error_code`), so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    RateLimited,
    ParseError,
    CacheCorrupted,
    CacheMissing,
    ReleaseNotFound,
    NoCompatibleAsset,
    DownloadFailed,
    FileSystemError,
    ChecksumMismatch,
    ChecksumMissing,
    PathTraversal,
    SymlinkEscape,
    BinaryNotFound,
    InvalidExecutable,
    ArchitectureMismatch,
    EmulationRequired,
    PortInUse,
    AlreadyRunning,
    NotRunning,
    StartFailed,
    StartTimeout,
    HealthCheckFailed,
    NotInstalled,
    VersionNotInstalled,
    VersionInUse,
    UpgradeInProgress,
    PromotionFailed,
    RollbackFailed,
    ConfigError,
    IoError,
    Other,
}

impl ErrorCode {
    /// The code as it appears in logs and persisted state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::ParseError => "PARSE_ERROR",
            Self::CacheCorrupted => "CACHE_CORRUPTED",
            Self::CacheMissing => "CACHE_MISSING",
            Self::ReleaseNotFound => "RELEASE_NOT_FOUND",
            Self::NoCompatibleAsset => "NO_COMPATIBLE_ASSET",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::FileSystemError => "FILE_SYSTEM_ERROR",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::ChecksumMissing => "CHECKSUM_MISSING",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::SymlinkEscape => "SYMLINK_ESCAPE",
            Self::BinaryNotFound => "BINARY_NOT_FOUND",
            Self::InvalidExecutable => "INVALID_EXECUTABLE",
            Self::ArchitectureMismatch => "ARCHITECTURE_MISMATCH",
            Self::EmulationRequired => "EMULATION_REQUIRED",
            Self::PortInUse => "PORT_IN_USE",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::StartFailed => "START_FAILED",
            Self::StartTimeout => "START_TIMEOUT",
            Self::HealthCheckFailed => "HEALTH_CHECK_FAILED",
            Self::NotInstalled => "NOT_INSTALLED",
            Self::VersionNotInstalled => "VERSION_NOT_INSTALLED",
            Self::VersionInUse => "VERSION_IN_USE",
            Self::UpgradeInProgress => "UPGRADE_IN_PROGRESS",
            Self::PromotionFailed => "PROMOTION_FAILED",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for supervisor operations
///
/// Every component returns this type; nothing else crosses a component boundary.
/// Foreign errors are flattened into string-carrying variants so the enum stays
/// `Clone` and can travel inside [`crate::orchestrator::LifecycleState::Error`].
///
/// # Examples
///
/// ```rust,no_run
/// use corekeep::core::SupervisorError;
///
/// fn handle(error: &SupervisorError) {
///     match error {
///         SupervisorError::PortInUse { port, process, .. } => {
///             eprintln!("port {port} is held by {process}");
///         }
///         e if e.is_retryable() => eprintln!("transient failure: {e}"),
///         e => eprintln!("failed: {e}"),
///     }
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// Network request failed (connection, timeout, unexpected HTTP status)
    #[error("Network error during {operation}: {reason}")]
    Network {
        /// What was being attempted (e.g. "list releases")
        operation: String,
        /// Underlying failure
        reason: String,
    },

    /// The release API refused the request because the quota is exhausted
    ///
    /// Raised for HTTP 429, and for HTTP 403 when the remaining-quota header is zero.
    #[error("Release API rate limit exceeded")]
    RateLimited {
        /// Unix timestamp when the quota resets, when the server supplied one
        reset_at: Option<i64>,
    },

    /// A payload could not be parsed
    #[error("Failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed (e.g. "release list")
        what: String,
        /// Parser error
        reason: String,
    },

    /// The on-disk release cache is unreadable
    #[error("Release cache at {path} is corrupted: {reason}")]
    CacheCorrupted {
        /// Cache file path
        path: String,
        /// Parse failure
        reason: String,
    },

    /// The cache-only policy was requested but nothing is cached
    #[error("No cached release metadata is available")]
    CacheMissing,

    /// The requested release tag does not exist upstream
    #[error("Release '{tag}' not found")]
    ReleaseNotFound {
        /// Requested tag
        tag: String,
    },

    /// No asset of the release matches this host
    #[error("No compatible asset in release '{tag}' (expected a name ending in '{expected_suffix}')")]
    NoCompatibleAsset {
        /// Release tag
        tag: String,
        /// Suffix that was required
        expected_suffix: String,
    },

    /// Streaming an artifact to disk failed
    #[error("Download of {url} failed: {reason}")]
    DownloadFailed {
        /// Source URL
        url: String,
        /// Failure reason
        reason: String,
    },

    /// A filesystem operation failed
    #[error("Failed to {operation} {path}: {reason}")]
    FileSystem {
        /// Operation (e.g. "create directory")
        operation: String,
        /// Path involved
        path: String,
        /// OS error text
        reason: String,
    },

    /// The downloaded file does not match its expected digest
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that was verified
        file: String,
        /// Expected SHA-256 (hex)
        expected: String,
        /// Computed SHA-256 (hex)
        actual: String,
    },

    /// No expected digest could be resolved for an asset
    #[error("No checksum available for asset {asset}")]
    ChecksumMissing {
        /// Asset file name
        asset: String,
    },

    /// An archive entry resolves outside the extraction root
    #[error("Archive entry '{entry}' escapes the extraction directory")]
    PathTraversal {
        /// Offending entry path
        entry: String,
    },

    /// A symbolic link in the archive points outside the extraction root
    #[error("Archive symlink '{entry}' points outside the extraction directory ({target})")]
    SymlinkEscape {
        /// Link path
        entry: String,
        /// Link target
        target: String,
    },

    /// The archive contained no recognisable executable
    #[error("No executable found in archive {archive}")]
    BinaryNotFound {
        /// Archive path
        archive: String,
    },

    /// The file is not a native executable
    #[error("{path} is not a recognised native executable")]
    InvalidExecutable {
        /// Inspected file
        path: String,
    },

    /// The binary does not run on this host
    #[error("Architecture mismatch: host is {host}, binary supports [{}]", supported.join(", "))]
    ArchitectureMismatch {
        /// Host architecture token
        host: String,
        /// Architectures present in the binary
        supported: Vec<String>,
    },

    /// The binary only runs under an emulation layer that is not installed
    #[error("Binary requires {arch} emulation ({layer}), which is not installed")]
    EmulationRequired {
        /// Architecture the binary was built for
        arch: String,
        /// Name of the emulation layer
        layer: String,
    },

    /// The target port is held by a process that is not ours
    #[error("Port {port} is in use by {process}")]
    PortInUse {
        /// Port number
        port: u16,
        /// Owning pid when known
        pid: Option<u32>,
        /// Owning process description
        process: String,
    },

    /// A child process is already tracked
    #[error("Core process is already running (pid {pid})")]
    AlreadyRunning {
        /// Tracked pid
        pid: u32,
    },

    /// An operation required a running process
    #[error("Core process is not running")]
    NotRunning,

    /// The child could not be launched or exited immediately
    #[error("Failed to start core process: {reason}")]
    StartFailed {
        /// Failure reason (spawn error or exit status)
        reason: String,
    },

    /// The child did not come up within the confirmation window
    #[error("Core process did not confirm startup within {timeout_ms} ms")]
    StartTimeout {
        /// Confirmation window
        timeout_ms: u64,
    },

    /// The instance did not answer its health endpoint
    #[error("Health check failed for instance on port {port}")]
    HealthCheckFailed {
        /// Probed port
        port: u16,
    },

    /// No version has been made current yet
    #[error("No core version is installed")]
    NotInstalled,

    /// The named version is not (fully) installed
    #[error("Version {version} is not installed")]
    VersionNotInstalled {
        /// Requested version
        version: String,
    },

    /// The version is current and cannot be replaced or removed
    #[error("Version {version} is current and cannot be modified")]
    VersionInUse {
        /// Version identifier
        version: String,
    },

    /// Another install holds the upgrade lock
    #[error("Another install or upgrade is already in progress")]
    UpgradeInProgress,

    /// The new version failed its promotion gate
    #[error("Promotion of {version} failed: {cause}")]
    PromotionFailed {
        /// Version that failed
        version: String,
        /// Underlying failure
        cause: Box<SupervisorError>,
    },

    /// Rolling back to the last known-good version failed
    #[error("Rollback failed: {reason}")]
    RollbackFailed {
        /// Failure reason
        reason: String,
    },

    /// Supervisor settings are invalid
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the problem
        message: String,
    },

    /// IO error
    #[error("IO error: {message}")]
    Io {
        /// OS error text
        message: String,
    },

    /// Other error
    #[error("{message}")]
    Other {
        /// Generic error message
        message: String,
    },
}

impl SupervisorError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::NetworkError,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Parse { .. } => ErrorCode::ParseError,
            Self::CacheCorrupted { .. } => ErrorCode::CacheCorrupted,
            Self::CacheMissing => ErrorCode::CacheMissing,
            Self::ReleaseNotFound { .. } => ErrorCode::ReleaseNotFound,
            Self::NoCompatibleAsset { .. } => ErrorCode::NoCompatibleAsset,
            Self::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            Self::FileSystem { .. } => ErrorCode::FileSystemError,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::ChecksumMissing { .. } => ErrorCode::ChecksumMissing,
            Self::PathTraversal { .. } => ErrorCode::PathTraversal,
            Self::SymlinkEscape { .. } => ErrorCode::SymlinkEscape,
            Self::BinaryNotFound { .. } => ErrorCode::BinaryNotFound,
            Self::InvalidExecutable { .. } => ErrorCode::InvalidExecutable,
            Self::ArchitectureMismatch { .. } => ErrorCode::ArchitectureMismatch,
            Self::EmulationRequired { .. } => ErrorCode::EmulationRequired,
            Self::PortInUse { .. } => ErrorCode::PortInUse,
            Self::AlreadyRunning { .. } => ErrorCode::AlreadyRunning,
            Self::NotRunning => ErrorCode::NotRunning,
            Self::StartFailed { .. } => ErrorCode::StartFailed,
            Self::StartTimeout { .. } => ErrorCode::StartTimeout,
            Self::HealthCheckFailed { .. } => ErrorCode::HealthCheckFailed,
            Self::NotInstalled => ErrorCode::NotInstalled,
            Self::VersionNotInstalled { .. } => ErrorCode::VersionNotInstalled,
            Self::VersionInUse { .. } => ErrorCode::VersionInUse,
            Self::UpgradeInProgress => ErrorCode::UpgradeInProgress,
            Self::PromotionFailed { .. } => ErrorCode::PromotionFailed,
            Self::RollbackFailed { .. } => ErrorCode::RollbackFailed,
            Self::Config { .. } => ErrorCode::ConfigError,
            Self::Io { .. } => ErrorCode::IoError,
            Self::Other { .. } => ErrorCode::Other,
        }
    }

    /// Whether the failure is transient and worth retrying within a bounded policy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::RateLimited { .. } | Self::PortInUse { .. })
    }

    /// Build a [`SupervisorError::FileSystem`] from an IO error.
    pub fn fs(operation: &str, path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::FileSystem {
            operation: operation.to_string(),
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Build a [`SupervisorError::Network`] error.
    pub fn network(operation: &str, reason: impl fmt::Display) -> Self {
        Self::Network {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a [`SupervisorError::Parse`] error.
    pub fn parse(what: &str, reason: impl fmt::Display) -> Self {
        Self::Parse {
            what: what.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Unwrap a [`SupervisorError::PromotionFailed`] to the failure that caused it.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::PromotionFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for SupervisorError {
    fn from(err: reqwest::Error) -> Self {
        let operation = err.url().map_or_else(|| "request".to_string(), |u| format!("GET {u}"));
        Self::Network {
            operation,
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse("JSON document", err)
    }
}

impl From<toml::de::Error> for SupervisorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for SupervisorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::parse("core configuration", err)
    }
}

/// Result type alias for supervisor operations.
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Error context wrapper that provides user-friendly error information
///
/// `ErrorContext` wraps a [`SupervisorError`] and adds optional details and a
/// recovery suggestion. This is how the CLI presents failures.
///
/// # Display Format
///
/// 1. **Error**: The main error message in red, prefixed with its code
/// 2. **Details**: Additional context in yellow (optional)
/// 3. **Suggestion**: Recovery hint in green (optional)
///
/// # Examples
///
/// ```rust,no_run
/// use corekeep::core::{ErrorContext, SupervisorError};
///
/// let context = ErrorContext::new(SupervisorError::NotInstalled)
///     .with_suggestion("Run 'corekeep install' to download the latest release")
///     .with_details("The current pointer does not name any installed version");
///
/// context.display();
/// ```
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// The underlying error
    pub error: SupervisorError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no details or suggestion.
    #[must_use]
    pub const fn new(error: SupervisorError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add additional details explaining the error
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Machine-readable code of the wrapped error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.error.code()
    }

    /// Display the error context to stderr with terminal colors
    ///
    /// - Error message: Red and bold
    /// - Details: Yellow
    /// - Suggestion: Green
    pub fn display(&self) {
        eprintln!("{} [{}]: {}", "error".red().bold(), self.code(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error to a user-friendly [`ErrorContext`] with recovery hints
///
/// Recognises [`SupervisorError`] (directly or wrapped in an [`ErrorContext`]) and
/// common IO failures; everything else is rendered with its full cause chain.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(ctx) = error.downcast_ref::<ErrorContext>() {
        return ctx.clone();
    }

    if let Some(supervisor_error) = error.downcast_ref::<SupervisorError>() {
        return create_error_context(supervisor_error.clone());
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        match io_error.kind() {
            std::io::ErrorKind::PermissionDenied => {
                return ErrorContext::new(SupervisorError::from(std::io::Error::new(
                    io_error.kind(),
                    io_error.to_string(),
                )))
                .with_suggestion("Check ownership of the corekeep root directory or choose another root with COREKEEP_ROOT")
                .with_details("corekeep needs write access to its versions, cache and log directories");
            }
            std::io::ErrorKind::NotFound => {
                return ErrorContext::new(SupervisorError::Io {
                    message: io_error.to_string(),
                })
                .with_suggestion("Check that the file or directory exists and the path is correct");
            }
            _ => {}
        }
    }

    let mut message = error.to_string();
    let chain: Vec<String> =
        error.chain().skip(1).map(std::string::ToString::to_string).collect();

    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }

    ErrorContext::new(SupervisorError::Other {
        message,
    })
}

/// Map each [`SupervisorError`] variant to an [`ErrorContext`] with a tailored hint.
#[must_use]
pub fn create_error_context(error: SupervisorError) -> ErrorContext {
    match &error {
        SupervisorError::Network { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Check your internet connection, or enable web fallback with 'release.web_fallback = true'")
            .with_details("Release metadata and artifacts are fetched from the configured release host"),

        SupervisorError::RateLimited { reset_at } => {
            let details = reset_at
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map_or_else(
                    || "The release API quota is exhausted".to_string(),
                    |at| format!("The release API quota resets at {}", at.to_rfc3339()),
                );
            ErrorContext::new(error.clone())
                .with_suggestion("Set 'release.github_token' in corekeep.toml or wait for the quota to reset")
                .with_details(details)
        }

        SupervisorError::CacheCorrupted { path, .. } => ErrorContext::new(error.clone())
            .with_suggestion(format!("Delete {path} and run 'corekeep releases --refresh'"))
            .with_details("The release cache is rebuilt from upstream on the next fetch"),

        SupervisorError::CacheMissing => ErrorContext::new(error.clone())
            .with_suggestion("Run 'corekeep releases --refresh' while online to populate the cache"),

        SupervisorError::NoCompatibleAsset { expected_suffix, .. } => ErrorContext::new(error.clone())
            .with_suggestion("Choose a release that publishes a build for this platform")
            .with_details(format!("Assets are matched by exact suffix '{expected_suffix}'")),

        SupervisorError::ChecksumMismatch { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Retry the install; if it keeps failing the release artifact may have been tampered with")
            .with_details("The partially installed version was removed and the current version is unchanged"),

        SupervisorError::ChecksumMissing { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Publish a checksums.txt manifest with the release or use 'corekeep install-file' with a trusted binary")
            .with_details("Checksum verification is mandatory before any archive is extracted"),

        SupervisorError::PathTraversal { .. } | SupervisorError::SymlinkEscape { .. } => {
            ErrorContext::new(error.clone())
                .with_suggestion("Do not install this release; report the archive to its publisher")
                .with_details("The archive tried to write outside its extraction directory and nothing was installed")
        }

        SupervisorError::ArchitectureMismatch { host, .. } => ErrorContext::new(error.clone())
            .with_suggestion(format!("Install a build compiled for {host}"))
            .with_details("The version was not promoted and the current version is unchanged"),

        SupervisorError::EmulationRequired { layer, .. } => ErrorContext::new(error.clone())
            .with_suggestion(format!("Install {layer} or use a native build"))
            .with_details("The binary was built for another architecture"),

        SupervisorError::PortInUse { port, process, .. } => ErrorContext::new(error.clone())
            .with_suggestion(format!("Stop {process} or change 'port' in corekeep.toml"))
            .with_details(format!(
                "Port {port} belongs to a process outside the corekeep install root, so it was not terminated"
            )),

        SupervisorError::StartFailed { .. } | SupervisorError::StartTimeout { .. } => {
            ErrorContext::new(error.clone())
                .with_suggestion("Inspect the core log with 'corekeep logs'")
        }

        SupervisorError::NotInstalled => ErrorContext::new(error.clone())
            .with_suggestion("Run 'corekeep install' to download and activate the latest release"),

        SupervisorError::VersionNotInstalled { .. } => ErrorContext::new(error.clone())
            .with_suggestion("List installed versions with 'corekeep versions'"),

        SupervisorError::UpgradeInProgress => ErrorContext::new(error.clone())
            .with_suggestion("Wait for the running install to finish and try again"),

        SupervisorError::PromotionFailed { cause, .. } => ErrorContext::new(error.clone())
            .with_suggestion("The previous version is still current; inspect 'corekeep logs' for the dry-run output")
            .with_details(format!("Underlying failure [{}]: {}", cause.code(), cause)),

        SupervisorError::RollbackFailed { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Select a working version manually with 'corekeep use <VERSION>'"),

        SupervisorError::Config { .. } => ErrorContext::new(error.clone())
            .with_suggestion("Check corekeep.toml; 'corekeep config show' prints the effective settings"),

        _ => ErrorContext::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SupervisorError::ChecksumMismatch {
            file: "core.tar.gz".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(error.to_string(), "Checksum mismatch for core.tar.gz: expected aa, got bb");
    }

    #[test]
    fn test_architecture_mismatch_lists_supported() {
        let error = SupervisorError::ArchitectureMismatch {
            host: "arm64".to_string(),
            supported: vec!["amd64".to_string(), "386".to_string()],
        };
        assert_eq!(error.to_string(), "Architecture mismatch: host is arm64, binary supports [amd64, 386]");
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(SupervisorError::NotInstalled.code().as_str(), "NOT_INSTALLED");
        assert_eq!(SupervisorError::UpgradeInProgress.code().as_str(), "UPGRADE_IN_PROGRESS");
        let json = serde_json::to_string(&ErrorCode::PortInUse).unwrap();
        assert_eq!(json, "\"PORT_IN_USE\"");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(SupervisorError::network("list releases", "timeout").is_retryable());
        assert!(SupervisorError::RateLimited { reset_at: None }.is_retryable());
        assert!(
            !SupervisorError::ChecksumMissing {
                asset: "a".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_promotion_root_cause() {
        let error = SupervisorError::PromotionFailed {
            version: "v1.0.0".to_string(),
            cause: Box::new(SupervisorError::HealthCheckFailed {
                port: 4000,
            }),
        };
        assert_eq!(error.code(), ErrorCode::PromotionFailed);
        assert_eq!(error.root_cause().code(), ErrorCode::HealthCheckFailed);
    }

    #[test]
    fn test_user_friendly_error_supervisor_error() {
        let ctx = user_friendly_error(anyhow::Error::from(SupervisorError::NotInstalled));
        assert_eq!(ctx.code(), ErrorCode::NotInstalled);
        assert!(ctx.suggestion.unwrap().contains("corekeep install"));
    }

    #[test]
    fn test_user_friendly_error_port_in_use() {
        let ctx = create_error_context(SupervisorError::PortInUse {
            port: 8080,
            pid: Some(42),
            process: "nginx (pid 42)".to_string(),
        });
        assert!(ctx.suggestion.unwrap().contains("nginx"));
        assert!(ctx.details.unwrap().contains("8080"));
    }

    #[test]
    fn test_user_friendly_error_generic_chain() {
        let error = anyhow::anyhow!("inner").context("outer");
        let ctx = user_friendly_error(error);
        let message = ctx.error.to_string();
        assert!(message.contains("outer"));
        assert!(message.contains("Caused by"));
        assert!(message.contains("inner"));
    }

    #[test]
    fn test_error_context_display() {
        let ctx = ErrorContext::new(SupervisorError::NotRunning)
            .with_details("detail")
            .with_suggestion("hint");
        let rendered = ctx.to_string();
        assert!(rendered.contains("Core process is not running"));
        assert!(rendered.contains("Details: detail"));
        assert!(rendered.contains("Suggestion: hint"));
    }
}
