//! Cross-platform utilities and helpers
//!
//! # Modules
//!
//! - [`fs`] - Atomic writes, path confinement checks and executable copies
//! - [`platform`] - Host OS/architecture tokens, emulation detection, path resolution
//! - [`progress`] - Progress bars and spinners for downloads and install phases
//! - [`retry`] - Bounded exponential backoff for transient network failures

pub mod fs;
pub mod platform;
pub mod progress;
pub mod retry;

pub use fs::{atomic_write, ensure_dir, is_safe_path, normalize_path};
pub use platform::{Arch, HostPlatform, OsToken};
pub use progress::ProgressBar;
