//! corekeep - local self-updating supervisor for a versioned core service
//!
//! corekeep keeps one binary of an upstream "core" service installed, running and
//! healthy on this machine. New releases are discovered upstream, downloaded,
//! verified and dry-run on a scratch port before they replace the running version;
//! a version that keeps failing its health checks is rolled back to the last one
//! that passed.
//!
//! # Architecture Overview
//!
//! Everything lives under one root directory (default `~/.corekeep`):
//!
//! ```text
//! ~/.corekeep/
//! ├── corekeep.toml          # supervisor settings
//! ├── config.yaml            # configuration handed to the core binary
//! ├── current                # pointer to the active version
//! ├── state.json             # failure counter, last-known-good, last attempt
//! ├── cache/releases.json    # release list cache
//! ├── versions/<version>/    # one directory per installed binary
//! ├── logs/core.log          # output of the running core
//! └── logs/dry-run.log       # output of dry runs
//! ```
//!
//! An install moves through resolve, select, download, verify, extract, validate,
//! sign, dry run and promote. Only the last step touches the `current` pointer, so a
//! failure at any earlier point leaves the running version untouched.
//!
//! # Core Modules
//!
//! ## Lifecycle
//! - [`orchestrator`] - Start/stop, health monitoring and automatic rollback
//! - [`process`] - Spawning and stopping the core, port ownership
//! - [`health`] - HTTP liveness probe
//!
//! ## Installation
//! - [`upgrade`] - The install pipeline and the upgrade lock
//! - [`release`] - Release discovery, caching and web fallback
//! - [`download`] - Streaming artifact downloads
//! - [`verification`] - SHA-256 checksum resolution and verification
//! - [`archive`] - Safe `.tar.gz` extraction
//! - [`inspect`] - Executable format and architecture validation
//! - [`store`] - Installed versions, the current pointer and persisted state
//!
//! ## Supporting Modules
//! - [`cli`] - Command-line interface
//! - [`config`] - Supervisor settings and the core's YAML configuration
//! - [`core`] - Error types and user-facing error context
//! - [`utils`] - File system, platform, progress and retry helpers
//!
//! # Command-Line Usage
//!
//! ```bash
//! # Install the latest release and make it current
//! corekeep install
//!
//! # Run the current version in the foreground with health monitoring
//! corekeep run
//!
//! # Inspect and switch versions
//! corekeep versions
//! corekeep use v6.1.0
//! corekeep rollback
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod download;
pub mod health;
pub mod inspect;
pub mod orchestrator;
pub mod process;
pub mod release;
pub mod store;
pub mod upgrade;
pub mod utils;
pub mod verification;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::core::{Result, SupervisorError};
