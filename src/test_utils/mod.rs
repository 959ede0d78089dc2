//! Test utilities for corekeep
//!
//! Shared by unit tests and, through the `test-utils` feature, by the integration
//! suite:
//! - [`fixtures`] - Native binary headers, release archives and a prepared root
//! - [`fakes`] - In-memory implementations of the injected seams
//! - [`http`] - A minimal HTTP server answering from a closure
//!
//! # Example
//!
//! ```rust,no_run
//! use corekeep::test_utils::{fakes::FakeHealth, init_test_logging};
//!
//! init_test_logging(None);
//! let health = FakeHealth::healthy();
//! health.set_healthy(false);
//! ```

pub mod fakes;
pub mod fixtures;
pub mod http;

pub use fakes::{FakeHealth, FakeProcess, StaticReleases};
pub use fixtures::{ReleaseFixture, TestRoot, native_binary, sha256_hex, write_tar_gz};

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Uses `level` when given, otherwise `RUST_LOG`; without either, tests run
/// silently. Safe to call from every test.
///
/// ```bash
/// RUST_LOG=corekeep=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}
