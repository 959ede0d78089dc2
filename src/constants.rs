//! Global constants used throughout the corekeep codebase.
//!
//! This module contains timeout durations, retry parameters, file names and other
//! fixed values shared by several components. Defining them centrally keeps magic
//! numbers discoverable.

use std::time::Duration;

/// Maximum backoff delay for release API retries (2 seconds).
///
/// Exponential backoff delays are capped at this value so a flaky network
/// never stalls an install for long.
pub const MAX_BACKOFF_DELAY_MS: u64 = 2_000;

/// Starting delay for exponential backoff (200ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 200;

/// Number of retries after the first attempt for transient network failures.
pub const NETWORK_RETRIES: usize = 2;

/// Timeout for a single release API request (30 seconds).
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing a download connection (30 seconds).
///
/// The body itself is streamed without a total deadline; each chunk read is
/// bounded by [`DOWNLOAD_READ_TIMEOUT`].
pub const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum silence between two chunks of a download body (60 seconds).
pub const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum number of bytes between two progress reports (64 KiB).
pub const PROGRESS_REPORT_BYTES: u64 = 64 * 1024;

/// Minimum interval between two progress reports (100ms).
pub const PROGRESS_REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// How long a freshly spawned child must stay alive to count as started (1 second).
pub const START_CONFIRM_WINDOW: Duration = Duration::from_millis(1_000);

/// Poll interval while confirming startup or waiting for exit (50ms).
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL when stopping the child (5 seconds).
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Poll interval while waiting for an orphaned instance to release its port (200ms).
pub const PORT_RECLAIM_POLL: Duration = Duration::from_millis(200);

/// Maximum wait for an orphaned instance to exit after each signal (5 seconds).
pub const PORT_RECLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between two health probe attempts (500ms).
pub const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// File name of the current-version pointer under the root directory.
pub const CURRENT_POINTER_FILE: &str = "current";

/// File name of the per-version metadata document.
pub const METADATA_FILE: &str = "metadata.json";

/// File name of the persisted supervisor state.
pub const STATE_FILE: &str = "state.json";

/// File name of the release metadata cache inside `cache/`.
pub const RELEASE_CACHE_FILE: &str = "releases.json";

/// File name of the supervisor settings file.
pub const SETTINGS_FILE: &str = "corekeep.toml";

/// File name of the core binary's own configuration.
pub const CORE_CONFIG_FILE: &str = "config.yaml";

/// Log file receiving the main instance's stdout and stderr.
pub const CORE_LOG_FILE: &str = "core.log";

/// Log file receiving dry-run instances' stdout and stderr.
pub const DRY_RUN_LOG_FILE: &str = "dry-run.log";

/// User agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("corekeep/", env!("CARGO_PKG_VERSION"));
