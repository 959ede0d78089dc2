//! Command-line interface for corekeep.
//!
//! Each command lives in its own module with its own `clap` argument struct and an
//! `execute` method taking the shared [`CommandContext`].
//!
//! # Available Commands
//!
//! ## Lifecycle
//! - `run` - Start the current version and supervise it until Ctrl-C
//! - `rollback` - Switch back to the last-known-good version
//! - `use` - Switch to another installed version
//!
//! ## Installation
//! - `install` - Install a release (default `latest`)
//! - `install-file` - Install a local binary or archive
//! - `prune` - Remove old versions beyond the retention count
//!
//! ## Information
//! - `status` - Current version, health counters and the last install attempt
//! - `versions` - Installed versions
//! - `releases` - Upstream releases
//! - `logs` - Tail the core's log
//! - `config` - Show, create or locate the settings file
//!
//! # Global Options
//!
//! - `--verbose` - Enable debug logging
//! - `--quiet` - Only log errors
//! - `--config <PATH>` - Use a specific settings file
//! - `--no-progress` - Disable progress bars and spinners
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Overrides the log filter selected by `--verbose` / `--quiet`
//! - `COREKEEP_CONFIG_PATH` - Settings file used when `--config` is absent
//! - `COREKEEP_ROOT` - Root directory, overriding `root_dir` from the settings
//! - `COREKEEP_NO_PROGRESS` - Disable progress output

mod common;
mod config;
mod install;
mod releases;
mod run;
mod status;
mod versions;

pub use common::CommandContext;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Runtime options derived from the global flags.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// Disable progress bars and spinners
    pub no_progress: bool,

    /// Explicit settings file
    pub config_path: Option<PathBuf>,
}

impl CliConfig {
    /// Install the global `tracing` subscriber.
    ///
    /// `RUST_LOG` takes precedence over the level chosen by the flags. Log output
    /// goes to stderr so command output on stdout stays scriptable.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("corekeep={}", self.log_level)));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

/// corekeep - local self-updating supervisor for a versioned core service.
#[derive(Parser)]
#[command(
    name = "corekeep",
    about = "Install, run and keep a versioned core service healthy",
    version,
    long_about = "corekeep installs releases of the core service, dry-runs them before promotion, \
                  supervises the current version and rolls back to the last known good version \
                  when health checks keep failing."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the settings file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Disable progress bars and spinners
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the current version and supervise it until interrupted
    Run(run::RunCommand),

    /// Install a release and make it current
    Install(install::InstallCommand),

    /// Install a local binary or .tar.gz archive
    InstallFile(install::InstallFileCommand),

    /// Switch back to the last-known-good version
    Rollback(versions::RollbackCommand),

    /// Switch to an installed version
    Use(versions::UseCommand),

    /// Show the current version and supervisor state
    Status(status::StatusCommand),

    /// List installed versions
    Versions(versions::VersionsCommand),

    /// List upstream releases
    Releases(releases::ReleasesCommand),

    /// Remove old versions beyond the retention count
    Prune(versions::PruneCommand),

    /// Show the last lines of the core's log
    Logs(status::LogsCommand),

    /// Manage the settings file
    Config(config::ConfigCommand),
}

impl Cli {
    /// Build the runtime options, initialize logging and run the command.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        config.init_logging();
        self.execute_with_config(config).await
    }

    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        };

        CliConfig {
            log_level: log_level.to_string(),
            no_progress: self.no_progress,
            config_path: self.config.clone(),
        }
    }

    /// Run the command with explicit options; logging is left to the caller.
    ///
    /// `config` commands run without loading the settings so a broken file can
    /// still be located and replaced.
    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        match self.command {
            Commands::Config(cmd) => cmd.execute(config.config_path.as_deref()).await,
            command => {
                let ctx = CommandContext::load(&config).await?;
                command.execute(&ctx).await
            }
        }
    }
}

impl Commands {
    async fn execute(self, ctx: &CommandContext) -> Result<()> {
        match self {
            Self::Run(cmd) => cmd.execute(ctx).await,
            Self::Install(cmd) => cmd.execute(ctx).await,
            Self::InstallFile(cmd) => cmd.execute(ctx).await,
            Self::Rollback(cmd) => cmd.execute(ctx).await,
            Self::Use(cmd) => cmd.execute(ctx).await,
            Self::Status(cmd) => cmd.execute(ctx).await,
            Self::Versions(cmd) => cmd.execute(ctx),
            Self::Releases(cmd) => cmd.execute(ctx).await,
            Self::Prune(cmd) => cmd.execute(ctx).await,
            Self::Logs(cmd) => cmd.execute(ctx),
            Self::Config(cmd) => cmd.execute(Some(ctx.settings_path())).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_levels() {
        let cli = Cli::parse_from(["corekeep", "--verbose", "status"]);
        assert_eq!(cli.build_config().log_level, "debug");

        let cli = Cli::parse_from(["corekeep", "--quiet", "versions"]);
        assert_eq!(cli.build_config().log_level, "error");

        let cli = Cli::parse_from(["corekeep", "--no-progress", "install", "v1.2.3"]);
        let config = cli.build_config();
        assert_eq!(config.log_level, "info");
        assert!(config.no_progress);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["corekeep", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn test_install_file_requires_version() {
        assert!(Cli::try_parse_from(["corekeep", "install-file", "/tmp/core"]).is_err());
        let cli =
            Cli::try_parse_from(["corekeep", "install-file", "/tmp/core", "--version", "v1.0.0"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["corekeep", "versions", "--config", "/tmp/corekeep.toml"]);
        assert_eq!(
            cli.build_config().config_path.as_deref(),
            Some(std::path::Path::new("/tmp/corekeep.toml"))
        );
    }
}
