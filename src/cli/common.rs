//! Shared state and output helpers for CLI commands.

use super::CliConfig;
use crate::config::SupervisorConfig;
use crate::orchestrator::Orchestrator;
use crate::upgrade::{InstallOutcome, InstallPhase, InstallReporter};
use crate::utils::progress::ProgressBar;
use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loaded settings plus the options every command needs.
pub struct CommandContext {
    pub config: SupervisorConfig,
    settings_path: PathBuf,
    no_progress: bool,
}

impl CommandContext {
    /// Load settings the way the global flags and environment ask for.
    pub async fn load(cli: &CliConfig) -> Result<Self> {
        let explicit = cli.config_path.as_deref();
        let settings_path = SupervisorConfig::resolve_path(explicit)?;
        let config = SupervisorConfig::load(explicit).await?;
        Ok(Self {
            config,
            settings_path,
            no_progress: cli.no_progress,
        })
    }

    #[must_use]
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    #[must_use]
    pub const fn no_progress(&self) -> bool {
        self.no_progress
    }

    /// Wire the production orchestrator.
    pub fn orchestrator(&self) -> Result<Arc<Orchestrator>> {
        Ok(Orchestrator::from_config(self.config.clone())?)
    }

    /// A reporter drawing a phase spinner and a download bar.
    ///
    /// Both are hidden with `--no-progress`; call [`InstallProgress::finish`] once
    /// the install returns.
    #[must_use]
    pub fn install_progress(&self) -> InstallProgress {
        let spinner = ProgressBar::new_spinner(self.no_progress);
        let download = ProgressBar::new_download(self.no_progress);

        let phase_spinner = spinner.clone();
        let download_bar = download.clone();
        let reporter = InstallReporter::new()
            .with_phase(Arc::new(move |phase: InstallPhase| {
                phase_spinner.set_message(phase.to_string());
                if !matches!(phase, InstallPhase::Resolving | InstallPhase::Downloading) {
                    download_bar.finish_and_clear();
                }
            }))
            .with_download(Arc::new({
                let download = download.clone();
                move |received, total| download.update(received, total)
            }));

        InstallProgress {
            reporter,
            spinner,
            download,
        }
    }
}

/// Progress display attached to one install.
pub struct InstallProgress {
    pub reporter: InstallReporter,
    spinner: ProgressBar,
    download: ProgressBar,
}

impl InstallProgress {
    pub fn finish(&self) {
        self.download.finish_and_clear();
        self.spinner.finish_and_clear();
    }
}

/// Print the result of a successful install.
pub fn print_outcome(outcome: &InstallOutcome) {
    if outcome.activated {
        println!("✅ Installed and activated {}", outcome.version.green().bold());
    } else {
        println!("✅ Installed {} (not activated)", outcome.version.green().bold());
    }
    println!("   Binary: {}", outcome.executable.display());
    println!("   Architecture: {}", outcome.architecture);
    println!("   SHA-256: {}", outcome.sha256);
    if !outcome.pruned.is_empty() {
        println!("   Pruned: {}", outcome.pruned.join(", "));
    }
    if !outcome.activated {
        println!("\n{}", "Next steps:".yellow());
        println!("  Run 'corekeep use {}' to switch to it", outcome.version);
    }
}
