//! `status` and `logs` commands.

use super::common::CommandContext;
use crate::health::{HealthChecker, HealthProbe};
use crate::process::port::{find_owner, is_port_free};
use crate::store::{AttemptResult, StateStore, VersionStore};
use crate::utils::fs::tail_lines;
use crate::utils::platform::HostPlatform;
use anyhow::Result;
use clap::Args;
use colored::Colorize;

#[derive(Args)]
pub struct StatusCommand {
    /// Skip probing the health endpoint
    #[arg(long)]
    no_probe: bool,
}

impl StatusCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let config = &ctx.config;
        let layout = config.layout();
        let host = HostPlatform::detect()?;
        let store =
            VersionStore::new(layout.clone(), host.executable_name(&config.release.binary_name));
        let state = StateStore::load(layout.state_file())?.snapshot();

        println!("{}", "corekeep status".bold());
        println!("Root: {}", layout.root().display());
        println!("Platform: {}_{}", host.os, host.arch);
        if let Some(layer) = &host.emulation {
            println!("Emulation: {} ({} binaries)", layer.name, layer.origin);
        }

        match store.current()? {
            Some(version) => println!("Current: {}", version.green().bold()),
            None => println!("Current: {}", "none".yellow()),
        }
        println!(
            "Last known good: {}",
            state.last_known_good.as_deref().unwrap_or("none")
        );
        println!(
            "Health failures: {}/{}",
            state.consecutive_failures, config.health.failure_threshold
        );

        if let Some(attempt) = &state.last_attempt {
            let result = match attempt.result {
                AttemptResult::Succeeded => "succeeded".green(),
                AttemptResult::Failed => "failed".red(),
                AttemptResult::InProgress => "in progress".yellow(),
            };
            let code = attempt.error_code.map(|c| format!(" [{c}]")).unwrap_or_default();
            println!(
                "Last install: {} {}{} at {}",
                attempt.version,
                result,
                code,
                attempt.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        if is_port_free(&config.host, config.port) {
            println!("Port {}: {}", config.port, "free (core not running)".yellow());
            return Ok(());
        }

        let owner = find_owner(config.port).await;
        let who = match &owner {
            Some(owner) if owner.is_ours(&layout.versions_dir()) => {
                format!("core (pid {})", owner.pid).green().to_string()
            }
            Some(owner) => format!("{} (not managed by corekeep)", owner.describe()).red().to_string(),
            None => "in use".to_string(),
        };
        println!("Port {}: {}", config.port, who);

        if !self.no_probe {
            let checker = HealthChecker::new(&config.health)?;
            let healthy = checker.is_healthy(&config.host, config.port, 1).await;
            let verdict = if healthy { "healthy".green() } else { "not responding".red() };
            println!("Health ({}): {}", checker.url(&config.host, config.port), verdict);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct LogsCommand {
    /// Number of lines to show
    #[arg(short = 'n', long, default_value_t = 50)]
    lines: usize,

    /// Show the dry-run log instead
    #[arg(long)]
    dry_run: bool,
}

impl LogsCommand {
    pub fn execute(self, ctx: &CommandContext) -> Result<()> {
        let layout = ctx.config.layout();
        let path = if self.dry_run { layout.dry_run_log() } else { layout.core_log() };
        if !path.exists() {
            println!("No log at {} yet.", path.display());
            return Ok(());
        }
        for line in tail_lines(&path, self.lines)? {
            println!("{line}");
        }
        Ok(())
    }
}
