//! Commands working on installed versions: `versions`, `use`, `rollback`, `prune`.

use super::common::CommandContext;
use crate::orchestrator::LifecycleState;
use crate::store::{StateStore, VersionStore};
use crate::utils::platform::HostPlatform;
use anyhow::Result;
use clap::Args;
use colored::Colorize;

fn open_store(ctx: &CommandContext) -> Result<VersionStore> {
    let host = HostPlatform::detect()?;
    Ok(VersionStore::new(
        ctx.config.layout(),
        host.executable_name(&ctx.config.release.binary_name),
    ))
}

#[derive(Args)]
pub struct VersionsCommand {
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

impl VersionsCommand {
    pub fn execute(self, ctx: &CommandContext) -> Result<()> {
        let store = open_store(ctx)?;
        let versions = store.list()?;
        let last_known_good =
            StateStore::load(ctx.config.layout().state_file())?.snapshot().last_known_good;

        if self.json {
            let entries: Vec<_> = versions
                .iter()
                .map(|v| {
                    serde_json::json!({
                        "version": v.version,
                        "installed_at": v.installed_at,
                        "architecture": v.architecture,
                        "sha256": v.sha256,
                        "current": v.is_current,
                        "last_known_good": last_known_good.as_deref() == Some(v.version.as_str()),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }

        if versions.is_empty() {
            println!("No versions installed.");
            println!("\n{}", "Tip:".yellow());
            println!("  Run 'corekeep install' to install the latest release");
            return Ok(());
        }

        println!("{}", "Installed versions".bold());
        for v in &versions {
            let mut markers = Vec::new();
            if v.is_current {
                markers.push("current".green().to_string());
            }
            if last_known_good.as_deref() == Some(v.version.as_str()) {
                markers.push("last known good".cyan().to_string());
            }
            let marker = if markers.is_empty() {
                String::new()
            } else {
                format!(" ({})", markers.join(", "))
            };
            let bullet = if v.is_current { "*" } else { " " };
            println!(
                "{} {}{}  {}  {}",
                bullet,
                v.version.bold(),
                marker,
                v.architecture,
                v.installed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
            );
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct UseCommand {
    /// Installed version to make current
    version: String,
}

impl UseCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator()?;
        orchestrator.use_version(&self.version).await?;
        println!("✅ Current version is now {}", self.version.green().bold());
        Ok(())
    }
}

#[derive(Args)]
pub struct RollbackCommand {}

impl RollbackCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator()?;
        if orchestrator.force_rollback().await? {
            let current = orchestrator.store().current()?.unwrap_or_default();
            println!("✅ Rolled back to {}", current.green().bold());
        } else {
            println!("Already on the last-known-good version, nothing to do.");
        }
        if let LifecycleState::Error(e) = orchestrator.lifecycle() {
            println!("{} {}", "Warning:".yellow(), e);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct PruneCommand {}

impl PruneCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator()?;
        let removed = orchestrator.coordinator().prune().await?;
        if removed.is_empty() {
            println!(
                "Nothing to prune (keeping {} versions).",
                ctx.config.upgrade.retention
            );
        } else {
            for version in &removed {
                println!("🗑️  Removed {}", version.red());
            }
        }
        Ok(())
    }
}
