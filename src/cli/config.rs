//! `config` command: show, create or locate the settings file.
//!
//! ```bash
//! corekeep config            # same as `config show`
//! corekeep config init       # write a minimal settings file
//! corekeep config path
//! ```

use crate::config::{ROOT_ENV, SupervisorConfig};
use crate::utils::platform::resolve_path;
use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::Path;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: Option<ConfigSubcommands>,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Print the effective settings
    Show,

    /// Create a settings file with the default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the settings file location
    Path,
}

impl ConfigCommand {
    pub async fn execute(self, config_path: Option<&Path>) -> Result<()> {
        match self.command {
            Some(ConfigSubcommands::Show) | None => Self::show(config_path).await,
            Some(ConfigSubcommands::Init {
                force,
            }) => Self::init(force, config_path).await,
            Some(ConfigSubcommands::Path) => Self::show_path(config_path),
        }
    }

    async fn show(config_path: Option<&Path>) -> Result<()> {
        let path = SupervisorConfig::resolve_path(config_path)?;
        let config = SupervisorConfig::load(config_path).await?;

        println!("{}", "Supervisor settings".bold());
        if path.exists() {
            println!("Location: {}\n", path.display());
        } else {
            println!("Location: {} {}\n", path.display(), "(not created, using defaults)".dimmed());
        }

        let mut shown = config;
        if shown.release.github_token.is_some() {
            shown.release.github_token = Some("***".to_string());
        }
        println!("{}", toml::to_string_pretty(&shown)?);

        if !path.exists() {
            println!("{}", "Tip:".yellow());
            println!("  Run 'corekeep config init' to create the file");
        }
        Ok(())
    }

    async fn init(force: bool, config_path: Option<&Path>) -> Result<()> {
        let path = SupervisorConfig::resolve_path(config_path)?;
        if path.exists() && !force {
            println!("❌ Settings already exist at: {}", path.display());
            println!("   Use --force to overwrite");
            return Ok(());
        }

        let config = match std::env::var(ROOT_ENV) {
            Ok(root) if !root.is_empty() => SupervisorConfig::with_root(resolve_path(&root)?),
            _ => SupervisorConfig::default(),
        };
        config.save_to(&path).await?;

        println!("✅ Created settings at: {}", path.display());
        println!("\n{}", "Next steps:".yellow());
        println!("  1. Set 'release.repo' if you track a fork of the core");
        println!("  2. Run 'corekeep install' to install the latest release");
        Ok(())
    }

    fn show_path(config_path: Option<&Path>) -> Result<()> {
        println!("{}", SupervisorConfig::resolve_path(config_path)?.display());
        Ok(())
    }
}
