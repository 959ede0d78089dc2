//! `install` and `install-file` commands.
//!
//! Both run the full install pipeline. Unless `--no-activate` is given the new
//! version is dry-run on a scratch port and only becomes current once it answers
//! its health check; a failure at any step leaves the current version untouched.
//!
//! ```bash
//! corekeep install              # latest release
//! corekeep install v6.1.0       # a specific tag
//! corekeep install v6.2.0 --no-activate
//! corekeep install-file ./cli-proxy-api --version v6.2.0-dev
//! ```

use super::common::{CommandContext, print_outcome};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct InstallCommand {
    /// Release tag to install, or `latest`
    #[arg(default_value = "latest")]
    version: String,

    /// Install without dry-running or switching to it
    #[arg(long)]
    no_activate: bool,
}

impl InstallCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator()?;
        let progress = ctx.install_progress();
        let result =
            orchestrator.install(&self.version, !self.no_activate, progress.reporter.clone()).await;
        progress.finish();

        print_outcome(&result?);
        Ok(())
    }
}

#[derive(Args)]
pub struct InstallFileCommand {
    /// Executable or .tar.gz archive containing it
    path: PathBuf,

    /// Version identifier to install it as
    #[arg(long, value_name = "VERSION")]
    version: String,

    /// Install without dry-running or switching to it
    #[arg(long)]
    no_activate: bool,
}

impl InstallFileCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let path = crate::utils::platform::resolve_path(&self.path.to_string_lossy())?;
        let orchestrator = ctx.orchestrator()?;
        let progress = ctx.install_progress();
        let result = orchestrator
            .install_from_file(&path, &self.version, !self.no_activate, progress.reporter.clone())
            .await;
        progress.finish();

        print_outcome(&result?);
        Ok(())
    }
}
