//! `run` command: supervise the current version in the foreground.
//!
//! Starts the current version, prints every lifecycle transition and keeps the
//! health monitor running until Ctrl-C, at which point the core is stopped.
//! With `--install` a missing installation is fixed first by installing the
//! latest release.

use super::common::{CommandContext, print_outcome};
use crate::core::SupervisorError;
use crate::orchestrator::LifecycleState;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use tracing::info;

#[derive(Args)]
pub struct RunCommand {
    /// Install the latest release first if nothing is installed
    #[arg(long)]
    install: bool,
}

impl RunCommand {
    pub async fn execute(self, ctx: &CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator()?;

        if self.install && orchestrator.store().current()?.is_none() {
            println!("No version installed, installing the latest release...");
            let progress = ctx.install_progress();
            let result = orchestrator.install("latest", true, progress.reporter.clone()).await;
            progress.finish();
            print_outcome(&result?);
        }

        let mut states = orchestrator.subscribe();
        let printer = tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                print_state(&state);
            }
        });

        if let LifecycleState::Error(e) = orchestrator.start().await {
            printer.abort();
            return Err(e.into());
        }

        println!("{}", "Supervising; press Ctrl-C to stop.".dimmed());
        tokio::signal::ctrl_c().await.map_err(|e| SupervisorError::Io {
            message: format!("failed to listen for Ctrl-C: {e}"),
        })?;

        info!("Interrupted, stopping core");
        let stopped = orchestrator.stop().await;
        printer.abort();
        if let LifecycleState::Error(e) = stopped {
            return Err(e.into());
        }
        Ok(())
    }
}

fn print_state(state: &LifecycleState) {
    let label = match state {
        LifecycleState::Running { .. } => state.to_string().green().to_string(),
        LifecycleState::Error(_) | LifecycleState::RollingBack { .. } => {
            state.to_string().red().to_string()
        }
        LifecycleState::Installing { .. } | LifecycleState::Testing { .. } => {
            state.to_string().cyan().to_string()
        }
        _ => state.to_string().dimmed().to_string(),
    };
    println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), label);
}
