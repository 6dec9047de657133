//! Run command (lease, run a build step, release).

use anyhow::{Context, Result};
use clap::Args;
use devlease_allocator::{cancellation, Lease};
use tokio::process::Command;
use tracing::info;

use super::{spawn_interrupt_watcher, CommandContext, RequestArgs};

/// Run command - lease a device for the duration of one command.
#[derive(Debug, Args)]
pub struct RunCommand {
    #[command(flatten)]
    request: RequestArgs,

    /// Command to run with the session environment.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<i32> {
        let request = self.request.to_request()?;
        let orchestrator = ctx.orchestrator().await?;

        let (handle, cancel) = cancellation();
        spawn_interrupt_watcher(handle);

        let mut lease = orchestrator.allocate(&request, &cancel).await?;
        let result = run_child(&self.command, &lease, &ctx).await;

        lease.teardown.release().await;

        let code = result?;
        info!(code, "Command finished");
        Ok(code)
    }
}

async fn run_child(command: &[String], lease: &Lease, ctx: &CommandContext) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .context("no command given")?;

    info!(
        program = %program,
        session_id = lease.descriptor.session_id,
        "Running command"
    );
    let status = Command::new(program)
        .args(args)
        .envs(lease.descriptor.env_vars())
        .current_dir(ctx.workspace.root())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("failed to run `{}`", program))?;

    // No code when the child was killed by a signal.
    Ok(status.code().unwrap_or(128))
}
