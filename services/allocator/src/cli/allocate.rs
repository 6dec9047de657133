//! Allocate command (lease and print the session environment).

use anyhow::Result;
use clap::Args;
use devlease_allocator::cancellation;

use super::output::{print_descriptor, print_success, OutputFormat};
use super::{spawn_interrupt_watcher, CommandContext, RequestArgs};

/// Allocate command - the session keeps running after the process exits.
#[derive(Debug, Args)]
pub struct AllocateCommand {
    #[command(flatten)]
    request: RequestArgs,

    /// Output format (env or json).
    #[arg(long, default_value = "env")]
    format: OutputFormat,
}

impl AllocateCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = self.request.to_request()?;
        let orchestrator = ctx.orchestrator().await?;

        let (handle, cancel) = cancellation();
        spawn_interrupt_watcher(handle);

        let lease = orchestrator.allocate(&request, &cancel).await?;
        print_descriptor(&lease.descriptor, self.format);

        if let Some(session_id) = lease.teardown.detach() {
            print_success(&format!(
                "Session {} is held. Release it with `devlease release {}`.",
                session_id, session_id
            ));
        }
        Ok(())
    }
}
