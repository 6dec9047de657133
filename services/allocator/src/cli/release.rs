//! Release command.

use anyhow::Result;
use clap::Args;

use super::output::print_success;
use super::CommandContext;

/// Release command - end a session by id.
#[derive(Debug, Args)]
pub struct ReleaseCommand {
    /// Session ID printed by `devlease allocate`.
    session_id: i64,
}

impl ReleaseCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let orchestrator = ctx.orchestrator().await?;
        orchestrator
            .sessions()
            .release_with_refresh(self.session_id)
            .await?;

        print_success(&format!("Released session {}", self.session_id));
        Ok(())
    }
}
