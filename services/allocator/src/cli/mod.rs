//! CLI commands.

mod allocate;
pub mod output;
mod release;
mod run;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use devlease_allocator::logging::LogFormat;
use devlease_allocator::macros::expand_env;
use devlease_allocator::{
    AllocationRequest, AllocatorConfig, CancelHandle, DeviceFilter, Orchestrator, Workspace,
};
use devlease_farm_api::config::DEFAULT_REQUEST_TIMEOUT;
use devlease_farm_api::FarmConfig;
use tracing::warn;

/// devlease - Lease devices from a shared device farm for CI builds.
#[derive(Debug, Parser)]
#[command(name = "devlease")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Device farm endpoint, e.g. https://cloud.example.com.
    #[arg(long, global = true, env = "DEVLEASE_ENDPOINT_URL")]
    endpoint: Option<String>,

    /// Farm account user name.
    #[arg(long, global = true, env = "DEVLEASE_USERNAME")]
    username: Option<String>,

    /// Farm account password.
    #[arg(long, global = true, env = "DEVLEASE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// HTTP proxy for API traffic.
    #[arg(long, global = true, env = "DEVLEASE_HTTP_PROXY")]
    http_proxy: Option<String>,

    /// Build workspace; device data and flash logs are written here.
    #[arg(long, global = true, env = "DEVLEASE_WORKSPACE", default_value = ".")]
    workspace: String,

    /// Log format (text or json).
    #[arg(long, global = true, env = "DEVLEASE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Lease a device, run a command against it, then release it.
    Run(run::RunCommand),

    /// Lease a device and print its session environment without releasing.
    Allocate(allocate::AllocateCommand),

    /// Release a session left running by `allocate`.
    Release(release::ReleaseCommand),
}

impl Cli {
    /// Run the command; returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let ctx = CommandContext {
            farm: FarmConfig {
                endpoint_url: self.endpoint.unwrap_or_default(),
                username: self.username.unwrap_or_default(),
                password: self.password.unwrap_or_default(),
                http_proxy: self.http_proxy.filter(|p| !p.trim().is_empty()),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
            config: AllocatorConfig::from_env(),
            workspace: Workspace::new(self.workspace),
        };

        match self.command {
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Allocate(cmd) => cmd.run(ctx).await.map(|()| 0),
            Commands::Release(cmd) => cmd.run(ctx).await.map(|()| 0),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub farm: FarmConfig,
    pub config: AllocatorConfig,
    pub workspace: Workspace,
}

impl CommandContext {
    /// Authenticate and build an orchestrator writing into the workspace.
    pub async fn orchestrator(&self) -> Result<Orchestrator> {
        let orchestrator = Orchestrator::connect(&self.farm, self.config.clone()).await?;
        Ok(orchestrator.with_workspace(self.workspace.clone()))
    }
}

/// What to lease.
#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Build image URL; devices are flashed with it when none carries it.
    #[arg(long, env = "DEVLEASE_BUILD_URL")]
    build_url: String,

    /// Memory limit in MB the device is flashed with (0 = unlimited).
    #[arg(long, env = "DEVLEASE_MEM_TOTAL", default_value = "0")]
    mem_total: String,

    /// Label filter in GROUP=LABEL form. Can be specified multiple times.
    #[arg(long = "filter", value_name = "GROUP=LABEL")]
    filters: Vec<String>,
}

impl RequestArgs {
    /// Expand `$VAR` references against the environment and parse.
    pub fn to_request(&self) -> Result<AllocationRequest> {
        let mut request =
            AllocationRequest::new(expand_env(&self.build_url), expand_env(&self.mem_total));

        for raw in &self.filters {
            let filter: DeviceFilter = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --filter `{}`: {}", raw, e))?;
            request = request.with_filter(filter.map(expand_env));
        }

        request.validate()?;
        Ok(request)
    }
}

/// Cancel the allocation on Ctrl-C.
fn spawn_interrupt_watcher(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling allocation");
            handle.cancel();
        }
    });
}
