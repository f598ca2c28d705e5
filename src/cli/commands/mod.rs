//! CLI command implementations (§4.I, ambient).

pub mod health_check;
pub mod serve;
pub mod validate_config;

use clap::Subcommand;

use crate::error::GatewayResult;

/// All available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load config, connect upstreams, and run until shutdown.
    #[command(visible_alias = "s")]
    Serve(serve::ServeArgs),

    /// Load and validate a config file without starting the gateway.
    #[command(visible_alias = "vc", name = "validate-config")]
    ValidateConfig(validate_config::ValidateConfigArgs),

    /// Hit a running gateway's `/health` and map its status to an exit code.
    #[command(visible_alias = "hc", name = "health-check")]
    HealthCheck(health_check::HealthCheckArgs),
}

impl Command {
    pub async fn execute(self) -> GatewayResult<()> {
        match self {
            Command::Serve(cmd) => cmd.execute().await,
            Command::ValidateConfig(cmd) => cmd.execute().await,
            Command::HealthCheck(cmd) => cmd.execute().await,
        }
    }
}
