//! `serve` — load config, connect upstreams, and run until shutdown.

#[cfg(feature = "runtime")]
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;

/// Tracing output format, mirrors [`crate::config::LogFormat`] so a CLI flag
/// and a config-file value mean the same thing.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Start the gateway: connect to every enabled upstream, bind the wire
/// surface, and serve until a shutdown signal arrives.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the config file. Defaults to the OS-standard per-user config
    /// location, falling back to built-in defaults if that's also absent.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override `gateway.host`/`gateway.port` from the config file.
    #[arg(long, value_name = "HOST:PORT")]
    pub bind: Option<String>,

    /// Tracing output format.
    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Run the newline-delimited JSON-RPC STDIO frontend instead of binding
    /// an HTTP listener. Mutually exclusive with `--bind`; intended for use
    /// as a locally-spawned subprocess rather than a network service.
    #[arg(long, conflicts_with = "bind")]
    pub stdio: bool,
}

impl ServeArgs {
    pub async fn execute(self) -> GatewayResult<()> {
        self.init_tracing();

        let gateway = Gateway::bootstrap(self.config.clone()).await?;

        if self.stdio || cfg!(not(feature = "runtime")) {
            info!("serving STDIO frontend");
            return gateway.run_stdio().await;
        }

        #[cfg(feature = "runtime")]
        {
            let addr = self.resolve_bind_addr(&gateway)?;
            gateway.run_http(addr).await
        }
        #[cfg(not(feature = "runtime"))]
        {
            unreachable!("handled above: runtime feature disabled forces stdio")
        }
    }

    #[cfg(feature = "runtime")]
    fn resolve_bind_addr(&self, gateway: &Gateway) -> GatewayResult<SocketAddr> {
        if let Some(bind) = &self.bind {
            return bind
                .parse()
                .map_err(|e| GatewayError::invalid_params(format!("invalid --bind address '{bind}': {e}")));
        }
        let settings = &gateway.config.load().gateway;
        format!("{}:{}", settings.host, settings.port)
            .parse()
            .map_err(|e| {
                GatewayError::config(format!(
                    "invalid gateway.host/gateway.port ('{}:{}'): {e}",
                    settings.host, settings.port
                ))
            })
    }

    fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
        match self.log_format {
            LogFormatArg::Pretty => {
                let _ = builder.try_init();
            }
            LogFormatArg::Json => {
                let _ = builder.json().try_init();
            }
        }
    }
}
