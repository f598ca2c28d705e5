//! Process entry point & CLI (§4.I, ambient).
//!
//! A thin `clap`-derived command surface over the core: `serve`,
//! `validate-config`, `health-check`. The core (registry, router, transport
//! pool, session manager) is fully usable as a library without this module;
//! this is just what `main.rs` drives.

pub mod commands;
pub mod exit;

use std::io::IsTerminal;

use clap::Parser;
use colored::Colorize;

use crate::error::GatewayError;

/// mcp-gateway — an aggregating MCP gateway.
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version, about = "Aggregating MCP gateway", author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: commands::Command,

    /// Disable colored output.
    #[arg(long, global = true)]
    pub no_color: bool,
}

impl Cli {
    /// Run the selected command and return the process exit code. Never
    /// panics: failures are reported on stderr and converted to a stable
    /// exit code rather than propagated.
    pub async fn run(self) -> i32 {
        if self.no_color || !std::io::stderr().is_terminal() {
            colored::control::set_override(false);
        }

        match self.command.execute().await {
            Ok(()) => exit::SUCCESS,
            Err(err) => {
                report_error(&err);
                exit::from_gateway_error(&err)
            }
        }
    }
}

fn report_error(err: &GatewayError) {
    eprintln!("{} {}", "error:".red().bold(), err.sanitize());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::try_parse_from(["mcp-gateway", "serve"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn parses_serve_with_bind_and_log_format() {
        let cli = Cli::try_parse_from([
            "mcp-gateway",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--log-format",
            "json",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn rejects_stdio_and_bind_together() {
        let cli = Cli::try_parse_from(["mcp-gateway", "serve", "--stdio", "--bind", "0.0.0.0:9000"]);
        assert!(cli.is_err());
    }

    #[test]
    fn parses_validate_config_alias() {
        let cli = Cli::try_parse_from(["mcp-gateway", "vc", "--json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn parses_health_check_with_url() {
        let cli = Cli::try_parse_from(["mcp-gateway", "health-check", "--url", "http://localhost:9000"]);
        assert!(cli.is_ok());
    }
}
