//! `validate-config` — load and validate a config file without starting
//! the gateway, per §8's "known-good config" round-trip property.

use std::path::PathBuf;

use clap::Args;
use serde_json::json;

use crate::config::{loader, GatewayConfig};
use crate::error::GatewayResult;

#[derive(Debug, Args)]
pub struct ValidateConfigArgs {
    /// Path to the config file. Defaults to the OS-standard per-user config
    /// location.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit a structured JSON report instead of a human-readable line.
    #[arg(long)]
    pub json: bool,
}

impl ValidateConfigArgs {
    pub async fn execute(self) -> GatewayResult<()> {
        let path = self.config.or_else(loader::default_config_path);
        let config: GatewayConfig = match &path {
            Some(p) if p.exists() => loader::load_from_path(p)?,
            Some(p) => return Err(crate::error::GatewayError::config_with_key(
                "config file not found",
                p.display().to_string(),
            )),
            None => {
                // No explicit path and no OS default resolvable: nothing to
                // validate against, built-in defaults are valid by
                // construction.
                GatewayConfig::default()
            }
        };

        let server_count = config.servers.len();
        let virtual_tool_count = config.virtual_tools.len();

        if self.json {
            println!(
                "{}",
                json!({
                    "valid": true,
                    "path": path.as_ref().map(|p| p.display().to_string()),
                    "servers": server_count,
                    "virtualTools": virtual_tool_count,
                })
            );
        } else {
            let where_ = path.as_ref().map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());
            println!("config valid ({where_}): {server_count} server(s), {virtual_tool_count} virtual tool(s)");
        }
        Ok(())
    }
}
