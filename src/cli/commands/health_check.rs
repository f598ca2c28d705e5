//! `health-check` — hit a running gateway's `/health` and map its `status`
//! field to a process exit code, for use in container healthchecks.

use clap::Args;
use colored::Colorize;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Args)]
pub struct HealthCheckArgs {
    /// Base URL of a running gateway (scheme + host + port, no path).
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// Bearer token, if the gateway has an API-key gate configured.
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Emit a structured JSON report instead of a human-readable line.
    #[arg(long)]
    pub json: bool,
}

impl HealthCheckArgs {
    #[cfg(feature = "runtime")]
    pub async fn execute(self) -> GatewayResult<()> {
        let endpoint = format!("{}/health", self.url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;

        let mut request = client.get(&endpoint);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::unavailable(format!("{endpoint}: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("malformed /health response: {e}")))?;

        let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");

        if self.json {
            println!("{}", json!({ "endpoint": endpoint, "health": body }));
        } else {
            let rendered = match status {
                "healthy" => status.green().to_string(),
                "degraded" => status.yellow().to_string(),
                _ => status.red().to_string(),
            };
            println!("{rendered}");
        }

        match status {
            "healthy" => Ok(()),
            "degraded" => Err(GatewayError::unavailable("gateway reports degraded health")),
            _ => Err(GatewayError::unavailable(format!("gateway reports status '{status}'"))),
        }
    }

    #[cfg(not(feature = "runtime"))]
    pub async fn execute(self) -> GatewayResult<()> {
        Err(GatewayError::internal(
            "health-check requires the 'runtime' feature (HTTP client)",
        ))
    }
}
