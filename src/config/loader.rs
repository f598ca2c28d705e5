//! Loading and validating [`GatewayConfig`] from disk.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::model::{BackendTransportConfig, GatewayConfig, RESERVED_SERVER_ID};
use crate::error::{GatewayError, GatewayResult};

/// `^[A-Za-z][A-Za-z0-9_-]{2,63}$` without pulling in the `regex` crate for
/// a single pattern.
fn is_valid_server_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    let len = name.chars().count();
    if !(3..=64).contains(&len) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Resolve the default per-user config file path (`directories`-backed,
/// matching the pack's convention for locating a user config home).
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "mcp-gateway")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// Load and validate a config file at an explicit path. Any failure here —
/// missing file, parse error, validation error — is fatal to the caller.
pub fn load_from_path(path: impl AsRef<Path>) -> GatewayResult<GatewayConfig> {
    let path = path.as_ref();
    let source = config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .add_source(config::Environment::with_prefix("MCP_GATEWAY").separator("__"))
        .build()
        .map_err(|e| GatewayError::config_with_key(e.to_string(), path.display().to_string()))?;

    let parsed: GatewayConfig = source
        .try_deserialize()
        .map_err(|e| GatewayError::config_with_key(e.to_string(), path.display().to_string()))?;

    validate(&parsed)?;
    Ok(parsed)
}

/// Load from the default OS-specific path. Missing file at the default
/// location is not fatal — falls back to built-in defaults with a warning.
pub fn load_default_or_builtin() -> GatewayResult<GatewayConfig> {
    match default_config_path() {
        Some(path) if path.exists() => load_from_path(path),
        _ => {
            warn!("no config file found at the default location, using built-in defaults");
            Ok(GatewayConfig::default())
        }
    }
}

/// Validate a parsed config against the rules in the configuration section
/// of the design document. Called both on initial load and on every reload
/// candidate before it is allowed to replace the current snapshot.
pub fn validate(config: &GatewayConfig) -> GatewayResult<()> {
    if config.gateway.port == 0 {
        return Err(GatewayError::config_with_key(
            "gateway.port must be in [1, 65535]",
            "gateway.port",
        ));
    }

    if config.gateway.host.trim().is_empty() {
        return Err(GatewayError::config_with_key(
            "gateway.host must not be empty",
            "gateway.host",
        ));
    }

    if config.policies.default_timeout_ms == 0 {
        return Err(GatewayError::config_with_key(
            "policies.default_timeout_ms must be positive",
            "policies.default_timeout_ms",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for (i, server) in config.servers.iter().enumerate() {
        if server.name == RESERVED_SERVER_ID {
            return Err(GatewayError::config_with_key(
                format!("server name '{RESERVED_SERVER_ID}' is reserved for built-in meta tools"),
                format!("servers[{i}].name"),
            ));
        }

        if !is_valid_server_name(&server.name) {
            return Err(GatewayError::config_with_key(
                format!(
                    "server name '{}' must match ^[A-Za-z][A-Za-z0-9_-]{{2,63}}$",
                    server.name
                ),
                format!("servers[{i}].name"),
            ));
        }

        if !seen.insert(server.name.clone()) {
            return Err(GatewayError::config_with_key(
                format!("duplicate server name '{}'", server.name),
                format!("servers[{i}].name"),
            ));
        }

        match &server.transport {
            BackendTransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::config_with_key(
                        "stdio backend requires a non-empty command",
                        format!("servers[{i}].command"),
                    ));
                }
            }
            BackendTransportConfig::Http { url, .. }
            | BackendTransportConfig::Sse { url, .. }
            | BackendTransportConfig::StreamableHttp { url, .. } => {
                url::Url::parse(url).map_err(|e| {
                    GatewayError::config_with_key(
                        format!("invalid backend URL '{url}': {e}"),
                        format!("servers[{i}].url"),
                    )
                })?;
            }
        }
    }

    let mut vt_seen = std::collections::HashSet::new();
    for (i, vt) in config.virtual_tools.iter().enumerate() {
        if vt.ops.is_empty() {
            return Err(GatewayError::config_with_key(
                format!("virtual tool '{}' must define at least one op", vt.id),
                format!("virtual_tools[{i}].ops"),
            ));
        }
        if !vt_seen.insert(vt.id.clone()) {
            return Err(GatewayError::config_with_key(
                format!("duplicate virtual tool id '{}'", vt.id),
                format!("virtual_tools[{i}].id"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{GatewaySettings, ServerConfig, SessionMode};

    fn valid_config() -> GatewayConfig {
        GatewayConfig {
            gateway: GatewaySettings {
                host: "127.0.0.1".into(),
                port: 8080,
                shutdown_timeout_ms: 10_000,
            },
            servers: vec![ServerConfig {
                name: "fs".into(),
                transport: BackendTransportConfig::Stdio {
                    command: "mcp-fs".into(),
                    args: vec![],
                    env: Default::default(),
                    working_dir: None,
                },
                enabled: true,
                request_timeout_ms: None,
                max_retries: None,
                mode: SessionMode::Stateful,
            }],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn rejects_port_zero() {
        let mut cfg = valid_config();
        cfg.gateway.port = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_reserved_server_name() {
        let mut cfg = valid_config();
        cfg.servers[0].name = "gateway".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let mut cfg = valid_config();
        cfg.servers.push(cfg.servers[0].clone());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_malformed_server_name() {
        let mut cfg = valid_config();
        cfg.servers[0].name = "1bad-name".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_blank_stdio_command() {
        let mut cfg = valid_config();
        cfg.servers[0].transport = BackendTransportConfig::Stdio {
            command: "   ".into(),
            args: vec![],
            env: Default::default(),
            working_dir: None,
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_malformed_http_url() {
        let mut cfg = valid_config();
        cfg.servers[0].transport = BackendTransportConfig::Http {
            url: "not a url".into(),
            headers: Default::default(),
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_virtual_tool_ids() {
        use crate::config::model::VirtualToolOp;
        let mut cfg = valid_config();
        let vt = crate::config::model::VirtualToolConfig {
            id: "pipeline".into(),
            description: None,
            input_schema: serde_json::json!({}),
            ops: vec![VirtualToolOp {
                tool: "fs_read_file".into(),
                args: serde_json::json!({}),
            }],
            stop_on_error: true,
        };
        cfg.virtual_tools.push(vt.clone());
        cfg.virtual_tools.push(vt);
        assert!(validate(&cfg).is_err());
    }
}
