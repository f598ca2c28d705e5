//! Declarative configuration model for the gateway.
//!
//! Mirrors the shape of the upstream SDK's own proxy config (transport-tagged
//! backend enum, SSRF-aware validation) but generalized to a *list* of
//! upstreams plus the aggregation-specific policy and virtual-tool sections.

use std::collections::HashMap;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// The reserved server id for the Registry's own built-in meta tools.
pub const RESERVED_SERVER_ID: &str = "gateway";

/// The reserved server id under which virtual tools are registered. Virtual
/// tool ids are already globally unique (config validation rejects
/// duplicates), so they are not re-namespaced the way upstream entries are.
pub const VIRTUAL_SERVER_ID: &str = "virtual";

/// Top-level configuration snapshot. Immutable once loaded — a reload
/// produces a brand new value, never a mutation of this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub virtual_tools: Vec<VirtualToolConfig>,

    #[serde(default)]
    pub policies: PoliciesConfig,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            servers: Vec::new(),
            virtual_tools: Vec::new(),
            policies: PoliciesConfig::default(),
            auth: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Bind address and process-wide behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,

    /// How long graceful shutdown waits for in-flight requests to drain.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

const fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

/// One configured upstream MCP server.
///
/// Does not derive `deny_unknown_fields`: serde's flatten doesn't compose
/// with it reliably, and `transport` below is both tagged and flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name; becomes the `${name}_` namespace prefix for its entries.
    pub name: String,

    #[serde(flatten)]
    pub transport: BackendTransportConfig,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub request_timeout_ms: Option<u64>,

    pub max_retries: Option<u32>,

    #[serde(default)]
    pub mode: SessionMode,
}

/// Whether a backend's connection is held open across calls or reopened
/// per-request. Stateless backends are simpler to reconnect after a crash.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Stateful,
    Stateless,
}

const fn default_true() -> bool {
    true
}

/// Upstream transport configuration, tagged the way the SDK tags its own
/// backend config (`#[serde(tag = "transport")]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum BackendTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        working_dir: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "streamable-http")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl BackendTransportConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// Gateway-wide policy defaults applied to every call unless a server
/// overrides the timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_output_size_limit")]
    pub output_size_limit: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backend_validation: BackendValidationConfig,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            output_size_limit: default_output_size_limit(),
            max_retries: default_max_retries(),
            backend_validation: BackendValidationConfig::default(),
        }
    }
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_output_size_limit() -> usize {
    65_536
}

const fn default_max_retries() -> u32 {
    2
}

impl PoliciesConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// SSRF protection level for HTTP/SSE/StreamableHTTP backend URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SsrfProtection {
    #[default]
    Strict,
    Balanced {
        allowed_private_networks: Vec<IpNetwork>,
    },
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendValidationConfig {
    #[serde(default)]
    pub ssrf_protection: SsrfProtection,

    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,

    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

impl Default for BackendValidationConfig {
    fn default() -> Self {
        Self {
            ssrf_protection: SsrfProtection::Strict,
            allowed_schemes: default_allowed_schemes(),
            blocked_hosts: Vec::new(),
        }
    }
}

fn default_allowed_schemes() -> Vec<String> {
    vec!["http".into(), "https".into(), "ws".into(), "wss".into()]
}

/// A composite tool assembled from an ordered recipe of upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualToolConfig {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    pub ops: Vec<VirtualToolOp>,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualToolOp {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Backend JWT signing configuration (see `auth.rs`); never includes the
/// signing key itself in a serialized/logged config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub signing_key_path: String,
    #[serde(default = "default_jwt_ttl_secs")]
    pub token_ttl_secs: u64,
}

const fn default_jwt_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
