//! Error types for the gateway
//!
//! Follows the upstream SDK's layered error pattern: protocol and transport
//! errors are wrapped (not re-derived), while everything specific to
//! aggregation, routing, and config lives in its own variant with a stable
//! MCP error code.

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway.
///
/// Error codes are part of the wire contract: they must stay stable across
/// releases even if the message text changes (see `code()`).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// Protocol-level error from the MCP protocol layer.
    ///
    /// Preserves the original error so its code survives translation back
    /// into a JSON-RPC error object.
    #[error("protocol error: {0}")]
    Protocol(#[from] Box<turbomcp_protocol::Error>),

    /// Transport layer error, converted automatically from the SDK.
    #[error("transport error: {0}")]
    Transport(#[from] turbomcp_transport::TransportError),

    /// Config failed to parse or validate.
    #[error("config error: {message}")]
    Config {
        message: String,
        key: Option<String>,
    },

    /// A namespaced id did not resolve to any known upstream/entry.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// An unqualified name matched more than one upstream and the Router
    /// refused to guess.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        alternatives: Vec<String>,
    },

    /// Arguments failed MCP-level validation before being forwarded.
    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    /// A policy (size limit, allowlist, timeout ceiling) rejected the call.
    #[error("policy violation: {message}")]
    PolicyViolation { message: String },

    /// Serialized payload exceeded the configured output size limit.
    #[error("size limit exceeded: {message}")]
    SizeLimitExceeded { message: String },

    /// The owning upstream is unavailable (circuit open, no connection).
    #[error("upstream unavailable: {server_id}")]
    Unavailable { server_id: String },

    /// Upstream returned its own MCP error; wrapped rather than rethrown so
    /// the gateway can annotate which server it came from.
    #[error("upstream error ({server_id}): {message}")]
    UpstreamError { server_id: String, message: String },

    /// Operation exceeded its configured timeout.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The originating request was cancelled (client disconnect, shutdown).
    #[error("cancelled: {operation}")]
    Cancelled { operation: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error (runtime feature only).
    #[cfg(feature = "runtime")]
    #[error("http error: {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Anything else; never exposed verbatim to clients.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: None,
        }
    }

    pub fn config_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>, alternatives: Vec<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            alternatives,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        Self::PolicyViolation {
            message: message.into(),
        }
    }

    pub fn size_limit_exceeded(message: impl Into<String>) -> Self {
        Self::SizeLimitExceeded {
            message: message.into(),
        }
    }

    pub fn unavailable(server_id: impl Into<String>) -> Self {
        Self::Unavailable {
            server_id: server_id.into(),
        }
    }

    pub fn upstream(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamError {
            server_id: server_id.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[cfg(feature = "runtime")]
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
            status_code: None,
        }
    }

    #[cfg(feature = "runtime")]
    pub fn http_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Http {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Stable numeric code for the MCP error object. These values are part
    /// of the wire contract — never renumber an existing variant.
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol(e) => e.jsonrpc_error_code(),
            Self::Transport(_) | Self::Unavailable { .. } => -32001,
            Self::Config { .. } => -32002,
            Self::NotFound { .. } => -32601,
            Self::Conflict { .. } => -32003,
            Self::InvalidParams { .. } => -32602,
            Self::PolicyViolation { .. } => -32004,
            Self::SizeLimitExceeded { .. } => -32005,
            Self::UpstreamError { .. } => -32006,
            Self::Timeout { .. } => -32007,
            Self::Cancelled { .. } => -32008,
            Self::Serialization(_) => -32700,
            Self::Io(_) => -32009,
            #[cfg(feature = "runtime")]
            Self::Http { .. } => -32010,
            Self::Internal { .. } => -32603,
        }
    }

    /// Sanitize the error message for client responses. Never leak internal
    /// detail through `Internal`; everything else is already safe to show.
    pub fn sanitize(&self) -> String {
        match self {
            Self::Internal { .. } => "internal server error".to_string(),
            Self::Transport(_) => "transport error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the Transport pool should attempt a retry/reconnect for this
    /// error rather than surface it immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Unavailable { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Render as a JSON-RPC error object (`{code, message, data?}`) for the
    /// wire adapter — `data` carries `Conflict`'s alternatives, nothing else.
    pub fn to_jsonrpc_error(&self) -> serde_json::Value {
        let data = match self {
            Self::Conflict { alternatives, .. } => Some(serde_json::json!({ "alternatives": alternatives })),
            _ => None,
        };
        serde_json::json!({
            "code": self.code(),
            "message": self.sanitize(),
            "data": data,
        })
    }
}

/// Extension trait for attaching gateway context to foreign errors.
pub trait GatewayErrorExt<T> {
    fn config_context(self, key: impl Into<String>) -> GatewayResult<T>;
    fn upstream_context(self, server_id: impl Into<String>) -> GatewayResult<T>;
}

impl<T, E> GatewayErrorExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn config_context(self, key: impl Into<String>) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::config_with_key(e.to_string(), key.into()))
    }

    fn upstream_context(self, server_id: impl Into<String>) -> GatewayResult<T> {
        self.map_err(|e| GatewayError::upstream(server_id.into(), e.to_string()))
    }
}

impl From<turbomcp_protocol::Error> for GatewayError {
    fn from(err: turbomcp_protocol::Error) -> Self {
        Self::Protocol(Box::new(err))
    }
}

/// Convert gateway errors back to protocol errors for JSON-RPC responses,
/// preserving protocol error codes across the boundary.
impl From<GatewayError> for Box<turbomcp_protocol::Error> {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Protocol(protocol_err) => protocol_err,
            GatewayError::Transport(e) => turbomcp_protocol::Error::transport(e.to_string()),
            GatewayError::Config { message, key } => {
                let msg = key.map_or_else(|| message.clone(), |k| format!("{message} (key: {k})"));
                turbomcp_protocol::Error::invalid_params(msg)
            }
            GatewayError::NotFound { message } => turbomcp_protocol::Error::not_found(message),
            GatewayError::Conflict {
                message,
                alternatives,
            } => turbomcp_protocol::Error::invalid_params(format!(
                "{message} (alternatives: {})",
                alternatives.join(", ")
            )),
            GatewayError::InvalidParams { message } => turbomcp_protocol::Error::invalid_params(message),
            GatewayError::PolicyViolation { message } | GatewayError::SizeLimitExceeded { message } => {
                turbomcp_protocol::Error::invalid_params(message)
            }
            GatewayError::Unavailable { server_id } => {
                turbomcp_protocol::Error::unavailable(format!("server '{server_id}' unavailable"))
            }
            GatewayError::UpstreamError { server_id, message } => {
                turbomcp_protocol::Error::external_service(format!("{server_id}: {message}"))
            }
            GatewayError::Timeout {
                operation,
                timeout_ms,
            } => turbomcp_protocol::Error::timeout(format!("{operation} exceeded {timeout_ms}ms")),
            GatewayError::Cancelled { operation } => turbomcp_protocol::Error::cancelled(operation),
            GatewayError::Serialization(e) => turbomcp_protocol::Error::serialization(e.to_string()),
            GatewayError::Io(e) => turbomcp_protocol::Error::transport(e.to_string()),
            #[cfg(feature = "runtime")]
            GatewayError::Http {
                message,
                status_code,
            } => {
                let msg = status_code.map_or_else(|| message.clone(), |c| format!("{message} (HTTP {c})"));
                turbomcp_protocol::Error::transport(msg)
            }
            GatewayError::Internal { message } => turbomcp_protocol::Error::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_constructors_set_expected_variants() {
        assert!(matches!(GatewayError::not_found("x"), GatewayError::NotFound { .. }));
        assert!(matches!(GatewayError::config("x"), GatewayError::Config { .. }));
    }

    #[test]
    fn conflict_carries_alternatives() {
        let err = GatewayError::conflict("ambiguous", vec!["fs_init".into(), "gh_init".into()]);
        match err {
            GatewayError::Conflict { alternatives, .. } => {
                assert_eq!(alternatives, vec!["fs_init", "gh_init"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let err = GatewayError::internal("leaked stack trace: /home/user/secret");
        assert_eq!(err.sanitize(), "internal server error");
    }

    #[test]
    fn other_errors_are_not_scrubbed() {
        let err = GatewayError::not_found("tool 'fs_read_file' not found");
        assert!(err.sanitize().contains("fs_read_file"));
    }

    #[test]
    fn retryable_errors() {
        assert!(GatewayError::timeout("tool_call", 30_000).is_retryable());
        assert!(GatewayError::unavailable("fs").is_retryable());
        assert!(!GatewayError::config("bad").is_retryable());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(GatewayError::not_found("x").code(), -32601);
        assert_eq!(GatewayError::invalid_params("x").code(), -32602);
        assert_eq!(GatewayError::internal("x").code(), -32603);
    }

    #[test]
    fn protocol_error_code_round_trips() {
        let protocol_err = *turbomcp_protocol::Error::tool_not_found("missing_tool");
        let gateway_err = GatewayError::from(protocol_err);
        let back: Box<turbomcp_protocol::Error> = gateway_err.into();
        assert_eq!(back.kind, turbomcp_protocol::ErrorKind::ToolNotFound);
    }

    #[test]
    fn config_context_extension_trait() {
        let result: Result<String, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"));
        let gateway_result = result.config_context("gateway.servers[0].command");
        match gateway_result.unwrap_err() {
            GatewayError::Config { message, key } => {
                assert!(message.contains("no such file"));
                assert_eq!(key, Some("gateway.servers[0].command".to_string()));
            }
            _ => panic!("wrong variant"),
        }
    }
}
