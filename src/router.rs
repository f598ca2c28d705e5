//! Routing & invocation core (§4.D): resolves a namespaced identifier back
//! to its owning upstream, enforces the per-call policy chain, and forwards
//! through the Transport pool. Never holds state of its own beyond borrowed
//! references to the Registry, Transport pool, and current config snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tracing::warn;
use turbomcp_protocol::types::{GetPromptResult, ReadResourceResult};

use crate::config::model::{GatewayConfig, ServerConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{namespace, CatalogEntry, Registry};
use crate::transport::{circuit::CircuitState, TransportPool};

/// Everything the Router needs to resolve and forward one call. Built once
/// at startup and cloned (cheap: all fields are `Arc`s) into every session.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
    pool: Arc<TransportPool>,
    config: Arc<ArcSwap<GatewayConfig>>,
}

/// Outcome of a successful tool call: the raw MCP result, plus whether the
/// payload was truncated against `policies.outputSizeLimit`.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub result: Value,
    pub truncated: bool,
}

impl Router {
    pub fn new(registry: Arc<Registry>, pool: Arc<TransportPool>, config: Arc<ArcSwap<GatewayConfig>>) -> Self {
        Self { registry, pool, config }
    }

    fn server_config(&self, config: &GatewayConfig, server_id: &str) -> GatewayResult<ServerConfig> {
        config
            .servers
            .iter()
            .find(|s| s.name == server_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("no such upstream '{server_id}'")))
    }

    /// Reject the call before it ever reaches the Transport pool if the
    /// owning upstream's breaker is tripped (§4.D step 1).
    async fn check_circuit(&self, server_id: &str) -> GatewayResult<()> {
        if self.pool.circuit_state(server_id).await == CircuitState::Open {
            return Err(GatewayError::unavailable(server_id));
        }
        Ok(())
    }

    /// `callTool(id, args)`. `id` may be namespaced (`fs_read_file`) or bare
    /// (`read_file`, resolved only if exactly one upstream exposes it).
    pub async fn call_tool(&self, id: &str, arguments: Option<HashMap<String, Value>>) -> GatewayResult<ToolCallOutcome> {
        let config = self.config.load_full();

        if Registry::is_builtin(id) {
            let args_value = arguments.map_or(Value::Null, |map| Value::Object(map.into_iter().collect()));
            let result = self.registry.call_builtin(id, &args_value, &config, &self.pool).await?;
            return Ok(ToolCallOutcome { result, truncated: false });
        }

        if let Some(vt) = config.virtual_tools.iter().find(|v| v.id == id).cloned() {
            let args_value = arguments.map_or(Value::Null, |map| Value::Object(map.into_iter().collect()));
            let outcome = crate::virtual_tool::execute(self, &vt, args_value).await?;
            return Ok(ToolCallOutcome { result: outcome.result, truncated: false });
        }

        let (server_id, bare_name) = self.resolve_tool(id)?;
        self.check_circuit(&server_id).await?;
        let server_cfg = self.server_config(&config, &server_id)?;

        let normalized_args = arguments.map(normalize_path_args);

        let raw = self
            .pool
            .call_tool(&server_id, &server_cfg, &config.policies, &bare_name, normalized_args)
            .await?;

        let (result, truncated) = truncate_if_needed(raw, config.policies.output_size_limit);
        Ok(ToolCallOutcome { result, truncated })
    }

    /// `getPrompt(id, args)`.
    pub async fn get_prompt(&self, id: &str, arguments: Option<HashMap<String, Value>>) -> GatewayResult<GetPromptResult> {
        let config = self.config.load_full();
        let (server_id, bare_name) = self.resolve_prompt(id)?;
        self.check_circuit(&server_id).await?;
        let server_cfg = self.server_config(&config, &server_id)?;

        self.pool
            .get_prompt(&server_id, &server_cfg, &config.policies, &bare_name, arguments)
            .await
    }

    /// `readResource(uri)`. The uri is expected already namespaced
    /// (`fs_file:///x`); falls back to template matching against each
    /// upstream's advertised `ResourceTemplateEntry` when there's no exact
    /// literal match.
    pub async fn read_resource(&self, uri: &str) -> GatewayResult<ReadResourceResult> {
        let config = self.config.load_full();
        let (server_id, original_uri) = self.resolve_resource(uri)?;
        self.check_circuit(&server_id).await?;
        let server_cfg = self.server_config(&config, &server_id)?;

        self.pool
            .read_resource(&server_id, &server_cfg, &config.policies, &original_uri)
            .await
    }

    pub async fn subscribe_resource(&self, session_id: &str, uri: &str) -> GatewayResult<()> {
        let config = self.config.load_full();
        let (server_id, original_uri) = self.resolve_resource(uri)?;
        let is_first = self.registry.subscribe(session_id, uri);
        if is_first {
            let server_cfg = self.server_config(&config, &server_id)?;
            self.pool
                .subscribe_resource(&server_id, &server_cfg, &config.policies, &original_uri)
                .await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, session_id: &str, uri: &str) -> GatewayResult<()> {
        let config = self.config.load_full();
        let is_last = self.registry.unsubscribe(session_id, uri);
        if is_last {
            if let Ok((server_id, original_uri)) = self.resolve_resource(uri) {
                let server_cfg = self.server_config(&config, &server_id)?;
                self.pool
                    .unsubscribe_resource(&server_id, &server_cfg, &config.policies, &original_uri)
                    .await?;
            }
        }
        Ok(())
    }

    /// Every subscription a session held at disconnect, unwound and told to
    /// the owning upstream (spec's per-session teardown invariant).
    pub async fn drop_session(&self, session_id: &str) {
        let config = self.config.load_full();
        for entry_id in self.registry.drop_session(session_id) {
            if let Ok((server_id, original_uri)) = self.resolve_resource(&entry_id) {
                if let Ok(server_cfg) = self.server_config(&config, &server_id) {
                    if let Err(e) = self
                        .pool
                        .unsubscribe_resource(&server_id, &server_cfg, &config.policies, &original_uri)
                        .await
                    {
                        warn!(session_id, entry_id, error = %e, "failed to unsubscribe stale session from upstream");
                    }
                }
            }
        }
    }

    fn resolve_tool(&self, id: &str) -> GatewayResult<(String, String)> {
        if let Some((server_id, bare)) = namespace::denamespace(id, &self.registry.all_server_ids()) {
            return Ok((server_id.to_string(), bare.to_string()));
        }
        let resolved = self.registry.resolve_bare_tool(id)?;
        namespace::denamespace(&resolved, &self.registry.all_server_ids())
            .map(|(s, n)| (s.to_string(), n.to_string()))
            .ok_or_else(|| GatewayError::not_found(format!("tool '{id}' not found")))
    }

    fn resolve_prompt(&self, id: &str) -> GatewayResult<(String, String)> {
        if let Some((server_id, bare)) = namespace::denamespace(id, &self.registry.all_server_ids()) {
            return Ok((server_id.to_string(), bare.to_string()));
        }
        let resolved = self.registry.resolve_bare_prompt(id)?;
        namespace::denamespace(&resolved, &self.registry.all_server_ids())
            .map(|(s, n)| (s.to_string(), n.to_string()))
            .ok_or_else(|| GatewayError::not_found(format!("prompt '{id}' not found")))
    }

    /// Resolve a namespaced resource uri back to `(serverId, originalUri)`.
    /// Tries an exact catalog match first, then RFC 6570 template matching
    /// against every `ResourceTemplateEntry` owned by the same candidate
    /// server (§4.C).
    fn resolve_resource(&self, uri: &str) -> GatewayResult<(String, String)> {
        if let Some(entry) = self.registry.get(uri) {
            let server_id = entry.server_id().to_string();
            let original = match entry {
                CatalogEntry::Resource { def, .. } => def.uri,
                CatalogEntry::ResourceTemplate { uri_template, .. } => uri_template,
                _ => return Err(GatewayError::not_found(format!("'{uri}' is not a resource"))),
            };
            return Ok((server_id, original));
        }

        // No exact literal match: expand every template this server owns
        // and test it against the requested uri (RFC 6570 subset, §4.C).
        let server_ids = self.registry.all_server_ids();
        if let Some((server_id, bare)) = namespace::denamespace(uri, &server_ids) {
            for template in self.registry.templates_for(&server_id) {
                if namespace::template_matches(&template, bare) {
                    return Ok((server_id, bare.to_string()));
                }
            }
        }
        Err(GatewayError::not_found(format!("resource '{uri}' not found")))
    }
}

/// Truncate a serialized payload against `policies.outputSizeLimit`.
/// `limit == 0` disables the check entirely; any positive limit truncates
/// any payload whose serialized length exceeds it (so `limit == 1`
/// truncates every non-empty payload, per the spec's boundary case).
fn truncate_if_needed(result: Value, limit: usize) -> (Value, bool) {
    if limit == 0 {
        return (result, false);
    }
    let serialized = match serde_json::to_string(&result) {
        Ok(s) => s,
        Err(_) => return (result, false),
    };
    if serialized.len() <= limit {
        return (result, false);
    }

    let truncated_text: String = serialized.chars().take(limit).collect();
    (
        serde_json::json!({
            "content": [{ "type": "text", "text": truncated_text }],
            "_meta": { "truncated": true, "originalSize": serialized.len(), "limit": limit },
        }),
        true,
    )
}

/// Recurse into a tool-call argument tree, rewriting any string that looks
/// like a Windows-style path into forward-slash form. URLs (`scheme://…`)
/// are left untouched (§4.D path normalization).
fn normalize_path_args(args: HashMap<String, Value>) -> HashMap<String, Value> {
    args.into_iter().map(|(k, v)| (k, normalize_value(v))).collect()
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(normalize_path_string(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize_value(v))).collect()),
        other => other,
    }
}

fn normalize_path_string(s: &str) -> String {
    if is_url(s) || !s.contains('\\') {
        return s.to_string();
    }
    s.replace('\\', "/")
}

/// `^[A-Za-z][A-Za-z0-9+.-]*://` — matches the spec's boundary rule for
/// what must *not* be rewritten by path normalization.
fn is_url(s: &str) -> bool {
    let Some(scheme_end) = s.find("://") else {
        return false;
    };
    let scheme = &s[..scheme_end];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection_matches_scheme_grammar() {
        assert!(is_url("https://example.com/a"));
        assert!(is_url("streamable-http://host/x"));
        assert!(!is_url("C:\\tmp\\a.txt"));
        assert!(!is_url("not a url"));
    }

    #[test]
    fn windows_paths_are_normalized_but_urls_are_untouched() {
        assert_eq!(normalize_path_string("C:\\tmp\\a.txt"), "C:/tmp/a.txt");
        assert_eq!(normalize_path_string("https://example.com/a\\b"), "https://example.com/a\\b");
        assert_eq!(normalize_path_string("/already/unix"), "/already/unix");
    }

    #[test]
    fn path_normalization_recurses_into_nested_structures() {
        let mut args = HashMap::new();
        args.insert(
            "paths".to_string(),
            serde_json::json!(["C:\\a", { "nested": "D:\\b" }]),
        );
        let normalized = normalize_path_args(args);
        assert_eq!(normalized["paths"][0], serde_json::json!("C:/a"));
        assert_eq!(normalized["paths"][1]["nested"], serde_json::json!("D:/b"));
    }

    #[test]
    fn size_limit_zero_disables_truncation() {
        let (_, truncated) = truncate_if_needed(serde_json::json!({"a": "b".repeat(100)}), 0);
        assert!(!truncated);
    }

    #[test]
    fn size_limit_one_truncates_any_nonempty_payload() {
        let (_, truncated) = truncate_if_needed(serde_json::json!({"a": "b"}), 1);
        assert!(truncated);
    }

    #[test]
    fn within_limit_payload_is_not_truncated() {
        let (result, truncated) = truncate_if_needed(serde_json::json!({"a": "b"}), 65_536);
        assert!(!truncated);
        assert_eq!(result, serde_json::json!({"a": "b"}));
    }
}
