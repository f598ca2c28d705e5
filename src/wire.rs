//! JSON-RPC method dispatch (§4.G), transport-agnostic: the SSE/
//! StreamableHTTP/STDIO frontends in `gateway.rs` all funnel inbound frames
//! through [`Dispatcher::handle_frame`].
//!
//! Frames are handled as plain `serde_json::Value` rather than through
//! `turbomcp_protocol::jsonrpc`'s typed structs. That module's `RequestId`
//! is an opaque `MessageId` whose concrete shape isn't something this crate
//! needs to match on — correlating a pending request only ever needs the id
//! rendered back out exactly as it came in, which a `Value` already gives
//! for free.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::config::model::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use crate::registry::{namespace, Registry};
use crate::router::Router;
use crate::session::{LogLevel, Session};

/// The MCP protocol version this gateway negotiates on the wire. Distinct
/// from the doc-comment version embedded in individual upstream SDK types,
/// which documents that SDK's own crate, not this gateway's wire contract.
pub const MCP_PROTOCOL_VERSION: &str = "2025-11-25";

/// Everything a dispatched method needs, bundled so `gateway.rs`'s
/// transport loops don't have to pass five arguments through every call.
#[derive(Clone)]
pub struct Dispatcher {
    pub registry: Arc<Registry>,
    pub router: Router,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, router: Router, config: Arc<ArcSwap<GatewayConfig>>, metrics: Arc<Metrics>) -> Self {
        Self { registry, router, config, metrics }
    }

    /// Handle one inbound frame for `session`. Returns `Some(envelope)` for
    /// a request (always answered, success or error) and `None` for a
    /// notification (never answered, per JSON-RPC).
    pub async fn handle_frame(&self, session: &Arc<Session>, frame: Value) -> Option<Value> {
        let method = frame.get("method").and_then(Value::as_str)?.to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        let id = frame.get("id").cloned();

        let Some(id) = id else {
            self.handle_notification(session, &method, params);
            return None;
        };

        let request_key = serde_json::to_string(&id).unwrap_or_default();
        let token = session.begin_request(&request_key);

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(GatewayError::cancelled(method.clone())),
            r = self.dispatch_method(&method, params, session) => r,
        };
        session.finish_request(&request_key);

        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_request_duration(&method, elapsed);
        self.metrics.record_request(&method, if result.is_ok() { "ok" } else { "error" });

        Some(match result {
            Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
            Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e.to_jsonrpc_error() }),
        })
    }

    fn handle_notification(&self, session: &Arc<Session>, method: &str, params: Value) {
        match method {
            "notifications/cancelled" => {
                if let Some(request_id) = params.get("requestId") {
                    let key = serde_json::to_string(request_id).unwrap_or_default();
                    session.cancel_request(&key);
                }
            }
            "notifications/initialized" => {}
            other => warn!(method = other, "ignoring unhandled notification"),
        }
    }

    #[instrument(skip(self, session, params), fields(session_id = %session.id))]
    async fn dispatch_method(&self, method: &str, params: Value, session: &Arc<Session>) -> GatewayResult<Value> {
        match method {
            "initialize" => Ok(self.handle_initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(params).await,
            "prompts/list" => self.handle_prompts_list(),
            "prompts/get" => self.handle_prompts_get(params).await,
            "resources/list" => self.handle_resources_list(),
            "resources/templates/list" => self.handle_resource_templates_list(),
            "resources/read" => self.handle_resources_read(params).await,
            "resources/subscribe" => self.handle_resources_subscribe(params, session).await,
            "resources/unsubscribe" => self.handle_resources_unsubscribe(params, session).await,
            "logging/setLevel" => self.handle_logging_set_level(params, session),
            other => Err(GatewayError::not_found(format!("unknown method '{other}'"))),
        }
    }

    fn handle_initialize(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": crate::session::SessionManager::capabilities(),
            "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        })
    }

    fn handle_tools_list(&self) -> GatewayResult<Value> {
        let snapshot = self.registry.catalog_snapshot();
        Ok(json!({ "tools": snapshot.tools }))
    }

    fn handle_prompts_list(&self) -> GatewayResult<Value> {
        let snapshot = self.registry.catalog_snapshot();
        Ok(json!({ "prompts": snapshot.prompts }))
    }

    fn handle_resources_list(&self) -> GatewayResult<Value> {
        let snapshot = self.registry.catalog_snapshot();
        Ok(json!({ "resources": snapshot.resources }))
    }

    fn handle_resource_templates_list(&self) -> GatewayResult<Value> {
        Ok(json!({ "resourceTemplates": self.registry.all_resource_templates() }))
    }

    async fn handle_tools_call(&self, params: Value) -> GatewayResult<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("tools/call requires 'name'"))?;
        let arguments = params
            .get("arguments")
            .and_then(|v| v.as_object().cloned())
            .map(|map| map.into_iter().collect());

        let server_label = self.metrics_server_label(name);
        let outcome = self.router.call_tool(name, arguments).await;
        self.metrics.record_tool_call(&server_label, if outcome.is_ok() { "ok" } else { "error" });

        // `outcome.result` already carries `_meta.truncated` when
        // `outcome.truncated` is set — `Router::call_tool` bakes that in.
        Ok(outcome?.result)
    }

    async fn handle_prompts_get(&self, params: Value) -> GatewayResult<Value> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("prompts/get requires 'name'"))?;
        let arguments = params
            .get("arguments")
            .and_then(|v| v.as_object().cloned())
            .map(|map| map.into_iter().collect());
        let result = self.router.get_prompt(name, arguments).await?;
        serde_json::to_value(result).map_err(GatewayError::from)
    }

    async fn handle_resources_read(&self, params: Value) -> GatewayResult<Value> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("resources/read requires 'uri'"))?;
        let result = self.router.read_resource(uri).await?;
        serde_json::to_value(result).map_err(GatewayError::from)
    }

    async fn handle_resources_subscribe(&self, params: Value, session: &Arc<Session>) -> GatewayResult<Value> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("resources/subscribe requires 'uri'"))?;
        self.router.subscribe_resource(&session.id, uri).await?;
        Ok(json!({}))
    }

    async fn handle_resources_unsubscribe(&self, params: Value, session: &Arc<Session>) -> GatewayResult<Value> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("resources/unsubscribe requires 'uri'"))?;
        self.router.unsubscribe_resource(&session.id, uri).await?;
        Ok(json!({}))
    }

    fn handle_logging_set_level(&self, params: Value, session: &Arc<Session>) -> GatewayResult<Value> {
        let level_str = params
            .get("level")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_params("logging/setLevel requires 'level'"))?;
        let level = LogLevel::parse(level_str).ok_or_else(|| GatewayError::invalid_params(format!("unknown log level '{level_str}'")))?;
        session.set_log_level(level);
        Ok(json!({}))
    }

    /// Best-effort `server` label for the `tool_calls_total` metric: the
    /// upstream the id denamespaces to, or `"virtual"`/`"gateway"` for
    /// built-ins and virtual tools, or `"unknown"` if nothing matches (the
    /// call itself still fails with `NotFound`; this only affects a label).
    fn metrics_server_label(&self, id: &str) -> String {
        if Registry::is_builtin(id) {
            return "gateway".to_string();
        }
        if self.config.load().virtual_tools.iter().any(|v| v.id == id) {
            return "virtual".to_string();
        }
        namespace::denamespace(id, &self.registry.all_server_ids())
            .map(|(server, _)| server.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportPool;

    fn dispatcher() -> (Dispatcher, Arc<Session>) {
        let registry = Arc::new(Registry::new());
        let pool = Arc::new(TransportPool::new());
        let config = Arc::new(ArcSwap::from_pointee(GatewayConfig::default()));
        let router = Router::new(registry.clone(), pool, config.clone());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(registry, router, config, metrics);
        let sessions = crate::session::SessionManager::new();
        let (session, _rx) = sessions.register("s".into(), 8);
        (dispatcher, session)
    }

    #[tokio::test]
    async fn initialize_reports_the_negotiated_protocol_version() {
        let (dispatcher, session) = dispatcher();
        let response = dispatcher
            .handle_frame(&session, json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }))
            .await
            .unwrap();
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn unknown_method_returns_a_jsonrpc_error_envelope() {
        let (dispatcher, session) = dispatcher();
        let response = dispatcher
            .handle_frame(&session, json!({ "jsonrpc": "2.0", "id": 2, "method": "bogus/method" }))
            .await
            .unwrap();
        assert_eq!(response["id"], 2);
        assert!(response.get("error").is_some());
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let (dispatcher, session) = dispatcher();
        let response = dispatcher
            .handle_frame(&session, json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_includes_the_builtin_gateway_tools() {
        let (dispatcher, session) = dispatcher();
        let response = dispatcher
            .handle_frame(&session, json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" }))
            .await
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "gateway_list_servers"));
    }

    #[tokio::test]
    async fn set_log_level_rejects_an_unknown_level() {
        let (dispatcher, session) = dispatcher();
        let response = dispatcher
            .handle_frame(
                &session,
                json!({ "jsonrpc": "2.0", "id": 4, "method": "logging/setLevel", "params": { "level": "not-a-level" } }),
            )
            .await
            .unwrap();
        assert!(response.get("error").is_some());
    }

    #[tokio::test]
    async fn cancelled_notification_cancels_a_pending_requests_token() {
        let (dispatcher, session) = dispatcher();
        let token = session.begin_request("\"42\"");
        dispatcher.handle_notification(&session, "notifications/cancelled", json!({ "requestId": "42" }));
        assert!(token.is_cancelled());
    }
}
