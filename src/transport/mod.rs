//! Per-upstream connection pool: at most one live connection per configured
//! server, with lazy connect, reconnect/backoff, and circuit breaking.
//!
//! Upstream transports are modeled as a tagged variant over the SDK's own
//! client transports (`ChildProcessTransport`, `HttpSseClientTransport`,
//! `StreamableHttpClientTransport`) rather than a `dyn Transport` object —
//! per the spec's own design note: a narrow capability interface, no
//! inheritance.

pub mod backoff;
pub mod circuit;
pub mod ssrf;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use turbomcp_client::Client;
use turbomcp_protocol::types::{GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};
use turbomcp_transport::streamable_http_client::{StreamableHttpClientConfig, StreamableHttpClientTransport};
use turbomcp_transport::{ChildProcessConfig, ChildProcessTransport, HttpSseClientConfig, HttpSseClientTransport};

use crate::config::model::{BackendTransportConfig, PoliciesConfig, ServerConfig};
use crate::error::{GatewayError, GatewayResult};
use circuit::{CircuitBreaker, CircuitState};

/// Connection lifecycle, per §4.B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// One of the SDK's concrete client transports, selected by
/// `BackendTransportConfig`. `Http` and `StreamableHttp` both speak the
/// streamable-HTTP client framing; `Sse` speaks the SSE+POST pairing. There
/// is deliberately no `dyn Transport` here (see module docs).
enum UpstreamClient {
    Stdio(Client<ChildProcessTransport>),
    Http(Client<StreamableHttpClientTransport>),
    Sse(Client<HttpSseClientTransport>),
    StreamableHttp(Client<StreamableHttpClientTransport>),
}

/// Dispatches a method call across the four transport variants without a
/// trait object; `$method` must exist on `turbomcp_client::Client<T>` for
/// every `T` the pool supports.
macro_rules! forward {
    ($self:expr, $method:ident ( $($arg:expr),* )) => {
        match $self {
            UpstreamClient::Stdio(c) => c.$method($($arg),*).await,
            UpstreamClient::Http(c) => c.$method($($arg),*).await,
            UpstreamClient::Sse(c) => c.$method($($arg),*).await,
            UpstreamClient::StreamableHttp(c) => c.$method($($arg),*).await,
        }
    };
}

struct Connection {
    server_id: String,
    config: ServerConfig,
    state: ConnectionState,
    client: Option<UpstreamClient>,
    circuit: CircuitBreaker,
    attempt: u32,
    last_error: Option<String>,
}

impl Connection {
    fn new(server_id: String, config: ServerConfig) -> Self {
        Self {
            server_id,
            config,
            state: ConnectionState::Disconnected,
            client: None,
            circuit: CircuitBreaker::with_defaults(),
            attempt: 0,
            last_error: None,
        }
    }
}

/// Health snapshot for one upstream, returned by [`TransportPool::health`]
/// and served at `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub server_id: String,
    pub transport: &'static str,
    pub state: ConnectionState,
    pub circuit: String,
    pub last_error: Option<String>,
}

pub struct TransportPool {
    connections: DashMap<String, Arc<AsyncMutex<Connection>>>,
}

impl Default for TransportPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportPool {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    fn slot(&self, server_id: &str, config: &ServerConfig) -> Arc<AsyncMutex<Connection>> {
        self.connections
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Connection::new(server_id.to_string(), config.clone()))))
            .clone()
    }

    /// Drop a connection entirely (config removal, shutdown). Closes the
    /// underlying transport by dropping the client, which releases the
    /// child process / socket.
    pub async fn release(&self, server_id: &str) {
        if let Some((_, slot)) = self.connections.remove(server_id) {
            let mut conn = slot.lock().await;
            conn.client = None;
            conn.state = ConnectionState::Disconnected;
            info!(server_id, "released upstream connection");
        }
    }

    /// Current circuit-breaker state, for the Router's pre-flight check.
    /// An upstream the pool has never seen is reported `Closed` (never
    /// tripped), not `Unavailable` — that's the Router's job to classify.
    ///
    /// Calls through `should_allow()` rather than the plain `state()`
    /// getter so an Open breaker past its cool-down window actually
    /// advances to HalfOpen here, on the live request path, instead of
    /// only when something calls `should_allow()` directly.
    pub async fn circuit_state(&self, server_id: &str) -> CircuitState {
        match self.connections.get(server_id) {
            Some(slot) => {
                let mut conn = slot.lock().await;
                conn.circuit.should_allow();
                conn.circuit.state()
            }
            None => CircuitState::Closed,
        }
    }

    pub async fn health(&self) -> Vec<UpstreamHealth> {
        let mut out = Vec::with_capacity(self.connections.len());
        for entry in self.connections.iter() {
            let conn = entry.value().lock().await;
            out.push(UpstreamHealth {
                server_id: conn.server_id.clone(),
                transport: conn.config.transport.label(),
                state: conn.state,
                circuit: format!("{:?}", conn.circuit.state()),
                last_error: conn.last_error.clone(),
            });
        }
        out
    }

    /// Ensure a connection exists for `server_id`, connecting lazily on
    /// first use. Holding the connection's own mutex across the connect
    /// attempt *is* the dedup guard: a second concurrent caller blocks on
    /// the same lock and observes `Connected` once the first finishes.
    pub async fn ensure_connected(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<()> {
        let slot = self.slot(server_id, config);
        let mut conn = slot.lock().await;
        self.connect_locked(&mut conn, policies).await
    }

    async fn connect_locked(&self, conn: &mut Connection, policies: &PoliciesConfig) -> GatewayResult<()> {
        if matches!(conn.state, ConnectionState::Connected) && conn.client.is_some() {
            return Ok(());
        }

        conn.state = ConnectionState::Connecting;
        let server_id = conn.server_id.clone();
        debug!(server_id = %server_id, attempt = conn.attempt, "connecting to upstream");

        let result = build_client(&conn.config, policies).await;
        match result {
            Ok(client) => {
                conn.client = Some(client);
                conn.state = ConnectionState::Connected;
                conn.attempt = 0;
                conn.last_error = None;
                info!(server_id = %server_id, "upstream connected");
                Ok(())
            }
            Err(e) => {
                conn.attempt += 1;
                conn.last_error = Some(e.to_string());
                let max_retries = conn.config.max_retries.unwrap_or(policies.max_retries);
                conn.state = if conn.attempt > max_retries {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Reconnecting
                };
                warn!(server_id = %server_id, error = %e, attempt = conn.attempt, "upstream connect failed");
                Err(e)
            }
        }
    }

    async fn with_connected<F, Fut, R>(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        op_name: &str,
        op: F,
    ) -> GatewayResult<R>
    where
        F: FnOnce(&mut UpstreamClient) -> Fut,
        Fut: std::future::Future<Output = GatewayResult<R>>,
    {
        let slot = self.slot(server_id, config);
        let mut conn = slot.lock().await;
        self.connect_locked(&mut conn, policies).await?;

        let client = conn
            .client
            .as_mut()
            .ok_or_else(|| GatewayError::unavailable(server_id))?;

        let start = Instant::now();
        let result = op(client).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => conn.circuit.record_success(elapsed),
            Err(e) => {
                conn.circuit.record_failure(elapsed, e.to_string());
                if e.is_retryable() {
                    conn.state = ConnectionState::Reconnecting;
                    conn.client = None;
                }
            }
        }
        debug!(server_id, op_name, elapsed_ms = elapsed.as_millis() as u64, ok = result.is_ok());
        result
    }

    /// Retry an idempotent operation up to `config.max_retries` times with
    /// the pool's full-jitter backoff between attempts (§4.D step 5: only
    /// `tools/list`-style listings and `resources/read` are retried by the
    /// Router/pool; tool **calls** never are, since side effects aren't
    /// assumed idempotent). `max_retries = 0` means the first failure
    /// surfaces immediately, no retry attempted.
    async fn with_retry<F, Fut, R>(
        &self,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        seed: u64,
        mut op: F,
    ) -> GatewayResult<R>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<R>>,
    {
        let max_retries = config.max_retries.unwrap_or(policies.max_retries);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max_retries && e.is_retryable() => {
                    tokio::time::sleep(backoff::delay_for_attempt(attempt, seed)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn list_tools(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<Vec<Tool>> {
        self.with_retry(config, policies, 1, || {
            self.with_connected(server_id, config, policies, "tools/list", |client| async move {
                forward!(client, list_tools()).map_err(GatewayError::from)
            })
        })
        .await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        name: &str,
        arguments: Option<HashMap<String, serde_json::Value>>,
    ) -> GatewayResult<serde_json::Value> {
        self.with_connected(server_id, config, policies, "tools/call", |client| async move {
            forward!(client, call_tool(name, arguments)).map_err(GatewayError::from)
        })
        .await
    }

    pub async fn list_resources(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<Vec<Resource>> {
        self.with_retry(config, policies, 2, || {
            self.with_connected(server_id, config, policies, "resources/list", |client| async move {
                forward!(client, list_resources()).map_err(GatewayError::from)
            })
        })
        .await
    }

    /// `resources/read` is idempotent (§4.D step 5) and retried up to
    /// `config.max_retries` with the pool's backoff, unlike tool calls.
    pub async fn read_resource(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        uri: &str,
    ) -> GatewayResult<ReadResourceResult> {
        self.with_retry(config, policies, 3, || {
            self.with_connected(server_id, config, policies, "resources/read", |client| async move {
                forward!(client, read_resource(uri)).map_err(GatewayError::from)
            })
        })
        .await
    }

    pub async fn list_resource_templates(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<Vec<String>> {
        self.with_retry(config, policies, 4, || {
            self.with_connected(server_id, config, policies, "resources/templates/list", |client| async move {
                forward!(client, list_resource_templates()).map_err(GatewayError::from)
            })
        })
        .await
    }

    pub async fn list_prompts(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<Vec<Prompt>> {
        self.with_retry(config, policies, 5, || {
            self.with_connected(server_id, config, policies, "prompts/list", |client| async move {
                forward!(client, list_prompts()).map_err(GatewayError::from)
            })
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        name: &str,
        arguments: Option<HashMap<String, serde_json::Value>>,
    ) -> GatewayResult<GetPromptResult> {
        self.with_connected(server_id, config, policies, "prompts/get", |client| async move {
            forward!(client, get_prompt(name, arguments)).map_err(GatewayError::from)
        })
        .await
    }

    pub async fn subscribe_resource(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        uri: &str,
    ) -> GatewayResult<()> {
        self.with_connected(server_id, config, policies, "resources/subscribe", |client| async move {
            forward!(client, subscribe(uri)).map_err(GatewayError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn unsubscribe_resource(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
        uri: &str,
    ) -> GatewayResult<()> {
        self.with_connected(server_id, config, policies, "resources/unsubscribe", |client| async move {
            forward!(client, unsubscribe(uri)).map_err(GatewayError::from)?;
            Ok(())
        })
        .await
    }

    pub async fn ping(
        &self,
        server_id: &str,
        config: &ServerConfig,
        policies: &PoliciesConfig,
    ) -> GatewayResult<()> {
        self.with_connected(server_id, config, policies, "ping", |client| async move {
            forward!(client, ping()).map_err(GatewayError::from)?;
            Ok(())
        })
        .await
    }
}

async fn build_client(config: &ServerConfig, policies: &PoliciesConfig) -> GatewayResult<UpstreamClient> {
    match &config.transport {
        BackendTransportConfig::Stdio {
            command,
            args,
            env,
            working_dir,
        } => {
            let transport = ChildProcessTransport::new(ChildProcessConfig {
                command: command.clone(),
                args: args.clone(),
                working_directory: working_dir.clone(),
                environment: Some(env.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                startup_timeout: request_timeout(config, policies),
                ..ChildProcessConfig::default()
            });
            let mut client = Client::new(transport);
            client
                .initialize()
                .await
                .map_err(|e| GatewayError::upstream(&config.name, e.to_string()))?;
            Ok(UpstreamClient::Stdio(client))
        }
        BackendTransportConfig::Http { url, headers } => {
            ssrf::validate_backend_url(url, &policies.backend_validation)?;
            let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig {
                base_url: url.clone(),
                timeout: request_timeout(config, policies),
                headers: headers.clone(),
                ..StreamableHttpClientConfig::default()
            });
            let mut client = Client::new(transport);
            client
                .initialize()
                .await
                .map_err(|e| GatewayError::upstream(&config.name, e.to_string()))?;
            Ok(UpstreamClient::Http(client))
        }
        BackendTransportConfig::Sse { url, headers } => {
            ssrf::validate_backend_url(url, &policies.backend_validation)?;
            let transport = HttpSseClientTransport::new(HttpSseClientConfig {
                base_url: url.clone(),
                headers: headers.clone(),
                timeout: request_timeout(config, policies),
                ..HttpSseClientConfig::default()
            });
            let mut client = Client::new(transport);
            client
                .initialize()
                .await
                .map_err(|e| GatewayError::upstream(&config.name, e.to_string()))?;
            Ok(UpstreamClient::Sse(client))
        }
        BackendTransportConfig::StreamableHttp { url, headers } => {
            ssrf::validate_backend_url(url, &policies.backend_validation)?;
            let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig {
                base_url: url.clone(),
                timeout: request_timeout(config, policies),
                headers: headers.clone(),
                ..StreamableHttpClientConfig::default()
            });
            let mut client = Client::new(transport);
            client
                .initialize()
                .await
                .map_err(|e| GatewayError::upstream(&config.name, e.to_string()))?;
            Ok(UpstreamClient::StreamableHttp(client))
        }
    }
}

/// Per-call timeout per §4.D step 2: the server's own override if set, else
/// the configured policy default.
fn request_timeout(config: &ServerConfig, policies: &PoliciesConfig) -> Duration {
    config
        .request_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| policies.default_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn stdio_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            transport: BackendTransportConfig::Stdio {
                command: "does-not-exist-on-this-system".into(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
            },
            enabled: true,
            request_timeout_ms: Some(100),
            max_retries: Some(0),
            mode: crate::config::model::SessionMode::Stateful,
        }
    }

    #[tokio::test]
    async fn unknown_server_reports_closed_circuit() {
        let pool = TransportPool::new();
        assert_eq!(pool.circuit_state("nope").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_connect_marks_reconnecting_then_failed() {
        let pool = TransportPool::new();
        let cfg = stdio_config("missing");
        let policies = PoliciesConfig::default();
        let err = pool.ensure_connected("missing", &cfg, &policies).await;
        assert!(err.is_err());
        let health = pool.health().await;
        assert_eq!(health.len(), 1);
        assert_ne!(health[0].state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn release_removes_the_connection() {
        let pool = TransportPool::new();
        let cfg = stdio_config("missing");
        let policies = PoliciesConfig::default();
        let _ = pool.ensure_connected("missing", &cfg, &policies).await;
        pool.release("missing").await;
        assert!(pool.health().await.is_empty());
    }

    #[tokio::test]
    async fn max_retries_zero_attempts_exactly_once() {
        let pool = TransportPool::new();
        let mut cfg = stdio_config("x");
        cfg.max_retries = Some(0);
        let policies = PoliciesConfig::default();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: GatewayResult<()> = pool
            .with_retry(&cfg, &policies, 7, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::timeout("op", 1)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_up_to_max_retries_then_surfaced() {
        let pool = TransportPool::new();
        let mut cfg = stdio_config("x");
        cfg.max_retries = Some(2);
        let policies = PoliciesConfig::default();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: GatewayResult<()> = pool
            .with_retry(&cfg, &policies, 7, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::timeout("op", 1)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_surfaces_immediately() {
        let pool = TransportPool::new();
        let mut cfg = stdio_config("x");
        cfg.max_retries = Some(5);
        let policies = PoliciesConfig::default();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: GatewayResult<()> = pool
            .with_retry(&cfg, &policies, 7, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::invalid_params("bad arg")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_retries_falls_back_to_policy_default_when_server_unset() {
        let pool = TransportPool::new();
        let mut cfg = stdio_config("x");
        cfg.max_retries = None;
        let mut policies = PoliciesConfig::default();
        policies.max_retries = 1;
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: GatewayResult<()> = pool
            .with_retry(&cfg, &policies, 7, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::timeout("op", 1)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn request_timeout_falls_back_to_policy_default_when_server_unset() {
        let mut cfg = stdio_config("x");
        cfg.request_timeout_ms = None;
        let mut policies = PoliciesConfig::default();
        policies.default_timeout_ms = 9_000;
        assert_eq!(request_timeout(&cfg, &policies), Duration::from_millis(9_000));
    }

    #[test]
    fn request_timeout_prefers_server_override() {
        let cfg = stdio_config("x");
        let policies = PoliciesConfig::default();
        assert_eq!(request_timeout(&cfg, &policies), Duration::from_millis(100));
    }
}
