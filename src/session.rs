//! Per-connection session state (§4.F).
//!
//! The upstream SDK's axum integration fans `list_changed`/`message`
//! notifications out over one global `broadcast::Sender<String>`
//! (`turbomcp_transport::axum::McpAppState::sse_sender`) shared by every
//! client. That is too coarse for this gateway: `resources/updated` must
//! reach only the sessions actually subscribed to that resource, and
//! `notifications/cancelled` must reach only the session that owns the
//! request. Each `Session` therefore gets its own outbound channel, and the
//! `SessionManager` picks targets explicitly instead of broadcasting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::{ChangeEvent, Registry};

/// `logging/setLevel` severity, ordered low to high per RFC 5424 (the set
/// MCP's `logging` capability uses). A session's configured level gates
/// which `notifications/message` frames it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "notice" => Self::Notice,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            "alert" => Self::Alert,
            "emergency" => Self::Emergency,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }
}

/// One connected client. Outbound frames (responses the wire layer doesn't
/// write directly, notifications, server-initiated requests) go out over
/// `outbound`; the transport-specific sink (SSE stream, StreamableHTTP
/// response body, stdio writer) owns the receiving half.
pub struct Session {
    pub id: String,
    /// Tie-break order for "pick a session to field an upstream-initiated
    /// request" (§9): lower is older. Assigned once at registration from
    /// `SessionManager::next_seq`.
    pub connected_at_seq: u64,
    outbound: mpsc::Sender<Value>,
    pending: DashMap<String, CancellationToken>,
    log_level: parking_lot::RwLock<LogLevel>,
}

impl Session {
    fn new(id: String, connected_at_seq: u64, outbound: mpsc::Sender<Value>) -> Self {
        Self {
            id,
            connected_at_seq,
            outbound,
            pending: DashMap::new(),
            log_level: parking_lot::RwLock::new(LogLevel::Info),
        }
    }

    /// Queue a frame (response, notification, server-initiated request) for
    /// delivery. Fails only once the session's transport has gone away.
    pub async fn send(&self, frame: Value) -> Result<(), mpsc::error::SendError<Value>> {
        self.outbound.send(frame).await
    }

    pub fn log_level(&self) -> LogLevel {
        *self.log_level.read()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write() = level;
    }

    /// Register a token for an in-flight request, keyed by the JSON-RPC id
    /// rendered as a string (`MessageId`'s concrete shape isn't assumed —
    /// see the discussion in `registry::namespace`). Returns the token the
    /// wire layer should race the request future against.
    pub fn begin_request(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.pending.insert(request_id.to_string(), token.clone());
        token
    }

    /// Drop bookkeeping for a request once its response has been sent,
    /// whether it completed, failed, or was cancelled.
    pub fn finish_request(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Handle an inbound `notifications/cancelled` for this session: cancel
    /// the matching in-flight request if one is still tracked. A request
    /// that already finished (or never existed) is silently ignored, since
    /// the notification may race the response.
    pub fn cancel_request(&self, request_id: &str) {
        if let Some(token) = self.pending.get(request_id) {
            token.cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Registers/looks up sessions and fans registry change events and resource
/// updates out to the right ones.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    next_seq: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected client and return its handle plus the
    /// receiving half of its outbound channel, for the transport layer to
    /// drain into an SSE stream / HTTP response / stdio writer.
    pub fn register(&self, id: String, buffer: usize) -> (Arc<Session>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(buffer);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id.clone(), seq, tx));
        self.sessions.insert(id, session.clone());
        (session, rx)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    /// Remove a session and return the registry subscriptions it held, so
    /// the caller can tear down any now-unreferenced upstream subscription.
    pub fn remove(&self, id: &str, registry: &Registry) -> Vec<String> {
        self.sessions.remove(id);
        registry.drop_session(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// The gateway's aggregate capability set, advertised at `initialize`.
    /// A simple static union: the gateway itself always speaks `tools`,
    /// `prompts`, `resources` (with `subscribe`/`listChanged`), and
    /// `logging`; it never advertises `sampling`/`elicitation`/`roots` as
    /// something it provides (those flow the other way, gateway-to-client,
    /// see `pick_for_upstream_request`).
    pub fn capabilities() -> Value {
        serde_json::json!({
            "tools": { "listChanged": true },
            "prompts": { "listChanged": true },
            "resources": { "subscribe": true, "listChanged": true },
            "logging": {},
        })
    }

    /// Fan a catalog change out to every connected session as the
    /// appropriate `notifications/*/list_changed`. All sessions receive it
    /// regardless of whether they've ever called the corresponding `list`
    /// method; a client that doesn't care simply ignores the notification,
    /// matching the MCP spec's own permissive framing.
    pub async fn broadcast_list_changed(&self, event: &ChangeEvent) {
        let method = match event.kind {
            crate::registry::ChangeKind::Tool => "notifications/tools/list_changed",
            crate::registry::ChangeKind::Prompt => "notifications/prompts/list_changed",
            crate::registry::ChangeKind::Resource => "notifications/resources/list_changed",
        };
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        for entry in self.sessions.iter() {
            if entry.value().send(frame.clone()).await.is_err() {
                debug!(session = %entry.key(), "dropping stale outbound sender");
            }
        }
    }

    /// Send `notifications/resources/updated` only to sessions actually
    /// subscribed to `uri`, per the Registry's ref-counted subscription
    /// table.
    pub async fn notify_resource_updated(&self, registry: &Registry, uri: &str) {
        let targets = registry.sessions_subscribed_to(uri);
        if targets.is_empty() {
            return;
        }
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/resources/updated",
            "params": { "uri": uri },
        });
        for id in targets {
            if let Some(session) = self.get(&id) {
                let _ = session.send(frame.clone()).await;
            }
        }
    }

    /// Send a `notifications/message` log frame to every session whose
    /// configured `logging/setLevel` is at or below `level`'s severity.
    pub async fn broadcast_log(&self, level: LogLevel, logger: &str, data: Value) {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {
                "level": level.as_str(),
                "logger": logger,
                "data": data,
            },
        });
        for entry in self.sessions.iter() {
            if entry.value().log_level() <= level {
                let _ = entry.value().send(frame.clone()).await;
            }
        }
    }

    /// Pick the session that should field an upstream-initiated request
    /// (`sampling/createMessage`, `elicitation/create`, `roots/list`) when
    /// an upstream server asks the gateway for one. §9 leaves the choice
    /// implementation-defined; this picks the most recently connected
    /// session, on the reasoning that it's the one most likely still
    /// actively driving the interaction.
    pub fn pick_for_upstream_request(&self) -> Option<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).max_by_key(|s| s.connected_at_seq)
    }

    /// Spawn a background task draining `registry.subscribe_events()` into
    /// `broadcast_list_changed`, for the lifetime of `manager`. The task
    /// exits when the registry (and thus its broadcast sender) is dropped.
    pub fn spawn_change_event_relay(manager: Arc<Self>, registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
        let mut events = registry.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.broadcast_list_changed(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "change event relay lagged, notifying a generic list_changed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChangeKind;

    #[tokio::test]
    async fn register_assigns_increasing_seq_and_tracks_count() {
        let manager = SessionManager::new();
        let (a, _rx_a) = manager.register("a".into(), 8);
        let (b, _rx_b) = manager.register("b".into(), 8);
        assert!(b.connected_at_seq > a.connected_at_seq);
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn begin_and_cancel_request_signals_the_token() {
        let (session, _rx) = SessionManager::new().register("s".into(), 8);
        let token = session.begin_request("1");
        assert!(!token.is_cancelled());
        session.cancel_request("1");
        assert!(token.is_cancelled());
        session.finish_request("1");
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_of_unknown_request_is_a_no_op() {
        let (session, _rx) = SessionManager::new().register("s".into(), 8);
        session.cancel_request("missing");
    }

    #[tokio::test]
    async fn broadcast_list_changed_reaches_every_session() {
        let manager = SessionManager::new();
        let (_s1, mut rx1) = manager.register("s1".into(), 8);
        let (_s2, mut rx2) = manager.register("s2".into(), 8);
        manager
            .broadcast_list_changed(&ChangeEvent {
                kind: ChangeKind::Tool,
                server_id: "fs".into(),
                added: vec!["fs_read".into()],
                removed: vec![],
            })
            .await;
        let m1 = rx1.try_recv().unwrap();
        let m2 = rx2.try_recv().unwrap();
        assert_eq!(m1["method"], "notifications/tools/list_changed");
        assert_eq!(m2["method"], "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn notify_resource_updated_only_reaches_subscribers() {
        let registry = Registry::new();
        registry.subscribe("sub", "fs_file:///x");
        let manager = SessionManager::new();
        let (_sub, mut rx_sub) = manager.register("sub".into(), 8);
        let (_other, mut rx_other) = manager.register("other".into(), 8);

        manager.notify_resource_updated(&registry, "fs_file:///x").await;

        assert!(rx_sub.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_log_respects_per_session_level() {
        let manager = SessionManager::new();
        let (quiet, mut rx_quiet) = manager.register("quiet".into(), 8);
        let (verbose, mut rx_verbose) = manager.register("verbose".into(), 8);
        quiet.set_log_level(LogLevel::Error);
        verbose.set_log_level(LogLevel::Debug);

        manager.broadcast_log(LogLevel::Info, "gateway", serde_json::json!("hello")).await;

        assert!(rx_quiet.try_recv().is_err());
        assert!(rx_verbose.try_recv().is_ok());
    }

    #[tokio::test]
    async fn pick_for_upstream_request_favors_most_recent() {
        let manager = SessionManager::new();
        let (_a, _rx_a) = manager.register("a".into(), 8);
        let (b, _rx_b) = manager.register("b".into(), 8);
        let picked = manager.pick_for_upstream_request().unwrap();
        assert_eq!(picked.id, b.id);
    }

    #[tokio::test]
    async fn remove_tears_down_registry_subscriptions() {
        let registry = Registry::new();
        registry.subscribe("sess", "fs_file:///x");
        let manager = SessionManager::new();
        let (_session, _rx) = manager.register("sess".into(), 8);

        let now_empty = manager.remove("sess", &registry);
        assert_eq!(now_empty, vec!["fs_file:///x".to_string()]);
        assert_eq!(manager.count(), 0);
    }
}
