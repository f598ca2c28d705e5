//! Top-level orchestrator: wires the Registry, Transport pool, Router,
//! SessionManager, Metrics and config loader together, then drives the
//! wire-facing HTTP/STDIO listeners until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::ApiKeyGate;
use crate::config::model::GatewayConfig;
use crate::config::reload::{ConfigDiff, ConfigReloader};
use crate::config::{loader, validate};
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::router::Router;
use crate::session::SessionManager;
use crate::transport::TransportPool;
use crate::wire::Dispatcher;

/// Everything the running gateway owns. Cheap to clone (every field is an
/// `Arc`), so the HTTP layer hands a clone into every request handler
/// instead of threading individual references through extractors.
#[derive(Clone)]
pub struct Gateway {
    pub registry: Arc<Registry>,
    pub pool: Arc<TransportPool>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub dispatcher: Dispatcher,
    pub auth: Option<Arc<ApiKeyGate>>,
    started_at: Instant,
    accepting: Arc<AtomicBool>,
}

impl Gateway {
    /// Load config (explicit path, or the OS default, falling back to
    /// built-in defaults), connect to every enabled upstream, and seed the
    /// catalog. Connection failures at startup are logged, not fatal — a
    /// server that's down when the gateway starts still shows up as
    /// `disconnected` and is retried lazily on first use.
    pub async fn bootstrap(config_path: Option<PathBuf>) -> GatewayResult<Self> {
        let resolved_path = config_path.or_else(loader::default_config_path);
        let config = match &resolved_path {
            Some(path) if path.exists() => loader::load_from_path(path)?,
            _ => loader::load_default_or_builtin()?,
        };
        validate(&config)?;

        let registry = Arc::new(Registry::new());
        let pool = Arc::new(TransportPool::new());
        let config_swap = Arc::new(ArcSwap::from_pointee(config));
        let router = Router::new(registry.clone(), pool.clone(), config_swap.clone());
        let sessions = Arc::new(SessionManager::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(registry.clone(), router, config_swap.clone(), metrics.clone());

        let auth = config_swap
            .load()
            .auth
            .as_ref()
            .map(|auth_cfg| ApiKeyGate::load(&auth_cfg.signing_key_path, auth_cfg.token_ttl_secs))
            .transpose()?
            .map(Arc::new);

        let gateway = Self {
            registry,
            pool,
            sessions,
            metrics,
            config: config_swap,
            dispatcher,
            auth,
            started_at: Instant::now(),
            accepting: Arc::new(AtomicBool::new(true)),
        };

        gateway.sync_all().await;
        SessionManager::spawn_change_event_relay(gateway.sessions.clone(), gateway.registry.clone());

        if let Some(path) = resolved_path.filter(|p| p.exists()) {
            let config_for_hook = gateway.config.clone();
            let registry_for_hook = gateway.registry.clone();
            let pool_for_hook = gateway.pool.clone();
            let reloader = ConfigReloader::watch(
                path,
                gateway.config.clone(),
                Box::new(move |diff, new_config| {
                    apply_reload_diff(diff, new_config, &registry_for_hook, &pool_for_hook, &config_for_hook);
                }),
            )?;
            // Leaked intentionally: the watcher must outlive `bootstrap` for
            // the process lifetime, and `Gateway` is cloned freely so it
            // cannot own a non-`Clone`, non-`Send`-shared watcher itself.
            Box::leak(Box::new(reloader));
        }

        Ok(gateway)
    }

    /// `(re)sync every enabled upstream plus the virtual-tool catalog.
    /// Called once at startup; individual servers are re-synced by the
    /// config reload hook as they're added/changed.
    async fn sync_all(&self) {
        let config = self.config.load_full();
        for server in config.servers.iter().filter(|s| s.enabled) {
            if let Err(e) = self
                .registry
                .sync_server(&server.name, server, &config.policies, &self.pool)
                .await
            {
                warn!(server = %server.name, error = %e, "initial sync failed, will retry lazily on first call");
            }
        }
        self.registry.sync_virtual_tools(&config.virtual_tools);
    }

    /// `GET /health`.
    pub async fn health_snapshot(&self) -> Value {
        let health = self.pool.health().await;
        let total = self.config.load().servers.iter().filter(|s| s.enabled).count();
        let online = health
            .iter()
            .filter(|h| matches!(h.state, crate::transport::ConnectionState::Connected))
            .count();
        let offline = total.saturating_sub(online);
        let status = if total == 0 || online == total {
            "healthy"
        } else if online == 0 {
            "unhealthy"
        } else {
            "degraded"
        };
        json!({
            "status": status,
            "uptime": self.started_at.elapsed().as_secs(),
            "servers": { "total": total, "online": online, "offline": offline },
        })
    }

    /// `GET /status`.
    pub async fn status_snapshot(&self) -> Value {
        let health = self.pool.health().await;
        let snapshot = self.registry.catalog_snapshot();
        json!({
            "servers": health,
            "catalogVersion": snapshot.version,
            "toolCount": snapshot.tools.len(),
            "promptCount": snapshot.prompts.len(),
            "resourceCount": snapshot.resources.len(),
            "sessionCount": self.sessions.count(),
        })
    }

    /// Graceful shutdown per §5: stop accepting new connections, drain
    /// in-flight sessions up to `shutdownTimeout`, then release every
    /// upstream connection.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let timeout = Duration::from_millis(self.config.load().gateway.shutdown_timeout_ms);
        let deadline = Instant::now() + timeout;
        while self.sessions.count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for server_id in self.registry.all_server_ids() {
            self.pool.release(&server_id).await;
        }
        info!("gateway shutdown complete");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run the newline-delimited JSON-RPC STDIO frontend (§6) until stdin
    /// closes or a shutdown signal fires. Always available — unlike the
    /// HTTP surface, STDIO framing needs nothing beyond `tokio::io`.
    pub async fn run_stdio(&self) -> GatewayResult<()> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (session, mut outbound) = self.sessions.register(uuid::Uuid::new_v4().to_string(), 256);
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let mut line = serde_json::to_vec(&frame).map_err(GatewayError::from)?;
                    line.push(b'\n');
                    stdout.write_all(&line).await.map_err(GatewayError::from)?;
                    stdout.flush().await.map_err(GatewayError::from)?;
                }
                line = lines.next_line() => {
                    let Some(line) = line.map_err(GatewayError::from)? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame: Value = match serde_json::from_str(&line) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "malformed stdio frame, ignoring");
                            continue;
                        }
                    };
                    if let Some(response) = self.dispatcher.handle_frame(&session, frame).await {
                        let mut out = serde_json::to_vec(&response).map_err(GatewayError::from)?;
                        out.push(b'\n');
                        stdout.write_all(&out).await.map_err(GatewayError::from)?;
                        stdout.flush().await.map_err(GatewayError::from)?;
                    }
                }
            }
        }

        self.registry.drop_session(&session.id);
        self.sessions.remove(&session.id, &self.registry);
        Ok(())
    }

    /// Bind and serve the HTTP surface (SSE, Streamable-HTTP, and the
    /// operational endpoints) until a shutdown signal fires.
    #[cfg(feature = "runtime")]
    pub async fn run_http(&self, addr: SocketAddr) -> GatewayResult<()> {
        let app = crate::http::build_router(self.clone());
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            GatewayError::config(format!("failed to bind {addr}: {e}"))
        })?;
        info!(%addr, "gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(GatewayError::from)?;

        self.shutdown().await;
        Ok(())
    }
}

/// Apply a config diff: drop removed servers' connections/catalog entries,
/// re-sync added/updated ones, and re-register virtual tools wholesale.
/// Runs on whatever task the `notify` watcher's callback fires on, so it
/// must not assume a Tokio context beyond what's already running.
fn apply_reload_diff(
    diff: &ConfigDiff,
    new_config: &Arc<GatewayConfig>,
    registry: &Arc<Registry>,
    pool: &Arc<TransportPool>,
    _config: &Arc<ArcSwap<GatewayConfig>>,
) {
    let registry = registry.clone();
    let pool = pool.clone();
    let new_config = new_config.clone();
    let removed = diff.removed_servers.clone();
    let changed: Vec<String> = diff.added_servers.iter().chain(diff.updated_servers.iter()).cloned().collect();

    tokio::spawn(async move {
        for server_id in &removed {
            // Entry ids returned here would normally need an upstream
            // `resources/unsubscribe`, but the connection is released in
            // the same breath, so there's nothing left to tell.
            let _ = registry.remove_server(server_id);
            pool.release(server_id).await;
        }
        for server_id in &changed {
            if let Some(server) = new_config.servers.iter().find(|s| &s.name == server_id) {
                if let Err(e) = registry
                    .sync_server(&server.name, server, &new_config.policies, &pool)
                    .await
                {
                    warn!(server = %server.name, error = %e, "resync after config reload failed");
                }
            }
        }
        registry.sync_virtual_tools(&new_config.virtual_tools);
    });
}

#[cfg(feature = "runtime")]
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
