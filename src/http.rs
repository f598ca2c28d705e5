//! Client-facing HTTP surface (§6), built directly on `axum`/`tower-http`
//! rather than the upstream SDK's `turbomcp_transport::axum::AxumMcpExt`.
//!
//! `AxumMcpExt`'s `McpAppState` fans every SSE notification out over one
//! global `broadcast::Sender<String>` (`turbomcp-transport/src/axum/service/
//! state.rs`) shared by every connected client. That can't express
//! per-session-targeted `resources/updated`/`notifications/cancelled`
//! delivery, so this gateway hand-builds its routing on the same
//! underlying crates instead of wrapping that integration.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::wire::MCP_PROTOCOL_VERSION;

pub fn build_router(gateway: Gateway) -> AxumRouter {
    AxumRouter::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/tools", get(tools_handler))
        .route("/servers", get(servers_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Check the `Authorization: Bearer` header against the configured API-key
/// gate, when one is configured. No-op (always `Ok`) when auth is off.
fn check_auth(gateway: &Gateway, headers: &HeaderMap) -> Result<(), GatewayError> {
    let Some(gate) = &gateway.auth else {
        return Ok(());
    };
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::invalid_params("missing Authorization header"))?;
    let token = crate::auth::bearer_token(header)
        .ok_or_else(|| GatewayError::invalid_params("Authorization header must be a Bearer token"))?;
    gate.authenticate(token).map(|_| ())
}

fn error_response(status: StatusCode, error: GatewayError) -> Response {
    (status, Json(json!({ "error": error.to_jsonrpc_error() }))).into_response()
}

async fn sse_handler(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    check_auth(&gateway, &headers).map_err(|e| error_response(StatusCode::UNAUTHORIZED, e))?;

    let id = uuid::Uuid::new_v4().to_string();
    let (_session, mut rx) = gateway.sessions.register(id.clone(), 256);
    let registry = gateway.registry.clone();
    let sessions = gateway.sessions.clone();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("endpoint").data(format!("/messages?sessionId={id}")));
        while let Some(frame) = rx.recv().await {
            yield Ok(Event::default().event("message").data(frame.to_string()));
        }
        registry.drop_session(&id);
        sessions.remove(&id, &registry);
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn messages_handler(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(frame): Json<Value>,
) -> Response {
    if let Err(e) = check_auth(&gateway, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, e);
    }

    let Some(session_id) = query.session_id else {
        return error_response(StatusCode::BAD_REQUEST, GatewayError::invalid_params("missing sessionId query parameter"));
    };
    let Some(session) = gateway.sessions.get(&session_id) else {
        return error_response(StatusCode::NOT_FOUND, GatewayError::not_found(format!("no such session '{session_id}'")));
    };

    if let Some(response) = gateway.dispatcher.handle_frame(&session, frame).await {
        if session.send(response).await.is_err() {
            warn!(session_id, "session's SSE stream already closed");
        }
    }
    StatusCode::ACCEPTED.into_response()
}

async fn mcp_handler(State(gateway): State<Gateway>, headers: HeaderMap, Json(frame): Json<Value>) -> Response {
    if let Err(e) = check_auth(&gateway, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, e);
    }

    match headers.get("mcp-protocol-version").and_then(|v| v.to_str().ok()) {
        Some(v) if v == MCP_PROTOCOL_VERSION => {}
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                GatewayError::invalid_params(format!(
                    "unsupported MCP-Protocol-Version '{other}', this gateway speaks {MCP_PROTOCOL_VERSION}"
                )),
            );
        }
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                GatewayError::invalid_params("missing required MCP-Protocol-Version header"),
            );
        }
    }

    let existing_id = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let looked_up = existing_id.as_deref().and_then(|id| gateway.sessions.get(id));

    let (session, ephemeral) = match looked_up {
        Some(session) => (session, false),
        None => {
            let id = existing_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let (session, _rx) = gateway.sessions.register(id, 32);
            (session, true)
        }
    };

    let response = gateway.dispatcher.handle_frame(&session, frame).await;

    if ephemeral {
        gateway.registry.drop_session(&session.id);
        gateway.sessions.remove(&session.id, &gateway.registry);
    }

    let mut builder = Response::builder()
        .header("mcp-session-id", session.id.clone())
        .header("content-type", "application/json");

    builder = match &response {
        Some(_) => builder.status(StatusCode::OK),
        None => builder.status(StatusCode::ACCEPTED),
    };

    let body = response.map_or_else(Vec::new, |v| serde_json::to_vec(&v).unwrap_or_default());
    builder.body(Body::from(body)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn health_handler(State(gateway): State<Gateway>) -> Json<Value> {
    Json(gateway.health_snapshot().await)
}

async fn status_handler(State(gateway): State<Gateway>) -> Json<Value> {
    Json(gateway.status_snapshot().await)
}

async fn tools_handler(State(gateway): State<Gateway>) -> Json<Value> {
    let snapshot = gateway.registry.catalog_snapshot();
    Json(json!({ "tools": snapshot.tools }))
}

async fn servers_handler(State(gateway): State<Gateway>) -> Json<Value> {
    Json(json!({ "servers": gateway.pool.health().await }))
}

async fn metrics_handler(State(gateway): State<Gateway>) -> Json<Value> {
    Json(serde_json::to_value(gateway.metrics.snapshot()).unwrap_or(Value::Null))
}
