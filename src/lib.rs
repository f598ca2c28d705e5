//! mcp-gateway: an aggregating MCP (Model Context Protocol) gateway.
//!
//! Sits between one or more MCP clients (LLM agents, IDEs) and a configurable
//! set of upstream MCP servers, presenting itself as a single MCP server
//! whose catalog is the union of all upstream catalogs. Routes `tools/call`,
//! `prompts/get`, `resources/read`, and subscription traffic to the owning
//! upstream, composes scripted *virtual tools* over upstream calls, and
//! exposes built-in meta tools for discovery and health.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Wire adapter (SSE / Streamable-HTTP / STDIO)             │  src/wire.rs, src/http.rs
//! └─────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │ Session manager: per-client façade, notification fan-out │  src/session.rs
//! └─────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │ Router + Virtual-tool engine                             │  src/router.rs, src/virtual_tool.rs
//! └─────────────────────────────────────────────────────────┘
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │ Transport pool: per-upstream connections, circuit breaker│  src/transport/
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The Registry (`src/registry/`) aggregates every upstream's catalog and
//! sits alongside the Router rather than beneath it; the config loader
//! (`src/config/`) feeds both at startup and on hot reload.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;
pub mod virtual_tool;
pub mod wire;

#[cfg(feature = "runtime")]
pub mod http;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{GatewayError, GatewayResult};

/// Common imports for embedding the gateway as a library.
pub mod prelude {
    pub use crate::config::{GatewayConfig, ServerConfig};
    pub use crate::error::{GatewayError, GatewayResult};
    pub use crate::gateway::Gateway;
    pub use crate::registry::Registry;
    pub use crate::router::Router;
    pub use crate::session::SessionManager;
    pub use crate::transport::TransportPool;
}

/// Version of mcp-gateway.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP protocol version this gateway negotiates on the wire.
pub const MCP_PROTOCOL_VERSION: &str = wire::MCP_PROTOCOL_VERSION;
