//! The aggregated catalog: namespaced tools/prompts/resources from every
//! upstream, subscription bookkeeping, and change notifications.

pub mod namespace;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use turbomcp_protocol::types::{Prompt, Resource, Tool};

use crate::config::model::{GatewayConfig, VirtualToolConfig, RESERVED_SERVER_ID, VIRTUAL_SERVER_ID};
use crate::error::{GatewayError, GatewayResult};
use crate::transport::TransportPool;

/// One aggregated catalog record. `id` is always namespaced
/// (`${serverId}_${name}`) except for the built-in `gateway_*` entries,
/// whose namespace is the fixed reserved prefix rather than a configured
/// server.
#[derive(Debug, Clone)]
pub enum CatalogEntry {
    Tool { id: String, server_id: String, def: Tool, version: u64 },
    Prompt { id: String, server_id: String, def: Prompt, version: u64 },
    Resource { id: String, server_id: String, def: Resource, version: u64 },
    ResourceTemplate { id: String, server_id: String, uri_template: String, version: u64 },
}

impl CatalogEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Tool { id, .. }
            | Self::Prompt { id, .. }
            | Self::Resource { id, .. }
            | Self::ResourceTemplate { id, .. } => id,
        }
    }

    pub fn server_id(&self) -> &str {
        match self {
            Self::Tool { server_id, .. }
            | Self::Prompt { server_id, .. }
            | Self::Resource { server_id, .. }
            | Self::ResourceTemplate { server_id, .. } => server_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Tool,
    Prompt,
    Resource,
}

/// Emitted on the event bus whenever a sync adds/removes catalog entries of
/// one kind for one upstream. Consumers that want the spec's coarse
/// `change` notification simply react to any `ChangeEvent` regardless of
/// `kind`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub server_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// `subscribe`/`unsubscribe` ref-counting: forward to the upstream only on
/// the first subscriber and the last unsubscribe.
#[derive(Default)]
struct SubscriptionEntry {
    sessions: HashSet<String>,
}

pub struct Registry {
    entries: DashMap<String, CatalogEntry>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    version: AtomicU64,
    events_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let registry = Self {
            entries: DashMap::new(),
            subscriptions: DashMap::new(),
            version: AtomicU64::new(0),
            events_tx,
        };
        registry.seed_builtin_tools();
        registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn seed_builtin_tools(&self) {
        for (name, description) in BUILTIN_TOOLS {
            let id = namespace::namespace(RESERVED_SERVER_ID, name);
            self.entries.insert(
                id.clone(),
                CatalogEntry::Tool {
                    id,
                    server_id: RESERVED_SERVER_ID.to_string(),
                    def: Tool {
                        name: name.to_string(),
                        title: None,
                        description: Some(description.to_string()),
                        input_schema: turbomcp_protocol::types::ToolInputSchema {
                            schema_type: "object".to_string(),
                            properties: Some(HashMap::new()),
                            required: None,
                            additional_properties: None,
                        },
                        output_schema: None,
                        annotations: None,
                        meta: None,
                    },
                    version: 0,
                },
            );
        }
    }

    pub fn is_builtin(name: &str) -> bool {
        let prefix = format!("{RESERVED_SERVER_ID}_");
        name.strip_prefix(&prefix)
            .is_some_and(|rest| BUILTIN_TOOLS.iter().any(|(n, _)| *n == rest))
    }

    /// Execute a `gateway_*` meta tool locally. Never forwarded to the
    /// Transport pool.
    pub async fn call_builtin(
        &self,
        namespaced_name: &str,
        args: &serde_json::Value,
        config: &GatewayConfig,
        pool: &TransportPool,
    ) -> GatewayResult<serde_json::Value> {
        let prefix = format!("{RESERVED_SERVER_ID}_");
        let bare = namespaced_name
            .strip_prefix(&prefix)
            .ok_or_else(|| GatewayError::not_found(format!("'{namespaced_name}' is not a gateway tool")))?;

        match bare {
            "list_servers" => {
                let health = pool.health().await;
                let by_id: HashMap<_, _> = health.into_iter().map(|h| (h.server_id.clone(), h)).collect();
                let servers: Vec<_> = config
                    .servers
                    .iter()
                    .map(|s| {
                        let h = by_id.get(&s.name);
                        json!({
                            "id": s.name,
                            "transport": s.transport.label(),
                            "enabled": s.enabled,
                            "state": h.map(|h| format!("{:?}", h.state)).unwrap_or_else(|| "disconnected".to_string()),
                        })
                    })
                    .collect();
                Ok(json!({ "servers": servers }))
            }
            "describe_server" => {
                let server_id = args
                    .get("server_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::invalid_params("missing 'server_id' argument"))?;
                if !config.servers.iter().any(|s| s.name == server_id) {
                    return Err(GatewayError::not_found(format!("no such server '{server_id}'")));
                }
                let (tools, prompts, resources) = self.counts_for(server_id);
                Ok(json!({
                    "server_id": server_id,
                    "tools": tools,
                    "prompts": prompts,
                    "resources": resources,
                }))
            }
            "health" => {
                let health = pool.health().await;
                let online = health.iter().filter(|h| h.state == crate::transport::ConnectionState::Connected).count();
                let total = config.servers.len();
                let status = if total == 0 || online == total {
                    "healthy"
                } else if online == 0 {
                    "unhealthy"
                } else {
                    "degraded"
                };
                Ok(json!({
                    "status": status,
                    "servers": { "total": total, "online": online, "offline": total - online },
                }))
            }
            other => Err(GatewayError::not_found(format!("unknown gateway tool '{other}'"))),
        }
    }

    fn counts_for(&self, server_id: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mut tools = Vec::new();
        let mut prompts = Vec::new();
        let mut resources = Vec::new();
        for entry in self.entries.iter() {
            if entry.server_id() != server_id {
                continue;
            }
            match entry.value() {
                CatalogEntry::Tool { def, .. } => tools.push(def.name.clone()),
                CatalogEntry::Prompt { def, .. } => prompts.push(def.name.clone()),
                CatalogEntry::Resource { def, .. } => resources.push(def.uri.clone()),
                CatalogEntry::ResourceTemplate { uri_template, .. } => resources.push(uri_template.clone()),
            }
        }
        (tools, prompts, resources)
    }

    /// Sync protocol for one upstream (§4.C): list everything, namespace,
    /// diff against what's currently recorded for this server, replace,
    /// and emit change events for each kind that actually moved.
    pub async fn sync_server(
        &self,
        server_id: &str,
        config: &crate::config::model::ServerConfig,
        policies: &crate::config::model::PoliciesConfig,
        pool: &TransportPool,
    ) -> GatewayResult<()> {
        let tools = pool.list_tools(server_id, config, policies).await.unwrap_or_default();
        let prompts = pool.list_prompts(server_id, config, policies).await.unwrap_or_default();
        let resources = pool.list_resources(server_id, config, policies).await.unwrap_or_default();
        let templates = pool
            .list_resource_templates(server_id, config, policies)
            .await
            .unwrap_or_default();

        self.replace_kind(server_id, ChangeKind::Tool, tools.into_iter().map(|t| {
            let id = namespace::namespace(server_id, &t.name);
            (id.clone(), CatalogEntry::Tool { id, server_id: server_id.to_string(), def: t, version: 0 })
        }));
        self.replace_kind(server_id, ChangeKind::Prompt, prompts.into_iter().map(|p| {
            let id = namespace::namespace(server_id, &p.name);
            (id.clone(), CatalogEntry::Prompt { id, server_id: server_id.to_string(), def: p, version: 0 })
        }));

        let mut resource_entries: Vec<(String, CatalogEntry)> = resources
            .into_iter()
            .map(|r| {
                let id = namespace::namespace(server_id, &r.uri);
                (id.clone(), CatalogEntry::Resource { id, server_id: server_id.to_string(), def: r, version: 0 })
            })
            .collect();
        resource_entries.extend(templates.into_iter().map(|uri_template| {
            let id = namespace::namespace(server_id, &uri_template);
            (
                id.clone(),
                CatalogEntry::ResourceTemplate { id, server_id: server_id.to_string(), uri_template, version: 0 },
            )
        }));
        self.replace_kind(server_id, ChangeKind::Resource, resource_entries.into_iter());

        Ok(())
    }

    /// Register the configured virtual tools as ordinary `ToolEntry`
    /// records under the reserved `virtual` namespace, so they show up in
    /// `tools/list` like any upstream tool. Re-synced wholesale on every
    /// config load/reload (cheap: the set is small and config-driven).
    pub fn sync_virtual_tools(&self, virtual_tools: &[VirtualToolConfig]) {
        let entries = virtual_tools.iter().map(|vt| {
            let tool = Tool {
                name: vt.id.clone(),
                title: None,
                description: vt.description.clone(),
                input_schema: serde_json::from_value(vt.input_schema.clone()).unwrap_or_else(|_| {
                    turbomcp_protocol::types::ToolInputSchema {
                        schema_type: "object".to_string(),
                        properties: Some(HashMap::new()),
                        required: None,
                        additional_properties: None,
                    }
                }),
                output_schema: None,
                annotations: None,
                meta: None,
            };
            (
                vt.id.clone(),
                CatalogEntry::Tool {
                    id: vt.id.clone(),
                    server_id: VIRTUAL_SERVER_ID.to_string(),
                    def: tool,
                    version: 0,
                },
            )
        });
        self.replace_kind(VIRTUAL_SERVER_ID, ChangeKind::Tool, entries);
    }

    fn replace_kind(&self, server_id: &str, kind: ChangeKind, new_entries: impl Iterator<Item = (String, CatalogEntry)>) {
        let is_matching_kind = |e: &CatalogEntry| -> bool {
            matches!(
                (kind, e),
                (ChangeKind::Tool, CatalogEntry::Tool { .. })
                    | (ChangeKind::Prompt, CatalogEntry::Prompt { .. })
                    | (ChangeKind::Resource, CatalogEntry::Resource { .. })
                    | (ChangeKind::Resource, CatalogEntry::ResourceTemplate { .. })
            )
        };

        let previous_ids: HashSet<String> = self
            .entries
            .iter()
            .filter(|e| e.server_id() == server_id && is_matching_kind(e.value()))
            .map(|e| e.id().to_string())
            .collect();

        let new_entries: Vec<(String, CatalogEntry)> = new_entries.collect();
        let new_ids: HashSet<String> = new_entries.iter().map(|(id, _)| id.clone()).collect();

        let added: Vec<String> = new_ids.difference(&previous_ids).cloned().collect();
        let removed: Vec<String> = previous_ids.difference(&new_ids).cloned().collect();

        if added.is_empty() && removed.is_empty() {
            return;
        }

        for id in &removed {
            self.entries.remove(id);
        }
        let version = self.bump_version();
        for (id, mut entry) in new_entries {
            set_version(&mut entry, version);
            self.entries.insert(id, entry);
        }

        let _ = self.events_tx.send(ChangeEvent {
            kind,
            server_id: server_id.to_string(),
            added,
            removed,
        });
    }

    /// Remove every entry owned by a server (cascades on config removal).
    /// Returns the subscription entry ids that were torn down with it, so
    /// the caller can tell (even though the upstream connection is already
    /// gone and there's nothing left to send an unsubscribe to) — mirrors
    /// `drop_session`'s return shape for the sessions-side teardown.
    pub fn remove_server(&self, server_id: &str) -> Vec<String> {
        for kind in [ChangeKind::Tool, ChangeKind::Prompt, ChangeKind::Resource] {
            self.replace_kind(server_id, kind, std::iter::empty());
        }
        let prefix = format!("{server_id}_");
        let mut removed = Vec::new();
        self.subscriptions.retain(|entry_id, _| {
            if entry_id.starts_with(&prefix) {
                removed.push(entry_id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn get(&self, id: &str) -> Option<CatalogEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Every resource-template uri owned by one upstream, for the Router's
    /// RFC 6570 fallback match when an exact literal lookup misses.
    pub fn templates_for(&self, server_id: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                CatalogEntry::ResourceTemplate { server_id: sid, uri_template, .. } if sid == server_id => {
                    Some(uri_template.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Every resource template across every upstream, namespaced, for
    /// `resources/templates/list`. The wire-visible `uriTemplate` is the
    /// namespaced form so a client's later `resources/read` round-trips
    /// through the Router's denamespace + RFC 6570 match unchanged.
    pub fn all_resource_templates(&self) -> Vec<turbomcp_protocol::types::ResourceTemplate> {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                CatalogEntry::ResourceTemplate { id, .. } => Some(turbomcp_protocol::types::ResourceTemplate {
                    name: id.clone(),
                    title: None,
                    uri_template: id.clone(),
                    description: None,
                    mime_type: None,
                    annotations: None,
                    meta: None,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn all_server_ids(&self) -> Vec<String> {
        let mut ids: HashSet<String> = self.entries.iter().map(|e| e.server_id().to_string()).collect();
        ids.remove(RESERVED_SERVER_ID);
        ids.remove(VIRTUAL_SERVER_ID);
        ids.into_iter().collect()
    }

    /// Resolve a bare (unqualified) tool name to its unique owner, or
    /// `Conflict` if more than one upstream exposes the same bare name.
    pub fn resolve_bare_tool(&self, bare_name: &str) -> GatewayResult<String> {
        self.resolve_bare(bare_name, |e| matches!(e, CatalogEntry::Tool { .. }))
    }

    pub fn resolve_bare_prompt(&self, bare_name: &str) -> GatewayResult<String> {
        self.resolve_bare(bare_name, |e| matches!(e, CatalogEntry::Prompt { .. }))
    }

    fn resolve_bare(&self, bare_name: &str, matches_kind: impl Fn(&CatalogEntry) -> bool) -> GatewayResult<String> {
        let matches: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matches_kind(e.value()) && bare_name_of(e.value()) == bare_name)
            .map(|e| e.id().to_string())
            .collect();

        match matches.len() {
            0 => Err(GatewayError::not_found(format!("no upstream exposes '{bare_name}'"))),
            1 => Ok(matches[0].clone()),
            _ => Err(GatewayError::conflict(
                format!("'{bare_name}' is ambiguous across {} upstreams", matches.len()),
                matches,
            )),
        }
    }

    /// `subscribe(sessionId, entryId)`: record interest and tell the
    /// caller whether this was the *first* subscriber (meaning they must
    /// forward `resources/subscribe` upstream).
    pub fn subscribe(&self, session_id: &str, entry_id: &str) -> bool {
        let mut entry = self.subscriptions.entry(entry_id.to_string()).or_default();
        let was_empty = entry.sessions.is_empty();
        entry.sessions.insert(session_id.to_string());
        was_empty
    }

    /// Returns whether this was the *last* subscriber (caller must forward
    /// `resources/unsubscribe` upstream).
    pub fn unsubscribe(&self, session_id: &str, entry_id: &str) -> bool {
        if let Some(mut entry) = self.subscriptions.get_mut(entry_id) {
            entry.sessions.remove(session_id);
            if entry.sessions.is_empty() {
                drop(entry);
                self.subscriptions.remove(entry_id);
                return true;
            }
        }
        false
    }

    /// Tear down every subscription a disconnecting session held. Returns
    /// the entry ids whose last subscriber just left (upstream unsubscribe
    /// required for each).
    pub fn drop_session(&self, session_id: &str) -> Vec<String> {
        let mut now_empty = Vec::new();
        self.subscriptions.retain(|entry_id, sub| {
            sub.sessions.remove(session_id);
            if sub.sessions.is_empty() {
                now_empty.push(entry_id.clone());
                false
            } else {
                true
            }
        });
        now_empty
    }

    pub fn sessions_subscribed_to(&self, entry_id: &str) -> Vec<String> {
        self.subscriptions
            .get(entry_id)
            .map(|e| e.sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A single serialized catalog projection, rebuilt fresh on every call.
    /// `version()` lets callers cache externally and invalidate on change;
    /// the Registry itself does not hold a stale copy.
    pub fn catalog_snapshot(&self) -> CatalogSnapshot {
        let mut tools = Vec::new();
        let mut prompts = Vec::new();
        let mut resources = Vec::new();
        for entry in self.entries.iter() {
            match entry.value() {
                CatalogEntry::Tool { def, .. } => tools.push(def.clone()),
                CatalogEntry::Prompt { def, .. } => prompts.push(def.clone()),
                CatalogEntry::Resource { def, .. } => resources.push(def.clone()),
                CatalogEntry::ResourceTemplate { .. } => {}
            }
        }
        CatalogSnapshot {
            version: self.version(),
            tools,
            prompts,
            resources,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
}

fn bare_name_of(entry: &CatalogEntry) -> &str {
    match entry {
        CatalogEntry::Tool { def, .. } => &def.name,
        CatalogEntry::Prompt { def, .. } => &def.name,
        CatalogEntry::Resource { def, .. } => &def.uri,
        CatalogEntry::ResourceTemplate { uri_template, .. } => uri_template,
    }
}

fn set_version(entry: &mut CatalogEntry, version: u64) {
    match entry {
        CatalogEntry::Tool { version: v, .. }
        | CatalogEntry::Prompt { version: v, .. }
        | CatalogEntry::Resource { version: v, .. }
        | CatalogEntry::ResourceTemplate { version: v, .. } => *v = version,
    }
}

const BUILTIN_TOOLS: &[(&str, &str)] = &[
    ("list_servers", "List every configured upstream with its transport kind and connection state."),
    ("describe_server", "Describe one upstream's cached tool/prompt/resource counts and names."),
    ("health", "Report the same health payload as GET /health, for MCP-only clients."),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{BackendTransportConfig, ServerConfig, SessionMode};

    fn stdio_server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
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
        }
    }

    #[test]
    fn builtin_tools_are_seeded_and_namespaced() {
        let registry = Registry::new();
        assert!(registry.get("gateway_list_servers").is_some());
        assert!(Registry::is_builtin("gateway_health"));
        assert!(!Registry::is_builtin("fs_read_file"));
    }

    #[test]
    fn subscribe_reports_first_and_last() {
        let registry = Registry::new();
        assert!(registry.subscribe("sess-a", "fs_file:///x"));
        assert!(!registry.subscribe("sess-b", "fs_file:///x"));
        assert!(!registry.unsubscribe("sess-a", "fs_file:///x"));
        assert!(registry.unsubscribe("sess-b", "fs_file:///x"));
    }

    #[test]
    fn drop_session_tears_down_its_subscriptions_and_reports_emptied_entries() {
        let registry = Registry::new();
        registry.subscribe("sess-a", "fs_file:///x");
        registry.subscribe("sess-b", "fs_file:///y");
        let emptied = registry.drop_session("sess-a");
        assert_eq!(emptied, vec!["fs_file:///x".to_string()]);
        assert_eq!(registry.sessions_subscribed_to("fs_file:///y"), vec!["sess-b".to_string()]);
    }

    #[test]
    fn remove_server_cascades_its_entries() {
        let registry = Registry::new();
        registry.entries.insert(
            "fs_read_file".to_string(),
            CatalogEntry::Tool {
                id: "fs_read_file".to_string(),
                server_id: "fs".to_string(),
                def: Tool {
                    name: "read_file".to_string(),
                    title: None,
                    description: None,
                    input_schema: turbomcp_protocol::types::ToolInputSchema {
                        schema_type: "object".to_string(),
                        properties: None,
                        required: None,
                        additional_properties: None,
                    },
                    output_schema: None,
                    annotations: None,
                    meta: None,
                },
                version: 1,
            },
        );
        let removed = registry.remove_server("fs");
        assert!(registry.get("fs_read_file").is_none());
        assert!(removed.is_empty());
    }

    #[test]
    fn remove_server_only_tears_down_its_own_subscriptions() {
        let registry = Registry::new();
        registry.subscribe("sess-a", "fs_file:///x");
        registry.subscribe("sess-b", "gh_file:///y");

        let removed = registry.remove_server("fs");

        assert_eq!(removed, vec!["fs_file:///x".to_string()]);
        assert_eq!(registry.sessions_subscribed_to("fs_file:///x"), Vec::<String>::new());
        assert_eq!(registry.sessions_subscribed_to("gh_file:///y"), vec!["sess-b".to_string()]);
    }

    #[test]
    fn bare_name_conflict_lists_alternatives() {
        let registry = Registry::new();
        for server in ["fs", "gh"] {
            registry.entries.insert(
                namespace::namespace(server, "init"),
                CatalogEntry::Prompt {
                    id: namespace::namespace(server, "init"),
                    server_id: server.to_string(),
                    def: Prompt {
                        name: "init".to_string(),
                        title: None,
                        description: None,
                        arguments: None,
                        meta: None,
                    },
                    version: 1,
                },
            );
        }
        let err = registry.resolve_bare_prompt("init").unwrap_err();
        match err {
            GatewayError::Conflict { mut alternatives, .. } => {
                alternatives.sort();
                assert_eq!(alternatives, vec!["fs_init".to_string(), "gh_init".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn unique_bare_name_resolves() {
        let registry = Registry::new();
        registry.entries.insert(
            "fs_read_file".to_string(),
            CatalogEntry::Tool {
                id: "fs_read_file".to_string(),
                server_id: "fs".to_string(),
                def: Tool {
                    name: "read_file".to_string(),
                    title: None,
                    description: None,
                    input_schema: turbomcp_protocol::types::ToolInputSchema {
                        schema_type: "object".to_string(),
                        properties: None,
                        required: None,
                        additional_properties: None,
                    },
                    output_schema: None,
                    annotations: None,
                    meta: None,
                },
                version: 1,
            },
        );
        assert_eq!(registry.resolve_bare_tool("read_file").unwrap(), "fs_read_file");
    }

    #[test]
    fn server_config_helper_compiles() {
        let _ = stdio_server("fs");
    }
}
