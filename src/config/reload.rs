//! File-watching hot reload with atomic snapshot swap and rollback.
//!
//! The gateway itself has no prior art for this in its upstream SDK; the
//! watch/rollback shape below follows the sibling pack's policy-file
//! reloader, adapted to swap an `ArcSwap` snapshot instead of a
//! `RwLock`-guarded struct.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::loader;
use crate::config::model::GatewayConfig;
use crate::error::GatewayResult;

/// The set of changes between two config snapshots, at server and virtual
/// tool granularity. The Registry and Transport pool apply this diff rather
/// than re-deriving it themselves.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiff {
    pub added_servers: Vec<String>,
    pub removed_servers: Vec<String>,
    pub updated_servers: Vec<String>,
    pub added_virtual_tools: Vec<String>,
    pub removed_virtual_tools: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added_servers.is_empty()
            && self.removed_servers.is_empty()
            && self.updated_servers.is_empty()
            && self.added_virtual_tools.is_empty()
            && self.removed_virtual_tools.is_empty()
    }

    pub fn compute(old: &GatewayConfig, new: &GatewayConfig) -> Self {
        let old_servers: std::collections::HashMap<_, _> =
            old.servers.iter().map(|s| (s.name.clone(), s)).collect();
        let new_servers: std::collections::HashMap<_, _> =
            new.servers.iter().map(|s| (s.name.clone(), s)).collect();

        let mut diff = Self::default();

        for (name, new_cfg) in &new_servers {
            match old_servers.get(name) {
                None => diff.added_servers.push(name.clone()),
                Some(old_cfg) => {
                    // `serde` derives don't give us `PartialEq` for free here since
                    // the config carries `serde_json::Value`; compare via the
                    // canonical serialized form instead.
                    let old_json = serde_json::to_value(old_cfg).ok();
                    let new_json = serde_json::to_value(new_cfg).ok();
                    if old_json != new_json {
                        diff.updated_servers.push(name.clone());
                    }
                }
            }
        }
        for name in old_servers.keys() {
            if !new_servers.contains_key(name) {
                diff.removed_servers.push(name.clone());
            }
        }

        let old_vt: std::collections::HashSet<_> =
            old.virtual_tools.iter().map(|v| v.id.clone()).collect();
        let new_vt: std::collections::HashSet<_> =
            new.virtual_tools.iter().map(|v| v.id.clone()).collect();
        diff.added_virtual_tools = new_vt.difference(&old_vt).cloned().collect();
        diff.removed_virtual_tools = old_vt.difference(&new_vt).cloned().collect();

        diff
    }
}

/// Callback invoked with the diff after a reload has been applied.
pub type ReloadHook = Box<dyn Fn(&ConfigDiff, &Arc<GatewayConfig>) + Send + Sync>;

/// Watches the config file on disk and hot-swaps `current` on valid changes.
/// An invalid candidate is rejected and logged; `current` is left untouched.
pub struct ConfigReloader {
    config_path: PathBuf,
    current: Arc<ArcSwap<GatewayConfig>>,
    on_reload: Arc<ReloadHook>,
    _watcher: RecommendedWatcher,
}

impl ConfigReloader {
    /// Start watching `config_path`. `current` must already hold the config
    /// that was loaded from this same path at startup. `on_reload` fires
    /// after every successfully applied (non-empty) diff, whether triggered
    /// by the file watcher or by [`Self::reload_now`].
    pub fn watch(
        config_path: impl AsRef<Path>,
        current: Arc<ArcSwap<GatewayConfig>>,
        on_reload: ReloadHook,
    ) -> GatewayResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let watch_path = config_path.clone();
        let current_for_events = Arc::clone(&current);
        let on_reload = Arc::new(on_reload);
        let hook_for_events = Arc::clone(&on_reload);

        let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            match result {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    if event.paths.iter().any(|p| p == &watch_path) {
                        let path = watch_path.clone();
                        let current = Arc::clone(&current_for_events);
                        let hook = Arc::clone(&hook_for_events);
                        tokio::spawn(async move {
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            if let Err(e) = Self::apply_reload(&path, &current, &hook) {
                                error!(error = %e, "config reload failed, keeping previous snapshot");
                            }
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "config file watcher error"),
            }
        })
        .map_err(|e| crate::error::GatewayError::config(format!("failed to create config watcher: {e}")))?;

        watcher
            .watch(&config_path, RecursiveMode::NonRecursive)
            .map_err(|e| crate::error::GatewayError::config(format!("failed to watch config file: {e}")))?;

        info!(path = %config_path.display(), "watching config file for changes");

        Ok(Self {
            config_path,
            current,
            on_reload,
            _watcher: watcher,
        })
    }

    /// Manually trigger a reload, returning the diff if the new config was
    /// accepted. Used by tests and by an operational "reload now" endpoint.
    pub fn reload_now(&self) -> GatewayResult<ConfigDiff> {
        Self::apply_reload(&self.config_path, &self.current, &self.on_reload)
    }

    fn apply_reload(
        path: &Path,
        current: &Arc<ArcSwap<GatewayConfig>>,
        on_reload: &ReloadHook,
    ) -> GatewayResult<ConfigDiff> {
        info!(path = %path.display(), "config file changed, reloading");

        let candidate = loader::load_from_path(path)?;
        let previous = current.load_full();
        let diff = ConfigDiff::compute(&previous, &candidate);

        if diff.is_empty() {
            return Ok(diff);
        }

        let new_snapshot = Arc::new(candidate);
        current.store(Arc::clone(&new_snapshot));
        info!(
            added = diff.added_servers.len(),
            removed = diff.removed_servers.len(),
            updated = diff.updated_servers.len(),
            "config reloaded"
        );
        on_reload(&diff, &new_snapshot);
        Ok(diff)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{BackendTransportConfig, GatewaySettings, ServerConfig, SessionMode};
    use tempfile::TempDir;

    fn server(name: &str) -> ServerConfig {
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

    fn write_config(path: &Path, servers: Vec<ServerConfig>) {
        let cfg = GatewayConfig {
            gateway: GatewaySettings {
                host: "127.0.0.1".into(),
                port: 8080,
                shutdown_timeout_ms: 10_000,
            },
            servers,
            ..GatewayConfig::default()
        };
        std::fs::write(path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
    }

    #[test]
    fn diff_detects_added_and_removed_servers() {
        let old = GatewayConfig {
            servers: vec![server("a"), server("b")],
            ..GatewayConfig::default()
        };
        let new = GatewayConfig {
            servers: vec![server("a"), server("c")],
            ..GatewayConfig::default()
        };
        let diff = ConfigDiff::compute(&old, &new);
        assert_eq!(diff.added_servers, vec!["c".to_string()]);
        assert_eq!(diff.removed_servers, vec!["b".to_string()]);
        assert!(diff.updated_servers.is_empty());
    }

    #[test]
    fn empty_diff_for_identical_configs() {
        let cfg = GatewayConfig {
            servers: vec![server("a")],
            ..GatewayConfig::default()
        };
        let diff = ConfigDiff::compute(&cfg, &cfg.clone());
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn reload_now_applies_a_valid_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, vec![server("a")]);

        let initial = loader::load_from_path(&path).unwrap();
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let reloader = ConfigReloader::watch(&path, Arc::clone(&current), Box::new(|_, _| {})).unwrap();

        write_config(&path, vec![server("a"), server("b")]);
        let diff = reloader.reload_now().unwrap();

        assert_eq!(diff.added_servers, vec!["b".to_string()]);
        assert_eq!(current.load().servers.len(), 2);
    }

    #[tokio::test]
    async fn reload_now_rolls_back_on_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        write_config(&path, vec![server("a")]);

        let initial = loader::load_from_path(&path).unwrap();
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let reloader = ConfigReloader::watch(&path, Arc::clone(&current), Box::new(|_, _| {})).unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        let result = reloader.reload_now();

        assert!(result.is_err());
        assert_eq!(current.load().servers.len(), 1);
        assert_eq!(current.load().servers[0].name, "a");
    }
}
