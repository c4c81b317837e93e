//! Backend registry: lifecycle, cached capability snapshots, update signal.
//!
//! The registry serializes every mutation behind a single write lock and
//! rebuilds the [`NameTracker`] before releasing it, so name resolution is
//! always consistent with the set of registered backends. Readers get
//! shallow copies; nothing hands out a mutable view of the map.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, BackendError, PromptSpec, ResourceSpec, ToolSpec};
use crate::tracker::{EntryCapabilities, NameTracker};

/// Cached capability snapshot of one backend plus its connectivity flag.
#[derive(Debug, Clone, Default)]
pub struct EntrySnapshot {
    pub tools: Vec<ToolSpec>,
    pub resources: Vec<ResourceSpec>,
    pub prompts: Vec<PromptSpec>,
    pub connected: bool,
}

/// A registered backend. The snapshot and connectivity flag are guarded by
/// a per-entry lock so concurrent dispatchers never observe a half-written
/// snapshot.
pub struct BackendEntry {
    name: String,
    tool_prefix: Option<String>,
    client: Arc<dyn BackendClient>,
    state: RwLock<EntrySnapshot>,
}

impl BackendEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tool_prefix(&self) -> Option<&str> {
        self.tool_prefix.as_deref()
    }

    pub fn client(&self) -> Arc<dyn BackendClient> {
        Arc::clone(&self.client)
    }

    pub async fn snapshot(&self) -> EntrySnapshot {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("backend '{0}' is already registered")]
    Duplicate(String),

    #[error("backend '{name}' failed to initialize")]
    InitializeFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("snapshot refresh failed for backend '{name}'")]
    SnapshotFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("backend '{0}' is not registered")]
    NotFound(String),
}

/// A tool from the union view, carrying its collision-resolved exposed name.
#[derive(Debug, Clone)]
pub struct ExposedTool {
    pub exposed_name: String,
    pub backend: String,
    pub spec: ToolSpec,
}

#[derive(Debug, Clone)]
pub struct ExposedPrompt {
    pub exposed_name: String,
    pub backend: String,
    pub spec: PromptSpec,
}

#[derive(Debug, Clone)]
pub struct ExposedResource {
    pub exposed_uri: String,
    pub backend: String,
    pub spec: ResourceSpec,
}

/// Owns the {backend name -> entry} map and the coalesced update signal.
pub struct ServerRegistry {
    entries: RwLock<HashMap<String, Arc<BackendEntry>>>,
    tracker: Arc<NameTracker>,
    update_tx: watch::Sender<u64>,
}

impl ServerRegistry {
    pub fn new() -> Arc<Self> {
        let (update_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            tracker: Arc::new(NameTracker::new()),
            update_tx,
        })
    }

    pub fn tracker(&self) -> Arc<NameTracker> {
        Arc::clone(&self.tracker)
    }

    /// Subscribe to the coalesced update signal. Rapid mutations may collapse
    /// into one wake-up; the last mutation is never lost.
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// The version of the most recent mutation.
    pub fn current_version(&self) -> u64 {
        *self.update_tx.borrow()
    }

    fn bump_update(&self) -> u64 {
        let mut version = 0;
        self.update_tx.send_modify(|v| {
            *v += 1;
            version = *v;
        });
        version
    }

    /// Register a backend: initialize its client, snapshot its capabilities,
    /// insert it, and recompute exposed names. Snapshot failures are
    /// non-fatal (an empty snapshot is stored); initialize failures abort
    /// without mutating the registry.
    ///
    /// Returns the update version the mutation produced.
    pub async fn register(
        &self,
        name: &str,
        client: Arc<dyn BackendClient>,
        tool_prefix: Option<String>,
    ) -> Result<u64, RegistryError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        client
            .initialize()
            .await
            .map_err(|source| RegistryError::InitializeFailed {
                name: name.to_string(),
                source,
            })?;

        let entry = Arc::new(BackendEntry {
            name: name.to_string(),
            tool_prefix,
            client,
            state: RwLock::new(EntrySnapshot {
                connected: true,
                ..EntrySnapshot::default()
            }),
        });

        if let Err(e) = refresh_entry_snapshot(&entry).await {
            warn!(
                backend = %name,
                error = %e,
                "capability snapshot failed; registering with empty capabilities"
            );
        }

        entries.insert(name.to_string(), Arc::clone(&entry));
        self.rebuild_tracker_locked(&entries).await;
        let version = self.bump_update();

        let state = entry.state.read().await;
        info!(
            backend = %name,
            tools = state.tools.len(),
            resources = state.resources.len(),
            prompts = state.prompts.len(),
            "backend registered"
        );
        Ok(version)
    }

    /// Remove a backend: close its client (errors logged, not fatal), drop
    /// the entry, and recompute exposed names.
    pub async fn deregister(&self, name: &str) -> Result<u64, RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Err(e) = entry.client.close().await {
            warn!(backend = %name, error = %e, "error closing backend client");
        }
        // In-flight dispatchers still holding the entry fail closed.
        entry.state.write().await.connected = false;

        self.rebuild_tracker_locked(&entries).await;
        let version = self.bump_update();
        info!(backend = %name, "backend deregistered");
        Ok(version)
    }

    /// Toggle connectivity from a health observation without dropping the
    /// cached snapshot.
    pub async fn set_connected(&self, name: &str, connected: bool) -> Result<u64, RegistryError> {
        let entries = self.entries.write().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        {
            let mut state = entry.state.write().await;
            if state.connected == connected {
                return Ok(self.current_version());
            }
            state.connected = connected;
        }
        self.rebuild_tracker_locked(&entries).await;
        debug!(backend = %name, connected, "backend connectivity changed");
        Ok(self.bump_update())
    }

    /// Re-list a backend's capabilities. A tools listing failure is fatal
    /// for the refresh; resource/prompt failures degrade to empty lists.
    pub async fn refresh_snapshot(&self, name: &str) -> Result<u64, RegistryError> {
        let entries = self.entries.write().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        refresh_entry_snapshot(entry)
            .await
            .map_err(|source| RegistryError::SnapshotFailed {
                name: name.to_string(),
                source,
            })?;

        self.rebuild_tracker_locked(&entries).await;
        Ok(self.bump_update())
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        self.entries.read().await.get(name).map(|e| e.client())
    }

    pub async fn get_entry(&self, name: &str) -> Option<Arc<BackendEntry>> {
        self.entries.read().await.get(name).map(Arc::clone)
    }

    /// Shallow copy of the registry map, safe to hand out.
    pub async fn snapshot_all_entries(&self) -> HashMap<String, Arc<BackendEntry>> {
        self.entries.read().await.clone()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Union of tool snapshots from connected entries, exposed-name policy
    /// applied, sorted by exposed name.
    pub async fn all_tools(&self) -> Vec<ExposedTool> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry in entries.values() {
            let state = entry.state.read().await;
            if !state.connected {
                continue;
            }
            for spec in &state.tools {
                if let Some(exposed) = self.tracker.exposed_tool_name(&entry.name, &spec.name) {
                    out.push(ExposedTool {
                        exposed_name: exposed,
                        backend: entry.name.clone(),
                        spec: spec.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.exposed_name.cmp(&b.exposed_name));
        out
    }

    pub async fn all_prompts(&self) -> Vec<ExposedPrompt> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry in entries.values() {
            let state = entry.state.read().await;
            if !state.connected {
                continue;
            }
            for spec in &state.prompts {
                if let Some(exposed) = self.tracker.exposed_prompt_name(&entry.name, &spec.name) {
                    out.push(ExposedPrompt {
                        exposed_name: exposed,
                        backend: entry.name.clone(),
                        spec: spec.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.exposed_name.cmp(&b.exposed_name));
        out
    }

    pub async fn all_resources(&self) -> Vec<ExposedResource> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry in entries.values() {
            let state = entry.state.read().await;
            if !state.connected {
                continue;
            }
            for spec in &state.resources {
                if let Some(exposed) = self.tracker.exposed_resource_uri(&entry.name, &spec.uri) {
                    out.push(ExposedResource {
                        exposed_uri: exposed,
                        backend: entry.name.clone(),
                        spec: spec.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.exposed_uri.cmp(&b.exposed_uri));
        out
    }

    /// Deregister every remaining backend (shutdown path). Errors are
    /// logged by `deregister`; a missing entry is skipped.
    pub async fn deregister_all(&self) {
        for name in self.backend_names().await {
            if let Err(e) = self.deregister(&name).await {
                warn!(backend = %name, error = %e, "error deregistering during shutdown");
            }
        }
    }

    async fn rebuild_tracker_locked(&self, entries: &HashMap<String, Arc<BackendEntry>>) {
        let mut caps = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            let state = entry.state.read().await;
            if !state.connected {
                continue;
            }
            caps.push(EntryCapabilities {
                backend: entry.name.clone(),
                tool_prefix: entry.tool_prefix.clone(),
                tools: state.tools.iter().map(|t| t.name.clone()).collect(),
                prompts: state.prompts.iter().map(|p| p.name.clone()).collect(),
                resource_uris: state.resources.iter().map(|r| r.uri.clone()).collect(),
            });
        }
        caps.sort_by(|a, b| a.backend.cmp(&b.backend));
        self.tracker.rebuild(&caps);
    }
}

/// Fetch a fresh capability snapshot into the entry. Tools are mandatory;
/// resources and prompts degrade to empty lists when the backend cannot
/// serve them.
async fn refresh_entry_snapshot(entry: &BackendEntry) -> Result<(), BackendError> {
    let tools = entry.client.list_tools().await?;

    let resources = match entry.client.list_resources().await {
        Ok(resources) => resources,
        Err(e) => {
            if e.is_unsupported() {
                debug!(backend = %entry.name, "backend does not list resources");
            } else {
                warn!(backend = %entry.name, error = %e, "resource listing failed; storing empty");
            }
            Vec::new()
        }
    };

    let prompts = match entry.client.list_prompts().await {
        Ok(prompts) => prompts,
        Err(e) => {
            if e.is_unsupported() {
                debug!(backend = %entry.name, "backend does not list prompts");
            } else {
                warn!(backend = %entry.name, error = %e, "prompt listing failed; storing empty");
            }
            Vec::new()
        }
    };

    let mut state = entry.state.write().await;
    state.tools = tools;
    state.resources = resources;
    state.prompts = prompts;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClient;
    use crate::tracker::CapabilityKind;

    #[tokio::test]
    async fn register_snapshots_and_exposes() {
        let registry = ServerRegistry::new();
        let client = MockClient::new().with_tools(&["read_file", "write_file"]);
        registry
            .register("files", client.clone(), None)
            .await
            .unwrap();

        assert!(registry.contains("files").await);
        assert!(client.initialized());

        let tools = registry.all_tools().await;
        let names: Vec<&str> = tools.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["read_file", "write_file"]);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ServerRegistry::new();
        registry
            .register("files", MockClient::new().with_tools(&["a"]), None)
            .await
            .unwrap();

        let err = registry
            .register("files", MockClient::new().with_tools(&["b"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));

        // Snapshot unchanged.
        let tools = registry.all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].exposed_name, "a");
    }

    #[tokio::test]
    async fn initialize_failure_leaves_registry_untouched() {
        let registry = ServerRegistry::new();
        let version_before = registry.current_version();
        let err = registry
            .register("bad", MockClient::new().fail_initialize(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InitializeFailed { .. }));
        assert!(!registry.contains("bad").await);
        assert_eq!(registry.current_version(), version_before);
    }

    #[tokio::test]
    async fn snapshot_failure_registers_with_empty_capabilities() {
        let registry = ServerRegistry::new();
        let client = MockClient::new()
            .with_tools(&["tool"])
            .fail_list_tools();
        registry.register("flaky", client, None).await.unwrap();

        assert!(registry.contains("flaky").await);
        assert!(registry.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_lists_are_stored_empty() {
        let registry = ServerRegistry::new();
        let client = MockClient::new()
            .with_tools(&["tool"])
            .with_prompts(&["greeting"])
            .unsupported_lists();
        registry.register("toolsonly", client, None).await.unwrap();

        assert_eq!(registry.all_tools().await.len(), 1);
        assert!(registry.all_prompts().await.is_empty());
        assert!(registry.all_resources().await.is_empty());
    }

    #[tokio::test]
    async fn deregister_closes_client_and_removes_names() {
        let registry = ServerRegistry::new();
        let client = MockClient::new().with_tools(&["search"]);
        registry.register("web", client.clone(), None).await.unwrap();

        registry.deregister("web").await.unwrap();
        assert!(client.closed());
        assert!(!registry.contains("web").await);
        assert!(registry.all_tools().await.is_empty());
        assert!(
            registry
                .tracker()
                .resolve(CapabilityKind::Tool, "search")
                .is_none()
        );

        let err = registry.deregister("web").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn collision_prefixes_appear_and_disappear() {
        let registry = ServerRegistry::new();
        registry
            .register(
                "a",
                MockClient::new().with_tools(&["read_file", "search"]),
                None,
            )
            .await
            .unwrap();
        registry
            .register(
                "b",
                MockClient::new().with_tools(&["search", "analyze"]),
                None,
            )
            .await
            .unwrap();

        let names: Vec<String> = registry
            .all_tools()
            .await
            .into_iter()
            .map(|t| t.exposed_name)
            .collect();
        assert_eq!(names, vec!["a.search", "analyze", "b.search", "read_file"]);

        registry.deregister("a").await.unwrap();
        let names: Vec<String> = registry
            .all_tools()
            .await
            .into_iter()
            .map(|t| t.exposed_name)
            .collect();
        assert_eq!(names, vec!["analyze", "search"]);
    }

    #[tokio::test]
    async fn disconnected_entries_leave_the_union_views() {
        let registry = ServerRegistry::new();
        registry
            .register("a", MockClient::new().with_tools(&["one"]), None)
            .await
            .unwrap();
        registry
            .register("b", MockClient::new().with_tools(&["two"]), None)
            .await
            .unwrap();

        registry.set_connected("a", false).await.unwrap();
        let names: Vec<String> = registry
            .all_tools()
            .await
            .into_iter()
            .map(|t| t.exposed_name)
            .collect();
        assert_eq!(names, vec!["two"]);

        registry.set_connected("a", true).await.unwrap();
        assert_eq!(registry.all_tools().await.len(), 2);
    }

    #[tokio::test]
    async fn update_signal_coalesces_but_keeps_last_mutation() {
        let registry = ServerRegistry::new();
        let mut rx = registry.subscribe_updates();
        let seen = *rx.borrow_and_update();

        registry
            .register("a", MockClient::new().with_tools(&["one"]), None)
            .await
            .unwrap();
        registry
            .register("b", MockClient::new().with_tools(&["two"]), None)
            .await
            .unwrap();
        let last = registry.deregister("a").await.unwrap();

        // Three mutations happened; the receiver wakes at least once and
        // observes the final version.
        rx.changed().await.unwrap();
        let observed = *rx.borrow_and_update();
        assert!(observed > seen);
        assert_eq!(observed, last);
    }

    #[tokio::test]
    async fn refresh_snapshot_picks_up_new_tools() {
        let registry = ServerRegistry::new();
        let client = MockClient::new().with_tools(&["old"]);
        registry.register("c", client.clone(), None).await.unwrap();

        client.set_tools(&["new_a", "new_b"]);
        registry.refresh_snapshot("c").await.unwrap();

        let names: Vec<String> = registry
            .all_tools()
            .await
            .into_iter()
            .map(|t| t.exposed_name)
            .collect();
        assert_eq!(names, vec!["new_a", "new_b"]);
    }

    #[tokio::test]
    async fn tool_prefix_is_carried_into_the_tracker() {
        let registry = ServerRegistry::new();
        registry
            .register(
                "k8s",
                MockClient::new().with_tools(&["get"]),
                Some("kube".to_string()),
            )
            .await
            .unwrap();

        let tools = registry.all_tools().await;
        assert_eq!(tools[0].exposed_name, "kube_get");
        assert_eq!(tools[0].spec.name, "get");
    }
}
