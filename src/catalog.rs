//! The published catalog behind the front-end MCP server.
//!
//! Single writer (the reconciler), lock-free concurrent readers (request
//! handlers). Connected sessions are tracked so `list_changed`
//! notifications reach every client; peers that fail to receive one are
//! pruned.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rmcp::model::{Prompt, Resource, Tool};
use rmcp::service::{Peer, RoleServer};
use tracing::debug;

/// Exposed tools, prompts, and resources, keyed by exposed name / URI.
#[derive(Default)]
pub struct PublishedCatalog {
    tools: DashMap<String, Tool>,
    prompts: DashMap<String, Prompt>,
    resources: DashMap<String, Resource>,
    peers: RwLock<HashMap<u64, Peer<RoleServer>>>,
    peer_seq: AtomicU64,
}

impl PublishedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tools(&self, tools: Vec<Tool>) -> usize {
        let count = tools.len();
        for tool in tools {
            self.tools.insert(tool.name.to_string(), tool);
        }
        count
    }

    pub fn delete_tools(&self, names: &[String]) -> usize {
        names
            .iter()
            .filter(|name| self.tools.remove(name.as_str()).is_some())
            .count()
    }

    pub fn add_prompts(&self, prompts: Vec<Prompt>) -> usize {
        let count = prompts.len();
        for prompt in prompts {
            self.prompts.insert(prompt.name.clone(), prompt);
        }
        count
    }

    pub fn delete_prompts(&self, names: &[String]) -> usize {
        names
            .iter()
            .filter(|name| self.prompts.remove(name.as_str()).is_some())
            .count()
    }

    // The MCP surface has no batch primitive for resources; the reconciler
    // feeds them one at a time.
    pub fn add_resource(&self, resource: Resource) {
        self.resources.insert(resource.raw.uri.clone(), resource);
    }

    pub fn remove_resource(&self, uri: &str) -> bool {
        self.resources.remove(uri).is_some()
    }

    pub fn tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.iter().map(|r| r.value().clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = self.prompts.iter().map(|r| r.value().clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub fn resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> =
            self.resources.iter().map(|r| r.value().clone()).collect();
        resources.sort_by(|a, b| a.raw.uri.cmp(&b.raw.uri));
        resources
    }

    pub fn tool_names(&self) -> HashSet<String> {
        self.tools.iter().map(|r| r.key().clone()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Track a connected session for notifications. Returns a handle used
    /// to forget it.
    pub fn observe_peer(&self, peer: Peer<RoleServer>) -> u64 {
        let id = self.peer_seq.fetch_add(1, Ordering::Relaxed);
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, peer);
        id
    }

    pub fn forget_peer(&self, id: u64) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn peers_snapshot(&self) -> Vec<(u64, Peer<RoleServer>)> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    fn prune(&self, dead: Vec<u64>) {
        if dead.is_empty() {
            return;
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        for id in dead {
            peers.remove(&id);
        }
    }

    pub async fn notify_tools_changed(&self) {
        let mut dead = Vec::new();
        for (id, peer) in self.peers_snapshot() {
            if let Err(e) = peer.notify_tool_list_changed().await {
                debug!(peer = id, error = %e, "failed to send tools list_changed");
                dead.push(id);
            }
        }
        self.prune(dead);
    }

    pub async fn notify_prompts_changed(&self) {
        let mut dead = Vec::new();
        for (id, peer) in self.peers_snapshot() {
            if let Err(e) = peer.notify_prompt_list_changed().await {
                debug!(peer = id, error = %e, "failed to send prompts list_changed");
                dead.push(id);
            }
        }
        self.prune(dead);
    }

    pub async fn notify_resources_changed(&self) {
        let mut dead = Vec::new();
        for (id, peer) in self.peers_snapshot() {
            if let Err(e) = peer.notify_resource_list_changed().await {
                debug!(peer = id, error = %e, "failed to send resources list_changed");
                dead.push(id);
            }
        }
        self.prune(dead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string().into(),
            title: None,
            description: Some(format!("{name} tool").into()),
            input_schema: Arc::new(serde_json::Map::new()),
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        }
    }

    #[test]
    fn add_and_delete_tools() {
        let catalog = PublishedCatalog::new();
        assert_eq!(catalog.add_tools(vec![tool("b"), tool("a")]), 2);
        assert!(catalog.has_tool("a"));

        let names: Vec<String> = catalog.tools().iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let removed = catalog.delete_tools(&["a".to_string(), "missing".to_string()]);
        assert_eq!(removed, 1);
        assert!(!catalog.has_tool("a"));
        assert_eq!(catalog.tool_count(), 1);
    }

    #[test]
    fn reinsertion_overwrites() {
        let catalog = PublishedCatalog::new();
        catalog.add_tools(vec![tool("same")]);
        let mut updated = tool("same");
        updated.description = Some("updated".into());
        catalog.add_tools(vec![updated]);

        assert_eq!(catalog.tool_count(), 1);
        assert_eq!(
            catalog.tools()[0].description.as_deref(),
            Some("updated")
        );
    }

    #[test]
    fn resources_are_keyed_by_uri() {
        use rmcp::model::RawResource;
        let catalog = PublishedCatalog::new();
        catalog.add_resource(Resource {
            raw: RawResource {
                uri: "file:///a.txt".to_string(),
                name: "a".to_string(),
                title: None,
                description: None,
                mime_type: Some("text/plain".to_string()),
                size: None,
                icons: None,
                meta: None,
            },
            annotations: None,
        });
        assert_eq!(catalog.resource_count(), 1);
        assert!(catalog.remove_resource("file:///a.txt"));
        assert!(!catalog.remove_resource("file:///a.txt"));
        assert_eq!(catalog.resource_count(), 0);
    }
}
