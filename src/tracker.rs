//! Conflict-free exposed-name computation.
//!
//! The tracker owns the mapping between the names backends advertise and the
//! names front-end clients see. An identifier owned by exactly one connected
//! backend is exposed as-is; an identifier shared by several backends is
//! exposed as `<backend>.<identifier>` for every one of them, and the bare
//! form disappears. Tools, prompts, and resources each have an independent
//! keyspace (resources are keyed by URI).

use std::collections::HashMap;
use std::sync::RwLock;

/// Which capability keyspace a mapping lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

/// Resolution of an exposed name back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMapping {
    pub backend: String,
    /// The backend-local identifier to use when forwarding.
    pub original: String,
    pub kind: CapabilityKind,
}

/// The capability surface of one connected backend, as the registry sees it.
#[derive(Debug, Clone, Default)]
pub struct EntryCapabilities {
    pub backend: String,
    /// Unconditional per-backend tool prefix, applied as `<prefix>_<name>`
    /// before collision analysis.
    pub tool_prefix: Option<String>,
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resource_uris: Vec<String>,
}

/// The name a backend tool participates in collision analysis under.
pub fn advertised_tool_name(tool_prefix: Option<&str>, original: &str) -> String {
    match tool_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}_{original}"),
        _ => original.to_string(),
    }
}

#[derive(Debug, Default)]
struct KindIndex {
    /// exposed name -> owner
    by_exposed: HashMap<String, NameMapping>,
    /// (backend, original) -> exposed name
    by_owner: HashMap<(String, String), String>,
}

impl KindIndex {
    fn rebuild(&mut self, kind: CapabilityKind, advertised: &[(String, String, String)]) {
        self.by_exposed.clear();
        self.by_owner.clear();

        // Inverted index: advertised name -> owners.
        let mut owners: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for (name, backend, original) in advertised {
            owners
                .entry(name.as_str())
                .or_default()
                .push((backend.as_str(), original.as_str()));
        }

        for (name, list) in owners {
            if list.len() == 1 {
                let (backend, original) = list[0];
                self.insert(kind, name.to_string(), backend, original);
            } else {
                // Every conflicting backend gets a prefixed form; the bare
                // form is not published at all.
                for (backend, original) in list {
                    self.insert(kind, format!("{backend}.{name}"), backend, original);
                }
            }
        }
    }

    fn insert(&mut self, kind: CapabilityKind, exposed: String, backend: &str, original: &str) {
        self.by_owner
            .insert((backend.to_string(), original.to_string()), exposed.clone());
        self.by_exposed.insert(
            exposed,
            NameMapping {
                backend: backend.to_string(),
                original: original.to_string(),
                kind,
            },
        );
    }
}

#[derive(Debug, Default)]
struct Indexes {
    tools: KindIndex,
    prompts: KindIndex,
    resources: KindIndex,
}

/// Tracks exposed names for the current set of connected backends.
///
/// `rebuild` is invoked by the registry while it holds its own write lock,
/// so the tracker is always consistent with the registry at the moment
/// `rebuild` returns.
#[derive(Debug, Default)]
pub struct NameTracker {
    inner: RwLock<Indexes>,
}

impl NameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute every index from scratch for the given connected entries.
    pub fn rebuild(&self, entries: &[EntryCapabilities]) {
        let mut tools = Vec::new();
        let mut prompts = Vec::new();
        let mut resources = Vec::new();

        for entry in entries {
            for tool in &entry.tools {
                tools.push((
                    advertised_tool_name(entry.tool_prefix.as_deref(), tool),
                    entry.backend.clone(),
                    tool.clone(),
                ));
            }
            for prompt in &entry.prompts {
                prompts.push((prompt.clone(), entry.backend.clone(), prompt.clone()));
            }
            for uri in &entry.resource_uris {
                resources.push((uri.clone(), entry.backend.clone(), uri.clone()));
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.tools.rebuild(CapabilityKind::Tool, &tools);
        inner.prompts.rebuild(CapabilityKind::Prompt, &prompts);
        inner.resources.rebuild(CapabilityKind::Resource, &resources);
    }

    /// Drop all mappings (registry emptied).
    pub fn clear(&self) {
        self.rebuild(&[]);
    }

    pub fn exposed_tool_name(&self, backend: &str, original: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .tools
            .by_owner
            .get(&(backend.to_string(), original.to_string()))
            .cloned()
    }

    pub fn exposed_prompt_name(&self, backend: &str, original: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .prompts
            .by_owner
            .get(&(backend.to_string(), original.to_string()))
            .cloned()
    }

    pub fn exposed_resource_uri(&self, backend: &str, uri: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .resources
            .by_owner
            .get(&(backend.to_string(), uri.to_string()))
            .cloned()
    }

    /// Resolve an exposed name within one keyspace.
    pub fn resolve(&self, kind: CapabilityKind, exposed: &str) -> Option<NameMapping> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let index = match kind {
            CapabilityKind::Tool => &inner.tools,
            CapabilityKind::Prompt => &inner.prompts,
            CapabilityKind::Resource => &inner.resources,
        };
        index.by_exposed.get(exposed).cloned()
    }

    /// All exposed names currently mapped in one keyspace.
    pub fn exposed_names(&self, kind: CapabilityKind) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let index = match kind {
            CapabilityKind::Tool => &inner.tools,
            CapabilityKind::Prompt => &inner.prompts,
            CapabilityKind::Resource => &inner.resources,
        };
        index.by_exposed.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(backend: &str, tools: &[&str]) -> EntryCapabilities {
        EntryCapabilities {
            backend: backend.to_string(),
            tool_prefix: None,
            tools: tools.iter().map(|s| s.to_string()).collect(),
            prompts: Vec::new(),
            resource_uris: Vec::new(),
        }
    }

    #[test]
    fn unique_names_stay_bare() {
        let tracker = NameTracker::new();
        tracker.rebuild(&[
            entry("files", &["read_file", "write_file"]),
            entry("web", &["search", "analyze"]),
        ]);

        assert_eq!(
            tracker.exposed_tool_name("files", "read_file").as_deref(),
            Some("read_file")
        );
        assert_eq!(
            tracker.exposed_tool_name("web", "search").as_deref(),
            Some("search")
        );

        let mapping = tracker.resolve(CapabilityKind::Tool, "analyze").unwrap();
        assert_eq!(mapping.backend, "web");
        assert_eq!(mapping.original, "analyze");
        assert_eq!(mapping.kind, CapabilityKind::Tool);
    }

    #[test]
    fn collisions_prefix_every_owner_and_remove_bare_form() {
        let tracker = NameTracker::new();
        tracker.rebuild(&[
            entry("a", &["read_file", "search"]),
            entry("b", &["search", "analyze"]),
        ]);

        assert_eq!(
            tracker.exposed_tool_name("a", "search").as_deref(),
            Some("a.search")
        );
        assert_eq!(
            tracker.exposed_tool_name("b", "search").as_deref(),
            Some("b.search")
        );
        assert!(tracker.resolve(CapabilityKind::Tool, "search").is_none());

        let mapping = tracker.resolve(CapabilityKind::Tool, "a.search").unwrap();
        assert_eq!(mapping.original, "search");
        assert_eq!(mapping.backend, "a");
    }

    #[test]
    fn rebuild_restores_bare_name_after_owner_leaves() {
        let tracker = NameTracker::new();
        tracker.rebuild(&[
            entry("a", &["read_file", "search"]),
            entry("b", &["search", "analyze"]),
        ]);
        assert!(tracker.resolve(CapabilityKind::Tool, "search").is_none());

        tracker.rebuild(&[entry("b", &["search", "analyze"])]);
        let mapping = tracker.resolve(CapabilityKind::Tool, "search").unwrap();
        assert_eq!(mapping.backend, "b");
        assert!(tracker.resolve(CapabilityKind::Tool, "b.search").is_none());
        assert!(tracker.resolve(CapabilityKind::Tool, "a.search").is_none());
    }

    #[test]
    fn tool_prefix_applies_before_collision_analysis() {
        let tracker = NameTracker::new();
        let mut prefixed = entry("k8s", &["get"]);
        prefixed.tool_prefix = Some("kube".to_string());
        tracker.rebuild(&[prefixed, entry("other", &["get"])]);

        // "kube_get" and "get" do not collide; both stay bare.
        assert_eq!(
            tracker.exposed_tool_name("k8s", "get").as_deref(),
            Some("kube_get")
        );
        assert_eq!(
            tracker.exposed_tool_name("other", "get").as_deref(),
            Some("get")
        );
        // Resolution of the prefixed form yields the true original.
        let mapping = tracker.resolve(CapabilityKind::Tool, "kube_get").unwrap();
        assert_eq!(mapping.original, "get");
        assert_eq!(mapping.backend, "k8s");
    }

    #[test]
    fn tool_prefix_participates_in_collisions_under_prefixed_name() {
        let tracker = NameTracker::new();
        let mut a = entry("a", &["status"]);
        a.tool_prefix = Some("sys".to_string());
        let mut b = entry("b", &["sys_status"]);
        b.tool_prefix = None;
        tracker.rebuild(&[a, b]);

        // a advertises "sys_status" via its prefix, b natively: collision.
        assert_eq!(
            tracker.exposed_tool_name("a", "status").as_deref(),
            Some("a.sys_status")
        );
        assert_eq!(
            tracker.exposed_tool_name("b", "sys_status").as_deref(),
            Some("b.sys_status")
        );
        assert!(tracker.resolve(CapabilityKind::Tool, "sys_status").is_none());
    }

    #[test]
    fn kinds_have_independent_keyspaces() {
        let tracker = NameTracker::new();
        let mut e = entry("only", &["report"]);
        e.prompts = vec!["report".to_string()];
        tracker.rebuild(&[e]);

        // Same identifier under two kinds: both published bare.
        assert!(tracker.resolve(CapabilityKind::Tool, "report").is_some());
        assert!(tracker.resolve(CapabilityKind::Prompt, "report").is_some());
        assert!(tracker.resolve(CapabilityKind::Resource, "report").is_none());
    }

    #[test]
    fn resource_uris_follow_the_same_policy() {
        let tracker = NameTracker::new();
        let mut a = entry("a", &[]);
        a.resource_uris = vec!["file:///tmp/shared.txt".to_string()];
        let mut b = entry("b", &[]);
        b.resource_uris = vec![
            "file:///tmp/shared.txt".to_string(),
            "file:///tmp/own.txt".to_string(),
        ];
        tracker.rebuild(&[a, b]);

        assert_eq!(
            tracker
                .exposed_resource_uri("a", "file:///tmp/shared.txt")
                .as_deref(),
            Some("a.file:///tmp/shared.txt")
        );
        assert_eq!(
            tracker
                .exposed_resource_uri("b", "file:///tmp/own.txt")
                .as_deref(),
            Some("file:///tmp/own.txt")
        );
        assert!(
            tracker
                .resolve(CapabilityKind::Resource, "file:///tmp/shared.txt")
                .is_none()
        );
    }

    #[test]
    fn clear_drops_everything() {
        let tracker = NameTracker::new();
        tracker.rebuild(&[entry("a", &["one"])]);
        assert!(tracker.resolve(CapabilityKind::Tool, "one").is_some());
        tracker.clear();
        assert!(tracker.resolve(CapabilityKind::Tool, "one").is_none());
        assert!(tracker.exposed_names(CapabilityKind::Tool).is_empty());
    }
}
