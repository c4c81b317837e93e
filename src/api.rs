//! Aggregator-owned API tools.
//!
//! A static handler table for introspection and control of the aggregator
//! itself: backend inventory, per-backend detail, and a manual catalog
//! refresh. Published under the configured aggregator prefix.

use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use rmcp::model::{CallToolResult, Content, JsonObject};
use serde_json::{Value, json};

use crate::backend::ToolSpec;
use crate::registry::ServerRegistry;

pub const LIST_BACKENDS: &str = "list_backends";
pub const DESCRIBE_BACKEND: &str = "describe_backend";
pub const REFRESH_CATALOG: &str = "refresh_catalog";

pub const API_TOOLS: &[&str] = &[LIST_BACKENDS, DESCRIBE_BACKEND, REFRESH_CATALOG];

pub fn is_api_tool(name: &str) -> bool {
    API_TOOLS.contains(&name)
}

/// Hook invoked by `refresh_catalog`; returns how many backends were synced.
pub type RefreshHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<usize>> + Send + Sync>;

/// Tool descriptors for publication (prefix applied by the reconciler).
pub fn api_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: LIST_BACKENDS.to_string(),
            description: "List registered backends with their capability counts".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: DESCRIBE_BACKEND.to_string(),
            description: "Describe one backend: connectivity and exposed capabilities"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Backend name"}
                },
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: REFRESH_CATALOG.to_string(),
            description: "Re-sync backends from the service registry on demand".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// The API tool handlers, bound to the registry and (late) a refresh hook.
pub struct ApiTools {
    registry: Arc<ServerRegistry>,
    refresh_hook: RwLock<Option<RefreshHook>>,
}

impl ApiTools {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            refresh_hook: RwLock::new(None),
        }
    }

    /// Installed by the manager once it exists; the registry alone cannot
    /// perform an initial-sync recomputation.
    pub fn set_refresh_hook(&self, hook: RefreshHook) {
        *self.refresh_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub async fn handle(&self, tool: &str, args: Option<JsonObject>) -> CallToolResult {
        match tool {
            LIST_BACKENDS => self.handle_list_backends().await,
            DESCRIBE_BACKEND => self.handle_describe_backend(args).await,
            REFRESH_CATALOG => self.handle_refresh().await,
            other => error_text(format!("unknown API tool '{other}'")),
        }
    }

    async fn handle_list_backends(&self) -> CallToolResult {
        let entries = self.registry.snapshot_all_entries().await;
        let mut backends = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let snapshot = entry.snapshot().await;
            backends.push(json!({
                "name": name,
                "connected": snapshot.connected,
                "tools": snapshot.tools.len(),
                "resources": snapshot.resources.len(),
                "prompts": snapshot.prompts.len(),
                "tool_prefix": entry.tool_prefix(),
            }));
        }
        backends.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["name"].as_str().unwrap_or_default())
        });
        json_result(&json!({"backends": backends}))
    }

    async fn handle_describe_backend(&self, args: Option<JsonObject>) -> CallToolResult {
        let Some(name) = args
            .as_ref()
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
        else {
            return error_text("missing required argument 'name'".to_string());
        };

        let Some(entry) = self.registry.get_entry(name).await else {
            return error_text(format!("backend '{name}' is not registered"));
        };

        let snapshot = entry.snapshot().await;
        let tracker = self.registry.tracker();
        let tools: Vec<Value> = snapshot
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "exposed_as": tracker.exposed_tool_name(name, &tool.name),
                })
            })
            .collect();

        json_result(&json!({
            "name": name,
            "connected": snapshot.connected,
            "tool_prefix": entry.tool_prefix(),
            "tools": tools,
            "resources": snapshot.resources.iter().map(|r| r.uri.clone()).collect::<Vec<_>>(),
            "prompts": snapshot.prompts.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
        }))
    }

    async fn handle_refresh(&self) -> CallToolResult {
        let hook = self
            .refresh_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match hook {
            Some(hook) => match hook().await {
                Ok(synced) => json_result(&json!({"synced": synced})),
                Err(e) => error_text(format!("refresh failed: {e}")),
            },
            None => error_text("refresh is not available".to_string()),
        }
    }
}

fn json_result(value: &Value) -> CallToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(e) => error_text(e.to_string()),
    }
}

fn error_text(text: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text)])
}
