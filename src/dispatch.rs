//! The front-end's single polymorphic dispatcher.
//!
//! Every incoming invocation funnels through here. Backend-owned names
//! resolve through the name tracker; aggregator-owned names (workflow
//! actions, workflow management, API tools) route by stripping the
//! configured prefix and consulting static tables. Resolution failures and
//! disconnected backends surface as MCP tool errors, never as crashes.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolResult, Content, GetPromptResult, JsonObject, ReadResourceResult};
use tracing::debug;

use crate::api::{ApiTools, is_api_tool};
use crate::catalog::PublishedCatalog;
use crate::registry::ServerRegistry;
use crate::tracker::{CapabilityKind, NameTracker};
use crate::workflow::executor::{InternalToolInvoker, WorkflowExecutor};
use crate::workflow::manage;

/// Marker prefix for workflow action tools, applied after the aggregator
/// prefix: `<prefix>_action_<workflow>`.
pub const ACTION_PREFIX: &str = "action_";

pub struct Dispatcher {
    registry: Arc<ServerRegistry>,
    tracker: Arc<NameTracker>,
    catalog: Arc<PublishedCatalog>,
    workflows: Option<Arc<WorkflowExecutor>>,
    api: Arc<ApiTools>,
    prefix: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServerRegistry>,
        catalog: Arc<PublishedCatalog>,
        workflows: Option<Arc<WorkflowExecutor>>,
        api: Arc<ApiTools>,
        prefix: String,
    ) -> Self {
        let tracker = registry.tracker();
        Self {
            registry,
            tracker,
            catalog,
            workflows,
            api,
            prefix,
        }
    }

    pub fn catalog(&self) -> &Arc<PublishedCatalog> {
        &self.catalog
    }

    /// Strip the aggregator prefix, if present.
    fn strip_prefix<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('_'))
    }

    /// Route a tool invocation by exposed name. All failures come back as
    /// `is_error` tool results so a single bad request never takes down the
    /// server.
    pub async fn dispatch_tool(&self, exposed: &str, args: Option<JsonObject>) -> CallToolResult {
        // Backend-owned names first; the tracker is authoritative for
        // everything the reconciler published from snapshots.
        if let Some(mapping) = self.tracker.resolve(CapabilityKind::Tool, exposed) {
            return self
                .call_backend_tool(&mapping.backend, &mapping.original, args)
                .await;
        }

        // Aggregator-owned names carry the configured prefix.
        if let Some(rest) = self.strip_prefix(exposed) {
            if let Some(workflow) = rest.strip_prefix(ACTION_PREFIX) {
                return self.run_workflow(workflow, args).await;
            }
            if manage::is_management_tool(rest) {
                if let Some(executor) = &self.workflows {
                    return manage::handle(executor.store(), rest, args).await;
                }
                return error_result(
                    "workflow management is disabled (no config directory)".to_string(),
                );
            }
            if is_api_tool(rest) {
                return self.api.handle(rest, args).await;
            }
        }

        debug!(tool = %exposed, "tool resolution failed");
        error_result(format!("tool '{exposed}' is no longer available"))
    }

    async fn call_backend_tool(
        &self,
        backend: &str,
        original: &str,
        args: Option<JsonObject>,
    ) -> CallToolResult {
        let Some(entry) = self.registry.get_entry(backend).await else {
            return error_result(format!("server '{backend}' not available"));
        };
        if !entry.is_connected().await {
            return error_result(format!("server '{backend}' not available"));
        }

        match entry.client().call_tool(original, args).await {
            Ok(result) => result,
            Err(e) => error_result(format!(
                "tool '{original}' on server '{backend}' failed: {e}"
            )),
        }
    }

    async fn run_workflow(&self, workflow: &str, args: Option<JsonObject>) -> CallToolResult {
        let Some(executor) = &self.workflows else {
            return error_result("workflows are disabled (no config directory)".to_string());
        };
        match executor.run(workflow, args, self).await {
            Ok(result) => result,
            Err(e) => error_result(format!("workflow '{workflow}' failed: {e}")),
        }
    }

    /// Route a prompt request by exposed name.
    pub async fn dispatch_prompt(
        &self,
        exposed: &str,
        args: Option<JsonObject>,
    ) -> Result<GetPromptResult, McpError> {
        let Some(mapping) = self.tracker.resolve(CapabilityKind::Prompt, exposed) else {
            return Err(McpError::invalid_params(
                format!("Unknown prompt: {exposed}"),
                None,
            ));
        };

        let entry = self
            .registry
            .get_entry(&mapping.backend)
            .await
            .ok_or_else(|| {
                McpError::internal_error(
                    format!("server '{}' not available", mapping.backend),
                    None,
                )
            })?;
        if !entry.is_connected().await {
            return Err(McpError::internal_error(
                format!("server '{}' not available", mapping.backend),
                None,
            ));
        }

        entry
            .client()
            .get_prompt(&mapping.original, args)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }

    /// Route a resource read by exposed URI.
    pub async fn dispatch_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let Some(mapping) = self.tracker.resolve(CapabilityKind::Resource, uri) else {
            return Err(McpError::invalid_params(
                format!("Unknown resource: {uri}"),
                None,
            ));
        };

        let entry = self
            .registry
            .get_entry(&mapping.backend)
            .await
            .ok_or_else(|| {
                McpError::internal_error(
                    format!("server '{}' not available", mapping.backend),
                    None,
                )
            })?;
        if !entry.is_connected().await {
            return Err(McpError::internal_error(
                format!("server '{}' not available", mapping.backend),
                None,
            ));
        }

        entry
            .client()
            .read_resource(&mapping.original)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))
    }
}

/// Workflow steps dispatch through the same routing as external clients.
#[async_trait]
impl InternalToolInvoker for Dispatcher {
    fn has_tool(&self, name: &str) -> bool {
        self.catalog.has_tool(name)
    }

    async fn call_tool_internal(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> anyhow::Result<CallToolResult> {
        Ok(self.dispatch_tool(name, arguments).await)
    }
}

fn error_result(message: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockClient, first_text};
    use serde_json::json;

    fn dispatcher(registry: Arc<ServerRegistry>) -> Dispatcher {
        let catalog = Arc::new(PublishedCatalog::new());
        let api = Arc::new(ApiTools::new(Arc::clone(&registry)));
        Dispatcher::new(registry, catalog, None, api, "x".to_string())
    }

    #[tokio::test]
    async fn routes_to_owning_backend_with_original_name() {
        let registry = ServerRegistry::new();
        let a = MockClient::new().with_tools(&["search"]);
        let b = MockClient::new().with_tools(&["search"]);
        registry.register("a", a.clone(), None).await.unwrap();
        registry.register("b", b.clone(), None).await.unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        let result = dispatcher
            .dispatch_tool("a.search", json!({"q": "rust"}).as_object().cloned())
            .await;
        assert_ne!(result.is_error, Some(true));

        // The owning backend got the un-prefixed original name.
        let calls = a.call_log();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "search");
        assert!(b.call_log().is_empty());
    }

    #[tokio::test]
    async fn removed_names_report_no_longer_available() {
        let registry = ServerRegistry::new();
        registry
            .register("web", MockClient::new().with_tools(&["search"]), None)
            .await
            .unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        registry.deregister("web").await.unwrap();
        let result = dispatcher.dispatch_tool("search", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(
            first_text(&result)
                .unwrap()
                .contains("no longer available")
        );
    }

    #[tokio::test]
    async fn disconnected_backend_name_stops_resolving() {
        let registry = ServerRegistry::new();
        registry
            .register("web", MockClient::new().with_tools(&["search"]), None)
            .await
            .unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        // The connectivity flip rebuilds the tracker, so the exposed name
        // is already gone by the time a call arrives.
        let entry = registry.get_entry("web").await.unwrap();
        registry.set_connected("web", false).await.unwrap();
        assert!(!entry.is_connected().await);

        let result = dispatcher.dispatch_tool("search", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(
            first_text(&result)
                .unwrap()
                .contains("no longer available")
        );
    }

    #[tokio::test]
    async fn prefixed_api_tools_route_to_the_static_table() {
        let registry = ServerRegistry::new();
        registry
            .register("files", MockClient::new().with_tools(&["read_file"]), None)
            .await
            .unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        let result = dispatcher.dispatch_tool("x_list_backends", None).await;
        assert_ne!(result.is_error, Some(true));
        let payload: serde_json::Value =
            serde_json::from_str(&first_text(&result).unwrap()).unwrap();
        assert_eq!(payload["backends"][0]["name"], "files");
    }

    #[tokio::test]
    async fn management_tools_require_workflows_enabled() {
        let registry = ServerRegistry::new();
        let dispatcher = dispatcher(registry);
        let result = dispatcher.dispatch_tool("x_workflow_list", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(first_text(&result).unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn backend_names_shadow_prefix_lookalikes() {
        // A backend may legitimately advertise a tool that starts with the
        // aggregator prefix; tracker resolution wins.
        let registry = ServerRegistry::new();
        let client = MockClient::new().with_tools(&["x_list_backends"]);
        registry.register("odd", client.clone(), None).await.unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        let result = dispatcher.dispatch_tool("x_list_backends", None).await;
        assert_ne!(result.is_error, Some(true));
        assert_eq!(client.call_log().len(), 1);
    }

    #[tokio::test]
    async fn prompt_and_resource_dispatch() {
        let registry = ServerRegistry::new();
        let client = MockClient::new()
            .with_tools(&["t"])
            .with_prompts(&["greeting"])
            .with_resources(&[("file:///data.txt", "data")]);
        registry.register("p", client, None).await.unwrap();
        let dispatcher = dispatcher(Arc::clone(&registry));

        let prompt = dispatcher.dispatch_prompt("greeting", None).await.unwrap();
        assert_eq!(prompt.description.as_deref(), Some("greeting prompt"));

        let resource = dispatcher
            .dispatch_resource("file:///data.txt")
            .await
            .unwrap();
        assert_eq!(resource.contents.len(), 1);

        assert!(dispatcher.dispatch_prompt("nope", None).await.is_err());
        assert!(dispatcher.dispatch_resource("file:///nope").await.is_err());
    }
}
