//! Adapter from an rmcp client session to the [`BackendClient`] contract.
//!
//! Process/transport management stays with whoever constructed the session;
//! this type only speaks the protocol. The handshake has already happened by
//! the time a `RunningService` exists, so `initialize` is a readiness check.

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, JsonObject,
    ReadResourceRequestParams, ReadResourceResult,
};
use rmcp::service::RunningService;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    BackendClient, BackendError, PromptArgumentSpec, PromptSpec, ResourceSpec, ToolSpec,
};

/// A backend speaking MCP through an rmcp client session.
pub struct RmcpBackend {
    name: String,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
}

impl RmcpBackend {
    pub fn new(name: impl Into<String>, service: RunningService<rmcp::RoleClient, ()>) -> Self {
        Self {
            name: name.into(),
            service: RwLock::new(Some(service)),
        }
    }

    fn transport_err(&self, op: &str, err: impl std::fmt::Display) -> BackendError {
        BackendError::Transport(format!("{op} on backend '{}' failed: {err}", self.name))
    }

    fn map_list_err(&self, kind: &'static str, err: impl std::fmt::Display) -> BackendError {
        let text = err.to_string();
        // Servers without a capability answer method-not-found (-32601).
        if text.contains("-32601") || text.to_ascii_lowercase().contains("method not found") {
            BackendError::Unsupported(kind)
        } else {
            self.transport_err(kind, text)
        }
    }
}

#[async_trait]
impl BackendClient for RmcpBackend {
    async fn initialize(&self) -> Result<(), BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;
        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP session ready"
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if let Some(service) = self.service.write().await.take() {
            service
                .cancel()
                .await
                .map_err(|e| self.transport_err("close", e))?;
        }
        debug!(backend = %self.name, "backend session closed");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| self.transport_err("tools/list", e))?;

        Ok(tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name.to_string(),
                description: t.description.unwrap_or_default().to_string(),
                input_schema: Value::Object(t.input_schema.as_ref().clone()),
            })
            .collect())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceSpec>, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        let resources = service
            .list_all_resources()
            .await
            .map_err(|e| self.map_list_err("resources", e))?;

        Ok(resources
            .into_iter()
            .map(|r| ResourceSpec {
                uri: r.raw.uri.clone(),
                name: r.raw.name.clone(),
                description: r.raw.description.clone().unwrap_or_default(),
                mime_type: r.raw.mime_type.clone(),
            })
            .collect())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptSpec>, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        let prompts = service
            .list_all_prompts()
            .await
            .map_err(|e| self.map_list_err("prompts", e))?;

        Ok(prompts
            .into_iter()
            .map(|p| PromptSpec {
                name: p.name.clone(),
                description: p.description.clone().unwrap_or_default(),
                arguments: p.arguments.map(|args| {
                    args.into_iter()
                        .map(|a| PromptArgumentSpec {
                            name: a.name,
                            description: a.description,
                            required: a.required,
                        })
                        .collect()
                }),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        debug!(backend = %self.name, tool = %name, "forwarding tool call");
        service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_string().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| self.transport_err("tools/call", e))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        service
            .read_resource(ReadResourceRequestParams {
                meta: None,
                uri: uri.to_string(),
            })
            .await
            .map_err(|e| self.transport_err("resources/read", e))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, BackendError> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BackendError::Transport(format!("backend '{}' is closed", self.name)))?;

        service
            .get_prompt(GetPromptRequestParams {
                meta: None,
                name: name.to_string(),
                arguments,
            })
            .await
            .map_err(|e| self.transport_err("prompts/get", e))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        // tools/list doubles as a lightweight liveness probe; it verifies the
        // connection without side effects.
        self.list_tools().await.map(|_| ())
    }
}
