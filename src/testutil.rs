//! Test utilities: mock backend clients, recording callbacks, fixtures.
//!
//! Compiled only under `#[cfg(test)]`. The mock client implements
//! [`BackendClient`] directly, so registry, reconciler, and workflow tests
//! run without real MCP connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, JsonObject, PromptMessage, PromptMessageRole,
    ReadResourceResult, ResourceContents,
};

use crate::backend::{
    BackendClient, BackendError, PromptSpec, ResourceSpec, ToolSpec,
};
use crate::events::{RefreshCallback, ServiceHealth, ServiceState};
use crate::manager::{ServiceInfo, ServiceProvider};

pub fn tool_spec(name: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("{name} tool"),
        input_schema: serde_json::json!({"type": "object", "properties": {}}),
    }
}

pub fn prompt_spec(name: &str) -> PromptSpec {
    PromptSpec {
        name: name.to_string(),
        description: format!("{name} prompt"),
        arguments: None,
    }
}

pub fn resource_spec(uri: &str, name: &str) -> ResourceSpec {
    ResourceSpec {
        uri: uri.to_string(),
        name: name.to_string(),
        description: format!("{name} resource"),
        mime_type: Some("text/plain".to_string()),
    }
}

/// A controllable in-process backend.
///
/// Capability sets are mutable (for snapshot-refresh tests), failures are
/// injectable per operation, and every tool call is recorded.
pub struct MockClient {
    tools: Mutex<Vec<ToolSpec>>,
    prompts: Mutex<Vec<PromptSpec>>,
    resources: Mutex<Vec<ResourceSpec>>,
    fail_initialize: AtomicBool,
    fail_list_tools: AtomicBool,
    unsupported_lists: AtomicBool,
    initialized: AtomicBool,
    closed: AtomicBool,
    /// tool name -> canned text response
    responses: Mutex<HashMap<String, String>>,
    /// tool name -> error text (returned as an is_error tool result)
    error_tools: Mutex<HashMap<String, String>>,
    call_log: Mutex<Vec<(String, Option<JsonObject>)>>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            fail_initialize: AtomicBool::new(false),
            fail_list_tools: AtomicBool::new(false),
            unsupported_lists: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            responses: Mutex::new(HashMap::new()),
            error_tools: Mutex::new(HashMap::new()),
            call_log: Mutex::new(Vec::new()),
        })
    }

    pub fn with_tools(self: Arc<Self>, names: &[&str]) -> Arc<Self> {
        *self.tools.lock().unwrap() = names.iter().map(|n| tool_spec(n)).collect();
        self
    }

    pub fn with_prompts(self: Arc<Self>, names: &[&str]) -> Arc<Self> {
        *self.prompts.lock().unwrap() = names.iter().map(|n| prompt_spec(n)).collect();
        self
    }

    pub fn with_resources(self: Arc<Self>, uris: &[(&str, &str)]) -> Arc<Self> {
        *self.resources.lock().unwrap() =
            uris.iter().map(|(uri, name)| resource_spec(uri, name)).collect();
        self
    }

    pub fn fail_initialize(self: Arc<Self>) -> Arc<Self> {
        self.fail_initialize.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_list_tools(self: Arc<Self>) -> Arc<Self> {
        self.fail_list_tools.store(true, Ordering::SeqCst);
        self
    }

    pub fn unsupported_lists(self: Arc<Self>) -> Arc<Self> {
        self.unsupported_lists.store(true, Ordering::SeqCst);
        self
    }

    /// Canned text response for one tool.
    pub fn respond_with(self: Arc<Self>, tool: &str, text: &str) -> Arc<Self> {
        self.responses
            .lock()
            .unwrap()
            .insert(tool.to_string(), text.to_string());
        self
    }

    /// Make one tool return an `is_error` result.
    pub fn error_tool(self: Arc<Self>, tool: &str, message: &str) -> Arc<Self> {
        self.error_tools
            .lock()
            .unwrap()
            .insert(tool.to_string(), message.to_string());
        self
    }

    pub fn set_tools(&self, names: &[&str]) {
        *self.tools.lock().unwrap() = names.iter().map(|n| tool_spec(n)).collect();
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<(String, Option<JsonObject>)> {
        self.call_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendClient for MockClient {
    async fn initialize(&self) -> Result<(), BackendError> {
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("handshake refused".into()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError> {
        if self.fail_list_tools.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("tools/list failed".into()));
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceSpec>, BackendError> {
        if self.unsupported_lists.load(Ordering::SeqCst) {
            return Err(BackendError::Unsupported("resources"));
        }
        Ok(self.resources.lock().unwrap().clone())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptSpec>, BackendError> {
        if self.unsupported_lists.load(Ordering::SeqCst) {
            return Err(BackendError::Unsupported("prompts"));
        }
        Ok(self.prompts.lock().unwrap().clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, BackendError> {
        self.call_log
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));

        if let Some(message) = self.error_tools.lock().unwrap().get(name) {
            return Ok(CallToolResult::error(vec![Content::text(message.clone())]));
        }
        if let Some(text) = self.responses.lock().unwrap().get(name) {
            return Ok(CallToolResult::success(vec![Content::text(text.clone())]));
        }

        // Default: echo the call as JSON.
        let echo = serde_json::json!({
            "tool": name,
            "args": arguments.map(serde_json::Value::Object).unwrap_or_default(),
        });
        Ok(CallToolResult::success(vec![Content::text(echo.to_string())]))
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, BackendError> {
        let known = self
            .resources
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.uri == uri);
        if !known {
            return Err(BackendError::Protocol(format!("unknown resource {uri}")));
        }
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: format!("contents of {uri}"),
                meta: None,
            }],
        })
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, BackendError> {
        let known = self.prompts.lock().unwrap().iter().any(|p| p.name == name);
        if !known {
            return Err(BackendError::Protocol(format!("unknown prompt {name}")));
        }
        Ok(GetPromptResult {
            description: Some(format!("{name} prompt")),
            messages: vec![PromptMessage::new_text(
                PromptMessageRole::Assistant,
                format!("prompt body for {name}"),
            )],
        })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Records register/deregister callback invocations for event-handler tests.
pub struct RecordingCallbacks {
    registered: Arc<Mutex<Vec<String>>>,
    deregistered: Arc<Mutex<Vec<String>>>,
    fail_register: Arc<AtomicBool>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self {
            registered: Arc::new(Mutex::new(Vec::new())),
            deregistered: Arc::new(Mutex::new(Vec::new())),
            fail_register: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_register(self) -> Self {
        self.fail_register.store(true, Ordering::SeqCst);
        self
    }

    pub fn register_cb(&self) -> RefreshCallback {
        let log = Arc::clone(&self.registered);
        let fail = Arc::clone(&self.fail_register);
        Arc::new(move |label: String| -> BoxFuture<'static, anyhow::Result<()>> {
            let log = Arc::clone(&log);
            let fail = Arc::clone(&fail);
            Box::pin(async move {
                log.lock().unwrap().push(label);
                if fail.load(Ordering::SeqCst) {
                    anyhow::bail!("injected register failure");
                }
                Ok(())
            })
        })
    }

    pub fn deregister_cb(&self) -> RefreshCallback {
        let log = Arc::clone(&self.deregistered);
        Arc::new(move |label: String| -> BoxFuture<'static, anyhow::Result<()>> {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(label);
                Ok(())
            })
        })
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().unwrap().clone()
    }
}

/// A [`ServiceProvider`] backed by an in-memory service table.
pub struct StaticProvider {
    services: Mutex<Vec<(ServiceInfo, Option<Arc<MockClient>>)>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn add_service(&self, info: ServiceInfo, client: Arc<MockClient>) {
        self.services.lock().unwrap().push((info, Some(client)));
    }

    /// A Running + Healthy service with a working client.
    pub fn add_running(&self, name: &str, client: Arc<MockClient>) {
        self.add_service(
            ServiceInfo {
                name: name.to_string(),
                state: ServiceState::Running,
                health: ServiceHealth::Healthy,
                tool_prefix: None,
            },
            client,
        );
    }

    /// A Running + Healthy service whose client construction fails.
    pub fn add_running_without_client(&self, name: &str) {
        self.services.lock().unwrap().push((
            ServiceInfo {
                name: name.to_string(),
                state: ServiceState::Running,
                health: ServiceHealth::Healthy,
                tool_prefix: None,
            },
            None,
        ));
    }
}

#[async_trait]
impl ServiceProvider for StaticProvider {
    async fn list_mcp_services(&self) -> Vec<ServiceInfo> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    async fn client_for(&self, name: &str) -> anyhow::Result<Arc<dyn BackendClient>> {
        let services = self.services.lock().unwrap();
        match services.iter().find(|(info, _)| info.name == name) {
            Some((_, Some(client))) => Ok(Arc::clone(client) as Arc<dyn BackendClient>),
            Some((_, None)) => anyhow::bail!("client construction failed for '{name}'"),
            None => anyhow::bail!("unknown service '{name}'"),
        }
    }
}

/// Decode the first text content of a tool result.
pub fn first_text(result: &CallToolResult) -> Option<String> {
    result.content.iter().find_map(|c| {
        if let rmcp::model::RawContent::Text(t) = &c.raw {
            Some(t.text.clone())
        } else {
            None
        }
    })
}
