pub mod rmcp;

use async_trait::async_trait;
use ::rmcp::model::{CallToolResult, GetPromptResult, JsonObject, ReadResourceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A tool advertised by a backend. The input schema is an opaque
/// JSON-Schema-like map and is passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

/// A prompt argument as advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptArgumentSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

/// A prompt advertised by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Option<Vec<PromptArgumentSpec>>,
}

/// A resource advertised by a backend, keyed by URI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Errors produced by backend client operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// I/O-level failure talking to the backend.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The backend answered, but not with what the protocol requires.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// The backend does not implement this capability (e.g. a tools-only
    /// server asked for resources). Callers treat this as an empty list.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackendError::Unsupported(_))
    }
}

/// The capability set every backend MCP source must provide.
///
/// Implementations own their transport and their retries; the aggregator
/// never retries across this boundary. `list_resources` and `list_prompts`
/// may fail with [`BackendError::Unsupported`] without being fatal; the
/// corresponding snapshot is stored empty.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Complete the protocol handshake. Must be called before any other
    /// operation; a failure here aborts registration.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Release the connection. Errors are logged by callers, never fatal.
    async fn close(&self) -> Result<(), BackendError>;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError>;

    async fn list_resources(&self) -> Result<Vec<ResourceSpec>, BackendError>;

    async fn list_prompts(&self) -> Result<Vec<PromptSpec>, BackendError>;

    /// Invoke a tool by its backend-local name. The result is returned
    /// verbatim, including `is_error` outcomes.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, BackendError>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, BackendError>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, BackendError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), BackendError>;
}
