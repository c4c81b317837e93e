//! The front-end MCP server.
//!
//! Serves the unified tool/resource/prompt surface over HTTP/SSE (`GET /sse`
//! opens the event stream, `POST /message` delivers client messages) and
//! answers every protocol request from the published catalog. The catalog is
//! mutated only by the reconciler; request handlers never write.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::{NotificationContext, RequestContext},
    transport::streamable_http_server::{
        StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::PublishedCatalog;
use crate::dispatch::Dispatcher;

const SSE_PATH: &str = "/sse";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One MCP service instance per connected session; all instances share the
/// catalog and dispatcher.
#[derive(Clone)]
pub struct AggregatorServer {
    catalog: Arc<PublishedCatalog>,
    dispatcher: Arc<Dispatcher>,
}

impl AggregatorServer {
    pub fn new(catalog: Arc<PublishedCatalog>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            catalog,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Internal dispatch used by the workflow executor; same routing as an
    /// external client request.
    pub async fn call_tool_internal(
        &self,
        exposed_name: &str,
        arguments: Option<JsonObject>,
    ) -> CallToolResult {
        self.dispatcher.dispatch_tool(exposed_name, arguments).await
    }
}

impl ServerHandler for AggregatorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "mcpmux aggregates tools, resources, and prompts from multiple backend MCP \
                 servers behind one endpoint. Names are stable while unique; identical names \
                 on several backends are disambiguated as '<backend>.<name>'. Aggregator \
                 tools (workflow actions, workflow management, backend introspection) carry \
                 the configured prefix. The catalog is dynamic: list results change as \
                 backends come and go, announced via list_changed notifications."
                    .into(),
            ),
        }
    }

    fn on_initialized(
        &self,
        context: NotificationContext<RoleServer>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let id = self.catalog.observe_peer(context.peer.clone());
        debug!(peer = id, "client session initialized");
        std::future::ready(())
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.catalog.tools(),
            next_cursor: None,
            ..Default::default()
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let dispatcher = Arc::clone(&self.dispatcher);
        async move {
            Ok(dispatcher
                .dispatch_tool(&request.name, request.arguments)
                .await)
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListPromptsResult {
            prompts: self.catalog.prompts(),
            next_cursor: None,
            ..Default::default()
        }))
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        let dispatcher = Arc::clone(&self.dispatcher);
        async move {
            dispatcher
                .dispatch_prompt(&request.name, request.arguments)
                .await
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourcesResult {
            resources: self.catalog.resources(),
            next_cursor: None,
            ..Default::default()
        }))
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_
    {
        std::future::ready(Ok(ListResourceTemplatesResult {
            resource_templates: Vec::new(),
            next_cursor: None,
            ..Default::default()
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        let dispatcher = Arc::clone(&self.dispatcher);
        async move { dispatcher.dispatch_resource(&request.uri).await }
    }
}

/// A running front-end transport.
pub struct Frontend {
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Frontend {
    /// Bind the HTTP listener and start serving SSE sessions. A bind
    /// failure is fatal to the caller.
    pub async fn serve(server: AggregatorServer, host: &str, port: u16) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind front-end at {host}:{port}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve front-end address")?;

        let cancel = CancellationToken::new();
        let service: StreamableHttpService<AggregatorServer, LocalSessionManager> =
            StreamableHttpService::new(
                move || Ok(server.clone()),
                Default::default(),
                StreamableHttpServerConfig {
                    sse_keep_alive: Some(SSE_KEEP_ALIVE),
                    cancellation_token: cancel.child_token(),
                    ..Default::default()
                },
            );
        let router = axum::Router::new().nest_service(SSE_PATH, service);

        let server_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    server_cancel.cancelled().await;
                })
                .await
            {
                warn!(error = %e, "front-end HTTP server stopped with error");
            }
        });

        info!(
            addr = %local_addr,
            path = SSE_PATH,
            "front-end MCP server listening"
        );

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    /// Stop serving, bounded by the shutdown timeout.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await {
            Ok(Ok(())) => info!("front-end stopped"),
            Ok(Err(e)) => warn!(error = %e, "front-end task join failed"),
            Err(_) => warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "front-end did not stop in time; abandoning"
            ),
        }
    }
}
