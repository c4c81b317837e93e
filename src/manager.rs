//! Composition root: binds the registry, reconciler, front-end, event
//! handler, and workflow subsystem to the external providers, and owns the
//! outermost lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiTools;
use crate::backend::BackendClient;
use crate::catalog::PublishedCatalog;
use crate::config::Config;
use crate::denylist::Denylist;
use crate::dispatch::Dispatcher;
use crate::events::{
    EventHandler, RefreshCallback, ServiceHealth, ServiceState, ServiceStateEvent,
};
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::registry::{RegistryError, ServerRegistry};
use crate::server::{AggregatorServer, Frontend};
use crate::workflow::executor::WorkflowExecutor;
use crate::workflow::store::{WorkflowStore, spawn_change_watcher};

/// One service as enumerated by the external service registry.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
    pub health: ServiceHealth,
    pub tool_prefix: Option<String>,
}

/// The external service registry the aggregator syncs from.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Enumerate MCP-type services with their current state and health.
    async fn list_mcp_services(&self) -> Vec<ServiceInfo>;

    /// Produce an initialized-capable client for one service.
    async fn client_for(&self, name: &str) -> Result<Arc<dyn BackendClient>>;
}

/// A provider with nothing to provide. Standalone deployments serve only
/// aggregator-owned tools until backends register some other way.
pub struct NoServices;

#[async_trait]
impl ServiceProvider for NoServices {
    async fn list_mcp_services(&self) -> Vec<ServiceInfo> {
        Vec::new()
    }

    async fn client_for(&self, name: &str) -> Result<Arc<dyn BackendClient>> {
        anyhow::bail!("no service registry configured; cannot build client for '{name}'")
    }
}

/// Composes every subsystem and owns start/stop.
pub struct Manager {
    config: Config,
    registry: Arc<ServerRegistry>,
    catalog: Arc<PublishedCatalog>,
    server: AggregatorServer,
    provider: Arc<dyn ServiceProvider>,
    api: Arc<ApiTools>,
    workflow_store: Option<Arc<WorkflowStore>>,
    event_stream: Mutex<Option<mpsc::Receiver<ServiceStateEvent>>>,
    events: Mutex<Option<Arc<EventHandler>>>,
    frontend: Mutex<Option<Frontend>>,
    reconciler: Mutex<Option<Arc<ReconcilerHandle>>>,
    cancel: CancellationToken,
}

impl Manager {
    pub fn new(
        config: Config,
        provider: Arc<dyn ServiceProvider>,
        event_stream: mpsc::Receiver<ServiceStateEvent>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let registry = ServerRegistry::new();
        let catalog = Arc::new(PublishedCatalog::new());
        let api = Arc::new(ApiTools::new(Arc::clone(&registry)));

        let workflow_store = if config.workflows_enabled() {
            Some(Arc::new(WorkflowStore::new(
                config.user_workflows_dir(),
                config.project_workflows_dir(),
                config.legacy_workflows_file(),
            )))
        } else {
            None
        };
        let executor = workflow_store.as_ref().map(|store| {
            Arc::new(
                WorkflowExecutor::new(Arc::clone(store)).with_cancellation(cancel.child_token()),
            )
        });

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            executor,
            Arc::clone(&api),
            config.envctl_prefix.clone(),
        ));
        let server = AggregatorServer::new(Arc::clone(&catalog), dispatcher);

        Arc::new(Self {
            config,
            registry,
            catalog,
            server,
            provider,
            api,
            workflow_store,
            event_stream: Mutex::new(Some(event_stream)),
            events: Mutex::new(None),
            frontend: Mutex::new(None),
            reconciler: Mutex::new(None),
            cancel,
        })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<PublishedCatalog> {
        &self.catalog
    }

    pub fn server(&self) -> &AggregatorServer {
        &self.server
    }

    pub async fn frontend_addr(&self) -> Option<std::net::SocketAddr> {
        self.frontend.lock().await.as_ref().map(|f| f.local_addr)
    }

    /// Bring everything up. Front-end failure is fatal; initial-sync
    /// failures are logged and skipped; an event-handler failure rolls the
    /// front-end back down.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // 1. Front-end first: nothing else is useful without it.
        let frontend = Frontend::serve(
            self.server.clone(),
            &self.config.host,
            self.config.port,
        )
        .await
        .context("front-end MCP server failed to start")?;
        *self.frontend.lock().await = Some(frontend);

        // 2. Workflow catalog before the reconciler, so the initial pass
        // already sees action tools.
        if let Some(store) = &self.workflow_store {
            store.load();
        }

        let reconciler = Arc::new(crate::reconciler::spawn(Reconciler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.catalog),
            Denylist::new(self.config.yolo),
            self.config.envctl_prefix.clone(),
            self.workflow_store.clone(),
        )));
        *self.reconciler.lock().await = Some(Arc::clone(&reconciler));
        // The catalog is published before anything else proceeds.
        reconciler
            .wait_applied(self.registry.current_version())
            .await;

        // 3. Workflow hot-reload, re-publishing action tools on change.
        if let Some(store) = &self.workflow_store {
            match spawn_change_watcher(store.watched_paths(), self.cancel.child_token()) {
                Ok(signal) => {
                    let store = Arc::clone(store);
                    let cancel = self.cancel.child_token();
                    let poke = Arc::clone(&reconciler);
                    tokio::spawn(async move {
                        store
                            .run_reload_loop(signal, cancel, move || poke.poke())
                            .await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "workflow watcher unavailable; definitions load once")
                }
            }
        }

        // 4. Initial sync from the external service registry.
        let synced = self.initial_sync().await;
        info!(backends = synced, "initial sync complete");

        // 5. Event-driven refresh. A failure here rolls everything back.
        let stream = self.event_stream.lock().await.take();
        let start_result = match stream {
            Some(stream) => {
                let events = Arc::new(EventHandler::new(
                    stream,
                    self.register_callback(),
                    self.deregister_callback(),
                    self.config.label_filter(),
                ));
                match events.start().await {
                    Ok(()) => {
                        *self.events.lock().await = Some(events);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            None => Err(anyhow::anyhow!("event stream already consumed")),
        };
        if let Err(e) = start_result {
            warn!(error = %e, "event handler failed to start; rolling back");
            self.stop().await;
            return Err(e.context("event handler failed to start"));
        }

        // 6. Late wiring: the refresh API tool re-runs initial sync.
        let weak = Arc::downgrade(self);
        self.api.set_refresh_hook(Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => Ok(manager.initial_sync().await),
                    None => Ok(0),
                }
            })
        }));

        let addr = self.frontend_addr().await;
        info!(addr = ?addr, "aggregator ready");
        Ok(())
    }

    /// Tear everything down in reverse dependency order. Errors are logged;
    /// teardown always runs to completion.
    pub async fn stop(&self) {
        info!("aggregator stopping");
        self.cancel.cancel();

        if let Some(events) = self.events.lock().await.take() {
            events.stop().await;
        }
        if let Some(frontend) = self.frontend.lock().await.take() {
            frontend.shutdown().await;
        }
        if let Some(reconciler) = self.reconciler.lock().await.take() {
            reconciler.stop().await;
        }
        self.registry.deregister_all().await;
        info!("aggregator stopped");
    }

    /// Register every service that is currently Running and Healthy.
    /// Returns how many registrations succeeded or were already in place.
    pub async fn initial_sync(&self) -> usize {
        let mut synced = 0;
        for service in self.provider.list_mcp_services().await {
            if service.state != ServiceState::Running
                || service.health != ServiceHealth::Healthy
            {
                debug!(
                    service = %service.name,
                    state = %service.state,
                    "skipping service in initial sync"
                );
                continue;
            }
            match self.register_single(&service.name).await {
                Ok(()) => synced += 1,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "initial sync registration failed");
                }
            }
        }
        synced
    }

    /// Recompute the initial sync on demand.
    pub async fn manual_refresh(&self) -> usize {
        self.initial_sync().await
    }

    /// Register one service by name. A no-op success when already present.
    /// Returns once the resulting catalog change has been published.
    pub async fn register_single(&self, name: &str) -> Result<()> {
        if self.registry.contains(name).await {
            debug!(backend = %name, "already registered");
            return Ok(());
        }

        let tool_prefix = self
            .provider
            .list_mcp_services()
            .await
            .into_iter()
            .find(|service| service.name == name)
            .and_then(|service| service.tool_prefix);

        let client = self
            .provider
            .client_for(name)
            .await
            .with_context(|| format!("no client for service '{name}'"))?;

        match self.registry.register(name, client, tool_prefix).await {
            Ok(version) => {
                self.wait_reconciled(version).await;
                Ok(())
            }
            Err(RegistryError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deregister one service by name. A no-op success when absent.
    pub async fn deregister_single(&self, name: &str) -> Result<()> {
        match self.registry.deregister(name).await {
            Ok(version) => {
                self.wait_reconciled(version).await;
                Ok(())
            }
            Err(RegistryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_reconciled(&self, version: u64) {
        let handle = self.reconciler.lock().await.clone();
        if let Some(handle) = handle {
            handle.wait_applied(version).await;
        }
    }

    fn register_callback(self: &Arc<Self>) -> RefreshCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |label: String| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => manager.register_single(&label).await,
                    None => Ok(()),
                }
            })
        })
    }

    fn deregister_callback(self: &Arc<Self>) -> RefreshCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |label: String| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => manager.deregister_single(&label).await,
                    None => Ok(()),
                }
            })
        })
    }
}
