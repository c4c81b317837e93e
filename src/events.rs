//! Service state event consumption.
//!
//! An external orchestrator publishes lifecycle transitions for the services
//! it manages. The handler here owns none of that machinery: it drains one
//! bounded stream, filters for transitions that matter to the catalog, and
//! invokes the registration callbacks it was constructed with. Failures in a
//! callback are logged and swallowed so the stream stays alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of an externally-managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Unknown,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Unknown => "Unknown",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Stopped => "Stopped",
            ServiceState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Health of an externally-managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One transition on the state stream.
#[derive(Debug, Clone)]
pub struct ServiceStateEvent {
    pub label: String,
    pub old_state: ServiceState,
    pub new_state: ServiceState,
    pub health: Option<ServiceHealth>,
    pub error: Option<String>,
}

impl ServiceStateEvent {
    pub fn new(label: impl Into<String>, old_state: ServiceState, new_state: ServiceState) -> Self {
        Self {
            label: label.into(),
            old_state,
            new_state,
            health: None,
            error: None,
        }
    }
}

/// An event is actionable iff it crosses the Running boundary in either
/// direction, or it enters Failed. Everything else (Starting→Stopped,
/// Failed→Stopped, Running→Running, …) is noise.
pub fn crosses_running_boundary(old: ServiceState, new: ServiceState) -> bool {
    let was_running = old == ServiceState::Running;
    let is_running = new == ServiceState::Running;
    (was_running != is_running) || new == ServiceState::Failed
}

/// Label-based domain filter applied before dispatch.
///
/// The orchestrator publishes events for everything it manages, including
/// the aggregator itself and port-forward helpers; those must not feed back
/// into the registry.
#[derive(Debug, Clone)]
pub struct LabelFilter {
    ignore_prefixes: Vec<String>,
}

impl Default for LabelFilter {
    fn default() -> Self {
        Self {
            ignore_prefixes: vec!["mcp-aggregator".to_string(), "port-forward".to_string()],
        }
    }
}

impl LabelFilter {
    pub fn new(ignore_prefixes: Vec<String>) -> Self {
        Self { ignore_prefixes }
    }

    pub fn accepts(&self, label: &str) -> bool {
        !self
            .ignore_prefixes
            .iter()
            .any(|prefix| label.starts_with(prefix.as_str()))
    }
}

/// Async callback invoked with the service label.
pub type RefreshCallback =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Consumes a [`ServiceStateEvent`] stream and keeps the registry in step.
///
/// Single cooperative task; terminates when the stream closes or the handler
/// is stopped. `start` and `stop` are both idempotent.
pub struct EventHandler {
    register_cb: RefreshCallback,
    deregister_cb: RefreshCallback,
    filter: LabelFilter,
    running: Arc<AtomicBool>,
    stream: Mutex<Option<mpsc::Receiver<ServiceStateEvent>>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventHandler {
    pub fn new(
        stream: mpsc::Receiver<ServiceStateEvent>,
        register_cb: RefreshCallback,
        deregister_cb: RefreshCallback,
        filter: LabelFilter,
    ) -> Self {
        Self {
            register_cb,
            deregister_cb,
            filter,
            running: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(Some(stream)),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the consumer task. Calling `start` on a running handler is a
    /// no-op success.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("event handler already running");
            return Ok(());
        }

        let Some(mut rx) = self.stream.lock().await.take() else {
            self.running.store(false, Ordering::Release);
            anyhow::bail!("event stream already consumed");
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = Some(cancel.clone());

        let running = Arc::clone(&self.running);
        let register_cb = Arc::clone(&self.register_cb);
        let deregister_cb = Arc::clone(&self.deregister_cb);
        let filter = self.filter.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("event handler cancelled");
                        break;
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                handle_event(&event, &filter, &register_cb, &deregister_cb).await;
                            }
                            None => {
                                info!("state event stream closed; event handler stopping");
                                break;
                            }
                        }
                    }
                }
            }
            running.store(false, Ordering::Release);
        });

        *self.task.lock().await = Some(task);
        info!("event handler started");
        Ok(())
    }

    /// Stop the consumer task. Idempotent; afterwards `is_running` is false.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "event handler task join failed");
            }
        }
        self.running.store(false, Ordering::Release);
    }
}

async fn handle_event(
    event: &ServiceStateEvent,
    filter: &LabelFilter,
    register_cb: &RefreshCallback,
    deregister_cb: &RefreshCallback,
) {
    if !filter.accepts(&event.label) {
        debug!(label = %event.label, "event ignored by label filter");
        return;
    }
    if !crosses_running_boundary(event.old_state, event.new_state) {
        debug!(
            label = %event.label,
            old = %event.old_state,
            new = %event.new_state,
            "event ignored; no running boundary crossed"
        );
        return;
    }

    if event.new_state == ServiceState::Running {
        debug!(label = %event.label, "service entered Running; registering");
        if let Err(e) = (register_cb)(event.label.clone()).await {
            warn!(label = %event.label, error = %e, "register callback failed");
        }
    } else {
        debug!(
            label = %event.label,
            new = %event.new_state,
            "service left Running; deregistering"
        );
        if let Err(e) = (deregister_cb)(event.label.clone()).await {
            warn!(label = %event.label, error = %e, "deregister callback failed");
        }
    }
}
