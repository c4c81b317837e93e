//! Diff-driven publication of the catalog to the front-end.
//!
//! One reconciliation runs per drained update signal: snapshot the registry,
//! compute the desired exposed surface (backend capabilities plus
//! aggregator-owned tools), remove what is obsolete, add what is new, and
//! commit. The reconciler reads the registry only through its read-locked
//! views; it never touches the front-end while a registry write lock is
//! held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rmcp::model::{JsonObject, Prompt, PromptArgument, RawResource, Resource, Tool};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::active::ActiveItems;
use crate::api;
use crate::backend::ToolSpec;
use crate::catalog::PublishedCatalog;
use crate::denylist::Denylist;
use crate::dispatch::ACTION_PREFIX;
use crate::registry::ServerRegistry;
use crate::workflow::store::WorkflowStore;
use crate::workflow::{is_available, manage};

pub struct Reconciler {
    registry: Arc<ServerRegistry>,
    catalog: Arc<PublishedCatalog>,
    denylist: Denylist,
    prefix: String,
    workflows: Option<Arc<WorkflowStore>>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        catalog: Arc<PublishedCatalog>,
        denylist: Denylist,
        prefix: String,
        workflows: Option<Arc<WorkflowStore>>,
    ) -> Self {
        Self {
            registry,
            catalog,
            denylist,
            prefix,
            workflows,
        }
    }

    /// One full reconciliation pass against the current registry state.
    pub async fn reconcile(&self, active: &mut ActiveItems) {
        let mut desired_tools: HashMap<String, Tool> = HashMap::new();
        let mut desired_prompts: HashMap<String, Prompt> = HashMap::new();
        let mut desired_resources: HashMap<String, Resource> = HashMap::new();

        for exposed in self.registry.all_tools().await {
            desired_tools.insert(
                exposed.exposed_name.clone(),
                self.build_tool(&exposed.exposed_name, &exposed.spec),
            );
        }
        for exposed in self.registry.all_prompts().await {
            desired_prompts.insert(
                exposed.exposed_name.clone(),
                build_prompt(&exposed.exposed_name, &exposed.spec),
            );
        }
        for exposed in self.registry.all_resources().await {
            desired_resources.insert(
                exposed.exposed_uri.clone(),
                build_resource(&exposed.exposed_uri, &exposed.spec),
            );
        }

        self.add_aggregator_tools(&mut desired_tools);

        let tool_names: HashSet<String> = desired_tools.keys().cloned().collect();
        let prompt_names: HashSet<String> = desired_prompts.keys().cloned().collect();
        let resource_uris: HashSet<String> = desired_resources.keys().cloned().collect();

        // Removals first so a renamed item never coexists with its old form.
        let obsolete_tools = active.tools.obsolete_against(&tool_names);
        let obsolete_prompts = active.prompts.obsolete_against(&prompt_names);
        let obsolete_resources = active.resources.obsolete_against(&resource_uris);

        let removed_tools = self.catalog.delete_tools(&obsolete_tools);
        let removed_prompts = self.catalog.delete_prompts(&obsolete_prompts);
        let mut removed_resources = 0;
        for uri in &obsolete_resources {
            if self.catalog.remove_resource(uri) {
                removed_resources += 1;
            }
        }

        let new_tools: Vec<Tool> = active
            .tools
            .added_against(&tool_names)
            .into_iter()
            .filter_map(|name| desired_tools.get(&name).cloned())
            .collect();
        let new_prompts: Vec<Prompt> = active
            .prompts
            .added_against(&prompt_names)
            .into_iter()
            .filter_map(|name| desired_prompts.get(&name).cloned())
            .collect();
        let new_resources: Vec<Resource> = active
            .resources
            .added_against(&resource_uris)
            .into_iter()
            .filter_map(|uri| desired_resources.get(&uri).cloned())
            .collect();

        let added_tools = self.catalog.add_tools(new_tools);
        let added_prompts = self.catalog.add_prompts(new_prompts);
        let added_resources = new_resources.len();
        for resource in new_resources {
            self.catalog.add_resource(resource);
        }

        if added_tools + removed_tools > 0 {
            self.catalog.notify_tools_changed().await;
        }
        if added_prompts + removed_prompts > 0 {
            self.catalog.notify_prompts_changed().await;
        }
        if added_resources + removed_resources > 0 {
            self.catalog.notify_resources_changed().await;
        }

        active.tools.commit(tool_names);
        active.prompts.commit(prompt_names);
        active.resources.commit(resource_uris);

        if added_tools + removed_tools + added_prompts + removed_prompts + added_resources
            + removed_resources
            > 0
        {
            info!(
                tools = self.catalog.tool_count(),
                prompts = self.catalog.prompt_count(),
                resources = self.catalog.resource_count(),
                added_tools,
                removed_tools,
                "catalog reconciled"
            );
        } else {
            debug!("catalog reconciled; no changes");
        }
    }

    /// Workflow actions, workflow management, and API tools, all carrying
    /// the aggregator prefix. These are always part of the desired set;
    /// action tools additionally gate on availability.
    fn add_aggregator_tools(&self, desired: &mut HashMap<String, Tool>) {
        for spec in api::api_tool_specs() {
            let name = format!("{}_{}", self.prefix, spec.name);
            desired.insert(name.clone(), self.build_tool(&name, &spec));
        }

        let Some(store) = &self.workflows else {
            return;
        };

        for spec in manage::management_tool_specs() {
            let name = format!("{}_{}", self.prefix, spec.name);
            desired.insert(name.clone(), self.build_tool(&name, &spec));
        }

        // Availability is dynamic: a workflow is published only while every
        // step tool is present in this pass's desired set.
        let available_names: HashSet<String> = desired.keys().cloned().collect();
        for def in store.list() {
            if !is_available(&def, &available_names) {
                debug!(workflow = %def.name, "workflow unavailable; not published");
                continue;
            }
            let name = format!("{}_{}{}", self.prefix, ACTION_PREFIX, def.name);
            let spec = ToolSpec {
                name: name.clone(),
                description: if def.description.is_empty() {
                    format!("Run the {} workflow", def.name)
                } else {
                    def.description.clone()
                },
                input_schema: def.input_schema.clone(),
            };
            desired.insert(name.clone(), self.build_tool(&name, &spec));
        }
    }

    fn build_tool(&self, exposed: &str, spec: &ToolSpec) -> Tool {
        Tool {
            name: exposed.to_string().into(),
            title: None,
            description: if spec.description.is_empty() {
                None
            } else {
                Some(spec.description.clone().into())
            },
            input_schema: Arc::new(schema_object(&spec.input_schema)),
            output_schema: None,
            annotations: self.denylist.annotations_for(exposed),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

/// Drive reconciliation from the registry's update signal.
///
/// `applied` mirrors the newest registry version whose effects have been
/// published, letting callers wait until their mutation is visible.
pub struct ReconcilerHandle {
    /// `None` until the first pass completes, then the newest registry
    /// version whose effects are published.
    applied_rx: watch::Receiver<Option<u64>>,
    poke_tx: watch::Sender<()>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReconcilerHandle {
    /// Block until the reconciliation covering `version` has completed.
    pub async fn wait_applied(&self, version: u64) {
        let mut rx = self.applied_rx.clone();
        // A closed channel means the reconciler is gone; nothing to wait on.
        let _ = rx
            .wait_for(|applied| applied.is_some_and(|v| v >= version))
            .await;
    }

    /// Request a pass that was not caused by a registry mutation (e.g. the
    /// workflow catalog changed on disk).
    pub fn poke(&self) {
        let _ = self.poke_tx.send(());
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "reconciler task join failed");
            }
        }
    }
}

pub fn spawn(reconciler: Reconciler) -> ReconcilerHandle {
    let (applied_tx, applied_rx) = watch::channel(None::<u64>);
    let (poke_tx, mut poke_rx) = watch::channel(());
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let mut update_rx = reconciler.registry.subscribe_updates();

    let task = tokio::spawn(async move {
        let mut active = ActiveItems::new();

        // Initial pass covers registrations that happened before spawn.
        let mut version = *update_rx.borrow_and_update();
        reconciler.reconcile(&mut active).await;
        let _ = applied_tx.send(Some(version));

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    debug!("reconciler stopping");
                    break;
                }
                changed = update_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Coalesced: this observes the latest registry state,
                    // never an intermediate one.
                    version = *update_rx.borrow_and_update();
                    reconciler.reconcile(&mut active).await;
                    let _ = applied_tx.send(Some(version));
                }
                changed = poke_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    reconciler.reconcile(&mut active).await;
                    let _ = applied_tx.send(Some(version));
                }
            }
        }
    });

    ReconcilerHandle {
        applied_rx,
        poke_tx,
        cancel,
        task: tokio::sync::Mutex::new(Some(task)),
    }
}

fn schema_object(value: &Value) -> JsonObject {
    match value.as_object() {
        Some(map) => map.clone(),
        None => {
            let mut map = JsonObject::new();
            map.insert("type".to_string(), Value::String("object".to_string()));
            map
        }
    }
}

fn build_prompt(exposed: &str, spec: &crate::backend::PromptSpec) -> Prompt {
    Prompt {
        name: exposed.to_string(),
        title: None,
        description: if spec.description.is_empty() {
            None
        } else {
            Some(spec.description.clone())
        },
        arguments: spec.arguments.as_ref().map(|args| {
            args.iter()
                .map(|a| PromptArgument {
                    name: a.name.clone(),
                    title: None,
                    description: a.description.clone(),
                    required: a.required,
                })
                .collect()
        }),
        icons: None,
        meta: None,
    }
}

fn build_resource(exposed_uri: &str, spec: &crate::backend::ResourceSpec) -> Resource {
    Resource {
        raw: RawResource {
            uri: exposed_uri.to_string(),
            name: spec.name.clone(),
            title: None,
            description: if spec.description.is_empty() {
                None
            } else {
                Some(spec.description.clone())
            },
            mime_type: spec.mime_type.clone(),
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}
