//! Workflow catalog: disk layout, precedence, and atomic reload.
//!
//! Definitions are loaded from three places, lowest precedence first: the
//! legacy single-file catalog (read-only compatibility), the user workflows
//! directory, and the project workflows directory. Later sources override
//! earlier ones by workflow name. A reload swaps the whole catalog in one
//! step, so readers never observe a half-loaded set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{WorkflowDefinition, WorkflowError, validate_definition};

/// Where a definition was loaded from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowTier {
    Legacy,
    User,
    Project,
}

#[derive(Debug, Clone)]
struct StoredWorkflow {
    def: Arc<WorkflowDefinition>,
    tier: WorkflowTier,
    /// Backing file for file-tier definitions; `None` for legacy entries.
    path: Option<PathBuf>,
}

#[derive(Default)]
struct CatalogState {
    workflows: HashMap<String, StoredWorkflow>,
}

/// On-disk workflow catalog with atomic reload.
pub struct WorkflowStore {
    user_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    legacy_file: Option<PathBuf>,
    state: ArcSwap<CatalogState>,
}

impl WorkflowStore {
    pub fn new(
        user_dir: Option<PathBuf>,
        project_dir: Option<PathBuf>,
        legacy_file: Option<PathBuf>,
    ) -> Self {
        Self {
            user_dir,
            project_dir,
            legacy_file,
            state: ArcSwap::from_pointee(CatalogState::default()),
        }
    }

    /// A store with no backing directories; always empty until definitions
    /// are persisted elsewhere. Useful where only execution is exercised.
    pub fn in_memory() -> Self {
        Self::new(None, None, None)
    }

    /// Reload every source and swap the catalog. Invalid files are skipped
    /// with a warning; they never poison the rest of the catalog.
    pub fn load(&self) -> usize {
        let mut workflows: HashMap<String, StoredWorkflow> = HashMap::new();

        if let Some(legacy) = &self.legacy_file {
            for def in load_legacy_file(legacy) {
                workflows.insert(
                    def.name.clone(),
                    StoredWorkflow {
                        def: Arc::new(def),
                        tier: WorkflowTier::Legacy,
                        path: None,
                    },
                );
            }
        }

        for (dir, tier) in [
            (self.user_dir.as_ref(), WorkflowTier::User),
            (self.project_dir.as_ref(), WorkflowTier::Project),
        ] {
            let Some(dir) = dir else { continue };
            for (path, def) in load_directory(dir) {
                workflows.insert(
                    def.name.clone(),
                    StoredWorkflow {
                        def: Arc::new(def),
                        tier,
                        path: Some(path),
                    },
                );
            }
        }

        let count = workflows.len();
        self.state.store(Arc::new(CatalogState { workflows }));
        info!(workflows = count, "workflow catalog loaded");
        count
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.state
            .load()
            .workflows
            .get(name)
            .map(|w| Arc::clone(&w.def))
    }

    pub fn tier(&self, name: &str) -> Option<WorkflowTier> {
        self.state.load().workflows.get(name).map(|w| w.tier)
    }

    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let state = self.state.load();
        let mut defs: Vec<Arc<WorkflowDefinition>> =
            state.workflows.values().map(|w| Arc::clone(&w.def)).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.state.load().workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.load().workflows.is_empty()
    }

    fn writable_dir(&self) -> Result<&Path, WorkflowError> {
        self.project_dir
            .as_deref()
            .or(self.user_dir.as_deref())
            .ok_or_else(|| WorkflowError::Persist {
                name: String::new(),
                reason: "no workflow directory configured".into(),
            })
    }

    /// Persist a new definition and reload.
    pub fn create(&self, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(def)?;
        if self.get(&def.name).is_some() {
            return Err(WorkflowError::Validation(format!(
                "workflow '{}' already exists",
                def.name
            )));
        }
        self.write_definition(def)?;
        self.load();
        Ok(())
    }

    /// Persist changes to an existing definition and reload. Writing into
    /// the project tier shadows legacy and user copies.
    pub fn update(&self, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
        validate_definition(def)?;
        let existing = {
            let state = self.state.load();
            state
                .workflows
                .get(&def.name)
                .cloned()
                .ok_or_else(|| WorkflowError::NotFound(def.name.clone()))?
        };
        let canonical = self.write_definition(def)?;
        // A renamed backing file in the same tier would otherwise linger and
        // fight the canonical one on the next load.
        if let Some(old_path) = existing.path {
            if old_path != canonical && old_path.parent() == canonical.parent() {
                if let Err(e) = std::fs::remove_file(&old_path) {
                    warn!(path = %old_path.display(), error = %e, "could not remove stale workflow file");
                }
            }
        }
        self.load();
        Ok(())
    }

    /// Remove a definition's backing file and reload. Legacy entries cannot
    /// be deleted.
    pub fn delete(&self, name: &str) -> Result<(), WorkflowError> {
        let stored = {
            let state = self.state.load();
            state
                .workflows
                .get(name)
                .cloned()
                .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?
        };
        let Some(path) = stored.path else {
            return Err(WorkflowError::ReadOnly(name.to_string()));
        };
        std::fs::remove_file(&path).map_err(|e| WorkflowError::Persist {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.load();
        Ok(())
    }

    fn write_definition(&self, def: &WorkflowDefinition) -> Result<PathBuf, WorkflowError> {
        let dir = self.writable_dir()?.to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| WorkflowError::Persist {
            name: def.name.clone(),
            reason: e.to_string(),
        })?;
        let yaml = serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Persist {
            name: def.name.clone(),
            reason: e.to_string(),
        })?;
        let path = dir.join(format!("{}.yaml", def.name));
        std::fs::write(&path, yaml).map_err(|e| WorkflowError::Persist {
            name: def.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(workflow = %def.name, path = %path.display(), "workflow persisted");
        Ok(path)
    }

    /// Consume the file-change signal, reloading on every notification.
    /// `on_reload` runs after each successful reload (e.g. to poke the
    /// reconciler into republishing action tools).
    pub async fn run_reload_loop(
        &self,
        mut signal: watch::Receiver<()>,
        cancel: CancellationToken,
        on_reload: impl Fn() + Send,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("workflow reload loop stopping");
                    return;
                }
                changed = signal.changed() => {
                    if changed.is_err() {
                        debug!("workflow change signal closed");
                        return;
                    }
                    info!("workflow definitions changed on disk; reloading");
                    self.load();
                    on_reload();
                }
            }
        }
    }

    /// Directories a watcher should observe for this store.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = &self.user_dir {
            paths.push(dir.clone());
        }
        if let Some(dir) = &self.project_dir {
            paths.push(dir.clone());
        }
        if let Some(file) = &self.legacy_file {
            paths.push(file.clone());
        }
        paths
    }
}

/// Spawn the filesystem watcher that feeds the store's coalesced change
/// signal. Missing paths are skipped; the watcher lives until cancellation.
pub fn spawn_change_watcher(
    paths: Vec<PathBuf>,
    cancel: CancellationToken,
) -> anyhow::Result<watch::Receiver<()>> {
    let (tx, rx) = watch::channel(());

    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
        match res {
            Ok(_) => {
                // Coalesced: rapid bursts collapse into one notification.
                let _ = tx.send(());
            }
            Err(e) => warn!(error = %e, "workflow watcher error"),
        }
    })?;

    for path in paths {
        if !path.exists() {
            debug!(path = %path.display(), "skipping watch on missing path");
            continue;
        }
        if let Err(e) = watcher.watch(&path, RecursiveMode::Recursive) {
            warn!(path = %path.display(), error = %e, "failed to watch workflow path");
        }
    }

    tokio::spawn(async move {
        cancel.cancelled().await;
        drop(watcher);
    });

    Ok(rx)
}

fn load_directory(dir: &Path) -> Vec<(PathBuf, WorkflowDefinition)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut out = Vec::new();
    for path in paths {
        match read_definition_file(&path) {
            Ok(def) => out.push((path, def)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid workflow file");
            }
        }
    }
    out
}

fn read_definition_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let text = std::fs::read_to_string(path).map_err(|e| WorkflowError::Persist {
        name: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(&text).map_err(|e| WorkflowError::Validation(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// The legacy single-file catalog: a top-level `workflows:` list (a bare
/// list is tolerated). Read-only.
fn load_legacy_file(path: &Path) -> Vec<WorkflowDefinition> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };

    #[derive(serde::Deserialize)]
    struct LegacyCatalog {
        workflows: Vec<WorkflowDefinition>,
    }

    let defs = if let Ok(catalog) = serde_yaml_ng::from_str::<LegacyCatalog>(&text) {
        catalog.workflows
    } else if let Ok(list) = serde_yaml_ng::from_str::<Vec<WorkflowDefinition>>(&text) {
        list
    } else {
        warn!(path = %path.display(), "legacy workflow file is not parseable; ignoring");
        return Vec::new();
    };

    defs.into_iter()
        .filter(|def| match validate_definition(def) {
            Ok(()) => true,
            Err(e) => {
                warn!(workflow = %def.name, error = %e, "skipping invalid legacy workflow");
                false
            }
        })
        .collect()
}
