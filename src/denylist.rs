//! Publish-time marking of destructive tools.
//!
//! The denylist never blocks anything itself: flagged tools are still
//! published, carrying a destructive annotation, and the decision to refuse
//! an invocation belongs to the client. The `yolo` flag turns the marking
//! off wholesale.

use rmcp::model::ToolAnnotations;

/// Exact tool names considered destructive regardless of shape.
const DESTRUCTIVE_NAMES: &[&str] = &[
    "rm",
    "rmdir",
    "format",
    "shutdown",
    "reboot",
    "drop_database",
    "drop_table",
    "truncate_table",
    "kubectl_delete",
    "helm_uninstall",
    "terraform_destroy",
];

/// Leading verbs that mark a tool destructive (`delete_file`,
/// `web.remove_page`, `kube_destroy_cluster`, …).
const DESTRUCTIVE_VERBS: &[&str] = &[
    "delete", "remove", "destroy", "drop", "terminate", "kill", "purge", "uninstall", "erase",
    "wipe",
];

/// Static destructive-tool policy consulted when tools are published.
#[derive(Debug, Clone, Copy)]
pub struct Denylist {
    yolo: bool,
}

impl Denylist {
    pub fn new(yolo: bool) -> Self {
        Self { yolo }
    }

    /// Whether the exposed name should carry the destructive marking.
    pub fn is_blocked(&self, exposed_name: &str) -> bool {
        if self.yolo {
            return false;
        }
        // Collision prefixes ("backend.name") and per-backend tool prefixes
        // ("kube_name") must not hide the underlying verb, so every
        // '.'-separated segment and every '_'-separated token boundary is
        // considered.
        exposed_name.split('.').any(segment_is_destructive)
    }

    /// Annotations for a tool about to be published, or `None` when nothing
    /// needs marking.
    pub fn annotations_for(&self, exposed_name: &str) -> Option<ToolAnnotations> {
        if !self.is_blocked(exposed_name) {
            return None;
        }
        Some(ToolAnnotations {
            title: None,
            read_only_hint: None,
            destructive_hint: Some(true),
            idempotent_hint: None,
            open_world_hint: None,
        })
    }
}

fn segment_is_destructive(segment: &str) -> bool {
    if DESTRUCTIVE_NAMES.contains(&segment) {
        return true;
    }
    segment
        .split('_')
        .any(|token| DESTRUCTIVE_VERBS.contains(&token))
}
