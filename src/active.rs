//! Bookkeeping of which exposed items are currently published.
//!
//! The reconciler computes a fresh `desired` set every pass and uses these
//! sets to turn it into minimal add/remove batches against the front-end.

use std::collections::HashSet;

/// The set of exposed names published for one capability kind.
#[derive(Debug, Default)]
pub struct ActiveSet {
    previous: HashSet<String>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names published last pass but absent from `desired` (to remove).
    pub fn obsolete_against(&self, desired: &HashSet<String>) -> Vec<String> {
        self.previous.difference(desired).cloned().collect()
    }

    /// Names in `desired` that were not published last pass (to add).
    pub fn added_against(&self, desired: &HashSet<String>) -> Vec<String> {
        desired.difference(&self.previous).cloned().collect()
    }

    /// Make `desired` the new baseline.
    pub fn commit(&mut self, desired: HashSet<String>) {
        self.previous = desired;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.previous.contains(name)
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// One [`ActiveSet`] per capability kind.
#[derive(Debug, Default)]
pub struct ActiveItems {
    pub tools: ActiveSet,
    pub prompts: ActiveSet,
    pub resources: ActiveSet,
}

impl ActiveItems {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_pass_adds_everything() {
        let active = ActiveSet::new();
        let desired = set(&["a", "b"]);
        assert!(active.obsolete_against(&desired).is_empty());
        let mut added = active.added_against(&desired);
        added.sort();
        assert_eq!(added, vec!["a", "b"]);
    }

    #[test]
    fn diff_after_commit() {
        let mut active = ActiveSet::new();
        active.commit(set(&["a", "b", "c"]));

        let desired = set(&["b", "c", "d"]);
        assert_eq!(active.obsolete_against(&desired), vec!["a"]);
        assert_eq!(active.added_against(&desired), vec!["d"]);

        active.commit(desired);
        assert!(active.contains("d"));
        assert!(!active.contains("a"));
        assert_eq!(active.len(), 3);
    }

    #[test]
    fn empty_desired_obsoletes_all() {
        let mut active = ActiveSet::new();
        active.commit(set(&["x", "y"]));
        let mut obsolete = active.obsolete_against(&HashSet::new());
        obsolete.sort();
        assert_eq!(obsolete, vec!["x", "y"]);
        active.commit(HashSet::new());
        assert!(active.is_empty());
    }
}
