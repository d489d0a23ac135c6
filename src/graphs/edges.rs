//! Edge types: static topology and state-dependent conditional routing.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Predicate deciding where execution goes after a node ran.
///
/// Receives the post-commit channel values view and returns target labels.
/// Labels pass through the edge's path map when one is configured.
pub type EdgePredicate = Arc<dyn Fn(&FxHashMap<String, Value>) -> Vec<String> + Send + Sync>;

/// A conditional edge out of `from`.
#[derive(Clone)]
pub struct ConditionalEdge {
    from: String,
    predicate: EdgePredicate,
    path_map: Option<FxHashMap<String, String>>,
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("path_map", &self.path_map)
            .finish_non_exhaustive()
    }
}

impl ConditionalEdge {
    pub fn new(from: impl Into<String>, predicate: EdgePredicate) -> Self {
        Self {
            from: from.into(),
            predicate,
            path_map: None,
        }
    }

    /// Translate predicate labels through a fixed mapping.
    ///
    /// With a path map in place, compile-time validation covers every
    /// reachable target; without one, unknown targets are skipped at
    /// runtime with a warning.
    #[must_use]
    pub fn with_path_map(mut self, path_map: FxHashMap<String, String>) -> Self {
        self.path_map = Some(path_map);
        self
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub(crate) fn path_map(&self) -> Option<&FxHashMap<String, String>> {
        self.path_map.as_ref()
    }

    /// Resolve the edge against a values view, returning target node names
    /// (already passed through the path map).
    pub(crate) fn resolve(&self, values: &FxHashMap<String, Value>) -> Vec<String> {
        let labels = (self.predicate)(values);
        match &self.path_map {
            Some(map) => labels
                .into_iter()
                .filter_map(|label| map.get(&label).cloned())
                .collect(),
            None => labels,
        }
    }
}
