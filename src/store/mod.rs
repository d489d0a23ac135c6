//! Long-term key/value store offered to nodes through their context.
//!
//! The store is the one process-wide shared object nodes may mutate; it
//! provides its own concurrency control (key-level atomicity for `put`).
//! Items live under hierarchical namespaces (label paths), optionally carry
//! a TTL, and can be indexed for vector search over configured JSON
//! pointers inside the value.
//!
//! # Examples
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stepgraph::store::{InMemoryStore, PutOptions, SearchOptions, Store};
//!
//! # async fn example() -> Result<(), stepgraph::store::StoreError> {
//! let store = InMemoryStore::new();
//! let ns = vec!["users".to_string(), "u1".to_string()];
//! store.put(&ns, "profile", json!({"name": "Ada"}), PutOptions::default()).await?;
//! let hits = store.search(&["users".to_string()], SearchOptions::default()).await?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::InMemoryStore;

/// Reserved root namespace label.
pub const ROOT_NAMESPACE: &str = "langgraph";

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A search hit: an item plus its similarity score when a query ran.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchItem {
    pub item: Item,
    pub score: Option<f64>,
}

/// Which fields of a value feed the vector index.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum IndexPolicy {
    /// Index the fields configured on the store.
    #[default]
    Configured,
    /// Do not index this item.
    Skip,
    /// Index these JSON pointers instead of the configured ones.
    Fields(Vec<String>),
}

/// Options for [`Store::put`].
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Expire the item this long after the write.
    pub ttl: Option<Duration>,
    pub index: IndexPolicy,
}

/// Options for [`Store::search`].
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Exact-match constraints against top-level value fields.
    pub filter: Option<FxHashMap<String, Value>>,
    /// Natural-language query scored against the vector index.
    pub query: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filter: None,
            query: None,
            limit: 10,
            offset: 0,
        }
    }
}

/// Options for [`Store::list_namespaces`].
#[derive(Clone, Debug)]
pub struct ListNamespacesOptions {
    /// Keep namespaces starting with this label path.
    pub prefix: Option<Vec<String>>,
    /// Keep namespaces ending with this label path.
    pub suffix: Option<Vec<String>>,
    /// Truncate results to this many labels (deduplicated).
    pub max_depth: Option<usize>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListNamespacesOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            suffix: None,
            max_depth: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Errors from store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// Namespace violates the labeling rules.
    #[error("invalid namespace: {reason}")]
    #[diagnostic(
        code(stepgraph::store::namespace),
        help("Labels must be non-empty, must not contain `.`, and the root label `langgraph` is reserved.")
    )]
    InvalidNamespace { reason: String },

    /// Backend storage failure.
    #[error("store backend error: {message}")]
    #[diagnostic(code(stepgraph::store::backend))]
    Backend { message: String },

    /// The configured embedder failed or returned malformed vectors.
    #[error("embedding error: {message}")]
    #[diagnostic(code(stepgraph::store::embedding))]
    Embedding { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Validate a namespace label path.
pub fn validate_namespace(namespace: &[String]) -> Result<()> {
    if namespace.is_empty() {
        return Err(StoreError::InvalidNamespace {
            reason: "namespace must have at least one label".to_string(),
        });
    }
    for label in namespace {
        if label.is_empty() {
            return Err(StoreError::InvalidNamespace {
                reason: "namespace labels must be non-empty".to_string(),
            });
        }
        if label.contains('.') {
            return Err(StoreError::InvalidNamespace {
                reason: format!("label `{label}` must not contain `.`"),
            });
        }
    }
    if namespace[0] == ROOT_NAMESPACE {
        return Err(StoreError::InvalidNamespace {
            reason: format!("root label `{ROOT_NAMESPACE}` is reserved"),
        });
    }
    Ok(())
}

/// Produces embeddings for the vector index.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Vector index configuration for a store.
#[derive(Clone)]
pub struct IndexConfig {
    /// Expected embedding dimensionality.
    pub dims: usize,
    pub embedder: Arc<dyn Embedder>,
    /// JSON pointers inside item values to index (e.g. `"/text"`).
    pub fields: Vec<String>,
}

impl std::fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexConfig")
            .field("dims", &self.dims)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// One operation in a [`Store::batch`] call.
#[derive(Clone, Debug)]
pub enum StoreOp {
    Get {
        namespace: Vec<String>,
        key: String,
    },
    Put {
        namespace: Vec<String>,
        key: String,
        value: Value,
        options: PutOptions,
    },
    Delete {
        namespace: Vec<String>,
        key: String,
    },
    Search {
        prefix: Vec<String>,
        options: SearchOptions,
    },
    ListNamespaces {
        options: ListNamespacesOptions,
    },
}

/// Result of one batched operation, in call order.
#[derive(Debug, Clone)]
pub enum StoreResult {
    Item(Option<Item>),
    Unit,
    Search(Vec<SearchItem>),
    Namespaces(Vec<Vec<String>>),
}

/// Namespace/key/value store with optional vector search.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>>;

    /// Insert or replace an item. Key-level atomic.
    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
        options: PutOptions,
    ) -> Result<()>;

    async fn delete(&self, namespace: &[String], key: &str) -> Result<()>;

    /// Items under `prefix`, optionally filtered and similarity-scored.
    async fn search(&self, prefix: &[String], options: SearchOptions) -> Result<Vec<SearchItem>>;

    /// Distinct namespaces known to the store.
    async fn list_namespaces(&self, options: ListNamespacesOptions) -> Result<Vec<Vec<String>>>;

    /// Execute a batch of operations; results come back in call order.
    ///
    /// The default facade runs them sequentially; backends with a cheaper
    /// bulk path may override.
    async fn batch(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreResult>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(match op {
                StoreOp::Get { namespace, key } => {
                    StoreResult::Item(self.get(&namespace, &key).await?)
                }
                StoreOp::Put {
                    namespace,
                    key,
                    value,
                    options,
                } => {
                    self.put(&namespace, &key, value, options).await?;
                    StoreResult::Unit
                }
                StoreOp::Delete { namespace, key } => {
                    self.delete(&namespace, &key).await?;
                    StoreResult::Unit
                }
                StoreOp::Search { prefix, options } => {
                    StoreResult::Search(self.search(&prefix, options).await?)
                }
                StoreOp::ListNamespaces { options } => {
                    StoreResult::Namespaces(self.list_namespaces(options).await?)
                }
            });
        }
        Ok(results)
    }
}
