//! Volatile reference store with filter search and an optional vector index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::{
    IndexConfig, IndexPolicy, Item, ListNamespacesOptions, PutOptions, Result, SearchItem,
    SearchOptions, Store, StoreError, validate_namespace,
};

#[derive(Clone)]
struct StoredItem {
    value: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    /// `(json pointer, embedding)` pairs for the indexed fields.
    embeddings: Vec<(String, Vec<f32>)>,
}

/// In-memory [`Store`]. Key-level atomicity comes from the single write
/// lock; embeddings are computed before the lock is taken so `put` never
/// holds it across I/O.
pub struct InMemoryStore {
    data: RwLock<FxHashMap<Vec<String>, FxHashMap<String, StoredItem>>>,
    index: Option<IndexConfig>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(FxHashMap::default()),
            index: None,
        }
    }

    /// Enable vector search over the configured fields.
    #[must_use]
    pub fn with_index(mut self, index: IndexConfig) -> Self {
        self.index = Some(index);
        self
    }

    async fn embed_fields(
        &self,
        value: &Value,
        policy: &IndexPolicy,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        let fields: &[String] = match policy {
            IndexPolicy::Skip => return Ok(Vec::new()),
            IndexPolicy::Configured => &index.fields,
            IndexPolicy::Fields(fields) => fields,
        };

        let mut pointers = Vec::new();
        let mut texts = Vec::new();
        for pointer in fields {
            if let Some(text) = value.pointer(pointer).and_then(Value::as_str) {
                pointers.push(pointer.clone());
                texts.push(text.to_string());
            }
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = index.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(StoreError::Embedding {
                message: format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                ),
            });
        }
        for vector in &vectors {
            if vector.len() != index.dims {
                return Err(StoreError::Embedding {
                    message: format!(
                        "expected {} dimensions, got {}",
                        index.dims,
                        vector.len()
                    ),
                });
            }
        }
        Ok(pointers.into_iter().zip(vectors).collect())
    }

    async fn query_vector(&self, query: &str) -> Result<Option<Vec<f32>>> {
        let Some(index) = &self.index else {
            return Ok(None);
        };
        let mut vectors = index.embedder.embed(&[query.to_string()]).await?;
        Ok(vectors.pop())
    }
}

fn expired(item: &StoredItem, now: DateTime<Utc>) -> bool {
    item.expires_at.is_some_and(|at| at <= now)
}

fn matches_filter(value: &Value, filter: &FxHashMap<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| value.get(field) == Some(expected))
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    f64::from(dot / (norm_a * norm_b))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>> {
        validate_namespace(namespace)?;
        let now = Utc::now();
        let data = self.data.read();
        Ok(data
            .get(namespace)
            .and_then(|items| items.get(key))
            .filter(|stored| !expired(stored, now))
            .map(|stored| Item {
                namespace: namespace.to_vec(),
                key: key.to_string(),
                value: stored.value.clone(),
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            }))
    }

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
        options: PutOptions,
    ) -> Result<()> {
        validate_namespace(namespace)?;
        let embeddings = self.embed_fields(&value, &options.index).await?;
        let now = Utc::now();
        let expires_at = options
            .ttl
            .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()));

        let mut data = self.data.write();
        let items = data.entry(namespace.to_vec()).or_default();
        let created_at = items
            .get(key)
            .filter(|stored| !expired(stored, now))
            .map_or(now, |stored| stored.created_at);
        items.insert(
            key.to_string(),
            StoredItem {
                value,
                created_at,
                updated_at: now,
                expires_at,
                embeddings,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<()> {
        validate_namespace(namespace)?;
        let mut data = self.data.write();
        if let Some(items) = data.get_mut(namespace) {
            items.remove(key);
            if items.is_empty() {
                data.remove(namespace);
            }
        }
        Ok(())
    }

    async fn search(&self, prefix: &[String], options: SearchOptions) -> Result<Vec<SearchItem>> {
        let query_vector = match &options.query {
            Some(query) => self.query_vector(query).await?,
            None => None,
        };
        let now = Utc::now();
        let data = self.data.read();

        let mut hits: Vec<SearchItem> = Vec::new();
        for (namespace, items) in data.iter() {
            if !namespace.starts_with(prefix) {
                continue;
            }
            for (key, stored) in items {
                if expired(stored, now) {
                    continue;
                }
                if let Some(filter) = &options.filter
                    && !matches_filter(&stored.value, filter)
                {
                    continue;
                }
                let score = query_vector.as_ref().and_then(|qv| {
                    stored
                        .embeddings
                        .iter()
                        .map(|(_, ev)| cosine(qv, ev))
                        .reduce(f64::max)
                });
                hits.push(SearchItem {
                    item: Item {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: stored.value.clone(),
                        created_at: stored.created_at,
                        updated_at: stored.updated_at,
                    },
                    score,
                });
            }
        }

        if query_vector.is_some() {
            hits.sort_by(|a, b| {
                b.score
                    .unwrap_or(f64::MIN)
                    .total_cmp(&a.score.unwrap_or(f64::MIN))
            });
        } else {
            hits.sort_by(|a, b| {
                (&a.item.namespace, &a.item.key).cmp(&(&b.item.namespace, &b.item.key))
            });
        }
        Ok(hits
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect())
    }

    async fn list_namespaces(&self, options: ListNamespacesOptions) -> Result<Vec<Vec<String>>> {
        let data = self.data.read();
        let mut namespaces: Vec<Vec<String>> = data
            .keys()
            .filter(|ns| {
                options
                    .prefix
                    .as_ref()
                    .is_none_or(|prefix| ns.starts_with(prefix))
                    && options
                        .suffix
                        .as_ref()
                        .is_none_or(|suffix| ns.ends_with(suffix))
            })
            .map(|ns| match options.max_depth {
                Some(depth) => ns[..ns.len().min(depth)].to_vec(),
                None => ns.clone(),
            })
            .collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect())
    }
}
