//! Checkpointer contract and the in-memory reference implementation.
//!
//! A checkpointer is the pluggable durable store of checkpoints and pending
//! writes. The contract the runner relies on:
//!
//! - `put` is idempotent on `(thread_id, checkpoint_ns, checkpoint_id)`.
//! - `put_writes` is idempotent per `(checkpoint_id, task_id, write index)`;
//!   reapplying the same writes does not duplicate them.
//! - `put` and `put_writes` for the same snapshot are observable atomically
//!   together on the next `get_tuple`: pending writes are either fully
//!   visible alongside their checkpoint or not at all. Backends without
//!   multi-statement atomicity must wrap them in a transaction.
//! - Writes for one `(thread, ns)` are serialized by the backend.
//!
//! [`InMemoryCheckpointer`] is volatile process-local storage for tests and
//! ephemeral runs; it round-trips every checkpoint through the JSON-plus
//! serializer so stored state is isolated from caller mutation exactly like
//! a durable backend.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::serializer::{JsonPlusSerializer, Serializer, SerializerError};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointTuple, PendingWrite};
use crate::runtimes::runtime_config::RunConfig;
use crate::types::ChannelVersions;

/// Errors from checkpointer operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    /// The config does not carry the identity the operation needs.
    #[error("config is missing a thread_id")]
    #[diagnostic(
        code(stepgraph::checkpointer::missing_thread),
        help("Persistence requires `RunConfig::for_thread(..)` or equivalent.")
    )]
    MissingThread,

    /// Backend storage error (database, filesystem, poisoned lock).
    #[error("backend error: {message}")]
    #[diagnostic(code(stepgraph::checkpointer::backend))]
    Backend { message: String },

    /// Payload (de)serialization failed.
    #[error(transparent)]
    #[diagnostic(code(stepgraph::checkpointer::serializer))]
    Serializer(#[from] SerializerError),
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Options for [`Checkpointer::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Maximum tuples to return.
    pub limit: Option<usize>,
    /// Only tuples strictly older than this checkpoint id.
    pub before: Option<String>,
    /// Metadata fields that must match exactly (compared as JSON).
    pub filter: Option<FxHashMap<String, Value>>,
}

/// Pluggable durable store of checkpoints and pending writes.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Latest tuple for the config's thread/namespace, or the snapshot
    /// named by `checkpoint_id` when one is pinned.
    async fn get_tuple(&self, config: &RunConfig) -> Result<Option<CheckpointTuple>>;

    /// Tuples for the config's thread/namespace, newest first.
    async fn list(&self, config: &RunConfig, options: ListOptions) -> Result<Vec<CheckpointTuple>>;

    /// Persist a checkpoint; returns the config addressing it.
    ///
    /// `new_versions` names the channel versions introduced by this commit;
    /// incremental backends may use it to store only the delta.
    async fn put(
        &self,
        config: &RunConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<RunConfig>;

    /// Append pending writes for `task_id` against the config's checkpoint.
    async fn put_writes(
        &self,
        config: &RunConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Remove every checkpoint, in every namespace, for `thread_id`.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

struct StoredCheckpoint {
    blob: Vec<u8>,
    metadata: CheckpointMetadata,
    parent_id: Option<String>,
    /// Keyed by `(task_id, write index)` for idempotent reapplication.
    writes: BTreeMap<(String, usize), (String, Vec<u8>)>,
    expires_at: Option<DateTime<Utc>>,
}

type NamespaceMap = FxHashMap<String, BTreeMap<String, StoredCheckpoint>>;

/// Volatile checkpointer storing full history per `(thread, namespace)`.
///
/// History is keyed by checkpoint id; ids are time-ordered, so the map
/// order is the temporal order and the last entry is the latest snapshot.
pub struct InMemoryCheckpointer {
    threads: RwLock<FxHashMap<String, NamespaceMap>>,
    serializer: Box<dyn Serializer>,
    ttl: Option<Duration>,
}

impl Default for InMemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(FxHashMap::default()),
            serializer: Box::new(JsonPlusSerializer),
            ttl: None,
        }
    }

    /// Expire stored tuples `ttl` after their `put`.
    ///
    /// Expired tuples are filtered from every read; [`Self::sweep`] evicts
    /// them eagerly.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Evict expired tuples. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut threads = self.threads.write().map_err(poisoned)?;
        let mut evicted = 0;
        for namespaces in threads.values_mut() {
            for history in namespaces.values_mut() {
                let before = history.len();
                history.retain(|_, stored| !expired(stored, now));
                evicted += before - history.len();
            }
        }
        Ok(evicted)
    }

    fn thread_id(config: &RunConfig) -> Result<&str> {
        config
            .thread_id
            .as_deref()
            .ok_or(CheckpointerError::MissingThread)
    }

    fn tuple_from(
        &self,
        config: &RunConfig,
        id: &str,
        stored: &StoredCheckpoint,
    ) -> Result<CheckpointTuple> {
        let value = self.serializer.loads(&stored.blob)?;
        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(SerializerError::Json)?;
        let mut pending_writes = Vec::with_capacity(stored.writes.len());
        for ((task_id, _), (channel, blob)) in &stored.writes {
            pending_writes.push(PendingWrite::new(
                task_id.clone(),
                channel.clone(),
                self.serializer.loads(blob)?,
            ));
        }
        Ok(CheckpointTuple {
            config: config.at_checkpoint(id),
            checkpoint,
            metadata: stored.metadata.clone(),
            parent_config: stored
                .parent_id
                .as_ref()
                .map(|parent| config.at_checkpoint(parent)),
            pending_writes,
        })
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> CheckpointerError {
    CheckpointerError::Backend {
        message: format!("lock poisoned: {err}"),
    }
}

fn expired(stored: &StoredCheckpoint, now: DateTime<Utc>) -> bool {
    stored.expires_at.is_some_and(|at| at <= now)
}

fn metadata_matches(metadata: &CheckpointMetadata, filter: &FxHashMap<String, Value>) -> bool {
    let Ok(encoded) = serde_json::to_value(metadata) else {
        return false;
    };
    filter
        .iter()
        .all(|(key, expected)| encoded.get(key) == Some(expected))
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn get_tuple(&self, config: &RunConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = Self::thread_id(config)?;
        let now = Utc::now();
        let threads = self.threads.read().map_err(poisoned)?;
        let Some(history) = threads
            .get(thread_id)
            .and_then(|namespaces| namespaces.get(&config.checkpoint_ns))
        else {
            return Ok(None);
        };

        let found = match &config.checkpoint_id {
            Some(id) => history.get_key_value(id),
            None => history.iter().next_back(),
        };
        match found {
            Some((id, stored)) if !expired(stored, now) => {
                Ok(Some(self.tuple_from(config, id, stored)?))
            }
            _ => Ok(None),
        }
    }

    async fn list(&self, config: &RunConfig, options: ListOptions) -> Result<Vec<CheckpointTuple>> {
        let thread_id = Self::thread_id(config)?;
        let now = Utc::now();
        let threads = self.threads.read().map_err(poisoned)?;
        let Some(history) = threads
            .get(thread_id)
            .and_then(|namespaces| namespaces.get(&config.checkpoint_ns))
        else {
            return Ok(Vec::new());
        };

        let mut tuples = Vec::new();
        for (id, stored) in history.iter().rev() {
            if expired(stored, now) {
                continue;
            }
            if let Some(before) = &options.before
                && id >= before
            {
                continue;
            }
            if let Some(filter) = &options.filter
                && !metadata_matches(&stored.metadata, filter)
            {
                continue;
            }
            tuples.push(self.tuple_from(config, id, stored)?);
            if options.limit.is_some_and(|limit| tuples.len() >= limit) {
                break;
            }
        }
        Ok(tuples)
    }

    async fn put(
        &self,
        config: &RunConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<RunConfig> {
        let thread_id = Self::thread_id(config)?.to_string();
        let id = checkpoint.id.clone();
        let blob = self
            .serializer
            .dumps(&serde_json::to_value(&checkpoint).map_err(SerializerError::Json)?)?;

        let mut threads = self.threads.write().map_err(poisoned)?;
        let history = threads
            .entry(thread_id.clone())
            .or_default()
            .entry(config.checkpoint_ns.clone())
            .or_default();
        // Idempotent on (thread, ns, id): replacing keeps already-appended
        // writes for the same snapshot.
        let writes = history
            .remove(&id)
            .map(|previous| previous.writes)
            .unwrap_or_default();
        history.insert(
            id.clone(),
            StoredCheckpoint {
                blob,
                metadata,
                parent_id: config.checkpoint_id.clone(),
                writes,
                expires_at: self.ttl.map(|ttl| {
                    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
                }),
            },
        );

        let mut updated = config.clone();
        updated.thread_id = Some(thread_id);
        updated.checkpoint_id = Some(id);
        Ok(updated)
    }

    async fn put_writes(
        &self,
        config: &RunConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        let thread_id = Self::thread_id(config)?;
        let Some(checkpoint_id) = &config.checkpoint_id else {
            return Err(CheckpointerError::Backend {
                message: "put_writes requires a checkpoint_id".to_string(),
            });
        };

        let mut threads = self.threads.write().map_err(poisoned)?;
        let stored = threads
            .get_mut(thread_id)
            .and_then(|namespaces| namespaces.get_mut(&config.checkpoint_ns))
            .and_then(|history| history.get_mut(checkpoint_id))
            .ok_or_else(|| CheckpointerError::Backend {
                message: format!("unknown checkpoint `{checkpoint_id}` for pending writes"),
            })?;

        for (index, (channel, value)) in writes.into_iter().enumerate() {
            let blob = self.serializer.dumps(&value)?;
            stored
                .writes
                .insert((task_id.to_string(), index), (channel, blob));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut threads = self.threads.write().map_err(poisoned)?;
        threads.remove(thread_id);
        Ok(())
    }
}
