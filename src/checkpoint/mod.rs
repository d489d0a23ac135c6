//! Checkpoint data model: the per-superstep snapshot and its metadata.
//!
//! A [`Checkpoint`] captures everything the scheduler needs to replay a
//! thread from a step boundary: serialized channel values, the per-channel
//! version tokens, the per-node `versions_seen` gating map, and the queue
//! of send packets produced but not yet consumed. Checkpoints are
//! append-only per thread; forks point at their branching parent through
//! [`CheckpointMetadata::parents`] and the tuple's parent config.
//!
//! Checkpoint ids are time-ordered (see [`crate::types::checkpoint_uuid`]),
//! so the lexical order of ids equals their temporal order within a thread.

pub mod serializer;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control::SendPacket;
use crate::runtimes::runtime_config::RunConfig;
use crate::types::{
    CHECKPOINT_SCHEMA_VERSION, ChannelVersion, ChannelVersions, VersionsSeen, checkpoint_uuid,
};

/// Snapshot of one thread at a superstep boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version of this snapshot layout.
    pub v: u32,
    /// Time-ordered identifier (version-6 UUID, clock sequence = step).
    pub id: String,
    /// Creation time.
    pub ts: DateTime<Utc>,
    /// Channel name → serialized channel state. Channels with nothing to
    /// persist are omitted.
    #[serde(default)]
    pub channel_values: FxHashMap<String, Value>,
    /// Channel name → monotonically increasing version token.
    #[serde(default)]
    pub channel_versions: ChannelVersions,
    /// Node name → channel name → last version that node observed.
    #[serde(default)]
    pub versions_seen: VersionsSeen,
    /// Send packets produced by the previous step, not yet consumed.
    #[serde(default)]
    pub pending_sends: Vec<SendPacket>,
}

impl Checkpoint {
    /// Fresh, empty snapshot for the given step.
    #[must_use]
    pub fn empty(step: i64) -> Self {
        Self {
            v: CHECKPOINT_SCHEMA_VERSION,
            id: checkpoint_uuid(step).to_string(),
            ts: Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: ChannelVersions::default(),
            versions_seen: VersionsSeen::default(),
            pending_sends: Vec::new(),
        }
    }

    /// The version token the next committed mutation should use:
    /// `max(existing) + 1`.
    #[must_use]
    pub fn next_version(&self) -> ChannelVersion {
        self.channel_versions.values().copied().max().unwrap_or(0) + 1
    }

    /// Last version of `channel` a given node has observed (0 if never).
    #[must_use]
    pub fn seen_version(&self, node: &str, channel: &str) -> ChannelVersion {
        self.versions_seen
            .get(node)
            .and_then(|seen| seen.get(channel))
            .copied()
            .unwrap_or(0)
    }
}

/// How a checkpoint came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Raw caller input recorded before any superstep ran (step `-1`).
    Input,
    /// A committed superstep.
    Loop,
    /// A caller-authored state update (`update_state`).
    Update,
    /// A branch created by replaying from a historical checkpoint.
    Fork,
}

/// Metadata stored alongside each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// `-1` for the input checkpoint, then `0, 1, ...`.
    pub step: i64,
    /// Node name → the writes it contributed between the previous
    /// checkpoint and this one.
    #[serde(default)]
    pub writes: FxHashMap<String, Value>,
    /// Namespace → parent checkpoint id, for runs embedded as subgraphs.
    #[serde(default)]
    pub parents: FxHashMap<String, String>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            writes: FxHashMap::default(),
            parents: FxHashMap::default(),
        }
    }
}

/// A `(task, channel, value)` triple persisted between checkpoints.
///
/// Pending writes make partial steps crash-safe: a task whose writes are
/// already persisted is skipped on replay, and interrupt/resume payloads
/// travel through the same log under reserved channel names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: Value,
}

impl PendingWrite {
    pub fn new(task_id: impl Into<String>, channel: impl Into<String>, value: Value) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Everything a checkpointer returns for one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Config addressing this snapshot (`thread_id`, `checkpoint_ns`,
    /// `checkpoint_id`).
    pub config: RunConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    /// Config addressing the parent snapshot, when one exists.
    pub parent_config: Option<RunConfig>,
    /// Writes persisted after this checkpoint but before the next one.
    pub pending_writes: Vec<PendingWrite>,
}
