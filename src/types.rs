//! Core identifiers and reserved vocabulary for the stepgraph engine.
//!
//! This module defines the names the runtime claims for itself (channel
//! names a user graph may not occupy), the version-token primitives used
//! for change tracking, and the deterministic id constructors shared by
//! the planner and the checkpoint model.
//!
//! # Key Types
//!
//! - [`ChannelVersion`]: monotonically increasing, totally ordered per thread
//! - [`ChannelVersions`]: channel name → last committed version
//! - [`VersionsSeen`]: node name → channel name → last version observed
//!
//! # Examples
//!
//! ```rust
//! use stepgraph::types::{branch_channel, is_reserved, TASKS_CHANNEL};
//!
//! assert!(is_reserved(TASKS_CHANNEL));
//! assert!(!is_reserved("my_channel"));
//! assert_eq!(branch_channel("worker"), "branch:to:worker");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use uuid::Uuid;

/// Checkpoint schema version written into every snapshot.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Queue of `SendPacket`s produced in one step and consumed in the next.
pub const TASKS_CHANNEL: &str = "__pregel_tasks";
/// Pending-write channel carrying interrupt payloads.
pub const INTERRUPT_CHANNEL: &str = "__interrupt__";
/// Pending-write channel carrying resume payloads supplied by the caller.
pub const RESUME_CHANNEL: &str = "__resume__";
/// Virtual entry point of every graph.
pub const START_NODE: &str = "__start__";
/// Virtual exit point of every graph.
pub const END_NODE: &str = "__end__";
/// Pending-write channel recording a task failure.
pub const ERROR_CHANNEL: &str = "__error__";
/// Reserved for externally scheduled runs.
pub const SCHEDULED_CHANNEL: &str = "__scheduled__";
/// Trigger name bound to tasks planned from send packets.
pub const PUSH_TRIGGER: &str = "__pregel_push__";
/// Prefix of the ephemeral routing channels inserted for edges.
pub const BRANCH_PREFIX: &str = "branch:to:";
/// Separator for nested checkpoint namespaces.
pub const NS_SEP: &str = "|";
/// Tag that hides a chunk from user-facing streams.
pub const HIDDEN_TAG: &str = "langsmith:hidden";

/// Names the runtime reserves for itself. Graphs may not declare nodes or
/// ordinary channels under any of these.
pub const RESERVED_NAMES: [&str; 7] = [
    TASKS_CHANNEL,
    INTERRUPT_CHANNEL,
    RESUME_CHANNEL,
    START_NODE,
    END_NODE,
    ERROR_CHANNEL,
    SCHEDULED_CHANNEL,
];

/// Version token for a channel. Totally ordered within a thread; bumped to
/// `max(existing) + 1` whenever a commit mutates the channel.
pub type ChannelVersion = u64;

/// Mapping channel name → committed version.
pub type ChannelVersions = FxHashMap<String, ChannelVersion>;

/// Mapping node name → channel name → last version that node has observed.
pub type VersionsSeen = FxHashMap<String, ChannelVersions>;

/// Returns `true` if `name` is claimed by the runtime.
///
/// Covers both the fixed reserved tokens and the `branch:to:` routing
/// namespace.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name) || name.starts_with(BRANCH_PREFIX)
}

/// Name of the ephemeral routing channel that triggers `node`.
#[must_use]
pub fn branch_channel(node: &str) -> String {
    format!("{BRANCH_PREFIX}{node}")
}

/// Join a parent namespace with a child segment using the pipe separator.
#[must_use]
pub fn child_namespace(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{NS_SEP}{segment}")
    }
}

// Offset between the Gregorian epoch (1582-10-15) and the Unix epoch,
// in 100ns ticks.
const UUID_TICKS_BETWEEN_EPOCHS: u64 = 0x01B2_1DD2_1381_4000;

// Guards against two checkpoints landing on the same 100ns tick, which
// would make lexical order depend on the clock sequence alone.
static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Build a time-ordered checkpoint id for the given superstep.
///
/// The id is a version-6 UUID assembled by hand: the 60-bit Gregorian
/// timestamp occupies the leading fields (so lexical sort equals temporal
/// order), the 14-bit clock sequence carries the signed step number
/// truncated to 14 bits, and the node bits are random.
///
/// ```rust
/// use stepgraph::types::checkpoint_uuid;
///
/// let earlier = checkpoint_uuid(-1).to_string();
/// let later = checkpoint_uuid(0).to_string();
/// assert!(earlier < later);
/// ```
#[must_use]
pub fn checkpoint_uuid(step: i64) -> Uuid {
    let now = chrono::Utc::now();
    let unix_ticks =
        (now.timestamp() as u64) * 10_000_000 + u64::from(now.timestamp_subsec_nanos()) / 100;
    let mut ticks = unix_ticks + UUID_TICKS_BETWEEN_EPOCHS;
    // Monotonic within the process even if the clock stalls.
    let prev = LAST_TICKS.fetch_max(ticks, Ordering::SeqCst);
    if prev >= ticks {
        ticks = prev + 1;
        LAST_TICKS.store(ticks, Ordering::SeqCst);
    }

    let time_high = u128::from((ticks >> 28) & 0xFFFF_FFFF);
    let time_mid = u128::from((ticks >> 12) & 0xFFFF);
    let time_low = u128::from(ticks & 0x0FFF);
    let clock_seq = u128::from((step as u64) & 0x3FFF);
    let node = u128::from(rand::random::<u64>() & 0xFFFF_FFFF_FFFF);

    let bits = (time_high << 96)
        | (time_mid << 80)
        | (0x6 << 76)
        | (time_low << 64)
        | (0b10 << 62)
        | (clock_seq << 48)
        | node;
    Uuid::from_u128(bits)
}

/// Deterministic task id for one planned task.
///
/// Derived from the checkpoint id, namespace, step, planner slot, and node
/// name, so re-planning an identical checkpoint reproduces the same ids and
/// pending writes from a partial run can be matched back to their task.
#[must_use]
pub fn task_uuid(checkpoint_id: &str, ns: &str, step: i64, index: usize, node: &str) -> Uuid {
    let material = format!("{checkpoint_id}{NS_SEP}{ns}{NS_SEP}{step}{NS_SEP}{index}{NS_SEP}{node}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
}

/// Deterministic id for the `index`-th interrupt raised by a task.
#[must_use]
pub fn interrupt_uuid(task_id: &str, index: usize) -> Uuid {
    let material = format!("{task_id}{NS_SEP}{index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes())
}
