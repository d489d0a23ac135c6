//! Task planning: which nodes run in the next superstep, and with what.
//!
//! Planning is a pure function of the checkpoint (plus the channels
//! reconstructed from it): send packets first, in emission order, then
//! every node with unseen news on a trigger channel, in build-time node
//! order. Task ids are deterministic for a given checkpoint, so replanning
//! after a crash or interrupt reproduces the same ids and pending writes
//! can be matched back to their task.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::channels::Channel;
use crate::checkpoint::Checkpoint;
use crate::pregel::{Pregel, ReadSpec};
use crate::types::{PUSH_TRIGGER, task_uuid};

/// One executable unit for the coming superstep.
#[derive(Clone, Debug)]
pub struct PlannedTask {
    /// Deterministic id: hash of checkpoint, namespace, step, slot, node.
    pub id: String,
    pub name: String,
    /// Input projection (send args, a bare channel value, or a mapping).
    pub input: Value,
    /// Channels whose unseen news triggered the task; `__pregel_push__`
    /// for send-derived tasks.
    pub triggers: Vec<String>,
    pub from_send: bool,
}

/// Plan the tasks for the step that would commit as `step`.
pub(crate) fn plan_tasks(
    graph: &Pregel,
    checkpoint: &Checkpoint,
    channels: &FxHashMap<String, Channel>,
    ns: &str,
    step: i64,
) -> Vec<PlannedTask> {
    let mut tasks = Vec::new();
    let mut slot = 0usize;

    // Send packets first, preserving emission order.
    for send in &checkpoint.pending_sends {
        if !graph.nodes().contains_key(&send.node) {
            tracing::warn!(node = %send.node, "dropping send packet for unknown node");
            continue;
        }
        tasks.push(PlannedTask {
            id: task_uuid(&checkpoint.id, ns, step, slot, &send.node).to_string(),
            name: send.node.clone(),
            input: send.args.clone(),
            triggers: vec![PUSH_TRIGGER.to_string()],
            from_send: true,
        });
        slot += 1;
    }

    // Triggered nodes, in build-time order.
    for name in graph.node_order() {
        let node = &graph.nodes()[name];
        let triggered: Vec<String> = node
            .triggers
            .iter()
            .filter(|channel| {
                let Some(instance) = channels.get(*channel) else {
                    return false;
                };
                let version = checkpoint
                    .channel_versions
                    .get(*channel)
                    .copied()
                    .unwrap_or(0);
                instance.is_available() && version > checkpoint.seen_version(name, channel)
            })
            .cloned()
            .collect();
        if triggered.is_empty() {
            continue;
        }
        tasks.push(PlannedTask {
            id: task_uuid(&checkpoint.id, ns, step, slot, name).to_string(),
            name: name.clone(),
            input: read_input(&node.reads, channels),
            triggers: triggered,
            from_send: false,
        });
        slot += 1;
    }

    tasks
}

/// Project a node's declared reads out of the channel set.
///
/// A single-channel read spec yields the bare value; a multi-channel spec
/// yields a mapping of the available channels.
pub(crate) fn read_input(reads: &ReadSpec, channels: &FxHashMap<String, Channel>) -> Value {
    match reads {
        ReadSpec::Single(channel) => channels
            .get(channel)
            .and_then(|ch| ch.get().ok())
            .unwrap_or(Value::Null),
        ReadSpec::Many(names) => {
            let mut map = Map::new();
            for name in names {
                if let Some(value) = channels.get(name).and_then(|ch| ch.get().ok()) {
                    map.insert(name.clone(), value);
                }
            }
            Value::Object(map)
        }
    }
}

/// The values view over a set of channels, restricted to `names`.
pub(crate) fn values_view(
    channels: &FxHashMap<String, Channel>,
    names: &[String],
) -> FxHashMap<String, Value> {
    let mut view = FxHashMap::default();
    for name in names {
        if let Some(value) = channels.get(name).and_then(|ch| ch.get().ok()) {
            view.insert(name.clone(), value);
        }
    }
    view
}
