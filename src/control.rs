//! Control-flow records exchanged between nodes, the scheduler, and callers.
//!
//! Nodes influence routing without touching state directly: they return a
//! [`Command`] (translated into channel writes and send packets at the step
//! boundary) or emit [`SendPacket`]s for explicit fan-out. Callers use the
//! same [`Command`] shape to resume an interrupted run.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An explicit task request: run `node` next step with `args` as its input.
///
/// Packets produced in one step land in the checkpoint's pending-send queue
/// and are planned ahead of trigger-derived tasks in the next step, in
/// emission order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendPacket {
    pub node: String,
    pub args: Value,
}

impl SendPacket {
    pub fn new(node: impl Into<String>, args: Value) -> Self {
        Self {
            node: node.into(),
            args,
        }
    }
}

/// Target of a `goto` directive.
#[derive(Clone, Debug, PartialEq)]
pub enum GotoTarget {
    /// Route to a node through its `branch:to:` channel.
    Node(String),
    /// Push an explicit task with its own input.
    Send(SendPacket),
}

impl From<&str> for GotoTarget {
    fn from(node: &str) -> Self {
        GotoTarget::Node(node.to_string())
    }
}

impl From<String> for GotoTarget {
    fn from(node: String) -> Self {
        GotoTarget::Node(node)
    }
}

impl From<SendPacket> for GotoTarget {
    fn from(send: SendPacket) -> Self {
        GotoTarget::Send(send)
    }
}

/// Resume payload supplied by the caller after an interrupt.
#[derive(Clone, Debug, PartialEq)]
pub enum Resume {
    /// One value, delivered to the sole pending interrupt.
    Value(Value),
    /// Values keyed by interrupt id, for runs with several pending interrupts.
    Map(FxHashMap<String, Value>),
}

/// Which graph a command's writes belong to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandScope {
    /// The graph that executed the node.
    #[default]
    Current,
    /// The embedding parent graph; invalid at the top level.
    Parent,
}

/// A control-flow record compiled into writes and sends.
///
/// Returned by nodes to steer the next step, or passed by callers (via
/// [`GraphInput::Command`]) to resume or redirect a run.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use stepgraph::control::{Command, SendPacket};
///
/// let cmd = Command::new()
///     .with_update("status", json!("routed"))
///     .with_goto("reviewer")
///     .with_goto(SendPacket::new("worker", json!({"shard": 2})));
/// assert_eq!(cmd.update.len(), 1);
/// assert_eq!(cmd.goto.len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    pub graph: CommandScope,
    pub update: Vec<(String, Value)>,
    pub resume: Option<Resume>,
    pub goto: Vec<GotoTarget>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the command at the embedding parent graph.
    #[must_use]
    pub fn for_parent(mut self) -> Self {
        self.graph = CommandScope::Parent;
        self
    }

    /// Add a channel write attributed to the emitting node.
    #[must_use]
    pub fn with_update(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.update.push((channel.into(), value));
        self
    }

    /// Route execution to another node (or push an explicit task).
    #[must_use]
    pub fn with_goto(mut self, target: impl Into<GotoTarget>) -> Self {
        self.goto.push(target.into());
        self
    }

    /// Answer the sole pending interrupt with `value`.
    #[must_use]
    pub fn with_resume(mut self, value: Value) -> Self {
        self.resume = Some(Resume::Value(value));
        self
    }

    /// Answer pending interrupts individually, keyed by interrupt id.
    #[must_use]
    pub fn with_resume_map(mut self, values: FxHashMap<String, Value>) -> Self {
        self.resume = Some(Resume::Map(values));
        self
    }
}

/// A resumable fault raised inside a node via `NodeContext::interrupt`.
///
/// The descriptor is stable across replays: `id` is derived from the task
/// id and the interrupt ordinal, so a resume value supplied later finds its
/// way back to the exact call site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// The payload surfaced to the caller.
    pub value: Value,
    /// Deterministic id, stable across replays of the same task.
    pub id: String,
    /// Checkpoint namespace path of the graph that raised it.
    pub namespace: Vec<String>,
    /// Whether a resume value can answer it. Always `true` for interrupts
    /// raised through the public API.
    pub resumable: bool,
}

/// Aggregated interrupts surfaced to the caller for one paused run.
#[derive(Clone, Debug, PartialEq, Error, Diagnostic, Serialize, Deserialize)]
#[error("run interrupted ({} pending interrupt(s))", interrupts.len())]
#[diagnostic(
    code(stepgraph::control::interrupted),
    help("Re-invoke with `Command::new().with_resume(..)` to continue from the paused task.")
)]
pub struct GraphInterrupt {
    pub interrupts: Vec<Interrupt>,
}

/// Input accepted by `invoke`/`stream`.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphInput {
    /// Seed the input channels and start (or restart) the run.
    Values(FxHashMap<String, Value>),
    /// Apply a control command: resume values, caller-side updates, gotos.
    Command(Command),
}

impl GraphInput {
    /// Build a `Values` input from `(channel, value)` pairs.
    pub fn values<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        GraphInput::Values(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<Command> for GraphInput {
    fn from(command: Command) -> Self {
        GraphInput::Command(command)
    }
}
