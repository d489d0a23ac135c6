//! Node execution primitives: the [`Node`] trait, its context, and errors.
//!
//! A node is a single unit of computation inside a graph. It receives the
//! read-projection of its subscribed channels (as produced by the previous
//! step — the bulk-synchronous view), performs its work, and returns a
//! [`NodeOutput`] of channel writes, send packets, and optional control
//! commands. Nodes never observe writes made by peers in the same step.
//!
//! # Error Handling
//!
//! Fatal problems are returned as `Err(NodeError)`; after the retry policy
//! is exhausted the failure is recorded as an `__error__` pending write and
//! surfaced to the caller. [`NodeContext::interrupt`] is the one deliberate
//! "error": it pauses the run resumably and must be propagated with `?`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Node for Greeter {
//!     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!         let who = input.as_str().unwrap_or("world");
//!         Ok(NodeOutput::new().with_write("greeting", json!(format!("hello {who}"))))
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::control::{Command, GraphInterrupt, Interrupt, SendPacket};
use crate::runtimes::streaming::StreamEmitter;
use crate::store::Store;
use crate::types::{NS_SEP, interrupt_uuid};

/// A user-defined unit of computation.
///
/// Implementations must be stateless with respect to the run: all durable
/// state flows through channels, the store, or interrupts. The same node
/// object may execute concurrently for several tasks in one step (send
/// fan-out), so interior state must be `Send + Sync` and step-independent.
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute with the read-projection of the node's channels and a
    /// per-task context.
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Per-task scratch state threaded through [`NodeContext`].
///
/// Tracks the interrupt ordinal and the resume queue so `interrupt` is
/// idempotent on replay, and collects send packets emitted through the
/// context rather than the return value.
#[derive(Debug, Default)]
pub struct Scratchpad {
    pub interrupt_counter: usize,
    pub resume: Vec<Value>,
    pub sends: Vec<SendPacket>,
}

/// Execution context handed to a node for one task.
///
/// Carries the task identity, the thread/namespace scope, the stream
/// emitter for mid-task chunks, and handles to the run's store and
/// interrupt scratchpad.
#[derive(Clone)]
pub struct NodeContext {
    /// Name of the executing node.
    pub node: String,
    /// Superstep the task belongs to.
    pub step: i64,
    /// Deterministic task id (stable across replays of the same step).
    pub task_id: String,
    /// Thread the run is scoped to.
    pub thread_id: String,
    /// Pipe-separated checkpoint namespace ("" at the top level).
    pub checkpoint_ns: String,
    /// Checkpoint the task was planned against.
    pub(crate) checkpoint_id: Option<String>,
    pub(crate) scratchpad: Arc<Mutex<Scratchpad>>,
    pub(crate) emitter: StreamEmitter,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) checkpointer: Option<Arc<dyn crate::runtimes::checkpointer::Checkpointer>>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("step", &self.step)
            .field("task_id", &self.task_id)
            .field("thread_id", &self.thread_id)
            .field("checkpoint_ns", &self.checkpoint_ns)
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Pause the run and surface `value` to the caller, resumably.
    ///
    /// On the first pass this fails with a resumable interrupt fault; the
    /// node must propagate it with `?`. When the caller re-invokes with a
    /// resume payload, the replayed call returns that payload instead and
    /// execution continues. Each call site gets its own ordinal, so a node
    /// may interrupt several times.
    pub fn interrupt(&self, value: Value) -> Result<Value, NodeError> {
        let mut pad = self.scratchpad.lock();
        let index = pad.interrupt_counter;
        pad.interrupt_counter += 1;
        if let Some(answer) = pad.resume.get(index) {
            return Ok(answer.clone());
        }
        let interrupt = Interrupt {
            value,
            id: interrupt_uuid(&self.task_id, index).to_string(),
            namespace: self.namespace_path(),
            resumable: true,
        };
        Err(NodeError::Interrupt(GraphInterrupt {
            interrupts: vec![interrupt],
        }))
    }

    /// Queue an explicit task for the next step.
    ///
    /// Equivalent to returning the packet in [`NodeOutput::sends`]; context
    /// sends are ordered before returned sends.
    pub fn send(&self, node: impl Into<String>, args: Value) {
        self.scratchpad.lock().sends.push(SendPacket::new(node, args));
    }

    /// Emit a user-defined chunk on the `custom` stream mode.
    ///
    /// Mid-task emissions never block the step; when the consumer lags the
    /// chunk is dropped and counted.
    pub fn emit_custom(&self, payload: Value) {
        self.emitter.emit_custom(&self.node, payload);
    }

    /// Emit a token-level chunk on the `messages` stream mode.
    pub fn emit_message(&self, payload: Value) {
        self.emitter.emit_message(&self.node, payload);
    }

    /// The run's store, when one was configured at compile time.
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    fn namespace_path(&self) -> Vec<String> {
        if self.checkpoint_ns.is_empty() {
            Vec::new()
        } else {
            self.checkpoint_ns
                .split(NS_SEP)
                .map(str::to_string)
                .collect()
        }
    }
}

/// State updates and control directives returned by a node.
///
/// All fields are optional-by-default; a node updates only what it cares
/// about. Writes target declared channels, sends queue explicit tasks, and
/// the command carries routing/resume intent translated at commit time.
#[derive(Clone, Debug, Default)]
pub struct NodeOutput {
    /// Channel writes, applied at the step boundary.
    pub writes: Vec<(String, Value)>,
    /// Explicit task packets for the next step.
    pub sends: Vec<SendPacket>,
    /// Optional control command (goto / update / parent routing).
    pub command: Option<Command>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output consisting of a single control command.
    pub fn command(command: Command) -> Self {
        Self {
            command: Some(command),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_write(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.writes.push((channel.into(), value));
        self
    }

    #[must_use]
    pub fn with_send(mut self, node: impl Into<String>, args: Value) -> Self {
        self.sends.push(SendPacket::new(node, args));
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }
}

/// Errors surfaced by node execution.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data was missing from the read projection.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stepgraph::node::missing_input),
        help("Check that an upstream node wrote the required channel: {what}.")
    )]
    MissingInput { what: &'static str },

    /// External provider or service failure. Retried by the default policy.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stepgraph::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON (de)serialization failure inside the node.
    #[error(transparent)]
    #[diagnostic(code(stepgraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed; never retried.
    #[error("validation failed: {0}")]
    #[diagnostic(code(stepgraph::node::validation))]
    ValidationFailed(String),

    /// Resumable pause raised through [`NodeContext::interrupt`], or bubbled
    /// up from an embedded subgraph. Control flow, not a defect.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Interrupt(#[from] GraphInterrupt),

    /// An embedded subgraph failed.
    #[error("subgraph failed: {0}")]
    #[diagnostic(code(stepgraph::node::subgraph))]
    Subgraph(#[source] Box<crate::runtimes::runner::RunnerError>),
}

/// Backoff policy applied to transient node failures.
///
/// `max_attempts` counts the first try; the delay between attempts grows by
/// `backoff_factor`, capped at `max_interval`, with optional jitter. The
/// `retry_on` predicate decides which failures are transient — interrupts
/// are never offered to it.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub jitter: bool,
    pub retry_on: Arc<dyn Fn(&NodeError) -> bool + Send + Sync>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_interval", &self.max_interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(128),
            jitter: true,
            retry_on: Arc::new(|err| matches!(err, NodeError::Provider { .. })),
        }
    }
}

impl RetryPolicy {
    /// Retry every failure the policy is consulted for.
    #[must_use]
    pub fn retry_all(mut self) -> Self {
        self.retry_on = Arc::new(|_| true);
        self
    }

    /// Whether `err` should be retried at 1-based attempt `attempt`.
    pub fn should_retry(&self, err: &NodeError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        (self.retry_on)(err)
    }

    /// Delay before the next attempt (1-based `attempt` just failed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_factor
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let base = self.initial_interval.mul_f64(exp).min(self.max_interval);
        if self.jitter {
            base.mul_f64(0.5 + rand::random::<f64>())
        } else {
            base
        }
    }
}
