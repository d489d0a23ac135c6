//! The superstep runner: plan → run tasks → commit → emit.
//!
//! One [`PregelLoop`] drives one run of a compiled graph. Within a step,
//! tasks execute concurrently and share no mutable state; the loop itself
//! is strictly sequential between steps and owns all channel mutation. The
//! bulk-synchronous property falls out of that split: every task observes
//! the previous step's view, and all writes become visible together at the
//! commit boundary.
//!
//! Crash-safety and interrupt-resume hang off the pending-write log: task
//! writes are persisted the moment a task completes, so replanning the same
//! step (task ids are deterministic) skips finished work and replays the
//! rest.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::instrument;

use crate::channels::{Channel, ChannelError};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSource, PendingWrite};
use crate::control::{Command, CommandScope, GotoTarget, GraphInput, GraphInterrupt, Interrupt,
    Resume, SendPacket};
use crate::node::{Node, NodeContext, NodeError, NodeOutput, RetryPolicy, Scratchpad};
use crate::pregel::Pregel;
use crate::runtimes::checkpointer::{Checkpointer, CheckpointerError};
use crate::runtimes::planner::{PlannedTask, plan_tasks, values_view};
use crate::runtimes::runtime_config::{ErrorPolicy, RunConfig};
use crate::runtimes::streaming::{StreamEmitter, StreamMode};
use crate::store::Store;
use crate::types::{
    BRANCH_PREFIX, END_NODE, ERROR_CHANNEL, INTERRUPT_CHANNEL, RESUME_CHANNEL, SCHEDULED_CHANNEL,
    START_NODE, TASKS_CHANNEL, branch_channel, interrupt_uuid, is_reserved, task_uuid,
};

/// Errors surfaced by `invoke`/`stream`.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    /// The recursion limit was reached with tasks still pending. No partial
    /// commit happens for the offending step.
    #[error("recursion limit of {limit} reached at step {step} with tasks still pending")]
    #[diagnostic(
        code(stepgraph::runner::recursion),
        help("Raise `RunConfig::with_recursion_limit` or check the graph for unbounded cycles.")
    )]
    GraphRecursion { limit: usize, step: i64 },

    /// The run paused on one or more resumable interrupts.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Interrupted(#[from] GraphInterrupt),

    /// A node failed after its retry policy was exhausted.
    #[error("node `{node}` failed at step {step}: {source}")]
    #[diagnostic(code(stepgraph::runner::node_failure))]
    NodeFailure {
        node: String,
        step: i64,
        #[source]
        source: NodeError,
    },

    #[error(transparent)]
    #[diagnostic(code(stepgraph::runner::checkpointer))]
    Checkpointer(#[from] CheckpointerError),

    #[error(transparent)]
    #[diagnostic(code(stepgraph::runner::channel))]
    Channel(#[from] ChannelError),

    /// The caller's input or command was not usable for this thread.
    #[error("invalid input: {message}")]
    #[diagnostic(code(stepgraph::runner::invalid_input))]
    InvalidInput { message: String },

    #[error("task join error: {0}")]
    #[diagnostic(code(stepgraph::runner::join))]
    Join(#[from] JoinError),

    #[error("step {step} timed out")]
    #[diagnostic(code(stepgraph::runner::step_timeout))]
    StepTimeout { step: i64 },

    #[error("run cancelled")]
    #[diagnostic(code(stepgraph::runner::cancelled))]
    Cancelled,

    /// Internal: a command addressed to the parent graph, unwound to the
    /// embedding node. Reaching the caller means there was no parent.
    #[error("command addressed to a parent graph")]
    #[doc(hidden)]
    ParentCommand(Box<Command>),
}

/// Hierarchical cancellation: a token observes its whole ancestor chain.
///
/// The root is cancelled externally (dropping a stream); each step derives
/// a child so a timeout or fail-fast policy can stop sibling tasks without
/// touching the root.
#[derive(Clone, Debug)]
pub struct CancelToken {
    chain: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    pub fn root() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { chain: vec![rx] })
    }

    /// Derive a child; cancelling the returned sender stops the child scope
    /// only.
    pub fn child(&self) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        let mut chain = self.chain.clone();
        chain.push(rx);
        (tx, Self { chain })
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|rx| *rx.borrow())
    }

    /// Resolves when any ancestor (or this scope) cancels.
    pub async fn cancelled(&self) {
        let mut chain = self.chain.clone();
        loop {
            if chain.iter().any(|rx| *rx.borrow()) {
                return;
            }
            if chain.is_empty() {
                futures_util::future::pending::<()>().await;
            }
            let waits: Vec<_> = chain.iter_mut().map(|rx| Box::pin(rx.changed())).collect();
            let (result, index, _) = futures_util::future::select_all(waits).await;
            if result.is_err() {
                // Sender dropped without cancelling; stop watching it.
                chain.remove(index);
            }
        }
    }
}

enum TaskStatus {
    Done {
        output: NodeOutput,
        sends: Vec<SendPacket>,
    },
    Interrupted(GraphInterrupt),
    Failed(NodeError),
    TimedOut,
    Cancelled,
}

enum StepOutcome {
    /// Writes per task, aligned with the planned task order.
    Completed(Vec<Vec<(String, Value)>>),
    Interrupted(GraphInterrupt),
    Failed { node: String, source: NodeError },
}

/// Per-run dependencies handed to the loop.
pub(crate) struct LoopDeps {
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub store: Option<Arc<dyn Store>>,
    pub emitter: StreamEmitter,
    pub cancel: CancelToken,
}

/// One run of a compiled graph, from input (or resume) to termination.
pub(crate) struct PregelLoop<'g> {
    graph: &'g Pregel,
    config: RunConfig,
    deps: LoopDeps,
    /// Latest committed checkpoint (or the input checkpoint).
    checkpoint: Checkpoint,
    /// Metadata step of `checkpoint`.
    step: i64,
    /// In-memory mirror of the pending writes against `checkpoint`.
    pending_writes: Vec<PendingWrite>,
    /// Namespace → parent checkpoint id, recorded in every metadata.
    parents: FxHashMap<String, String>,
}

impl<'g> PregelLoop<'g> {
    pub(crate) fn new(graph: &'g Pregel, config: RunConfig, deps: LoopDeps) -> Self {
        let parents = config
            .checkpoint_map
            .iter()
            .map(|(ns, id)| (ns.clone(), id.clone()))
            .collect();
        Self {
            graph,
            config,
            deps,
            checkpoint: Checkpoint::empty(-1),
            step: -1,
            pending_writes: Vec::new(),
            parents,
        }
    }

    /// Run to termination, an interrupt, or an error.
    #[instrument(skip_all, fields(thread = ?self.config.thread_id, ns = %self.config.checkpoint_ns))]
    pub(crate) async fn run(
        mut self,
        input: Option<GraphInput>,
    ) -> Result<FxHashMap<String, Value>, RunnerError> {
        self.prepare(input).await?;

        loop {
            if self.deps.cancel.is_cancelled() {
                return Err(RunnerError::Cancelled);
            }
            let mut channels = self.build_channels()?;

            // Caller writes (input application, command translation) are
            // pending against the current checkpoint under the caller task
            // id; they commit as their own superstep before planning.
            let caller_task = self.caller_task_id();
            let caller_writes: Vec<(String, Value)> = self
                .pending_writes
                .iter()
                .filter(|w| w.task_id == caller_task)
                .map(|w| (w.channel.clone(), w.value.clone()))
                .collect();
            if !caller_writes.is_empty() {
                self.commit(channels, &[], vec![caller_writes], CheckpointSource::Loop)
                    .await?;
                continue;
            }

            let tasks = plan_tasks(
                self.graph,
                &self.checkpoint,
                &channels,
                &self.config.checkpoint_ns,
                self.step + 1,
            );

            if tasks.is_empty() {
                // Give finish-gated barriers one chance to release.
                let next_version = self.checkpoint.next_version();
                let mut finished = Vec::new();
                for name in self.graph.channel_order() {
                    if let Some(channel) = channels.get_mut(name)
                        && channel.finish()
                    {
                        finished.push(name.clone());
                    }
                }
                if finished.is_empty() {
                    break;
                }
                for name in &finished {
                    self.checkpoint
                        .channel_versions
                        .insert(name.clone(), next_version);
                }
                self.commit(channels, &[], Vec::new(), CheckpointSource::Loop)
                    .await?;
                continue;
            }

            if self.step + 1 > self.config.recursion_limit as i64 {
                return Err(RunnerError::GraphRecursion {
                    limit: self.config.recursion_limit,
                    step: self.step + 1,
                });
            }

            // Pause before nodes the graph marks, unless this planning of
            // the step already paused once (the scheduled marker).
            let fresh_pauses: Vec<&PlannedTask> = tasks
                .iter()
                .filter(|task| {
                    self.graph.interrupt_before().contains(&task.name)
                        && !self.has_writes(&task.id)
                })
                .collect();
            if !fresh_pauses.is_empty() {
                for task in fresh_pauses {
                    self.record_writes(
                        &task.id,
                        vec![(SCHEDULED_CHANNEL.to_string(), Value::Null)],
                    )
                    .await?;
                }
                return Err(RunnerError::Interrupted(GraphInterrupt {
                    interrupts: Vec::new(),
                }));
            }

            match self.run_tasks(&tasks).await? {
                StepOutcome::Interrupted(interrupt) => {
                    return Err(RunnerError::Interrupted(interrupt));
                }
                StepOutcome::Failed { node, source } => {
                    return Err(RunnerError::NodeFailure {
                        node,
                        step: self.step + 1,
                        source,
                    });
                }
                StepOutcome::Completed(writes) => {
                    let ran_pause = tasks
                        .iter()
                        .any(|task| self.graph.interrupt_after().contains(&task.name));
                    self.commit(channels, &tasks, writes, CheckpointSource::Loop)
                        .await?;
                    // The step committed; resuming continues at the next one.
                    if ran_pause {
                        return Err(RunnerError::Interrupted(GraphInterrupt {
                            interrupts: Vec::new(),
                        }));
                    }
                }
            }
        }

        let channels = self.build_channels()?;
        Ok(values_view(&channels, self.graph.output_channels()))
    }

    /// Deterministic id for caller-originated writes against the current
    /// checkpoint (input application, command translation).
    fn caller_task_id(&self) -> String {
        task_uuid(
            &self.checkpoint.id,
            &self.config.checkpoint_ns,
            self.step,
            0,
            START_NODE,
        )
        .to_string()
    }

    fn has_writes(&self, task_id: &str) -> bool {
        self.pending_writes.iter().any(|w| w.task_id == task_id)
    }

    fn completed_writes(&self, task_id: &str) -> Option<Vec<(String, Value)>> {
        let writes: Vec<(String, Value)> = self
            .pending_writes
            .iter()
            .filter(|w| {
                w.task_id == task_id
                    && w.channel != INTERRUPT_CHANNEL
                    && w.channel != RESUME_CHANNEL
                    && w.channel != SCHEDULED_CHANNEL
                    && w.channel != ERROR_CHANNEL
            })
            .map(|w| (w.channel.clone(), w.value.clone()))
            .collect();
        (!writes.is_empty()).then_some(writes)
    }

    fn resume_values(&self, task_id: &str) -> Vec<Value> {
        self.pending_writes
            .iter()
            .filter(|w| w.task_id == task_id && w.channel == RESUME_CHANNEL)
            .find_map(|w| w.value.as_array().cloned())
            .unwrap_or_default()
    }

    async fn record_writes(
        &mut self,
        task_id: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<(), RunnerError> {
        if let Some(checkpointer) = &self.deps.checkpointer {
            let config = self.config.at_checkpoint(&self.checkpoint.id);
            checkpointer
                .put_writes(&config, writes.clone(), task_id)
                .await?;
        }
        // Mirror idempotently: rewriting a channel for the same task
        // replaces the earlier entries instead of duplicating them.
        let rewritten: FxHashSet<String> = writes.iter().map(|(c, _)| c.clone()).collect();
        self.pending_writes
            .retain(|w| !(w.task_id == task_id && rewritten.contains(&w.channel)));
        for (channel, value) in writes {
            self.pending_writes
                .push(PendingWrite::new(task_id, channel, value));
        }
        Ok(())
    }

    fn build_channels(&self) -> Result<FxHashMap<String, Channel>, RunnerError> {
        let mut channels = FxHashMap::default();
        for (name, spec) in self.graph.channels() {
            let saved = self.checkpoint.channel_values.get(name);
            channels.insert(name.clone(), spec.build(name, saved)?);
        }
        Ok(channels)
    }

    // ------------------------------------------------------------------
    // Preparation: input, commands, forks
    // ------------------------------------------------------------------

    async fn prepare(&mut self, input: Option<GraphInput>) -> Result<(), RunnerError> {
        let pinned = self.config.checkpoint_id.is_some();
        let tuple = match &self.deps.checkpointer {
            Some(checkpointer) => checkpointer.get_tuple(&self.config).await?,
            None => None,
        };
        if let Some(tuple) = &tuple {
            self.checkpoint = tuple.checkpoint.clone();
            self.step = tuple.metadata.step;
            self.pending_writes = tuple.pending_writes.clone();
            self.config.checkpoint_id = Some(self.checkpoint.id.clone());
        }

        match input {
            Some(GraphInput::Values(values)) => {
                let parent_id = tuple.as_ref().map(|t| t.checkpoint.id.clone());
                let step = tuple.as_ref().map_or(-1, |t| t.metadata.step + 1);
                let checkpoint = match &tuple {
                    Some(t) => {
                        let mut checkpoint = t.checkpoint.clone();
                        checkpoint.id = crate::types::checkpoint_uuid(step).to_string();
                        checkpoint.ts = chrono::Utc::now();
                        checkpoint
                    }
                    None => Checkpoint::empty(step),
                };

                let mut writes: Vec<(String, Value)> = Vec::new();
                for (channel, value) in &values {
                    if !self.graph.input_channels().contains(channel) {
                        return Err(RunnerError::InvalidInput {
                            message: format!("`{channel}` is not an input channel"),
                        });
                    }
                    writes.push((channel.clone(), value.clone()));
                }
                for target in self.graph.start_nodes() {
                    writes.push((branch_channel(target), Value::Null));
                }
                let input_view: FxHashMap<String, Value> =
                    values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                for edge in self.graph.conditional_edges() {
                    if edge.from() != START_NODE {
                        continue;
                    }
                    for target in edge.resolve(&input_view) {
                        if target == END_NODE {
                            continue;
                        }
                        if !self.graph.nodes().contains_key(&target) {
                            tracing::warn!(target, "entry branch routed to unknown node; skipping");
                            continue;
                        }
                        writes.push((branch_channel(&target), Value::Null));
                    }
                }

                let mut metadata = CheckpointMetadata::new(CheckpointSource::Input, step);
                metadata
                    .writes
                    .insert(START_NODE.to_string(), Value::Object(values.into_iter().collect()));
                metadata.parents = self.parents.clone();

                self.config.checkpoint_id = parent_id;
                self.pending_writes.clear();
                self.persist(checkpoint, metadata).await?;
                let caller_task = self.caller_task_id();
                self.record_writes(&caller_task, writes).await?;
                Ok(())
            }
            Some(GraphInput::Command(command)) => {
                if tuple.is_none() {
                    return Err(RunnerError::InvalidInput {
                        message: "a command requires an existing thread checkpoint".to_string(),
                    });
                }
                if command.graph == CommandScope::Parent {
                    return Err(RunnerError::InvalidInput {
                        message: "no parent graph to address".to_string(),
                    });
                }
                self.apply_resume(command.resume).await?;

                let mut writes: Vec<(String, Value)> = Vec::new();
                for (channel, value) in command.update {
                    if !self.graph.channels().contains_key(&channel) || is_reserved(&channel) {
                        return Err(RunnerError::Channel(ChannelError::invalid_update(
                            &channel,
                            "not a writable declared channel",
                        )));
                    }
                    writes.push((channel, value));
                }
                for target in command.goto {
                    match target {
                        GotoTarget::Node(node) => {
                            if !self.graph.nodes().contains_key(&node) {
                                return Err(RunnerError::InvalidInput {
                                    message: format!("goto target `{node}` is not a node"),
                                });
                            }
                            writes.push((branch_channel(&node), Value::Null));
                        }
                        GotoTarget::Send(packet) => writes.push((
                            TASKS_CHANNEL.to_string(),
                            serde_json::to_value(packet).map_err(|e| RunnerError::InvalidInput {
                                message: e.to_string(),
                            })?,
                        )),
                    }
                }
                if !writes.is_empty() {
                    let caller_task = self.caller_task_id();
                    self.record_writes(&caller_task, writes).await?;
                }
                Ok(())
            }
            None => {
                if tuple.is_none() {
                    return Err(RunnerError::InvalidInput {
                        message: "nothing to run: provide input or resume an existing thread"
                            .to_string(),
                    });
                }
                // Resuming at an explicitly pinned snapshot branches
                // history: a forked copy becomes the new leaf.
                if pinned {
                    let step = self.step + 1;
                    let mut forked = self.checkpoint.clone();
                    forked.id = crate::types::checkpoint_uuid(step).to_string();
                    forked.ts = chrono::Utc::now();
                    let mut metadata = CheckpointMetadata::new(CheckpointSource::Fork, step);
                    metadata.parents = self.parents.clone();
                    self.pending_writes.clear();
                    self.persist(forked, metadata).await?;
                }
                Ok(())
            }
        }
    }

    async fn apply_resume(&mut self, resume: Option<Resume>) -> Result<(), RunnerError> {
        let Some(resume) = resume else {
            return Ok(());
        };
        // Pending interrupts, per task, in recorded order.
        let mut interrupted: Vec<(String, Vec<Interrupt>)> = Vec::new();
        for write in &self.pending_writes {
            if write.channel == INTERRUPT_CHANNEL {
                let interrupts: Vec<Interrupt> =
                    serde_json::from_value(write.value.clone()).unwrap_or_default();
                interrupted.push((write.task_id.clone(), interrupts));
            }
        }
        if interrupted.is_empty() {
            return Err(RunnerError::InvalidInput {
                message: "resume supplied but no interrupt is pending".to_string(),
            });
        }

        match resume {
            Resume::Value(value) => {
                let tasks: Vec<String> = interrupted.iter().map(|(t, _)| t.clone()).collect();
                for task_id in tasks {
                    let mut answers = self.resume_values(&task_id);
                    answers.push(value.clone());
                    self.record_writes(
                        &task_id,
                        vec![(RESUME_CHANNEL.to_string(), Value::Array(answers))],
                    )
                    .await?;
                }
            }
            Resume::Map(values) => {
                for (interrupt_id, value) in values {
                    let Some(task_id) = interrupted.iter().find_map(|(task_id, interrupts)| {
                        interrupts
                            .iter()
                            .any(|i| i.id == interrupt_id)
                            .then(|| task_id.clone())
                    }) else {
                        return Err(RunnerError::InvalidInput {
                            message: format!("no pending interrupt with id `{interrupt_id}`"),
                        });
                    };
                    // The ordinal is baked into the deterministic id; recover
                    // it so the answer lands at the right call site.
                    let Some(index) = (0..256)
                        .find(|i| interrupt_uuid(&task_id, *i).to_string() == interrupt_id)
                    else {
                        return Err(RunnerError::InvalidInput {
                            message: format!("cannot place resume value for `{interrupt_id}`"),
                        });
                    };
                    let mut answers = self.resume_values(&task_id);
                    if answers.len() <= index {
                        answers.resize(index + 1, Value::Null);
                    }
                    answers[index] = value;
                    self.record_writes(
                        &task_id,
                        vec![(RESUME_CHANNEL.to_string(), Value::Array(answers))],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task execution
    // ------------------------------------------------------------------

    async fn run_tasks(&mut self, tasks: &[PlannedTask]) -> Result<StepOutcome, RunnerError> {
        let step = self.step + 1;
        let mut results: Vec<Option<Vec<(String, Value)>>> = vec![None; tasks.len()];
        let mut interrupts: Vec<Interrupt> = Vec::new();
        let mut failure: Option<(String, NodeError)> = None;

        let (step_cancel, step_token) = self.deps.cancel.child();
        let mut join_set: JoinSet<(usize, TaskStatus)> = JoinSet::new();

        for (index, task) in tasks.iter().enumerate() {
            // Finished before a crash or interrupt: adopt its writes.
            if let Some(writes) = self.completed_writes(&task.id) {
                tracing::debug!(task = %task.name, id = %task.id, "skipping task with persisted writes");
                results[index] = Some(writes);
                continue;
            }

            let node = &self.graph.nodes()[&task.name];
            self.deps
                .emitter
                .emit(
                    StreamMode::Debug,
                    json!({
                        "type": "task",
                        "step": step,
                        "id": task.id,
                        "name": task.name,
                        "triggers": task.triggers,
                        "ts": chrono::Utc::now(),
                    }),
                )
                .await
                .map_err(|_| RunnerError::Cancelled)?;

            let emitter = if self.graph.subgraphs().contains_key(&task.name) {
                self.deps.emitter.child(&task.name)
            } else {
                self.deps.emitter.clone()
            };
            let spawned = SpawnedTask {
                node: node.node.clone(),
                retry: node.retry.clone(),
                input: task.input.clone(),
                name: task.name.clone(),
                task_id: task.id.clone(),
                checkpoint_id: self.checkpoint.id.clone(),
                step,
                thread_id: self.config.thread_id.clone().unwrap_or_default(),
                checkpoint_ns: self.config.checkpoint_ns.clone(),
                resume: self.resume_values(&task.id),
                emitter,
                store: self.deps.store.clone(),
                checkpointer: self.deps.checkpointer.clone(),
                token: step_token.clone(),
                timeout: self.config.task_timeout,
            };
            join_set.spawn(async move { (index, spawned.run().await) });
        }

        let deadline = self
            .config
            .step_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.deps.cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(RunnerError::Cancelled);
                }
                _ = async { tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)).await },
                    if deadline.is_some() => {
                    let _ = step_cancel.send(true);
                    join_set.abort_all();
                    return Err(RunnerError::StepTimeout { step });
                }
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (index, status) = joined?;
            let task = &tasks[index];

            match status {
                TaskStatus::Done { output, sends } => {
                    let writes = self.translate_output(task, output, sends)?;
                    self.record_writes(&task.id, writes.clone()).await?;
                    self.deps
                        .emitter
                        .emit(
                            StreamMode::Debug,
                            json!({
                                "type": "task_result",
                                "step": step,
                                "id": task.id,
                                "name": task.name,
                                "writes": writes.len(),
                                "ts": chrono::Utc::now(),
                            }),
                        )
                        .await
                        .map_err(|_| RunnerError::Cancelled)?;
                    results[index] = Some(writes);
                }
                TaskStatus::Interrupted(interrupt) => {
                    self.record_writes(
                        &task.id,
                        vec![(
                            INTERRUPT_CHANNEL.to_string(),
                            serde_json::to_value(&interrupt.interrupts).unwrap_or_default(),
                        )],
                    )
                    .await?;
                    interrupts.extend(interrupt.interrupts);
                }
                TaskStatus::Failed(error) => {
                    self.record_writes(
                        &task.id,
                        vec![(ERROR_CHANNEL.to_string(), json!(error.to_string()))],
                    )
                    .await?;
                    if failure.is_none() {
                        failure = Some((task.name.clone(), error));
                    }
                    if self.config.error_policy == ErrorPolicy::FailFast {
                        let _ = step_cancel.send(true);
                    }
                }
                TaskStatus::TimedOut => {
                    let error = NodeError::Provider {
                        provider: "runtime",
                        message: "task deadline exceeded".to_string(),
                    };
                    self.record_writes(
                        &task.id,
                        vec![(ERROR_CHANNEL.to_string(), json!(error.to_string()))],
                    )
                    .await?;
                    if failure.is_none() {
                        failure = Some((task.name.clone(), error));
                    }
                    if self.config.error_policy == ErrorPolicy::FailFast {
                        let _ = step_cancel.send(true);
                    }
                }
                TaskStatus::Cancelled => {
                    if failure.is_none() && interrupts.is_empty() {
                        return Err(RunnerError::Cancelled);
                    }
                }
            }
        }

        // Per-node deltas stream in the planner's stable task order, so
        // send-derived tasks are observable in emission order regardless of
        // which finished first.
        for (task, writes) in tasks.iter().zip(&results) {
            let Some(writes) = writes else { continue };
            let mut delta = Map::new();
            for (channel, value) in writes {
                if channel != TASKS_CHANNEL {
                    delta.insert(channel.clone(), value.clone());
                }
            }
            let mut payload = Map::new();
            payload.insert(task.name.clone(), Value::Object(delta));
            self.deps
                .emitter
                .emit(StreamMode::Updates, Value::Object(payload))
                .await
                .map_err(|_| RunnerError::Cancelled)?;
        }

        if let Some((node, source)) = failure {
            return Ok(StepOutcome::Failed { node, source });
        }
        if !interrupts.is_empty() {
            return Ok(StepOutcome::Interrupted(GraphInterrupt { interrupts }));
        }
        Ok(StepOutcome::Completed(
            results.into_iter().map(Option::unwrap_or_default).collect(),
        ))
    }

    /// Flatten a node's output into `(channel, value)` writes.
    fn translate_output(
        &self,
        task: &PlannedTask,
        output: NodeOutput,
        ctx_sends: Vec<SendPacket>,
    ) -> Result<Vec<(String, Value)>, RunnerError> {
        let mut writes: Vec<(String, Value)> = Vec::new();

        for packet in ctx_sends.into_iter().chain(output.sends) {
            writes.push((
                TASKS_CHANNEL.to_string(),
                serde_json::to_value(&packet).map_err(|e| RunnerError::InvalidInput {
                    message: e.to_string(),
                })?,
            ));
        }
        for (channel, value) in output.writes {
            if is_reserved(&channel) || !self.graph.channels().contains_key(&channel) {
                return Err(RunnerError::Channel(ChannelError::invalid_update(
                    &channel,
                    format!("node `{}` wrote an undeclared or reserved channel", task.name),
                )));
            }
            writes.push((channel, value));
        }

        if let Some(command) = output.command {
            if command.graph == CommandScope::Parent {
                return Err(RunnerError::ParentCommand(Box::new(
                    Command {
                        graph: CommandScope::Current,
                        ..command
                    },
                )));
            }
            if command.resume.is_some() {
                return Err(RunnerError::Channel(ChannelError::invalid_update(
                    RESUME_CHANNEL,
                    "resume is only valid from the caller",
                )));
            }
            for (channel, value) in command.update {
                if is_reserved(&channel) || !self.graph.channels().contains_key(&channel) {
                    return Err(RunnerError::Channel(ChannelError::invalid_update(
                        &channel,
                        format!("command from `{}` targets an undeclared channel", task.name),
                    )));
                }
                writes.push((channel, value));
            }
            for target in command.goto {
                match target {
                    GotoTarget::Node(node) => {
                        if !self.graph.nodes().contains_key(&node) {
                            return Err(RunnerError::InvalidInput {
                                message: format!("goto target `{node}` is not a node"),
                            });
                        }
                        writes.push((branch_channel(&node), Value::Null));
                    }
                    GotoTarget::Send(packet) => writes.push((
                        TASKS_CHANNEL.to_string(),
                        serde_json::to_value(&packet).map_err(|e| RunnerError::InvalidInput {
                            message: e.to_string(),
                        })?,
                    )),
                }
            }
        }
        Ok(writes)
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Apply one step's writes and persist the next checkpoint.
    ///
    /// Write application is deterministic: ordinary writes grouped per
    /// channel in task order, then routing writes derived from the ran
    /// nodes, then the decay pass over untouched channels. Versions bump to
    /// `max + 1`; `versions_seen` advances for every trigger that fired.
    async fn commit(
        &mut self,
        mut channels: FxHashMap<String, Channel>,
        tasks: &[PlannedTask],
        writes: Vec<Vec<(String, Value)>>,
        source: CheckpointSource,
    ) -> Result<(), RunnerError> {
        let step = self.step + 1;
        let next_version = self.checkpoint.next_version();
        let mut versions = self.checkpoint.channel_versions.clone();
        let mut seen = self.checkpoint.versions_seen.clone();
        let mut pending_sends: Vec<SendPacket> = Vec::new();
        let mut metadata_writes: FxHashMap<String, Value> = FxHashMap::default();

        // Group ordinary writes per channel, preserving task order.
        let mut group_order: Vec<String> = Vec::new();
        let mut groups: FxHashMap<String, Vec<Value>> = FxHashMap::default();
        for (slot, task_writes) in writes.iter().enumerate() {
            let mut delta = Map::new();
            for (channel, value) in task_writes {
                if channel == TASKS_CHANNEL {
                    match serde_json::from_value::<SendPacket>(value.clone()) {
                        Ok(packet) => pending_sends.push(packet),
                        Err(err) => tracing::warn!(%err, "discarding malformed send packet"),
                    }
                    continue;
                }
                if channel == INTERRUPT_CHANNEL
                    || channel == RESUME_CHANNEL
                    || channel == ERROR_CHANNEL
                    || channel == SCHEDULED_CHANNEL
                {
                    continue;
                }
                if !groups.contains_key(channel) {
                    group_order.push(channel.clone());
                }
                let group = groups.entry(channel.clone()).or_default();
                // Routing markers collapse: any number of gotos aimed at one
                // node still arm its branch channel exactly once.
                if !(channel.starts_with(BRANCH_PREFIX) && !group.is_empty()) {
                    group.push(value.clone());
                }
                delta.insert(channel.clone(), value.clone());
            }
            if let Some(task) = tasks.get(slot) {
                metadata_writes.insert(task.name.clone(), Value::Object(delta));
            }
        }

        let mut updated: FxHashSet<String> = FxHashSet::default();
        for channel in &group_order {
            let values = groups.remove(channel).unwrap_or_default();
            let instance =
                channels
                    .get_mut(channel)
                    .ok_or_else(|| ChannelError::invalid_update(
                        channel,
                        "write targets an unknown channel",
                    ))?;
            if instance.update(values)? {
                versions.insert(channel.clone(), next_version);
                updated.insert(channel.clone());
            }
        }

        // Routing: static successors plus conditional edges, evaluated on
        // the post-apply view.
        let view = values_view(&channels, self.graph.channel_order());
        let mut targets: Vec<String> = Vec::new();
        for task in tasks {
            let node = &self.graph.nodes()[&task.name];
            for successor in &node.successors {
                if !targets.contains(successor) {
                    targets.push(successor.clone());
                }
            }
            for edge in self.graph.conditional_edges() {
                if edge.from() != task.name {
                    continue;
                }
                for target in edge.resolve(&view) {
                    if target == END_NODE {
                        continue;
                    }
                    if !self.graph.nodes().contains_key(&target) {
                        tracing::warn!(target, "conditional edge routed to unknown node; skipping");
                        continue;
                    }
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
        for target in targets {
            let channel = branch_channel(&target);
            if updated.contains(&channel) {
                continue;
            }
            if let Some(instance) = channels.get_mut(&channel)
                && instance.update(vec![Value::Null])?
            {
                versions.insert(channel.clone(), next_version);
                updated.insert(channel);
            }
        }

        // Decay pass: untouched channels get an empty group so ephemeral
        // values expire exactly at the step boundary.
        for name in self.graph.channel_order() {
            if updated.contains(name) {
                continue;
            }
            if let Some(instance) = channels.get_mut(name)
                && instance.update(Vec::new())?
            {
                versions.insert(name.clone(), next_version);
            }
        }

        // A node is not re-triggered by news it just acted on.
        for task in tasks {
            if task.from_send {
                continue;
            }
            let entry = seen.entry(task.name.clone()).or_default();
            for trigger in &task.triggers {
                if let Some(version) = versions.get(trigger) {
                    entry.insert(trigger.clone(), *version);
                }
            }
        }
        // Barriers that released this step reset for the next round.
        for task in tasks {
            for trigger in &task.triggers {
                if let Some(instance) = channels.get_mut(trigger) {
                    instance.consume();
                }
            }
        }

        let mut checkpoint = Checkpoint {
            v: self.checkpoint.v,
            id: crate::types::checkpoint_uuid(step).to_string(),
            ts: chrono::Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: versions,
            versions_seen: seen,
            pending_sends,
        };
        for name in self.graph.channel_order() {
            if let Some(instance) = channels.get(name)
                && let Ok(value) = instance.checkpoint()
            {
                checkpoint.channel_values.insert(name.clone(), value);
            }
        }

        let mut metadata = CheckpointMetadata::new(source, step);
        metadata.writes = metadata_writes;
        metadata.parents = self.parents.clone();

        self.persist(checkpoint, metadata).await?;

        self.deps
            .emitter
            .emit(
                StreamMode::Values,
                Value::Object(
                    values_view(&channels, self.graph.stream_channels())
                        .into_iter()
                        .collect(),
                ),
            )
            .await
            .map_err(|_| RunnerError::Cancelled)?;
        Ok(())
    }

    /// Store a checkpoint and advance the loop's position to it.
    async fn persist(
        &mut self,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<(), RunnerError> {
        let step = metadata.step;
        if let Some(checkpointer) = &self.deps.checkpointer {
            self.config = checkpointer
                .put(
                    &self.config,
                    checkpoint.clone(),
                    metadata,
                    checkpoint.channel_versions.clone(),
                )
                .await?;
        } else {
            self.config.checkpoint_id = Some(checkpoint.id.clone());
        }
        self.checkpoint = checkpoint;
        self.step = step;
        self.pending_writes.clear();
        Ok(())
    }
}

/// Everything one spawned task needs, owned.
struct SpawnedTask {
    node: Arc<dyn Node>,
    retry: Option<RetryPolicy>,
    input: Value,
    name: String,
    task_id: String,
    checkpoint_id: String,
    step: i64,
    thread_id: String,
    checkpoint_ns: String,
    resume: Vec<Value>,
    emitter: StreamEmitter,
    store: Option<Arc<dyn Store>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    token: CancelToken,
    timeout: Option<Duration>,
}

impl SpawnedTask {
    async fn run(self) -> TaskStatus {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Fresh scratchpad per attempt so interrupt ordinals replay
            // identically; resume answers are re-seeded each time.
            let scratchpad = Arc::new(Mutex::new(Scratchpad {
                resume: self.resume.clone(),
                ..Default::default()
            }));
            let ctx = NodeContext {
                node: self.name.clone(),
                step: self.step,
                task_id: self.task_id.clone(),
                thread_id: self.thread_id.clone(),
                checkpoint_ns: self.checkpoint_ns.clone(),
                checkpoint_id: Some(self.checkpoint_id.clone()),
                scratchpad: scratchpad.clone(),
                emitter: self.emitter.clone(),
                store: self.store.clone(),
                checkpointer: self.checkpointer.clone(),
            };

            let attempt_result = {
                let work = self.node.run(self.input.clone(), ctx);
                let bounded = async {
                    match self.timeout {
                        Some(timeout) => tokio::time::timeout(timeout, work)
                            .await
                            .map_err(|_| None)
                            .and_then(|r| r.map_err(Some)),
                        None => work.await.map_err(Some),
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return TaskStatus::Cancelled,
                    result = bounded => result,
                }
            };

            match attempt_result {
                Ok(output) => {
                    let sends = std::mem::take(&mut scratchpad.lock().sends);
                    return TaskStatus::Done { output, sends };
                }
                Err(None) => return TaskStatus::TimedOut,
                Err(Some(NodeError::Interrupt(interrupt))) => {
                    return TaskStatus::Interrupted(interrupt);
                }
                Err(Some(error)) => {
                    let retryable = self
                        .retry
                        .as_ref()
                        .is_some_and(|policy| policy.should_retry(&error, attempt));
                    if !retryable {
                        return TaskStatus::Failed(error);
                    }
                    let delay = self
                        .retry
                        .as_ref()
                        .map(|policy| policy.delay(attempt))
                        .unwrap_or_default();
                    tracing::debug!(
                        node = %self.name,
                        attempt,
                        ?delay,
                        %error,
                        "retrying task after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
