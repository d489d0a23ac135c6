//! The compiled graph: an immutable execution plan with a library API.
//!
//! [`Pregel`] is what `GraphBuilder::compile` produces. It holds the node
//! plans, channel factories, routing tables, and the injected checkpointer
//! and store; nothing about it changes at runtime, so one compiled graph
//! can serve any number of concurrent threads.
//!
//! # Execution surface
//!
//! - [`Pregel::invoke`] — run to termination or interrupt, return values
//! - [`Pregel::stream`] — run in the background, yield per-step chunks
//! - [`Pregel::get_state`] / [`Pregel::get_state_history`] — inspect a thread
//! - [`Pregel::update_state`] — author a checkpoint "as" a node (branching)
//! - [`Pregel::get_subgraphs`] — enumerate embedded compiled graphs
//!
//! A `Pregel` embedded as a node of another graph executes under its own
//! checkpoint namespace; see [`SubgraphNode`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::instrument;

use crate::channels::{Channel, ChannelError, ChannelSpec};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointTuple};
use crate::control::{Command, GraphInput, Interrupt};
use crate::graphs::ConditionalEdge;
use crate::node::{Node, NodeContext, NodeError, NodeOutput, RetryPolicy};
use crate::runtimes::checkpointer::{Checkpointer, ListOptions};
use crate::runtimes::planner::{plan_tasks, values_view};
use crate::runtimes::runner::{CancelToken, LoopDeps, PregelLoop, RunnerError};
use crate::runtimes::runtime_config::RunConfig;
use crate::runtimes::streaming::{RunStream, StreamEmitter, StreamMode, StreamOptions};
use crate::store::Store;
use crate::types::{
    END_NODE, ERROR_CHANNEL, INTERRUPT_CHANNEL, START_NODE, branch_channel, child_namespace,
};

/// Which channels project into a node's input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadSpec {
    /// Project one channel as the bare input value.
    Single(String),
    /// Project several channels as a mapping of the available ones.
    Many(Vec<String>),
}

/// A compiled node: its subscriptions, read projection, routing, and retry
/// policy, plus the user function itself.
#[derive(Clone)]
pub struct PregelNode {
    pub name: String,
    /// Channels whose unseen news makes the node eligible.
    pub triggers: Vec<String>,
    pub reads: ReadSpec,
    /// Static edge targets routed after the node runs.
    pub successors: Vec<String>,
    pub retry: Option<RetryPolicy>,
    pub node: Arc<dyn Node>,
}

impl std::fmt::Debug for PregelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PregelNode")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("successors", &self.successors)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a thread, as returned by [`Pregel::get_state`].
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    /// Values of the output channels at this checkpoint.
    pub values: FxHashMap<String, Value>,
    /// Names of the nodes that would run next.
    pub next: Vec<String>,
    /// Config addressing this checkpoint.
    pub config: RunConfig,
    pub metadata: Option<CheckpointMetadata>,
    pub created_at: Option<DateTime<Utc>>,
    pub parent_config: Option<RunConfig>,
    /// Planned tasks with their recorded interrupts and errors.
    pub tasks: Vec<TaskSnapshot>,
}

/// One planned task inside a [`StateSnapshot`].
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    /// Error recorded for the task in the pending-write log, if any.
    pub error: Option<Value>,
    /// Interrupts the task has raised and not yet been resumed past.
    pub interrupts: Vec<Interrupt>,
}

pub(crate) struct PregelParts {
    pub nodes: FxHashMap<String, PregelNode>,
    pub node_order: Vec<String>,
    pub channels: FxHashMap<String, ChannelSpec>,
    pub channel_order: Vec<String>,
    pub input_channels: Vec<String>,
    pub output_channels: Vec<String>,
    pub stream_channels: Vec<String>,
    pub conditional_edges: Vec<ConditionalEdge>,
    pub start_nodes: Vec<String>,
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
    pub subgraphs: FxHashMap<String, Arc<Pregel>>,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub store: Option<Arc<dyn Store>>,
}

/// An immutable, executable graph plan.
pub struct Pregel {
    nodes: FxHashMap<String, PregelNode>,
    node_order: Vec<String>,
    channels: FxHashMap<String, ChannelSpec>,
    channel_order: Vec<String>,
    input_channels: Vec<String>,
    output_channels: Vec<String>,
    stream_channels: Vec<String>,
    conditional_edges: Vec<ConditionalEdge>,
    start_nodes: Vec<String>,
    interrupt_before: Vec<String>,
    interrupt_after: Vec<String>,
    subgraphs: FxHashMap<String, Arc<Pregel>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    store: Option<Arc<dyn Store>>,
}

impl std::fmt::Debug for Pregel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pregel")
            .field("nodes", &self.node_order)
            .field("channels", &self.channel_order)
            .finish_non_exhaustive()
    }
}

impl Pregel {
    pub(crate) fn from_parts(parts: PregelParts) -> Self {
        Self {
            nodes: parts.nodes,
            node_order: parts.node_order,
            channels: parts.channels,
            channel_order: parts.channel_order,
            input_channels: parts.input_channels,
            output_channels: parts.output_channels,
            stream_channels: parts.stream_channels,
            conditional_edges: parts.conditional_edges,
            start_nodes: parts.start_nodes,
            interrupt_before: parts.interrupt_before,
            interrupt_after: parts.interrupt_after,
            subgraphs: parts.subgraphs,
            checkpointer: parts.checkpointer,
            store: parts.store,
        }
    }

    pub fn nodes(&self) -> &FxHashMap<String, PregelNode> {
        &self.nodes
    }

    pub fn node_order(&self) -> &[String] {
        &self.node_order
    }

    pub fn channels(&self) -> &FxHashMap<String, ChannelSpec> {
        &self.channels
    }

    pub fn channel_order(&self) -> &[String] {
        &self.channel_order
    }

    pub fn input_channels(&self) -> &[String] {
        &self.input_channels
    }

    pub fn output_channels(&self) -> &[String] {
        &self.output_channels
    }

    pub fn stream_channels(&self) -> &[String] {
        &self.stream_channels
    }

    pub fn conditional_edges(&self) -> &[ConditionalEdge] {
        &self.conditional_edges
    }

    pub fn start_nodes(&self) -> &[String] {
        &self.start_nodes
    }

    pub fn interrupt_before(&self) -> &[String] {
        &self.interrupt_before
    }

    pub fn interrupt_after(&self) -> &[String] {
        &self.interrupt_after
    }

    pub fn subgraphs(&self) -> &FxHashMap<String, Arc<Pregel>> {
        &self.subgraphs
    }

    pub fn checkpointer(&self) -> Option<Arc<dyn Checkpointer>> {
        self.checkpointer.clone()
    }

    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// Embedded compiled graphs, by node name.
    pub fn get_subgraphs(&self) -> impl Iterator<Item = (&str, &Arc<Pregel>)> {
        self.subgraphs.iter().map(|(name, g)| (name.as_str(), g))
    }

    /// Run until termination or interrupt; returns the output channel
    /// values.
    ///
    /// An interrupt surfaces as [`RunnerError::Interrupted`] carrying the
    /// pending payloads; re-invoke with
    /// `GraphInput::Command(Command::new().with_resume(..))` to continue.
    #[instrument(skip(self, input), err)]
    pub async fn invoke(
        &self,
        input: Option<GraphInput>,
        config: RunConfig,
    ) -> Result<FxHashMap<String, Value>, RunnerError> {
        let (_root, cancel) = CancelToken::root();
        let deps = LoopDeps {
            checkpointer: self.checkpointer.clone(),
            store: self.store.clone(),
            emitter: StreamEmitter::disabled(),
            cancel,
        };
        match PregelLoop::new(self, config, deps).run(input).await {
            Err(RunnerError::ParentCommand(_)) => Err(RunnerError::Channel(
                ChannelError::invalid_update("__command__", "no parent graph to address"),
            )),
            other => other,
        }
    }

    /// Run in the background and stream chunks per superstep.
    ///
    /// Node failures arrive as the stream's terminal `Err` item; interrupts
    /// arrive as an `updates` chunk under `__interrupt__` and close the
    /// stream cleanly. Dropping the stream cancels the run.
    pub fn stream(
        self: &Arc<Self>,
        input: Option<GraphInput>,
        config: RunConfig,
        options: StreamOptions,
    ) -> RunStream {
        let (tx, rx) = flume::bounded(config.stream_buffer);
        let emitter = StreamEmitter::new(tx, &options);
        let (cancel_tx, cancel) = CancelToken::root();
        let graph = Arc::clone(self);
        let task_emitter = emitter.clone();
        tokio::spawn(async move {
            let deps = LoopDeps {
                checkpointer: graph.checkpointer.clone(),
                store: graph.store.clone(),
                emitter: task_emitter.clone(),
                cancel,
            };
            let result = PregelLoop::new(&graph, config, deps).run(input).await;
            match result {
                Ok(_) => {}
                Err(RunnerError::Interrupted(interrupt)) => {
                    let mut payload = serde_json::Map::new();
                    payload.insert(
                        INTERRUPT_CHANNEL.to_string(),
                        serde_json::to_value(&interrupt.interrupts).unwrap_or_default(),
                    );
                    let _ = task_emitter
                        .emit(StreamMode::Updates, Value::Object(payload))
                        .await;
                }
                Err(RunnerError::Cancelled) => {}
                Err(error) => task_emitter.fail(error).await,
            }
        });
        RunStream::new(rx, cancel_tx)
    }

    /// Latest (or pinned) state of a thread.
    pub async fn get_state(&self, config: &RunConfig) -> Result<StateSnapshot, RunnerError> {
        let checkpointer = self.require_checkpointer()?;
        let tuple = checkpointer
            .get_tuple(config)
            .await?
            .ok_or_else(|| RunnerError::InvalidInput {
                message: "no checkpoint for this thread".to_string(),
            })?;
        self.snapshot_from_tuple(tuple)
    }

    /// Snapshots for a thread, newest first.
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        options: ListOptions,
    ) -> Result<Vec<StateSnapshot>, RunnerError> {
        let checkpointer = self.require_checkpointer()?;
        let tuples = checkpointer.list(config, options).await?;
        tuples
            .into_iter()
            .map(|tuple| self.snapshot_from_tuple(tuple))
            .collect()
    }

    /// Write a checkpoint authored "as" a node, branching history at the
    /// addressed snapshot.
    ///
    /// `as_node` may be omitted when it is unambiguous (single-node graph,
    /// or a sole writer in the source checkpoint). The update only produces
    /// the checkpoint; the next `invoke`/`stream` advances from it.
    #[instrument(skip(self, values), err)]
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Vec<(String, Value)>,
        as_node: Option<&str>,
    ) -> Result<RunConfig, RunnerError> {
        let checkpointer = self.require_checkpointer()?;
        let tuple = checkpointer
            .get_tuple(config)
            .await?
            .ok_or_else(|| RunnerError::InvalidInput {
                message: "no checkpoint to update".to_string(),
            })?;

        let as_node = self.resolve_as_node(&tuple, as_node)?;
        let mut channels = self.channels_from(&tuple.checkpoint)?;
        let next_version = tuple.checkpoint.next_version();
        let mut versions = tuple.checkpoint.channel_versions.clone();
        let mut seen = tuple.checkpoint.versions_seen.clone();

        let mut updated: Vec<String> = Vec::new();
        let mut delta = serde_json::Map::new();
        let mut order: Vec<String> = Vec::new();
        let mut groups: FxHashMap<String, Vec<Value>> = FxHashMap::default();
        for (channel, value) in values {
            if crate::types::is_reserved(&channel) || !self.channels.contains_key(&channel) {
                return Err(RunnerError::Channel(ChannelError::invalid_update(
                    &channel,
                    "not a writable declared channel",
                )));
            }
            if !groups.contains_key(&channel) {
                order.push(channel.clone());
            }
            delta.insert(channel.clone(), value.clone());
            groups.entry(channel).or_default().push(value);
        }
        for channel in &order {
            let group = groups.remove(channel).unwrap_or_default();
            let instance = channels.get_mut(channel).ok_or_else(|| {
                ChannelError::invalid_update(channel, "write targets an unknown channel")
            })?;
            if instance.update(group)? {
                versions.insert(channel.clone(), next_version);
                updated.push(channel.clone());
            }
        }

        // Fire the authoring node's edges so the next run continues past it.
        let view = values_view(&channels, &self.channel_order);
        let mut targets: Vec<String> = Vec::new();
        if as_node == START_NODE {
            targets.extend(self.start_nodes.iter().cloned());
        } else if let Some(node) = self.nodes.get(&as_node) {
            targets.extend(node.successors.iter().cloned());
        }
        for edge in &self.conditional_edges {
            if edge.from() != as_node {
                continue;
            }
            for target in edge.resolve(&view) {
                if target != END_NODE && self.nodes.contains_key(&target) {
                    targets.push(target);
                }
            }
        }
        targets.dedup();
        for target in targets {
            let channel = branch_channel(&target);
            if updated.contains(&channel) {
                continue;
            }
            if let Some(instance) = channels.get_mut(&channel)
                && instance.update(vec![Value::Null])?
            {
                versions.insert(channel.clone(), next_version);
                updated.push(channel);
            }
        }

        // The update stands in for a run of the node: everything that could
        // have triggered it counts as seen, so replay continues past it.
        if let Some(node) = self.nodes.get(&as_node) {
            let entry = seen.entry(as_node.clone()).or_default();
            for trigger in &node.triggers {
                if let Some(version) = versions.get(trigger) {
                    entry.insert(trigger.clone(), *version);
                }
            }
        }

        let step = tuple.metadata.step + 1;
        let mut checkpoint = Checkpoint {
            v: tuple.checkpoint.v,
            id: crate::types::checkpoint_uuid(step).to_string(),
            ts: Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: versions,
            versions_seen: seen,
            pending_sends: tuple.checkpoint.pending_sends.clone(),
        };
        for name in &self.channel_order {
            if let Some(instance) = channels.get(name)
                && let Ok(value) = instance.checkpoint()
            {
                checkpoint.channel_values.insert(name.clone(), value);
            }
        }

        let mut metadata = CheckpointMetadata::new(CheckpointSource::Update, step);
        metadata
            .writes
            .insert(as_node, Value::Object(delta));
        metadata.parents = tuple.metadata.parents.clone();

        let updated_config = checkpointer
            .put(
                &tuple.config,
                checkpoint.clone(),
                metadata,
                checkpoint.channel_versions,
            )
            .await?;
        Ok(updated_config)
    }

    fn require_checkpointer(&self) -> Result<Arc<dyn Checkpointer>, RunnerError> {
        self.checkpointer
            .clone()
            .ok_or_else(|| RunnerError::InvalidInput {
                message: "this graph was compiled without a checkpointer".to_string(),
            })
    }

    fn resolve_as_node(
        &self,
        tuple: &CheckpointTuple,
        as_node: Option<&str>,
    ) -> Result<String, RunnerError> {
        if let Some(name) = as_node {
            if name != START_NODE && !self.nodes.contains_key(name) {
                return Err(RunnerError::InvalidInput {
                    message: format!("unknown node `{name}`"),
                });
            }
            return Ok(name.to_string());
        }
        if self.node_order.len() == 1 {
            return Ok(self.node_order[0].clone());
        }
        let writers: Vec<&String> = tuple
            .metadata
            .writes
            .keys()
            .filter(|name| self.nodes.contains_key(*name))
            .collect();
        if writers.len() == 1 {
            return Ok(writers[0].clone());
        }
        Err(RunnerError::InvalidInput {
            message: "ambiguous update author; pass as_node explicitly".to_string(),
        })
    }

    pub(crate) fn channels_from(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<FxHashMap<String, Channel>, ChannelError> {
        let mut channels = FxHashMap::default();
        for (name, spec) in &self.channels {
            let saved = checkpoint.channel_values.get(name);
            channels.insert(name.clone(), spec.build(name, saved)?);
        }
        Ok(channels)
    }

    fn snapshot_from_tuple(&self, tuple: CheckpointTuple) -> Result<StateSnapshot, RunnerError> {
        let channels = self.channels_from(&tuple.checkpoint)?;
        let planned = plan_tasks(
            self,
            &tuple.checkpoint,
            &channels,
            &tuple.config.checkpoint_ns,
            tuple.metadata.step + 1,
        );
        let tasks: Vec<TaskSnapshot> = planned
            .iter()
            .map(|task| {
                let error = tuple
                    .pending_writes
                    .iter()
                    .find(|w| w.task_id == task.id && w.channel == ERROR_CHANNEL)
                    .map(|w| w.value.clone());
                let interrupts = tuple
                    .pending_writes
                    .iter()
                    .filter(|w| w.task_id == task.id && w.channel == INTERRUPT_CHANNEL)
                    .filter_map(|w| serde_json::from_value::<Vec<Interrupt>>(w.value.clone()).ok())
                    .flatten()
                    .collect();
                TaskSnapshot {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    error,
                    interrupts,
                }
            })
            .collect();

        Ok(StateSnapshot {
            values: values_view(&channels, &self.output_channels),
            next: planned.into_iter().map(|task| task.name).collect(),
            config: tuple.config,
            metadata: Some(tuple.metadata),
            created_at: Some(tuple.checkpoint.ts),
            parent_config: tuple.parent_config,
            tasks,
        })
    }
}

/// Adapter that lets a compiled graph run as a node of another graph.
///
/// The child executes under `parent_ns | node:task_id`, persisting into the
/// parent's checkpointer (unless it carries its own). Its final output
/// channels become ordinary writes of the embedding node, so any channel
/// the child should surface must also be declared in the parent.
pub struct SubgraphNode {
    graph: Arc<Pregel>,
}

impl SubgraphNode {
    pub(crate) fn new(graph: Arc<Pregel>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Node for SubgraphNode {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let segment = format!("{}:{}", ctx.node, ctx.task_id);
        let mut config = RunConfig {
            thread_id: Some(ctx.thread_id.clone()).filter(|t| !t.is_empty()),
            checkpoint_ns: child_namespace(&ctx.checkpoint_ns, &segment),
            ..Default::default()
        };
        if let Some(parent_id) = &ctx.checkpoint_id {
            config
                .checkpoint_map
                .insert(ctx.checkpoint_ns.clone(), parent_id.clone());
        }

        let resume = ctx.scratchpad.lock().resume.clone();
        let child_input = if let Some(answer) = resume.last() {
            Some(GraphInput::Command(
                Command::new().with_resume(answer.clone()),
            ))
        } else {
            let mut values = FxHashMap::default();
            if let Value::Object(map) = &input {
                for (key, value) in map {
                    if self.graph.input_channels().contains(key) {
                        values.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(GraphInput::Values(values))
        };

        let (_root, cancel) = CancelToken::root();
        let deps = LoopDeps {
            checkpointer: self.graph.checkpointer().or_else(|| ctx.checkpointer.clone()),
            store: self.graph.store().or_else(|| ctx.store.clone()),
            emitter: ctx.emitter.clone(),
            cancel,
        };

        match PregelLoop::new(&self.graph, config, deps).run(child_input).await {
            Ok(values) => {
                let mut output = NodeOutput::new();
                for (channel, value) in values {
                    output = output.with_write(channel, value);
                }
                Ok(output)
            }
            Err(RunnerError::Interrupted(interrupt)) => Err(NodeError::Interrupt(interrupt)),
            Err(RunnerError::ParentCommand(command)) => Ok(NodeOutput::command(*command)),
            Err(error) => Err(NodeError::Subgraph(Box::new(error))),
        }
    }
}
