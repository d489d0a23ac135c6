//! Declarative construction of executable graphs.
//!
//! [`GraphBuilder`] collects channels, nodes, and edges through a fluent
//! API, then `compile()` (see the sibling `compilation` module) validates
//! the structure and produces an immutable [`crate::pregel::Pregel`] plan.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use stepgraph::channels::ChannelSpec;
//! use stepgraph::graphs::GraphBuilder;
//! use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
//! use stepgraph::types::{END_NODE, START_NODE};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Node for Echo {
//!     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!         Ok(NodeOutput::new().with_write("msg", input["msg"].clone()))
//!     }
//! }
//!
//! let graph = GraphBuilder::new()
//!     .add_channel("msg", ChannelSpec::last_value())
//!     .add_node("echo", Echo)
//!     .add_edge(START_NODE, "echo")
//!     .add_edge("echo", END_NODE)
//!     .compile()?;
//! # Ok::<(), stepgraph::graphs::GraphValidationError>(())
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::edges::{ConditionalEdge, EdgePredicate};
use crate::channels::ChannelSpec;
use crate::node::{Node, RetryPolicy};
use crate::pregel::{Pregel, SubgraphNode};
use crate::runtimes::checkpointer::Checkpointer;
use crate::store::Store;

pub(super) struct NodeDraft {
    pub node: Arc<dyn Node>,
    /// Channels the node subscribes to beyond its implicit branch channel.
    pub triggers: Vec<String>,
    /// Channels projected into the node's input; `None` means all declared.
    pub reads: Option<Vec<String>>,
    pub retry: Option<RetryPolicy>,
    pub subgraph: Option<Arc<Pregel>>,
}

/// Builder for executable graphs.
pub struct GraphBuilder {
    pub(super) channels: FxHashMap<String, ChannelSpec>,
    pub(super) channel_order: Vec<String>,
    pub(super) nodes: FxHashMap<String, NodeDraft>,
    pub(super) node_order: Vec<String>,
    pub(super) edges: Vec<(String, String)>,
    pub(super) conditional_edges: Vec<ConditionalEdge>,
    pub(super) input_channels: Option<Vec<String>>,
    pub(super) output_channels: Option<Vec<String>>,
    pub(super) stream_channels: Option<Vec<String>>,
    pub(super) interrupt_before: Vec<String>,
    pub(super) interrupt_after: Vec<String>,
    pub(super) checkpointer: Option<Arc<dyn Checkpointer>>,
    pub(super) store: Option<Arc<dyn Store>>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: FxHashMap::default(),
            channel_order: Vec::new(),
            nodes: FxHashMap::default(),
            node_order: Vec::new(),
            edges: Vec::new(),
            conditional_edges: Vec::new(),
            input_channels: None,
            output_channels: None,
            stream_channels: None,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            checkpointer: None,
            store: None,
        }
    }

    /// Declare a state channel.
    ///
    /// Declaration order is the deterministic tie-break order used by the
    /// committer, so keep it stable across builds of the same graph.
    #[must_use]
    pub fn add_channel(mut self, name: impl Into<String>, spec: ChannelSpec) -> Self {
        let name = name.into();
        if self.channels.insert(name.clone(), spec).is_none() {
            self.channel_order.push(name);
        }
        self
    }

    /// Register a node. Insertion order is the planner's stable task order.
    #[must_use]
    pub fn add_node(mut self, name: impl Into<String>, node: impl Node + 'static) -> Self {
        self.insert_node(name.into(), Arc::new(node), None);
        self
    }

    /// Register a compiled graph as a node; it executes under its own
    /// checkpoint namespace.
    #[must_use]
    pub fn add_subgraph(mut self, name: impl Into<String>, subgraph: Pregel) -> Self {
        let subgraph = Arc::new(subgraph);
        self.insert_node(
            name.into(),
            Arc::new(SubgraphNode::new(subgraph.clone())),
            Some(subgraph),
        );
        self
    }

    fn insert_node(&mut self, name: String, node: Arc<dyn Node>, subgraph: Option<Arc<Pregel>>) {
        let draft = NodeDraft {
            node,
            triggers: Vec::new(),
            reads: None,
            retry: None,
            subgraph,
        };
        if self.nodes.insert(name.clone(), draft).is_none() {
            self.node_order.push(name);
        } else {
            tracing::warn!(node = %name, "node registered twice; keeping the later implementation");
        }
    }

    /// Add a static edge. `from` may be the virtual start node and `to` the
    /// virtual end node.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Add a conditional edge routed by `predicate` over the values view.
    #[must_use]
    pub fn add_conditional_edge(
        mut self,
        from: impl Into<String>,
        predicate: EdgePredicate,
    ) -> Self {
        self.conditional_edges
            .push(ConditionalEdge::new(from, predicate));
        self
    }

    /// Add a conditional edge whose labels resolve through `path_map`.
    #[must_use]
    pub fn add_conditional_edge_with_map(
        mut self,
        from: impl Into<String>,
        predicate: EdgePredicate,
        path_map: FxHashMap<String, String>,
    ) -> Self {
        self.conditional_edges
            .push(ConditionalEdge::new(from, predicate).with_path_map(path_map));
        self
    }

    /// Subscribe `node` to an extra trigger channel.
    #[must_use]
    pub fn with_trigger(mut self, node: &str, channel: impl Into<String>) -> Self {
        if let Some(draft) = self.nodes.get_mut(node) {
            draft.triggers.push(channel.into());
        } else {
            tracing::warn!(node, "with_trigger on unknown node ignored");
        }
        self
    }

    /// Restrict the channels projected into `node`'s input.
    ///
    /// A single channel projects as its bare value; several project as a
    /// mapping.
    #[must_use]
    pub fn with_reads<I, S>(mut self, node: &str, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(draft) = self.nodes.get_mut(node) {
            draft.reads = Some(channels.into_iter().map(Into::into).collect());
        } else {
            tracing::warn!(node, "with_reads on unknown node ignored");
        }
        self
    }

    /// Attach a retry policy to `node`.
    #[must_use]
    pub fn with_retry(mut self, node: &str, policy: RetryPolicy) -> Self {
        if let Some(draft) = self.nodes.get_mut(node) {
            draft.retry = Some(policy);
        } else {
            tracing::warn!(node, "with_retry on unknown node ignored");
        }
        self
    }

    /// Channels seeded from caller input. Defaults to every declared channel.
    #[must_use]
    pub fn with_input_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Channels returned from `invoke`. Defaults to every declared channel.
    #[must_use]
    pub fn with_output_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Channels included in `values` stream chunks. Defaults to outputs.
    #[must_use]
    pub fn with_stream_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Pause (resumably) before any of these nodes runs.
    #[must_use]
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Pause after any of these nodes ran (their step commits first).
    #[must_use]
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Persist checkpoints through this backend.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Expose a store to nodes through their context.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }
}
