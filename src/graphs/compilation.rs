//! Build-time validation and compilation into an executable plan.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::builder::GraphBuilder;
use crate::channels::ChannelSpec;
use crate::pregel::{Pregel, PregelNode, PregelParts, ReadSpec};
use crate::types::{BRANCH_PREFIX, END_NODE, START_NODE, branch_channel, is_reserved};

/// Structural errors detected at compile time.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    #[error("node name `{name}` is reserved")]
    #[diagnostic(
        code(stepgraph::graphs::reserved_node),
        help("Runtime tokens (double-underscore names, `branch:to:*`) cannot be node names.")
    )]
    ReservedNode { name: String },

    #[error("channel name `{name}` is reserved")]
    #[diagnostic(code(stepgraph::graphs::reserved_channel))]
    ReservedChannel { name: String },

    #[error("edge `{from}` -> `{to}` references an unknown node")]
    #[diagnostic(
        code(stepgraph::graphs::unknown_edge),
        help("Both endpoints must be declared nodes, `__start__`, or `__end__`.")
    )]
    UnknownEdgeEndpoint { from: String, to: String },

    #[error("conditional edge from `{from}` maps label `{label}` to unknown node `{target}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_branch_target))]
    UnknownBranchTarget {
        from: String,
        label: String,
        target: String,
    },

    #[error("node `{node}` subscribes to undeclared channel `{channel}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_trigger))]
    UnknownTrigger { node: String, channel: String },

    #[error("node `{node}` reads undeclared channel `{channel}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_read))]
    UnknownRead { node: String, channel: String },

    #[error("`{list}` names unknown node `{node}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_interrupt_node))]
    UnknownInterruptNode { list: &'static str, node: String },

    #[error("`{list}` names undeclared channel `{channel}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_channel))]
    UnknownChannel { list: &'static str, channel: String },

    #[error("input channel `{channel}` is not subscribed by any node")]
    #[diagnostic(
        code(stepgraph::graphs::unsubscribed_input),
        help("Give some node a trigger or read on `{channel}`, or drop it from the inputs.")
    )]
    UnsubscribedInput { channel: String },

    #[error("graph has no entry point")]
    #[diagnostic(
        code(stepgraph::graphs::no_entry),
        help("Add an edge from `__start__` or give a node an explicit trigger.")
    )]
    NoEntryPoint,
}

impl GraphBuilder {
    /// Validate the structure and produce an immutable execution plan.
    pub fn compile(self) -> Result<Pregel, GraphValidationError> {
        for name in &self.node_order {
            if is_reserved(name) || name == START_NODE || name == END_NODE {
                return Err(GraphValidationError::ReservedNode { name: name.clone() });
            }
        }
        for name in &self.channel_order {
            if is_reserved(name) {
                return Err(GraphValidationError::ReservedChannel { name: name.clone() });
            }
        }

        let node_exists = |name: &str| self.nodes.contains_key(name);
        for (from, to) in &self.edges {
            let from_ok = from == START_NODE || node_exists(from);
            let to_ok = to == END_NODE || node_exists(to);
            if !from_ok || !to_ok {
                return Err(GraphValidationError::UnknownEdgeEndpoint {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        for edge in &self.conditional_edges {
            if edge.from() != START_NODE && !node_exists(edge.from()) {
                return Err(GraphValidationError::UnknownEdgeEndpoint {
                    from: edge.from().to_string(),
                    to: "<conditional>".to_string(),
                });
            }
            if let Some(path_map) = edge.path_map() {
                for (label, target) in path_map {
                    if target != END_NODE && !node_exists(target) {
                        return Err(GraphValidationError::UnknownBranchTarget {
                            from: edge.from().to_string(),
                            label: label.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        for (name, draft) in &self.nodes {
            for trigger in &draft.triggers {
                let implicit_branch = trigger
                    .strip_prefix(BRANCH_PREFIX)
                    .is_some_and(|target| self.nodes.contains_key(target));
                if !self.channels.contains_key(trigger) && !implicit_branch {
                    return Err(GraphValidationError::UnknownTrigger {
                        node: name.clone(),
                        channel: trigger.clone(),
                    });
                }
            }
            if let Some(reads) = &draft.reads {
                for channel in reads {
                    if !self.channels.contains_key(channel) {
                        return Err(GraphValidationError::UnknownRead {
                            node: name.clone(),
                            channel: channel.clone(),
                        });
                    }
                }
            }
        }

        for node in &self.interrupt_before {
            if !node_exists(node) {
                return Err(GraphValidationError::UnknownInterruptNode {
                    list: "interrupt_before",
                    node: node.clone(),
                });
            }
        }
        for node in &self.interrupt_after {
            if !node_exists(node) {
                return Err(GraphValidationError::UnknownInterruptNode {
                    list: "interrupt_after",
                    node: node.clone(),
                });
            }
        }

        let declared = |list: &'static str,
                        channels: &Option<Vec<String>>|
         -> Result<(), GraphValidationError> {
            if let Some(channels) = channels {
                for channel in channels {
                    if !self.channels.contains_key(channel) {
                        return Err(GraphValidationError::UnknownChannel {
                            list,
                            channel: channel.clone(),
                        });
                    }
                }
            }
            Ok(())
        };
        declared("input_channels", &self.input_channels)?;
        declared("output_channels", &self.output_channels)?;
        declared("stream_channels", &self.stream_channels)?;

        let input_channels = self
            .input_channels
            .clone()
            .unwrap_or_else(|| self.channel_order.clone());
        let output_channels = self
            .output_channels
            .clone()
            .unwrap_or_else(|| self.channel_order.clone());
        let stream_channels = self.stream_channels.clone().unwrap_or_else(|| output_channels.clone());

        // Every input channel must reach some node, through an explicit
        // trigger, an explicit read list, or a default read-everything node.
        let any_default_reader = self.nodes.values().any(|draft| draft.reads.is_none());
        if !any_default_reader {
            for channel in &input_channels {
                let subscribed = self.nodes.values().any(|draft| {
                    draft.triggers.contains(channel)
                        || draft
                            .reads
                            .as_ref()
                            .is_some_and(|reads| reads.contains(channel))
                });
                if !subscribed {
                    return Err(GraphValidationError::UnsubscribedInput {
                        channel: channel.clone(),
                    });
                }
            }
        }

        let has_start_edge = self.edges.iter().any(|(from, _)| from == START_NODE)
            || self
                .conditional_edges
                .iter()
                .any(|edge| edge.from() == START_NODE);
        let has_explicit_trigger = self.nodes.values().any(|draft| !draft.triggers.is_empty());
        if !has_start_edge && !has_explicit_trigger {
            return Err(GraphValidationError::NoEntryPoint);
        }

        // Assemble the immutable plan: every node gets its ephemeral
        // routing channel, subscribed implicitly.
        let mut channels = self.channels.clone();
        let mut channel_order = self.channel_order.clone();
        for name in &self.node_order {
            let branch = branch_channel(name);
            channels.insert(branch.clone(), ChannelSpec::ephemeral());
            channel_order.push(branch);
        }

        let start_nodes: Vec<String> = self
            .edges
            .iter()
            .filter(|(from, _)| from == START_NODE)
            .map(|(_, to)| to.clone())
            .collect();

        let mut nodes: FxHashMap<String, PregelNode> = FxHashMap::default();
        for name in &self.node_order {
            let draft = &self.nodes[name];
            let mut triggers = vec![branch_channel(name)];
            triggers.extend(draft.triggers.iter().cloned());
            let successors: Vec<String> = self
                .edges
                .iter()
                .filter(|(from, to)| from == name && to != END_NODE)
                .map(|(_, to)| to.clone())
                .collect();
            let reads = match &draft.reads {
                Some(reads) if reads.len() == 1 => ReadSpec::Single(reads[0].clone()),
                Some(reads) => ReadSpec::Many(reads.clone()),
                None => ReadSpec::Many(self.channel_order.clone()),
            };
            nodes.insert(
                name.clone(),
                PregelNode {
                    name: name.clone(),
                    triggers,
                    reads,
                    successors,
                    retry: draft.retry.clone(),
                    node: draft.node.clone(),
                },
            );
        }

        let subgraphs = self
            .nodes
            .iter()
            .filter_map(|(name, draft)| {
                draft
                    .subgraph
                    .as_ref()
                    .map(|subgraph| (name.clone(), subgraph.clone()))
            })
            .collect();

        Ok(Pregel::from_parts(PregelParts {
            nodes,
            node_order: self.node_order,
            channels,
            channel_order,
            input_channels,
            output_channels,
            stream_channels,
            conditional_edges: self.conditional_edges,
            start_nodes,
            interrupt_before: self.interrupt_before,
            interrupt_after: self.interrupt_after,
            subgraphs,
            checkpointer: self.checkpointer,
            store: self.store,
        }))
    }
}
