//! # Stepgraph: a deterministic, checkpointed graph execution engine
//!
//! Stepgraph drives a user-defined directed graph of computational nodes
//! communicating through typed, versioned **channels**. Execution advances
//! in discrete **supersteps**: plan the eligible tasks, run them
//! concurrently against the previous step's state view, commit their
//! writes atomically into the next checkpoint, and emit stream chunks.
//! Runs can be interrupted at node boundaries, resumed with caller-supplied
//! values, branched at any historical checkpoint, and recovered after a
//! crash mid-step.
//!
//! ## Core Concepts
//!
//! - **Channels**: reducer-like rendezvous with per-thread version tokens
//! - **Nodes**: async units of work returning writes, sends, and commands
//! - **Checkpoints**: append-only per-thread snapshots with pending writes
//! - **Supersteps**: bulk-synchronous plan → run → commit → emit iterations
//! - **Interrupts**: resumable faults that pause a run and surface a value
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use stepgraph::channels::ChannelSpec;
//! use stepgraph::graphs::GraphBuilder;
//! use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
//! use stepgraph::runtimes::RunConfig;
//! use stepgraph::types::{END_NODE, START_NODE};
//!
//! struct Shout;
//!
//! #[async_trait]
//! impl Node for Shout {
//!     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!         let msg = input["msg"].as_str().unwrap_or_default().to_uppercase();
//!         Ok(NodeOutput::new().with_write("msg", json!(msg)))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = GraphBuilder::new()
//!     .add_channel("msg", ChannelSpec::last_value())
//!     .add_node("shout", Shout)
//!     .add_edge(START_NODE, "shout")
//!     .add_edge("shout", END_NODE)
//!     .compile()?;
//!
//! let out = graph
//!     .invoke(
//!         Some(stepgraph::control::GraphInput::values([("msg", json!("hi"))])),
//!         RunConfig::default(),
//!     )
//!     .await?;
//! assert_eq!(out["msg"], json!("HI"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`channels`] - Channel variants and their update semantics
//! - [`graphs`] - Declarative graph construction and validation
//! - [`node`] - The [`node::Node`] trait and execution context
//! - [`control`] - Send packets, commands, interrupts
//! - [`checkpoint`] - Snapshot model and the JSON-plus wire format
//! - [`runtimes`] - Checkpointer contract, planner, superstep runner, streaming
//! - [`pregel`] - The compiled graph and its library API
//! - [`store`] - Long-term key/value store with optional vector index
//! - [`telemetry`] - Tracing bootstrap

pub mod channels;
pub mod checkpoint;
pub mod control;
pub mod graphs;
pub mod node;
pub mod pregel;
pub mod runtimes;
pub mod store;
pub mod telemetry;
pub mod types;
