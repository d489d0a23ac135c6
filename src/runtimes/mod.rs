//! Scheduler core: configuration, persistence contract, planning, the
//! superstep loop, and streaming.
//!
//! # Architecture
//!
//! - **[`RunConfig`]** — per-run identity (`thread_id`, namespace, pinned
//!   checkpoint) and limits (recursion, timeouts, error policy)
//! - **[`Checkpointer`]** — pluggable durable store of checkpoints and
//!   pending writes; [`InMemoryCheckpointer`] is the reference impl
//! - **planner** — pure function from checkpoint to the next step's tasks
//! - **runner** — drives tasks concurrently, commits writes atomically,
//!   surfaces interrupts and failures
//! - **streaming** — bounded runner→consumer chunk channel
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stepgraph::graphs::GraphBuilder;
//! use stepgraph::runtimes::{InMemoryCheckpointer, RunConfig};
//!
//! # async fn example(builder: GraphBuilder) -> Result<(), Box<dyn std::error::Error>> {
//! let graph = builder
//!     .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
//!     .compile()?;
//! let out = graph
//!     .invoke(
//!         Some(stepgraph::control::GraphInput::values([("msg", serde_json::json!("hi"))])),
//!         RunConfig::for_thread("t1"),
//!     )
//!     .await?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub mod checkpointer;
pub mod planner;
pub mod runner;
pub mod runtime_config;
pub mod streaming;

pub use checkpointer::{Checkpointer, CheckpointerError, InMemoryCheckpointer, ListOptions};
pub use planner::PlannedTask;
pub use runner::{CancelToken, RunnerError};
pub use runtime_config::{
    DEFAULT_RECURSION_LIMIT, DEFAULT_STREAM_BUFFER, ErrorPolicy, RunConfig,
};
pub use streaming::{RunStream, StreamChunk, StreamEmitter, StreamMode, StreamOptions};
