//! Graph definition: builder, edges, and compile-time validation.
//!
//! A graph is declared channel-first: state channels carry the data, nodes
//! subscribe to channels (implicitly through routing edges, explicitly via
//! triggers), and edges — static or conditional — decide what runs next.
//! `compile()` validates the structure and yields the immutable
//! [`crate::pregel::Pregel`] plan; nothing about a compiled graph can
//! change at runtime.

pub mod builder;
pub mod compilation;
pub mod edges;

pub use builder::GraphBuilder;
pub use compilation::GraphValidationError;
pub use edges::{ConditionalEdge, EdgePredicate};
