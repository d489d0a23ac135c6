#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};

/// Wraps a closure as a [`Node`] for tests.
pub struct FnNode<F>(pub F);

#[async_trait]
impl<F, Fut> Node for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        (self.0)(input, ctx).await
    }
}

/// Node that writes a fixed value to one channel.
pub fn write_node(channel: &'static str, value: Value) -> impl Node {
    FnNode(move |_input: Value, _ctx: NodeContext| {
        let value = value.clone();
        async move { Ok(NodeOutput::new().with_write(channel, value)) }
    })
}

/// Node that does nothing.
pub fn noop_node() -> impl Node {
    FnNode(|_input: Value, _ctx: NodeContext| async move { Ok(NodeOutput::new()) })
}

/// Shared counter for asserting how often a node executed.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
