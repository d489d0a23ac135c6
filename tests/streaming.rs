mod common;

use std::sync::Arc;

use serde_json::{Value, json};

use common::{FnNode, write_node};
use stepgraph::channels::ChannelSpec;
use stepgraph::control::GraphInput;
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{NodeContext, NodeError, NodeOutput};
use stepgraph::pregel::Pregel;
use stepgraph::runtimes::{
    InMemoryCheckpointer, RunConfig, RunnerError, StreamChunk, StreamMode, StreamOptions,
};
use stepgraph::types::{END_NODE, START_NODE};

fn linear() -> Arc<Pregel> {
    Arc::new(
        GraphBuilder::new()
            .add_channel("msg", ChannelSpec::last_value())
            .add_node("a", write_node("msg", json!("hi")))
            .add_edge(START_NODE, "a")
            .add_edge("a", END_NODE)
            .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
            .compile()
            .unwrap(),
    )
}

async fn collect(
    graph: &Arc<Pregel>,
    modes: Vec<StreamMode>,
) -> (Vec<StreamChunk>, Option<RunnerError>) {
    let mut stream = graph.stream(
        Some(GraphInput::values([("msg", json!(""))])),
        RunConfig::for_thread("t1"),
        StreamOptions::modes(modes),
    );
    let mut chunks = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }
    (chunks, error)
}

/********************
 * values / updates
 ********************/

#[tokio::test]
async fn values_mode_emits_once_per_commit() {
    let graph = linear();
    let (chunks, error) = collect(&graph, vec![StreamMode::Values]).await;
    assert!(error.is_none());
    // One chunk for the input-application step, one for `a`'s step.
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.mode == StreamMode::Values));
    assert_eq!(chunks[0].payload["msg"], json!(""));
    assert_eq!(chunks[1].payload["msg"], json!("hi"));
    assert!(chunks.iter().all(|c| c.namespace.is_empty()));
}

#[tokio::test]
async fn updates_mode_emits_per_node_deltas() {
    let graph = linear();
    let (chunks, error) = collect(&graph, vec![StreamMode::Updates]).await;
    assert!(error.is_none());
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].payload["a"]["msg"], json!("hi"));
}

#[tokio::test]
async fn updates_preserve_send_emission_order() {
    let router = FnNode(|_input: Value, _ctx: NodeContext| async move {
        Ok(NodeOutput::new()
            .with_send("worker", json!({"i": 0}))
            .with_send("worker", json!({"i": 1}))
            .with_send("worker", json!({"i": 2})))
    });
    let worker = FnNode(|input: Value, _ctx: NodeContext| async move {
        // Delay inversely to the index so completion order is reversed.
        let i = input["i"].as_u64().unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(30 - 10 * i)).await;
        Ok(NodeOutput::new().with_write("nums", input["i"].clone()))
    });
    let graph = Arc::new(
        GraphBuilder::new()
            .add_channel("nums", ChannelSpec::topic(false, true))
            .add_node("router", router)
            .add_node("worker", worker)
            .add_edge(START_NODE, "router")
            .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
            .compile()
            .unwrap(),
    );

    let mut stream = graph.stream(
        Some(GraphInput::Values(Default::default())),
        RunConfig::for_thread("t1"),
        StreamOptions::modes([StreamMode::Updates]),
    );
    let mut worker_nums = Vec::new();
    while let Some(item) = stream.next().await {
        let chunk = item.expect("no errors in this run");
        if let Some(delta) = chunk.payload.get("worker") {
            worker_nums.push(delta["nums"].clone());
        }
    }
    assert_eq!(worker_nums, vec![json!(0), json!(1), json!(2)]);
}

/********************
 * custom / messages / debug
 ********************/

#[tokio::test]
async fn nodes_stream_custom_and_message_chunks_mid_task() {
    let chatty = FnNode(|_input: Value, ctx: NodeContext| async move {
        ctx.emit_message(json!("tok"));
        ctx.emit_custom(json!({"progress": 0.5}));
        Ok(NodeOutput::new().with_write("msg", json!("done")))
    });
    let graph = Arc::new(
        GraphBuilder::new()
            .add_channel("msg", ChannelSpec::last_value())
            .add_node("chatty", chatty)
            .add_edge(START_NODE, "chatty")
            .add_edge("chatty", END_NODE)
            .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
            .compile()
            .unwrap(),
    );

    let mut stream = graph.stream(
        Some(GraphInput::Values(Default::default())),
        RunConfig::for_thread("t1"),
        StreamOptions::modes([StreamMode::Custom, StreamMode::Messages]),
    );
    let mut seen_custom = false;
    let mut seen_message = false;
    while let Some(item) = stream.next().await {
        let chunk = item.unwrap();
        match chunk.mode {
            StreamMode::Custom => {
                seen_custom = true;
                assert_eq!(chunk.payload["node"], json!("chatty"));
                assert_eq!(chunk.payload["payload"]["progress"], json!(0.5));
            }
            StreamMode::Messages => {
                seen_message = true;
                assert_eq!(chunk.payload["payload"], json!("tok"));
            }
            other => panic!("unsubscribed mode {other:?} leaked"),
        }
    }
    assert!(seen_custom && seen_message);
}

#[tokio::test]
async fn debug_mode_reports_task_lifecycle() {
    let graph = linear();
    let (chunks, error) = collect(&graph, vec![StreamMode::Debug]).await;
    assert!(error.is_none());
    let kinds: Vec<&str> = chunks
        .iter()
        .filter_map(|c| c.payload["type"].as_str())
        .collect();
    assert!(kinds.contains(&"task"));
    assert!(kinds.contains(&"task_result"));
    // Every debug event names the task and its step.
    assert!(chunks.iter().all(|c| c.payload["name"] == json!("a")));
}

#[tokio::test]
async fn events_mode_mirrors_other_emissions() {
    let graph = linear();
    let (chunks, error) = collect(&graph, vec![StreamMode::Events]).await;
    assert!(error.is_none());
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.mode == StreamMode::Events));
    let names: Vec<&str> = chunks
        .iter()
        .filter_map(|c| c.payload["name"].as_str())
        .collect();
    assert!(names.contains(&"values"));
    assert!(names.contains(&"debug"));
}

/********************
 * errors and interrupts
 ********************/

#[tokio::test]
async fn failing_node_terminates_the_stream_with_an_error() {
    let boom = FnNode(|_input: Value, _ctx: NodeContext| async move {
        Err::<NodeOutput, _>(NodeError::ValidationFailed("boom".into()))
    });
    let graph = Arc::new(
        GraphBuilder::new()
            .add_channel("msg", ChannelSpec::last_value())
            .add_node("boom", boom)
            .add_edge(START_NODE, "boom")
            .add_edge("boom", END_NODE)
            .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
            .compile()
            .unwrap(),
    );

    let (_, error) = {
        let mut stream = graph.stream(
            Some(GraphInput::Values(Default::default())),
            RunConfig::for_thread("t1"),
            StreamOptions::modes([StreamMode::Values]),
        );
        let mut error = None;
        while let Some(item) = stream.next().await {
            if let Err(err) = item {
                error = Some(err);
                break;
            }
        }
        ((), error)
    };
    assert!(matches!(
        error,
        Some(RunnerError::NodeFailure { ref node, .. }) if node == "boom"
    ));
}

#[tokio::test]
async fn interrupts_surface_as_an_updates_chunk() {
    let ask = FnNode(|_input: Value, ctx: NodeContext| async move {
        let answer = ctx.interrupt(json!("name?"))?;
        Ok(NodeOutput::new().with_write("msg", answer))
    });
    let graph = Arc::new(
        GraphBuilder::new()
            .add_channel("msg", ChannelSpec::last_value())
            .add_node("ask", ask)
            .add_edge(START_NODE, "ask")
            .add_edge("ask", END_NODE)
            .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
            .compile()
            .unwrap(),
    );

    let mut stream = graph.stream(
        Some(GraphInput::Values(Default::default())),
        RunConfig::for_thread("t1"),
        StreamOptions::modes([StreamMode::Updates]),
    );
    let mut interrupt_chunk = None;
    while let Some(item) = stream.next().await {
        let chunk = item.expect("interrupts are not stream errors");
        if chunk.payload.get("__interrupt__").is_some() {
            interrupt_chunk = Some(chunk);
        }
    }
    let chunk = interrupt_chunk.expect("interrupt chunk emitted");
    assert_eq!(chunk.payload["__interrupt__"][0]["value"], json!("name?"));
}
