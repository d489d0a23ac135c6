mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use common::{Counter, FnNode, write_node};
use stepgraph::channels::ChannelSpec;
use stepgraph::checkpoint::CheckpointSource;
use stepgraph::control::GraphInput;
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{NodeContext, NodeError, NodeOutput, RetryPolicy};
use stepgraph::runtimes::{
    Checkpointer, InMemoryCheckpointer, ListOptions, RunConfig, RunnerError,
};
use stepgraph::types::{END_NODE, START_NODE, branch_channel};

/********************
 * Scenario: linear pass-through
 ********************/

#[tokio::test]
async fn linear_pass_through_writes_and_commits() {
    let saver = Arc::new(InMemoryCheckpointer::new());
    let graph = GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_node("a", write_node("msg", json!("hi")))
        .add_edge(START_NODE, "a")
        .add_edge("a", END_NODE)
        .with_checkpointer(saver.clone())
        .compile()
        .unwrap();
    let config = RunConfig::for_thread("t1");

    let out = graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();
    assert_eq!(out["msg"], json!("hi"));

    // History: input, loop, loop at steps -1, 0, 1 (newest first).
    let history = graph
        .get_state_history(&config, ListOptions::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    let meta: Vec<_> = history
        .iter()
        .map(|s| s.metadata.clone().unwrap())
        .collect();
    assert_eq!(
        meta.iter().map(|m| m.step).collect::<Vec<_>>(),
        vec![1, 0, -1]
    );
    assert_eq!(meta[0].source, CheckpointSource::Loop);
    assert_eq!(meta[1].source, CheckpointSource::Loop);
    assert_eq!(meta[2].source, CheckpointSource::Input);
    // The input metadata records the caller's writes.
    assert_eq!(meta[2].writes[START_NODE], json!({"msg": ""}));
    assert_eq!(meta[0].writes["a"], json!({"msg": "hi"}));

    // Nothing left to run; the final snapshot holds the value.
    assert!(history[0].next.is_empty());
    assert_eq!(history[0].values["msg"], json!("hi"));
}

#[tokio::test]
async fn triggering_versions_are_marked_seen_post_commit() {
    let saver = Arc::new(InMemoryCheckpointer::new());
    let graph = GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_node("a", write_node("msg", json!("hi")))
        .add_edge(START_NODE, "a")
        .add_edge("a", END_NODE)
        .with_checkpointer(saver.clone())
        .compile()
        .unwrap();
    let config = RunConfig::for_thread("t1");
    graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();

    let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
    let trigger = branch_channel("a");
    assert_eq!(
        tuple.checkpoint.versions_seen["a"][&trigger],
        tuple.checkpoint.channel_versions[&trigger],
    );
}

/********************
 * Scenario: fan-out / fan-in with a barrier
 ********************/

type StepLog = Arc<Mutex<Vec<(String, i64)>>>;

fn logging_node(log: StepLog, write: Option<(&'static str, Value)>) -> impl stepgraph::node::Node {
    FnNode(move |_input: Value, ctx: NodeContext| {
        let log = log.clone();
        let write = write.clone();
        async move {
            log.lock().unwrap().push((ctx.node.clone(), ctx.step));
            let mut output = NodeOutput::new();
            if let Some((channel, value)) = write {
                output = output.with_write(channel, value);
            }
            Ok(output)
        }
    })
}

fn barrier_graph(log: StepLog, b_first: bool) -> stepgraph::pregel::Pregel {
    let mut builder = GraphBuilder::new()
        .add_channel("agg", ChannelSpec::named_barrier(["b", "c"]))
        .add_channel("result", ChannelSpec::last_value())
        .add_node("a", logging_node(log.clone(), None));
    builder = if b_first {
        builder
            .add_node("b", logging_node(log.clone(), Some(("agg", json!("b")))))
            .add_node("c", logging_node(log.clone(), Some(("agg", json!("c")))))
    } else {
        builder
            .add_node("c", logging_node(log.clone(), Some(("agg", json!("c")))))
            .add_node("b", logging_node(log.clone(), Some(("agg", json!("b")))))
    };
    builder
        .add_node("d", logging_node(log.clone(), Some(("result", json!("joined")))))
        .with_trigger("d", "agg")
        .add_edge(START_NODE, "a")
        .add_edge("a", "b")
        .add_edge("a", "c")
        .add_edge("d", END_NODE)
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap()
}

#[tokio::test]
async fn barrier_fans_in_after_both_writers() {
    let log: StepLog = Arc::new(Mutex::new(Vec::new()));
    let graph = barrier_graph(log.clone(), true);
    let out = graph
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    assert_eq!(out["result"], json!("joined"));

    let log = log.lock().unwrap();
    let step_of = |name: &str| log.iter().find(|(n, _)| n == name).unwrap().1;
    assert_eq!(step_of("b"), step_of("c"), "b and c run in the same superstep");
    assert_eq!(step_of("b"), step_of("a") + 1);
    assert_eq!(step_of("d"), step_of("b") + 1, "d runs exactly after the barrier trips");
}

#[tokio::test]
async fn barrier_output_is_order_independent() {
    let log_bc: StepLog = Arc::new(Mutex::new(Vec::new()));
    let log_cb: StepLog = Arc::new(Mutex::new(Vec::new()));
    let out_bc = barrier_graph(log_bc, true)
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    let out_cb = barrier_graph(log_cb, false)
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    assert_eq!(out_bc, out_cb);
}

/********************
 * Scenario: send map-reduce
 ********************/

#[tokio::test]
async fn send_packets_plan_explicit_tasks_in_order() {
    let router = FnNode(|_input: Value, _ctx: NodeContext| async move {
        Ok(NodeOutput::new()
            .with_send("worker", json!({"i": 0}))
            .with_send("worker", json!({"i": 1}))
            .with_send("worker", json!({"i": 2})))
    });
    let worker = FnNode(|input: Value, _ctx: NodeContext| async move {
        Ok(NodeOutput::new().with_write("nums", input["i"].clone()))
    });
    let graph = GraphBuilder::new()
        .add_channel("nums", ChannelSpec::topic(false, true))
        .add_node("router", router)
        .add_node("worker", worker)
        .add_edge(START_NODE, "router")
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();

    let out = graph
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    assert_eq!(out["nums"], json!([0, 1, 2]));
}

/********************
 * Bulk-synchronous isolation
 ********************/

#[tokio::test]
async fn peer_writes_are_invisible_within_a_step() {
    let seen_by_q: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let p = FnNode(|_input: Value, _ctx: NodeContext| async move {
        Ok(NodeOutput::new().with_write("log", json!("from p")))
    });
    let q = {
        let seen = seen_by_q.clone();
        FnNode(move |input: Value, _ctx: NodeContext| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(input);
                Ok(NodeOutput::new())
            }
        })
    };
    let graph = GraphBuilder::new()
        .add_channel("log", ChannelSpec::topic(false, true))
        .add_node("a", common::noop_node())
        .add_node("p", p)
        .add_node("q", q)
        .add_edge(START_NODE, "a")
        .add_edge("a", "p")
        .add_edge("a", "q")
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();

    let out = graph
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    assert_eq!(out["log"], json!(["from p"]));

    // q ran in the same step as p and observed the previous-step view.
    let observed = seen_by_q.lock().unwrap().clone().unwrap();
    assert!(observed.get("log").is_none(), "peer write leaked into the step: {observed}");
}

/********************
 * Recursion limit
 ********************/

#[tokio::test]
async fn unbounded_cycle_hits_the_recursion_limit() {
    let graph = GraphBuilder::new()
        .add_channel("n", ChannelSpec::any_value())
        .add_node("a", write_node("n", json!(1)))
        .add_node("b", write_node("n", json!(2)))
        .add_edge(START_NODE, "a")
        .add_edge("a", "b")
        .add_conditional_edge("b", Arc::new(|_| vec!["a".to_string()]))
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();

    let err = graph
        .invoke(
            Some(GraphInput::Values(Default::default())),
            RunConfig::for_thread("t1").with_recursion_limit(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::GraphRecursion { limit: 5, .. }));
}

/********************
 * Scenario: crash-safe partial step
 ********************/

#[tokio::test]
async fn completed_task_writes_survive_a_failed_step() {
    let ran_x = Counter::new();
    let tries_y = Counter::new();
    let x = {
        let ran = ran_x.clone();
        FnNode(move |_input: Value, _ctx: NodeContext| {
            let ran = ran.clone();
            async move {
                ran.bump();
                Ok(NodeOutput::new().with_write("xs", json!("x")))
            }
        })
    };
    let y = {
        let tries = tries_y.clone();
        FnNode(move |_input: Value, _ctx: NodeContext| {
            let tries = tries.clone();
            async move {
                if tries.bump() == 1 {
                    Err(NodeError::ValidationFailed("first attempt dies".into()))
                } else {
                    Ok(NodeOutput::new().with_write("flag", json!(true)))
                }
            }
        })
    };
    let graph = GraphBuilder::new()
        .add_channel("xs", ChannelSpec::topic(false, true))
        .add_channel("flag", ChannelSpec::last_value())
        .add_node("a", common::noop_node())
        .add_node("x", x)
        .add_node("y", y)
        .add_edge(START_NODE, "a")
        .add_edge("a", "x")
        .add_edge("a", "y")
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();
    let config = RunConfig::for_thread("t1");

    let err = graph
        .invoke(Some(GraphInput::Values(Default::default())), config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::NodeFailure { ref node, .. } if node == "y"));

    // Replanning reuses x's persisted writes instead of re-running it.
    let out = graph.invoke(None, config).await.unwrap();
    assert_eq!(out["xs"], json!(["x"]));
    assert_eq!(out["flag"], json!(true));
    assert_eq!(ran_x.get(), 1, "x must not re-run after the failed step");
    assert_eq!(tries_y.get(), 2);
}

/********************
 * Retry policy
 ********************/

#[tokio::test]
async fn transient_failures_are_retried_per_policy() {
    let attempts = Counter::new();
    let flaky = {
        let attempts = attempts.clone();
        FnNode(move |_input: Value, _ctx: NodeContext| {
            let attempts = attempts.clone();
            async move {
                if attempts.bump() < 3 {
                    Err(NodeError::Provider {
                        provider: "search",
                        message: "503".into(),
                    })
                } else {
                    Ok(NodeOutput::new().with_write("msg", json!("finally")))
                }
            }
        })
    };
    let graph = GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_node("flaky", flaky)
        .with_retry(
            "flaky",
            RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
        )
        .add_edge(START_NODE, "flaky")
        .add_edge("flaky", END_NODE)
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();

    let out = graph
        .invoke(Some(GraphInput::Values(Default::default())), RunConfig::for_thread("t1"))
        .await
        .unwrap();
    assert_eq!(out["msg"], json!("finally"));
    assert_eq!(attempts.get(), 3);
}
