mod common;

use std::sync::Arc;

use serde_json::json;

use common::write_node;
use stepgraph::channels::ChannelSpec;
use stepgraph::checkpoint::CheckpointSource;
use stepgraph::control::GraphInput;
use stepgraph::graphs::GraphBuilder;
use stepgraph::pregel::Pregel;
use stepgraph::runtimes::{InMemoryCheckpointer, ListOptions, RunConfig};
use stepgraph::types::{END_NODE, START_NODE};

fn linear() -> Pregel {
    GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_node("a", write_node("msg", json!("hi")))
        .add_edge(START_NODE, "a")
        .add_edge("a", END_NODE)
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap()
}

/********************
 * Scenario: fork and branch navigation
 ********************/

#[tokio::test]
async fn update_state_forks_history_and_replays() {
    let graph = linear();
    let config = RunConfig::for_thread("t1");
    graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();

    // Address the step-0 checkpoint (the one before `a` ran).
    let history = graph
        .get_state_history(&config, ListOptions::default())
        .await
        .unwrap();
    let at_step0 = history
        .iter()
        .find(|s| s.metadata.as_ref().unwrap().step == 0)
        .unwrap()
        .config
        .clone();

    // Author a new value as `a`, branching from step 0.
    let branched = graph
        .update_state(&at_step0, vec![("msg".into(), json!("bye"))], Some("a"))
        .await
        .unwrap();

    // The fork is a leaf whose parent is the step-0 checkpoint.
    let state = graph.get_state(&branched).await.unwrap();
    let metadata = state.metadata.clone().unwrap();
    assert_eq!(metadata.source, CheckpointSource::Update);
    assert_eq!(metadata.step, 1);
    assert_eq!(metadata.writes["a"], json!({"msg": "bye"}));
    assert_eq!(
        state.parent_config.unwrap().checkpoint_id,
        at_step0.checkpoint_id
    );
    assert_eq!(state.values["msg"], json!("bye"));
    assert!(state.next.is_empty(), "the authored node counts as having run");

    // Replaying from the fork keeps the authored value.
    let out = graph.invoke(None, branched).await.unwrap();
    assert_eq!(out["msg"], json!("bye"));

    // Both leaves are visible in history: the original run's tip and the
    // update (plus the fork created by the replay).
    let history = graph
        .get_state_history(&config, ListOptions::default())
        .await
        .unwrap();
    let sources: Vec<CheckpointSource> = history
        .iter()
        .map(|s| s.metadata.as_ref().unwrap().source)
        .collect();
    assert!(sources.contains(&CheckpointSource::Update));
    assert!(sources.contains(&CheckpointSource::Fork));
    let step_one_leaves = history
        .iter()
        .filter(|s| s.metadata.as_ref().unwrap().step == 1)
        .count();
    assert!(step_one_leaves >= 2, "original and branched step-1 snapshots coexist");
}

#[tokio::test]
async fn update_state_infers_the_sole_node() {
    let graph = linear();
    let config = RunConfig::for_thread("t1");
    graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();

    let updated = graph
        .update_state(&config, vec![("msg".into(), json!("inferred"))], None)
        .await
        .unwrap();
    let state = graph.get_state(&updated).await.unwrap();
    assert_eq!(state.values["msg"], json!("inferred"));
    assert_eq!(
        state.metadata.unwrap().writes.keys().collect::<Vec<_>>(),
        vec!["a"]
    );
}

#[tokio::test]
async fn update_state_rejects_reserved_channels() {
    let graph = linear();
    let config = RunConfig::for_thread("t1");
    graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();

    let err = graph
        .update_state(
            &config,
            vec![("__interrupt__".into(), json!("nope"))],
            Some("a"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, stepgraph::runtimes::RunnerError::Channel(_)));
}

/********************
 * Planner determinism
 ********************/

#[tokio::test]
async fn planned_task_ids_are_stable_across_reads() {
    let graph = GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_node("a", write_node("msg", json!("hi")))
        .add_edge(START_NODE, "a")
        .add_edge("a", END_NODE)
        .with_interrupt_before(["a"])
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();
    let config = RunConfig::for_thread("t1");
    let _ = graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap_err();

    let first = graph.get_state(&config).await.unwrap();
    let second = graph.get_state(&config).await.unwrap();
    let first_ids: Vec<&str> = first.tasks.iter().map(|t| t.id.as_str()).collect();
    let second_ids: Vec<&str> = second.tasks.iter().map(|t| t.id.as_str()).collect();
    assert!(!first_ids.is_empty());
    assert_eq!(first_ids, second_ids);
}

/********************
 * Reducer semantics on update
 ********************/

#[tokio::test]
async fn update_state_folds_through_reducer_channels() {
    let graph = GraphBuilder::new()
        .add_channel("msg", ChannelSpec::last_value())
        .add_channel(
            "total",
            ChannelSpec::aggregate(|a, b| {
                json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
            }),
        )
        .add_node("a", {
            struct Both;
            #[async_trait::async_trait]
            impl stepgraph::node::Node for Both {
                async fn run(
                    &self,
                    _input: serde_json::Value,
                    _ctx: stepgraph::node::NodeContext,
                ) -> Result<stepgraph::node::NodeOutput, stepgraph::node::NodeError> {
                    Ok(stepgraph::node::NodeOutput::new()
                        .with_write("msg", json!("ran"))
                        .with_write("total", json!(10)))
                }
            }
            Both
        })
        .add_edge(START_NODE, "a")
        .add_edge("a", END_NODE)
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()))
        .compile()
        .unwrap();
    let config = RunConfig::for_thread("t1");
    graph
        .invoke(Some(GraphInput::values([("msg", json!(""))])), config.clone())
        .await
        .unwrap();

    let updated = graph
        .update_state(
            &config,
            vec![("msg".into(), json!("replaced")), ("total".into(), json!(5))],
            Some("a"),
        )
        .await
        .unwrap();
    let state = graph.get_state(&updated).await.unwrap();
    // Last-write-wins channel returns exactly the value passed in; the
    // reducer channel folds it into the previous total.
    assert_eq!(state.values["msg"], json!("replaced"));
    assert_eq!(state.values["total"], json!(15));
}
