use std::time::Duration;

use serde_json::json;

use stepgraph::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSource};
use stepgraph::runtimes::{Checkpointer, InMemoryCheckpointer, ListOptions, RunConfig};

fn checkpoint(step: i64) -> (Checkpoint, CheckpointMetadata) {
    let mut cp = Checkpoint::empty(step);
    cp.channel_values.insert("msg".into(), json!(format!("step {step}")));
    cp.channel_versions.insert("msg".into(), (step + 2) as u64);
    let source = if step < 0 {
        CheckpointSource::Input
    } else {
        CheckpointSource::Loop
    };
    (cp, CheckpointMetadata::new(source, step))
}

async fn seed_thread(saver: &InMemoryCheckpointer, thread: &str, steps: i64) -> Vec<String> {
    let mut config = RunConfig::for_thread(thread);
    let mut ids = Vec::new();
    for step in -1..steps {
        let (cp, metadata) = checkpoint(step);
        ids.push(cp.id.clone());
        config = saver
            .put(&config, cp.clone(), metadata, cp.channel_versions.clone())
            .await
            .unwrap();
    }
    ids
}

/********************
 * put / get_tuple
 ********************/

#[tokio::test]
async fn put_then_get_tuple_is_identity() {
    let saver = InMemoryCheckpointer::new();
    let config = RunConfig::for_thread("t1");
    let (cp, metadata) = checkpoint(0);

    let updated = saver
        .put(&config, cp.clone(), metadata.clone(), cp.channel_versions.clone())
        .await
        .unwrap();
    assert_eq!(updated.checkpoint_id.as_ref(), Some(&cp.id));

    let tuple = saver.get_tuple(&updated).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint, cp);
    assert_eq!(tuple.metadata, metadata);
    assert!(tuple.parent_config.is_none());
    assert!(tuple.pending_writes.is_empty());
}

#[tokio::test]
async fn get_tuple_without_id_returns_latest() {
    let saver = InMemoryCheckpointer::new();
    let ids = seed_thread(&saver, "t1", 3).await;

    let latest = saver
        .get_tuple(&RunConfig::for_thread("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&latest.checkpoint.id, ids.last().unwrap());
    // Parent linkage follows the put chain.
    assert_eq!(
        latest.parent_config.unwrap().checkpoint_id.as_deref(),
        Some(ids[ids.len() - 2].as_str())
    );

    let pinned = saver
        .get_tuple(&RunConfig::for_thread("t1").with_checkpoint_id(ids[0].clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pinned.checkpoint.id, ids[0]);
}

#[tokio::test]
async fn checkpoint_ids_sort_with_history() {
    let saver = InMemoryCheckpointer::new();
    let ids = seed_thread(&saver, "t1", 4).await;

    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted, "creation order must equal lexical order");

    let listed = saver
        .list(&RunConfig::for_thread("t1"), ListOptions::default())
        .await
        .unwrap();
    let listed_ids: Vec<&str> = listed.iter().map(|t| t.checkpoint.id.as_str()).collect();
    let mut newest_first = ids.clone();
    newest_first.reverse();
    assert_eq!(listed_ids, newest_first);
}

/********************
 * list options
 ********************/

#[tokio::test]
async fn list_honors_limit_before_and_filter() {
    let saver = InMemoryCheckpointer::new();
    let ids = seed_thread(&saver, "t1", 4).await;
    let config = RunConfig::for_thread("t1");

    let limited = saver
        .list(
            &config,
            ListOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    let before = saver
        .list(
            &config,
            ListOptions {
                before: Some(ids[2].clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(before.iter().all(|t| t.checkpoint.id < ids[2]));
    assert_eq!(before.len(), 2);

    let mut filter = rustc_hash::FxHashMap::default();
    filter.insert("source".to_string(), json!("input"));
    let inputs = saver
        .list(
            &config,
            ListOptions {
                filter: Some(filter),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].metadata.step, -1);
}

/********************
 * pending writes
 ********************/

#[tokio::test]
async fn put_writes_is_idempotent_per_task_and_slot() {
    let saver = InMemoryCheckpointer::new();
    let ids = seed_thread(&saver, "t1", 1).await;
    let config = RunConfig::for_thread("t1").with_checkpoint_id(ids.last().unwrap().clone());

    let writes = vec![
        ("msg".to_string(), json!("partial")),
        ("log".to_string(), json!(["x"])),
    ];
    saver
        .put_writes(&config, writes.clone(), "task-1")
        .await
        .unwrap();
    saver.put_writes(&config, writes, "task-1").await.unwrap();

    let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
    assert_eq!(tuple.pending_writes.len(), 2);
    assert!(tuple.pending_writes.iter().all(|w| w.task_id == "task-1"));
}

#[tokio::test]
async fn pending_writes_are_visible_with_their_checkpoint() {
    let saver = InMemoryCheckpointer::new();
    let ids = seed_thread(&saver, "t1", 2).await;
    let at_first = RunConfig::for_thread("t1").with_checkpoint_id(ids[1].clone());

    saver
        .put_writes(&at_first, vec![("msg".to_string(), json!("w"))], "task-9")
        .await
        .unwrap();

    // Attached to the addressed snapshot, not to the latest one.
    let first = saver.get_tuple(&at_first).await.unwrap().unwrap();
    assert_eq!(first.pending_writes.len(), 1);
    let latest = saver
        .get_tuple(&RunConfig::for_thread("t1"))
        .await
        .unwrap()
        .unwrap();
    assert!(latest.pending_writes.is_empty());
}

/********************
 * deletion and TTL
 ********************/

#[tokio::test]
async fn delete_thread_removes_every_namespace() {
    let saver = InMemoryCheckpointer::new();
    seed_thread(&saver, "t1", 2).await;

    let sub = RunConfig::for_thread("t1").with_checkpoint_ns("child:0");
    let (cp, metadata) = checkpoint(0);
    saver
        .put(&sub, cp.clone(), metadata, cp.channel_versions.clone())
        .await
        .unwrap();

    saver.delete_thread("t1").await.unwrap();
    assert!(saver.get_tuple(&RunConfig::for_thread("t1")).await.unwrap().is_none());
    assert!(saver.get_tuple(&sub).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_tuples_are_filtered_and_swept() {
    let saver = InMemoryCheckpointer::new().with_ttl(Duration::ZERO);
    seed_thread(&saver, "t1", 2).await;

    assert!(saver.get_tuple(&RunConfig::for_thread("t1")).await.unwrap().is_none());
    assert!(
        saver
            .list(&RunConfig::for_thread("t1"), ListOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(saver.sweep().unwrap(), 3);
    assert_eq!(saver.sweep().unwrap(), 0);
}

#[tokio::test]
async fn missing_thread_id_is_an_error() {
    let saver = InMemoryCheckpointer::new();
    let err = saver.get_tuple(&RunConfig::default()).await.unwrap_err();
    assert!(matches!(
        err,
        stepgraph::runtimes::CheckpointerError::MissingThread
    ));
}
