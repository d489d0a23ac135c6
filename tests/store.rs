use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use stepgraph::store::{
    Embedder, InMemoryStore, IndexConfig, ListNamespacesOptions, PutOptions, SearchOptions, Store,
    StoreError, StoreOp, StoreResult,
};

fn ns(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|s| s.to_string()).collect()
}

/********************
 * get / put / delete
 ********************/

#[tokio::test]
async fn put_get_delete_roundtrip() {
    let store = InMemoryStore::new();
    let users = ns(&["users", "u1"]);

    store
        .put(&users, "profile", json!({"name": "Ada"}), PutOptions::default())
        .await
        .unwrap();
    let item = store.get(&users, "profile").await.unwrap().unwrap();
    assert_eq!(item.value, json!({"name": "Ada"}));
    assert_eq!(item.namespace, users);
    assert_eq!(item.key, "profile");
    let created = item.created_at;

    // Replacing keeps the creation time, bumps the update time.
    store
        .put(&users, "profile", json!({"name": "Ada L."}), PutOptions::default())
        .await
        .unwrap();
    let item = store.get(&users, "profile").await.unwrap().unwrap();
    assert_eq!(item.created_at, created);
    assert!(item.updated_at >= created);

    store.delete(&users, "profile").await.unwrap();
    assert!(store.get(&users, "profile").await.unwrap().is_none());
}

#[tokio::test]
async fn namespace_rules_are_enforced() {
    let store = InMemoryStore::new();
    for bad in [ns(&[]), ns(&[""]), ns(&["a.b"]), ns(&["langgraph", "x"])] {
        let err = store
            .put(&bad, "k", json!(1), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidNamespace { .. }));
    }
}

#[tokio::test]
async fn ttl_expires_items_on_read() {
    let store = InMemoryStore::new();
    let scratch = ns(&["scratch"]);
    store
        .put(
            &scratch,
            "gone",
            json!(1),
            PutOptions {
                ttl: Some(Duration::ZERO),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(store.get(&scratch, "gone").await.unwrap().is_none());
    assert!(
        store
            .search(&scratch, SearchOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
}

/********************
 * search
 ********************/

async fn seeded() -> InMemoryStore {
    let store = InMemoryStore::new();
    for (nsx, key, value) in [
        (ns(&["docs", "a"]), "1", json!({"kind": "note", "text": "alpha"})),
        (ns(&["docs", "a"]), "2", json!({"kind": "memo", "text": "beta"})),
        (ns(&["docs", "b"]), "3", json!({"kind": "note", "text": "gamma"})),
        (ns(&["other"]), "4", json!({"kind": "note", "text": "delta"})),
    ] {
        store.put(&nsx, key, value, PutOptions::default()).await.unwrap();
    }
    store
}

#[tokio::test]
async fn search_scopes_by_prefix_and_filter() {
    let store = seeded().await;

    let docs = store.search(&ns(&["docs"]), SearchOptions::default()).await.unwrap();
    assert_eq!(docs.len(), 3);
    // Deterministic namespace/key order without a query.
    assert_eq!(docs[0].item.key, "1");
    assert!(docs.iter().all(|hit| hit.score.is_none()));

    let mut filter = rustc_hash::FxHashMap::default();
    filter.insert("kind".to_string(), json!("note"));
    let notes = store
        .search(
            &ns(&["docs"]),
            SearchOptions {
                filter: Some(filter),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|hit| hit.item.value["kind"] == json!("note")));
}

#[tokio::test]
async fn search_paginates_with_limit_and_offset() {
    let store = seeded().await;
    let page = store
        .search(
            &ns(&["docs"]),
            SearchOptions {
                limit: 2,
                offset: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].item.key, "2");
}

/********************
 * vector index
 ********************/

/// Deterministic toy embedder: characters histogrammed into a fixed number
/// of buckets, so equal texts embed identically.
struct BucketEmbedder {
    dims: usize,
}

#[async_trait]
impl Embedder for BucketEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dims];
                for b in text.bytes() {
                    v[(b as usize) % self.dims] += 1.0;
                }
                v
            })
            .collect())
    }
}

#[tokio::test]
async fn query_search_ranks_by_similarity() {
    let store = InMemoryStore::new().with_index(IndexConfig {
        dims: 8,
        embedder: Arc::new(BucketEmbedder { dims: 8 }),
        fields: vec!["/text".to_string()],
    });
    let docs = ns(&["docs"]);
    store
        .put(&docs, "a", json!({"text": "the quick brown fox"}), PutOptions::default())
        .await
        .unwrap();
    store
        .put(&docs, "b", json!({"text": "zzzzzz"}), PutOptions::default())
        .await
        .unwrap();

    let hits = store
        .search(
            &docs,
            SearchOptions {
                query: Some("the quick brown fox".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits[0].item.key, "a");
    let top = hits[0].score.unwrap();
    assert!((top - 1.0).abs() < 1e-6, "identical text scores ~1, got {top}");
    assert!(hits[1].score.unwrap() < top);
}

#[tokio::test]
async fn mismatched_embedder_dims_fail_the_put() {
    let store = InMemoryStore::new().with_index(IndexConfig {
        dims: 16,
        embedder: Arc::new(BucketEmbedder { dims: 8 }),
        fields: vec!["/text".to_string()],
    });
    let err = store
        .put(&ns(&["docs"]), "a", json!({"text": "x"}), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Embedding { .. }));
}

/********************
 * namespaces and batching
 ********************/

#[tokio::test]
async fn list_namespaces_prefix_suffix_depth() {
    let store = seeded().await;

    let all = store
        .list_namespaces(ListNamespacesOptions::default())
        .await
        .unwrap();
    assert_eq!(all, vec![ns(&["docs", "a"]), ns(&["docs", "b"]), ns(&["other"])]);

    let docs = store
        .list_namespaces(ListNamespacesOptions {
            prefix: Some(ns(&["docs"])),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(docs.len(), 2);

    let shallow = store
        .list_namespaces(ListNamespacesOptions {
            max_depth: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(shallow, vec![ns(&["docs"]), ns(&["other"])]);

    let b_suffix = store
        .list_namespaces(ListNamespacesOptions {
            suffix: Some(ns(&["b"])),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(b_suffix, vec![ns(&["docs", "b"])]);
}

#[tokio::test]
async fn batch_executes_in_call_order() {
    let store = InMemoryStore::new();
    let results = store
        .batch(vec![
            StoreOp::Put {
                namespace: ns(&["batch"]),
                key: "k".to_string(),
                value: json!(1),
                options: PutOptions::default(),
            },
            StoreOp::Get {
                namespace: ns(&["batch"]),
                key: "k".to_string(),
            },
            StoreOp::Delete {
                namespace: ns(&["batch"]),
                key: "k".to_string(),
            },
            StoreOp::Get {
                namespace: ns(&["batch"]),
                key: "k".to_string(),
            },
        ])
        .await
        .unwrap();

    assert!(matches!(results[0], StoreResult::Unit));
    let StoreResult::Item(Some(item)) = &results[1] else {
        panic!("expected the freshly written item");
    };
    assert_eq!(item.value, json!(1));
    assert!(matches!(results[2], StoreResult::Unit));
    assert!(matches!(results[3], StoreResult::Item(None)));
}
