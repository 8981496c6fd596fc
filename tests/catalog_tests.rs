//! Catalog search, sorting, and pagination scenarios.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use daq_catalog::access::{AccessList, Identity, SimpleAccessPolicy};
use daq_catalog::document::RunStart;
use daq_catalog::error::CatalogError;
use daq_catalog::store::memory::{MemoryStore, NoTextSearch};
use daq_catalog::store::{Deadline, SortDirection};
use daq_catalog::{Catalog, SearchQuery};

use common::seed_scalar_run;

async fn seed_index(store: &MemoryStore, count: i64) -> Vec<String> {
    let mut uids = Vec::new();
    for scan_id in 1..=count {
        let start = RunStart::new(scan_id)
            .with_time(scan_id as f64)
            .with_metadata("plan_name", json!(if scan_id % 2 == 0 { "count" } else { "grid_scan" }));
        store.insert_run_start(&start).await;
        uids.push(start.uid);
    }
    uids
}

/// Keyset pagination under concurrent insertion: every pre-existing run
/// exactly once, no duplicates, no skips.
#[tokio::test]
async fn test_keyset_pagination_under_insertion() {
    let store = Arc::new(MemoryStore::new());
    let originals: HashSet<String> = seed_index(&store, 250).await.into_iter().collect();

    let catalog = Catalog::from_store(store.clone())
        .sort(vec![("scan_id".to_string(), SortDirection::Ascending)]);

    let mut iter = catalog.iter(Deadline::none());
    let mut seen = Vec::new();
    // Pull past the first internal batch (100), then insert a run that
    // sorts behind the cursor.
    for _ in 0..150 {
        seen.push(iter.next_start().await.unwrap().unwrap().uid);
    }
    let latecomer = RunStart::new(50).with_time(999.0);
    store.insert_run_start(&latecomer).await;
    while let Some(start) = iter.next_start().await.unwrap() {
        seen.push(start.uid);
    }

    assert_eq!(seen.len(), 250);
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), 250, "duplicate uid yielded");
    assert!(seen.iter().all(|uid| originals.contains(uid)));
}

#[tokio::test]
async fn test_slice_and_len() {
    let store = Arc::new(MemoryStore::new());
    seed_index(&store, 10).await;
    let catalog = Catalog::from_store(store);
    assert_eq!(catalog.len(Deadline::none()).await.unwrap(), 10);

    let mut iter = catalog.slice(3, Some(2), Deadline::none());
    let mut scan_ids = Vec::new();
    while let Some(start) = iter.next_start().await.unwrap() {
        scan_ids.push(start.scan_id);
    }
    // Default sort is time ascending, which tracks scan_id here.
    assert_eq!(scan_ids, vec![4, 5]);
}

/// Time range queries are half-open `[since, until)`.
#[tokio::test]
async fn test_time_range_half_open() {
    let store = Arc::new(MemoryStore::new());
    seed_index(&store, 10).await;
    let catalog = Catalog::from_store(store);
    let narrowed = catalog
        .search(&SearchQuery::TimeRange {
            since: Some(3.0),
            until: Some(7.0),
        })
        .await
        .unwrap();
    let mut times = Vec::new();
    let mut iter = narrowed.iter(Deadline::none());
    while let Some(start) = iter.next_start().await.unwrap() {
        times.push(start.time);
    }
    assert_eq!(times, vec![3.0, 4.0, 5.0, 6.0]);
}

#[tokio::test]
async fn test_scan_id_newest_wins() {
    let store = Arc::new(MemoryStore::new());
    let old_uid = seed_scalar_run(&store, 42, 10.0, &[(1, 11.0, 1)], true).await;
    let new_uid = seed_scalar_run(&store, 42, 100.0, &[(1, 101.0, 2)], true).await;

    let catalog = Catalog::from_store(store);
    let run = catalog.get_by_scan_id(42, Deadline::none()).await.unwrap();
    assert_eq!(run.uid(), new_uid);
    assert_ne!(run.uid(), old_uid);

    let narrowed = catalog
        .search(&SearchQuery::ScanId(vec![42]))
        .await
        .unwrap();
    assert_eq!(narrowed.len(Deadline::none()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_partial_uid_lookup() {
    let store = Arc::new(MemoryStore::new());
    let uids = seed_index(&store, 5).await;
    let catalog = Catalog::from_store(store);

    let fragment = uids[2][..8].to_string();
    let narrowed = catalog
        .search(&SearchQuery::PartialUid(vec![fragment]))
        .await
        .unwrap();
    assert_eq!(narrowed.uids(Deadline::none()).await.unwrap(), vec![uids[2].clone()]);

    // Too-short fragments are rejected up front.
    let err = catalog
        .search(&SearchQuery::PartialUid(vec!["ab".to_string()]))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_full_text_native_and_fallback() {
    let store = Arc::new(MemoryStore::new());
    seed_index(&store, 6).await;

    let query = SearchQuery::FullText {
        text: "grid_scan".to_string(),
        case_sensitive: false,
    };

    // Native text search.
    let catalog = Catalog::from_store(store.clone());
    let narrowed = catalog.search(&query).await.unwrap();
    assert_eq!(narrowed.len(Deadline::none()).await.unwrap(), 3);

    // A store without text support falls back to an in-memory scan with
    // the same results.
    let fallback_catalog = Catalog::from_store(Arc::new(NoTextSearch(
        common::CountingStore::new(store.clone()),
    )));
    let narrowed = fallback_catalog.search(&query).await.unwrap();
    assert_eq!(narrowed.len(Deadline::none()).await.unwrap(), 3);
}

#[tokio::test]
async fn test_metadata_key_queries() {
    let store = Arc::new(MemoryStore::new());
    seed_index(&store, 6).await;
    let catalog = Catalog::from_store(store);

    let narrowed = catalog
        .search(&SearchQuery::Eq {
            key: "start.plan_name".to_string(),
            value: json!("count"),
        })
        .await
        .unwrap();
    assert_eq!(narrowed.len(Deadline::none()).await.unwrap(), 3);

    let narrowed = catalog
        .search(&SearchQuery::Comparison {
            key: "scan_id".to_string(),
            op: daq_catalog::query::CmpOp::Ge,
            value: json!(5),
        })
        .await
        .unwrap();
    assert_eq!(narrowed.len(Deadline::none()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_access_policy_restricts_and_admin_bypasses() {
    let store = Arc::new(MemoryStore::new());
    let uids = seed_index(&store, 4).await;

    let mut lists = std::collections::HashMap::new();
    lists.insert(
        "alice".to_string(),
        AccessList::Values(vec![json!(uids[0].clone()), json!(uids[1].clone())]),
    );
    let policy = Arc::new(SimpleAccessPolicy::new(lists, "uid"));

    let catalog = Catalog::builder()
        .store(store)
        .access_policy(policy)
        .build();

    let alice = catalog
        .authenticated_as(Identity::User("alice".to_string()))
        .unwrap();
    assert_eq!(alice.len(Deadline::none()).await.unwrap(), 2);
    assert!(alice.get(&uids[3], Deadline::none()).await.is_err());

    let admin = catalog.authenticated_as(Identity::Admin).unwrap();
    assert_eq!(admin.len(Deadline::none()).await.unwrap(), 4);

    let err = catalog
        .authenticated_as(Identity::User("mallory".to_string()))
        .unwrap_err();
    assert!(matches!(err, CatalogError::AccessDenied { .. }));
}

/// Reading a cached run twice yields equal, already-repaired documents.
#[tokio::test]
async fn test_transforms_apply_once_per_read() {
    use daq_catalog::document::Document;
    use daq_catalog::transforms::Transforms;

    let store = Arc::new(MemoryStore::new());
    let uid = seed_scalar_run(&store, 9, 1.0, &[(1, 2.0, 1)], true).await;

    let mut transforms = Transforms::new();
    transforms
        .insert(
            "start",
            Arc::new(|doc| match doc {
                Document::Start(mut start) => {
                    start.extra.insert("repaired".to_string(), json!(true));
                    Document::Start(start)
                }
                other => other,
            }),
        )
        .unwrap();

    let catalog = Catalog::builder().store(store).transforms(transforms).build();
    let first = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert_eq!(first.start().extra.get("repaired"), Some(&json!(true)));
    let second = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert_eq!(first.start(), second.start());
}

#[tokio::test]
async fn test_get_unknown_run() {
    let store = Arc::new(MemoryStore::new());
    seed_index(&store, 1).await;
    let catalog = Catalog::from_store(store);
    let err = catalog.get("no-such-uid", Deadline::none()).await.unwrap_err();
    assert!(matches!(err, CatalogError::RunNotFound { .. }));
}
