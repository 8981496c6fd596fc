//! Two-tier run cache behavior across the live/complete transition.

mod common;

use std::sync::Arc;
use std::time::Duration;

use daq_catalog::document::{ExitStatus, RunStop};
use daq_catalog::store::memory::MemoryStore;
use daq_catalog::store::Deadline;
use daq_catalog::Catalog;

use common::{seed_scalar_run, CountingStore};

#[tokio::test]
async fn test_live_then_complete_caching() {
    let memory = Arc::new(MemoryStore::new());
    let uid = seed_scalar_run(&memory, 1, 0.0, &[(1, 1.0, 1)], false).await;

    let counting = Arc::new(CountingStore::new(memory.clone()));
    let catalog = Catalog::builder()
        .store(counting.clone())
        // Short live TTL so the test can outlive it quickly.
        .cache_ttls(Duration::from_secs(60), Duration::from_millis(200))
        .build();

    // First access builds the run and caches it in the live tier.
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert!(!run.is_complete());
    assert!(run.must_revalidate());
    let reads_after_build = counting.reads();
    assert!(reads_after_build > 0);

    // Within the live TTL the store is not consulted again.
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert!(!run.is_complete());
    assert_eq!(counting.reads(), reads_after_build);

    // The run completes; once the live entry expires, the next access
    // rebuilds and lands in the complete tier.
    let stop = RunStop::new(&uid, ExitStatus::Success).with_time(2.0);
    memory.insert_run_stop(&stop).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert!(run.is_complete());
    assert!(!run.must_revalidate());
    let reads_after_rebuild = counting.reads();
    assert!(reads_after_rebuild > reads_after_build);

    // Subsequent accesses hit the long-TTL complete entry.
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    assert!(run.is_complete());
    assert_eq!(counting.reads(), reads_after_rebuild);
}

#[tokio::test]
async fn test_distinct_catalogs_do_not_share_caches() {
    let memory = Arc::new(MemoryStore::new());
    let uid = seed_scalar_run(&memory, 2, 0.0, &[(1, 1.0, 1)], true).await;

    let first = Catalog::from_store(memory.clone());
    let second = Catalog::from_store(memory.clone());
    let from_first = first.get(&uid, Deadline::none()).await.unwrap();
    let from_second = second.get(&uid, Deadline::none()).await.unwrap();
    assert_eq!(from_first.uid(), from_second.uid());

    // Derived catalogs, however, do share the run cache.
    let derived = first.sort(vec![]);
    let from_derived = derived.get(&uid, Deadline::none()).await.unwrap();
    assert_eq!(from_derived.uid(), uid);
}

#[tokio::test]
async fn test_stale_at_tracks_completion() {
    let memory = Arc::new(MemoryStore::new());
    let live_uid = seed_scalar_run(&memory, 3, 0.0, &[(1, 1.0, 1)], false).await;
    let done_uid = seed_scalar_run(&memory, 4, 0.0, &[(1, 1.0, 1)], true).await;

    let catalog = Catalog::builder()
        .store(memory)
        .cache_ttls(Duration::from_secs(3600), Duration::from_secs(1))
        .build();

    let live = catalog.get(&live_uid, Deadline::none()).await.unwrap();
    let done = catalog.get(&done_uid, Deadline::none()).await.unwrap();
    // The volatile view goes stale sooner than the stable one.
    assert!(live.stale_at() < done.stale_at());

    let live_stream = live.stream("primary", Deadline::none()).await.unwrap();
    assert!(live_stream.must_revalidate());
    let done_stream = done.stream("primary", Deadline::none()).await.unwrap();
    assert!(!done_stream.must_revalidate());
}
