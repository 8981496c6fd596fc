//! Shared helpers for the integration tests.
//!
//! Tests run against the in-memory store, seeded through the same
//! document builders the acquisition side uses.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use daq_catalog::document::{DataKey, Dtype, Event, EventDescriptor, ExitStatus, RunStart, RunStop};
use daq_catalog::error::CatalogResult;
use daq_catalog::store::memory::MemoryStore;
use daq_catalog::store::{Collection, Deadline, DocumentStore, Filter, FindOptions, RawDocument};

/// A store wrapper that counts every read, for cache-behavior assertions.
pub struct CountingStore {
    pub inner: Arc<MemoryStore>,
    reads: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> CatalogResult<Vec<RawDocument>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find(collection, filter, options).await
    }

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<u64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.count(collection, filter, deadline).await
    }

    async fn distinct(
        &self,
        collection: Collection,
        field: &str,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.distinct(collection, field, filter, deadline).await
    }

    fn supports_text_search(&self) -> bool {
        self.inner.supports_text_search()
    }
}

/// Seed one run with a single integer column `x`.
///
/// `points` are `(seq_num, time, x)` triples. Returns the run uid.
pub async fn seed_scalar_run(
    store: &MemoryStore,
    scan_id: i64,
    start_time: f64,
    points: &[(u64, f64, i64)],
    complete: bool,
) -> String {
    let start = RunStart::new(scan_id).with_time(start_time);
    store.insert_run_start(&start).await;

    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(start_time)
        .with_data_key("x", DataKey::scalar(Dtype::Integer, "motor"))
        .with_object_keys("motor", &["x"]);
    store.insert_descriptor(&descriptor).await;

    for &(seq_num, time, x) in points {
        let event = Event::new(&descriptor.uid, seq_num)
            .with_time(time)
            .with_datum("x", Value::from(x));
        store.insert_event(&event).await;
    }

    if complete {
        let stop_time = points.last().map(|(_, t, _)| t + 1.0).unwrap_or(start_time);
        let stop = RunStop::new(&start.uid, ExitStatus::Success).with_time(stop_time);
        store.insert_run_stop(&stop).await;
    }
    start.uid
}
