//! Run and stream handles.
//!
//! A [`Run`] bundles everything known about one acquisition: the start
//! document, the stop document when the run has completed, the event
//! descriptors grouped by stream name, and a lazily constructed filler
//! shared by all of its datasets. Runs are cheap-clone handles over shared
//! immutable state; streams are built on demand and hold the same shared
//! state, so nothing owns anything cyclically and cache eviction of a Run
//! drops its streams with the last reader.
//!
//! Transforms are applied when documents are read out of the store, at
//! run construction; a cached run therefore hands out identical documents
//! on every access.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dataset::Dataset;
use crate::document::{EventDescriptor, RunStart, RunStop};
use crate::error::{CatalogError, CatalogResult};
use crate::filler::{HandlerRegistry, LazyFiller};
use crate::materializer::{build_config_dataset, ChunkPolicy, StreamDataset};
use crate::store::{Deadline, StoreAdapter, SubDict};
use crate::transforms::Transforms;

/// Everything a run needs from its catalog.
#[derive(Clone)]
pub struct RunContext {
    pub adapter: StoreAdapter,
    pub transforms: Transforms,
    pub registry: HandlerRegistry,
    pub root_map: HashMap<String, String>,
    pub chunk_policy: ChunkPolicy,
    pub ttl_complete: Duration,
    pub ttl_partial: Duration,
}

struct RunInner {
    context: RunContext,
    start: RunStart,
    stop: Option<RunStop>,
    stream_names: Vec<String>,
    /// Stream name -> descriptors, time-ordered, transforms applied.
    descriptors: HashMap<String, Vec<EventDescriptor>>,
    filler: Arc<LazyFiller>,
}

/// A cheap-clone handle to one run.
#[derive(Clone)]
pub struct Run {
    inner: Arc<RunInner>,
}

impl Run {
    /// Fetch the stop document, stream names, and descriptors for
    /// `start`, and assemble the handle. One stop fetch, one distinct
    /// query, one descriptor fetch per stream.
    pub(crate) async fn build(
        context: RunContext,
        start: RunStart,
        deadline: Deadline,
    ) -> CatalogResult<Run> {
        let start = context.transforms.apply_start(start);
        let stop = context
            .adapter
            .run_stop(&start.uid, deadline)
            .await?
            .map(|stop| context.transforms.apply_stop(stop));
        let stream_names = context.adapter.stream_names(&start.uid, deadline).await?;

        let mut descriptors = HashMap::new();
        let mut all_descriptors = Vec::new();
        for name in &stream_names {
            let stream_descriptors: Vec<EventDescriptor> = context
                .adapter
                .descriptors(&start.uid, name, deadline)
                .await?
                .into_iter()
                .map(|d| context.transforms.apply_descriptor(d))
                .collect();
            all_descriptors.extend(stream_descriptors.iter().cloned());
            descriptors.insert(name.clone(), stream_descriptors);
        }

        let filler = Arc::new(LazyFiller::new(
            context.registry.clone(),
            context.root_map.clone(),
            context.adapter.clone(),
            context.transforms.clone(),
            all_descriptors,
        ));

        Ok(Run {
            inner: Arc::new(RunInner {
                context,
                start,
                stop,
                stream_names,
                descriptors,
                filler,
            }),
        })
    }

    pub fn uid(&self) -> &str {
        &self.inner.start.uid
    }

    /// The start document, transforms applied.
    pub fn start(&self) -> &RunStart {
        &self.inner.start
    }

    /// The stop document, if the run has completed.
    pub fn stop(&self) -> Option<&RunStop> {
        self.inner.stop.as_ref()
    }

    /// Whether the stop document is present.
    pub fn is_complete(&self) -> bool {
        self.inner.stop.is_some()
    }

    pub fn stream_names(&self) -> &[String] {
        &self.inner.stream_names
    }

    /// Volatile (live) views must be revalidated often; stable ones not.
    pub fn must_revalidate(&self) -> bool {
        !self.is_complete()
    }

    /// When cached copies of this run's views should be considered stale.
    pub fn stale_at(&self) -> Instant {
        let ttl = if self.is_complete() {
            self.inner.context.ttl_complete
        } else {
            self.inner.context.ttl_partial
        };
        Instant::now() + ttl
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::new(&self.inner.start, self.inner.stop.as_ref(), &self.inner.stream_names)
    }

    pub(crate) fn context(&self) -> &RunContext {
        &self.inner.context
    }

    pub(crate) fn filler_handle(&self) -> Arc<LazyFiller> {
        self.inner.filler.clone()
    }

    /// Descriptors of one stream, time-ordered, transforms applied.
    pub fn descriptors(&self, stream_name: &str) -> Option<&[EventDescriptor]> {
        self.inner
            .descriptors
            .get(stream_name)
            .map(Vec::as_slice)
    }

    /// Open one stream, pinning its cutoff seq_num at this moment.
    pub async fn stream(&self, name: &str, deadline: Deadline) -> CatalogResult<Stream> {
        let descriptors = self
            .inner
            .descriptors
            .get(name)
            .filter(|d| !d.is_empty())
            .cloned()
            .ok_or_else(|| CatalogError::StreamNotFound {
                run_uid: self.uid().to_string(),
                stream: name.to_string(),
            })?;
        let descriptor_uids: Vec<String> = descriptors.iter().map(|d| d.uid.clone()).collect();
        let max_seq = self
            .inner
            .context
            .adapter
            .max_seq_num(&descriptor_uids, deadline)
            .await?;
        // `1 +` because materialization works in half-open intervals.
        let cutoff_seq_num = 1 + max_seq.unwrap_or(0);
        Ok(Stream {
            run: self.clone(),
            name: name.to_string(),
            descriptors,
            cutoff_seq_num,
        })
    }

    /// All streams of this run.
    pub async fn streams(&self, deadline: Deadline) -> CatalogResult<Vec<Stream>> {
        let mut streams = Vec::with_capacity(self.inner.stream_names.len());
        for name in &self.inner.stream_names {
            streams.push(self.stream(name, deadline).await?);
        }
        Ok(streams)
    }

    /// Replay this run document by document. Only `fill=false` is
    /// implemented.
    pub async fn single_documents(
        &self,
        fill: bool,
        deadline: Deadline,
    ) -> CatalogResult<crate::replay::DocumentReplay> {
        crate::replay::DocumentReplay::new(self.clone(), fill, deadline).await
    }

    /// Replay this run with events and datums batched into pages of at
    /// most `size` rows.
    pub async fn documents(
        &self,
        fill: bool,
        size: usize,
        deadline: Deadline,
    ) -> CatalogResult<crate::replay::PagedReplay> {
        crate::replay::PagedReplay::new(self.clone(), fill, size, deadline).await
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("uid", &self.uid())
            .field("scan_id", &self.inner.start.scan_id)
            .field("streams", &self.inner.stream_names)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Human-facing digest of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub uid: String,
    pub scan_id: i64,
    pub timestamp: f64,
    pub datetime: DateTime<Utc>,
    pub plan_name: Option<String>,
    pub stream_names: Vec<String>,
    /// Seconds from start to stop; `None` while the run is live.
    pub duration: Option<f64>,
}

impl RunSummary {
    fn new(start: &RunStart, stop: Option<&RunStop>, stream_names: &[String]) -> Self {
        let datetime = DateTime::from_timestamp(
            start.time as i64,
            (start.time.fract() * 1e9) as u32,
        )
        .unwrap_or_default();
        Self {
            uid: start.uid.clone(),
            scan_id: start.scan_id,
            timestamp: start.time,
            datetime,
            plan_name: start
                .extra
                .get("plan_name")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            stream_names: stream_names.to_vec(),
            duration: stop.map(|stop| stop.time - start.time),
        }
    }
}

/// One named event stream within a run.
///
/// The cutoff seq_num is pinned when the stream is opened; a live run
/// re-opened later may show more rows.
#[derive(Clone)]
pub struct Stream {
    run: Run,
    name: String,
    descriptors: Vec<EventDescriptor>,
    cutoff_seq_num: u64,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn descriptors(&self) -> &[EventDescriptor] {
        &self.descriptors
    }

    pub fn cutoff_seq_num(&self) -> u64 {
        self.cutoff_seq_num
    }

    pub fn must_revalidate(&self) -> bool {
        self.run.must_revalidate()
    }

    pub fn stale_at(&self) -> Instant {
        self.run.stale_at()
    }

    /// Devices with configuration recorded on this stream.
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .descriptors
            .first()
            .map(|d| d.object_keys.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The measurement columns as a typed dataset view.
    pub async fn data(&self, deadline: Deadline) -> CatalogResult<StreamDataset> {
        self.dataset(SubDict::Data, deadline).await
    }

    /// The per-column hardware timestamps as a typed dataset view.
    pub async fn timestamps(&self, deadline: Deadline) -> CatalogResult<StreamDataset> {
        self.dataset(SubDict::Timestamps, deadline).await
    }

    async fn dataset(&self, sub_dict: SubDict, deadline: Deadline) -> CatalogResult<StreamDataset> {
        let context = self.run.context();
        StreamDataset::build(
            context.adapter.clone(),
            self.run.uid().to_string(),
            self.name.clone(),
            sub_dict,
            self.descriptors.clone(),
            self.cutoff_seq_num,
            self.run.filler_handle(),
            context.chunk_policy,
            deadline,
        )
        .await
    }

    /// Configuration snapshot of one device: one row per descriptor.
    pub fn config(&self, object_name: &str) -> CatalogResult<Dataset> {
        build_config_dataset(
            self.run.uid(),
            &self.name,
            &self.descriptors,
            object_name,
            SubDict::Data,
        )
    }

    /// Hardware timestamps of the configuration snapshot.
    pub fn config_timestamps(&self, object_name: &str) -> CatalogResult<Dataset> {
        build_config_dataset(
            self.run.uid(),
            &self.name,
            &self.descriptors,
            object_name,
            SubDict::Timestamps,
        )
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("run", &self.run.uid())
            .field("cutoff_seq_num", &self.cutoff_seq_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ExitStatus;

    #[test]
    fn test_summary_duration() {
        let start = RunStart::new(7).with_time(100.0);
        let stop = RunStop::new(&start.uid, ExitStatus::Success).with_time(160.0);
        let summary = RunSummary::new(&start, Some(&stop), &["primary".to_string()]);
        assert_eq!(summary.duration, Some(60.0));
        assert_eq!(summary.scan_id, 7);

        let live = RunSummary::new(&start, None, &[]);
        assert_eq!(live.duration, None);
    }

    #[test]
    fn test_summary_plan_name_from_metadata() {
        let start = RunStart::new(1).with_metadata("plan_name", serde_json::json!("count"));
        let summary = RunSummary::new(&start, None, &[]);
        assert_eq!(summary.plan_name.as_deref(), Some("count"));
    }
}
