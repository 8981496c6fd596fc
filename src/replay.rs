//! Document-stream replay.
//!
//! Replays a run as the `(name, document)` sequence an acquisition
//! session would have emitted: the start document, then a time-merged
//! interleave of every stream's descriptors and events, then the stop
//! document. External references are woven in lazily: the first event to
//! reference a datum of a not-yet-seen resource is preceded by that
//! `resource` document and *all* of its `datum` documents (prefetched in
//! one query).
//!
//! [`PagedReplay`] additionally batches consecutive events sharing a
//! descriptor into `event_page` documents and consecutive datums sharing a
//! resource into `datum_page` documents, flushing on a type change, a
//! foreign-key change, a full page, or any non-batchable document.
//!
//! Both replays are pull-based: call `next()` until it returns `None`.
//! The `fill` flag is reserved; only `fill=false` is implemented (the
//! materializer is the filled interface).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::document::{
    pack_datum_page, pack_event_page, Datum, Document, DocumentName, Event, EventDescriptor,
};
use crate::error::{CatalogError, CatalogResult};
use crate::run::Run;
use crate::store::Deadline;

#[derive(Debug)]
enum TimedDoc {
    Descriptor(EventDescriptor),
    Event(Event),
}

impl TimedDoc {
    fn time(&self) -> f64 {
        match self {
            TimedDoc::Descriptor(d) => d.time,
            TimedDoc::Event(e) => e.time,
        }
    }
}

/// One stream's descriptor/event sequence, pulled descriptor by
/// descriptor.
#[derive(Debug)]
struct StreamCursor {
    descriptors: VecDeque<EventDescriptor>,
    cutoff_seq_num: u64,
    pending: VecDeque<TimedDoc>,
}

impl StreamCursor {
    async fn ensure_pending(&mut self, run: &Run, deadline: Deadline) -> CatalogResult<()> {
        while self.pending.is_empty() {
            let Some(descriptor) = self.descriptors.pop_front() else {
                return Ok(());
            };
            let events = run
                .context()
                .adapter
                .events_for_descriptor(&descriptor.uid, self.cutoff_seq_num, deadline)
                .await?;
            self.pending.push_back(TimedDoc::Descriptor(descriptor));
            self.pending.extend(events.into_iter().map(TimedDoc::Event));
        }
        Ok(())
    }

    fn head_time(&self) -> Option<f64> {
        self.pending.front().map(TimedDoc::time)
    }
}

/// Single-document replay of one run.
#[derive(Debug)]
pub struct DocumentReplay {
    run: Run,
    deadline: Deadline,
    cursors: Vec<StreamCursor>,
    queue: VecDeque<(DocumentName, Document)>,
    /// Descriptor uid -> externally-declared columns, learned as
    /// descriptors are emitted.
    external_fields: HashMap<String, Vec<String>>,
    emitted_resources: HashSet<String>,
    emitted_datums: HashSet<String>,
    started: bool,
    finished: bool,
}

impl DocumentReplay {
    pub(crate) async fn new(run: Run, fill: bool, deadline: Deadline) -> CatalogResult<Self> {
        if fill {
            return Err(CatalogError::Unsupported("fill=true replay"));
        }
        let mut cursors = Vec::new();
        for name in run.stream_names().to_vec() {
            let stream = run.stream(&name, deadline).await?;
            cursors.push(StreamCursor {
                descriptors: stream.descriptors().iter().cloned().collect(),
                cutoff_seq_num: stream.cutoff_seq_num(),
                pending: VecDeque::new(),
            });
        }
        Ok(Self {
            run,
            deadline,
            cursors,
            queue: VecDeque::new(),
            external_fields: HashMap::new(),
            emitted_resources: HashSet::new(),
            emitted_datums: HashSet::new(),
            started: false,
            finished: false,
        })
    }

    /// The next `(name, document)` pair, or `None` after the stop
    /// document.
    pub async fn next(&mut self) -> CatalogResult<Option<(DocumentName, Document)>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            if self.finished {
                return Ok(None);
            }
            if !self.started {
                self.started = true;
                self.queue.push_back((
                    DocumentName::Start,
                    Document::Start(self.run.start().clone()),
                ));
                continue;
            }

            // Pick the stream whose head is earliest in time; each stream's
            // own order (descriptor before its events) is preserved.
            let mut best: Option<(usize, f64)> = None;
            for index in 0..self.cursors.len() {
                let run = self.run.clone();
                self.cursors[index].ensure_pending(&run, self.deadline).await?;
                if let Some(time) = self.cursors[index].head_time() {
                    if best.map(|(_, t)| time < t).unwrap_or(true) {
                        best = Some((index, time));
                    }
                }
            }
            match best {
                Some((index, _)) => {
                    if let Some(doc) = self.cursors[index].pending.pop_front() {
                        self.handle(doc).await?;
                    }
                }
                None => {
                    self.finished = true;
                    if let Some(stop) = self.run.stop() {
                        self.queue
                            .push_back((DocumentName::Stop, Document::Stop(stop.clone())));
                    }
                }
            }
        }
    }

    /// Drain the replay into a vector.
    pub async fn collect_all(mut self) -> CatalogResult<Vec<(DocumentName, Document)>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    async fn handle(&mut self, doc: TimedDoc) -> CatalogResult<()> {
        match doc {
            TimedDoc::Descriptor(descriptor) => {
                self.external_fields
                    .insert(descriptor.uid.clone(), descriptor.external_keys());
                self.queue.push_back((
                    DocumentName::Descriptor,
                    Document::Descriptor(descriptor),
                ));
            }
            TimedDoc::Event(event) => {
                let fields = self
                    .external_fields
                    .get(&event.descriptor)
                    .cloned()
                    .unwrap_or_default();
                for field in fields {
                    let Some(datum_id) = event.data.get(&field).and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if self.emitted_datums.contains(datum_id) {
                        continue;
                    }
                    self.emit_datum(datum_id.to_string()).await?;
                }
                self.queue
                    .push_back((DocumentName::Event, Document::Event(event)));
            }
        }
        Ok(())
    }

    /// Emit the owning resource (once) followed by *all* of its datum
    /// documents, ahead of the event that references the first of them.
    async fn emit_datum(&mut self, datum_id: String) -> CatalogResult<()> {
        let adapter = self.run.context().adapter.clone();
        let resource_uid = adapter
            .resource_uid_for_datum(&datum_id, self.deadline)
            .await?;
        if self.emitted_resources.insert(resource_uid.clone()) {
            let resource = adapter.resource(&resource_uid, self.deadline).await?;
            let resource = self.run.context().transforms.apply_resource(resource);
            self.queue
                .push_back((DocumentName::Resource, Document::Resource(resource)));
        }
        // One query fetches the whole resource; anything that has not
        // gone out yet (e.g. datums written since the last visit on a
        // live run) is emitted now.
        for datum in adapter
            .datums_for_resource(&resource_uid, self.deadline)
            .await?
        {
            if self.emitted_datums.insert(datum.datum_id.clone()) {
                self.queue
                    .push_back((DocumentName::Datum, Document::Datum(datum)));
            }
        }
        if !self.emitted_datums.contains(&datum_id) {
            return Err(CatalogError::DatumNotFound { datum_id });
        }
        Ok(())
    }
}

enum Batch {
    Empty,
    Events { descriptor: String, rows: Vec<Event> },
    Datums { resource: String, rows: Vec<Datum> },
}

/// Replay with size-bounded event/datum page batching.
pub struct PagedReplay {
    inner: DocumentReplay,
    size: usize,
    batch: Batch,
    out: VecDeque<(DocumentName, Document)>,
    drained: bool,
}

impl PagedReplay {
    pub(crate) async fn new(
        run: Run,
        fill: bool,
        size: usize,
        deadline: Deadline,
    ) -> CatalogResult<Self> {
        Ok(Self {
            inner: DocumentReplay::new(run, fill, deadline).await?,
            size: size.max(1),
            batch: Batch::Empty,
            out: VecDeque::new(),
            drained: false,
        })
    }

    pub async fn next(&mut self) -> CatalogResult<Option<(DocumentName, Document)>> {
        loop {
            if let Some(item) = self.out.pop_front() {
                return Ok(Some(item));
            }
            if self.drained {
                return Ok(None);
            }
            match self.inner.next().await? {
                Some((name, doc)) => self.feed(name, doc),
                None => {
                    self.drained = true;
                    self.flush();
                }
            }
        }
    }

    pub async fn collect_all(mut self) -> CatalogResult<Vec<(DocumentName, Document)>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    fn feed(&mut self, name: DocumentName, doc: Document) {
        match doc {
            Document::Event(event) => match &mut self.batch {
                Batch::Events { descriptor, rows }
                    if *descriptor == event.descriptor && rows.len() < self.size =>
                {
                    rows.push(event);
                }
                Batch::Empty => {
                    self.batch = Batch::Events {
                        descriptor: event.descriptor.clone(),
                        rows: vec![event],
                    };
                }
                _ => {
                    // Type change, foreign-key change, or full page.
                    self.flush();
                    self.feed(DocumentName::Event, Document::Event(event));
                }
            },
            Document::Datum(datum) => match &mut self.batch {
                Batch::Datums { resource, rows }
                    if *resource == datum.resource && rows.len() < self.size =>
                {
                    rows.push(datum);
                }
                Batch::Empty => {
                    self.batch = Batch::Datums {
                        resource: datum.resource.clone(),
                        rows: vec![datum],
                    };
                }
                _ => {
                    self.flush();
                    self.feed(DocumentName::Datum, Document::Datum(datum));
                }
            },
            other => {
                self.flush();
                self.out.push_back((name, other));
            }
        }
    }

    fn flush(&mut self) {
        match std::mem::replace(&mut self.batch, Batch::Empty) {
            Batch::Empty => {}
            Batch::Events { rows, .. } => {
                self.out.push_back((
                    DocumentName::EventPage,
                    Document::EventPage(pack_event_page(&rows)),
                ));
            }
            Batch::Datums { rows, .. } => {
                self.out.push_back((
                    DocumentName::DatumPage,
                    Document::DatumPage(pack_datum_page(&rows)),
                ));
            }
        }
    }
}
