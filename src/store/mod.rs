//! Typed access to the document store.
//!
//! The catalog is read-oriented: an external writer owns the documents and
//! this crate only queries them. The [`DocumentStore`] trait abstracts the
//! schemaless database (indexed finds with projection and sort, counts,
//! distinct); [`StoreAdapter`] layers the six typed collections on top,
//! along with the two access patterns that need care:
//!
//! - **Keyset pagination** ([`DocumentPager`]): results are totally
//!   ordered by `user_sort ++ [(primary_key, asc)]`. Only the first batch
//!   may use `skip`; every following batch is anchored on the last
//!   returned document's sort values OR'd with equality of those values
//!   plus strict inequality on the primary key. Concurrent inserts can
//!   therefore never cause a document to be yielded twice.
//! - **Column aggregation** ([`StoreAdapter::extract_columns`]): events
//!   are fetched in pages whose estimated byte size stays below
//!   [`TARGET_PAGE_BYTES`], matched on `descriptor ∈ uids` and a half-open
//!   `seq_num` interval, ordered by `time`, collapsed on duplicate
//!   `seq_num` keeping the latest, and re-sorted by `seq_num` before the
//!   per-column cell vectors are pushed.
//!
//! Every store call accepts a [`Deadline`]; an expired deadline unwinds
//! the operation without surfacing partial results.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::document::{Datum, Event, EventDescriptor, Resource, RunStart, RunStop};
use crate::error::{CatalogResult, StoreError};

/// Internal batch size for paginated finds.
pub const CURSOR_BATCH: usize = 100;

/// Byte ceiling targeted by aggregation pages, safely below the typical
/// 16 MB per-document limit of document stores.
pub const TARGET_PAGE_BYTES: usize = 10_000_000;

// =============================================================================
// Collections, deadlines, sort specs
// =============================================================================

/// The six collections the catalog reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    RunStart,
    RunStop,
    EventDescriptor,
    Event,
    Resource,
    Datum,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::RunStart => "run_start",
            Collection::RunStop => "run_stop",
            Collection::EventDescriptor => "event_descriptor",
            Collection::Event => "event",
            Collection::Resource => "resource",
            Collection::Datum => "datum",
        }
    }
}

/// Caller-supplied deadline carried through every store call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline; the operation may block on I/O indefinitely.
    pub fn none() -> Deadline {
        Deadline { at: None }
    }

    /// Expire `timeout` from now.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline {
            at: Some(Instant::now() + timeout),
        }
    }

    pub fn at(instant: Instant) -> Deadline {
        Deadline { at: Some(instant) }
    }

    /// Fail fast when the deadline has passed.
    pub fn check(&self) -> Result<(), StoreError> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(StoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A composite sort order: `(dotted field path, direction)` pairs.
pub type SortOrder = Vec<(String, SortDirection)>;

/// Query predicate tree, the store-native query language.
///
/// Paths are dotted (`"data.x"`, `"XDI.Element.edge"`). `IdEq`/`IdGt`
/// address the store's primary key, which exists on every document and is
/// unique and monotone with insertion.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Anchored string-prefix match on a string field.
    Prefix(String, String),
    Exists(String, bool),
    /// Full-text search over the document. Only meaningful on stores that
    /// report `supports_text_search`.
    Text { text: String, case_sensitive: bool },
    IdEq(u64),
    IdGt(u64),
}

impl Filter {
    /// Conjunction that flattens trivial cases.
    pub fn and(filters: Vec<Filter>) -> Filter {
        let mut flat: Vec<Filter> = Vec::new();
        for filter in filters {
            match filter {
                Filter::All => {}
                Filter::And(inner) => {
                    flat.extend(inner.into_iter().filter(|f| *f != Filter::All))
                }
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Filter::All,
            1 => flat.into_iter().next().unwrap_or(Filter::All),
            _ => Filter::And(flat),
        }
    }
}

/// One stored document plus its primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: u64,
    pub body: Value,
}

/// Options for a `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: SortOrder,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Dotted paths to include; `None` returns whole documents.
    pub projection: Option<Vec<String>>,
    pub deadline: Deadline,
}

impl FindOptions {
    pub fn with_deadline(deadline: Deadline) -> FindOptions {
        FindOptions {
            deadline,
            ..FindOptions::default()
        }
    }
}

/// The schemaless document database underneath the catalog.
///
/// Implementations must apply `filter`, `sort` (stable, composite), `skip`,
/// `limit`, and `projection`, and must honor the deadline.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> CatalogResult<Vec<RawDocument>>;

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<u64>;

    async fn distinct(
        &self,
        collection: Collection,
        field: &str,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Value>>;

    /// Whether `Filter::Text` is evaluated natively. Catalogs fall back to
    /// an in-memory scan when this is false.
    fn supports_text_search(&self) -> bool {
        false
    }
}

/// Fetch at most one document.
pub async fn find_one(
    store: &dyn DocumentStore,
    collection: Collection,
    filter: &Filter,
    deadline: Deadline,
) -> CatalogResult<Option<RawDocument>> {
    let options = FindOptions {
        limit: Some(1),
        deadline,
        ..FindOptions::default()
    };
    Ok(store.find(collection, filter, &options).await?.into_iter().next())
}

// =============================================================================
// JSON value helpers shared by backends and the pager
// =============================================================================

/// Follow a dotted path into a document.
pub(crate) fn lookup_path<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cursor = doc;
    for token in path.split('.') {
        cursor = cursor.get(token)?;
    }
    Some(cursor)
}

/// Total order over JSON values: null < bool < number < string < array
/// < object. Numbers compare numerically.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn class(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = compare_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => class(a).cmp(&class(b)),
    }
}

/// Keep only the listed dotted paths of a document.
pub(crate) fn project(body: &Value, fields: &[String]) -> Value {
    let mut out = Value::Object(serde_json::Map::new());
    for field in fields {
        if let Some(value) = lookup_path(body, field) {
            let mut cursor = &mut out;
            let tokens: Vec<&str> = field.split('.').collect();
            for (position, token) in tokens.iter().enumerate() {
                if position == tokens.len() - 1 {
                    let map = match cursor {
                        Value::Object(map) => map,
                        _ => return out,
                    };
                    map.insert(token.to_string(), value.clone());
                } else {
                    let map = match cursor {
                        Value::Object(map) => map,
                        _ => return out,
                    };
                    cursor = map
                        .entry(token.to_string())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                }
            }
        }
    }
    out
}

// =============================================================================
// Keyset pagination
// =============================================================================

/// Lazily paginated `find` with stable results under concurrent inserts.
pub struct DocumentPager {
    store: Arc<dyn DocumentStore>,
    collection: Collection,
    filter: Filter,
    sort: SortOrder,
    deadline: Deadline,
    batch_size: usize,
    buffer: std::collections::VecDeque<RawDocument>,
    cursor: Option<(Vec<Value>, u64)>,
    skip: usize,
    remaining: Option<usize>,
    started: bool,
    exhausted: bool,
}

impl DocumentPager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: Collection,
        filter: Filter,
        sort: SortOrder,
        skip: usize,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> Self {
        Self {
            store,
            collection,
            filter,
            sort,
            deadline,
            batch_size: CURSOR_BATCH,
            buffer: std::collections::VecDeque::new(),
            cursor: None,
            skip,
            remaining: limit,
            started: false,
            exhausted: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Cutoff predicate anchoring the next batch after the last-seen
    /// document: strictly-greater on some sort key with all earlier keys
    /// equal, or all keys equal and the primary key strictly greater.
    fn keyset_filter(&self) -> Filter {
        let Some((last_values, last_id)) = &self.cursor else {
            return self.filter.clone();
        };
        let equal_prefix = |length: usize| -> Vec<Filter> {
            self.sort
                .iter()
                .zip(last_values)
                .take(length)
                .map(|((name, _), value)| Filter::Eq(name.clone(), value.clone()))
                .collect()
        };
        let mut branches = Vec::with_capacity(self.sort.len() + 1);
        for (position, ((name, direction), value)) in
            self.sort.iter().zip(last_values).enumerate()
        {
            let strict = match direction {
                SortDirection::Ascending => Filter::Gt(name.clone(), value.clone()),
                SortDirection::Descending => Filter::Lt(name.clone(), value.clone()),
            };
            let mut conjuncts = equal_prefix(position);
            conjuncts.push(strict);
            branches.push(Filter::and(conjuncts));
        }
        let mut tiebreak = equal_prefix(self.sort.len());
        tiebreak.push(Filter::IdGt(*last_id));
        branches.push(Filter::and(tiebreak));
        Filter::and(vec![self.filter.clone(), Filter::Or(branches)])
    }

    async fn fetch_batch(&mut self) -> CatalogResult<()> {
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };
        if limit == 0 {
            self.exhausted = true;
            return Ok(());
        }
        let mut sort = self.sort.clone();
        sort.push(("_id".to_string(), SortDirection::Ascending));
        let filter = if self.started {
            self.keyset_filter()
        } else {
            self.filter.clone()
        };
        let options = FindOptions {
            sort,
            skip: if self.started { 0 } else { self.skip },
            limit: Some(limit),
            projection: None,
            deadline: self.deadline,
        };
        let batch = self.store.find(self.collection, &filter, &options).await?;
        self.started = true;
        if batch.is_empty() {
            self.exhausted = true;
            return Ok(());
        }
        if let Some(last) = batch.last() {
            let values = self
                .sort
                .iter()
                .map(|(name, _)| {
                    lookup_path(&last.body, name).cloned().unwrap_or(Value::Null)
                })
                .collect();
            self.cursor = Some((values, last.id));
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(batch.len());
        }
        if batch.len() < limit {
            // Short batch: the collection (as of this query) is drained.
            self.exhausted = true;
        }
        self.buffer.extend(batch);
        Ok(())
    }

    /// The next document in the total order, or `None` when drained.
    pub async fn next(&mut self) -> CatalogResult<Option<RawDocument>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the pager into a vector.
    pub async fn collect_all(mut self) -> CatalogResult<Vec<RawDocument>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }
}

// =============================================================================
// Typed adapter over the six collections
// =============================================================================

/// Which event sub-dict a column read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubDict {
    Data,
    Timestamps,
}

impl SubDict {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubDict::Data => "data",
            SubDict::Timestamps => "timestamps",
        }
    }
}

/// Typed collection access over a metadata store and an asset store.
///
/// Deployments with a single database pass the same store twice.
#[derive(Clone)]
pub struct StoreAdapter {
    metadata: Arc<dyn DocumentStore>,
    assets: Arc<dyn DocumentStore>,
}

fn decode<T: serde::de::DeserializeOwned>(doc: &RawDocument) -> CatalogResult<T> {
    serde_json::from_value(doc.body.clone())
        .map_err(|err| StoreError::Backend(format!("undecodable document: {err}")).into())
}

impl StoreAdapter {
    pub fn new(metadata: Arc<dyn DocumentStore>, assets: Arc<dyn DocumentStore>) -> Self {
        Self { metadata, assets }
    }

    pub fn single(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            metadata: store.clone(),
            assets: store,
        }
    }

    pub fn metadata_store(&self) -> Arc<dyn DocumentStore> {
        self.metadata.clone()
    }

    pub fn pager(
        &self,
        collection: Collection,
        filter: Filter,
        sort: SortOrder,
        skip: usize,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> DocumentPager {
        DocumentPager::new(
            self.metadata.clone(),
            collection,
            filter,
            sort,
            skip,
            limit,
            deadline,
        )
    }

    pub async fn run_start(
        &self,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<Option<RunStart>> {
        match find_one(self.metadata.as_ref(), Collection::RunStart, filter, deadline).await? {
            Some(doc) => Ok(Some(decode(&doc)?)),
            None => Ok(None),
        }
    }

    /// This may return `None`; that simply means the run is live.
    pub async fn run_stop(
        &self,
        run_uid: &str,
        deadline: Deadline,
    ) -> CatalogResult<Option<RunStop>> {
        let filter = Filter::Eq("run_start".to_string(), Value::String(run_uid.to_string()));
        match find_one(self.metadata.as_ref(), Collection::RunStop, &filter, deadline).await? {
            Some(doc) => Ok(Some(decode(&doc)?)),
            None => Ok(None),
        }
    }

    pub async fn stream_names(
        &self,
        run_uid: &str,
        deadline: Deadline,
    ) -> CatalogResult<Vec<String>> {
        let filter = Filter::Eq("run_start".to_string(), Value::String(run_uid.to_string()));
        let mut names: Vec<String> = self
            .metadata
            .distinct(Collection::EventDescriptor, "name", &filter, deadline)
            .await?
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn descriptors(
        &self,
        run_uid: &str,
        stream_name: &str,
        deadline: Deadline,
    ) -> CatalogResult<Vec<EventDescriptor>> {
        let filter = Filter::and(vec![
            Filter::Eq("run_start".to_string(), Value::String(run_uid.to_string())),
            Filter::Eq("name".to_string(), Value::String(stream_name.to_string())),
        ]);
        let options = FindOptions {
            sort: vec![("time".to_string(), SortDirection::Ascending)],
            deadline,
            ..FindOptions::default()
        };
        let docs = self
            .metadata
            .find(Collection::EventDescriptor, &filter, &options)
            .await?;
        docs.iter().map(decode).collect()
    }

    /// Fetch a resource by uid, with the legacy fallback for records that
    /// predate the `uid` field and are addressed by the store primary key.
    pub async fn resource(
        &self,
        uid: &str,
        deadline: Deadline,
    ) -> CatalogResult<Resource> {
        let filter = Filter::Eq("uid".to_string(), Value::String(uid.to_string()));
        if let Some(doc) =
            find_one(self.assets.as_ref(), Collection::Resource, &filter, deadline).await?
        {
            return decode(&doc);
        }
        if let Ok(primary_key) = uid.parse::<u64>() {
            if let Some(doc) = find_one(
                self.assets.as_ref(),
                Collection::Resource,
                &Filter::IdEq(primary_key),
                deadline,
            )
            .await?
            {
                let mut resource: Resource = decode(&doc)?;
                resource.uid = Some(uid.to_string());
                return Ok(resource);
            }
        }
        Err(crate::error::CatalogError::ResourceNotFound {
            uid: uid.to_string(),
        })
    }

    /// The authoritative resource uid for a datum.
    pub async fn resource_uid_for_datum(
        &self,
        datum_id: &str,
        deadline: Deadline,
    ) -> CatalogResult<String> {
        let filter = Filter::Eq("datum_id".to_string(), Value::String(datum_id.to_string()));
        let doc = find_one(self.assets.as_ref(), Collection::Datum, &filter, deadline)
            .await?
            .ok_or_else(|| crate::error::CatalogError::DatumNotFound {
                datum_id: datum_id.to_string(),
            })?;
        let datum: Datum = decode(&doc)?;
        Ok(datum.resource)
    }

    /// All datums of one resource, in one query.
    pub async fn datums_for_resource(
        &self,
        resource_uid: &str,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Datum>> {
        let filter = Filter::Eq(
            "resource".to_string(),
            Value::String(resource_uid.to_string()),
        );
        let options = FindOptions {
            sort: vec![("datum_id".to_string(), SortDirection::Ascending)],
            deadline,
            ..FindOptions::default()
        };
        let docs = self.assets.find(Collection::Datum, &filter, &options).await?;
        docs.iter().map(decode).collect()
    }

    /// Highest `seq_num` over the given descriptors, or `None` when the
    /// stream has no events yet.
    pub async fn max_seq_num(
        &self,
        descriptor_uids: &[String],
        deadline: Deadline,
    ) -> CatalogResult<Option<u64>> {
        let filter = Filter::In(
            "descriptor".to_string(),
            descriptor_uids
                .iter()
                .map(|u| Value::String(u.clone()))
                .collect(),
        );
        let options = FindOptions {
            sort: vec![("seq_num".to_string(), SortDirection::Descending)],
            limit: Some(1),
            projection: Some(vec!["seq_num".to_string()]),
            deadline,
            ..FindOptions::default()
        };
        let docs = self.metadata.find(Collection::Event, &filter, &options).await?;
        Ok(docs
            .first()
            .and_then(|doc| lookup_path(&doc.body, "seq_num"))
            .and_then(Value::as_u64))
    }

    /// Events of one descriptor up to the cutoff, ordered by time. Used by
    /// the replay path, which wants whole documents.
    pub async fn events_for_descriptor(
        &self,
        descriptor_uid: &str,
        cutoff_seq_num: u64,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Event>> {
        let filter = Filter::and(vec![
            Filter::Eq(
                "descriptor".to_string(),
                Value::String(descriptor_uid.to_string()),
            ),
            Filter::Lte("seq_num".to_string(), Value::from(cutoff_seq_num)),
        ]);
        let options = FindOptions {
            sort: vec![("time".to_string(), SortDirection::Ascending)],
            deadline,
            ..FindOptions::default()
        };
        let docs = self.metadata.find(Collection::Event, &filter, &options).await?;
        docs.iter().map(decode).collect()
    }

    /// Extract per-column cell vectors for `keys` over the half-open
    /// `seq_num` interval `[min_seq, max_seq)`, collapsing duplicate
    /// seq_nums by latest time. Pages are sized by `estimated_row_bytes`
    /// against [`TARGET_PAGE_BYTES`].
    pub async fn extract_columns(
        &self,
        descriptor_uids: &[String],
        sub_dict: SubDict,
        keys: &[String],
        min_seq: u64,
        max_seq: u64,
        estimated_row_bytes: usize,
        deadline: Deadline,
    ) -> CatalogResult<HashMap<String, Vec<Value>>> {
        let mut columns: HashMap<String, Vec<Value>> =
            keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        let mut projection = vec![
            "descriptor".to_string(),
            "seq_num".to_string(),
            "time".to_string(),
        ];
        projection.extend(keys.iter().map(|k| format!("{}.{}", sub_dict.as_str(), k)));
        for (page_min, page_max) in page_boundaries(min_seq, max_seq, estimated_row_bytes) {
            deadline.check()?;
            let rows = self
                .event_page(descriptor_uids, &projection, page_min, page_max, deadline)
                .await?;
            for row in rows {
                for key in keys {
                    let path = format!("{}.{}", sub_dict.as_str(), key);
                    let cell = lookup_path(&row, &path).cloned().unwrap_or(Value::Null);
                    if let Some(column) = columns.get_mut(key) {
                        column.push(cell);
                    }
                }
            }
        }
        Ok(columns)
    }

    /// Extract the event `time` column over `[min_seq, max_seq)`.
    pub async fn extract_time_column(
        &self,
        descriptor_uids: &[String],
        min_seq: u64,
        max_seq: u64,
        deadline: Deadline,
    ) -> CatalogResult<Vec<f64>> {
        let projection = vec![
            "descriptor".to_string(),
            "seq_num".to_string(),
            "time".to_string(),
        ];
        let mut column = Vec::new();
        for (page_min, page_max) in page_boundaries(min_seq, max_seq, 8) {
            deadline.check()?;
            let rows = self
                .event_page(descriptor_uids, &projection, page_min, page_max, deadline)
                .await?;
            for row in rows {
                column.push(
                    lookup_path(&row, "time")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                );
            }
        }
        Ok(column)
    }

    /// One aggregation page: match, project, sort by time, collapse
    /// duplicate seq_num keeping the latest, re-sort by seq_num.
    async fn event_page(
        &self,
        descriptor_uids: &[String],
        projection: &[String],
        min_seq: u64,
        max_seq: u64,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Value>> {
        let filter = Filter::and(vec![
            Filter::In(
                "descriptor".to_string(),
                descriptor_uids
                    .iter()
                    .map(|u| Value::String(u.clone()))
                    .collect(),
            ),
            // Half-open so that page boundaries compose exactly.
            Filter::Gte("seq_num".to_string(), Value::from(min_seq)),
            Filter::Lt("seq_num".to_string(), Value::from(max_seq)),
        ]);
        let options = FindOptions {
            sort: vec![("time".to_string(), SortDirection::Ascending)],
            projection: Some(projection.to_vec()),
            deadline,
            ..FindOptions::default()
        };
        let docs = self.metadata.find(Collection::Event, &filter, &options).await?;

        // Rows arrive time-ordered, so overwriting keeps the latest per
        // seq_num. Re-sort by seq_num, which should be equivalent to the
        // time order except when system time moved backward mid-run.
        let mut by_seq: std::collections::BTreeMap<u64, Value> = std::collections::BTreeMap::new();
        for doc in docs {
            let seq = lookup_path(&doc.body, "seq_num")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            by_seq.insert(seq, doc.body);
        }
        Ok(by_seq.into_values().collect())
    }

    pub async fn count_runs(&self, filter: &Filter, deadline: Deadline) -> CatalogResult<u64> {
        self.metadata.count(Collection::RunStart, filter, deadline).await
    }
}

/// Page boundaries `[min, max)` split so that each page holds roughly
/// `TARGET_PAGE_BYTES / estimated_row_bytes` rows.
fn page_boundaries(min_seq: u64, max_seq: u64, estimated_row_bytes: usize) -> Vec<(u64, u64)> {
    if max_seq <= min_seq {
        return Vec::new();
    }
    let page_rows = (TARGET_PAGE_BYTES / estimated_row_bytes.max(1)).max(1) as u64;
    let mut pages = Vec::new();
    let mut cursor = min_seq;
    while cursor < max_seq {
        let stop = (cursor + page_rows).min(max_seq);
        pages.push((cursor, stop));
        cursor = stop;
    }
    pages
}
