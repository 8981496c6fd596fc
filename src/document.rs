//! Document model for structured experiment data.
//!
//! Implements the document model for decoupling data acquisition from
//! storage and retrieval. A run is a heterogeneous collection of immutable
//! metadata documents plus an append-only stream of event documents:
//!
//! - **RunStart**: experiment intent and metadata; opens a run
//! - **EventDescriptor**: schema for one named data stream
//! - **Event**: actual measurements at each point
//! - **Resource / Datum**: opaque references to external binary payloads
//! - **RunStop**: completion status; a run without one is *live*
//!
//! # Document Flow
//!
//! ```text
//! RunStart (1)
//!    │
//!    ├── EventDescriptor (1+, one per data stream)
//!    │       │
//!    │       └── Event (N, measurements; external fields hold datum_ids)
//!    │
//!    ├── Resource (0+) ── Datum (N, addressable records within a resource)
//!    │
//! RunStop (0..1)
//! ```
//!
//! All documents are immutable once written. The catalog never mutates
//! them; repairs are applied lazily on read via [`crate::transforms`].
//! User-provided metadata rides along in a flattened free-form bag on the
//! metadata documents, so unknown fields round-trip losslessly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::chunking::ChunkSuggestion;

/// Generate a new unique document ID.
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current time in seconds since the Unix epoch, as stored in documents.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Fail,
    Abort,
}

/// Start document - emitted at the beginning of a run.
///
/// The start uid *is* the run uid. Arbitrary user metadata (plan name,
/// operator, sample info, ...) is kept in the flattened `extra` bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    /// Unique run identifier.
    pub uid: String,
    /// Timestamp when the run opened, seconds since epoch.
    pub time: f64,
    /// Human-facing scan number. Not unique.
    #[serde(default)]
    pub scan_id: i64,
    /// Free-form user metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStart {
    pub fn new(scan_id: i64) -> Self {
        Self {
            uid: new_uid(),
            time: epoch_now(),
            scan_id,
            extra: Map::new(),
        }
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// Stop document - emitted at the end of a run. Absent while the run is
/// still live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Unique stop document ID.
    pub uid: String,
    /// Links to the RunStart.
    pub run_start: String,
    /// Timestamp when the run ended, seconds since epoch.
    pub time: f64,
    /// How the run ended.
    pub exit_status: ExitStatus,
    /// Reason for abort/failure.
    #[serde(default)]
    pub reason: String,
    /// Total events emitted, when the writer recorded it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_events: Option<u64>,
    /// Free-form user metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStop {
    pub fn new(run_start: &str, exit_status: ExitStatus) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            time: epoch_now(),
            exit_status,
            reason: String::new(),
            num_events: None,
            extra: Map::new(),
        }
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = reason.to_string();
        self
    }
}

/// JSON-schema level data type of a column.
///
/// This is the coarse type every descriptor carries. A more precise
/// element type may be given via `dtype_str` (numpy-style type string) or
/// `dtype_descr` (structured records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Boolean,
    Number,
    Integer,
    String,
    Array,
}

/// Schema for a single column within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Coarse data type.
    pub dtype: Dtype,
    /// Optional precise element type, e.g. `"<u2"` or `"<f8"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype_str: Option<String>,
    /// Optional structured record layout: `(field_name, field_dtype)` pairs.
    /// Only flat (rank-1) records are supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype_descr: Option<Vec<(String, Value)>>,
    /// Per-event shape. Empty for scalars.
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Optional dimension labels matching `shape`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<Vec<String>>,
    /// When present and non-empty, event values for this column are
    /// datum_ids referencing external payloads, not literal values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Physical units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Preferred chunking, per axis of the materialized `(time, *shape)`
    /// array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkSuggestion>>,
    /// Producing device/channel identifier.
    #[serde(default)]
    pub source: String,
}

impl DataKey {
    /// A scalar column of the given coarse type.
    pub fn scalar(dtype: Dtype, source: &str) -> Self {
        Self {
            dtype,
            dtype_str: None,
            dtype_descr: None,
            shape: vec![],
            dims: None,
            external: None,
            units: None,
            chunks: None,
            source: source.to_string(),
        }
    }

    /// An array column with a fixed per-event shape.
    pub fn array(shape: Vec<usize>, source: &str) -> Self {
        Self {
            dtype: Dtype::Array,
            shape,
            ..Self::scalar(Dtype::Array, source)
        }
    }

    pub fn with_dtype_str(mut self, dtype_str: &str) -> Self {
        self.dtype_str = Some(dtype_str.to_string());
        self
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_dims(mut self, dims: &[&str]) -> Self {
        self.dims = Some(dims.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Mark the column as externally stored under the given storage scheme.
    pub fn external(mut self, scheme: &str) -> Self {
        self.external = Some(scheme.to_string());
        self
    }

    /// True when event values for this column are datum_ids.
    pub fn is_external(&self) -> bool {
        self.external.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Configuration snapshot for one producing device, recorded on the
/// descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfiguration {
    /// Configuration values, column name -> value.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Hardware timestamps for the configuration values.
    #[serde(default)]
    pub timestamps: Map<String, Value>,
    /// Schema for the configuration columns.
    #[serde(default)]
    pub data_keys: HashMap<String, DataKey>,
}

/// Descriptor document - defines the schema for one event stream.
///
/// Each descriptor defines a named stream ("primary", "baseline", ...)
/// with typed columns. A run can carry several descriptors per stream
/// name; all descriptors sharing a name agree on `data_keys` structure,
/// so any one can serve as the representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Unique descriptor ID.
    pub uid: String,
    /// Links to the RunStart.
    pub run_start: String,
    /// Stream name.
    pub name: String,
    /// Timestamp, seconds since epoch.
    pub time: f64,
    /// Schema for data columns.
    pub data_keys: HashMap<String, DataKey>,
    /// Producing device -> the set of column names it owns.
    #[serde(default)]
    pub object_keys: HashMap<String, Vec<String>>,
    /// Per-device configuration snapshots.
    #[serde(default)]
    pub configuration: HashMap<String, ObjectConfiguration>,
    /// Free-form user metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventDescriptor {
    pub fn new(run_start: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            name: name.to_string(),
            time: epoch_now(),
            data_keys: HashMap::new(),
            object_keys: HashMap::new(),
            configuration: HashMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }

    pub fn with_object_keys(mut self, object: &str, keys: &[&str]) -> Self {
        self.object_keys
            .insert(object.to_string(), keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn with_configuration(mut self, object: &str, config: ObjectConfiguration) -> Self {
        self.configuration.insert(object.to_string(), config);
        self
    }

    /// The device that owns a given column, if any.
    pub fn object_for_key(&self, key: &str) -> Option<&str> {
        self.object_keys
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| k == key))
            .map(|(object, _)| object.as_str())
    }

    /// Column names that hold external references.
    pub fn external_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data_keys
            .iter()
            .filter(|(_, dk)| dk.is_external())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Event document - one row within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub uid: String,
    /// Links to the EventDescriptor that defines the schema.
    pub descriptor: String,
    /// 1-based row index within the stream. Intended dense and monotone;
    /// duplicates are collapsed on read by taking the latest by time.
    pub seq_num: u64,
    /// Timestamp, seconds since epoch.
    pub time: f64,
    /// Column name -> value. For external columns the value is a datum_id.
    pub data: HashMap<String, Value>,
    /// Column name -> hardware timestamp.
    #[serde(default)]
    pub timestamps: HashMap<String, f64>,
    /// Column name -> whether external data has been materialized in-place.
    #[serde(default)]
    pub filled: HashMap<String, bool>,
}

impl Event {
    pub fn new(descriptor: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            descriptor: descriptor.to_string(),
            seq_num,
            time: epoch_now(),
            data: HashMap::new(),
            timestamps: HashMap::new(),
            filled: HashMap::new(),
        }
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_datum(mut self, key: &str, value: Value) -> Self {
        self.timestamps.insert(key.to_string(), self.time);
        self.data.insert(key.to_string(), value);
        self
    }

    /// Record an unfilled external reference for `key`.
    pub fn with_external_ref(mut self, key: &str, datum_id: &str) -> Self {
        self.timestamps.insert(key.to_string(), self.time);
        self.data
            .insert(key.to_string(), Value::String(datum_id.to_string()));
        self.filled.insert(key.to_string(), false);
        self
    }
}

/// Resource document - describes an external artifact (typically a file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique resource ID. Legacy records lack this and are addressed by
    /// the store's native primary key, surfaced as its string form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Handler selector.
    pub spec: String,
    /// Path of the artifact, relative to `root`.
    pub resource_path: String,
    /// Mount point / prefix, subject to root remapping.
    #[serde(default)]
    pub root: String,
    /// Handler construction arguments.
    #[serde(default)]
    pub resource_kwargs: Map<String, Value>,
}

impl Resource {
    pub fn new(spec: &str, root: &str, resource_path: &str) -> Self {
        Self {
            uid: Some(new_uid()),
            spec: spec.to_string(),
            resource_path: resource_path.to_string(),
            root: root.to_string(),
            resource_kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.resource_kwargs.insert(key.to_string(), value);
        self
    }
}

/// Datum document - one addressable payload within a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Globally unique payload identifier.
    pub datum_id: String,
    /// Links to the owning Resource.
    pub resource: String,
    /// Handler read arguments (frame index, slice, ...).
    #[serde(default)]
    pub datum_kwargs: Map<String, Value>,
}

impl Datum {
    pub fn new(resource: &str, datum_id: &str) -> Self {
        Self {
            datum_id: datum_id.to_string(),
            resource: resource.to_string(),
            datum_kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.datum_kwargs.insert(key.to_string(), value);
        self
    }
}

/// Optimistic hint: a datum_id may embed its resource uid as a
/// `"/"`-separated prefix. Not a contract; callers must fall back to a
/// datum lookup when the hinted resource does not resolve.
pub fn resource_uid_hint(datum_id: &str) -> Option<&str> {
    datum_id.split_once('/').map(|(prefix, _)| prefix)
}

/// A page of events sharing one descriptor, field-wise transposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub descriptor: String,
    pub uid: Vec<String>,
    pub seq_num: Vec<u64>,
    pub time: Vec<f64>,
    pub data: HashMap<String, Vec<Value>>,
    pub timestamps: HashMap<String, Vec<f64>>,
    pub filled: HashMap<String, Vec<bool>>,
}

/// Transpose a run of events (all sharing a descriptor) into a page.
pub fn pack_event_page(events: &[Event]) -> EventPage {
    let descriptor = events
        .first()
        .map(|e| e.descriptor.clone())
        .unwrap_or_default();
    let mut page = EventPage {
        descriptor,
        uid: Vec::with_capacity(events.len()),
        seq_num: Vec::with_capacity(events.len()),
        time: Vec::with_capacity(events.len()),
        data: HashMap::new(),
        timestamps: HashMap::new(),
        filled: HashMap::new(),
    };
    for event in events {
        page.uid.push(event.uid.clone());
        page.seq_num.push(event.seq_num);
        page.time.push(event.time);
        for (key, value) in &event.data {
            page.data.entry(key.clone()).or_default().push(value.clone());
        }
        for (key, value) in &event.timestamps {
            page.timestamps.entry(key.clone()).or_default().push(*value);
        }
        for (key, value) in &event.filled {
            page.filled.entry(key.clone()).or_default().push(*value);
        }
    }
    page
}

/// A page of datums sharing one resource, field-wise transposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatumPage {
    pub resource: String,
    pub datum_id: Vec<String>,
    pub datum_kwargs: HashMap<String, Vec<Value>>,
}

/// Transpose a run of datums (all sharing a resource) into a page.
pub fn pack_datum_page(datums: &[Datum]) -> DatumPage {
    let resource = datums
        .first()
        .map(|d| d.resource.clone())
        .unwrap_or_default();
    let mut page = DatumPage {
        resource,
        datum_id: Vec::with_capacity(datums.len()),
        datum_kwargs: HashMap::new(),
    };
    for datum in datums {
        page.datum_id.push(datum.datum_id.clone());
        for (key, value) in &datum.datum_kwargs {
            page.datum_kwargs
                .entry(key.clone())
                .or_default()
                .push(value.clone());
        }
    }
    page
}

/// The name half of a `(name, document)` replay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentName {
    Start,
    Descriptor,
    Event,
    EventPage,
    Resource,
    Datum,
    DatumPage,
    Stop,
}

impl DocumentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentName::Start => "start",
            DocumentName::Descriptor => "descriptor",
            DocumentName::Event => "event",
            DocumentName::EventPage => "event_page",
            DocumentName::Resource => "resource",
            DocumentName::Datum => "datum",
            DocumentName::DatumPage => "datum_page",
            DocumentName::Stop => "stop",
        }
    }
}

impl std::fmt::Display for DocumentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged variant over every document kind, for replay output and
/// core-internal plumbing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(RunStart),
    Stop(RunStop),
    Descriptor(EventDescriptor),
    Event(Event),
    EventPage(EventPage),
    Resource(Resource),
    Datum(Datum),
    DatumPage(DatumPage),
}

impl Document {
    pub fn name(&self) -> DocumentName {
        match self {
            Document::Start(_) => DocumentName::Start,
            Document::Stop(_) => DocumentName::Stop,
            Document::Descriptor(_) => DocumentName::Descriptor,
            Document::Event(_) => DocumentName::Event,
            Document::EventPage(_) => DocumentName::EventPage,
            Document::Resource(_) => DocumentName::Resource,
            Document::Datum(_) => DocumentName::Datum,
            Document::DatumPage(_) => DocumentName::DatumPage,
        }
    }
}
