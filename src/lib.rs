//! Read-oriented catalog and materialization engine for experiment runs.
//!
//! This library reads the document model the acquisition side writes: a
//! run is a RunStart document, one or more descriptor-defined event
//! streams, optional external payloads addressed by resource/datum
//! references, and eventually a RunStop document. The catalog exposes the
//! run index as a searchable, sortable collection; each run opens into
//! named streams; each stream materializes on demand as a typed columnar
//! dataset with labeled dimensions, chunked for bounded-memory block
//! access, with external payloads resolved transparently through
//! registered handlers.
//!
//! # Architecture Overview
//!
//! ```text
//! Catalog ──search/sort──> Catalog' ──get(uid)──> Run ──stream()──> Stream
//!    │                                             │                  │
//!    │ keyset pager                                │ replay           │ data()/timestamps()
//!    ▼                                             ▼                  ▼
//! DocumentStore <──aggregation pages── StreamDataset ──fill──> Filler/Handlers
//! ```
//!
//! The document store is behind the [`store::DocumentStore`] trait;
//! [`store::memory::MemoryStore`] ships in-tree as the writer stand-in
//! for tests and demos. All caches are safe for concurrent readers; the
//! store is never mutated by this crate.

pub mod access;
pub mod cache;
pub mod catalog;
pub mod chunking;
pub mod config;
pub mod dataset;
pub mod document;
pub mod error;
pub mod filler;
pub mod materializer;
pub mod query;
pub mod replay;
pub mod run;
pub mod store;
pub mod transforms;

pub use access::{AccessList, AccessPolicy, Identity, SimpleAccessPolicy};
pub use catalog::{Catalog, CatalogBuilder};
pub use config::CatalogConfig;
pub use dataset::{DataArray, Dataset, ElementType, TypedArray};
pub use document::{
    Datum, DocumentName, Event, EventDescriptor, ExitStatus, Resource, RunStart, RunStop,
};
pub use error::{CatalogError, CatalogResult};
pub use filler::{Handler, HandlerRegistry};
pub use query::SearchQuery;
pub use run::{Run, RunSummary, Stream};
pub use store::{Deadline, DocumentStore, Filter, SortDirection};
