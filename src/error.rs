//! Custom error types for the catalog.
//!
//! This module defines the primary error type, `CatalogError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from store I/O to schema problems discovered during materialization.
//!
//! ## Error Hierarchy
//!
//! `CatalogError` is an enum that consolidates the error sources:
//!
//! - **Not-found family** (`RunNotFound`, `StreamNotFound`, `FieldNotFound`,
//!   `ResourceNotFound`, `DatumNotFound`, `DescriptorNotFound`): lookups that
//!   came up empty. These are surfaced to the caller and are never logged as
//!   errors; they are a normal part of interactive exploration.
//! - **`BadShapeMetadata`**: the declared shape in an event descriptor and
//!   the actual data disagree by more than the tolerated margin.
//! - **`UnsupportedDtype` / `UnsupportedTransformKey`**: configuration or
//!   schema errors, raised at schema-build or catalog-construction time.
//! - **`UnresolvableExternalReference`**: the filler retried a datum lookup
//!   and the same reference failed twice in a row.
//! - **`DuplicateHandler`**: a handler registration collided with an
//!   existing spec without `overwrite`.
//! - **`Store`**: wraps transient and permanent store failures. The core
//!   never retries these internally; callers may retry the transient
//!   variants (see [`StoreError::is_transient`]).
//! - **`Handler`**: an opaque error from a handler plugin, carried as
//!   `anyhow::Error` so handler authors can attach context freely.
//!
//! By convention every user-visible error message carries the run uid and,
//! where it applies, the stream name and column key.

use thiserror::Error;

/// Convenience alias for results using the catalog error type.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Failures originating in the document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Deadline exceeded during store operation")]
    DeadlineExceeded,
}

impl StoreError {
    /// Whether a retry by the caller is reasonable. The core itself never
    /// retries; this exists so callers can distinguish transient failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::DeadlineExceeded)
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Run not found: {uid}")]
    RunNotFound { uid: String },

    #[error("Stream {stream:?} not found in run {run_uid}")]
    StreamNotFound { run_uid: String, stream: String },

    #[error("Field {key:?} not found in stream {stream:?} of run {run_uid}")]
    FieldNotFound {
        run_uid: String,
        stream: String,
        key: String,
    },

    #[error("Resource not found: {uid}")]
    ResourceNotFound { uid: String },

    #[error("Datum not found: {datum_id}")]
    DatumNotFound { datum_id: String },

    #[error("Event descriptor not found: {uid}")]
    DescriptorNotFound { uid: String },

    #[error(
        "For data key {key:?} shape {actual:?} does not match expected shape {expected:?} \
         (run {run_uid})"
    )]
    BadShapeMetadata {
        run_uid: String,
        key: String,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Transforms for key {0:?} are not supported")]
    UnsupportedTransformKey(String),

    #[error("Could not resolve external reference after retry: {datum_id}")]
    UnresolvableExternalReference { datum_id: String },

    #[error(
        "There is already a handler registered for the spec {spec:?}. \
         Use register_overwrite to replace it."
    )]
    DuplicateHandler { spec: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Access denied for identity {identity:?}")]
    AccessDenied { identity: String },

    #[error("Handler error: {0}")]
    Handler(#[from] anyhow::Error),
}
