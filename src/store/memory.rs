//! In-memory document store.
//!
//! A faithful in-process stand-in for the external document database, in
//! the same spirit as the mock instruments the acquisition side tests
//! against. Documents live in per-collection vectors with a monotonic
//! primary key, and the full [`Filter`] language, composite sorts,
//! projections, and substring text search are supported. All integration
//! tests (and demos) seed one of these through the `insert_*` surface,
//! which plays the role of the external writer.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::RwLock;

use crate::document::{Datum, Event, EventDescriptor, Resource, RunStart, RunStop};
use crate::error::CatalogResult;
use crate::store::{
    compare_values, lookup_path, project, Collection, Deadline, DocumentStore, Filter,
    FindOptions, RawDocument, SortDirection,
};

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, Vec<RawDocument>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a raw document, returning its primary key.
    pub async fn insert(&self, collection: Collection, body: Value) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut collections = self.collections.write().await;
        collections
            .entry(collection)
            .or_default()
            .push(RawDocument { id, body });
        id
    }

    pub async fn insert_run_start(&self, doc: &RunStart) -> u64 {
        self.insert(Collection::RunStart, to_value(doc)).await
    }

    pub async fn insert_run_stop(&self, doc: &RunStop) -> u64 {
        self.insert(Collection::RunStop, to_value(doc)).await
    }

    pub async fn insert_descriptor(&self, doc: &EventDescriptor) -> u64 {
        self.insert(Collection::EventDescriptor, to_value(doc)).await
    }

    pub async fn insert_event(&self, doc: &Event) -> u64 {
        self.insert(Collection::Event, to_value(doc)).await
    }

    pub async fn insert_resource(&self, doc: &Resource) -> u64 {
        self.insert(Collection::Resource, to_value(doc)).await
    }

    pub async fn insert_datum(&self, doc: &Datum) -> u64 {
        self.insert(Collection::Datum, to_value(doc)).await
    }

    fn matches(filter: &Filter, doc: &RawDocument) -> bool {
        match filter {
            Filter::All => true,
            Filter::And(inner) => inner.iter().all(|f| Self::matches(f, doc)),
            Filter::Or(inner) => inner.iter().any(|f| Self::matches(f, doc)),
            Filter::Eq(path, value) => {
                compare_values(field(doc, path), value) == Ordering::Equal
            }
            Filter::Ne(path, value) => {
                compare_values(field(doc, path), value) != Ordering::Equal
            }
            Filter::In(path, values) => values
                .iter()
                .any(|v| compare_values(field(doc, path), v) == Ordering::Equal),
            Filter::NotIn(path, values) => !values
                .iter()
                .any(|v| compare_values(field(doc, path), v) == Ordering::Equal),
            Filter::Gt(path, value) => compare_values(field(doc, path), value) == Ordering::Greater,
            Filter::Gte(path, value) => compare_values(field(doc, path), value) != Ordering::Less,
            Filter::Lt(path, value) => compare_values(field(doc, path), value) == Ordering::Less,
            Filter::Lte(path, value) => {
                compare_values(field(doc, path), value) != Ordering::Greater
            }
            Filter::Prefix(path, prefix) => field(doc, path)
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Filter::Exists(path, expected) => {
                (lookup_path(&doc.body, path).is_some()) == *expected
            }
            Filter::Text {
                text,
                case_sensitive,
            } => {
                let haystack = doc.body.to_string();
                if *case_sensitive {
                    haystack.contains(text.as_str())
                } else {
                    haystack.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Filter::IdEq(id) => doc.id == *id,
            Filter::IdGt(id) => doc.id > *id,
        }
    }

    fn sort_documents(docs: &mut [RawDocument], sort: &[(String, SortDirection)]) {
        docs.sort_by(|a, b| {
            for (name, direction) in sort {
                let ord = if name == "_id" {
                    a.id.cmp(&b.id)
                } else {
                    compare_values(field(a, name), field(b, name))
                };
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            // Primary key as the final tiebreaker keeps every sort total.
            a.id.cmp(&b.id)
        });
    }
}

static NULL: Value = Value::Null;

/// Missing fields compare as null, consistently with the sort order.
fn field<'d>(doc: &'d RawDocument, path: &str) -> &'d Value {
    lookup_path(&doc.body, path).unwrap_or(&NULL)
}

fn to_value<T: serde::Serialize>(doc: &T) -> Value {
    serde_json::to_value(doc).unwrap_or(Value::Null)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> CatalogResult<Vec<RawDocument>> {
        options.deadline.check()?;
        let collections = self.collections.read().await;
        let mut matched: Vec<RawDocument> = collections
            .get(&collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| Self::matches(filter, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Self::sort_documents(&mut matched, &options.sort);
        let skipped = matched.into_iter().skip(options.skip);
        let mut limited: Vec<RawDocument> = match options.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        };
        if let Some(fields) = &options.projection {
            for doc in &mut limited {
                doc.body = project(&doc.body, fields);
            }
        }
        Ok(limited)
    }

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<u64> {
        deadline.check()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection)
            .map(|docs| docs.iter().filter(|doc| Self::matches(filter, doc)).count())
            .unwrap_or(0) as u64)
    }

    async fn distinct(
        &self,
        collection: Collection,
        field_path: &str,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Value>> {
        deadline.check()?;
        let collections = self.collections.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut values = Vec::new();
        if let Some(docs) = collections.get(&collection) {
            for doc in docs {
                if !Self::matches(filter, doc) {
                    continue;
                }
                if let Some(value) = lookup_path(&doc.body, field_path) {
                    if seen.insert(value.to_string()) {
                        values.push(value.clone());
                    }
                }
            }
        }
        Ok(values)
    }

    fn supports_text_search(&self) -> bool {
        true
    }
}

/// A wrapper that hides native text search, for exercising the catalog's
/// in-memory scan fallback.
pub struct NoTextSearch<S>(pub S);

#[async_trait]
impl<S: DocumentStore> DocumentStore for NoTextSearch<S> {
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> CatalogResult<Vec<RawDocument>> {
        self.0.find(collection, filter, options).await
    }

    async fn count(
        &self,
        collection: Collection,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<u64> {
        self.0.count(collection, filter, deadline).await
    }

    async fn distinct(
        &self,
        collection: Collection,
        field: &str,
        filter: &Filter,
        deadline: Deadline,
    ) -> CatalogResult<Vec<Value>> {
        self.0.distinct(collection, field, filter, deadline).await
    }

    fn supports_text_search(&self) -> bool {
        false
    }
}
