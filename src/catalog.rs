//! The top-level catalog of runs.
//!
//! A [`Catalog`] is a searchable, sortable view over the run index. It is
//! a cheap-clone value: `search` and `sort` return derived catalogs that
//! share the heavy state (store handles, handler registry, transforms,
//! run cache) and differ only in their accumulated query conjuncts and
//! sort order. Iteration, length, uid lookup, scan-id lookup, and
//! positional slicing all flow through the keyset pager under the
//! composed predicate, so results are stable under concurrent insertion.
//!
//! Repeated access to a run is short-circuited by the two-tier TTL cache;
//! see [`crate::cache`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::access::{AccessPolicy, Identity};
use crate::cache::RunCache;
use crate::config::CatalogConfig;
use crate::document::RunStart;
use crate::error::{CatalogError, CatalogResult};
use crate::filler::HandlerRegistry;
use crate::materializer::ChunkPolicy;
use crate::query::{QueryTranslator, QueryTranslatorRegistry, SearchQuery};
use crate::run::{Run, RunContext};
use crate::store::{
    Collection, Deadline, DocumentPager, DocumentStore, Filter, FindOptions, SortDirection,
    SortOrder, StoreAdapter,
};
use crate::transforms::Transforms;

/// A client-side predicate over start documents, used when a query cannot
/// be pushed down to the store (e.g. full text without native support).
pub type ScanPredicate = Arc<dyn Fn(&RunStart) -> bool + Send + Sync>;

struct CatalogShared {
    adapter: StoreAdapter,
    registry: HandlerRegistry,
    transforms: Transforms,
    root_map: HashMap<String, String>,
    chunk_policy: ChunkPolicy,
    ttl_complete: Duration,
    ttl_partial: Duration,
    run_cache: RunCache<Run>,
    translators: QueryTranslatorRegistry,
    access_policy: Option<Arc<dyn AccessPolicy>>,
}

/// A searchable catalog of runs.
#[derive(Clone)]
pub struct Catalog {
    shared: Arc<CatalogShared>,
    queries: Vec<Filter>,
    scan_predicates: Vec<ScanPredicate>,
    sorting: SortOrder,
    identity: Option<Identity>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// A catalog over a single store with default settings.
    pub fn from_store(store: Arc<dyn DocumentStore>) -> Catalog {
        CatalogBuilder::default().store(store).build()
    }

    // =========================================================================
    // Derivation
    // =========================================================================

    /// Narrow with one more store-native conjunct.
    pub(crate) fn with_filter(&self, filter: Filter) -> Catalog {
        let mut derived = self.clone();
        derived.queries.push(filter);
        derived
    }

    /// Narrow with a client-side scan predicate.
    pub(crate) fn with_scan_predicate(&self, predicate: ScanPredicate) -> Catalog {
        let mut derived = self.clone();
        derived.scan_predicates.push(predicate);
        derived
    }

    /// A catalog holding only runs that match `query`, in addition to all
    /// previously accumulated queries.
    pub async fn search(&self, query: &SearchQuery) -> CatalogResult<Catalog> {
        self.shared.translators.translate(query, self).await
    }

    /// A catalog with a different sort order.
    pub fn sort(&self, sorting: SortOrder) -> Catalog {
        let mut derived = self.clone();
        derived.sorting = sorting;
        derived
    }

    pub fn sorting(&self) -> &SortOrder {
        &self.sorting
    }

    /// Bind the catalog to a caller identity, letting the configured
    /// access policy rewrite the accumulated queries. The admin sentinel
    /// bypasses rewriting.
    pub fn authenticated_as(&self, identity: Identity) -> CatalogResult<Catalog> {
        let mut derived = self.clone();
        if identity != Identity::Admin {
            if let Some(policy) = &self.shared.access_policy {
                if !policy.check_compatibility(self) {
                    return Err(CatalogError::Config(
                        "access policy is incompatible with this catalog".to_string(),
                    ));
                }
                derived.queries = policy.modify_queries(&self.queries, &identity)?;
            }
        }
        derived.identity = Some(identity);
        Ok(derived)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    // =========================================================================
    // Lookup and iteration
    // =========================================================================

    fn composed_filter(&self) -> Filter {
        Filter::and(self.queries.clone())
    }

    pub(crate) fn store_supports_text_search(&self) -> bool {
        self.shared.adapter.metadata_store().supports_text_search()
    }

    /// Count run-start documents matching the composed conjuncts plus one
    /// extra filter. Used by query translators.
    pub(crate) async fn count_with(&self, filter: &Filter) -> CatalogResult<u64> {
        let composed = Filter::and(vec![self.composed_filter(), filter.clone()]);
        self.shared
            .adapter
            .count_runs(&composed, Deadline::none())
            .await
    }

    /// Number of runs in this catalog.
    pub async fn len(&self, deadline: Deadline) -> CatalogResult<u64> {
        if self.scan_predicates.is_empty() {
            return self
                .shared
                .adapter
                .count_runs(&self.composed_filter(), deadline)
                .await;
        }
        // Scan predicates force an iteration.
        let mut iter = self.iter(deadline);
        let mut count = 0u64;
        while iter.next_start().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub async fn is_empty(&self, deadline: Deadline) -> CatalogResult<bool> {
        Ok(self.len(deadline).await? == 0)
    }

    /// Iterate over matching run-start documents in the catalog's order.
    pub fn iter(&self, deadline: Deadline) -> RunStartIter {
        self.slice(0, None, deadline)
    }

    /// Positional slice: skip `skip` matches, yield at most `limit`.
    pub fn slice(&self, skip: usize, limit: Option<usize>, deadline: Deadline) -> RunStartIter {
        // With client-side predicates, skip/limit must be applied after
        // filtering, so the pager itself runs unbounded.
        let client_side = !self.scan_predicates.is_empty();
        let pager = self.shared.adapter.pager(
            Collection::RunStart,
            self.composed_filter(),
            self.sorting.clone(),
            if client_side { 0 } else { skip },
            if client_side { None } else { limit },
            deadline,
        );
        RunStartIter {
            pager,
            predicates: self.scan_predicates.clone(),
            to_skip: if client_side { skip } else { 0 },
            remaining: if client_side { limit } else { None },
        }
    }

    /// All matching uids, in order.
    pub async fn uids(&self, deadline: Deadline) -> CatalogResult<Vec<String>> {
        let mut iter = self.iter(deadline);
        let mut uids = Vec::new();
        while let Some(start) = iter.next_start().await? {
            uids.push(start.uid);
        }
        Ok(uids)
    }

    /// Look up one run by uid, within this catalog's search results.
    pub async fn get(&self, uid: &str, deadline: Deadline) -> CatalogResult<Run> {
        let unrestricted = self.queries.is_empty() && self.scan_predicates.is_empty();
        if unrestricted {
            if let Some(run) = self.shared.run_cache.get(uid) {
                return Ok(run);
            }
        }
        let filter = Filter::and(vec![
            self.composed_filter(),
            Filter::Eq("uid".to_string(), Value::String(uid.to_string())),
        ]);
        let start = self
            .shared
            .adapter
            .run_start(&filter, deadline)
            .await?
            .ok_or_else(|| CatalogError::RunNotFound {
                uid: uid.to_string(),
            })?;
        if !self.scan_predicates.iter().all(|p| p(&start)) {
            return Err(CatalogError::RunNotFound {
                uid: uid.to_string(),
            });
        }
        self.resolve_run(start, deadline).await
    }

    /// Look up a run by scan id; the newest match wins.
    pub async fn get_by_scan_id(&self, scan_id: i64, deadline: Deadline) -> CatalogResult<Run> {
        let filter = Filter::and(vec![
            self.composed_filter(),
            Filter::Eq("scan_id".to_string(), Value::from(scan_id)),
        ]);
        let options = FindOptions {
            sort: vec![("time".to_string(), SortDirection::Descending)],
            deadline,
            ..FindOptions::default()
        };
        let candidates = self
            .shared
            .adapter
            .metadata_store()
            .find(Collection::RunStart, &filter, &options)
            .await?;
        for candidate in candidates {
            let start: RunStart = serde_json::from_value(candidate.body).map_err(|err| {
                crate::error::StoreError::Backend(format!("undecodable run_start: {err}"))
            })?;
            if self.scan_predicates.iter().all(|p| p(&start)) {
                return self.resolve_run(start, deadline).await;
            }
        }
        Err(CatalogError::RunNotFound {
            uid: format!("scan_id={scan_id}"),
        })
    }

    /// Get a run from the cache, or build it and place it in the tier
    /// matching its completion state.
    async fn resolve_run(&self, start: RunStart, deadline: Deadline) -> CatalogResult<Run> {
        if let Some(run) = self.shared.run_cache.get(&start.uid) {
            return Ok(run);
        }
        let run = Run::build(self.run_context(), start, deadline).await?;
        self.shared
            .run_cache
            .insert(run.uid(), run.clone(), run.is_complete());
        Ok(run)
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            adapter: self.shared.adapter.clone(),
            transforms: self.shared.transforms.clone(),
            registry: self.shared.registry.clone(),
            root_map: self.shared.root_map.clone(),
            chunk_policy: self.shared.chunk_policy,
            ttl_complete: self.shared.ttl_complete,
            ttl_partial: self.shared.ttl_partial,
        }
    }

    // =========================================================================
    // Registries
    // =========================================================================

    /// Register a payload handler for a resource spec.
    pub fn register_handler<F>(&self, spec: &str, factory: F) -> CatalogResult<()>
    where
        F: Fn(
                &str,
                &str,
                &serde_json::Map<String, Value>,
            ) -> anyhow::Result<Box<dyn crate::filler::Handler>>
            + Send
            + Sync
            + 'static,
    {
        self.shared.registry.register(spec, factory)
    }

    pub fn deregister_handler(&self, spec: &str) {
        self.shared.registry.deregister(spec)
    }

    pub fn handler_specs(&self) -> Vec<String> {
        self.shared.registry.specs()
    }

    /// Register a translator for a custom query kind.
    pub fn register_query(&self, kind: &str, translator: Arc<dyn QueryTranslator>) {
        self.shared.translators.register(kind, translator)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("queries", &self.queries.len())
            .field("scan_predicates", &self.scan_predicates.len())
            .field("sorting", &self.sorting)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Lazy iterator over a catalog's matching run-start documents.
pub struct RunStartIter {
    pager: DocumentPager,
    predicates: Vec<ScanPredicate>,
    to_skip: usize,
    remaining: Option<usize>,
}

impl RunStartIter {
    /// The next matching start document, or `None` when drained.
    pub async fn next_start(&mut self) -> CatalogResult<Option<RunStart>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        while let Some(doc) = self.pager.next().await? {
            let start: RunStart = match serde_json::from_value(doc.body) {
                Ok(start) => start,
                Err(err) => {
                    return Err(crate::error::StoreError::Backend(format!(
                        "undecodable run_start: {err}"
                    ))
                    .into())
                }
            };
            if !self.predicates.iter().all(|p| p(&start)) {
                continue;
            }
            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Ok(Some(start));
        }
        Ok(None)
    }
}

/// Assembles a [`Catalog`].
pub struct CatalogBuilder {
    metadata_store: Option<Arc<dyn DocumentStore>>,
    asset_store: Option<Arc<dyn DocumentStore>>,
    registry: HandlerRegistry,
    transforms: Transforms,
    root_map: HashMap<String, String>,
    chunk_policy: ChunkPolicy,
    ttl_complete: Duration,
    ttl_partial: Duration,
    cache_size: usize,
    access_policy: Option<Arc<dyn AccessPolicy>>,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self {
            metadata_store: None,
            asset_store: None,
            registry: HandlerRegistry::new(),
            transforms: Transforms::new(),
            root_map: HashMap::new(),
            chunk_policy: ChunkPolicy::default(),
            ttl_complete: Duration::from_secs(60),
            ttl_partial: Duration::from_secs(2),
            cache_size: 100,
            access_policy: None,
        }
    }
}

impl CatalogBuilder {
    /// The metadata store. Doubles as the asset store unless one is set.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.metadata_store = Some(store);
        self
    }

    /// A separate store for resource/datum documents (legacy two-database
    /// deployments).
    pub fn asset_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.asset_store = Some(store);
        self
    }

    pub fn handler_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn root_map(mut self, root_map: HashMap<String, String>) -> Self {
        self.root_map = root_map;
        self
    }

    pub fn access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.access_policy = Some(policy);
        self
    }

    pub fn cache_ttls(mut self, complete: Duration, partial: Duration) -> Self {
        self.ttl_complete = complete;
        self.ttl_partial = partial;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn chunk_byte_limit(mut self, byte_limit: usize) -> Self {
        self.chunk_policy.byte_limit = byte_limit;
        self
    }

    pub fn area_detector_frames_per_chunk(mut self, frames: usize) -> Self {
        self.chunk_policy.area_detector_frames_per_chunk = frames;
        self
    }

    /// Apply the tunables from a loaded configuration file.
    pub fn apply_config(mut self, config: &CatalogConfig) -> Self {
        self.ttl_complete = Duration::from_secs_f64(config.cache_ttl_complete);
        self.ttl_partial = Duration::from_secs_f64(config.cache_ttl_partial);
        self.cache_size = config.cache_size;
        self.chunk_policy.byte_limit = config.chunk_byte_limit;
        self.chunk_policy.area_detector_frames_per_chunk =
            config.area_detector_frames_per_chunk;
        self.root_map = config.root_map.clone();
        self
    }

    pub fn build(self) -> Catalog {
        let metadata = self
            .metadata_store
            .unwrap_or_else(|| Arc::new(crate::store::memory::MemoryStore::new()));
        let assets = self.asset_store.unwrap_or_else(|| metadata.clone());
        let shared = CatalogShared {
            adapter: StoreAdapter::new(metadata, assets),
            registry: self.registry,
            transforms: self.transforms,
            root_map: self.root_map,
            chunk_policy: self.chunk_policy,
            ttl_complete: self.ttl_complete,
            ttl_partial: self.ttl_partial,
            run_cache: RunCache::new(self.ttl_complete, self.ttl_partial, self.cache_size),
            translators: QueryTranslatorRegistry::with_builtins(),
            access_policy: self.access_policy,
        };
        Catalog {
            shared: Arc::new(shared),
            queries: Vec::new(),
            scan_predicates: Vec::new(),
            sorting: vec![("time".to_string(), SortDirection::Ascending)],
            identity: None,
        }
    }
}
