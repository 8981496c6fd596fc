//! External payload resolution.
//!
//! Events in externally-backed columns carry opaque datum ids instead of
//! values. A [`Handler`] knows how to open one resource (typically a file)
//! and materialize payloads from it; the [`Filler`] owns the lookup
//! machinery: a per-resource handler instance cache, a datum prefetch
//! cache, and the re-entrant resolution dance for references that are not
//! yet cached.
//!
//! # Resolution
//!
//! For a datum id that is not in the cache:
//!
//! 1. Try the `"/"`-prefix fast path: a datum id may embed its resource
//!    uid as a prefix. This is an optimistic hint, not a contract.
//! 2. On a miss, ask the datum collection for the authoritative resource.
//! 3. Prefetch *all* datums of that resource in one query - payloads are
//!    overwhelmingly read in resource-sized batches.
//! 4. Re-enter. If the same datum id is still unresolved on the second
//!    pass, fail with `UnresolvableExternalReference` rather than loop.
//!
//! Handler instances are constructed at most once per resource and invoked
//! at most twice per distinct datum id. All filler state sits behind a
//! single async mutex, so a filler shared by a parallel reader pool
//! behaves as a single consumer.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::dataset::TypedArray;
use crate::document::{resource_uid_hint, Datum, Event, EventDescriptor, Resource};
use crate::error::{CatalogError, CatalogResult};
use crate::store::{Deadline, StoreAdapter};
use crate::transforms::Transforms;

/// A constructed reader for one resource.
///
/// Handlers are built per-resource from `(resource_path, root,
/// resource_kwargs)` and invoked with per-datum `datum_kwargs`. They are
/// free to hold open file handles; the filler serializes calls.
pub trait Handler: Send + Sync {
    fn read(&self, datum_kwargs: &Map<String, Value>) -> anyhow::Result<TypedArray>;
}

/// Constructor for a handler, keyed by the resource `spec`.
pub type HandlerFactory =
    dyn Fn(&str, &str, &Map<String, Value>) -> anyhow::Result<Box<dyn Handler>> + Send + Sync;

/// Process-wide registry mapping `spec` -> handler constructor.
///
/// Registration is rare and serialized; readers take a snapshot, so a
/// long-running fill never observes a half-updated registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<HandlerFactory>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler constructor. Fails if the spec is already taken.
    pub fn register<F>(&self, spec: &str, factory: F) -> CatalogResult<()>
    where
        F: Fn(&str, &str, &Map<String, Value>) -> anyhow::Result<Box<dyn Handler>>
            + Send
            + Sync
            + 'static,
    {
        let Ok(mut factories) = self.factories.write() else {
            return Err(CatalogError::Handler(anyhow::anyhow!(
                "handler registry lock poisoned"
            )));
        };
        if factories.contains_key(spec) {
            return Err(CatalogError::DuplicateHandler {
                spec: spec.to_string(),
            });
        }
        factories.insert(spec.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register a handler constructor, replacing any existing one.
    pub fn register_overwrite<F>(&self, spec: &str, factory: F)
    where
        F: Fn(&str, &str, &Map<String, Value>) -> anyhow::Result<Box<dyn Handler>>
            + Send
            + Sync
            + 'static,
    {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(spec.to_string(), Arc::new(factory));
        }
    }

    pub fn deregister(&self, spec: &str) {
        if let Ok(mut factories) = self.factories.write() {
            factories.remove(spec);
        }
    }

    pub fn specs(&self) -> Vec<String> {
        match self.factories.read() {
            Ok(factories) => {
                let mut specs: Vec<String> = factories.keys().cloned().collect();
                specs.sort();
                specs
            }
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, Arc<HandlerFactory>> {
        self.factories
            .read()
            .map(|factories| factories.clone())
            .unwrap_or_default()
    }
}

struct FillerState {
    /// Resource uid -> constructed handler.
    handlers: HashMap<String, Arc<dyn Handler>>,
    /// Datum id -> prefetched datum document. Unbounded within a filler;
    /// dropped with the filler.
    datums: HashMap<String, Datum>,
    /// Resource uid -> resource document (transformed, root-remapped).
    resources: HashMap<String, Resource>,
    handler_constructions: usize,
}

/// Per-run external reference resolver.
pub struct Filler {
    registry: HashMap<String, Arc<HandlerFactory>>,
    root_map: HashMap<String, String>,
    adapter: StoreAdapter,
    transforms: Transforms,
    /// Descriptor uid -> externally-declared column names.
    external_keys: HashMap<String, Vec<String>>,
    state: Mutex<FillerState>,
}

impl Filler {
    pub fn new(
        registry: &HandlerRegistry,
        root_map: HashMap<String, String>,
        adapter: StoreAdapter,
        transforms: Transforms,
        descriptors: &[EventDescriptor],
    ) -> Self {
        let mut external_keys = HashMap::new();
        for descriptor in descriptors {
            external_keys.insert(descriptor.uid.clone(), descriptor.external_keys());
        }
        Self {
            registry: registry.snapshot(),
            root_map,
            adapter,
            transforms,
            external_keys,
            state: Mutex::new(FillerState {
                handlers: HashMap::new(),
                datums: HashMap::new(),
                resources: HashMap::new(),
                handler_constructions: 0,
            }),
        }
    }

    /// Materialize the payload behind one datum id.
    pub async fn fill_value(
        &self,
        datum_id: &str,
        deadline: Deadline,
    ) -> CatalogResult<TypedArray> {
        let mut state = self.state.lock().await;
        let mut retried = false;
        loop {
            if let Some(datum) = state.datums.get(datum_id).cloned() {
                return self.invoke_handler(&mut state, &datum, deadline).await;
            }
            if retried {
                // The previous trip through this loop prefetched and the
                // reference still did not resolve. Bail rather than spin.
                return Err(CatalogError::UnresolvableExternalReference {
                    datum_id: datum_id.to_string(),
                });
            }
            retried = true;
            self.prefetch(&mut state, datum_id, deadline).await?;
        }
    }

    /// Materialize every unfilled external column of an event.
    ///
    /// Returns the payloads keyed by column name and marks those columns
    /// filled; the stored datum ids in `data` are left as-is.
    pub async fn fill_event(
        &self,
        event: &mut Event,
        deadline: Deadline,
    ) -> CatalogResult<HashMap<String, TypedArray>> {
        let keys = self
            .external_keys
            .get(&event.descriptor)
            .cloned()
            .unwrap_or_default();
        let mut payloads = HashMap::new();
        for key in keys {
            if event.filled.get(&key).copied().unwrap_or(false) {
                continue;
            }
            let datum_id = match event.data.get(&key).and_then(Value::as_str) {
                Some(datum_id) => datum_id.to_string(),
                None => continue,
            };
            let payload = self.fill_value(&datum_id, deadline).await?;
            event.filled.insert(key.clone(), true);
            payloads.insert(key, payload);
        }
        Ok(payloads)
    }

    /// Number of handler constructions so far. Construction can be
    /// expensive (file open, decompression), so it is worth watching.
    pub async fn handler_constructions(&self) -> usize {
        self.state.lock().await.handler_constructions
    }

    async fn invoke_handler(
        &self,
        state: &mut FillerState,
        datum: &Datum,
        deadline: Deadline,
    ) -> CatalogResult<TypedArray> {
        let resource_uid = datum.resource.clone();
        if !state.handlers.contains_key(&resource_uid) {
            let resource = match state.resources.get(&resource_uid) {
                Some(resource) => resource.clone(),
                None => {
                    let resource = self.lookup_resource(&resource_uid, deadline).await?;
                    state
                        .resources
                        .insert(resource_uid.clone(), resource.clone());
                    resource
                }
            };
            let factory = self.registry.get(&resource.spec).ok_or_else(|| {
                CatalogError::Handler(anyhow::anyhow!(
                    "no handler registered for spec {:?} (resource {resource_uid})",
                    resource.spec
                ))
            })?;
            let root = self
                .root_map
                .get(&resource.root)
                .cloned()
                .unwrap_or_else(|| resource.root.clone());
            let handler = factory(&resource.resource_path, &root, &resource.resource_kwargs)?;
            state.handler_constructions += 1;
            state.handlers.insert(resource_uid.clone(), Arc::from(handler));
        }
        let handler = state
            .handlers
            .get(&resource_uid)
            .cloned()
            .ok_or_else(|| CatalogError::ResourceNotFound {
                uid: resource_uid.clone(),
            })?;
        Ok(handler.read(&datum.datum_kwargs)?)
    }

    /// Resolve the resource owning `datum_id` and pull all of its datums
    /// into the cache in one query.
    async fn prefetch(
        &self,
        state: &mut FillerState,
        datum_id: &str,
        deadline: Deadline,
    ) -> CatalogResult<()> {
        let mut used_hint = false;
        let resource = match resource_uid_hint(datum_id) {
            Some(hint) => match self.lookup_resource(hint, deadline).await {
                Ok(resource) => {
                    used_hint = true;
                    resource
                }
                // The id just happened to contain a '/'; do it the
                // standard way.
                Err(CatalogError::ResourceNotFound { .. }) => {
                    self.lookup_resource_via_datum(datum_id, deadline).await?
                }
                Err(err) => return Err(err),
            },
            None => self.lookup_resource_via_datum(datum_id, deadline).await?,
        };
        self.prefetch_resource(state, &resource, deadline).await?;

        if used_hint && !state.datums.contains_key(datum_id) {
            // The hinted resource exists but does not own this datum.
            // Fall back to the authoritative mapping before giving up.
            let resource = self.lookup_resource_via_datum(datum_id, deadline).await?;
            self.prefetch_resource(state, &resource, deadline).await?;
        }
        Ok(())
    }

    async fn prefetch_resource(
        &self,
        state: &mut FillerState,
        resource: &Resource,
        deadline: Deadline,
    ) -> CatalogResult<()> {
        let resource_uid = resource.uid.clone().unwrap_or_default();
        state
            .resources
            .insert(resource_uid.clone(), resource.clone());
        for datum in self
            .adapter
            .datums_for_resource(&resource_uid, deadline)
            .await?
        {
            state.datums.insert(datum.datum_id.clone(), datum);
        }
        Ok(())
    }

    async fn lookup_resource(
        &self,
        resource_uid: &str,
        deadline: Deadline,
    ) -> CatalogResult<Resource> {
        let resource = self.adapter.resource(resource_uid, deadline).await?;
        Ok(self.transforms.apply_resource(resource))
    }

    async fn lookup_resource_via_datum(
        &self,
        datum_id: &str,
        deadline: Deadline,
    ) -> CatalogResult<Resource> {
        let resource_uid = self
            .adapter
            .resource_uid_for_datum(datum_id, deadline)
            .await?;
        self.lookup_resource(&resource_uid, deadline).await
    }
}

/// Deferred filler construction shared by a run and its datasets.
///
/// Handler construction can open files, so the filler is only built when
/// something actually needs a payload. The mutex makes initialization
/// single-shot: the first caller constructs, concurrent callers wait and
/// see the result.
pub struct LazyFiller {
    registry: HandlerRegistry,
    root_map: HashMap<String, String>,
    adapter: StoreAdapter,
    transforms: Transforms,
    descriptors: Vec<EventDescriptor>,
    cell: Mutex<Option<Arc<Filler>>>,
}

impl LazyFiller {
    pub fn new(
        registry: HandlerRegistry,
        root_map: HashMap<String, String>,
        adapter: StoreAdapter,
        transforms: Transforms,
        descriptors: Vec<EventDescriptor>,
    ) -> Self {
        Self {
            registry,
            root_map,
            adapter,
            transforms,
            descriptors,
            cell: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Arc<Filler> {
        let mut cell = self.cell.lock().await;
        if let Some(filler) = cell.as_ref() {
            return filler.clone();
        }
        let filler = Arc::new(Filler::new(
            &self.registry,
            self.root_map.clone(),
            self.adapter.clone(),
            self.transforms.clone(),
            &self.descriptors,
        ));
        *cell = Some(filler.clone());
        filler
    }

    /// Whether the filler has been constructed yet.
    pub async fn initialized(&self) -> bool {
        self.cell.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    struct ConstantHandler(f64);

    impl Handler for ConstantHandler {
        fn read(&self, _datum_kwargs: &Map<String, Value>) -> anyhow::Result<TypedArray> {
            Ok(TypedArray::Float64(ArrayD::from_elem(
                ndarray::IxDyn(&[2, 2]),
                self.0,
            )))
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry
            .register("npy", |_, _, _| Ok(Box::new(ConstantHandler(1.0)) as Box<dyn Handler>))
            .unwrap();
        let err = registry
            .register("npy", |_, _, _| Ok(Box::new(ConstantHandler(2.0)) as Box<dyn Handler>))
            .unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateHandler { .. }));

        registry.register_overwrite("npy", |_, _, _| {
            Ok(Box::new(ConstantHandler(3.0)) as Box<dyn Handler>)
        });
        assert_eq!(registry.specs(), vec!["npy".to_string()]);
    }

    #[test]
    fn test_deregister_frees_spec() {
        let registry = HandlerRegistry::new();
        registry
            .register("tiff", |_, _, _| Ok(Box::new(ConstantHandler(1.0)) as Box<dyn Handler>))
            .unwrap();
        registry.deregister("tiff");
        assert!(registry.specs().is_empty());
        registry
            .register("tiff", |_, _, _| Ok(Box::new(ConstantHandler(1.0)) as Box<dyn Handler>))
            .unwrap();
    }
}
