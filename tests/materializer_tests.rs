//! End-to-end materialization scenarios against the in-memory store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::ArrayD;
use serde_json::{json, Map, Value};

use daq_catalog::dataset::{BuiltinType, ElementType, TypedArray};
use daq_catalog::document::{DataKey, Datum, Dtype, Event, EventDescriptor, Resource, RunStart};
use daq_catalog::error::CatalogError;
use daq_catalog::filler::Handler;
use daq_catalog::store::memory::MemoryStore;
use daq_catalog::store::Deadline;
use daq_catalog::Catalog;

use common::seed_scalar_run;

/// Trivial scalar run: three events, one integer column.
#[tokio::test]
async fn test_scalar_run_materializes() {
    let store = Arc::new(MemoryStore::new());
    let uid = seed_scalar_run(
        &store,
        1,
        5.0,
        &[(1, 10.0, 1), (2, 20.0, 2), (3, 30.0, 3)],
        true,
    )
    .await;

    let catalog = Catalog::from_store(store);
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let data = stream.data(Deadline::none()).await.unwrap();

    // The schema promises an int64 column over the time dimension.
    let structure = data.structure("x").unwrap();
    assert_eq!(structure.shape, vec![3]);
    assert_eq!(
        structure.data_type,
        ElementType::Builtin(BuiltinType::INT64)
    );

    let ds = data.read(None, Deadline::none()).await.unwrap();
    assert_eq!(ds.time_len(), 3);
    let time = ds.get("time").unwrap();
    assert_eq!(
        time.data.as_f64s().unwrap().as_slice().unwrap(),
        &[10.0, 20.0, 30.0]
    );
    let x = ds.get("x").unwrap();
    assert_eq!(x.data.as_i64s().unwrap().as_slice().unwrap(), &[1, 2, 3]);
    assert_eq!(x.dims, vec!["time".to_string()]);
    assert_eq!(x.attrs.object.as_deref(), Some("motor"));
}

/// Duplicate seq_num collapses to the latest event by time.
#[tokio::test]
async fn test_duplicate_seq_num_last_write_wins() {
    let store = Arc::new(MemoryStore::new());
    let uid = seed_scalar_run(
        &store,
        2,
        0.5,
        &[(1, 1.0, 10), (1, 2.0, 11), (2, 3.0, 20)],
        true,
    )
    .await;

    let catalog = Catalog::from_store(store);
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    assert_eq!(stream.cutoff_seq_num(), 3);

    let ds = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap();
    assert_eq!(ds.time_len(), 2);
    let x = ds.get("x").unwrap();
    assert_eq!(x.data.as_i64s().unwrap().as_slice().unwrap(), &[11, 20]);
}

struct OnesHandler;

impl Handler for OnesHandler {
    fn read(&self, _datum_kwargs: &Map<String, Value>) -> anyhow::Result<TypedArray> {
        Ok(TypedArray::Float64(ArrayD::from_elem(
            ndarray::IxDyn(&[5, 5]),
            1.0,
        )))
    }
}

/// External payload resolved through a registered handler, with exactly
/// one handler construction.
#[tokio::test]
async fn test_external_payload_filled() {
    let store = Arc::new(MemoryStore::new());

    let start = RunStart::new(3).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.5)
        .with_data_key(
            "x",
            DataKey::array(vec![5, 5], "cam").external("FILESTORE:"),
        );
    store.insert_descriptor(&descriptor).await;
    let event = Event::new(&descriptor.uid, 1)
        .with_time(1.0)
        .with_external_ref("x", "R1/D1");
    store.insert_event(&event).await;

    let mut resource = Resource::new("npy", "/tmp/data", "image.npy");
    resource.uid = Some("R1".to_string());
    store.insert_resource(&resource).await;
    store.insert_datum(&Datum::new("R1", "R1/D1")).await;

    let catalog = Catalog::from_store(store);
    let constructions = Arc::new(AtomicUsize::new(0));
    let counter = constructions.clone();
    catalog
        .register_handler("npy", move |_path, _root, _kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OnesHandler) as Box<dyn Handler>)
        })
        .unwrap();

    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let ds = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap();

    let x = ds.get("x").unwrap();
    assert_eq!(x.data.shape(), vec![1, 5, 5]);
    let values = x.data.as_f64s().unwrap();
    assert!(values.iter().all(|&v| v == 1.0));
    assert_eq!(constructions.load(Ordering::SeqCst), 1);
}

/// A datum id with no datum document behind it surfaces as not-found,
/// even when the "/"-prefix hint names a real resource.
#[tokio::test]
async fn test_dangling_external_reference() {
    let store = Arc::new(MemoryStore::new());
    let start = RunStart::new(8).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.5)
        .with_data_key(
            "x",
            DataKey::array(vec![5, 5], "cam").external("FILESTORE:"),
        );
    store.insert_descriptor(&descriptor).await;
    store
        .insert_event(
            &Event::new(&descriptor.uid, 1)
                .with_time(1.0)
                .with_external_ref("x", "R1/D9"),
        )
        .await;
    let mut resource = Resource::new("npy", "/tmp/data", "image.npy");
    resource.uid = Some("R1".to_string());
    store.insert_resource(&resource).await;
    // No datum document for R1/D9.

    let catalog = Catalog::from_store(store);
    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let err = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::DatumNotFound { .. }));
}

struct BinFileHandler {
    values: Vec<f64>,
}

impl Handler for BinFileHandler {
    fn read(&self, _datum_kwargs: &Map<String, Value>) -> anyhow::Result<TypedArray> {
        Ok(TypedArray::Float64(ArrayD::from_shape_vec(
            ndarray::IxDyn(&[self.values.len()]),
            self.values.clone(),
        )?))
    }
}

/// A handler backed by a real file, reached through root remapping: the
/// resource names a root that no longer exists and the configured map
/// points it at the live mount.
#[tokio::test]
async fn test_root_map_redirects_handler() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = Vec::new();
    for value in [1.5f64, 2.5, 3.5] {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(dir.path().join("frames.bin"), &bytes).unwrap();

    let store = Arc::new(MemoryStore::new());
    let start = RunStart::new(9).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.5)
        .with_data_key("trace", DataKey::array(vec![3], "scope").external("FILESTORE:"));
    store.insert_descriptor(&descriptor).await;
    store
        .insert_event(
            &Event::new(&descriptor.uid, 1)
                .with_time(1.0)
                .with_external_ref("trace", "R2/D1"),
        )
        .await;
    let mut resource = Resource::new("bin", "/detached/storage", "frames.bin");
    resource.uid = Some("R2".to_string());
    store.insert_resource(&resource).await;
    store.insert_datum(&Datum::new("R2", "R2/D1")).await;

    let mut root_map = std::collections::HashMap::new();
    root_map.insert(
        "/detached/storage".to_string(),
        dir.path().to_string_lossy().to_string(),
    );
    let catalog = Catalog::builder().store(store).root_map(root_map).build();
    catalog
        .register_handler("bin", |path, root, _kwargs| {
            let bytes = std::fs::read(std::path::Path::new(root).join(path))?;
            let values = bytes
                .chunks_exact(8)
                .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap()))
                .collect();
            Ok(Box::new(BinFileHandler { values }) as Box<dyn Handler>)
        })
        .unwrap();

    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let ds = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap();
    assert_eq!(
        ds.get("trace").unwrap().data.as_f64s().unwrap().as_slice().unwrap(),
        &[1.5, 2.5, 3.5]
    );
}

async fn seed_array_run(store: &MemoryStore, declared: Vec<usize>, actual: &[usize]) -> String {
    let start = RunStart::new(4).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.5)
        .with_data_key("image", DataKey::array(declared, "cam"));
    store.insert_descriptor(&descriptor).await;

    // One event whose nested-array payload has the "actual" shape.
    let mut cell = json!(1.0);
    for &extent in actual.iter().rev() {
        cell = Value::Array(vec![cell; extent]);
    }
    let event = Event::new(&descriptor.uid, 1)
        .with_time(1.0)
        .with_datum("image", cell);
    store.insert_event(&event).await;
    start.uid
}

/// Shape deficits up to 2 pad by edge replication; larger ones fail.
#[tokio::test]
async fn test_shape_padding_and_rejection() {
    let store = Arc::new(MemoryStore::new());
    let uid = seed_array_run(&store, vec![5, 5], &[4, 5]).await;
    let catalog = Catalog::from_store(store);
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let ds = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap();
    assert_eq!(ds.get("image").unwrap().data.shape(), vec![1, 5, 5]);

    let store = Arc::new(MemoryStore::new());
    let uid = seed_array_run(&store, vec![10, 10], &[5, 5]).await;
    let catalog = Catalog::from_store(store);
    let run = catalog.get(&uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let err = stream
        .data(Deadline::none())
        .await
        .unwrap()
        .read(None, Deadline::none())
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::BadShapeMetadata { .. }));
}

/// Block reads cover the declared chunk grid and concatenate back into
/// the whole-column read.
#[tokio::test]
async fn test_read_block_reconstructs_whole_column() {
    let store = Arc::new(MemoryStore::new());
    let start = RunStart::new(5).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.1)
        .with_data_key("y", DataKey::array(vec![6], "det"));
    store.insert_descriptor(&descriptor).await;
    for seq in 1..=5u64 {
        let row: Vec<f64> = (0..6).map(|i| (seq * 10 + i as u64) as f64).collect();
        let event = Event::new(&descriptor.uid, seq)
            .with_time(seq as f64)
            .with_datum("y", json!(row));
        store.insert_event(&event).await;
    }

    // A 96-byte ceiling forces the time axis into blocks of two rows.
    let catalog = Catalog::builder().store(store).chunk_byte_limit(96).build();
    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let data = stream.data(Deadline::none()).await.unwrap();

    let structure = data.structure("y").unwrap().clone();
    assert_eq!(structure.shape, vec![5, 6]);
    assert_eq!(structure.chunks[0], vec![2, 2, 1]);
    assert_eq!(structure.chunks[1], vec![6]);

    let whole = data.read(None, Deadline::none()).await.unwrap();
    let whole_y = whole.get("y").unwrap().data.clone();

    let mut blocks = Vec::new();
    for index in 0..structure.chunks[0].len() {
        blocks.push(
            data.read_block("y", &[index, 0], Deadline::none())
                .await
                .unwrap(),
        );
    }
    let rejoined = TypedArray::concatenate(&blocks, 0).unwrap();
    assert_eq!(rejoined, whole_y);

    // The scalar time coordinate fits one chunk at this ceiling.
    assert_eq!(data.structure("time").unwrap().chunks[0], vec![5]);
    let t0 = data.read_block("time", &[0], Deadline::none()).await.unwrap();
    assert_eq!(
        t0.as_f64s().unwrap().as_slice().unwrap(),
        &[1.0, 2.0, 3.0, 4.0, 5.0]
    );
}

/// Filling an event in place marks its external columns and hands back
/// the payloads; a second fill is a no-op with no further handler calls.
#[tokio::test]
async fn test_fill_event_marks_columns_once() {
    use daq_catalog::filler::{Filler, HandlerRegistry};
    use daq_catalog::store::StoreAdapter;
    use daq_catalog::transforms::Transforms;

    let store = Arc::new(MemoryStore::new());
    let descriptor = EventDescriptor::new("run-x", "primary")
        .with_data_key(
            "img",
            DataKey::array(vec![5, 5], "cam").external("FILESTORE:"),
        )
        .with_data_key("x", DataKey::scalar(Dtype::Integer, "motor"));
    let mut resource = Resource::new("npy", "/tmp/data", "image.npy");
    resource.uid = Some("R1".to_string());
    store.insert_resource(&resource).await;
    store.insert_datum(&Datum::new("R1", "R1/D1")).await;

    let registry = HandlerRegistry::new();
    let constructions = Arc::new(AtomicUsize::new(0));
    let counter = constructions.clone();
    registry
        .register("npy", move |_path, _root, _kwargs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(OnesHandler) as Box<dyn Handler>)
        })
        .unwrap();

    let filler = Filler::new(
        &registry,
        std::collections::HashMap::new(),
        StoreAdapter::single(store),
        Transforms::new(),
        std::slice::from_ref(&descriptor),
    );
    let mut event = Event::new(&descriptor.uid, 1)
        .with_time(1.0)
        .with_datum("x", json!(7))
        .with_external_ref("img", "R1/D1");

    let payloads = filler.fill_event(&mut event, Deadline::none()).await.unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads["img"].shape(), vec![5, 5]);
    assert_eq!(event.filled.get("img"), Some(&true));
    assert_eq!(constructions.load(Ordering::SeqCst), 1);

    // The column is marked filled; nothing left to do.
    let again = filler.fill_event(&mut event, Deadline::none()).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(constructions.load(Ordering::SeqCst), 1);
}

/// Configuration views expose one row per descriptor.
#[tokio::test]
async fn test_config_views() {
    let store = Arc::new(MemoryStore::new());
    let start = RunStart::new(6).with_time(0.0);
    store.insert_run_start(&start).await;

    let mut config = daq_catalog::document::ObjectConfiguration::default();
    config
        .data_keys
        .insert("exposure".to_string(), DataKey::scalar(Dtype::Number, "cam"));
    config.data.insert("exposure".to_string(), json!(0.25));
    config.timestamps.insert("exposure".to_string(), json!(99.0));

    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.5)
        .with_data_key("x", DataKey::scalar(Dtype::Integer, "cam"))
        .with_object_keys("cam", &["x"])
        .with_configuration("cam", config);
    store.insert_descriptor(&descriptor).await;
    store
        .insert_event(&Event::new(&descriptor.uid, 1).with_time(1.0).with_datum("x", json!(1)))
        .await;

    let catalog = Catalog::from_store(store);
    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();

    assert_eq!(stream.object_names(), vec!["cam".to_string()]);
    let config_ds = stream.config("cam").unwrap();
    assert_eq!(
        config_ds
            .get("exposure")
            .unwrap()
            .data
            .as_f64s()
            .unwrap()
            .as_slice()
            .unwrap(),
        &[0.25]
    );
    let ts_ds = stream.config_timestamps("cam").unwrap();
    assert_eq!(
        ts_ds
            .get("exposure")
            .unwrap()
            .data
            .as_f64s()
            .unwrap()
            .as_slice()
            .unwrap(),
        &[99.0]
    );
}

/// String columns without a pinned width measure the data.
#[tokio::test]
async fn test_string_width_measured_from_column() {
    let store = Arc::new(MemoryStore::new());
    let start = RunStart::new(7).with_time(0.0);
    store.insert_run_start(&start).await;
    let descriptor = EventDescriptor::new(&start.uid, "primary")
        .with_time(0.1)
        .with_data_key("label", DataKey::scalar(Dtype::String, "labeler"));
    store.insert_descriptor(&descriptor).await;
    for (seq, label) in [(1u64, "ok"), (2, "longer-label")] {
        store
            .insert_event(
                &Event::new(&descriptor.uid, seq)
                    .with_time(seq as f64)
                    .with_datum("label", json!(label)),
            )
            .await;
    }

    let catalog = Catalog::from_store(store);
    let run = catalog.get(&start.uid, Deadline::none()).await.unwrap();
    let stream = run.stream("primary", Deadline::none()).await.unwrap();
    let data = stream.data(Deadline::none()).await.unwrap();
    assert_eq!(
        data.structure("label").unwrap().data_type,
        ElementType::Builtin(BuiltinType::unicode("longer-label".len()))
    );
    let ds = data.read(None, Deadline::none()).await.unwrap();
    let labels = ds.get("label").unwrap().data.as_strings().unwrap();
    assert_eq!(labels[[1]], "longer-label");
}
