//! Column materialization: from event documents to typed datasets.
//!
//! A stream's events are rows; the materializer turns them into columnar
//! n-dimensional arrays according to the schema declared by the stream's
//! representative descriptor. The declared schema wins: values are parsed
//! into the declared element type (mismatches are logged and cast, never
//! fatal) and shapes are nudged onto the declared shape within a small
//! tolerance (see [`validate_shape`]).
//!
//! # Access paths
//!
//! - [`StreamDataset::read`] materializes whole columns. Scalar columns
//!   are fetched together in byte-bounded pages; each non-scalar column is
//!   fetched independently.
//! - [`StreamDataset::read_block`] materializes one chunk, restricting the
//!   store query to the implied `seq_num` interval on the time axis and
//!   slicing trailing axes after stacking.
//!
//! Column extraction and the time coordinate are memoized per
//! materializer, keyed on parameters only (never on deadlines), with a
//! bounded LRU.

use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;

use crate::chunking::{block_bounds, plan_chunks};
use crate::dataset::{
    ArrayAttrs, ArrayStructure, BuiltinType, DataArray, Dataset, ElementType, ScalarKind,
    TypedArray,
};
use crate::document::EventDescriptor;
use crate::error::{CatalogError, CatalogResult};
use crate::filler::LazyFiller;
use crate::store::{Deadline, StoreAdapter, SubDict};

/// Entries kept per memoization cache.
const MEMO_CAPACITY: usize = 1024;

/// Row size estimates for page sizing: strings get generous headroom,
/// everything else is a 64-bit word.
const STRING_ROW_ESTIMATE: usize = 10_000;
const SCALAR_ROW_ESTIMATE: usize = 8;

/// Chunking knobs, resolved from the catalog configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPolicy {
    pub byte_limit: usize,
    pub area_detector_frames_per_chunk: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            byte_limit: 100_000_000,
            area_detector_frames_per_chunk: 10,
        }
    }
}

// =============================================================================
// Schema construction
// =============================================================================

/// Build per-column structures and attributes from a representative
/// descriptor.
///
/// The returned list is ordered with the `time` coordinate first and the
/// data keys in sorted order. `unicode_widths` supplies measured widths
/// for string columns whose descriptors do not pin one.
pub fn build_structures(
    descriptor: &EventDescriptor,
    sub_dict: SubDict,
    cutoff_seq_num: u64,
    unicode_widths: &HashMap<String, usize>,
    policy: ChunkPolicy,
) -> CatalogResult<(Vec<(String, ArrayStructure)>, HashMap<String, ArrayAttrs>)> {
    let length = (cutoff_seq_num.saturating_sub(1)) as usize;

    let time_shape = vec![length];
    let mut structures = vec![(
        "time".to_string(),
        ArrayStructure {
            shape: time_shape.clone(),
            chunks: plan_chunks(
                &time_shape,
                8,
                policy.byte_limit,
                policy.area_detector_frames_per_chunk,
                None,
            )?,
            dims: vec!["time".to_string()],
            data_type: ElementType::Builtin(BuiltinType::FLOAT64),
        },
    )];
    let mut attrs_by_key = HashMap::new();
    attrs_by_key.insert("time".to_string(), ArrayAttrs::default());

    let mut keys: Vec<&String> = descriptor.data_keys.keys().collect();
    keys.sort();

    // When the descriptor does not name dimensions (it's optional), fall
    // back to generated names with a counter shared across columns.
    let mut dim_counter = 0usize;

    for key in keys {
        let data_key = &descriptor.data_keys[key];
        let ndim = data_key.shape.len();
        let dims = match (&data_key.dims, sub_dict) {
            (Some(dims), SubDict::Data) if dims.len() == ndim => {
                let mut all = vec!["time".to_string()];
                all.extend(dims.iter().cloned());
                all
            }
            (_, SubDict::Data) => {
                let mut all = vec!["time".to_string()];
                for _ in 0..ndim {
                    all.push(format!("dim_{dim_counter}"));
                    dim_counter += 1;
                }
                all
            }
            (_, SubDict::Timestamps) => vec!["time".to_string()],
        };

        let mut attrs = ArrayAttrs::default();
        attrs.object = descriptor.object_for_key(key).map(|o| o.to_string());
        attrs.units_string = data_key.units.clone();

        let (shape, data_type) = match sub_dict {
            SubDict::Data => {
                let mut shape = vec![length];
                shape.extend(data_key.shape.iter().copied());
                let mut data_type = ElementType::from_data_key(data_key)?;
                if let ElementType::Struct(_) = &data_type {
                    if ndim > 1 {
                        return Err(CatalogError::UnsupportedDtype(format!(
                            "structured column {key:?} must be at most 1-D, \
                             declared shape is {:?}",
                            data_key.shape
                        )));
                    }
                }
                if let ElementType::Builtin(builtin) = &data_type {
                    if builtin.kind == ScalarKind::Unicode && builtin.itemsize == 0 {
                        let width = unicode_widths.get(key).copied().unwrap_or(0);
                        data_type = ElementType::Builtin(BuiltinType::unicode(width));
                    }
                }
                (shape, data_type)
            }
            SubDict::Timestamps => (vec![length], ElementType::Builtin(BuiltinType::FLOAT64)),
        };

        let suggestion = data_key
            .chunks
            .as_deref()
            .filter(|chunks| chunks.len() == shape.len());
        let chunks = plan_chunks(
            &shape,
            data_type.itemsize().max(1),
            policy.byte_limit,
            policy.area_detector_frames_per_chunk,
            suggestion,
        )?;

        structures.push((
            key.clone(),
            ArrayStructure {
                shape,
                chunks,
                dims,
                data_type,
            },
        ));
        attrs_by_key.insert(key.clone(), attrs);
    }

    Ok((structures, attrs_by_key))
}

/// Check materialized data against the declared shape.
///
/// Equal shapes pass through. A rank mismatch is unfixable. Axes that fall
/// short by at most 2 are padded by trailing-edge replication (with a
/// warning); axes that run over by at most 2 are trimmed; anything larger
/// is `BadShapeMetadata`.
pub fn validate_shape(
    run_uid: &str,
    key: &str,
    array: TypedArray,
    expected: &[usize],
) -> CatalogResult<TypedArray> {
    const MAX_SIZE_DIFF: i64 = 2;
    let actual = array.shape();
    if actual == expected {
        return Ok(array);
    }
    if actual.len() != expected.len() {
        // The ranks differ; padding can't fix this.
        return Err(CatalogError::BadShapeMetadata {
            run_uid: run_uid.to_string(),
            key: key.to_string(),
            actual,
            expected: expected.to_vec(),
        });
    }
    let mut padded = false;
    for (&a, &e) in actual.iter().zip(expected) {
        let margin = e as i64 - a as i64;
        if margin.abs() > MAX_SIZE_DIFF {
            return Err(CatalogError::BadShapeMetadata {
                run_uid: run_uid.to_string(),
                key: key.to_string(),
                actual,
                expected: expected.to_vec(),
            });
        }
        if margin > 0 {
            padded = true;
        }
    }
    if padded {
        log::warn!(
            "The data shape {actual:?} did not match the expected shape {expected:?} \
             for key {key:?}. The data has been edge-padded to match. \
             RunStart UID: {run_uid}"
        );
    }
    Ok(array.conform(expected))
}

// =============================================================================
// The materializer
// =============================================================================

type ColumnMemoKey = (Vec<String>, u64, u64);
type ColumnMemo = Arc<HashMap<String, Vec<TypedArray>>>;

struct MemoCaches {
    columns: LruCache<ColumnMemoKey, ColumnMemo>,
    time: LruCache<(u64, u64), Arc<Vec<f64>>>,
}

/// One stream × sub-dict materializer.
///
/// Cheap to share; all mutable state is the memoization cache. The cutoff
/// is fixed at construction, so two materializers built at different
/// moments of a live run may disagree on length; each one is internally
/// consistent.
pub struct StreamDataset {
    adapter: StoreAdapter,
    run_uid: String,
    stream_name: String,
    sub_dict: SubDict,
    descriptors: Vec<EventDescriptor>,
    descriptor_uids: Vec<String>,
    cutoff_seq_num: u64,
    filler: Arc<LazyFiller>,
    structures: Vec<(String, ArrayStructure)>,
    attrs: HashMap<String, ArrayAttrs>,
    memo: Mutex<MemoCaches>,
}

impl StreamDataset {
    /// Build the schema (measuring string widths if needed) and return a
    /// ready materializer. `descriptors` must already be transformed and
    /// non-empty, all sharing one stream name.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        adapter: StoreAdapter,
        run_uid: String,
        stream_name: String,
        sub_dict: SubDict,
        descriptors: Vec<EventDescriptor>,
        cutoff_seq_num: u64,
        filler: Arc<LazyFiller>,
        policy: ChunkPolicy,
        deadline: Deadline,
    ) -> CatalogResult<StreamDataset> {
        let representative = descriptors.first().ok_or_else(|| {
            CatalogError::StreamNotFound {
                run_uid: run_uid.clone(),
                stream: stream_name.clone(),
            }
        })?;
        let descriptor_uids: Vec<String> =
            descriptors.iter().map(|d| d.uid.clone()).collect();

        // String columns without a pinned width force a full column read:
        // guessing too small would truncate, guessing too large wastes
        // space in the reported structure.
        let mut unicode_widths = HashMap::new();
        if sub_dict == SubDict::Data {
            for (key, data_key) in &representative.data_keys {
                let etype = ElementType::from_data_key(data_key)?;
                let needs_width = matches!(
                    &etype,
                    ElementType::Builtin(b) if b.kind == ScalarKind::Unicode && b.itemsize == 0
                );
                if needs_width && !data_key.is_external() {
                    let cells = adapter
                        .extract_columns(
                            &descriptor_uids,
                            sub_dict,
                            std::slice::from_ref(key),
                            1,
                            cutoff_seq_num,
                            STRING_ROW_ESTIMATE,
                            deadline,
                        )
                        .await?;
                    let width = cells
                        .get(key)
                        .map(|column| {
                            column
                                .iter()
                                .filter_map(Value::as_str)
                                .map(|s| s.chars().count())
                                .max()
                                .unwrap_or(0)
                        })
                        .unwrap_or(0);
                    unicode_widths.insert(key.clone(), width);
                }
            }
        }

        let (structures, attrs) = build_structures(
            representative,
            sub_dict,
            cutoff_seq_num,
            &unicode_widths,
            policy,
        )?;

        Ok(StreamDataset {
            adapter,
            run_uid,
            stream_name,
            sub_dict,
            descriptors,
            descriptor_uids,
            cutoff_seq_num,
            filler,
            structures,
            attrs,
            memo: Mutex::new(MemoCaches {
                columns: LruCache::new(
                    NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                time: LruCache::new(
                    NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
            }),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn cutoff_seq_num(&self) -> u64 {
        self.cutoff_seq_num
    }

    /// Declared structures, `time` first.
    pub fn structures(&self) -> &[(String, ArrayStructure)] {
        &self.structures
    }

    pub fn structure(&self, key: &str) -> Option<&ArrayStructure> {
        self.structures
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, s)| s)
    }

    pub fn descriptors(&self) -> &[EventDescriptor] {
        &self.descriptors
    }

    fn require_structure(&self, key: &str) -> CatalogResult<&ArrayStructure> {
        self.structure(key).ok_or_else(|| CatalogError::FieldNotFound {
            run_uid: self.run_uid.clone(),
            stream: self.stream_name.clone(),
            key: key.to_string(),
        })
    }

    /// Materialize the whole dataset, or just `fields` when given.
    pub async fn read(
        &self,
        fields: Option<&[String]>,
        deadline: Deadline,
    ) -> CatalogResult<Dataset> {
        let mut keys: Vec<String> = Vec::new();
        match fields {
            Some(fields) => {
                for field in fields {
                    self.require_structure(field)?;
                    if field != "time" {
                        keys.push(field.clone());
                    }
                }
            }
            None => {
                keys.extend(
                    self.structures
                        .iter()
                        .filter(|(name, _)| name != "time")
                        .map(|(name, _)| name.clone()),
                );
            }
        }

        let want_time = fields.map(|f| f.iter().any(|k| k == "time")).unwrap_or(true);
        let mut arrays: Vec<(String, DataArray)> = Vec::new();
        if want_time {
            let time = self.time_coord(None, deadline).await?;
            let structure = self.require_structure("time")?;
            arrays.push((
                "time".to_string(),
                DataArray {
                    data: TypedArray::Float64(ndarray::ArrayD::from_shape_vec(
                        ndarray::IxDyn(&[time.len()]),
                        time.as_ref().clone(),
                    )
                    .map_err(|err| {
                        CatalogError::UnsupportedDtype(format!("time coord: {err}"))
                    })?),
                    dims: structure.dims.clone(),
                    attrs: ArrayAttrs::default(),
                },
            ));
        }

        if !keys.is_empty() {
            let columns = self
                .inner_get_columns(&keys, 1, self.cutoff_seq_num, deadline)
                .await?;
            for key in &keys {
                let structure = self.require_structure(key)?;
                let rows = columns.get(key).map(Vec::as_slice).unwrap_or(&[]);
                let stacked = if rows.is_empty() {
                    TypedArray::zeros(&structure.data_type, &structure.shape)
                } else {
                    TypedArray::stack(rows)?
                };
                arrays.push((
                    key.clone(),
                    DataArray {
                        data: stacked,
                        dims: structure.dims.clone(),
                        attrs: self.attrs.get(key).cloned().unwrap_or_default(),
                    },
                ));
            }
        }

        Ok(Dataset::new(&self.stream_name, arrays))
    }

    /// Materialize a single chunk of one column, identified by per-axis
    /// block indices.
    pub async fn read_block(
        &self,
        key: &str,
        block: &[usize],
        deadline: Deadline,
    ) -> CatalogResult<TypedArray> {
        let structure = self.require_structure(key)?.clone();
        if block.len() != structure.chunks.len() {
            return Err(CatalogError::InvalidQuery(format!(
                "block index {block:?} does not match rank {} of {key:?}",
                structure.chunks.len(),
            )));
        }
        let mut bounds = Vec::with_capacity(block.len());
        for (axis, &index) in block.iter().enumerate() {
            let bound = block_bounds(&structure.chunks[axis], index).ok_or_else(|| {
                CatalogError::InvalidQuery(format!(
                    "block index {index} out of range on axis {axis} of {key:?}"
                ))
            })?;
            bounds.push(bound);
        }

        let (start, stop) = bounds[0];
        if key == "time" {
            let time = self
                .time_coord(Some((start, stop)), deadline)
                .await?;
            return Ok(TypedArray::Float64(
                ndarray::ArrayD::from_shape_vec(
                    ndarray::IxDyn(&[time.len()]),
                    time.as_ref().clone(),
                )
                .map_err(|err| CatalogError::UnsupportedDtype(format!("time coord: {err}")))?,
            ));
        }

        // Only the leading (time) axis narrows the store query; trailing
        // axes are sliced out of the stacked rows.
        let min_seq = 1 + start as u64;
        let max_seq = 1 + stop as u64;
        let columns = self
            .inner_get_columns(std::slice::from_ref(&key.to_string()), min_seq, max_seq, deadline)
            .await?;
        let rows = columns.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let stacked = if rows.is_empty() {
            let mut shape = structure.shape.clone();
            shape[0] = 0;
            TypedArray::zeros(&structure.data_type, &shape)
        } else {
            TypedArray::stack(rows)?
        };
        if bounds.len() > 1 {
            let mut ranges = vec![(0usize, stacked.len())];
            ranges.extend(bounds[1..].iter().copied());
            Ok(stacked.slice_ranges(&ranges))
        } else {
            Ok(stacked)
        }
    }

    /// The time coordinate over `[start, stop)` positions, or the whole
    /// stream when `slice` is `None`. Memoized.
    pub async fn time_coord(
        &self,
        slice: Option<(usize, usize)>,
        deadline: Deadline,
    ) -> CatalogResult<Arc<Vec<f64>>> {
        let (min_seq, max_seq) = match slice {
            Some((start, stop)) => (1 + start as u64, 1 + stop as u64),
            None => (1, self.cutoff_seq_num),
        };
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(cached) = memo.time.get(&(min_seq, max_seq)) {
                return Ok(cached.clone());
            }
        }
        let column = Arc::new(
            self.adapter
                .extract_time_column(&self.descriptor_uids, min_seq, max_seq, deadline)
                .await?,
        );
        if let Ok(mut memo) = self.memo.lock() {
            memo.time.put((min_seq, max_seq), column.clone());
        }
        Ok(column)
    }

    /// Fetch, fill, validate, and cache per-row arrays for `keys` over the
    /// half-open seq_num interval.
    async fn inner_get_columns(
        &self,
        keys: &[String],
        min_seq: u64,
        max_seq: u64,
        deadline: Deadline,
    ) -> CatalogResult<ColumnMemo> {
        let memo_key = (keys.to_vec(), min_seq, max_seq);
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(cached) = memo.columns.get(&memo_key) {
                return Ok(cached.clone());
            }
        }

        let representative = &self.descriptors[0];
        // Partition into scalars (including external datum-id columns) and
        // non-scalars, sized for paging.
        let mut scalars: Vec<String> = Vec::new();
        let mut scalar_row_bytes = 0usize;
        let mut nonscalars: Vec<(String, usize)> = Vec::new();
        for key in keys {
            let data_key = representative.data_keys.get(key).ok_or_else(|| {
                CatalogError::FieldNotFound {
                    run_uid: self.run_uid.clone(),
                    stream: self.stream_name.clone(),
                    key: key.clone(),
                }
            })?;
            let scalar = self.sub_dict == SubDict::Timestamps
                || data_key.shape.is_empty()
                || data_key.is_external();
            if scalar {
                scalar_row_bytes += match data_key.dtype {
                    crate::document::Dtype::String => STRING_ROW_ESTIMATE,
                    _ => SCALAR_ROW_ESTIMATE,
                };
                scalars.push(key.clone());
            } else {
                let row_bytes: usize =
                    data_key.shape.iter().product::<usize>().max(1) * 8;
                nonscalars.push((key.clone(), row_bytes));
            }
        }

        let mut raw_cells: HashMap<String, Vec<Value>> = HashMap::new();
        if !scalars.is_empty() {
            raw_cells.extend(
                self.adapter
                    .extract_columns(
                        &self.descriptor_uids,
                        self.sub_dict,
                        &scalars,
                        min_seq,
                        max_seq,
                        scalar_row_bytes.max(SCALAR_ROW_ESTIMATE),
                        deadline,
                    )
                    .await?,
            );
        }
        for (key, row_bytes) in &nonscalars {
            raw_cells.extend(
                self.adapter
                    .extract_columns(
                        &self.descriptor_uids,
                        self.sub_dict,
                        std::slice::from_ref(key),
                        min_seq,
                        max_seq,
                        *row_bytes,
                        deadline,
                    )
                    .await?,
            );
        }

        let mut columns: HashMap<String, Vec<TypedArray>> = HashMap::new();
        for key in keys {
            let data_key = &representative.data_keys[key];
            let structure = self.require_structure(key)?;
            let expected: Vec<usize> = structure.shape[1..].to_vec();
            let cells = raw_cells.remove(key).unwrap_or_default();
            let mut rows = Vec::with_capacity(cells.len());
            let mut any_cast = false;

            if self.sub_dict == SubDict::Data && data_key.is_external() {
                let filler = self.filler.get().await;
                for cell in &cells {
                    let datum_id = cell.as_str().ok_or_else(|| {
                        CatalogError::DatumNotFound {
                            datum_id: cell.to_string(),
                        }
                    })?;
                    let payload = filler.fill_value(datum_id, deadline).await?;
                    rows.push(validate_shape(&self.run_uid, key, payload, &expected)?);
                }
            } else {
                for cell in &cells {
                    let (array, cast) = TypedArray::from_json(cell, &structure.data_type)?;
                    any_cast |= cast;
                    let array = if expected.is_empty() {
                        array
                    } else {
                        validate_shape(&self.run_uid, key, array, &expected)?
                    };
                    rows.push(array);
                }
            }

            if any_cast {
                log::warn!(
                    "{key:?} actually has a different dtype than declared; it has \
                     been converted to the declared type. Fix this by setting \
                     'dtype_str' in the data_key of the EventDescriptor. \
                     RunStart UID: {}",
                    self.run_uid
                );
            }
            columns.insert(key.clone(), rows);
        }

        let columns = Arc::new(columns);
        if let Ok(mut memo) = self.memo.lock() {
            memo.columns.put(memo_key, columns.clone());
        }
        Ok(columns)
    }
}

// =============================================================================
// Configuration datasets
// =============================================================================

/// Build the per-object configuration dataset for a stream: one row per
/// descriptor, columns from `configuration[object].data_keys`. All the
/// data is stored in-line in the descriptors, so no store access happens
/// here.
pub fn build_config_dataset(
    run_uid: &str,
    stream_name: &str,
    descriptors: &[EventDescriptor],
    object_name: &str,
    sub_dict: SubDict,
) -> CatalogResult<Dataset> {
    let representative = descriptors.first().ok_or_else(|| {
        CatalogError::StreamNotFound {
            run_uid: run_uid.to_string(),
            stream: stream_name.to_string(),
        }
    })?;
    let config = representative
        .configuration
        .get(object_name)
        .ok_or_else(|| CatalogError::FieldNotFound {
            run_uid: run_uid.to_string(),
            stream: stream_name.to_string(),
            key: object_name.to_string(),
        })?;

    let mut keys: Vec<&String> = config.data_keys.keys().collect();
    keys.sort();
    let mut arrays = Vec::with_capacity(keys.len());
    let mut dim_counter = 0usize;
    for key in keys {
        let data_key = &config.data_keys[key];
        let element_type = match sub_dict {
            SubDict::Data => ElementType::from_data_key(data_key)?,
            SubDict::Timestamps => ElementType::Builtin(BuiltinType::FLOAT64),
        };
        let mut rows = Vec::with_capacity(descriptors.len());
        let mut any_cast = false;
        for descriptor in descriptors {
            let source = descriptor
                .configuration
                .get(object_name)
                .ok_or_else(|| CatalogError::FieldNotFound {
                    run_uid: run_uid.to_string(),
                    stream: stream_name.to_string(),
                    key: object_name.to_string(),
                })?;
            let bag = match sub_dict {
                SubDict::Data => &source.data,
                SubDict::Timestamps => &source.timestamps,
            };
            let cell = bag.get(key).cloned().unwrap_or(Value::Null);
            let (array, cast) = TypedArray::from_json(&cell, &element_type)?;
            any_cast |= cast;
            rows.push(array);
        }
        if any_cast {
            log::warn!(
                "configuration column {key:?} of object {object_name:?} has a \
                 different dtype than declared; converted. RunStart UID: {run_uid}"
            );
        }
        let data = TypedArray::stack(&rows)?;
        let dims = match sub_dict {
            SubDict::Data => {
                let mut dims = vec!["time".to_string()];
                for _ in 0..data_key.shape.len() {
                    dims.push(format!("dim_{dim_counter}"));
                    dim_counter += 1;
                }
                dims
            }
            SubDict::Timestamps => vec!["time".to_string()],
        };
        let mut attrs = ArrayAttrs::default();
        attrs.units_string = data_key.units.clone();
        arrays.push((
            key.clone(),
            DataArray { data, dims, attrs },
        ));
    }
    Ok(Dataset::new(stream_name, arrays))
}
