//! Typed columnar arrays and dataset schema.
//!
//! Materialized columns are n-dimensional arrays with labeled dimensions.
//! `TypedArray` stores data in its declared element type to avoid
//! unnecessary conversions and memory bloat; camera frames are commonly
//! 16-bit integers and a 2048×2048 frame costs 8.4 MB as `i64` columns
//! versus 33.6 MB if everything were widened to `f64`.
//!
//! # Element types
//!
//! A descriptor narrows a column's element type by, in order of
//! precedence:
//!
//! 1. `dtype_descr`: a structured record layout. Only flat (rank-1)
//!    records are supported; deeper nesting is rejected.
//! 2. `dtype_str`: a numpy-style type string such as `"<u2"` or `"<f8"`.
//! 3. The coarse `dtype` with fallback mapping boolean→bool,
//!    number→float64, integer→int64, string→unicode, array→float64.
//!
//! Values arrive as JSON, so cells whose JSON-native type disagrees with
//! the declared element type are cast in place; the materializer reports
//! the mismatch as a warning, never an error.

use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use serde_json::Value;

use crate::document::{DataKey, Dtype};
use crate::error::{CatalogError, CatalogResult};

// =============================================================================
// Element types
// =============================================================================

/// The storage class of a builtin element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Unicode,
}

/// A concrete builtin element type with a known itemsize in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinType {
    pub kind: ScalarKind,
    pub itemsize: usize,
}

impl BuiltinType {
    pub const BOOL: BuiltinType = BuiltinType {
        kind: ScalarKind::Bool,
        itemsize: 1,
    };
    pub const INT64: BuiltinType = BuiltinType {
        kind: ScalarKind::Int,
        itemsize: 8,
    };
    pub const FLOAT64: BuiltinType = BuiltinType {
        kind: ScalarKind::Float,
        itemsize: 8,
    };

    /// Unicode string type of `width` characters (4 bytes per character,
    /// matching UCS-4 storage). Width 0 means "unknown, measure the data".
    pub fn unicode(width: usize) -> BuiltinType {
        BuiltinType {
            kind: ScalarKind::Unicode,
            itemsize: 4 * width,
        }
    }

    /// Parse a numpy-style type string, e.g. `"<f8"`, `"|b1"`, `"<U16"`.
    pub fn parse(dtype_str: &str) -> CatalogResult<BuiltinType> {
        let body = dtype_str.trim_start_matches(['<', '>', '|', '=']);
        let (letter, digits) = match body.chars().next() {
            Some(c) => (c, &body[c.len_utf8()..]),
            None => return Err(CatalogError::UnsupportedDtype(dtype_str.to_string())),
        };
        let size: Option<usize> = if digits.is_empty() {
            None
        } else {
            Some(digits.parse().map_err(|_| {
                CatalogError::UnsupportedDtype(dtype_str.to_string())
            })?)
        };
        match letter {
            'b' => Ok(BuiltinType::BOOL),
            'i' | 'u' => Ok(BuiltinType {
                kind: ScalarKind::Int,
                itemsize: size.unwrap_or(8),
            }),
            'f' => Ok(BuiltinType {
                kind: ScalarKind::Float,
                itemsize: size.unwrap_or(8),
            }),
            'U' => Ok(BuiltinType::unicode(size.unwrap_or(0))),
            _ => Err(CatalogError::UnsupportedDtype(dtype_str.to_string())),
        }
    }
}

/// One field of a structured record type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub dtype: BuiltinType,
}

/// Element type of a materialized column.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementType {
    Builtin(BuiltinType),
    Struct(Vec<StructField>),
}

impl ElementType {
    /// Bytes per element, used for chunk planning and page sizing.
    pub fn itemsize(&self) -> usize {
        match self {
            ElementType::Builtin(b) => b.itemsize,
            ElementType::Struct(fields) => fields.iter().map(|f| f.dtype.itemsize).sum(),
        }
    }

    /// Resolve the element type for a column, applying the precedence
    /// rules documented at module level.
    pub fn from_data_key(data_key: &DataKey) -> CatalogResult<ElementType> {
        if let Some(descr) = &data_key.dtype_descr {
            // A single unnamed field is numpy's encoding of "not actually
            // structured"; fall through to the plain rules.
            let trivial = descr.len() == 1 && descr[0].0.is_empty();
            if !trivial {
                let mut fields = Vec::with_capacity(descr.len());
                for (name, field_dtype) in descr {
                    match field_dtype {
                        Value::String(s) => fields.push(StructField {
                            name: name.clone(),
                            dtype: BuiltinType::parse(s)?,
                        }),
                        nested => {
                            return Err(CatalogError::UnsupportedDtype(format!(
                                "nested structured dtype for field {name:?}: {nested}"
                            )))
                        }
                    }
                }
                return Ok(ElementType::Struct(fields));
            }
        }
        if let Some(dtype_str) = &data_key.dtype_str {
            return Ok(ElementType::Builtin(BuiltinType::parse(dtype_str)?));
        }
        // Fallback guesses when all we have is the coarse JSON-schema dtype.
        let builtin = match data_key.dtype {
            Dtype::Boolean => BuiltinType::BOOL,
            Dtype::Number => BuiltinType::FLOAT64,
            Dtype::Integer => BuiltinType::INT64,
            Dtype::String => BuiltinType::unicode(0),
            Dtype::Array => BuiltinType::FLOAT64,
        };
        Ok(ElementType::Builtin(builtin))
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            ElementType::Builtin(b) => Some(b.kind),
            ElementType::Struct(_) => None,
        }
    }
}

// =============================================================================
// Typed arrays
// =============================================================================

macro_rules! collect_variant {
    ($parts:expr, $variant:path) => {{
        let mut arrays = Vec::with_capacity($parts.len());
        let mut ok = true;
        for part in $parts {
            match part {
                $variant(a) => arrays.push(a),
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            Ok(arrays)
        } else {
            Err(CatalogError::UnsupportedDtype(
                "mixed element types in one column".to_string(),
            ))
        }
    }};
}

/// An n-dimensional array in its declared element type.
///
/// The `Struct` variant stores rank-1 record columns field-by-field; every
/// field array shares the record array's shape.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    Bool(ArrayD<bool>),
    Int64(ArrayD<i64>),
    Float64(ArrayD<f64>),
    Unicode(ArrayD<String>),
    Struct(Vec<(String, TypedArray)>),
}

impl TypedArray {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            TypedArray::Bool(a) => a.shape().to_vec(),
            TypedArray::Int64(a) => a.shape().to_vec(),
            TypedArray::Float64(a) => a.shape().to_vec(),
            TypedArray::Unicode(a) => a.shape().to_vec(),
            TypedArray::Struct(fields) => fields
                .first()
                .map(|(_, a)| a.shape())
                .unwrap_or_default(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An all-default array of the given element type and shape, used for
    /// zero-length columns where there is nothing to stack.
    pub fn zeros(element_type: &ElementType, shape: &[usize]) -> TypedArray {
        match element_type {
            ElementType::Builtin(b) => match b.kind {
                ScalarKind::Bool => TypedArray::Bool(ArrayD::from_elem(IxDyn(shape), false)),
                ScalarKind::Int => TypedArray::Int64(ArrayD::from_elem(IxDyn(shape), 0)),
                ScalarKind::Float => TypedArray::Float64(ArrayD::from_elem(IxDyn(shape), 0.0)),
                ScalarKind::Unicode => {
                    TypedArray::Unicode(ArrayD::from_elem(IxDyn(shape), String::new()))
                }
            },
            ElementType::Struct(fields) => TypedArray::Struct(
                fields
                    .iter()
                    .map(|f| {
                        (
                            f.name.clone(),
                            TypedArray::zeros(&ElementType::Builtin(f.dtype), shape),
                        )
                    })
                    .collect(),
            ),
        }
    }

    /// Parse one event cell into an array of the declared element type.
    ///
    /// Returns the array and whether any value had to be cast from a
    /// different JSON-native type.
    pub fn from_json(value: &Value, element_type: &ElementType) -> CatalogResult<(TypedArray, bool)> {
        match element_type {
            ElementType::Builtin(b) => {
                let shape = json_shape(value);
                let mut flat = Vec::new();
                collect_leaves(value, &mut flat, &shape, 0)?;
                let mut casted = false;
                let array = match b.kind {
                    ScalarKind::Bool => {
                        let cells: Vec<bool> = flat
                            .iter()
                            .map(|v| as_bool(v, &mut casted))
                            .collect::<CatalogResult<_>>()?;
                        TypedArray::Bool(shaped(cells, &shape)?)
                    }
                    ScalarKind::Int => {
                        let cells: Vec<i64> = flat
                            .iter()
                            .map(|v| as_i64(v, &mut casted))
                            .collect::<CatalogResult<_>>()?;
                        TypedArray::Int64(shaped(cells, &shape)?)
                    }
                    ScalarKind::Float => {
                        let cells: Vec<f64> = flat
                            .iter()
                            .map(|v| as_f64(v, &mut casted))
                            .collect::<CatalogResult<_>>()?;
                        TypedArray::Float64(shaped(cells, &shape)?)
                    }
                    ScalarKind::Unicode => {
                        let cells: Vec<String> = flat
                            .iter()
                            .map(|v| as_string(v, &mut casted))
                            .collect::<CatalogResult<_>>()?;
                        TypedArray::Unicode(shaped(cells, &shape)?)
                    }
                };
                Ok((array, casted))
            }
            ElementType::Struct(struct_fields) => {
                let records: Vec<&Value> = match value {
                    Value::Array(items) => items.iter().collect(),
                    record => vec![record],
                };
                let rank1 = matches!(value, Value::Array(_));
                let mut casted = false;
                let mut columns: Vec<(String, TypedArray)> =
                    Vec::with_capacity(struct_fields.len());
                for (position, field) in struct_fields.iter().enumerate() {
                    let mut cells = Vec::with_capacity(records.len());
                    for record in &records {
                        let cell = record_field(record, &field.name, position)?;
                        cells.push(cell);
                    }
                    let field_type = ElementType::Builtin(field.dtype);
                    let mut parts = Vec::with_capacity(cells.len());
                    for cell in cells {
                        let (part, cast) = TypedArray::from_json(cell, &field_type)?;
                        casted |= cast;
                        parts.push(part);
                    }
                    let column = if rank1 {
                        TypedArray::stack(&parts)?
                    } else {
                        parts.into_iter().next().unwrap_or_else(|| {
                            TypedArray::zeros(&field_type, &[])
                        })
                    };
                    columns.push((field.name.clone(), column));
                }
                Ok((TypedArray::Struct(columns), casted))
            }
        }
    }

    /// Stack per-event arrays along a new leading axis.
    ///
    /// All parts must share a shape and element type; the materializer
    /// guarantees this by validating shapes first.
    pub fn stack(parts: &[TypedArray]) -> CatalogResult<TypedArray> {
        fn stack_views<T: Clone>(arrays: Vec<&ArrayD<T>>) -> CatalogResult<ArrayD<T>> {
            let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
            ndarray::stack(Axis(0), &views)
                .map_err(|err| CatalogError::UnsupportedDtype(format!("stack failed: {err}")))
        }
        match parts {
            [] => Err(CatalogError::UnsupportedDtype(
                "cannot stack an empty column without an element type".to_string(),
            )),
            [TypedArray::Bool(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Bool)?;
                Ok(TypedArray::Bool(stack_views(arrays)?))
            }
            [TypedArray::Int64(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Int64)?;
                Ok(TypedArray::Int64(stack_views(arrays)?))
            }
            [TypedArray::Float64(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Float64)?;
                Ok(TypedArray::Float64(stack_views(arrays)?))
            }
            [TypedArray::Unicode(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Unicode)?;
                Ok(TypedArray::Unicode(stack_views(arrays)?))
            }
            [TypedArray::Struct(first_fields), ..] => {
                let mut columns = Vec::with_capacity(first_fields.len());
                for (index, (name, _)) in first_fields.iter().enumerate() {
                    let mut field_parts = Vec::with_capacity(parts.len());
                    for part in parts {
                        match part {
                            TypedArray::Struct(fields) => field_parts.push(
                                fields
                                    .get(index)
                                    .map(|(_, a)| a.clone())
                                    .ok_or_else(|| {
                                        CatalogError::UnsupportedDtype(
                                            "record field count mismatch".to_string(),
                                        )
                                    })?,
                            ),
                            _ => {
                                return Err(CatalogError::UnsupportedDtype(
                                    "mixed record and plain cells in one column".to_string(),
                                ))
                            }
                        }
                    }
                    columns.push((name.clone(), TypedArray::stack(&field_parts)?));
                }
                Ok(TypedArray::Struct(columns))
            }
        }
    }

    /// Reshape-by-clamping: produce an array of `target` shape where each
    /// index reads from the source with out-of-range trailing indices
    /// clamped to the edge. This realizes both trailing-edge replication
    /// padding (target larger) and trailing trim (target smaller).
    pub fn conform(&self, target: &[usize]) -> TypedArray {
        fn clamp_read<T: Clone + Default>(a: &ArrayD<T>, target: &[usize]) -> ArrayD<T> {
            if a.is_empty() {
                // Nothing to replicate from; fill with defaults.
                return ArrayD::from_elem(IxDyn(target), T::default());
            }
            ArrayD::from_shape_fn(IxDyn(target), |idx| {
                let src: Vec<usize> = idx
                    .slice()
                    .iter()
                    .zip(a.shape())
                    .map(|(&i, &extent)| i.min(extent.saturating_sub(1)))
                    .collect();
                a[IxDyn(&src)].clone()
            })
        }
        match self {
            TypedArray::Bool(a) => TypedArray::Bool(clamp_read(a, target)),
            TypedArray::Int64(a) => TypedArray::Int64(clamp_read(a, target)),
            TypedArray::Float64(a) => TypedArray::Float64(clamp_read(a, target)),
            TypedArray::Unicode(a) => TypedArray::Unicode(clamp_read(a, target)),
            TypedArray::Struct(fields) => TypedArray::Struct(
                fields
                    .iter()
                    .map(|(name, a)| (name.clone(), a.conform(target)))
                    .collect(),
            ),
        }
    }

    /// Copy out a hyper-rectangle given half-open `(start, stop)` bounds
    /// per axis.
    pub fn slice_ranges(&self, bounds: &[(usize, usize)]) -> TypedArray {
        fn window<T: Clone>(a: &ArrayD<T>, bounds: &[(usize, usize)]) -> ArrayD<T> {
            let target: Vec<usize> = bounds.iter().map(|(lo, hi)| hi - lo).collect();
            ArrayD::from_shape_fn(IxDyn(&target), |idx| {
                let src: Vec<usize> = idx
                    .slice()
                    .iter()
                    .zip(bounds)
                    .map(|(&i, (lo, _))| lo + i)
                    .collect();
                a[IxDyn(&src)].clone()
            })
        }
        match self {
            TypedArray::Bool(a) => TypedArray::Bool(window(a, bounds)),
            TypedArray::Int64(a) => TypedArray::Int64(window(a, bounds)),
            TypedArray::Float64(a) => TypedArray::Float64(window(a, bounds)),
            TypedArray::Unicode(a) => TypedArray::Unicode(window(a, bounds)),
            TypedArray::Struct(fields) => TypedArray::Struct(
                fields
                    .iter()
                    .map(|(name, a)| (name.clone(), a.slice_ranges(bounds)))
                    .collect(),
            ),
        }
    }

    /// Concatenate along an existing axis. Used to reassemble block reads.
    pub fn concatenate(parts: &[TypedArray], axis: usize) -> CatalogResult<TypedArray> {
        fn concat_views<T: Clone>(arrays: Vec<&ArrayD<T>>, axis: usize) -> CatalogResult<ArrayD<T>> {
            let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
            ndarray::concatenate(Axis(axis), &views).map_err(|err| {
                CatalogError::UnsupportedDtype(format!("concatenate failed: {err}"))
            })
        }
        match parts {
            [] => Err(CatalogError::UnsupportedDtype(
                "cannot concatenate zero arrays".to_string(),
            )),
            [TypedArray::Bool(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Bool)?;
                Ok(TypedArray::Bool(concat_views(arrays, axis)?))
            }
            [TypedArray::Int64(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Int64)?;
                Ok(TypedArray::Int64(concat_views(arrays, axis)?))
            }
            [TypedArray::Float64(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Float64)?;
                Ok(TypedArray::Float64(concat_views(arrays, axis)?))
            }
            [TypedArray::Unicode(_), ..] => {
                let arrays = collect_variant!(parts, TypedArray::Unicode)?;
                Ok(TypedArray::Unicode(concat_views(arrays, axis)?))
            }
            [TypedArray::Struct(first_fields), ..] => {
                let mut columns = Vec::with_capacity(first_fields.len());
                for (index, (name, _)) in first_fields.iter().enumerate() {
                    let field_parts: Vec<TypedArray> = parts
                        .iter()
                        .filter_map(|p| match p {
                            TypedArray::Struct(fields) => {
                                fields.get(index).map(|(_, a)| a.clone())
                            }
                            _ => None,
                        })
                        .collect();
                    columns.push((name.clone(), TypedArray::concatenate(&field_parts, axis)?));
                }
                Ok(TypedArray::Struct(columns))
            }
        }
    }

    /// The storage class this array actually uses.
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            TypedArray::Bool(_) => Some(ScalarKind::Bool),
            TypedArray::Int64(_) => Some(ScalarKind::Int),
            TypedArray::Float64(_) => Some(ScalarKind::Float),
            TypedArray::Unicode(_) => Some(ScalarKind::Unicode),
            TypedArray::Struct(_) => None,
        }
    }

    pub fn as_f64s(&self) -> Option<&ArrayD<f64>> {
        match self {
            TypedArray::Float64(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i64s(&self) -> Option<&ArrayD<i64>> {
        match self {
            TypedArray::Int64(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&ArrayD<String>> {
        match self {
            TypedArray::Unicode(a) => Some(a),
            _ => None,
        }
    }

    /// Memory footprint of the backing buffers in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            TypedArray::Bool(a) => a.len(),
            TypedArray::Int64(a) => a.len() * 8,
            TypedArray::Float64(a) => a.len() * 8,
            TypedArray::Unicode(a) => a.iter().map(|s| s.len()).sum(),
            TypedArray::Struct(fields) => fields.iter().map(|(_, a)| a.memory_bytes()).sum(),
        }
    }
}

// =============================================================================
// JSON cell parsing helpers
// =============================================================================

/// Shape of a nested JSON array; scalars are rank 0.
fn json_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    shape
}

fn collect_leaves<'v>(
    value: &'v Value,
    out: &mut Vec<&'v Value>,
    shape: &[usize],
    depth: usize,
) -> CatalogResult<()> {
    if depth == shape.len() {
        out.push(value);
        return Ok(());
    }
    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                collect_leaves(item, out, shape, depth + 1)?;
            }
            Ok(())
        }
        _ => Err(CatalogError::UnsupportedDtype(
            "ragged nested array cell".to_string(),
        )),
    }
}

fn shaped<T>(cells: Vec<T>, shape: &[usize]) -> CatalogResult<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(shape), cells)
        .map_err(|err| CatalogError::UnsupportedDtype(format!("bad cell shape: {err}")))
}

fn as_bool(value: &Value, casted: &mut bool) -> CatalogResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => {
            *casted = true;
            Ok(n.as_f64().unwrap_or(0.0) != 0.0)
        }
        other => Err(CatalogError::UnsupportedDtype(format!(
            "expected boolean, got {other}"
        ))),
    }
}

fn as_i64(value: &Value, casted: &mut bool) -> CatalogResult<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                *casted = true;
                Ok(n.as_f64().unwrap_or(0.0) as i64)
            }
        }
        Value::Bool(b) => {
            *casted = true;
            Ok(i64::from(*b))
        }
        other => Err(CatalogError::UnsupportedDtype(format!(
            "expected integer, got {other}"
        ))),
    }
}

fn as_f64(value: &Value, casted: &mut bool) -> CatalogResult<f64> {
    match value {
        // Integer-valued JSON in a float column is routine, not a mismatch
        // worth warning about.
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => {
            *casted = true;
            Ok(f64::from(u8::from(*b)))
        }
        other => Err(CatalogError::UnsupportedDtype(format!(
            "expected number, got {other}"
        ))),
    }
}

fn as_string(value: &Value, casted: &mut bool) -> CatalogResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => {
            *casted = true;
            Ok(n.to_string())
        }
        other => Err(CatalogError::UnsupportedDtype(format!(
            "expected string, got {other}"
        ))),
    }
}

fn record_field<'v>(record: &'v Value, name: &str, position: usize) -> CatalogResult<&'v Value> {
    match record {
        Value::Object(map) => map.get(name).ok_or_else(|| {
            CatalogError::UnsupportedDtype(format!("record missing field {name:?}"))
        }),
        Value::Array(items) => items.get(position).ok_or_else(|| {
            CatalogError::UnsupportedDtype(format!("record missing positional field {position}"))
        }),
        other => Err(CatalogError::UnsupportedDtype(format!(
            "expected record, got {other}"
        ))),
    }
}

// =============================================================================
// Dataset schema
// =============================================================================

/// Declared layout of one materialized column.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayStructure {
    pub shape: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    pub dims: Vec<String>,
    pub data_type: ElementType,
}

/// Attributes carried on each column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayAttrs {
    /// The producing device, when the descriptor's `object_keys` name one.
    pub object: Option<String>,
    /// Physical units.
    pub units_string: Option<String>,
}

/// A materialized column: data plus labeled dimensions and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    pub data: TypedArray,
    pub dims: Vec<String>,
    pub attrs: ArrayAttrs,
}

/// A materialized dataset: the `time` coordinate plus one column per data
/// key, in a stable order with `time` first.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub stream_name: String,
    arrays: Vec<(String, DataArray)>,
}

impl Dataset {
    pub fn new(stream_name: &str, arrays: Vec<(String, DataArray)>) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            arrays,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DataArray> {
        self.arrays
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, array)| array)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.arrays.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataArray)> {
        self.arrays.iter().map(|(name, array)| (name.as_str(), array))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Extent of the shared `time` dimension.
    pub fn time_len(&self) -> usize {
        self.get("time").map(|a| a.data.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_numpy_type_strings() {
        assert_eq!(BuiltinType::parse("<f8").unwrap(), BuiltinType::FLOAT64);
        assert_eq!(
            BuiltinType::parse("<u2").unwrap(),
            BuiltinType {
                kind: ScalarKind::Int,
                itemsize: 2
            }
        );
        assert_eq!(BuiltinType::parse("|b1").unwrap(), BuiltinType::BOOL);
        assert_eq!(BuiltinType::parse("<U16").unwrap(), BuiltinType::unicode(16));
        assert!(BuiltinType::parse("<M8").is_err());
    }

    #[test]
    fn test_element_type_precedence() {
        let key = DataKey::scalar(Dtype::Number, "det").with_dtype_str("<u2");
        let etype = ElementType::from_data_key(&key).unwrap();
        assert_eq!(etype.itemsize(), 2);

        let fallback = DataKey::scalar(Dtype::Integer, "det");
        assert_eq!(
            ElementType::from_data_key(&fallback).unwrap(),
            ElementType::Builtin(BuiltinType::INT64)
        );
    }

    #[test]
    fn test_structured_dtype_flat_only() {
        let mut key = DataKey::scalar(Dtype::Array, "det");
        key.dtype_descr = Some(vec![
            ("x".to_string(), json!("<f8")),
            ("y".to_string(), json!("<f8")),
        ]);
        match ElementType::from_data_key(&key).unwrap() {
            ElementType::Struct(fields) => assert_eq!(fields.len(), 2),
            other => panic!("expected struct, got {other:?}"),
        }

        key.dtype_descr = Some(vec![(
            "pos".to_string(),
            json!([["x", "<f8"], ["y", "<f8"]]),
        )]);
        assert!(matches!(
            ElementType::from_data_key(&key),
            Err(CatalogError::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_trivial_descr_falls_through() {
        let mut key = DataKey::scalar(Dtype::Number, "det");
        key.dtype_descr = Some(vec![(String::new(), json!("<f8"))]);
        assert_eq!(
            ElementType::from_data_key(&key).unwrap(),
            ElementType::Builtin(BuiltinType::FLOAT64)
        );
    }

    #[test]
    fn test_from_json_scalar_and_nested() {
        let etype = ElementType::Builtin(BuiltinType::INT64);
        let (array, casted) = TypedArray::from_json(&json!(7), &etype).unwrap();
        assert!(!casted);
        assert_eq!(array.shape(), Vec::<usize>::new());

        let etype = ElementType::Builtin(BuiltinType::FLOAT64);
        let (array, _) = TypedArray::from_json(&json!([[1, 2], [3, 4]]), &etype).unwrap();
        assert_eq!(array.shape(), vec![2, 2]);
        assert_eq!(array.as_f64s().unwrap()[[1, 0]], 3.0);
    }

    #[test]
    fn test_from_json_flags_cast() {
        let etype = ElementType::Builtin(BuiltinType::INT64);
        let (array, casted) = TypedArray::from_json(&json!(1.5), &etype).unwrap();
        assert!(casted);
        let values: Vec<i64> = array.as_i64s().unwrap().iter().copied().collect();
        assert_eq!(values, vec![1]);
    }

    #[test]
    fn test_ragged_cell_rejected() {
        let etype = ElementType::Builtin(BuiltinType::FLOAT64);
        assert!(TypedArray::from_json(&json!([[1, 2], [3]]), &etype).is_err());
    }

    #[test]
    fn test_struct_cells() {
        let etype = ElementType::Struct(vec![
            StructField {
                name: "x".to_string(),
                dtype: BuiltinType::FLOAT64,
            },
            StructField {
                name: "y".to_string(),
                dtype: BuiltinType::INT64,
            },
        ]);
        let (array, _) =
            TypedArray::from_json(&json!([{"x": 1.0, "y": 2}, {"x": 3.0, "y": 4}]), &etype)
                .unwrap();
        assert_eq!(array.shape(), vec![2]);
        match array {
            TypedArray::Struct(fields) => {
                assert_eq!(fields[0].1.as_f64s().unwrap().as_slice().unwrap(), &[1.0, 3.0]);
                assert_eq!(fields[1].1.as_i64s().unwrap().as_slice().unwrap(), &[2, 4]);
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn test_stack_and_concatenate_round_trip() {
        let etype = ElementType::Builtin(BuiltinType::INT64);
        let parts: Vec<TypedArray> = [json!([1, 2]), json!([3, 4]), json!([5, 6])]
            .iter()
            .map(|v| TypedArray::from_json(v, &etype).unwrap().0)
            .collect();
        let stacked = TypedArray::stack(&parts).unwrap();
        assert_eq!(stacked.shape(), vec![3, 2]);

        let first = stacked.slice_ranges(&[(0, 2), (0, 2)]);
        let second = stacked.slice_ranges(&[(2, 3), (0, 2)]);
        let rejoined = TypedArray::concatenate(&[first, second], 0).unwrap();
        assert_eq!(rejoined, stacked);
    }

    #[test]
    fn test_conform_pads_by_edge_replication() {
        let etype = ElementType::Builtin(BuiltinType::INT64);
        let (array, _) = TypedArray::from_json(&json!([[1, 2], [3, 4]]), &etype).unwrap();
        let padded = array.conform(&[3, 2]);
        assert_eq!(padded.shape(), vec![3, 2]);
        // Last row replicated.
        assert_eq!(padded.as_i64s().unwrap()[[2, 1]], 4);

        let trimmed = array.conform(&[1, 2]);
        assert_eq!(trimmed.shape(), vec![1, 2]);
        assert_eq!(trimmed.as_i64s().unwrap()[[0, 1]], 2);
    }

    #[test]
    fn test_dataset_lookup() {
        let etype = ElementType::Builtin(BuiltinType::FLOAT64);
        let (array, _) = TypedArray::from_json(&json!([1.0, 2.0]), &etype).unwrap();
        let ds = Dataset::new(
            "primary",
            vec![(
                "time".to_string(),
                DataArray {
                    data: array,
                    dims: vec!["time".to_string()],
                    attrs: ArrayAttrs::default(),
                },
            )],
        );
        assert_eq!(ds.time_len(), 2);
        assert!(ds.get("missing").is_none());
    }
}
