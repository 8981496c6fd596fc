//! Chunk planning for materialized arrays.
//!
//! Columns are materialized as n-dimensional arrays of shape
//! `(time, *per_event_shape)`. To keep block reads bounded in memory, each
//! axis is partitioned into blocks whose combined byte size stays at or
//! below a configured ceiling. The planner mirrors the behavior readers
//! expect from chunked array stores:
//!
//! 1. A zero-extent axis or a zero itemsize short-circuits to one chunk
//!    covering the full shape.
//! 2. Rank-4 arrays default to `(min(K, s0), min(K, s1), auto, auto)` to
//!    optimize single-frame access of area-detector series without
//!    collapsing larger reads into size-1 chunks.
//! 3. Everything else defaults to `auto` on every axis.
//! 4. `auto` axes are sized against the element budget, granting later
//!    axes their full extent first, so the leading (time) axes are the
//!    ones subdivided.
//! 5. A descriptor-level suggestion overrides the default.
//!
//! The partition of every axis sums exactly to the axis extent.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CatalogError, CatalogResult};

/// Per-axis chunking preference, as written in an event descriptor.
///
/// Wire format: the string `"auto"`, a single block extent, or an explicit
/// list of block sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSuggestion {
    Auto,
    Fixed(usize),
    Sizes(Vec<usize>),
}

impl Serialize for ChunkSuggestion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ChunkSuggestion::Auto => serializer.serialize_str("auto"),
            ChunkSuggestion::Fixed(n) => serializer.serialize_u64(*n as u64),
            ChunkSuggestion::Sizes(sizes) => sizes.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ChunkSuggestion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) if s == "auto" => Ok(ChunkSuggestion::Auto),
            Value::Number(n) => n
                .as_u64()
                .map(|n| ChunkSuggestion::Fixed(n as usize))
                .ok_or_else(|| D::Error::custom("chunk size must be a non-negative integer")),
            Value::Array(items) => {
                let mut sizes = Vec::with_capacity(items.len());
                for item in items {
                    let n = item
                        .as_u64()
                        .ok_or_else(|| D::Error::custom("chunk sizes must be integers"))?;
                    sizes.push(n as usize);
                }
                Ok(ChunkSuggestion::Sizes(sizes))
            }
            other => Err(D::Error::custom(format!(
                "invalid chunk suggestion: {other}"
            ))),
        }
    }
}

/// Partition `shape` into per-axis block sizes whose product of itemsizes
/// stays at or below `byte_limit`.
///
/// `frames_per_chunk` is the rank-4 area-detector constant (`K` above).
/// When `suggestion` is provided it must cover every axis.
pub fn plan_chunks(
    shape: &[usize],
    itemsize: usize,
    byte_limit: usize,
    frames_per_chunk: usize,
    suggestion: Option<&[ChunkSuggestion]>,
) -> CatalogResult<Vec<Vec<usize>>> {
    if shape.iter().any(|&extent| extent == 0) || itemsize == 0 {
        return Ok(shape.iter().map(|&extent| vec![extent]).collect());
    }

    let default_suggestion;
    let suggestion = match suggestion {
        Some(explicit) => {
            if explicit.len() != shape.len() {
                return Err(CatalogError::Config(format!(
                    "chunk suggestion covers {} axes but shape has rank {}",
                    explicit.len(),
                    shape.len()
                )));
            }
            explicit
        }
        None if shape.len() == 4 => {
            default_suggestion = vec![
                ChunkSuggestion::Fixed(frames_per_chunk.min(shape[0])),
                ChunkSuggestion::Fixed(frames_per_chunk.min(shape[1])),
                ChunkSuggestion::Auto,
                ChunkSuggestion::Auto,
            ];
            &default_suggestion
        }
        None => {
            default_suggestion = vec![ChunkSuggestion::Auto; shape.len()];
            &default_suggestion
        }
    };

    // Element budget for one block, shared across axes.
    let mut budget = (byte_limit / itemsize).max(1);

    // Fixed axes consume budget by their largest block.
    let mut blocks: Vec<Option<usize>> = Vec::with_capacity(shape.len());
    for (axis, pref) in suggestion.iter().enumerate() {
        match pref {
            ChunkSuggestion::Auto => blocks.push(None),
            ChunkSuggestion::Fixed(n) => {
                let block = (*n).clamp(1, shape[axis]);
                budget = (budget / block).max(1);
                blocks.push(Some(block));
            }
            ChunkSuggestion::Sizes(sizes) => {
                let total: usize = sizes.iter().sum();
                if total != shape[axis] {
                    return Err(CatalogError::Config(format!(
                        "explicit chunks {sizes:?} sum to {total}, axis extent is {}",
                        shape[axis]
                    )));
                }
                let largest = sizes.iter().copied().max().unwrap_or(1).max(1);
                budget = (budget / largest).max(1);
                blocks.push(Some(0)); // marker: partition taken verbatim below
            }
        }
    }

    // Auto axes, later axes first, take as much of the budget as they can.
    for axis in (0..shape.len()).rev() {
        if blocks[axis].is_none() {
            let block = shape[axis].min(budget).max(1);
            budget = (budget / block).max(1);
            blocks[axis] = Some(block);
        }
    }

    let mut partitions = Vec::with_capacity(shape.len());
    for (axis, pref) in suggestion.iter().enumerate() {
        if let ChunkSuggestion::Sizes(sizes) = pref {
            partitions.push(sizes.clone());
        } else {
            let block = blocks[axis].unwrap_or(1);
            partitions.push(partition_axis(shape[axis], block));
        }
    }
    Ok(partitions)
}

/// Split one axis into blocks of `block` plus a remainder.
fn partition_axis(extent: usize, block: usize) -> Vec<usize> {
    let block = block.max(1);
    let mut sizes = vec![block; extent / block];
    if extent % block != 0 {
        sizes.push(extent % block);
    }
    sizes
}

/// The half-open `(start, stop)` covered by block `index` of a partition.
pub fn block_bounds(partition: &[usize], index: usize) -> Option<(usize, usize)> {
    if index >= partition.len() {
        return None;
    }
    let start: usize = partition[..index].iter().sum();
    Some((start, start + partition[index]))
}
