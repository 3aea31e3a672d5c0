//! Deterministic slice partitioning.
//!
//! A slice is a stable partition key derived from the persistence id. The
//! slice space is fixed at [`NUMBER_OF_SLICES`] so that a journal written by
//! one process can be consumed as any contiguous slice range by another.
//!
//! The hash is only consulted when a row is written; the store persists the
//! slice alongside the row and readers filter on the stored column, so a
//! future change of hash function cannot strand already-written rows.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;

use crate::error::QueryError;

/// Total number of slices in the partition space.
pub const NUMBER_OF_SLICES: u32 = 1024;

/// Derives the slice for a persistence id.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // reduced modulo NUMBER_OF_SLICES
pub fn slice_for_persistence_id(persistence_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    persistence_id.hash(&mut hasher);
    (hasher.finish() % u64::from(NUMBER_OF_SLICES)) as u32
}

/// Partitions the slice space into `number_of_ranges` contiguous ranges of
/// equal size, for spreading projection workers over the journal.
///
/// # Errors
///
/// Returns [`QueryError::InvalidSliceRanges`] when `number_of_ranges` is zero
/// or does not evenly divide [`NUMBER_OF_SLICES`].
pub fn slice_ranges(number_of_ranges: u32) -> Result<Vec<RangeInclusive<u32>>, QueryError> {
    if number_of_ranges == 0 || NUMBER_OF_SLICES % number_of_ranges != 0 {
        return Err(QueryError::InvalidSliceRanges {
            number_of_ranges,
            total: NUMBER_OF_SLICES,
        });
    }

    let range_size = NUMBER_OF_SLICES / number_of_ranges;
    Ok((0..number_of_ranges)
        .map(|i| {
            let min = i * range_size;
            min..=(min + range_size - 1)
        })
        .collect())
}
