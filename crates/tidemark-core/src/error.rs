//! Error taxonomy for the by-slice query engine.
//!
//! Errors fall into four classes: failures surfaced by the row source or
//! clock oracle, ordering invariant violations detected while folding
//! envelopes into the query state, invalid settings rejected up front, and
//! invalid slice-range requests. Cancellation is not an error; a consumer
//! that drops the stream simply stops receiving envelopes.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by by-slice query streams.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// Failure from the row source or its underlying driver.
    #[error("row source failure: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The clock oracle could not produce a current database timestamp.
    #[error("clock oracle returned no current database timestamp")]
    ClockUnavailable,

    /// A row arrived with a timestamp strictly before the accumulated
    /// offset. The source contract guarantees non-decreasing timestamps
    /// within a sub-stream, so this is a driver or store defect, not a
    /// recoverable condition.
    #[error("{log_prefix} out-of-order row: offset {offset} is before current {current}")]
    OutOfOrderRow {
        /// Prefix identifying the query that observed the violation.
        log_prefix: String,
        /// Timestamp accumulated so far on this stream.
        current: DateTime<Utc>,
        /// Timestamp of the row that went backwards.
        offset: DateTime<Utc>,
    },

    /// Settings failed validation.
    #[error("invalid query settings: {reason}")]
    InvalidSettings {
        /// Why the settings were rejected.
        reason: String,
    },

    /// A slice-range partitioning request that does not evenly divide the
    /// slice space.
    #[error("cannot partition {total} slices into {number_of_ranges} ranges")]
    InvalidSliceRanges {
        /// Requested number of ranges.
        number_of_ranges: u32,
        /// Total number of slices.
        total: u32,
    },
}

impl QueryError {
    /// Wraps an arbitrary error as a row-source failure.
    pub fn source(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Source(Box::new(err))
    }
}
