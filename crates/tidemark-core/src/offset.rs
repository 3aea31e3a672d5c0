//! Resumable cursor for timestamp-ordered streams.
//!
//! A [`TimestampOffset`] tracks the largest database timestamp observed on a
//! stream together with the `seen` map: the largest sequence number emitted
//! for each persistence id *at exactly that timestamp*. Commit timestamps
//! have microsecond resolution, so two rows may legitimately share one; when
//! a consumer resumes with `db_timestamp >= offset.timestamp` the store will
//! re-serve rows at the boundary timestamp, and `seen` is precisely the set
//! needed to drop the ones already delivered.
//!
//! `seen` is the minimal resume state: entries are discarded the moment the
//! timestamp advances, because rows at older timestamps can no longer be
//! re-served by a resume query.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset supplied by a caller, possibly persisted by earlier runs.
///
/// Projections typically store offsets in their own bookkeeping table and
/// hand them back verbatim on restart. Absent or unset offsets coerce to
/// [`TimestampOffset::zero`], which starts the stream from the beginning of
/// the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Offset {
    /// No position; the stream starts from the epoch.
    Unset,
    /// A concrete timestamp cursor.
    Timestamp(TimestampOffset),
}

/// The cumulative cursor attached to every emitted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampOffset {
    /// Largest `db_timestamp` observed so far on this stream.
    pub timestamp: DateTime<Utc>,
    /// Read-side clock at the moment the row carrying `timestamp` was
    /// fetched. Diagnostic only; never used for resume decisions.
    pub read_timestamp: DateTime<Utc>,
    /// Largest `seq_nr` observed per persistence id whose row timestamp
    /// equals `timestamp`.
    pub seen: BTreeMap<String, i64>,
}

impl TimestampOffset {
    /// Creates an offset from its parts.
    #[must_use]
    pub const fn new(
        timestamp: DateTime<Utc>,
        read_timestamp: DateTime<Utc>,
        seen: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            timestamp,
            read_timestamp,
            seen,
        }
    }

    /// The canonical zero offset: epoch timestamps, empty `seen`.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            read_timestamp: DateTime::UNIX_EPOCH,
            seen: BTreeMap::new(),
        }
    }

    /// Whether this is the zero offset.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.timestamp == DateTime::UNIX_EPOCH
    }

    /// Coerces a caller-supplied offset, treating absent or unset values as
    /// [`TimestampOffset::zero`].
    #[must_use]
    pub fn from_offset(offset: Option<Offset>) -> Self {
        match offset {
            Some(Offset::Timestamp(ts)) => ts,
            Some(Offset::Unset) | None => Self::zero(),
        }
    }
}

impl Default for TimestampOffset {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<TimestampOffset> for Offset {
    fn from(ts: TimestampOffset) -> Self {
        Self::Timestamp(ts)
    }
}
