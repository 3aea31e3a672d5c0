//! External collaborators of the query engine.
//!
//! The engine consumes three narrow interfaces: a [`RowSource`] that turns a
//! slice/time predicate into an ordered page of rows, a [`ClockOracle`] that
//! reports the database's transaction-time clock, and an [`EnvelopeFactory`]
//! that wraps rows into whatever envelope type the caller's projections
//! consume. SQL text, connection pooling, and payload deserialization all
//! live behind these seams.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::QueryError;
use crate::offset::TimestampOffset;

/// One persisted row as produced by the row source.
///
/// For event journals `seq_nr` is the per-entity event number; for
/// durable-state stores it is the revision. The payload and serializer
/// identifiers are passed through untouched; the engine never inspects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Entity family this row belongs to.
    pub entity_type: String,
    /// Stable identifier of the entity.
    pub persistence_id: String,
    /// Partition key derived from `persistence_id` at write time.
    pub slice: u32,
    /// Per-entity monotonic counter.
    pub seq_nr: i64,
    /// Commit time assigned by the database.
    pub db_timestamp: DateTime<Utc>,
    /// Read-side clock at the moment this row was fetched.
    pub read_db_timestamp: DateTime<Utc>,
    /// Opaque serialized payload; `None` when a backtracking scan elided it.
    pub payload: Option<Vec<u8>>,
    /// Serializer id for the payload.
    pub ser_id: u32,
    /// Serializer manifest for the payload.
    pub ser_manifest: String,
}

/// Parameters of one sub-query against the row source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    /// Entity family to read.
    pub entity_type: String,
    /// Inclusive lower slice bound.
    pub min_slice: u32,
    /// Inclusive upper slice bound.
    pub max_slice: u32,
    /// Inclusive lower timestamp bound.
    pub from_timestamp: DateTime<Utc>,
    /// Exclusive upper timestamp bound, when the caller walks a frozen
    /// window.
    pub until_timestamp: Option<DateTime<Utc>>,
    /// Exclude rows newer than `now - behind_current_time` when non-zero,
    /// evaluated against the database clock inside the query.
    pub behind_current_time: Duration,
    /// Whether this is a backtracking scan; the source may elide payloads.
    pub backtracking: bool,
    /// Maximum rows to return.
    pub buffer_size: usize,
}

/// Ordered stream of rows for one sub-query.
pub type RowStream = BoxStream<'static, Result<Row, QueryError>>;

/// Stream of envelopes handed to the consumer.
pub type EnvelopeStream<E> = BoxStream<'static, Result<E, QueryError>>;

/// Source of persisted rows.
///
/// Implementations must return rows matching the [`RowQuery`] predicate,
/// ordered by `(db_timestamp, seq_nr)` ascending and limited to
/// `buffer_size` rows. Connection and transaction resources are scoped to
/// the returned stream and must be released when it completes or is dropped.
pub trait RowSource: Send + Sync + 'static {
    /// Issues one sub-query.
    fn rows_by_slices(&self, query: RowQuery) -> RowStream;
}

/// The database's transaction-time clock.
///
/// The engine never substitutes a local clock: `behind_current_time` is
/// evaluated server-side, and this oracle exists so current-mode queries can
/// freeze a single "now" snapshot from the same time source.
#[async_trait]
pub trait ClockOracle: Send + Sync + 'static {
    /// Returns the current database timestamp.
    async fn current_db_timestamp(&self) -> Result<DateTime<Utc>, QueryError>;
}

/// Builds caller-facing envelopes and reads offsets back out of them.
///
/// `extract_offset` must round-trip: for every envelope produced by
/// `create_envelope(offset, row)`, it returns exactly `offset`. The engine
/// relies on this to fold emitted envelopes back into its query state.
pub trait EnvelopeFactory: Send + Sync + 'static {
    /// Envelope type handed to the consumer.
    type Envelope: Send + 'static;

    /// Wraps a row and its cumulative offset.
    fn create_envelope(&self, offset: TimestampOffset, row: Row) -> Self::Envelope;

    /// Reads the offset back out of an envelope.
    fn extract_offset(&self, envelope: &Self::Envelope) -> TimestampOffset;
}

/// Ready-made envelope for embedders without their own envelope type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEnvelope {
    /// Cumulative offset as of this row.
    pub offset: TimestampOffset,
    /// The row itself.
    pub row: Row,
}

/// Factory producing [`RowEnvelope`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowEnvelopeFactory;

impl EnvelopeFactory for RowEnvelopeFactory {
    type Envelope = RowEnvelope;

    fn create_envelope(&self, offset: TimestampOffset, row: Row) -> RowEnvelope {
        RowEnvelope { offset, row }
    }

    fn extract_offset(&self, envelope: &RowEnvelope) -> TimestampOffset {
        envelope.offset.clone()
    }
}
