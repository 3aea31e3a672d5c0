//! # tidemark-core
//!
//! By-slice streaming query engine for event-sourced and durable-state
//! stores backed by a relational database.
//!
//! The engine turns a time-ordered table of persisted rows into an ordered,
//! deduplicated, resumable stream of envelopes for building materialized
//! views and projections:
//!
//! - **At-least-once**: every row the store produces is eventually
//!   delivered.
//! - **No duplicates across restarts**: callers that persist the emitted
//!   [`TimestampOffset`]s can resume without re-processing, even when
//!   several rows share one commit timestamp.
//! - **Timestamp order with clock tolerance**: delivery follows the
//!   database-assigned commit timestamp, and a backtracking scan recovers
//!   rows whose timestamps landed below the live cursor because of
//!   concurrent not-yet-committed writes.
//!
//! SQL construction, connection pooling, and payload deserialization stay
//! behind the [`RowSource`], [`ClockOracle`], and [`EnvelopeFactory`]
//! seams; `tidemark-sqlite` ships a SQLite implementation of the store
//! side.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use tidemark_core::{BySliceQuery, QuerySettings, RowEnvelopeFactory};
//! # async fn example<S, C>(store: Arc<S>, clock: Arc<C>) -> Result<(), tidemark_core::QueryError>
//! # where S: tidemark_core::RowSource, C: tidemark_core::ClockOracle {
//!
//! let queries = BySliceQuery::new(
//!     store,
//!     clock,
//!     Arc::new(RowEnvelopeFactory),
//!     QuerySettings::default(),
//! )?;
//!
//! let mut envelopes = queries.live_by_slices("orders", "Order", 0, 511, None);
//! while let Some(envelope) = envelopes.next().await {
//!     let envelope = envelope?;
//!     // apply to the projection, persist envelope.offset
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod by_slice;
mod driver;
mod error;
mod offset;
mod settings;
mod slice;
mod source;
mod stage;

pub use by_slice::{BySliceQuery, QueryState, SWITCH_TO_BACKTRACKING_AFTER_IDLE};
pub use driver::{adjust_next_delay, continuous_query};
pub use error::QueryError;
pub use offset::{Offset, TimestampOffset};
pub use settings::QuerySettings;
pub use slice::{slice_for_persistence_id, slice_ranges, NUMBER_OF_SLICES};
pub use source::{
    ClockOracle, EnvelopeFactory, EnvelopeStream, Row, RowEnvelope, RowEnvelopeFactory, RowQuery,
    RowSource, RowStream,
};
