//! # tidemark-sqlite
//!
//! SQLite-backed event store adapter for the tidemark query engine.
//!
//! [`SqliteEventStore`] owns the journal table and implements both store
//! seams the engine consumes: `RowSource` (slice/time-windowed page reads)
//! and `ClockOracle` (the store clock). The write side assigns commit
//! timestamps at append time, truncated to the microsecond resolution of
//! the timestamp column.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tidemark_core::{BySliceQuery, QuerySettings, RowEnvelopeFactory};
//! use tidemark_sqlite::SqliteEventStore;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteEventStore::open("journal.db")?);
//! let queries = BySliceQuery::new(
//!     Arc::clone(&store),
//!     store,
//!     Arc::new(RowEnvelopeFactory),
//!     QuerySettings::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod source;
mod store;

pub use store::{AppendEvent, ManualClock, SqliteEventStore, StoreClock, StoreError, SystemClock};
