//! SQLite-backed event store.
//!
//! The write side of the journal: rows are appended with a commit timestamp
//! assigned by the store clock, truncated to microseconds to match the
//! column resolution. The read side lives in [`crate::source`].

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;
use tidemark_core::slice_for_persistence_id;
use tracing::info;

/// Journal schema, including connection pragmas.
///
/// The composite index mirrors the read path: every sub-query filters on
/// `(entity_type, slice, db_timestamp_us)` and orders by
/// `(db_timestamp_us, seq_nr)`.
const SCHEMA_SQL: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS events (
        entity_type TEXT NOT NULL,
        persistence_id TEXT NOT NULL,
        slice INTEGER NOT NULL,
        seq_nr INTEGER NOT NULL,
        db_timestamp_us INTEGER NOT NULL,
        payload BLOB NOT NULL,
        ser_id INTEGER NOT NULL,
        ser_manifest TEXT NOT NULL,
        PRIMARY KEY (persistence_id, seq_nr)
    );

    CREATE INDEX IF NOT EXISTS idx_events_slice_timestamp
        ON events(entity_type, slice, db_timestamp_us, seq_nr);
";

/// Errors from the store's write side.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panic in another thread.
    #[error("connection lock poisoned")]
    LockPoisoned,

    /// A stored timestamp does not fit the supported chrono range.
    #[error("timestamp out of range: {micros}us")]
    TimestampOutOfRange {
        /// The offending microsecond value.
        micros: i64,
    },
}

/// Clock assigning commit timestamps and evaluating read horizons.
///
/// Production uses [`SystemClock`]; tests drive visibility windows
/// deterministically with [`ManualClock`].
pub trait StoreClock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// System-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl StoreClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at the given instant.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Moves the clock to the given instant.
    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl StoreClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or(DateTime::UNIX_EPOCH, |guard| *guard)
    }
}

/// An event to append, before the store assigns slice and commit timestamp.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    /// Entity family.
    pub entity_type: String,
    /// Entity identifier.
    pub persistence_id: String,
    /// Per-entity monotonic counter.
    pub seq_nr: i64,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Serializer id.
    pub ser_id: u32,
    /// Serializer manifest.
    pub ser_manifest: String,
}

/// SQLite-backed event journal.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn StoreClock>,
}

impl SqliteEventStore {
    /// Opens (or creates) a journal at `path` with WAL mode enabled.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.as_ref().display(), "Opened event journal");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Opens an in-memory journal, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error when schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the store clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl StoreClock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Appends an event, assigning the commit timestamp from the store
    /// clock. Returns the assigned timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails, including primary-key
    /// conflicts on `(persistence_id, seq_nr)`.
    pub fn append(&self, event: &AppendEvent) -> Result<DateTime<Utc>, StoreError> {
        let db_timestamp = truncate_to_micros(self.clock.now())?;
        self.append_at(event, db_timestamp)?;
        Ok(db_timestamp)
    }

    /// Appends an event with an explicit commit timestamp. Used by tests
    /// and backfills; normal writes go through [`Self::append`].
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub fn append_at(
        &self,
        event: &AppendEvent,
        db_timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let slice = slice_for_persistence_id(&event.persistence_id);
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute(
            "INSERT INTO events
             (entity_type, persistence_id, slice, seq_nr, db_timestamp_us,
              payload, ser_id, ser_manifest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.entity_type,
                event.persistence_id,
                i64::from(slice),
                event.seq_nr,
                db_timestamp.timestamp_micros(),
                event.payload,
                i64::from(event.ser_id),
                event.ser_manifest,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub(crate) fn clock(&self) -> Arc<dyn StoreClock> {
        Arc::clone(&self.clock)
    }
}

impl std::fmt::Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventStore").finish_non_exhaustive()
    }
}

/// Truncates a timestamp to the microsecond column resolution.
pub(crate) fn truncate_to_micros(timestamp: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
    let micros = timestamp.timestamp_micros();
    DateTime::from_timestamp_micros(micros).ok_or(StoreError::TimestampOutOfRange { micros })
}
