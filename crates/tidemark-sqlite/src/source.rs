//! Read side of the SQLite journal.
//!
//! Implements the engine's [`RowSource`] and [`ClockOracle`] seams. Each
//! sub-query fetches one bounded page under `spawn_blocking` (pages are
//! capped at the engine's buffer size, so eager fetching keeps the blocking
//! window short) and streams the rows to the caller. The connection lock is
//! scoped to the fetch.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use rusqlite::types::Value;
use rusqlite::Connection;
use tidemark_core::{ClockOracle, QueryError, Row, RowQuery, RowSource, RowStream};
use tracing::debug;

use crate::store::{truncate_to_micros, SqliteEventStore, StoreClock, StoreError};

impl RowSource for SqliteEventStore {
    fn rows_by_slices(&self, query: RowQuery) -> RowStream {
        let conn = self.connection();
        let clock = self.clock();
        let page = async move {
            let rows = tokio::task::spawn_blocking(move || fetch_page(&conn, &*clock, &query))
                .await
                .map_err(QueryError::source)??;
            Ok(rows)
        };
        stream::once(page)
            .map_ok(|rows: Vec<Row>| stream::iter(rows.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}

#[async_trait]
impl ClockOracle for SqliteEventStore {
    async fn current_db_timestamp(&self) -> Result<DateTime<Utc>, QueryError> {
        truncate_to_micros(self.clock().now()).map_err(QueryError::source)
    }
}

/// Runs one page query. Predicates follow the row-source contract: entity
/// type, slice range, `db_timestamp >= from`, `db_timestamp < until` when
/// present, `db_timestamp < now - behind_current_time` when the horizon is
/// non-zero; ordered by `(db_timestamp, seq_nr)`, capped at the buffer
/// size. Backtracking scans elide the payload column.
fn fetch_page(
    conn: &Arc<Mutex<Connection>>,
    clock: &dyn StoreClock,
    query: &RowQuery,
) -> Result<Vec<Row>, QueryError> {
    let read_db_timestamp = truncate_to_micros(clock.now()).map_err(QueryError::source)?;
    let now_micros = read_db_timestamp.timestamp_micros();

    let mut sql = String::from(if query.backtracking {
        "SELECT entity_type, persistence_id, slice, seq_nr, db_timestamp_us, \
         NULL, ser_id, ser_manifest FROM events"
    } else {
        "SELECT entity_type, persistence_id, slice, seq_nr, db_timestamp_us, \
         payload, ser_id, ser_manifest FROM events"
    });
    sql.push_str(" WHERE entity_type = ?1 AND slice BETWEEN ?2 AND ?3 AND db_timestamp_us >= ?4");

    let mut params: Vec<Value> = vec![
        Value::from(query.entity_type.clone()),
        Value::from(i64::from(query.min_slice)),
        Value::from(i64::from(query.max_slice)),
        Value::from(query.from_timestamp.timestamp_micros()),
    ];

    if let Some(until) = query.until_timestamp {
        params.push(Value::from(until.timestamp_micros()));
        sql.push_str(&format!(" AND db_timestamp_us < ?{}", params.len()));
    }

    if !query.behind_current_time.is_zero() {
        let behind_micros = i64::try_from(query.behind_current_time.as_micros())
            .unwrap_or(i64::MAX);
        params.push(Value::from(now_micros.saturating_sub(behind_micros)));
        sql.push_str(&format!(" AND db_timestamp_us < ?{}", params.len()));
    }

    params.push(Value::from(i64::try_from(query.buffer_size).unwrap_or(i64::MAX)));
    sql.push_str(&format!(
        " ORDER BY db_timestamp_us ASC, seq_nr ASC LIMIT ?{}",
        params.len()
    ));

    let guard = conn
        .lock()
        .map_err(|_| QueryError::source(StoreError::LockPoisoned))?;
    let mut stmt = guard.prepare(&sql).map_err(QueryError::source)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |db_row| {
            Ok((
                db_row.get::<_, String>(0)?,
                db_row.get::<_, String>(1)?,
                db_row.get::<_, i64>(2)?,
                db_row.get::<_, i64>(3)?,
                db_row.get::<_, i64>(4)?,
                db_row.get::<_, Option<Vec<u8>>>(5)?,
                db_row.get::<_, i64>(6)?,
                db_row.get::<_, String>(7)?,
            ))
        })
        .map_err(QueryError::source)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(QueryError::source)?;

    let rows = rows
        .into_iter()
        .map(
            |(entity_type, persistence_id, slice, seq_nr, micros, payload, ser_id, ser_manifest)| {
                let db_timestamp = DateTime::from_timestamp_micros(micros)
                    .ok_or(StoreError::TimestampOutOfRange { micros })
                    .map_err(QueryError::source)?;
                Ok(Row {
                    entity_type,
                    persistence_id,
                    slice: u32::try_from(slice).unwrap_or(0),
                    seq_nr,
                    db_timestamp,
                    read_db_timestamp,
                    payload,
                    ser_id: u32::try_from(ser_id).unwrap_or(0),
                    ser_manifest,
                })
            },
        )
        .collect::<Result<Vec<_>, QueryError>>()?;

    debug!(
        rows = rows.len(),
        backtracking = query.backtracking,
        from = %query.from_timestamp,
        "page fetched"
    );
    Ok(rows)
}
