//! Current and live by-slice query modes.
//!
//! Both modes are closure bundles handed to the continuous query driver.
//! Current mode walks from the initial offset up to a frozen "now" snapshot
//! and stops; live mode tails the journal forever, interleaving primary
//! queries near the head with backtracking scans over an older window to
//! recover rows whose commit timestamps landed below the primary cursor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use crate::driver::{adjust_next_delay, continuous_query};
use crate::error::QueryError;
use crate::offset::{Offset, TimestampOffset};
use crate::settings::QuerySettings;
use crate::source::{ClockOracle, EnvelopeFactory, EnvelopeStream, RowQuery, RowSource};
use crate::stage::deserialize_and_add_offset;

/// Consecutive empty primary polls before the live query switches to a
/// backtracking scan of the older window.
pub const SWITCH_TO_BACKTRACKING_AFTER_IDLE: u64 = 5;

/// Driver state for one by-slice query stream.
#[derive(Debug, Clone)]
pub struct QueryState {
    /// Cursor of the primary (live tail) pipeline.
    pub latest: TimestampOffset,
    /// Cursor of the backtracking pipeline; zero until backtracking has run.
    pub latest_backtracking: TimestampOffset,
    /// Envelopes emitted by the current sub-query.
    pub row_count: usize,
    /// Sub-queries issued so far.
    pub query_count: u64,
    /// Consecutive sub-queries that emitted nothing.
    pub idle_count: u64,
    /// Whether the current sub-query is a backtracking scan.
    pub backtracking: bool,
}

impl QueryState {
    fn starting_from(offset: TimestampOffset) -> Self {
        Self {
            latest: offset,
            latest_backtracking: TimestampOffset::zero(),
            row_count: 0,
            query_count: 0,
            idle_count: 0,
            backtracking: false,
        }
    }

    /// The cursor the next sub-query resumes from.
    #[must_use]
    pub fn current_offset(&self) -> &TimestampOffset {
        if self.backtracking {
            &self.latest_backtracking
        } else {
            &self.latest
        }
    }

    /// Inclusive lower timestamp bound for the next sub-query.
    #[must_use]
    pub fn next_query_from_timestamp(&self) -> DateTime<Utc> {
        self.current_offset().timestamp
    }

    /// Exclusive upper bound for the next sub-query: backtracking never
    /// looks past the primary cursor.
    #[must_use]
    pub fn next_query_until_timestamp(&self) -> Option<DateTime<Utc>> {
        if self.backtracking {
            Some(self.latest.timestamp)
        } else {
            None
        }
    }
}

/// By-slice query engine over a row source, a clock oracle, and an envelope
/// factory.
#[derive(Debug)]
pub struct BySliceQuery<R, C, F> {
    source: Arc<R>,
    clock: Arc<C>,
    factory: Arc<F>,
    settings: QuerySettings,
}

impl<R, C, F> BySliceQuery<R, C, F>
where
    R: RowSource,
    C: ClockOracle,
    F: EnvelopeFactory,
{
    /// Creates the engine after validating the settings.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidSettings`] when the settings fail
    /// validation.
    pub fn new(
        source: Arc<R>,
        clock: Arc<C>,
        factory: Arc<F>,
        settings: QuerySettings,
    ) -> Result<Self, QueryError> {
        settings.validate()?;
        Ok(Self {
            source,
            clock,
            factory,
            settings,
        })
    }

    /// The settings this engine runs with.
    #[must_use]
    pub const fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Finite stream of every row with `db_timestamp` between the initial
    /// offset and a "now" snapshot frozen before the first sub-query.
    ///
    /// Pages are pulled as fast as downstream demand permits. The stream
    /// completes once a page comes back empty. A page that emitted at least
    /// `buffer_size - 1` envelopes is always followed by another: the source
    /// caps pages at `buffer_size` rows and deduplication can drop one
    /// boundary row, so that count still means "likely more rows waiting".
    pub fn current_by_slices(
        &self,
        log_prefix: &str,
        entity_type: &str,
        min_slice: u32,
        max_slice: u32,
        offset: Option<Offset>,
    ) -> EnvelopeStream<F::Envelope> {
        let initial = TimestampOffset::from_offset(offset);
        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let factory = Arc::clone(&self.factory);
        let buffer_size = self.settings.buffer_size;
        let log_prefix = log_prefix.to_string();
        let entity_type = entity_type.to_string();

        let start = async move {
            let snapshot_now = clock.current_db_timestamp().await?;
            debug!(
                prefix = %log_prefix,
                from = %initial.timestamp,
                until = %snapshot_now,
                "current query: starting"
            );

            let update_state = {
                let factory = Arc::clone(&factory);
                move |mut state: QueryState, envelope: &F::Envelope| {
                    state.latest = factory.extract_offset(envelope);
                    state.row_count += 1;
                    Ok(state)
                }
            };

            let next_query = move |state: QueryState| {
                if state.query_count == 0 || state.row_count > 0 {
                    let next_state = QueryState {
                        row_count: 0,
                        query_count: state.query_count + 1,
                        ..state
                    };
                    debug!(
                        prefix = %log_prefix,
                        query_count = next_state.query_count,
                        from = %next_state.latest.timestamp,
                        "current query: next page"
                    );
                    let rows = source.rows_by_slices(RowQuery {
                        entity_type: entity_type.clone(),
                        min_slice,
                        max_slice,
                        from_timestamp: next_state.latest.timestamp,
                        until_timestamp: Some(snapshot_now),
                        behind_current_time: Duration::ZERO,
                        backtracking: false,
                        buffer_size,
                    });
                    let sub = deserialize_and_add_offset(
                        next_state.latest.clone(),
                        Arc::clone(&factory),
                        rows,
                    );
                    (next_state, Some(sub))
                } else {
                    debug!(
                        prefix = %log_prefix,
                        queries = state.query_count,
                        "current query: exhausted"
                    );
                    (state, None)
                }
            };

            Ok::<_, QueryError>(continuous_query(
                QueryState::starting_from(initial),
                update_state,
                |_state| None,
                next_query,
            ))
        };

        stream::once(start).try_flatten().boxed()
    }

    /// Infinite stream tailing new rows, with periodic backtracking scans
    /// over an older window to catch rows whose commit timestamps fell
    /// below the primary cursor.
    ///
    /// Callers that persist offsets must track the primary and backtracking
    /// cursors independently: envelopes from a backtracking scan carry
    /// offsets older than the primary cursor.
    pub fn live_by_slices(
        &self,
        log_prefix: &str,
        entity_type: &str,
        min_slice: u32,
        max_slice: u32,
        offset: Option<Offset>,
    ) -> EnvelopeStream<F::Envelope> {
        let initial = TimestampOffset::from_offset(offset);
        let source = Arc::clone(&self.source);
        let factory = Arc::clone(&self.factory);
        let settings = self.settings.clone();
        let buffer_size = settings.buffer_size;
        let refresh_interval = settings.refresh_interval;
        let half_window = settings.half_backtracking_window();
        let first_window = settings.first_backtracking_query_window();
        let log_prefix = log_prefix.to_string();
        let entity_type = entity_type.to_string();

        let update_state = {
            let factory = Arc::clone(&factory);
            let log_prefix = log_prefix.clone();
            move |mut state: QueryState, envelope: &F::Envelope| {
                let offset = factory.extract_offset(envelope);
                if state.backtracking {
                    if offset.timestamp < state.latest_backtracking.timestamp {
                        return Err(QueryError::OutOfOrderRow {
                            log_prefix: log_prefix.clone(),
                            current: state.latest_backtracking.timestamp,
                            offset: offset.timestamp,
                        });
                    }
                    state.latest_backtracking = offset;
                } else {
                    if offset.timestamp < state.latest.timestamp {
                        return Err(QueryError::OutOfOrderRow {
                            log_prefix: log_prefix.clone(),
                            current: state.latest.timestamp,
                            offset: offset.timestamp,
                        });
                    }
                    state.latest = offset;
                }
                state.row_count += 1;
                Ok(state)
            }
        };

        let delay_next_query = move |state: &QueryState| {
            if state.query_count == 0 {
                None
            } else {
                adjust_next_delay(state.row_count, buffer_size, refresh_interval)
            }
        };

        let next_query = move |state: QueryState| {
            // The first call precedes any poll, so it cannot count as idle.
            let new_idle_count = if state.query_count == 0 {
                0
            } else if state.row_count == 0 {
                state.idle_count + 1
            } else {
                0
            };

            // The window-excess trigger needs a backtracking cursor as its
            // baseline; until one exists, only idleness engages backtracking.
            let backtracking_behind_cursor = !state.latest_backtracking.is_zero()
                && state
                    .latest
                    .timestamp
                    .signed_duration_since(state.latest_backtracking.timestamp)
                    .to_std()
                    .is_ok_and(|gap| gap > half_window);

            let next_state = if settings.backtracking_enabled
                && !state.backtracking
                && !state.latest.is_zero()
                && (new_idle_count >= SWITCH_TO_BACKTRACKING_AFTER_IDLE
                    || backtracking_behind_cursor)
            {
                // The first scan rewinds a full window plus the backtracking
                // horizon behind the primary cursor; later scans resume the
                // backtracking cursor.
                let latest_backtracking = if state.latest_backtracking.is_zero() {
                    TimestampOffset::new(
                        rewind(state.latest.timestamp, first_window),
                        DateTime::UNIX_EPOCH,
                        BTreeMap::new(),
                    )
                } else {
                    state.latest_backtracking.clone()
                };
                QueryState {
                    latest_backtracking,
                    row_count: 0,
                    query_count: state.query_count + 1,
                    idle_count: new_idle_count,
                    backtracking: true,
                    ..state
                }
            } else if state.backtracking && state.row_count < buffer_size - 1 {
                // An under-filled backtracking page means the older window
                // is caught up; return to the live tail.
                QueryState {
                    row_count: 0,
                    query_count: state.query_count + 1,
                    idle_count: new_idle_count,
                    backtracking: false,
                    ..state
                }
            } else {
                QueryState {
                    row_count: 0,
                    query_count: state.query_count + 1,
                    idle_count: new_idle_count,
                    ..state
                }
            };

            let from_timestamp = next_state.next_query_from_timestamp();
            let until_timestamp = next_state.next_query_until_timestamp();
            let behind_current_time = if next_state.backtracking {
                settings.backtracking_behind_current_time
            } else {
                settings.behind_current_time
            };

            debug!(
                prefix = %log_prefix,
                query_count = next_state.query_count,
                idle_count = next_state.idle_count,
                backtracking = next_state.backtracking,
                from = %from_timestamp,
                "live query: next sub-query"
            );

            let rows = source.rows_by_slices(RowQuery {
                entity_type: entity_type.clone(),
                min_slice,
                max_slice,
                from_timestamp,
                until_timestamp,
                behind_current_time,
                backtracking: next_state.backtracking,
                buffer_size,
            });
            let sub = deserialize_and_add_offset(
                next_state.current_offset().clone(),
                Arc::clone(&factory),
                rows,
            );
            (next_state, Some(sub))
        };

        continuous_query(
            QueryState::starting_from(initial),
            update_state,
            delay_next_query,
            next_query,
        )
    }
}

/// Subtracts a window from a timestamp, clamping at the epoch.
fn rewind(timestamp: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| timestamp.checked_sub_signed(delta))
        .map_or(DateTime::UNIX_EPOCH, |rewound| {
            rewound.max(DateTime::UNIX_EPOCH)
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(micros: i64) -> DateTime<Utc> {
        Utc.timestamp_micros(micros).unwrap()
    }

    fn offset_at(micros: i64) -> TimestampOffset {
        TimestampOffset::new(ts(micros), ts(micros), BTreeMap::new())
    }

    #[test]
    fn current_offset_follows_the_active_mode() {
        let mut state = QueryState::starting_from(offset_at(2_000));
        state.latest_backtracking = offset_at(1_000);

        assert_eq!(state.current_offset().timestamp, ts(2_000));
        assert_eq!(state.next_query_until_timestamp(), None);

        state.backtracking = true;
        assert_eq!(state.current_offset().timestamp, ts(1_000));
        assert_eq!(state.next_query_until_timestamp(), Some(ts(2_000)));
    }

    #[test]
    fn rewind_clamps_at_the_epoch() {
        let early = ts(1_000);
        assert_eq!(
            rewind(early, Duration::from_secs(3600)),
            DateTime::UNIX_EPOCH
        );

        let late = Utc.timestamp_micros(10_000_000_000).unwrap();
        assert_eq!(
            rewind(late, Duration::from_secs(1)),
            Utc.timestamp_micros(9_999_000_000).unwrap()
        );
    }
}
