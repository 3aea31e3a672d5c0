//! Deserialize & offset stage.
//!
//! A stateful transform from rows to envelopes. The stage owns the
//! `(current_timestamp, current_seen)` pair for exactly one sub-stream; it
//! is reconstituted from the driver's [`TimestampOffset`] at every sub-query
//! boundary and discarded when the sub-stream ends. The driver never shares
//! this state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{StreamExt, TryStreamExt};

use crate::offset::TimestampOffset;
use crate::source::{EnvelopeFactory, EnvelopeStream, Row, RowStream};

/// Per-timestamp deduplication state for one sub-stream.
///
/// Rows arrive ordered by `(db_timestamp, seq_nr)`. At the boundary
/// timestamp a resume query re-serves rows that were already emitted; those
/// are exactly the entries recorded in the initial offset's `seen` map, and
/// [`OffsetAccumulator::apply`] drops them.
#[derive(Debug)]
pub(crate) struct OffsetAccumulator {
    current_timestamp: DateTime<Utc>,
    current_seen: BTreeMap<String, i64>,
}

impl OffsetAccumulator {
    pub(crate) fn new(initial: TimestampOffset) -> Self {
        Self {
            current_timestamp: initial.timestamp,
            current_seen: initial.seen,
        }
    }

    /// Folds one row in; returns the cumulative offset to attach, or `None`
    /// when the row is a duplicate of something already emitted at the
    /// current timestamp.
    pub(crate) fn apply(&mut self, row: &Row) -> Option<TimestampOffset> {
        if row.db_timestamp == self.current_timestamp {
            if let Some(&seen_seq) = self.current_seen.get(&row.persistence_id) {
                if seen_seq >= row.seq_nr {
                    return None;
                }
            }
            self.current_seen
                .insert(row.persistence_id.clone(), row.seq_nr);
        } else {
            // Source ordering guarantees the timestamp only moves forward;
            // older `seen` entries can no longer be re-served by a resume
            // query, so the map restarts from the triggering row.
            self.current_timestamp = row.db_timestamp;
            self.current_seen.clear();
            self.current_seen
                .insert(row.persistence_id.clone(), row.seq_nr);
        }

        Some(TimestampOffset::new(
            row.db_timestamp,
            row.read_db_timestamp,
            self.current_seen.clone(),
        ))
    }
}

/// Wraps one sub-stream of rows into envelopes with cumulative offsets,
/// dropping rows already covered by `initial`.
pub(crate) fn deserialize_and_add_offset<F>(
    initial: TimestampOffset,
    factory: Arc<F>,
    rows: RowStream,
) -> EnvelopeStream<F::Envelope>
where
    F: EnvelopeFactory,
{
    let mut accumulator = OffsetAccumulator::new(initial);
    rows.try_filter_map(move |row| {
        let envelope = accumulator
            .apply(&row)
            .map(|offset| factory.create_envelope(offset, row));
        future::ok(envelope)
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use futures::stream;

    use super::*;
    use crate::source::RowEnvelopeFactory;

    fn ts(micros: i64) -> DateTime<Utc> {
        Utc.timestamp_micros(micros).unwrap()
    }

    fn row(persistence_id: &str, seq_nr: i64, micros: i64) -> Row {
        Row {
            entity_type: "TestEntity".to_string(),
            persistence_id: persistence_id.to_string(),
            slice: 0,
            seq_nr,
            db_timestamp: ts(micros),
            read_db_timestamp: ts(micros + 50),
            payload: Some(vec![1, 2, 3]),
            ser_id: 1,
            ser_manifest: String::new(),
        }
    }

    fn run_stage(initial: TimestampOffset, rows: Vec<Row>) -> Vec<(String, i64, TimestampOffset)> {
        let rows: RowStream = stream::iter(rows.into_iter().map(Ok)).boxed();
        let envelopes = futures::executor::block_on(
            deserialize_and_add_offset(initial, Arc::new(RowEnvelopeFactory), rows)
                .try_collect::<Vec<_>>(),
        )
        .unwrap();
        envelopes
            .into_iter()
            .map(|env| (env.row.persistence_id.clone(), env.row.seq_nr, env.offset))
            .collect()
    }

    #[test]
    fn drops_rows_recorded_in_the_initial_seen_map() {
        // Two rows share the boundary timestamp; A-1 was already emitted by
        // the previous sub-stream.
        let initial = TimestampOffset::new(
            ts(100),
            ts(100),
            BTreeMap::from([("A".to_string(), 1)]),
        );
        let emitted = run_stage(initial, vec![row("A", 1, 100), row("B", 1, 100)]);

        assert_eq!(emitted.len(), 1);
        let (pid, seq_nr, offset) = &emitted[0];
        assert_eq!(pid, "B");
        assert_eq!(*seq_nr, 1);
        assert_eq!(offset.timestamp, ts(100));
        assert_eq!(
            offset.seen,
            BTreeMap::from([("A".to_string(), 1), ("B".to_string(), 1)])
        );
    }

    #[test]
    fn timestamp_advance_resets_the_seen_map() {
        let emitted = run_stage(
            TimestampOffset::zero(),
            vec![row("A", 1, 100), row("A", 2, 101)],
        );

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].2.timestamp, ts(100));
        assert_eq!(emitted[0].2.seen, BTreeMap::from([("A".to_string(), 1)]));
        assert_eq!(emitted[1].2.timestamp, ts(101));
        assert_eq!(emitted[1].2.seen, BTreeMap::from([("A".to_string(), 2)]));
    }

    #[test]
    fn ties_accumulate_into_one_seen_map() {
        let emitted = run_stage(
            TimestampOffset::zero(),
            vec![row("A", 1, 100), row("B", 4, 100), row("C", 2, 100)],
        );

        assert_eq!(emitted.len(), 3);
        assert_eq!(
            emitted[2].2.seen,
            BTreeMap::from([
                ("A".to_string(), 1),
                ("B".to_string(), 4),
                ("C".to_string(), 2)
            ])
        );
    }

    #[test]
    fn lower_seq_nr_at_equal_timestamp_is_dropped() {
        let initial = TimestampOffset::new(
            ts(100),
            ts(100),
            BTreeMap::from([("A".to_string(), 5)]),
        );
        let emitted = run_stage(initial, vec![row("A", 4, 100), row("A", 6, 100)]);

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1, 6);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        /// Ordered input: rows sorted by `(db_timestamp, seq_nr)` with
        /// strictly increasing seq_nr per persistence id, as the row source
        /// contract guarantees.
        fn arb_ordered_rows() -> impl Strategy<Value = Vec<Row>> {
            prop::collection::vec((0u8..4, 100i64..110), 0..40).prop_map(|picks| {
                let mut next_seq: std::collections::HashMap<u8, i64> =
                    std::collections::HashMap::new();
                let mut rows: Vec<Row> = picks
                    .into_iter()
                    .map(|(pid, ts_micros)| {
                        let seq = next_seq.entry(pid).or_insert(0);
                        *seq += 1;
                        row(&format!("P{pid}"), *seq, ts_micros)
                    })
                    .collect();
                rows.sort_by(|a, b| {
                    (a.db_timestamp, a.seq_nr).cmp(&(b.db_timestamp, b.seq_nr))
                });
                // Reassign seq numbers in stream order so each pid is
                // strictly increasing even after the global sort.
                let mut counters: std::collections::HashMap<String, i64> =
                    std::collections::HashMap::new();
                for r in &mut rows {
                    let c = counters.entry(r.persistence_id.clone()).or_insert(0);
                    *c += 1;
                    r.seq_nr = *c;
                }
                rows
            })
        }

        proptest! {
            /// Offsets are non-decreasing in timestamp and seq numbers are
            /// strictly increasing per persistence id.
            #[test]
            fn emitted_offsets_are_monotonic(rows in arb_ordered_rows()) {
                let emitted = run_stage(TimestampOffset::zero(), rows);

                let mut last_ts = DateTime::UNIX_EPOCH;
                let mut last_seq: std::collections::HashMap<String, i64> =
                    std::collections::HashMap::new();
                for (pid, seq_nr, offset) in emitted {
                    prop_assert!(offset.timestamp >= last_ts);
                    last_ts = offset.timestamp;
                    if let Some(&prev) = last_seq.get(&pid) {
                        prop_assert!(seq_nr > prev, "{pid}: {seq_nr} after {prev}");
                    }
                    last_seq.insert(pid, seq_nr);
                }
            }

            /// Restarting from any emitted offset never re-emits a
            /// `(persistence_id, seq_nr)` pair.
            #[test]
            fn restart_from_offset_never_duplicates(
                rows in arb_ordered_rows(),
                cut in 0usize..40,
            ) {
                let all = run_stage(TimestampOffset::zero(), rows.clone());
                if all.is_empty() {
                    return Ok(());
                }
                let cut = cut % all.len();
                let resume_offset = all[cut].2.clone();

                // A resume query re-serves everything at or after the
                // offset timestamp.
                let replay: Vec<Row> = rows
                    .iter()
                    .filter(|r| r.db_timestamp >= resume_offset.timestamp)
                    .cloned()
                    .collect();
                let resumed = run_stage(resume_offset, replay);

                let before: std::collections::HashSet<(String, i64)> = all[..=cut]
                    .iter()
                    .map(|(pid, seq, _)| (pid.clone(), *seq))
                    .collect();
                let after: std::collections::HashSet<(String, i64)> = resumed
                    .iter()
                    .map(|(pid, seq, _)| (pid.clone(), *seq))
                    .collect();

                prop_assert!(
                    before.intersection(&after).next().is_none(),
                    "duplicates across restart: {:?}",
                    before.intersection(&after).collect::<Vec<_>>()
                );

                // And together they cover every source pair.
                let union: std::collections::HashSet<(String, i64)> =
                    before.union(&after).cloned().collect();
                let source: std::collections::HashSet<(String, i64)> = rows
                    .iter()
                    .map(|r| (r.persistence_id.clone(), r.seq_nr))
                    .collect();
                prop_assert_eq!(union, source);
            }
        }
    }
}
