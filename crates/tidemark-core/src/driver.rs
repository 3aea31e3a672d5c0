//! Generic continuous query driver.
//!
//! Concatenates successive query sub-streams into one long stream, folding
//! every emitted envelope through a state transition and optionally pacing
//! between sub-queries. The driver is polymorphic over the state and the
//! three closures; the by-slice modes are just different closure bundles.
//!
//! The output stream is demand-driven: nothing is queried, slept, or pulled
//! unless the consumer polls. Dropping the stream drops any in-flight timer
//! or sub-stream poll, which releases the source's resources and guarantees
//! no further sub-queries are issued.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::QueryError;

/// Adaptive delay before the next sub-query.
///
/// A full page means more rows are likely waiting, so poll immediately. An
/// empty page means the tail is idle, so back off the full refresh
/// interval. A partially filled page polls at half interval.
#[must_use]
pub fn adjust_next_delay(
    row_count: usize,
    buffer_size: usize,
    refresh_interval: Duration,
) -> Option<Duration> {
    if row_count >= buffer_size {
        None
    } else if row_count == 0 {
        Some(refresh_interval)
    } else {
        Some(refresh_interval / 2)
    }
}

struct Drive<S, E, U, D, N> {
    state: Option<S>,
    sub: Option<BoxStream<'static, Result<E, QueryError>>>,
    update_state: U,
    delay_next_query: D,
    next_query: N,
}

/// Runs the continuous query loop.
///
/// Starting from `initial_state`, the driver repeatedly waits out
/// `delay_next_query`, asks `next_query` for the next sub-stream (completing
/// the output when it returns `None`), and splices the sub-stream into the
/// output while folding each emitted envelope through `update_state`. A
/// sub-stream that ends merely signals an exhausted page; errors from a
/// sub-stream or from `update_state` terminate the output.
pub fn continuous_query<S, E, U, D, N>(
    initial_state: S,
    update_state: U,
    delay_next_query: D,
    next_query: N,
) -> BoxStream<'static, Result<E, QueryError>>
where
    S: Send + 'static,
    E: Send + 'static,
    U: FnMut(S, &E) -> Result<S, QueryError> + Send + 'static,
    D: Fn(&S) -> Option<Duration> + Send + 'static,
    N: FnMut(S) -> (S, Option<BoxStream<'static, Result<E, QueryError>>>) + Send + 'static,
{
    let drive = Drive {
        state: Some(initial_state),
        sub: None,
        update_state,
        delay_next_query,
        next_query,
    };

    stream::try_unfold(drive, |mut drive| async move {
        loop {
            if let Some(sub) = drive.sub.as_mut() {
                match sub.try_next().await? {
                    Some(envelope) => {
                        let Some(state) = drive.state.take() else {
                            return Ok(None);
                        };
                        drive.state = Some((drive.update_state)(state, &envelope)?);
                        return Ok(Some((envelope, drive)));
                    }
                    None => drive.sub = None,
                }
            } else {
                let Some(state) = drive.state.take() else {
                    return Ok(None);
                };
                if let Some(delay) = (drive.delay_next_query)(&state) {
                    tokio::time::sleep(delay).await;
                }
                let (state, sub) = (drive.next_query)(state);
                drive.state = Some(state);
                match sub {
                    Some(sub) => drive.sub = Some(sub),
                    None => return Ok(None),
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn pages_source(
        pages: Vec<Vec<u32>>,
    ) -> impl FnMut(u64) -> Option<BoxStream<'static, Result<u32, QueryError>>> {
        let mut pages: VecDeque<Vec<u32>> = pages.into();
        move |_count| {
            pages
                .pop_front()
                .map(|page| stream::iter(page.into_iter().map(Ok)).boxed())
        }
    }

    #[tokio::test]
    async fn concatenates_sub_streams_and_folds_state() {
        let folded = Arc::new(Mutex::new(Vec::new()));
        let folded_in_update = Arc::clone(&folded);
        let mut source = pages_source(vec![vec![1, 2], vec![], vec![3]]);

        let out: Vec<u32> = continuous_query(
            0u64,
            move |state, item: &u32| {
                folded_in_update.lock().unwrap().push(*item);
                Ok(state + 1)
            },
            |_| None,
            move |queries: u64| {
                let sub = source(queries);
                (queries + 1, sub)
            },
        )
        .try_collect()
        .await
        .unwrap();

        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(*folded.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn completes_when_next_query_returns_none() {
        let out: Vec<u32> = continuous_query(
            (),
            |(), _item: &u32| Ok(()),
            |_| None,
            |()| ((), None),
        )
        .try_collect()
        .await
        .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn update_state_errors_terminate_the_stream() {
        let mut source = pages_source(vec![vec![1, 2, 3]]);
        let mut collected = Vec::new();
        let mut stream = continuous_query(
            (),
            |(), item: &u32| {
                if *item == 2 {
                    Err(QueryError::ClockUnavailable)
                } else {
                    Ok(())
                }
            },
            |_| None,
            move |()| ((), source(0)),
        );

        while let Some(next) = stream.next().await {
            match next {
                Ok(item) => collected.push(item),
                Err(err) => {
                    assert!(matches!(err, QueryError::ClockUnavailable));
                    break;
                }
            }
        }
        assert_eq!(collected, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_applied_before_each_sub_query() {
        let delays = Arc::new(Mutex::new(0u32));
        let observed = Arc::clone(&delays);
        let mut source = pages_source(vec![vec![1], vec![2]]);

        let before = tokio::time::Instant::now();
        let out: Vec<u32> = continuous_query(
            0u64,
            |state, _item| Ok(state),
            move |_state| {
                *observed.lock().unwrap() += 1;
                Some(Duration::from_millis(100))
            },
            move |queries: u64| {
                let sub = source(queries);
                (queries + 1, sub)
            },
        )
        .try_collect()
        .await
        .unwrap();

        assert_eq!(out, vec![1, 2]);
        // Three next_query calls (two pages plus the terminating one), each
        // preceded by the delay.
        assert_eq!(*delays.lock().unwrap(), 3);
        assert!(tokio::time::Instant::now() - before >= Duration::from_millis(300));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// The adaptive-delay law: None when full, the refresh interval
            /// when idle, half otherwise.
            #[test]
            fn adaptive_delay_law(
                row_count in 0usize..2048,
                buffer_size in 1usize..1024,
                refresh_ms in 1u64..60_000,
            ) {
                let refresh = Duration::from_millis(refresh_ms);
                let delay = adjust_next_delay(row_count, buffer_size, refresh);
                if row_count >= buffer_size {
                    prop_assert_eq!(delay, None);
                } else if row_count == 0 {
                    prop_assert_eq!(delay, Some(refresh));
                } else {
                    prop_assert_eq!(delay, Some(refresh / 2));
                }
            }
        }
    }
}
