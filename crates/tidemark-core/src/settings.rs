//! Tuning knobs for by-slice queries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Settings shared by the current and live query modes.
///
/// Defaults are sized for a journal written at interactive rates against a
/// relational store with sub-second commit visibility. `behind_current_time`
/// keeps primary reads behind the write-side clock so rows from transactions
/// that committed but are not yet visible to the reader are not skipped
/// over; the backtracking horizon and window bound the second-chance scan
/// that recovers rows missed despite that margin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Maximum rows returned by one sub-query.
    pub buffer_size: usize,
    /// Base poll interval while the tail is idle.
    pub refresh_interval: Duration,
    /// Read horizon for primary queries: rows newer than `now - this` are
    /// left for the next poll.
    pub behind_current_time: Duration,
    /// Whether the backtracking scan runs at all.
    pub backtracking_enabled: bool,
    /// Read horizon for backtracking queries; larger than the primary
    /// horizon so late-visible rows have settled by the time they are
    /// re-read.
    pub backtracking_behind_current_time: Duration,
    /// Temporal span re-scanned by backtracking.
    pub backtracking_window: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            refresh_interval: Duration::from_secs(3),
            behind_current_time: Duration::from_millis(100),
            backtracking_enabled: true,
            backtracking_behind_current_time: Duration::from_secs(10),
            backtracking_window: Duration::from_secs(120),
        }
    }
}

impl QuerySettings {
    /// Creates settings with the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-query buffer size.
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the primary read horizon.
    #[must_use]
    pub const fn with_behind_current_time(mut self, behind: Duration) -> Self {
        self.behind_current_time = behind;
        self
    }

    /// Enables or disables backtracking.
    #[must_use]
    pub const fn with_backtracking_enabled(mut self, enabled: bool) -> Self {
        self.backtracking_enabled = enabled;
        self
    }

    /// Sets the backtracking read horizon.
    #[must_use]
    pub const fn with_backtracking_behind_current_time(mut self, behind: Duration) -> Self {
        self.backtracking_behind_current_time = behind;
        self
    }

    /// Sets the backtracking window.
    #[must_use]
    pub const fn with_backtracking_window(mut self, window: Duration) -> Self {
        self.backtracking_window = window;
        self
    }

    /// Half of the backtracking window; when the primary cursor runs this
    /// far ahead of the backtracking cursor, backtracking is scheduled
    /// regardless of idleness.
    #[must_use]
    pub fn half_backtracking_window(&self) -> Duration {
        self.backtracking_window / 2
    }

    /// Span of the very first backtracking query: the full window plus the
    /// backtracking horizon, so it covers every row the primary pipeline
    /// could have passed over.
    #[must_use]
    pub fn first_backtracking_query_window(&self) -> Duration {
        self.backtracking_window + self.backtracking_behind_current_time
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidSettings`] when `buffer_size` is zero or
    /// backtracking is enabled with an empty window.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.buffer_size == 0 {
            return Err(QueryError::InvalidSettings {
                reason: "buffer_size must be greater than zero".to_string(),
            });
        }
        if self.backtracking_enabled && self.backtracking_window.is_zero() {
            return Err(QueryError::InvalidSettings {
                reason: "backtracking_window must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
