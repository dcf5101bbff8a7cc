//! Reaper configuration.

use crate::storage::Isolation;
use std::time::Duration;

/// Default time between reaper ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default backoff between attempts to open the expiry index.
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Default number of candidates one scan transaction may process.
pub const DEFAULT_BATCH_CAP: usize = 1000;

/// Configuration for the expiry reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Interval between ticks (default: 1s)
    pub tick_interval: Duration,

    /// Fixed backoff while the expiry index cannot be opened (default: 1s)
    pub open_backoff: Duration,

    /// Candidates processed per scan transaction before it is committed and
    /// a fresh cursor started (default: 1000)
    pub batch_cap: usize,

    /// Isolation of the outer cursor transaction (default: read uncommitted).
    /// The validate-and-delete step always locks what it modifies.
    pub cursor_isolation: Isolation,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            open_backoff: DEFAULT_OPEN_BACKOFF,
            batch_cap: DEFAULT_BATCH_CAP,
            cursor_isolation: Isolation::ReadUncommitted,
        }
    }
}

impl ReaperConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_open_backoff(mut self, backoff: Duration) -> Self {
        self.open_backoff = backoff;
        self
    }

    /// Sets the batch cap. A cap of zero is raised to one so a cycle can
    /// always make progress.
    pub fn with_batch_cap(mut self, cap: usize) -> Self {
        self.batch_cap = cap.max(1);
        self
    }

    pub fn with_cursor_isolation(mut self, isolation: Isolation) -> Self {
        self.cursor_isolation = isolation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaperConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.batch_cap, 1000);
        assert_eq!(config.cursor_isolation, Isolation::ReadUncommitted);
    }

    #[test]
    fn test_batch_cap_floor() {
        assert_eq!(ReaperConfig::default().with_batch_cap(0).batch_cap, 1);
        assert_eq!(ReaperConfig::default().with_batch_cap(7).batch_cap, 7);
    }
}
