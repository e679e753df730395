use chrono::{DateTime, Utc};
use std::time::Duration;

/// Interval returned while the primary market is open or in pre-market.
pub const PRIMARY_MARKET_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Interval returned while only secondary markets are open.
pub const SECONDARY_MARKET_SYNC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Maps wall-clock time to a recommended broker-sync interval.
///
/// `Duration::ZERO` means every relevant market is closed and the sync
/// should be skipped.
pub trait MarketStateDetector: Send + Sync {
    fn sync_interval(&self, now: DateTime<Utc>) -> Duration;
}

/// Detector that always recommends the same interval.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntervalDetector {
    interval: Duration,
}

impl FixedIntervalDetector {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl MarketStateDetector for FixedIntervalDetector {
    fn sync_interval(&self, _now: DateTime<Utc>) -> Duration {
        self.interval
    }
}

impl<F> MarketStateDetector for F
where
    F: Fn(DateTime<Utc>) -> Duration + Send + Sync,
{
    fn sync_interval(&self, now: DateTime<Utc>) -> Duration {
        self(now)
    }
}
