//! Suspend-all pause statistics

use std::{fmt, time::Duration};

use parking_lot::Mutex;

/// Accumulated timings of suspend-all pauses.
#[derive(Debug, Default)]
pub struct SuspendStats {
    inner: Mutex<SuspendStatsSnapshot>,
}

/// Point-in-time copy of [`SuspendStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendStatsSnapshot {
    /// Completed suspend-all/resume-all pairs.
    pub pauses: u64,
    pub total_pause: Duration,
    pub max_pause: Duration,
    pub last_pause: Duration,
    /// Time controllers spent waiting for threads to leave `Running`.
    pub ack_waits: u64,
    pub total_ack_wait: Duration,
    pub max_ack_wait: Duration,
}

impl SuspendStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pause(&self, pause: Duration) {
        let mut stats = self.inner.lock();
        stats.pauses += 1;
        stats.total_pause += pause;
        stats.max_pause = stats.max_pause.max(pause);
        stats.last_pause = pause;
    }

    pub fn record_ack_wait(&self, wait: Duration) {
        let mut stats = self.inner.lock();
        stats.ack_waits += 1;
        stats.total_ack_wait += wait;
        stats.max_ack_wait = stats.max_ack_wait.max(wait);
    }

    pub fn snapshot(&self) -> SuspendStatsSnapshot {
        *self.inner.lock()
    }

    pub fn reset(&self) {
        *self.inner.lock() = SuspendStatsSnapshot::default();
    }
}

impl SuspendStatsSnapshot {
    pub fn mean_pause(&self) -> Duration {
        if self.pauses == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.total_pause.as_nanos() / u128::from(self.pauses)) as u64)
    }
}

impl fmt::Display for SuspendStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "suspend all histogram: {} pauses, mean {:?}, max {:?}, last {:?}; ack waits: {}, total {:?}, max {:?}",
            self.pauses,
            self.mean_pause(),
            self.max_pause,
            self.last_pause,
            self.ack_waits,
            self.total_ack_wait,
            self.max_ack_wait
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_pause_summary() {
        let stats = SuspendStats::new();
        stats.record_pause(Duration::from_millis(4));
        stats.record_pause(Duration::from_millis(10));
        stats.record_pause(Duration::from_millis(1));
        stats.record_ack_wait(Duration::from_millis(3));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pauses, 3);
        assert_eq!(snapshot.total_pause, Duration::from_millis(15));
        assert_eq!(snapshot.max_pause, Duration::from_millis(10));
        assert_eq!(snapshot.last_pause, Duration::from_millis(1));
        assert_eq!(snapshot.mean_pause(), Duration::from_millis(5));
        assert_eq!(snapshot.ack_waits, 1);
        assert!(snapshot.to_string().starts_with("suspend all histogram: 3 pauses"));
    }

    #[test]
    fn reset_clears_everything() {
        let stats = SuspendStats::new();
        stats.record_pause(Duration::from_millis(2));
        stats.reset();
        assert_eq!(stats.snapshot(), SuspendStatsSnapshot::default());
        assert_eq!(stats.snapshot().mean_pause(), Duration::ZERO);
    }

    #[test]
    fn mean_pause_handles_counts_past_u32() {
        let snapshot = SuspendStatsSnapshot {
            pauses: u64::from(u32::MAX) + 1,
            total_pause: Duration::from_secs(1 << 32),
            ..SuspendStatsSnapshot::default()
        };
        assert_eq!(snapshot.mean_pause(), Duration::from_secs(1));

        let uneven = SuspendStatsSnapshot {
            pauses: 3,
            total_pause: Duration::from_nanos(10),
            ..SuspendStatsSnapshot::default()
        };
        assert_eq!(uneven.mean_pause(), Duration::from_nanos(3));
    }
}
