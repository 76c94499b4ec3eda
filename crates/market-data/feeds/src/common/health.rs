//! Connection health: malformed-frame budget, ingest rate limit, counters

use chrono::{DateTime, Utc};
use common::Ts;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Rolling count of malformed frames.
///
/// Exhausted once more than `limit` errors fall inside `window`.
#[derive(Debug)]
pub struct ErrorBudget {
    limit: usize,
    window: Duration,
    errors: VecDeque<Instant>,
}

impl ErrorBudget {
    /// Create a budget
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            errors: VecDeque::with_capacity(limit + 1),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.errors.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an error; true when the budget is now exhausted
    pub fn record(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.errors.push_back(now);
        self.errors.len() > self.limit
    }

    /// Errors inside the window
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.errors.len()
    }

    /// Start over, as after a reconnect
    pub fn reset(&mut self) {
        self.errors.clear();
    }
}

/// Token bucket over processed frames; excess frames are dropped
pub struct IngestLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl IngestLimiter {
    /// Allow `per_second` frames per second with an equal burst
    #[must_use]
    pub fn new(per_second: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    /// Take a token if one is available
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for IngestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestLimiter").finish_non_exhaustive()
    }
}

/// Lock-free feed counters
#[derive(Debug, Default)]
pub struct FeedMetrics {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    frames_malformed: AtomicU64,
    frames_rate_limited: AtomicU64,
    snapshots_emitted: AtomicU64,
    snapshots_throttled: AtomicU64,
    forced_pairings: AtomicU64,
    reconnects: AtomicU64,
    disconnect_notices: AtomicU64,
    last_frame_nanos: AtomicU64,
}

/// Point-in-time copy of [`FeedMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Frames taken off the connection
    pub frames_received: u64,
    /// Frames decoded successfully
    pub frames_decoded: u64,
    /// Frames rejected by the decoder
    pub frames_malformed: u64,
    /// Frames dropped by the ingest rate limit
    pub frames_rate_limited: u64,
    /// Snapshots written to the store
    pub snapshots_emitted: u64,
    /// Snapshots held back by the throttle
    pub snapshots_throttled: u64,
    /// Pairs emitted on window expiry
    pub forced_pairings: u64,
    /// Successful reconnections
    pub reconnects: u64,
    /// Server disconnect notices
    pub disconnect_notices: u64,
    /// Snapshots accepted by the store
    pub snapshots_stored: u64,
    /// Watcher deliveries dropped for full queues
    pub watcher_drops: u64,
    /// Arrival of the latest frame
    pub last_frame_at: Option<DateTime<Utc>>,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`")]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl FeedMetrics {
    counter! {
        frame_decoded => frames_decoded,
        frame_malformed => frames_malformed,
        frame_rate_limited => frames_rate_limited,
        snapshot_emitted => snapshots_emitted,
        snapshot_throttled => snapshots_throttled,
        forced_pairing => forced_pairings,
        reconnected => reconnects,
        disconnect_notice => disconnect_notices,
    }

    /// Count an incoming frame and stamp its arrival
    pub fn frame_received(&self, at: Ts) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_frame_nanos.store(at.as_nanos(), Ordering::Relaxed);
    }

    /// Copy the counters; `stored` and `watcher_drops` come from the store
    #[must_use]
    pub fn snapshot(&self, stored: u64, watcher_drops: u64) -> MetricsSnapshot {
        let last = self.last_frame_nanos.load(Ordering::Relaxed);
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_rate_limited: self.frames_rate_limited.load(Ordering::Relaxed),
            snapshots_emitted: self.snapshots_emitted.load(Ordering::Relaxed),
            snapshots_throttled: self.snapshots_throttled.load(Ordering::Relaxed),
            forced_pairings: self.forced_pairings.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            disconnect_notices: self.disconnect_notices.load(Ordering::Relaxed),
            snapshots_stored: stored,
            watcher_drops,
            last_frame_at: i64::try_from(last)
                .ok()
                .filter(|n| *n > 0)
                .map(DateTime::from_timestamp_nanos),
        }
    }
}

impl MetricsSnapshot {
    /// Write the counters to the log
    pub fn log(&self) {
        info!("Depth feed metrics:");
        info!(
            "  Frames: {} received, {} decoded, {} malformed, {} rate limited",
            self.frames_received, self.frames_decoded, self.frames_malformed, self.frames_rate_limited
        );
        info!(
            "  Snapshots: {} emitted, {} stored, {} throttled, {} forced pairings",
            self.snapshots_emitted, self.snapshots_stored, self.snapshots_throttled, self.forced_pairings
        );
        info!(
            "  Connection: {} reconnects, {} disconnect notices, {} watcher drops",
            self.reconnects, self.disconnect_notices, self.watcher_drops
        );
        if let Some(last) = self.last_frame_at {
            info!("  Last frame: {}", last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_after_limit() {
        let mut budget = ErrorBudget::new(10, Duration::from_secs(300));
        let t0 = Instant::now();
        for i in 0..10 {
            assert!(!budget.record(t0 + Duration::from_secs(i)));
        }
        assert!(budget.record(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_budget_window_rolls() {
        let mut budget = ErrorBudget::new(10, Duration::from_secs(300));
        let t0 = Instant::now();
        for _ in 0..10 {
            budget.record(t0);
        }
        // Five minutes later the early errors have aged out
        let later = t0 + Duration::from_secs(301);
        assert!(!budget.record(later));
        assert_eq!(budget.count(later), 1);

        budget.reset();
        assert_eq!(budget.count(later), 0);
    }

    #[test]
    fn test_limiter_drops_past_burst() {
        let limiter = IngestLimiter::new(NonZeroU32::MIN.saturating_add(4));
        let allowed = (0..20).filter(|_| limiter.allow()).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = FeedMetrics::default();
        metrics.frame_received(Ts::from_nanos(1_700_000_000_000_000_000));
        metrics.frame_decoded();
        metrics.forced_pairing();
        let snap = metrics.snapshot(2, 3);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.frames_decoded, 1);
        assert_eq!(snap.forced_pairings, 1);
        assert_eq!(snap.snapshots_stored, 2);
        assert_eq!(snap.watcher_drops, 3);
        assert!(snap.last_frame_at.is_some());
        assert_eq!(FeedMetrics::default().snapshot(0, 0).last_frame_at, None);
    }
}
