//! Connection state machine and reconnect backoff

use common::{StaleMarker, StaleReason, Ts};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeedState {
    /// No connection and none being attempted
    Disconnected,
    /// Opening the connection
    Connecting,
    /// Connected, replaying subscriptions
    Subscribing,
    /// Frames flowing
    Streaming,
    /// Connection lost, waiting to retry
    Degraded,
}

impl FeedState {
    /// Legal successor states
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use FeedState::{Connecting, Degraded, Disconnected, Streaming, Subscribing};
        matches!(
            (self, next),
            (Disconnected | Degraded, Connecting)
                | (Connecting, Subscribing)
                | (Subscribing, Streaming)
                | (Connecting | Subscribing | Streaming, Degraded)
                | (_, Disconnected)
        )
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Owner side of the published feed state
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<FeedState>,
}

impl StateMachine {
    /// Start in `Disconnected`; the receiver observes every transition
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<FeedState>) {
        let (tx, rx) = watch::channel(FeedState::Disconnected);
        (Self { tx }, rx)
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> FeedState {
        *self.tx.borrow()
    }

    /// Move to `next`, logging the edge
    pub fn transition(&self, next: FeedState) {
        let current = self.current();
        if current == next {
            return;
        }
        if current.can_transition_to(next) {
            info!("Depth feed {} -> {}", current, next);
        } else {
            warn!("Unexpected depth feed transition {} -> {}", current, next);
        }
        self.tx.send_replace(next);
    }
}

/// Exponential reconnect delay with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Delays start at `initial`, double per attempt and stop at `max`;
    /// each is scaled by a random factor in `1 ± jitter`
    #[must_use]
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.checked_mul(2).unwrap_or(self.max).min(self.max);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// Attempts since the last reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

/// Tracks the gap between losing and regaining the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outage {
    /// When streaming stopped
    pub started: Ts,
    /// What stopped it
    pub reason: StaleReason,
}

impl Outage {
    /// Begin an outage now
    #[must_use]
    pub fn begin(reason: StaleReason) -> Self {
        Self {
            started: Ts::now(),
            reason,
        }
    }

    /// Marker for snapshots after the stream came back at `restored_at`
    #[must_use]
    pub const fn marker(&self, restored_at: Ts) -> StaleMarker {
        StaleMarker {
            outage_started: self.started,
            restored_at,
            reason: self.reason,
        }
    }
}
