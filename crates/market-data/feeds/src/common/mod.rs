//! Transport components shared by every depth source

pub mod adapter;
pub mod health;
pub mod manager;
pub mod pairing;
pub mod state;

pub use adapter::{DepthConnection, DepthConnector};
pub use health::{ErrorBudget, FeedMetrics, IngestLimiter, MetricsSnapshot};
pub use manager::DepthFeed;
pub use pairing::{PairedDepth, PairingBuffer, Throttle, ThrottleDecision};
pub use state::{Backoff, FeedState, Outage, StateMachine};
