//! Feed errors

use crate::dhan::codec::DecodeError;
use common::{ExchangeSegment, InstrumentId};
use lob::DepthError;
use thiserror::Error;

/// Errors surfaced by the depth feed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Frame failed to decode
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] DecodeError),

    /// Subscription table is full
    #[error("subscription limit of {limit} reached")]
    CapacityExceeded {
        /// Configured maximum
        limit: usize,
    },

    /// Instrument has no active subscription
    #[error("instrument {0} is not subscribed")]
    NotSubscribed(InstrumentId),

    /// Subscribed but nothing received yet
    #[error("no depth received yet for instrument {0}")]
    NoDataYet(InstrumentId),

    /// Upstream connection dropped or could not be opened
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Server refused a control message or it could not be delivered
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// Segment does not publish twenty-level depth
    #[error("segment {0} has no twenty-level depth")]
    UnsupportedSegment(ExchangeSegment),

    /// Ingest task is gone
    #[error("feed transport closed")]
    TransportClosed,

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<DepthError> for FeedError {
    fn from(err: DepthError) -> Self {
        match err {
            DepthError::NotSubscribed(id) => Self::NotSubscribed(id),
            DepthError::NoDataYet(id) => Self::NoDataYet(id),
            DepthError::CapacityExceeded { limit } => Self::CapacityExceeded { limit },
        }
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Feed result alias
pub type Result<T> = std::result::Result<T, FeedError>;
