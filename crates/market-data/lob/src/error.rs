//! Depth state errors

use common::InstrumentId;
use thiserror::Error;

/// Errors raised by the depth store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DepthError {
    /// Instrument has no active subscription
    #[error("instrument {0} is not subscribed")]
    NotSubscribed(InstrumentId),

    /// Subscribed but no snapshot has been assembled yet
    #[error("no depth received yet for instrument {0}")]
    NoDataYet(InstrumentId),

    /// Subscription table is full
    #[error("subscription limit of {limit} reached")]
    CapacityExceeded {
        /// Configured maximum
        limit: usize,
    },
}
