//! Common types for the twenty-depth feed core

#![deny(clippy::all)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod depth;
pub mod types;

pub use depth::{DEPTH_LEVELS, DepthLevel, SideDepth, Snapshot, StaleMarker, StaleReason, Subscription};
pub use types::{ExchangeSegment, InstrumentId, Px, Side, Ts, UnknownSegment};
