//! Twenty-level market depth feed
//!
//! Organized structure:
//! - dhan/: binary depth codec, JSON control messages, WebSocket connector
//! - common/: transport pieces shared by any depth source (pairing,
//!   throttling, health, state machine) and the [`DepthFeed`] context
//! - config: layered file/environment configuration

#![deny(clippy::all)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Exchange-specific modules
pub mod dhan;

// Common components
pub mod common;
pub mod config;
pub mod error;

pub use common::adapter::{DepthConnection, DepthConnector};
pub use common::health::MetricsSnapshot;
pub use common::manager::DepthFeed;
pub use common::state::FeedState;
pub use config::{ConnectionConfig, DepthFeedConfig, TransportConfig};
pub use error::FeedError;

// Dhan exports
pub use dhan::codec::{DepthFrame, DepthPacket, decode_frame};
pub use dhan::control::ControlMessage;
pub use dhan::websocket::DhanConnector;
