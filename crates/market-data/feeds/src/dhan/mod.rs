//! Dhan twenty-level depth feed: binary codec, control messages, WebSocket

pub mod codec;
pub mod control;
pub mod websocket;

pub use codec::{DecodeError, DepthFrame, DepthPacket, DisconnectNotice, decode_frame, split_frames};
pub use control::{ControlMessage, InstrumentRef};
pub use websocket::{DhanConnection, DhanConnector};
