//! Connection seam between the ingest loop and the upstream server

use crate::dhan::control::ControlMessage;
use crate::error::FeedError;

/// One live connection to the depth server
#[async_trait::async_trait]
pub trait DepthConnection: Send {
    /// Deliver a control message
    async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), FeedError>;

    /// Next binary message; `None` once the peer closed the connection.
    ///
    /// Must be cancel safe: it is polled inside `tokio::select!`.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FeedError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

/// Opens connections; called again on every reconnect
#[async_trait::async_trait]
pub trait DepthConnector: Send + Sync {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn DepthConnection>, FeedError>;
}
