//! WebSocket connection to the Dhan twenty-depth server

use crate::common::adapter::{DepthConnection, DepthConnector};
use crate::config::{ConnectionConfig, redact};
use crate::dhan::control::ControlMessage;
use crate::error::FeedError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens authenticated depth connections
#[derive(Debug, Clone)]
pub struct DhanConnector {
    config: ConnectionConfig,
}

impl DhanConnector {
    /// Create a connector; credentials come from `config`
    #[must_use]
    pub const fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// Endpoint with credentials as query parameters
    ///
    /// # Errors
    /// [`FeedError::Config`] for an unparsable base URL
    pub fn endpoint(&self) -> Result<Url, FeedError> {
        let auth_type = self.config.auth_type.to_string();
        Url::parse_with_params(
            &self.config.url,
            &[
                ("token", self.config.access_token.as_str()),
                ("clientId", self.config.client_id.as_str()),
                ("authType", auth_type.as_str()),
            ],
        )
        .map_err(|e| FeedError::Config(format!("invalid depth url: {e}")))
    }
}

#[async_trait::async_trait]
impl DepthConnector for DhanConnector {
    async fn connect(&self) -> Result<Box<dyn DepthConnection>, FeedError> {
        let url = self.endpoint()?;
        info!(
            "Connecting to {} (client {}, token {})",
            self.config.url,
            self.config.client_id,
            redact(&self.config.access_token)
        );

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let handshake = tokio::time::timeout(timeout, connect_async(url.as_str())).await;
        let (stream, response) = match handshake {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("Depth WebSocket connection failed: {}", e);
                if let tokio_tungstenite::tungstenite::Error::Http(response) = &e {
                    error!("HTTP Status: {}", response.status());
                }
                return Err(FeedError::ConnectionLost(e.to_string()));
            }
            Err(_) => {
                error!("Depth WebSocket handshake timed out after {:?}", timeout);
                return Err(FeedError::ConnectionLost("handshake timed out".to_string()));
            }
        };

        info!("Depth WebSocket connected (status {})", response.status());
        Ok(Box::new(DhanConnection { stream }))
    }
}

/// Live depth WebSocket
pub struct DhanConnection {
    stream: WsStream,
}

#[async_trait::async_trait]
impl DepthConnection for DhanConnection {
    async fn send_control(&mut self, msg: &ControlMessage) -> Result<(), FeedError> {
        let text = msg
            .to_json()
            .map_err(|e| FeedError::UpstreamRejected(e.to_string()))?;
        debug!("Sending control message: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::UpstreamRejected(e.to_string()))
    }

    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FeedError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(data))) => {
                    if self.stream.send(Message::Pong(data)).await.is_err() {
                        error!("Failed to send pong");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    // Server errors arrive as text
                    warn!("Depth server message: {}", text);
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Depth WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    error!("Depth WebSocket error: {}", e);
                    return Err(FeedError::ConnectionLost(e.to_string()));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| FeedError::ConnectionLost(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_carries_credentials() -> Result<(), FeedError> {
        let connector = DhanConnector::new(ConnectionConfig {
            client_id: "1000000001".to_string(),
            access_token: "abc.def".to_string(),
            ..ConnectionConfig::default()
        });
        let url = connector.endpoint()?;
        assert_eq!(url.host_str(), Some("depth-api-feed.dhan.co"));
        assert_eq!(url.path(), "/twentydepth");
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            query,
            vec![
                ("token".to_string(), "abc.def".to_string()),
                ("clientId".to_string(), "1000000001".to_string()),
                ("authType".to_string(), "2".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_bad_url_is_config_error() {
        let connector = DhanConnector::new(ConnectionConfig {
            url: "not a url".to_string(),
            ..ConnectionConfig::default()
        });
        assert!(matches!(connector.endpoint(), Err(FeedError::Config(_))));
    }
}
