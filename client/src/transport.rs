//! Relay transport.
//!
//! The session only sees a [`Transport`]: a frame sink and a frame stream.
//! [`WsConnector`] produces one from a real WebSocket handshake; tests swap in
//! an in-memory connector.

use std::future::Future;
use std::pin::Pin;

use dotunnel_shared::protocol::CLIENT_HEADER;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{HeaderValue, StatusCode},
    Error as WsError, Message,
};
use tracing::debug;

use crate::error::TunnelError;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An open duplex connection to the relay
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

pub trait Connector: Send + Sync {
    /// Perform the handshake against `url`
    fn connect(&self, url: &str) -> impl Future<Output = Result<Transport, TunnelError>> + Send;
}

/// WebSocket connector over tokio-tungstenite
pub struct WsConnector {
    client_id: String,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            client_id: format!("dotunnel/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TunnelError> {
        let mut request = url.into_client_request().map_err(TunnelError::Handshake)?;
        let client_id = HeaderValue::from_str(&self.client_id)
            .map_err(|e| TunnelError::Config(format!("client header: {}", e)))?;
        request.headers_mut().insert(CLIENT_HEADER, client_id);

        debug!("Opening relay connection: {}", url);

        match connect_async(request).await {
            Ok((ws_stream, _)) => {
                let (sink, stream) = ws_stream.split();
                Ok(Transport {
                    sink: Box::pin(sink),
                    stream: Box::pin(stream),
                })
            }
            Err(WsError::Http(response)) if response.status() == StatusCode::CONFLICT => {
                Err(TunnelError::NameInUse)
            }
            Err(e) => Err(TunnelError::Handshake(e)),
        }
    }
}
