//! Error types for the tunnel client.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Relay rejected the handshake: proxy name is already in use")]
    NameInUse,

    #[error("Failed to connect to relay: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("Local service at {base} is not running or unreachable: {source}")]
    LocalService {
        base: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error(transparent)]
    Protocol(#[from] dotunnel_shared::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether a new handshake may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Handshake(_))
    }
}
