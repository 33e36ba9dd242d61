//! Error types for SonicLine session sync

use thiserror::Error;

/// Result type alias for SonicLine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sync engine and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (connect refused, link dropped, send failed)
    #[error("transport error: {0}")]
    Transport(String),

    /// Not connected to a session
    #[error("not connected")]
    NotConnected,

    /// Intent detector failure
    #[error("detector error: {0}")]
    Detector(String),

    /// Action dispatch failure reported by an external collaborator
    #[error("action failed: {0}")]
    Action(String),

    /// No handler registered for an action kind
    #[error("no handler registered for action: {0}")]
    NoHandler(String),

    /// Agent backend error
    #[error("agent error: {0}")]
    Agent(String),

    /// Malformed inbound payload
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
