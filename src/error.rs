use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a transport while connecting or moving frames.
///
/// These never reach callers of `send`/`subscribe`; the connection task logs
/// them and takes the reconnect path.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match value {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no tokio runtime: {0}")]
    Runtime(String),
    #[error("connection task is not running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
