//! Transport errors

use std::time::Duration;
use thiserror::Error;

/// Errors raised by request/reply and fan-out transports
#[derive(Error, Debug)]
pub enum BusError {
    #[error("request to {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
