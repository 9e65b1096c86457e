//! Error types for the peer side

use roomcast_protocol::{Direction, ErrorCode};
use thiserror::Error;

/// Failures of the local media device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Router capabilities have not been loaded yet
    #[error("Device not loaded")]
    NotLoaded,

    #[error("No local {0} transport")]
    NoTransport(Direction),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Errors of a signaling session
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The server answered a request with an `error` frame
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// A reply did not match the request it acknowledged
    #[error("Unexpected reply to request {ack}")]
    UnexpectedReply { ack: u64 },

    /// Connection was closed
    #[error("Signaling connection closed")]
    Closed,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
