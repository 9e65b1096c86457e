//! Error types for the signaling server

use roomcast_protocol::{ErrorCode, ProducerId};
use thiserror::Error;

/// Errors that can occur while handling a signaling request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The room's routing context could not be created
    #[error("Room unavailable: {0}")]
    RoomUnavailable(EngineError),

    /// The peer has no session, either because it never joined or because it
    /// disconnected while the request was in flight
    #[error("Peer has not joined a room")]
    NotJoined,

    /// Join sent twice on one connection
    #[error("Peer already joined a room")]
    AlreadyJoined,

    /// The request needs a transport the peer has not created
    #[error("No {0} transport for this peer")]
    TransportNotFound(roomcast_protocol::Direction),

    /// Each peer owns at most one transport per direction
    #[error("A {0} transport already exists for this peer")]
    TransportAlreadyExists(roomcast_protocol::Direction),

    /// Produce before the DTLS handshake of the send transport completed
    #[error("The send transport is not connected")]
    TransportNotConnected,

    /// Each peer produces at most one stream
    #[error("Peer is already producing")]
    ProducerAlreadyExists,

    /// The routing context refused the offered capabilities
    #[error("Capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Consumption asked for a peer that is not producing (yet)
    #[error("Remote peer has no producer")]
    ProducerAbsent,

    /// Unknown peer
    #[error("Unknown peer")]
    UnknownPeer,

    /// The media engine rejected the call
    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SignalingError {
    /// The code reported to the peer in an `error` frame
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalingError::RoomUnavailable(_) => ErrorCode::RoomUnavailable,
            SignalingError::NotJoined | SignalingError::UnknownPeer => ErrorCode::NotJoined,
            SignalingError::AlreadyJoined => ErrorCode::AlreadyJoined,
            SignalingError::TransportNotFound(_) => ErrorCode::TransportNotFound,
            SignalingError::TransportAlreadyExists(_) => ErrorCode::TransportAlreadyExists,
            SignalingError::TransportNotConnected => ErrorCode::TransportNotConnected,
            SignalingError::ProducerAlreadyExists => ErrorCode::ProducerAlreadyExists,
            SignalingError::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            SignalingError::ProducerAbsent => ErrorCode::ProducerAbsent,
            SignalingError::Engine(_) => ErrorCode::EngineFailure,
        }
    }

    /// Whether the peer should be told about this failure at all
    ///
    /// A consume that cannot be served gets no answer; the peer simply
    /// receives no media from that producer.
    pub fn is_reported(&self) -> bool {
        !matches!(
            self,
            SignalingError::ProducerAbsent | SignalingError::IncompatibleCapabilities(_)
        )
    }
}

/// Failures of the media engine facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The handle (router, transport, producer or consumer) was closed
    #[error("Handle closed")]
    Closed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("No free RTC port in {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Unknown producer {0}")]
    UnknownProducer(ProducerId),

    #[error("Transport already connected")]
    AlreadyConnected,
}

/// Errors from client requests
#[derive(Error, Debug)]
pub enum ClientRequestError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported message type
    #[error("Unsupported message type")]
    UnsupportedType,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
