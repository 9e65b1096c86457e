//! Wire types for the roomcast signaling protocol
//!
//! Peers talk to the signaling server over a single WebSocket carrying JSON
//! text frames. Every frame is a flat object tagged by an `event` field.
//!
//! ## Requests (peer → server)
//!
//! - `{"event": "join-room", "roomId": "r1"}`
//! - `{"event": "create-transport", "sender": true, "ack": 1}`
//! - `{"event": "connect-producer-transport", "dtlsParameters": {...}, "ack": 2}`
//! - `{"event": "connect-consumer-transport", "dtlsParameters": {...}, "ack": 3}`
//! - `{"event": "transport-produce", "kind": "video", "rtpParameters": {...}, "ack": 4}`
//! - `{"event": "consume-media", "rtpCapabilities": {...}, "fromUserId": "<uuid>", "ack": 5}`
//! - `{"event": "consume-resume", "ack": 6}`
//!
//! The optional `ack` is echoed back in the matching `response` or `error`
//! frame so a peer can correlate replies with requests.
//!
//! ## Events (server → peer)
//!
//! - `router-capabilities`, `join-room`, `existing-users-list`,
//!   `new-producer-transport-connected`, `peer-left`
//! - `response` and `error`, carrying the request's `ack`

#![forbid(unsafe_code)]

mod ids;
mod message;
mod rtp;

pub use ids::{ConsumerId, PeerId, ProducerId, RouterId, TransportId};
pub use message::{ClientMessage, Direction, ErrorCode, Reply, Request, ServerMessage};
pub use rtp::{
    ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    TransportOptions, TransportProtocol,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Room identifier
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(room: &str) -> Self {
        Self(room.to_string())
    }
}

impl From<String> for RoomId {
    fn from(room: String) -> Self {
        Self(room)
    }
}
