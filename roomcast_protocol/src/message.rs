use crate::RoomId;
use crate::ids::{PeerId, ProducerId, TransportId};
use crate::rtp::{
    ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportOptions,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a peer transport, as seen from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The peer sends media to the relay
    Send,
    /// The peer receives media from the relay
    Receive,
}

impl Direction {
    /// Maps the `sender` flag of a `create-transport` request
    pub fn from_sender(sender: bool) -> Self {
        if sender {
            Direction::Send
        } else {
            Direction::Receive
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Requests a peer sends to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
    },
    CreateTransport {
        sender: bool,
    },
    ConnectProducerTransport {
        dtls_parameters: DtlsParameters,
    },
    ConnectConsumerTransport {
        dtls_parameters: DtlsParameters,
    },
    TransportProduce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    ConsumeMedia {
        rtp_capabilities: RtpCapabilities,
        from_user_id: PeerId,
    },
    ConsumeResume,
}

impl ClientMessage {
    /// The wire name of the message, for logging
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectProducerTransport { .. } => "connect-producer-transport",
            ClientMessage::ConnectConsumerTransport { .. } => "connect-consumer-transport",
            ClientMessage::TransportProduce { .. } => "transport-produce",
            ClientMessage::ConsumeMedia { .. } => "consume-media",
            ClientMessage::ConsumeResume => "consume-resume",
        }
    }
}

/// A request frame: a message plus an optional correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl Request {
    pub fn new(message: ClientMessage) -> Self {
        Self { ack: None, message }
    }

    pub fn with_ack(ack: u64, message: ClientMessage) -> Self {
        Self {
            ack: Some(ack),
            message,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serialized = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&serialized)
    }
}

impl FromStr for Request {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Reply {
    TransportCreated(TransportOptions),
    TransportConnected { direction: Direction, id: TransportId },
    Produced { id: ProducerId },
    Consumed { params: ConsumerParams },
    Resumed { count: usize },
}

/// Machine-readable reason a request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    RoomUnavailable,
    NotJoined,
    AlreadyJoined,
    TransportNotFound,
    TransportAlreadyExists,
    TransportNotConnected,
    ProducerAlreadyExists,
    IncompatibleCapabilities,
    ProducerAbsent,
    EngineFailure,
    InvalidMessage,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Messages the signaling server sends to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Capability descriptor of the room's routing context, sent after a join
    RouterCapabilities { rtp_capabilities: RtpCapabilities },
    /// Another peer joined the room
    JoinRoom { room_id: RoomId, user_id: PeerId },
    /// Peers that were already in the room when the receive transport was made
    ExistingUsersList { users: Vec<PeerId> },
    /// A peer connected its send transport and is about to produce
    NewProducerTransportConnected { new_user_id: PeerId },
    /// A peer of the room disconnected
    PeerLeft { user_id: PeerId },
    Response {
        ack: Option<u64>,
        result: Reply,
    },
    Error {
        ack: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serialized = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&serialized)
    }
}

impl FromStr for ServerMessage {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}
