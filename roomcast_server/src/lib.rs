//! Signaling server for one-to-many media rooms
//!
//! Peers connect over a WebSocket, join a room and negotiate a send and a
//! receive transport with the room's routing context. Media is relayed by a
//! [`MediaEngine`]; this crate decides who consumes whom and in which order,
//! and how a late joiner catches up with the peers already in the room.
//!
//! # Protocol
//!
//! Frames are JSON objects tagged by `event` (see [`roomcast_protocol`]).
//! A typical peer runs:
//!
//! 1. `join-room` → `router-capabilities`
//! 2. `create-transport {sender: true}` → transport parameters
//! 3. `connect-producer-transport` → room gets `new-producer-transport-connected`
//! 4. `transport-produce` → producer id
//! 5. `create-transport {sender: false}` → transport parameters, then
//!    `existing-users-list`
//! 6. `connect-consumer-transport`
//! 7. `consume-media` for every known peer, then `consume-resume`
//!
//! # Example
//!
//! ```bash
//! # Start the server with the in-process media engine
//! roomcast-server --listen 127.0.0.1:8888 --namespace /streaming
//!
//! # Join a room
//! websocat ws://127.0.0.1:8888/streaming
//! {"event":"join-room","roomId":"r1"}
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;

pub use config::{EngineConfig, ServerConfig};
pub use engine::{LocalEngine, MediaEngine};
pub use error::{ClientRequestError, EngineError, SignalingError};
pub use handler::Signaling;
pub use server::serve;
pub use roomcast_protocol::RoomId;
pub use state::ServerState;
