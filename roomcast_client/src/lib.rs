//! Peer side of the roomcast signaling protocol
//!
//! [`NegotiationController`] is a state machine that turns server messages
//! into calls on a local [`Device`] and into follow-up requests.
//! [`SignalingSocket`] carries both over a WebSocket.
//!
//! ```no_run
//! use roomcast_client::{HeadlessDevice, NegotiationController, SignalingSocket, SyntheticTrack};
//! use roomcast_protocol::MediaKind;
//!
//! # async fn demo() -> Result<(), roomcast_client::ClientError> {
//! let mut socket = SignalingSocket::connect("ws://127.0.0.1:8888/streaming").await?;
//! let mut controller = NegotiationController::new(HeadlessDevice::new(), socket.sender());
//! controller.join("lobby")?;
//! controller.set_local_media(SyntheticTrack::new(MediaKind::Video)).await?;
//! socket.run(&mut controller).await
//! # }
//! ```

#![forbid(unsafe_code)]

mod controller;
mod device;
mod error;
mod socket;

pub use controller::{NegotiationController, RemoteSlot, TransportPhase};
pub use device::{Device, HeadlessDevice, ReceivedTrack, SyntheticTrack};
pub use error::{ClientError, DeviceError};
pub use socket::SignalingSocket;
