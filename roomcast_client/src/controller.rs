//! Peer-side negotiation state machine
//!
//! The controller reacts to [`ServerMessage`]s by driving the local
//! [`Device`] and queueing the next [`Request`]s on an outbound channel. The
//! usual sequence after [`NegotiationController::join`] is:
//!
//! 1. `router-capabilities`: load the device, request both transports
//! 2. transport created: build the local half, connect it
//! 3. send transport connected and local media set: produce, once
//! 4. `existing-users-list` / `new-producer-transport-connected`: consume
//!    each announced peer into its own output slot, then resume
//!
//! Announcements that arrive before the receive transport exists are queued
//! and replayed as soon as it does.

use crate::device::Device;
use crate::error::{ClientError, DeviceError};
use roomcast_protocol::{
    ClientMessage, ConsumerId, Direction, ErrorCode, MediaKind, PeerId, ProducerId, Reply,
    Request, RoomId, ServerMessage,
};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Progress of one local transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportPhase {
    Absent,
    Requested,
    Created,
    Connected,
}

/// What a pending `ack` is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    CreateTransport(Direction),
    ConnectTransport(Direction),
    Produce,
    Consume(PeerId),
    Resume,
}

/// Received media of one remote peer
#[derive(Debug)]
pub struct RemoteSlot<T> {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track: T,
}

/// Drives one peer through join, publish and consume
///
/// Feed it every server message with [`handle`](Self::handle); requests it
/// needs to send are queued on the sender given to [`new`](Self::new).
pub struct NegotiationController<D: Device> {
    device: D,
    outbound: mpsc::UnboundedSender<Request>,
    next_ack: u64,
    pending: HashMap<u64, Pending>,
    room_id: Option<RoomId>,
    loaded: bool,
    send_phase: TransportPhase,
    recv_phase: TransportPhase,
    local_track: Option<D::LocalTrack>,
    produce_requested: bool,
    producer_id: Option<ProducerId>,
    slots: HashMap<PeerId, RemoteSlot<D::RemoteTrack>>,
    /// Peers with a consume request in flight
    requested: HashMap<PeerId, u64>,
    /// Peers announced before the receive transport was created
    deferred: Vec<PeerId>,
    resumed: usize,
}

impl<D: Device> NegotiationController<D> {
    pub fn new(device: D, outbound: mpsc::UnboundedSender<Request>) -> Self {
        Self {
            device,
            outbound,
            next_ack: 1,
            pending: HashMap::new(),
            room_id: None,
            loaded: false,
            send_phase: TransportPhase::Absent,
            recv_phase: TransportPhase::Absent,
            local_track: None,
            produce_requested: false,
            producer_id: None,
            slots: HashMap::new(),
            requested: HashMap::new(),
            deferred: Vec::new(),
            resumed: 0,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn transport_phase(&self, direction: Direction) -> TransportPhase {
        match direction {
            Direction::Send => self.send_phase,
            Direction::Receive => self.recv_phase,
        }
    }

    /// The server-assigned id of our producer, once produced
    pub fn producer_id(&self) -> Option<ProducerId> {
        self.producer_id
    }

    pub fn slots(&self) -> &HashMap<PeerId, RemoteSlot<D::RemoteTrack>> {
        &self.slots
    }

    pub fn slot(&self, peer: &PeerId) -> Option<&RemoteSlot<D::RemoteTrack>> {
        self.slots.get(peer)
    }

    /// Total consumers the server reported as resumed
    pub fn resumed(&self) -> usize {
        self.resumed
    }

    /// Ask the server to place us in `room_id`
    ///
    /// The server answers with `router-capabilities`, not with a response.
    pub fn join(&mut self, room_id: impl Into<RoomId>) -> Result<(), ClientError> {
        let room_id = room_id.into();
        info!(room = %room_id, "Joining room");
        self.room_id = Some(room_id.clone());
        self.outbound
            .send(Request::new(ClientMessage::JoinRoom { room_id }))
            .map_err(|_| ClientError::Closed)
    }

    /// Hand over captured media; it is produced as soon as the send transport is connected
    pub async fn set_local_media(&mut self, track: D::LocalTrack) -> Result<(), ClientError> {
        if self.local_track.is_some() {
            debug!("Local media already set, ignoring");
            return Ok(());
        }
        self.local_track = Some(track);
        self.maybe_produce().await
    }

    /// Advance the state machine with one server message
    pub async fn handle(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::RouterCapabilities { rtp_capabilities } => {
                if self.loaded {
                    debug!("Router capabilities received twice, ignoring");
                    return Ok(());
                }
                self.device.load(rtp_capabilities).await?;
                self.loaded = true;
                self.request_transport(Direction::Send)?;
                self.request_transport(Direction::Receive)?;
            }
            ServerMessage::JoinRoom { room_id, user_id } => {
                debug!(room = %room_id, peer = %user_id, "Peer joined");
            }
            ServerMessage::ExistingUsersList { users } => {
                for peer in users {
                    self.announce(peer, false)?;
                }
            }
            ServerMessage::NewProducerTransportConnected { new_user_id } => {
                self.announce(new_user_id, true)?;
            }
            ServerMessage::PeerLeft { user_id } => {
                if self.slots.remove(&user_id).is_some() {
                    info!(peer = %user_id, "Remote peer left, slot released");
                }
                if let Some(ack) = self.requested.remove(&user_id) {
                    self.pending.remove(&ack);
                }
                self.deferred.retain(|peer| *peer != user_id);
            }
            ServerMessage::Response { ack, result } => {
                let Some(ack) = ack else {
                    warn!("Response without ack, ignoring");
                    return Ok(());
                };
                let Some(pending) = self.pending.remove(&ack) else {
                    warn!(ack, "Response to an unknown request, ignoring");
                    return Ok(());
                };
                self.on_reply(ack, pending, result).await?;
            }
            ServerMessage::Error { ack, code, message } => {
                let pending = ack.and_then(|ack| self.pending.remove(&ack));
                return self.on_error(pending, code, message);
            }
        }
        Ok(())
    }

    async fn on_reply(
        &mut self,
        ack: u64,
        pending: Pending,
        reply: Reply,
    ) -> Result<(), ClientError> {
        match (pending, reply) {
            (Pending::CreateTransport(direction), Reply::TransportCreated(options)) => {
                let dtls_parameters = match direction {
                    Direction::Send => {
                        let dtls = self.device.create_send_transport(options).await?;
                        self.send_phase = TransportPhase::Created;
                        dtls
                    }
                    Direction::Receive => {
                        let dtls = self.device.create_recv_transport(options).await?;
                        self.recv_phase = TransportPhase::Created;
                        dtls
                    }
                };
                let message = match direction {
                    Direction::Send => ClientMessage::ConnectProducerTransport { dtls_parameters },
                    Direction::Receive => ClientMessage::ConnectConsumerTransport { dtls_parameters },
                };
                self.request(Pending::ConnectTransport(direction), message)?;

                if direction == Direction::Receive {
                    for peer in std::mem::take(&mut self.deferred) {
                        self.request_consume(peer)?;
                    }
                }
            }
            (Pending::ConnectTransport(direction), Reply::TransportConnected { id, .. }) => {
                debug!(%direction, transport = %id, "Transport connected");
                match direction {
                    Direction::Send => {
                        self.send_phase = TransportPhase::Connected;
                        self.maybe_produce().await?;
                    }
                    Direction::Receive => self.recv_phase = TransportPhase::Connected,
                }
            }
            (Pending::Produce, Reply::Produced { id }) => {
                info!(producer = %id, "Producing");
                self.producer_id = Some(id);
            }
            (Pending::Consume(peer), Reply::Consumed { params }) => {
                self.requested.remove(&peer);
                if self.slots.contains_key(&peer) {
                    debug!(%peer, "Already receiving from peer, ignoring");
                    return Ok(());
                }
                let track = self.device.consume(&params).await?;
                info!(%peer, consumer = %params.id, kind = %params.kind, "Receiving from peer");
                self.slots.insert(
                    peer,
                    RemoteSlot {
                        consumer_id: params.id,
                        producer_id: params.producer_id,
                        kind: params.kind,
                        track,
                    },
                );
                self.request(Pending::Resume, ClientMessage::ConsumeResume)?;
            }
            (Pending::Resume, Reply::Resumed { count }) => {
                debug!(count, "Consumers resumed");
                self.resumed += count;
            }
            (pending, reply) => {
                warn!(ack, ?pending, ?reply, "Reply does not match request");
                return Err(ClientError::UnexpectedReply { ack });
            }
        }
        Ok(())
    }

    fn on_error(
        &mut self,
        pending: Option<Pending>,
        code: ErrorCode,
        message: String,
    ) -> Result<(), ClientError> {
        match pending {
            // A peer we cannot decode is simply not rendered
            Some(Pending::Consume(peer)) => {
                warn!(%peer, %code, "Cannot receive from peer: {}", message);
                self.requested.remove(&peer);
                Ok(())
            }
            Some(Pending::Resume) => {
                warn!(%code, "Resume failed: {}", message);
                Ok(())
            }
            _ => {
                warn!(%code, "Request rejected: {}", message);
                Err(ClientError::Rejected { code, message })
            }
        }
    }

    /// A remote peer may have media for us
    ///
    /// `fresh` marks a new producer announcement, which justifies asking again
    /// for a peer whose earlier request went unanswered.
    fn announce(&mut self, peer: PeerId, fresh: bool) -> Result<(), ClientError> {
        if self.slots.contains_key(&peer) {
            return Ok(());
        }
        if self.recv_phase < TransportPhase::Created {
            if !self.deferred.contains(&peer) {
                self.deferred.push(peer);
            }
            return Ok(());
        }
        if self.requested.contains_key(&peer) && !fresh {
            return Ok(());
        }
        self.request_consume(peer)
    }

    fn request_consume(&mut self, peer: PeerId) -> Result<(), ClientError> {
        let rtp_capabilities = self
            .device
            .rtp_capabilities()
            .ok_or(DeviceError::NotLoaded)?;
        if let Some(stale) = self.requested.remove(&peer) {
            self.pending.remove(&stale);
        }
        let ack = self.request(
            Pending::Consume(peer),
            ClientMessage::ConsumeMedia {
                rtp_capabilities,
                from_user_id: peer,
            },
        )?;
        self.requested.insert(peer, ack);
        Ok(())
    }

    fn request_transport(&mut self, direction: Direction) -> Result<(), ClientError> {
        self.request(
            Pending::CreateTransport(direction),
            ClientMessage::CreateTransport {
                sender: direction == Direction::Send,
            },
        )?;
        match direction {
            Direction::Send => self.send_phase = TransportPhase::Requested,
            Direction::Receive => self.recv_phase = TransportPhase::Requested,
        }
        Ok(())
    }

    async fn maybe_produce(&mut self) -> Result<(), ClientError> {
        if self.produce_requested || self.send_phase != TransportPhase::Connected {
            return Ok(());
        }
        let Some(track) = self.local_track.as_ref() else {
            return Ok(());
        };
        let (kind, rtp_parameters) = self.device.produce(track).await?;
        self.produce_requested = true;
        self.request(
            Pending::Produce,
            ClientMessage::TransportProduce {
                kind,
                rtp_parameters,
            },
        )?;
        Ok(())
    }

    fn request(&mut self, pending: Pending, message: ClientMessage) -> Result<u64, ClientError> {
        let ack = self.next_ack;
        self.next_ack += 1;
        debug!(ack, event = message.event_name(), "Sending request");
        self.pending.insert(ack, pending);
        self.outbound
            .send(Request::with_ack(ack, message))
            .map_err(|_| ClientError::Closed)?;
        Ok(ack)
    }
}
