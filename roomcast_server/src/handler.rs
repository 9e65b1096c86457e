//! Signaling message handlers
//!
//! Each inbound request runs to completion before the next request of the
//! same peer is read, but handlers of different peers interleave freely.
//! Handlers never hold a session lock across a media engine call: they read
//! what they need, release the lock, call the engine, then lock again and
//! check that the session was not closed in the meantime. A result that
//! arrives for a closed session is released on the spot instead of stored.
//!
//! Replies are queued on the sender's outbox before any broadcast the same
//! request triggers.

use crate::engine::{Consumer, MediaEngine, Producer, Transport};
use crate::error::SignalingError;
use crate::state::{Outbox, ServerState, SharedSession};
use roomcast_protocol::{
    ClientMessage, ConsumerParams, Direction, DtlsParameters, MediaKind, PeerId, ProducerId,
    Reply, Request, RoomId, RtpCapabilities, RtpParameters, ServerMessage, TransportOptions,
};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The signaling protocol state machine shared by all connections
#[derive(Clone)]
pub struct Signaling {
    state: ServerState,
    engine: Arc<dyn MediaEngine>,
}

impl Signaling {
    /// A handler with an empty registry, relaying media through `engine`
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            state: ServerState::new(),
            engine,
        }
    }

    /// The peer registry and room index
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Register a new connection; its messages go to `outbox`
    pub async fn connect(&self, outbox: Outbox) -> PeerId {
        let peer_id = self.state.connect(outbox).await;
        info!(peer = %peer_id, "Peer connected");
        peer_id
    }

    /// Handle one request, answering failures with an `error` frame
    pub async fn handle_request(&self, peer_id: PeerId, request: Request) {
        let ack = request.ack;
        let event = request.message.event_name();
        debug!(peer = %peer_id, event, ?ack, "Request received");

        if let Err(e) = self.dispatch(peer_id, request).await {
            if !e.is_reported() {
                debug!(peer = %peer_id, event, "Request ignored: {}", e);
                return;
            }
            warn!(peer = %peer_id, event, "Request failed: {}", e);
            let error = ServerMessage::Error {
                ack,
                code: e.code(),
                message: e.to_string(),
            };
            // The peer may be gone already; nothing left to tell then
            let _ = self.state.send(peer_id, error).await;
        }
    }

    /// Route a request to its handler
    pub async fn dispatch(&self, peer_id: PeerId, request: Request) -> Result<(), SignalingError> {
        let ack = request.ack;
        match request.message {
            ClientMessage::JoinRoom { room_id } => self.join(peer_id, room_id).await,
            ClientMessage::CreateTransport { sender } => self
                .create_transport(peer_id, Direction::from_sender(sender), ack)
                .await
                .map(drop),
            ClientMessage::ConnectProducerTransport { dtls_parameters } => {
                self.connect_transport(peer_id, Direction::Send, dtls_parameters, ack)
                    .await
            }
            ClientMessage::ConnectConsumerTransport { dtls_parameters } => {
                self.connect_transport(peer_id, Direction::Receive, dtls_parameters, ack)
                    .await
            }
            ClientMessage::TransportProduce {
                kind,
                rtp_parameters,
            } => self
                .produce(peer_id, kind, rtp_parameters, ack)
                .await
                .map(drop),
            ClientMessage::ConsumeMedia {
                rtp_capabilities,
                from_user_id,
            } => self
                .consume(peer_id, from_user_id, rtp_capabilities, ack)
                .await
                .map(drop),
            ClientMessage::ConsumeResume => self.resume(peer_id, ack).await.map(drop),
        }
    }

    /// Join a room, creating its routing context if this is the first peer
    pub async fn join(&self, peer_id: PeerId, room_id: RoomId) -> Result<(), SignalingError> {
        let cell = self.state.begin_join(peer_id, &room_id).await?;

        let context = match cell
            .get_or_try_init(|| self.engine.create_routing_context(&room_id))
            .await
        {
            Ok(context) => Arc::clone(context),
            Err(e) => {
                self.state.abort_join(&room_id).await;
                warn!(peer = %peer_id, room = %room_id, "Routing context unavailable: {}", e);
                return Err(SignalingError::RoomUnavailable(e));
            }
        };

        let (_, others) = self
            .state
            .complete_join(peer_id, &room_id, Arc::clone(&context))
            .await?;
        info!(
            peer = %peer_id,
            room = %room_id,
            router = %context.id(),
            members = others.len() + 1,
            "Peer joined room"
        );

        self.state
            .send(
                peer_id,
                ServerMessage::RouterCapabilities {
                    rtp_capabilities: context.rtp_capabilities(),
                },
            )
            .await?;
        self.state
            .send_all(
                &others,
                &ServerMessage::JoinRoom {
                    room_id,
                    user_id: peer_id,
                },
            )
            .await;
        Ok(())
    }

    /// Create the peer's send or receive transport
    ///
    /// After a receive transport the peer also gets the list of peers that
    /// were in the room before it, so it can start consuming them.
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
        ack: Option<u64>,
    ) -> Result<TransportOptions, SignalingError> {
        let session = self.state.session(peer_id).await?;
        let (context, room_id) = {
            let session = session.lock().await;
            if session.transport(direction).is_some() {
                return Err(SignalingError::TransportAlreadyExists(direction));
            }
            (Arc::clone(session.routing_context()), session.room_id().clone())
        };

        let transport = context.create_transport(direction).await?;

        {
            let mut session = session.lock().await;
            if session.is_closed() {
                debug!(peer = %peer_id, %direction, "Peer left during transport creation");
                transport.close();
                return Err(SignalingError::NotJoined);
            }
            if let Err(e) = session.set_transport(direction, Arc::clone(&transport)) {
                transport.close();
                return Err(e);
            }
        }

        let options = transport.options();
        debug!(peer = %peer_id, transport = %options.id, %direction, "Transport created");
        self.state
            .send(
                peer_id,
                ServerMessage::Response {
                    ack,
                    result: Reply::TransportCreated(options.clone()),
                },
            )
            .await?;

        if direction == Direction::Receive {
            let users: Vec<PeerId> = self
                .state
                .room_peers(&room_id)
                .await
                .into_iter()
                .filter(|member| *member != peer_id)
                .collect();
            debug!(peer = %peer_id, existing = users.len(), "Sending existing users");
            self.state
                .send(peer_id, ServerMessage::ExistingUsersList { users })
                .await?;
        }

        Ok(options)
    }

    /// Finish the DTLS handshake of one of the peer's transports
    ///
    /// Connecting the send transport announces the peer to the rest of the
    /// room, which then starts consuming it.
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        direction: Direction,
        dtls_parameters: DtlsParameters,
        ack: Option<u64>,
    ) -> Result<(), SignalingError> {
        let session = self.state.session(peer_id).await?;
        let (transport, room_id) = {
            let session = session.lock().await;
            let slot = session
                .transport(direction)
                .ok_or(SignalingError::TransportNotFound(direction))?;
            (Arc::clone(&slot.handle), session.room_id().clone())
        };

        transport.connect(dtls_parameters).await?;

        {
            let mut session = session.lock().await;
            if session.is_closed() {
                return Err(SignalingError::NotJoined);
            }
            session.mark_connected(direction)?;
        }

        debug!(peer = %peer_id, %direction, "Transport connected");
        self.state
            .send(
                peer_id,
                ServerMessage::Response {
                    ack,
                    result: Reply::TransportConnected {
                        direction,
                        id: transport.id(),
                    },
                },
            )
            .await?;

        if direction == Direction::Send {
            info!(peer = %peer_id, room = %room_id, "Producer transport connected");
            self.announce_producer(peer_id, &room_id).await;
        }
        Ok(())
    }

    /// Start producing on the peer's connected send transport
    pub async fn produce(
        &self,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        ack: Option<u64>,
    ) -> Result<ProducerId, SignalingError> {
        let session = self.state.session(peer_id).await?;
        let (transport, room_id) = {
            let session = session.lock().await;
            if session.producer().is_some() {
                return Err(SignalingError::ProducerAlreadyExists);
            }
            let slot = session
                .transport(Direction::Send)
                .ok_or(SignalingError::TransportNotFound(Direction::Send))?;
            if !slot.connected {
                return Err(SignalingError::TransportNotConnected);
            }
            (Arc::clone(&slot.handle), session.room_id().clone())
        };

        let producer = transport.produce(kind, rtp_parameters).await?;

        {
            let mut session = session.lock().await;
            if session.is_closed() {
                producer.close();
                return Err(SignalingError::NotJoined);
            }
            if let Err(e) = session.set_producer(Arc::clone(&producer)) {
                producer.close();
                return Err(e);
            }
        }
        close_producer_with_transport(&producer, &transport);

        let id = producer.id();
        info!(peer = %peer_id, producer = %id, %kind, "Producer created");
        self.state
            .send(
                peer_id,
                ServerMessage::Response {
                    ack,
                    result: Reply::Produced { id },
                },
            )
            .await?;

        // Peers that asked for this producer before it existed got no answer;
        // announcing again lets them retry now that it does
        self.announce_producer(peer_id, &room_id).await;
        Ok(id)
    }

    /// Subscribe the peer to the producer of `remote_peer_id`
    ///
    /// Fails with [`SignalingError::ProducerAbsent`] when the remote peer is not
    /// producing in the same room, and with
    /// [`SignalingError::IncompatibleCapabilities`] when the offered
    /// capabilities cannot receive its producer. Neither is reported to the peer.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        remote_peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
        ack: Option<u64>,
    ) -> Result<ConsumerParams, SignalingError> {
        let session = self.state.session(peer_id).await?;
        let (transport, context, room_id) = {
            let session = session.lock().await;
            let slot = session
                .transport(Direction::Receive)
                .ok_or(SignalingError::TransportNotFound(Direction::Receive))?;
            (
                Arc::clone(&slot.handle),
                Arc::clone(session.routing_context()),
                session.room_id().clone(),
            )
        };

        let producer = self.remote_producer(remote_peer_id, &room_id).await?;
        let producer_id = producer.id();

        let existing = session
            .lock()
            .await
            .consumer_for(producer_id)
            .map(Arc::clone);
        if let Some(consumer) = existing {
            debug!(peer = %peer_id, producer = %producer_id, "Already consuming producer");
            return self.reply_consumed(peer_id, consumer.as_ref(), ack).await;
        }

        if !context.can_consume(producer_id, &rtp_capabilities) {
            warn!(peer = %peer_id, producer = %producer_id, "Cannot consume");
            return Err(SignalingError::IncompatibleCapabilities(producer_id));
        }

        let consumer = transport.consume(producer_id, &rtp_capabilities).await?;

        let consumer = {
            let mut guard = session.lock().await;
            if guard.is_closed() {
                consumer.close();
                return Err(SignalingError::NotJoined);
            }
            let kept = guard.add_consumer(Arc::clone(&consumer));
            if !Arc::ptr_eq(&kept, &consumer) {
                consumer.close();
            } else {
                close_consumer_with_sources(&session, &consumer, &transport, &producer);
            }
            kept
        };

        info!(
            peer = %peer_id,
            from = %remote_peer_id,
            consumer = %consumer.id(),
            kind = %consumer.kind(),
            "Consumer created"
        );
        self.reply_consumed(peer_id, consumer.as_ref(), ack).await
    }

    /// Resume every consumer the peer holds
    pub async fn resume(&self, peer_id: PeerId, ack: Option<u64>) -> Result<usize, SignalingError> {
        let session = self.state.session(peer_id).await?;
        let consumers = session.lock().await.consumers().to_vec();

        let mut resumed = 0;
        for consumer in &consumers {
            match consumer.resume().await {
                Ok(()) => resumed += 1,
                Err(e) => warn!(peer = %peer_id, consumer = %consumer.id(), "Resume failed: {}", e),
            }
        }

        debug!(peer = %peer_id, resumed, total = consumers.len(), "Consumers resumed");
        self.state
            .send(
                peer_id,
                ServerMessage::Response {
                    ack,
                    result: Reply::Resumed { count: resumed },
                },
            )
            .await?;
        Ok(resumed)
    }

    /// Remove a peer and release everything it held
    pub async fn disconnect(&self, peer_id: PeerId) {
        let Some(departure) = self.state.disconnect(peer_id).await else {
            return;
        };

        if let Some(session) = &departure.session {
            let mut session = session.lock().await;
            debug!(
                peer = %session.peer_id(),
                consumers = session.consumers().len(),
                producing = session.producer().is_some(),
                "Closing session"
            );
            session.close();
        }
        if let Some(context) = &departure.released_context {
            context.close();
        }

        if !departure.remaining.is_empty() {
            self.state
                .send_all(
                    &departure.remaining,
                    &ServerMessage::PeerLeft { user_id: peer_id },
                )
                .await;
        }

        match &departure.room_id {
            Some(room_id) => info!(peer = %peer_id, room = %room_id, "Peer disconnected"),
            None => info!(peer = %peer_id, "Peer disconnected"),
        }
    }

    async fn announce_producer(&self, peer_id: PeerId, room_id: &RoomId) {
        self.state
            .broadcast(
                room_id,
                peer_id,
                &ServerMessage::NewProducerTransportConnected {
                    new_user_id: peer_id,
                },
            )
            .await;
    }

    async fn remote_producer(
        &self,
        remote_peer_id: PeerId,
        room_id: &RoomId,
    ) -> Result<Arc<dyn Producer>, SignalingError> {
        let remote = self
            .state
            .session(remote_peer_id)
            .await
            .map_err(|_| SignalingError::ProducerAbsent)?;
        let remote = remote.lock().await;
        if remote.room_id() != room_id {
            return Err(SignalingError::ProducerAbsent);
        }
        remote
            .producer()
            .cloned()
            .ok_or(SignalingError::ProducerAbsent)
    }

    async fn reply_consumed(
        &self,
        peer_id: PeerId,
        consumer: &dyn Consumer,
        ack: Option<u64>,
    ) -> Result<ConsumerParams, SignalingError> {
        let params = ConsumerParams {
            producer_id: consumer.producer_id(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        self.state
            .send(
                peer_id,
                ServerMessage::Response {
                    ack,
                    result: Reply::Consumed {
                        params: params.clone(),
                    },
                },
            )
            .await?;
        Ok(params)
    }
}

/// Close the producer once the transport it was created on closes
fn close_producer_with_transport(producer: &Arc<dyn Producer>, transport: &Arc<dyn Transport>) {
    let producer = Arc::clone(producer);
    let transport_closed = transport.closed();
    let producer_closed = producer.closed();
    tokio::spawn(async move {
        tokio::select! {
            _ = transport_closed.cancelled() => {
                debug!(producer = %producer.id(), "Producer transport closed");
                producer.close();
            }
            _ = producer_closed.cancelled() => {}
        }
    });
}

/// Close the consumer once its transport or its producer closes, and drop it
/// from the session it belongs to
fn close_consumer_with_sources(
    session: &SharedSession,
    consumer: &Arc<dyn Consumer>,
    transport: &Arc<dyn Transport>,
    producer: &Arc<dyn Producer>,
) {
    let session: Weak<Mutex<_>> = Arc::downgrade(session);
    let consumer = Arc::clone(consumer);
    let transport_closed = transport.closed();
    let producer_closed = producer.closed();
    let consumer_closed = consumer.closed();
    tokio::spawn(async move {
        tokio::select! {
            _ = transport_closed.cancelled() => {
                debug!(consumer = %consumer.id(), "Consumer transport closed");
            }
            _ = producer_closed.cancelled() => {
                debug!(consumer = %consumer.id(), "Producer closed");
            }
            _ = consumer_closed.cancelled() => {}
        }
        consumer.close();
        if let Some(session) = session.upgrade() {
            session.lock().await.remove_consumer(consumer.id());
        }
    });
}
