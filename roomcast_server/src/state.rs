//! Server state management for the signaling server
//!
//! This module owns the peer registry (connected peers and their sessions)
//! and derives the room index from it. A peer is registered when its
//! connection opens and gets a [`PeerSession`] once it joins a room.

use crate::engine::{Consumer, Producer, RoutingContext, Transport};
use crate::error::SignalingError;
use roomcast_protocol::{ConsumerId, Direction, PeerId, ProducerId, RoomId, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock, mpsc};
use tracing::{debug, warn};

/// Queue of messages waiting to be written to a peer's connection
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// A session shared between the registry and in-flight handlers
pub type SharedSession = Arc<Mutex<PeerSession>>;

/// A transport handle plus whether its DTLS handshake completed
#[derive(Clone)]
pub struct TransportSlot {
    pub handle: Arc<dyn Transport>,
    pub connected: bool,
}

/// Media state of one joined peer
pub struct PeerSession {
    peer_id: PeerId,
    room_id: RoomId,
    routing_context: Arc<dyn RoutingContext>,
    send_transport: Option<TransportSlot>,
    recv_transport: Option<TransportSlot>,
    producer: Option<Arc<dyn Producer>>,
    consumers: Vec<Arc<dyn Consumer>>,
    closed: bool,
}

impl PeerSession {
    fn new(peer_id: PeerId, room_id: RoomId, routing_context: Arc<dyn RoutingContext>) -> Self {
        Self {
            peer_id,
            room_id,
            routing_context,
            send_transport: None,
            recv_transport: None,
            producer: None,
            consumers: Vec::new(),
            closed: false,
        }
    }

    /// The peer this session belongs to
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The room joined on this session; fixed for its lifetime
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn routing_context(&self) -> &Arc<dyn RoutingContext> {
        &self.routing_context
    }

    /// Set once the peer disconnected; nothing may be stored afterwards
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transport(&self, direction: Direction) -> Option<&TransportSlot> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Receive => self.recv_transport.as_ref(),
        }
    }

    /// Store a new transport, refusing to replace an existing one
    pub fn set_transport(
        &mut self,
        direction: Direction,
        handle: Arc<dyn Transport>,
    ) -> Result<(), SignalingError> {
        let slot = match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Receive => &mut self.recv_transport,
        };
        if slot.is_some() {
            return Err(SignalingError::TransportAlreadyExists(direction));
        }
        *slot = Some(TransportSlot {
            handle,
            connected: false,
        });
        Ok(())
    }

    /// Record a completed DTLS handshake on one of the transports
    pub fn mark_connected(&mut self, direction: Direction) -> Result<(), SignalingError> {
        let slot = match direction {
            Direction::Send => self.send_transport.as_mut(),
            Direction::Receive => self.recv_transport.as_mut(),
        };
        let slot = slot.ok_or(SignalingError::TransportNotFound(direction))?;
        slot.connected = true;
        Ok(())
    }

    pub fn producer(&self) -> Option<&Arc<dyn Producer>> {
        self.producer.as_ref()
    }

    /// Store the peer's producer, refusing a second one
    pub fn set_producer(&mut self, producer: Arc<dyn Producer>) -> Result<(), SignalingError> {
        if self.producer.is_some() {
            return Err(SignalingError::ProducerAlreadyExists);
        }
        self.producer = Some(producer);
        Ok(())
    }

    /// Consumers in the order they were created
    pub fn consumers(&self) -> &[Arc<dyn Consumer>] {
        &self.consumers
    }

    /// The consumer receiving `producer`, if any
    pub fn consumer_for(&self, producer: ProducerId) -> Option<&Arc<dyn Consumer>> {
        self.consumers
            .iter()
            .find(|consumer| consumer.producer_id() == producer)
    }

    /// Append a consumer unless one for the same producer is already held
    ///
    /// Returns the consumer that ends up in the session.
    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer>) -> Arc<dyn Consumer> {
        if let Some(existing) = self.consumer_for(consumer.producer_id()) {
            return Arc::clone(existing);
        }
        self.consumers.push(Arc::clone(&consumer));
        consumer
    }

    pub fn remove_consumer(&mut self, id: ConsumerId) -> Option<Arc<dyn Consumer>> {
        let index = self.consumers.iter().position(|consumer| consumer.id() == id)?;
        Some(self.consumers.remove(index))
    }

    /// Mark the session closed and release every handle it holds
    pub fn close(&mut self) {
        self.closed = true;
        for consumer in self.consumers.drain(..) {
            consumer.close();
        }
        if let Some(producer) = self.producer.take() {
            producer.close();
        }
        for slot in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            slot.handle.close();
        }
    }
}

/// A room's routing context, created by whichever join gets there first
pub type ContextCell = Arc<OnceCell<Arc<dyn RoutingContext>>>;

/// Members of a room plus its lazily created routing context
#[derive(Default)]
struct Room {
    context: ContextCell,
    /// Peers in join order
    members: Vec<PeerId>,
    /// Joins that are waiting on the routing context
    pending_joins: usize,
}

impl Room {
    fn is_abandoned(&self) -> bool {
        self.members.is_empty() && self.pending_joins == 0
    }
}

/// A connected peer
struct PeerEntry {
    outbox: Outbox,
    room_id: Option<RoomId>,
    session: Option<SharedSession>,
}

#[derive(Default)]
struct InnerState {
    /// Map of peer ID -> peer state
    peers: HashMap<PeerId, PeerEntry>,
    /// Map of room -> peers in that room
    rooms: HashMap<RoomId, Room>,
}

impl InnerState {
    /// Drop an empty room, handing back its context for closing
    fn prune_room(&mut self, room_id: &RoomId) -> Option<Arc<dyn RoutingContext>> {
        if !self.rooms.get(room_id)?.is_abandoned() {
            return None;
        }
        let room = self.rooms.remove(room_id)?;
        debug!(room = %room_id, "Room released");
        room.context.get().cloned()
    }
}

/// What is left to do after a peer was removed from the registry
pub struct Departure {
    pub peer_id: PeerId,
    pub room_id: Option<RoomId>,
    /// The removed session; still holds its handles until closed
    pub session: Option<SharedSession>,
    /// Room members to notify
    pub remaining: Vec<PeerId>,
    /// The room's routing context when the peer was the last member
    pub released_context: Option<Arc<dyn RoutingContext>>,
}

/// The main server state, shared by every connection
#[derive(Default, Clone)]
pub struct ServerState {
    inner: Arc<RwLock<InnerState>>,
}

impl ServerState {
    /// Create a new server state handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened connection and assign its peer ID
    pub async fn connect(&self, outbox: Outbox) -> PeerId {
        let peer_id = PeerId::random();
        self.inner.write().await.peers.insert(
            peer_id,
            PeerEntry {
                outbox,
                room_id: None,
                session: None,
            },
        );
        peer_id
    }

    /// First half of a join: reserve a place in the room and hand out the
    /// room's context cell so the caller can create-or-reuse the context
    /// without holding the registry lock
    pub async fn begin_join(
        &self,
        peer_id: PeerId,
        room_id: &RoomId,
    ) -> Result<ContextCell, SignalingError> {
        let mut state = self.inner.write().await;
        let peer = state
            .peers
            .get(&peer_id)
            .ok_or(SignalingError::UnknownPeer)?;
        if peer.session.is_some() {
            return Err(SignalingError::AlreadyJoined);
        }

        let room = state.rooms.entry(room_id.clone()).or_default();
        room.pending_joins += 1;
        Ok(Arc::clone(&room.context))
    }

    /// Undo [`ServerState::begin_join`] after the context could not be created
    pub async fn abort_join(&self, room_id: &RoomId) {
        let released = {
            let mut state = self.inner.write().await;
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.pending_joins = room.pending_joins.saturating_sub(1);
            }
            state.prune_room(room_id)
        };
        if let Some(context) = released {
            context.close();
        }
    }

    /// Second half of a join: create the session and add it to the room
    ///
    /// Returns the other members of the room. Fails with `NotJoined` when the
    /// peer disconnected while the context was being created.
    pub async fn complete_join(
        &self,
        peer_id: PeerId,
        room_id: &RoomId,
        context: Arc<dyn RoutingContext>,
    ) -> Result<(SharedSession, Vec<PeerId>), SignalingError> {
        let (result, released) = {
            let mut guard = self.inner.write().await;
            let state = &mut *guard;
            if let Some(room) = state.rooms.get_mut(room_id) {
                room.pending_joins = room.pending_joins.saturating_sub(1);
            }

            let result = match state.peers.get_mut(&peer_id) {
                None => Err(SignalingError::NotJoined),
                Some(peer) if peer.session.is_some() => Err(SignalingError::AlreadyJoined),
                Some(peer) => {
                    let session = Arc::new(Mutex::new(PeerSession::new(
                        peer_id,
                        room_id.clone(),
                        context,
                    )));
                    peer.room_id = Some(room_id.clone());
                    peer.session = Some(Arc::clone(&session));
                    let room = state.rooms.entry(room_id.clone()).or_default();
                    let others = room.members.clone();
                    room.members.push(peer_id);
                    Ok((session, others))
                }
            };

            let released = if result.is_err() {
                state.prune_room(room_id)
            } else {
                None
            };
            (result, released)
        };

        if let Some(context) = released {
            context.close();
        }
        result
    }

    /// Look up a joined peer's session
    pub async fn session(&self, peer_id: PeerId) -> Result<SharedSession, SignalingError> {
        self.inner
            .read()
            .await
            .peers
            .get(&peer_id)
            .and_then(|peer| peer.session.clone())
            .ok_or(SignalingError::NotJoined)
    }

    /// Get all peers in a room, in join order
    pub async fn room_peers(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    /// The room's routing context, if the room exists and has one
    pub async fn room_context(&self, room_id: &RoomId) -> Option<Arc<dyn RoutingContext>> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .and_then(|room| room.context.get().cloned())
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Queue a message for a peer
    pub async fn send(&self, peer_id: PeerId, message: ServerMessage) -> Result<(), SignalingError> {
        let state = self.inner.read().await;
        let peer = state.peers.get(&peer_id).ok_or(SignalingError::UnknownPeer)?;
        if peer.outbox.send(message).is_err() {
            debug!(peer = %peer_id, "Outbox closed, message dropped");
        }
        Ok(())
    }

    /// Queue a message for every listed peer that is still connected
    pub async fn send_all(&self, peer_ids: &[PeerId], message: &ServerMessage) {
        let state = self.inner.read().await;
        for peer_id in peer_ids {
            if let Some(peer) = state.peers.get(peer_id) {
                if peer.outbox.send(message.clone()).is_err() {
                    debug!(peer = %peer_id, "Outbox closed, message dropped");
                }
            }
        }
    }

    /// Queue a message for every member of a room except `except`
    pub async fn broadcast(&self, room_id: &RoomId, except: PeerId, message: &ServerMessage) {
        let state = self.inner.read().await;
        let Some(room) = state.rooms.get(room_id) else {
            return;
        };
        for member in room.members.iter().filter(|member| **member != except) {
            match state.peers.get(member) {
                Some(peer) => {
                    if peer.outbox.send(message.clone()).is_err() {
                        debug!(peer = %member, "Outbox closed, message dropped");
                    }
                }
                None => warn!(peer = %member, room = %room_id, "Room member without connection"),
            }
        }
    }

    /// Remove a peer from the server
    ///
    /// Returns `None` when the peer was not registered.
    pub async fn disconnect(&self, peer_id: PeerId) -> Option<Departure> {
        let mut state = self.inner.write().await;
        let peer = state.peers.remove(&peer_id)?;

        let mut departure = Departure {
            peer_id,
            room_id: None,
            session: peer.session,
            remaining: Vec::new(),
            released_context: None,
        };

        if let Some(room_id) = peer.room_id {
            if let Some(room) = state.rooms.get_mut(&room_id) {
                room.members.retain(|member| *member != peer_id);
                departure.remaining = room.members.clone();
            }
            departure.released_context = state.prune_room(&room_id);
            departure.room_id = Some(room_id);
        }

        Some(departure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, MediaEngine};

    async fn context(room: &str) -> Arc<dyn RoutingContext> {
        LocalEngine::default()
            .create_routing_context(&RoomId::from(room))
            .await
            .unwrap()
    }

    async fn joined(state: &ServerState, room: &str) -> (PeerId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = state.connect(tx).await;
        let room = RoomId::from(room);
        let cell = state.begin_join(peer, &room).await.unwrap();
        let context = cell
            .get_or_init(|| async { context(room.as_str()).await })
            .await
            .clone();
        state.complete_join(peer, &room, context).await.unwrap();
        (peer, rx)
    }

    #[tokio::test]
    async fn members_are_listed_in_join_order() {
        let state = ServerState::new();
        let (a, _a_rx) = joined(&state, "r1").await;
        let (b, _b_rx) = joined(&state, "r1").await;
        let (c, _c_rx) = joined(&state, "r2").await;

        assert_eq!(state.room_peers(&RoomId::from("r1")).await, vec![a, b]);
        assert_eq!(state.room_peers(&RoomId::from("r2")).await, vec![c]);
        assert_eq!(state.room_count().await, 2);
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let state = ServerState::new();
        let (a, _rx) = joined(&state, "r1").await;
        assert!(matches!(
            state.begin_join(a, &RoomId::from("r2")).await,
            Err(SignalingError::AlreadyJoined)
        ));
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let state = ServerState::new();
        let (a, mut a_rx) = joined(&state, "r1").await;
        let (_b, mut b_rx) = joined(&state, "r1").await;

        let message = ServerMessage::NewProducerTransportConnected { new_user_id: a };
        state.broadcast(&RoomId::from("r1"), a, &message).await;

        assert_eq!(b_rx.try_recv().unwrap(), message);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_forgets_the_session() {
        let state = ServerState::new();
        let (a, _a_rx) = joined(&state, "r1").await;
        let (b, _b_rx) = joined(&state, "r1").await;

        let departure = state.disconnect(a).await.unwrap();
        assert_eq!(departure.room_id, Some(RoomId::from("r1")));
        assert_eq!(departure.remaining, vec![b]);
        assert!(departure.released_context.is_none());
        assert!(matches!(state.session(a).await, Err(SignalingError::NotJoined)));
        assert!(state.disconnect(a).await.is_none());
    }

    #[tokio::test]
    async fn last_member_releases_the_room() {
        let state = ServerState::new();
        let (a, _rx) = joined(&state, "r1").await;

        let departure = state.disconnect(a).await.unwrap();
        assert!(departure.released_context.is_some());
        assert_eq!(state.room_count().await, 0);
    }

    #[tokio::test]
    async fn join_completed_after_disconnect_creates_nothing() {
        let state = ServerState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = state.connect(tx).await;
        let room = RoomId::from("r1");
        state.begin_join(peer, &room).await.unwrap();

        state.disconnect(peer).await;
        let result = state.complete_join(peer, &room, context("r1").await).await;

        assert!(matches!(result, Err(SignalingError::NotJoined)));
        assert!(matches!(state.session(peer).await, Err(SignalingError::NotJoined)));
        assert_eq!(state.room_count().await, 0);
    }

    #[tokio::test]
    async fn session_refuses_a_second_transport() {
        let context = context("r1").await;
        let mut session = PeerSession::new(PeerId::random(), RoomId::from("r1"), Arc::clone(&context));
        let first = context.create_transport(Direction::Send).await.unwrap();
        let second = context.create_transport(Direction::Send).await.unwrap();

        session.set_transport(Direction::Send, Arc::clone(&first)).unwrap();
        assert_eq!(
            session.set_transport(Direction::Send, second).err(),
            Some(SignalingError::TransportAlreadyExists(Direction::Send))
        );
        assert_eq!(session.transport(Direction::Send).unwrap().handle.id(), first.id());

        session.close();
        assert!(session.is_closed());
        assert!(first.closed().is_cancelled());
        assert!(session.transport(Direction::Send).is_none());
    }
}
