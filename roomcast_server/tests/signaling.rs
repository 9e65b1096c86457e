//! Room and session behavior exercised through the signaling handlers

use async_trait::async_trait;
use roomcast_protocol::{
    ClientMessage, Direction, DtlsFingerprint, DtlsParameters, DtlsRole, ErrorCode, MediaKind,
    PeerId, ProducerId, Reply, Request, RoomId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, ServerMessage,
};
use roomcast_server::engine::{Producer, RoutingContext, Transport};
use roomcast_server::{
    EngineConfig, EngineError, LocalEngine, MediaEngine, Signaling, SignalingError,
};
use serde_json::Map;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};

type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

fn setup() -> (Signaling, LocalEngine) {
    let engine = LocalEngine::default();
    (Signaling::new(Arc::new(engine.clone())), engine)
}

fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01".to_string(),
        }],
    }
}

fn vp8() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }],
        encodings: Vec::new(),
        header_extensions: Vec::new(),
    }
}

fn audio_only() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: Some(100),
            parameters: Map::new(),
        }],
        header_extensions: Vec::new(),
    }
}

fn drain(inbox: &mut Inbox) -> Vec<ServerMessage> {
    std::iter::from_fn(|| inbox.try_recv().ok()).collect()
}

async fn connected(signaling: &Signaling) -> (PeerId, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (signaling.connect(tx).await, rx)
}

/// A peer in `room` with its receive transport, returning the room's capabilities
async fn viewer(signaling: &Signaling, room: &str) -> (PeerId, Inbox, RtpCapabilities) {
    let (id, mut inbox) = connected(signaling).await;
    signaling.join(id, RoomId::from(room)).await.unwrap();
    let first = drain(&mut inbox).into_iter().next();
    let Some(ServerMessage::RouterCapabilities { rtp_capabilities }) = first else {
        panic!("expected router capabilities");
    };
    signaling
        .create_transport(id, Direction::Receive, None)
        .await
        .unwrap();
    drain(&mut inbox);
    (id, inbox, rtp_capabilities)
}

/// A peer in `room` producing video
async fn broadcaster(signaling: &Signaling, room: &str) -> (PeerId, Inbox) {
    let (id, mut inbox) = connected(signaling).await;
    signaling.join(id, RoomId::from(room)).await.unwrap();
    signaling
        .create_transport(id, Direction::Send, None)
        .await
        .unwrap();
    signaling
        .connect_transport(id, Direction::Send, dtls(), None)
        .await
        .unwrap();
    signaling
        .produce(id, MediaKind::Video, vp8(), None)
        .await
        .unwrap();
    drain(&mut inbox);
    (id, inbox)
}

async fn consumer_count(signaling: &Signaling, peer: PeerId) -> usize {
    let session = signaling.state().session(peer).await.unwrap();
    let count = session.lock().await.consumers().len();
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_share_one_routing_context() {
    let (signaling, engine) = setup();
    let mut peers = Vec::new();
    for _ in 0..16 {
        peers.push(connected(&signaling).await);
    }

    let joins: Vec<_> = peers
        .iter()
        .map(|(id, _)| {
            let signaling = signaling.clone();
            let id = *id;
            tokio::spawn(async move { signaling.join(id, RoomId::from("fresh")).await })
        })
        .collect();
    for join in joins {
        join.await.unwrap().unwrap();
    }

    assert_eq!(engine.routers_created(), 1);
    let room = RoomId::from("fresh");
    assert_eq!(signaling.state().room_peers(&room).await.len(), 16);

    let router = signaling.state().room_context(&room).await.unwrap().id();
    for (id, _) in &peers {
        let session = signaling.state().session(*id).await.unwrap();
        assert_eq!(session.lock().await.routing_context().id(), router);
    }
}

#[tokio::test]
async fn duplicate_transport_keeps_the_first_one() {
    let (signaling, _engine) = setup();
    let (id, mut inbox) = connected(&signaling).await;
    signaling.join(id, RoomId::from("r1")).await.unwrap();

    let first = signaling
        .create_transport(id, Direction::Send, Some(1))
        .await
        .unwrap();
    let second = signaling.create_transport(id, Direction::Send, Some(2)).await;
    assert_eq!(
        second.err(),
        Some(SignalingError::TransportAlreadyExists(Direction::Send))
    );

    let session = signaling.state().session(id).await.unwrap();
    let held = session
        .lock()
        .await
        .transport(Direction::Send)
        .map(|slot| slot.handle.id());
    assert_eq!(held, Some(first.id));
    drain(&mut inbox);
}

#[tokio::test]
async fn incompatible_capabilities_create_no_consumer() {
    let (signaling, _engine) = setup();
    let (producer_peer, _producer_inbox) = broadcaster(&signaling, "r1").await;
    let (id, mut inbox, _) = viewer(&signaling, "r1").await;

    let result = signaling
        .consume(id, producer_peer, audio_only(), Some(7))
        .await;
    assert!(matches!(
        result,
        Err(SignalingError::IncompatibleCapabilities(_))
    ));
    assert_eq!(consumer_count(&signaling, id).await, 0);
    assert!(drain(&mut inbox).is_empty());
}

#[tokio::test]
async fn incompatible_capabilities_get_no_answer() {
    let (signaling, _engine) = setup();
    let (producer_peer, _producer_inbox) = broadcaster(&signaling, "r1").await;
    let (id, mut inbox, _) = viewer(&signaling, "r1").await;

    let request = Request::with_ack(
        7,
        ClientMessage::ConsumeMedia {
            rtp_capabilities: audio_only(),
            from_user_id: producer_peer,
        },
    );
    signaling.handle_request(id, request).await;

    assert!(drain(&mut inbox).is_empty());
    assert_eq!(consumer_count(&signaling, id).await, 0);
}

#[tokio::test]
async fn consuming_a_silent_peer_is_a_quiet_no_op() {
    let (signaling, _engine) = setup();
    let (silent, _silent_inbox) = connected(&signaling).await;
    signaling.join(silent, RoomId::from("r1")).await.unwrap();
    let (id, mut inbox, capabilities) = viewer(&signaling, "r1").await;

    let request = Request::with_ack(
        3,
        ClientMessage::ConsumeMedia {
            rtp_capabilities: capabilities,
            from_user_id: silent,
        },
    );
    signaling.handle_request(id, request).await;

    assert!(drain(&mut inbox).is_empty());
    assert_eq!(consumer_count(&signaling, id).await, 0);
}

#[tokio::test]
async fn producer_in_another_room_is_not_consumable() {
    let (signaling, _engine) = setup();
    let (elsewhere, _inbox) = broadcaster(&signaling, "r2").await;
    let (id, _inbox, capabilities) = viewer(&signaling, "r1").await;

    let result = signaling.consume(id, elsewhere, capabilities, None).await;
    assert_eq!(result.err(), Some(SignalingError::ProducerAbsent));
}

#[tokio::test]
async fn existing_users_list_names_earlier_members_only() {
    let (signaling, _engine) = setup();
    let (a, _a_inbox) = broadcaster(&signaling, "r1").await;
    let (b, _b_inbox) = broadcaster(&signaling, "r1").await;
    let (_other, _other_inbox) = broadcaster(&signaling, "r2").await;

    let (c, mut c_inbox) = connected(&signaling).await;
    signaling.join(c, RoomId::from("r1")).await.unwrap();
    drain(&mut c_inbox);
    signaling
        .create_transport(c, Direction::Receive, Some(4))
        .await
        .unwrap();

    let messages = drain(&mut c_inbox);
    assert!(matches!(
        &messages[0],
        ServerMessage::Response {
            ack: Some(4),
            result: Reply::TransportCreated(_)
        }
    ));
    assert_eq!(
        messages[1],
        ServerMessage::ExistingUsersList { users: vec![a, b] }
    );
}

#[tokio::test]
async fn producer_ready_reaches_earlier_members() {
    let (signaling, _engine) = setup();
    let (a, mut a_inbox, _) = viewer(&signaling, "r1").await;

    let (b, mut b_inbox) = connected(&signaling).await;
    signaling.join(b, RoomId::from("r1")).await.unwrap();
    signaling
        .create_transport(b, Direction::Receive, None)
        .await
        .unwrap();
    let existing = drain(&mut b_inbox).pop();
    assert_eq!(existing, Some(ServerMessage::ExistingUsersList { users: vec![a] }));

    signaling
        .create_transport(b, Direction::Send, None)
        .await
        .unwrap();
    signaling
        .connect_transport(b, Direction::Send, dtls(), Some(5))
        .await
        .unwrap();
    let connected_reply = drain(&mut b_inbox);
    assert!(matches!(
        connected_reply.as_slice(),
        [
            ServerMessage::Response { .. },
            ServerMessage::Response {
                ack: Some(5),
                result: Reply::TransportConnected {
                    direction: Direction::Send,
                    ..
                }
            }
        ]
    ));
    signaling
        .produce(b, MediaKind::Video, vp8(), None)
        .await
        .unwrap();

    let ready = ServerMessage::NewProducerTransportConnected { new_user_id: b };
    assert_eq!(
        drain(&mut a_inbox),
        vec![
            ServerMessage::JoinRoom {
                room_id: RoomId::from("r1"),
                user_id: b
            },
            ready.clone(),
            ready
        ]
    );
    assert!(drain(&mut b_inbox).iter().all(|message| !matches!(
        message,
        ServerMessage::NewProducerTransportConnected { .. }
    )));
}

#[tokio::test]
async fn late_joiner_consumes_every_producer_and_resumes_them() {
    let (signaling, _engine) = setup();
    let mut producers = Vec::new();
    let mut inboxes = Vec::new();
    for _ in 0..3 {
        let (id, inbox) = broadcaster(&signaling, "r1").await;
        producers.push(id);
        inboxes.push(inbox);
    }
    let (viewer_id, mut inbox, capabilities) = viewer(&signaling, "r1").await;

    let mut consumed = Vec::new();
    for (ack, producer) in producers.iter().enumerate() {
        let params = signaling
            .consume(viewer_id, *producer, capabilities.clone(), Some(ack as u64))
            .await
            .unwrap();
        consumed.push(params);
    }
    consumed.sort_by_key(|params| params.id);
    consumed.dedup_by_key(|params| params.id);
    assert_eq!(consumed.len(), 3);
    assert_eq!(consumer_count(&signaling, viewer_id).await, 3);

    let resumed = signaling.resume(viewer_id, Some(10)).await.unwrap();
    assert_eq!(resumed, 3);

    let session = signaling.state().session(viewer_id).await.unwrap();
    assert!(session
        .lock()
        .await
        .consumers()
        .iter()
        .all(|consumer| !consumer.is_paused()));

    let last = drain(&mut inbox).pop();
    assert_eq!(
        last,
        Some(ServerMessage::Response {
            ack: Some(10),
            result: Reply::Resumed { count: 3 }
        })
    );
}

#[tokio::test]
async fn disconnected_peer_is_never_resurrected() {
    let (signaling, engine) = setup();
    let (stayer, mut stayer_inbox) = broadcaster(&signaling, "r1").await;
    let (leaver, _leaver_inbox) = broadcaster(&signaling, "r1").await;
    drain(&mut stayer_inbox);

    signaling.disconnect(leaver).await;

    assert_eq!(
        drain(&mut stayer_inbox),
        vec![ServerMessage::PeerLeft { user_id: leaver }]
    );
    assert_eq!(
        signaling.state().session(leaver).await.err(),
        Some(SignalingError::NotJoined)
    );
    assert_eq!(
        signaling
            .create_transport(leaver, Direction::Receive, None)
            .await
            .err(),
        Some(SignalingError::NotJoined)
    );
    assert!(matches!(
        signaling.join(leaver, RoomId::from("r1")).await,
        Err(SignalingError::UnknownPeer)
    ));
    assert_eq!(signaling.state().room_peers(&RoomId::from("r1")).await, vec![stayer]);

    signaling.disconnect(stayer).await;
    assert_eq!(signaling.state().room_count().await, 0);
    assert_eq!(engine.ports_in_use(), 0);
}

#[tokio::test]
async fn room_without_codecs_is_unavailable() {
    let engine = LocalEngine::new(EngineConfig {
        media_codecs: Vec::new(),
        ..EngineConfig::default()
    });
    let signaling = Signaling::new(Arc::new(engine.clone()));
    let (id, mut inbox) = connected(&signaling).await;

    let join = |ack| {
        Request::with_ack(
            ack,
            ClientMessage::JoinRoom {
                room_id: RoomId::from("r1"),
            },
        )
    };
    signaling.handle_request(id, join(1)).await;

    assert!(matches!(
        drain(&mut inbox).as_slice(),
        [ServerMessage::Error {
            ack: Some(1),
            code: ErrorCode::RoomUnavailable,
            ..
        }]
    ));
    assert_eq!(signaling.state().room_count().await, 0);
    assert_eq!(engine.routers_created(), 0);
    assert_eq!(
        signaling.state().session(id).await.err(),
        Some(SignalingError::NotJoined)
    );

    // The failed join leaves nothing behind, so a retry fails the same way
    signaling.handle_request(id, join(2)).await;
    assert!(matches!(
        drain(&mut inbox).as_slice(),
        [ServerMessage::Error {
            ack: Some(2),
            code: ErrorCode::RoomUnavailable,
            ..
        }]
    ));
}

#[tokio::test]
async fn rejected_produce_leaves_the_peer_free_to_produce() {
    let (signaling, _engine) = setup();
    let (id, mut inbox) = connected(&signaling).await;
    signaling.join(id, RoomId::from("r1")).await.unwrap();
    signaling
        .create_transport(id, Direction::Send, None)
        .await
        .unwrap();
    signaling
        .connect_transport(id, Direction::Send, dtls(), None)
        .await
        .unwrap();
    drain(&mut inbox);

    let mut h264 = vp8();
    h264.codecs[0].mime_type = "video/H264".to_string();
    let result = signaling.produce(id, MediaKind::Video, h264, Some(3)).await;
    assert!(matches!(
        result,
        Err(SignalingError::Engine(EngineError::Rejected(_)))
    ));

    let session = signaling.state().session(id).await.unwrap();
    assert!(session.lock().await.producer().is_none());

    let produced = signaling
        .produce(id, MediaKind::Video, vp8(), Some(4))
        .await
        .unwrap();
    assert_eq!(
        session.lock().await.producer().map(|producer| producer.id()),
        Some(produced)
    );
    assert_eq!(
        drain(&mut inbox),
        vec![ServerMessage::Response {
            ack: Some(4),
            result: Reply::Produced { id: produced }
        }]
    );
}

#[tokio::test]
async fn errors_carry_the_request_ack() {
    let (signaling, _engine) = setup();
    let (id, mut inbox) = connected(&signaling).await;

    signaling
        .handle_request(id, Request::with_ack(9, ClientMessage::ConsumeResume))
        .await;

    assert!(matches!(
        drain(&mut inbox).as_slice(),
        [ServerMessage::Error {
            ack: Some(9),
            code: ErrorCode::NotJoined,
            ..
        }]
    ));
}

/// Holds `create_transport` calls while armed so a disconnect can overtake them
#[derive(Default)]
struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

struct GatedEngine {
    inner: LocalEngine,
    gate: Arc<Gate>,
}

#[async_trait]
impl MediaEngine for GatedEngine {
    async fn create_routing_context(
        &self,
        room: &RoomId,
    ) -> Result<Arc<dyn RoutingContext>, EngineError> {
        let inner = self.inner.create_routing_context(room).await?;
        Ok(Arc::new(GatedContext {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct GatedContext {
    inner: Arc<dyn RoutingContext>,
    gate: Arc<Gate>,
}

#[async_trait]
impl RoutingContext for GatedContext {
    fn id(&self) -> RouterId {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer, capabilities)
    }

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.gate.armed.load(Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        self.inner.create_transport(direction).await
    }

    fn close(&self) {
        self.inner.close()
    }
}

#[tokio::test]
async fn transport_created_after_disconnect_is_released() {
    let engine = LocalEngine::default();
    let gate = Arc::new(Gate::default());
    let signaling = Signaling::new(Arc::new(GatedEngine {
        inner: engine.clone(),
        gate: Arc::clone(&gate),
    }));
    let (_stayer, _stayer_inbox) = broadcaster(&signaling, "r1").await;
    let (leaver, _leaver_inbox) = connected(&signaling).await;
    signaling.join(leaver, RoomId::from("r1")).await.unwrap();
    let ports_before = engine.ports_in_use();

    gate.armed.store(true, Ordering::SeqCst);
    let pending = tokio::spawn({
        let signaling = signaling.clone();
        async move {
            signaling
                .create_transport(leaver, Direction::Receive, None)
                .await
        }
    });
    gate.entered.notified().await;
    signaling.disconnect(leaver).await;
    gate.release.notify_one();

    assert_eq!(
        pending.await.unwrap().err(),
        Some(SignalingError::NotJoined)
    );
    assert_eq!(
        signaling.state().session(leaver).await.err(),
        Some(SignalingError::NotJoined)
    );
    assert_eq!(engine.ports_in_use(), ports_before);
}
