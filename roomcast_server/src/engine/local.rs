//! In-process media engine
//!
//! Keeps routers, transports, producers and consumers as plain in-memory
//! objects. Transports get real-looking ICE/DTLS parameters and ports taken
//! from the configured RTC range, but no packets flow. It lets the server run
//! stand-alone and gives tests a faithful engine to drive.

use super::{Consumer, MediaEngine, Producer, RoutingContext, Transport};
use crate::config::EngineConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, Direction, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, ProducerId, RoomId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportId, TransportOptions, TransportProtocol,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const PREFERRED_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const FALLBACK_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn codec_matches(capability: &RtpCodecCapability, codec: &RtpCodecParameters) -> bool {
    capability.mime_type.eq_ignore_ascii_case(&codec.mime_type)
        && capability.clock_rate == codec.clock_rate
        && capability.channels.unwrap_or(1) == codec.channels.unwrap_or(1)
}

fn find_capability<'a>(
    capabilities: &'a RtpCapabilities,
    codec: &RtpCodecParameters,
) -> Option<&'a RtpCodecCapability> {
    capabilities
        .codecs
        .iter()
        .find(|capability| codec_matches(capability, codec))
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Ports of the RTC range currently bound by a transport
#[derive(Debug)]
struct PortPool {
    min: u16,
    max: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self) -> Result<u16, EngineError> {
        let mut used = lock(&self.used);
        let port = (self.min..=self.max)
            .find(|port| !used.contains(port))
            .ok_or(EngineError::PortsExhausted {
                min: self.min,
                max: self.max,
            })?;
        used.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        lock(&self.used).remove(&port);
    }

    fn in_use(&self) -> usize {
        lock(&self.used).len()
    }
}

struct EngineInner {
    config: Arc<EngineConfig>,
    ports: Arc<PortPool>,
    routers_created: AtomicUsize,
}

/// A media engine that lives inside the signaling process
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl LocalEngine {
    pub fn new(config: EngineConfig) -> Self {
        let ports = PortPool::new(config.rtc_min_port, config.rtc_max_port);
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                ports: Arc::new(ports),
                routers_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of routing contexts created since start
    pub fn routers_created(&self) -> usize {
        self.inner.routers_created.load(Ordering::SeqCst)
    }

    /// Number of RTC ports held by open transports
    pub fn ports_in_use(&self) -> usize {
        self.inner.ports.in_use()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_routing_context(
        &self,
        room: &RoomId,
    ) -> Result<Arc<dyn RoutingContext>, EngineError> {
        // Router creation round-trips through the worker
        tokio::task::yield_now().await;

        if self.inner.config.media_codecs.is_empty() {
            return Err(EngineError::Rejected("no media codecs configured".to_string()));
        }

        let router = LocalRouter::new(
            room.clone(),
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.ports),
        );
        self.inner.routers_created.fetch_add(1, Ordering::SeqCst);
        debug!(room = %room, router = %router.shared.id, "Router created");
        Ok(Arc::new(router))
    }
}

struct RouterShared {
    id: RouterId,
    room: RoomId,
    config: Arc<EngineConfig>,
    ports: Arc<PortPool>,
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, Arc<LocalProducer>>>,
    transports: Mutex<Vec<Weak<LocalTransport>>>,
    next_mid: AtomicU32,
    closed: CancellationToken,
}

impl RouterShared {
    fn producer(&self, id: ProducerId) -> Option<Arc<LocalProducer>> {
        lock(&self.producers).get(&id).cloned()
    }

    fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producer(producer) else {
            return false;
        };
        !producer.rtp_parameters.codecs.is_empty()
            && producer
                .rtp_parameters
                .codecs
                .iter()
                .all(|codec| find_capability(capabilities, codec).is_some())
    }
}

struct LocalRouter {
    shared: Arc<RouterShared>,
}

impl LocalRouter {
    fn new(room: RoomId, config: Arc<EngineConfig>, ports: Arc<PortPool>) -> Self {
        let codecs = config
            .media_codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| RtpCodecCapability {
                preferred_payload_type: codec.preferred_payload_type.or_else(|| {
                    u8::try_from(index)
                        .ok()
                        .and_then(|index| 100u8.checked_add(index))
                }),
                ..codec.clone()
            })
            .collect();

        Self {
            shared: Arc::new(RouterShared {
                id: RouterId::random(),
                room,
                config,
                ports,
                capabilities: RtpCapabilities {
                    codecs,
                    header_extensions: Vec::new(),
                },
                producers: Mutex::new(HashMap::new()),
                transports: Mutex::new(Vec::new()),
                next_mid: AtomicU32::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    fn candidates(&self) -> Result<(Vec<IceCandidate>, Vec<u16>), EngineError> {
        let config = &self.shared.config;
        let ip = config.announced_ip.unwrap_or(config.listen_ip).to_string();

        let mut protocols = Vec::new();
        if config.enable_udp {
            protocols.push(TransportProtocol::Udp);
        }
        if config.enable_tcp {
            protocols.push(TransportProtocol::Tcp);
        }
        if !config.prefer_udp {
            protocols.reverse();
        }
        if protocols.is_empty() {
            return Err(EngineError::Rejected("neither UDP nor TCP enabled".to_string()));
        }

        let mut candidates = Vec::with_capacity(protocols.len());
        let mut ports = Vec::with_capacity(protocols.len());
        for (index, protocol) in protocols.into_iter().enumerate() {
            let port = match self.shared.ports.allocate() {
                Ok(port) => port,
                Err(e) => {
                    for port in ports {
                        self.shared.ports.release(port);
                    }
                    return Err(e);
                }
            };
            ports.push(port);
            candidates.push(IceCandidate {
                foundation: match protocol {
                    TransportProtocol::Udp => "udpcandidate".to_string(),
                    TransportProtocol::Tcp => "tcpcandidate".to_string(),
                },
                priority: if index == 0 {
                    PREFERRED_CANDIDATE_PRIORITY
                } else {
                    FALLBACK_CANDIDATE_PRIORITY
                },
                ip: ip.clone(),
                protocol,
                port,
                candidate_type: "host".to_string(),
                tcp_type: match protocol {
                    TransportProtocol::Udp => None,
                    TransportProtocol::Tcp => Some("passive".to_string()),
                },
            });
        }
        Ok((candidates, ports))
    }
}

#[async_trait]
impl RoutingContext for LocalRouter {
    fn id(&self) -> RouterId {
        self.shared.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.shared.can_consume(producer, capabilities)
    }

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        tokio::task::yield_now().await;
        if self.shared.closed.is_cancelled() {
            return Err(EngineError::Closed);
        }

        let (ice_candidates, ports) = self.candidates()?;
        let ice_ufrag = Uuid::new_v4().simple().to_string();
        let options = TransportOptions {
            id: TransportId::random(),
            ice_parameters: IceParameters {
                username_fragment: ice_ufrag[..16].to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        };

        let transport = Arc::new(LocalTransport {
            direction,
            options,
            router: Arc::clone(&self.shared),
            ports,
            connected: AtomicBool::new(false),
            released: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });

        let mut transports = lock(&self.shared.transports);
        transports.retain(|transport| transport.strong_count() > 0);
        transports.push(Arc::downgrade(&transport));
        drop(transports);

        debug!(
            room = %self.shared.room,
            transport = %transport.options.id,
            %direction,
            "Transport created"
        );
        Ok(transport)
    }

    fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();

        let transports: Vec<_> = lock(&self.shared.transports)
            .drain(..)
            .filter_map(|transport| transport.upgrade())
            .collect();
        for transport in transports {
            transport.close();
        }
        debug!(room = %self.shared.room, router = %self.shared.id, "Router closed");
    }
}

struct LocalTransport {
    direction: Direction,
    options: TransportOptions,
    router: Arc<RouterShared>,
    ports: Vec<u16>,
    connected: AtomicBool,
    released: AtomicBool,
    closed: CancellationToken,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.is_cancelled() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn release_ports(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            for port in &self.ports {
                self.router.ports.release(*port);
            }
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> TransportId {
        self.options.id
    }

    fn options(&self) -> TransportOptions {
        self.options.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected("missing DTLS fingerprints".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected);
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        if self.direction != Direction::Send {
            return Err(EngineError::Rejected(
                "cannot produce on a receive transport".to_string(),
            ));
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::Rejected("no codecs in RTP parameters".to_string()));
        }
        for codec in &rtp_parameters.codecs {
            match find_capability(&self.router.capabilities, codec) {
                Some(capability) if capability.kind == kind => {}
                _ => {
                    return Err(EngineError::Rejected(format!(
                        "unsupported {kind} codec {}",
                        codec.mime_type
                    )));
                }
            }
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::random(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&self.router),
            closed: CancellationToken::new(),
        });
        lock(&self.router.producers).insert(producer.id, Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        tokio::task::yield_now().await;
        self.ensure_open()?;
        if self.direction != Direction::Receive {
            return Err(EngineError::Rejected(
                "cannot consume on a send transport".to_string(),
            ));
        }
        let source = self
            .router
            .producer(producer)
            .ok_or(EngineError::UnknownProducer(producer))?;
        if !self.router.can_consume(producer, capabilities) {
            return Err(EngineError::Rejected("incompatible capabilities".to_string()));
        }

        let codecs = source
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                find_capability(capabilities, codec).map(|capability| RtpCodecParameters {
                    payload_type: capability
                        .preferred_payload_type
                        .unwrap_or(codec.payload_type),
                    ..codec.clone()
                })
            })
            .collect();
        let mid = self.router.next_mid.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(LocalConsumer {
            id: ConsumerId::random(),
            producer_id: producer,
            kind: source.kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                encodings: source.rtp_parameters.encodings.clone(),
                header_extensions: Vec::new(),
            },
            paused: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }))
    }

    fn close(&self) {
        self.release_ports();
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            debug!(transport = %self.options.id, "Transport closed");
        }
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.release_ports();
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<RouterShared>,
    closed: CancellationToken,
}

impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(router) = self.router.upgrade() {
            lock(&router.producers).remove(&self.id);
        }
        debug!(producer = %self.id, "Producer closed");
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: CancellationToken,
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.is_cancelled() {
            return Err(EngineError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            debug!(consumer = %self.id, "Consumer closed");
        }
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}
