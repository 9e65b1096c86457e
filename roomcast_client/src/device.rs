//! The local media device the controller drives
//!
//! A [`Device`] owns everything that happens on the peer itself: loading the
//! router's capabilities, building the local halves of the two transports,
//! encoding the captured track and rendering received media. The controller
//! only moves descriptors between the device and the signaling server.

use crate::error::DeviceError;
use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, ConsumerParams, Direction, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind,
    ProducerId, RtpCapabilities, RtpCodecParameters, RtpParameters, TransportId, TransportOptions,
};
use uuid::Uuid;

#[async_trait]
pub trait Device: Send {
    /// Captured media handed to [`NegotiationController::set_local_media`]
    ///
    /// [`NegotiationController::set_local_media`]: crate::NegotiationController::set_local_media
    type LocalTrack: Send + Sync;

    /// Received media bound to a remote peer's output slot
    type RemoteTrack: Send;

    /// Load the router's capability descriptor
    async fn load(&mut self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError>;

    /// What this device can receive, once loaded
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    /// Build the local send transport and return its DTLS parameters
    async fn create_send_transport(
        &mut self,
        options: TransportOptions,
    ) -> Result<DtlsParameters, DeviceError>;

    /// Build the local receive transport and return its DTLS parameters
    async fn create_recv_transport(
        &mut self,
        options: TransportOptions,
    ) -> Result<DtlsParameters, DeviceError>;

    /// Start sending `track` on the send transport
    async fn produce(
        &mut self,
        track: &Self::LocalTrack,
    ) -> Result<(MediaKind, RtpParameters), DeviceError>;

    /// Start receiving the stream described by `params`
    async fn consume(&mut self, params: &ConsumerParams) -> Result<Self::RemoteTrack, DeviceError>;
}

/// A track with no real capture behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticTrack {
    pub kind: MediaKind,
    pub label: String,
}

impl SyntheticTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            label: format!("{kind}-{}", Uuid::new_v4()),
        }
    }
}

/// What a [`HeadlessDevice`] records for each consumed stream
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedTrack {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// A device without media I/O
///
/// Negotiates exactly like a browser would: it picks the router's preferred
/// codec for the track's kind and answers transports with a fresh fingerprint.
/// Used by bots, load tests and the integration suite.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    next_mid: u32,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.capabilities.is_some()
    }

    pub fn transport(&self, direction: Direction) -> Option<TransportId> {
        match direction {
            Direction::Send => self.send_transport,
            Direction::Receive => self.recv_transport,
        }
    }

    fn local_dtls() -> DtlsParameters {
        let digest = Uuid::new_v4().simple().to_string().to_uppercase();
        let value = digest
            .as_bytes()
            .chunks(2)
            .filter_map(|pair| std::str::from_utf8(pair).ok())
            .collect::<Vec<_>>()
            .join(":");
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value,
            }],
        }
    }
}

#[async_trait]
impl Device for HeadlessDevice {
    type LocalTrack = SyntheticTrack;
    type RemoteTrack = ReceivedTrack;

    async fn load(&mut self, router_capabilities: RtpCapabilities) -> Result<(), DeviceError> {
        self.capabilities = Some(router_capabilities);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities.clone()
    }

    async fn create_send_transport(
        &mut self,
        options: TransportOptions,
    ) -> Result<DtlsParameters, DeviceError> {
        if self.capabilities.is_none() {
            return Err(DeviceError::NotLoaded);
        }
        self.send_transport = Some(options.id);
        Ok(Self::local_dtls())
    }

    async fn create_recv_transport(
        &mut self,
        options: TransportOptions,
    ) -> Result<DtlsParameters, DeviceError> {
        if self.capabilities.is_none() {
            return Err(DeviceError::NotLoaded);
        }
        self.recv_transport = Some(options.id);
        Ok(Self::local_dtls())
    }

    async fn produce(
        &mut self,
        track: &SyntheticTrack,
    ) -> Result<(MediaKind, RtpParameters), DeviceError> {
        let capabilities = self.capabilities.as_ref().ok_or(DeviceError::NotLoaded)?;
        if self.send_transport.is_none() {
            return Err(DeviceError::NoTransport(Direction::Send));
        }
        let codec = capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == track.kind)
            .ok_or_else(|| DeviceError::Unsupported(format!("no {} codec", track.kind)))?;

        let mid = self.next_mid;
        self.next_mid += 1;
        Ok((
            track.kind,
            RtpParameters {
                mid: Some(mid.to_string()),
                codecs: vec![RtpCodecParameters {
                    mime_type: codec.mime_type.clone(),
                    payload_type: codec.preferred_payload_type.unwrap_or(96),
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    parameters: codec.parameters.clone(),
                }],
                encodings: Vec::new(),
                header_extensions: Vec::new(),
            },
        ))
    }

    async fn consume(&mut self, params: &ConsumerParams) -> Result<ReceivedTrack, DeviceError> {
        if self.recv_transport.is_none() {
            return Err(DeviceError::NoTransport(Direction::Receive));
        }
        Ok(ReceivedTrack {
            consumer_id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            rtp_parameters: params.rtp_parameters.clone(),
        })
    }
}
