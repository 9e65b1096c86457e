//! Media engine facade
//!
//! The signaling core never touches media itself. It asks a [`MediaEngine`]
//! for one [`RoutingContext`] per room and, through it, for transports,
//! producers and consumers. Every call that may need the engine's worker is
//! `async`; accessors that only read cached state are not.
//!
//! Handles report their own closure through [`CancellationToken`]s returned by
//! `closed()`. Closing a router closes its transports, but nothing cascades
//! further: whoever owns a producer or consumer watches the transport it lives
//! on and closes it in turn.

mod local;

pub use local::LocalEngine;

use crate::error::EngineError;
use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, Direction, DtlsParameters, MediaKind, ProducerId, RoomId, RouterId,
    RtpCapabilities, RtpParameters, TransportId, TransportOptions,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point of a media engine
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Create the routing context for a room
    ///
    /// Callers are responsible for creating at most one context per room.
    async fn create_routing_context(
        &self,
        room: &RoomId,
    ) -> Result<Arc<dyn RoutingContext>, EngineError>;
}

/// A per-room router shared by every peer of the room
#[async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> RouterId;

    /// The capability descriptor handed to peers on join
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `capabilities` could receive `producer`
    fn can_consume(&self, producer: ProducerId, capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Close the router together with every transport created on it
    fn close(&self);
}

/// One directional network path of a peer
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE and DTLS parameters the peer needs to reach this transport
    fn options(&self) -> TransportOptions;

    /// Complete the DTLS handshake with the peer's parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer: ProducerId,
        capabilities: &RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    fn close(&self);

    /// Cancelled once the transport is closed
    fn closed(&self) -> CancellationToken;
}

/// An outbound media stream
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn close(&self);

    /// Cancelled once the producer is closed
    fn closed(&self) -> CancellationToken;
}

/// A subscription of one peer to another peer's producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self);

    /// Cancelled once the consumer is closed
    fn closed(&self) -> CancellationToken;
}
