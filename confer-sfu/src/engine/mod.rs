//! Media engine adapter
//!
//! The signaling layer never touches RTP itself. Everything that allocates
//! network or media resources goes through [`MediaEngine`], which an SFU
//! backend implements. [`LocalMediaEngine`] is an in-process implementation
//! that tracks transports, producers and consumers the way a router-based
//! engine does; it backs the default server build and the test suite.

mod local;
pub mod rtp;

pub use local::{EngineConfig, LocalMediaEngine};
pub use rtp::{
    ConsumerInfo, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    ProducerInfo, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpParameters,
    TransportParams,
};

use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Media engine not ready")]
    NotReady,

    #[error("Media engine closed: {0}")]
    Closed(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Transport not connected: {0}")]
    NotConnected(TransportId),

    #[error("Transport {transport} has direction {actual}, expected {expected}")]
    WrongDirection {
        transport: TransportId,
        expected: Direction,
        actual: Direction,
    },

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("Invalid RTP parameters: {0}")]
    InvalidRtpParameters(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("RTP capabilities cannot consume producer {0}")]
    CannotConsume(ProducerId),
}

/// Lifecycle signals emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    TransportClosed {
        peer_id: PeerId,
        transport_id: TransportId,
    },
    ProducerClosed {
        peer_id: PeerId,
        producer_id: ProducerId,
    },
    /// A consumer was closed because its producer went away
    ConsumerClosed {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    /// The engine can no longer serve any request
    Died { reason: String },
}

/// Call surface of the media engine consumed by the signaling layer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router RTP capabilities peers load before producing or consuming
    fn capabilities(&self) -> Result<RtpCapabilities, EngineError>;

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo, EngineError>;

    /// Whether a peer with `rtp_capabilities` is able to receive `producer_id`.
    /// Must not allocate anything.
    fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    /// Whether closing a transport also closes the producers and consumers
    /// created on it.
    fn closes_children_with_transport(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
