//! Error types for the SFU signaling layer

use crate::engine::EngineError;
use crate::types::{PeerId, ProducerId, TransportId};
use thiserror::Error;

/// Errors returned to the peer that issued a request
#[derive(Debug, Error)]
pub enum SfuError {
    #[error("Session not found: {0}")]
    SessionNotFound(PeerId),

    #[error("Session already registered: {0}")]
    DuplicateSession(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("No send transport available")]
    NoSendTransport,

    #[error("No recv transport available")]
    NoRecvTransport,

    #[error("RTP capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(ProducerId),

    #[error("Producer is gone: {0}")]
    ProducerGone(ProducerId),

    #[error("Media engine not ready")]
    EngineNotReady,

    #[error("{context}: {source}")]
    EngineFailure {
        context: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SfuError {
    pub(crate) const fn engine(context: &'static str, source: EngineError) -> Self {
        Self::EngineFailure { context, source }
    }

    /// Stable machine-readable code carried in error replies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::DuplicateSession(_) => "DUPLICATE_SESSION",
            Self::TransportNotFound(_) => "TRANSPORT_NOT_FOUND",
            Self::NoSendTransport => "NO_SEND_TRANSPORT",
            Self::NoRecvTransport => "NO_RECV_TRANSPORT",
            Self::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            Self::ProducerGone(_) => "PRODUCER_GONE",
            Self::EngineNotReady => "ENGINE_NOT_READY",
            Self::EngineFailure { .. } => "ENGINE_FAILURE",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, SfuError>;
