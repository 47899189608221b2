//! Transport negotiation
//!
//! Creates and DTLS-connects the engine transports a peer needs: normally one
//! `send` and one `recv`. A second transport of the same direction is allowed;
//! both stay tracked until closed.

use crate::engine::{DtlsParameters, MediaEngine, TransportParams};
use crate::error::{Result, SfuError};
use crate::session::{PeerSession, SessionState, TransportHandle};
use crate::types::{Direction, DtlsState, TransportId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransportNegotiator {
    engine: Arc<dyn MediaEngine>,
}

impl TransportNegotiator {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Create a transport for `session` and return the engine's ICE/DTLS
    /// parameters untouched, ready to forward to the peer.
    pub async fn create_transport(
        &self,
        session: &PeerSession,
        direction: Direction,
    ) -> Result<TransportParams> {
        let existing = session.transports_with(direction);
        if existing > 0 {
            warn!(
                peer_id = %session.id,
                %direction,
                existing,
                "Peer already has a transport in this direction; tracking both"
            );
        }

        let params = self
            .engine
            .create_transport(&session.id, direction)
            .await
            .map_err(|e| SfuError::engine("create transport", e))?;

        let handle = TransportHandle::new(params.id.clone(), direction);
        if let Err(rejected) = session.add_transport(handle) {
            // peer left while the engine was working
            self.close_quietly(&rejected.id).await;
            return Err(SfuError::SessionNotFound(session.id.clone()));
        }
        session.advance(SessionState::Negotiating);

        info!(
            peer_id = %session.id,
            transport_id = %params.id,
            %direction,
            "Transport created"
        );
        Ok(params)
    }

    /// DTLS-connect a transport owned by `session`.
    ///
    /// Repeated connects are passed through; whether they succeed is up to the
    /// engine.
    pub async fn connect_transport(
        &self,
        session: &PeerSession,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let transport = session
            .transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        session.set_dtls_state(transport_id, DtlsState::Connecting);
        match self
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await
        {
            Ok(()) => {
                session.set_dtls_state(transport_id, DtlsState::Connected);
                session.advance(SessionState::Active);
                info!(
                    peer_id = %session.id,
                    transport_id = %transport_id,
                    direction = %transport.direction,
                    "Transport connected"
                );
                Ok(())
            }
            Err(e) => {
                session.set_dtls_state(transport_id, transport.dtls_state);
                Err(SfuError::engine("connect transport", e))
            }
        }
    }

    /// Close a transport in the engine and mark the handle closed
    pub async fn close(&self, session: &PeerSession, transport: &TransportHandle) -> Result<()> {
        session.set_dtls_state(&transport.id, DtlsState::Closed);
        self.engine
            .close_transport(&transport.id)
            .await
            .map_err(|e| SfuError::engine("close transport", e))?;
        debug!(peer_id = %session.id, transport_id = %transport.id, "Transport closed");
        Ok(())
    }

    async fn close_quietly(&self, transport_id: &TransportId) {
        if let Err(e) = self.engine.close_transport(transport_id).await {
            warn!(transport_id = %transport_id, error = %e, "Failed to close orphaned transport");
        }
    }
}
