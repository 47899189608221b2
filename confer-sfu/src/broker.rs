//! Consumer broker
//!
//! Binds a remote producer to a peer's recv transport. Compatibility is
//! checked with the engine before anything is allocated, so a rejected request
//! leaves nothing behind.

use crate::catalog::ProducerCatalog;
use crate::engine::{EngineError, MediaEngine, RtpCapabilities};
use crate::error::{Result, SfuError};
use crate::session::{ConsumerHandle, PeerSession};
use crate::types::{ConsumerId, Direction, ProducerId, TransportId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConsumerBroker {
    engine: Arc<dyn MediaEngine>,
}

impl ConsumerBroker {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Create a consumer of `producer_id` for `session`.
    ///
    /// Without an explicit `transport_id` the session's preferred recv
    /// transport is used (most recently connected, else most recently created).
    pub async fn consume(
        &self,
        catalog: &ProducerCatalog,
        session: &PeerSession,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        transport_id: Option<&TransportId>,
    ) -> Result<ConsumerHandle> {
        let transport = match transport_id {
            Some(id) => {
                let transport = session
                    .transport(id)
                    .ok_or_else(|| SfuError::TransportNotFound(id.clone()))?;
                if transport.direction != Direction::Recv {
                    return Err(SfuError::NoRecvTransport);
                }
                transport
            }
            None => session
                .preferred_recv_transport()
                .ok_or(SfuError::NoRecvTransport)?,
        };

        // weak reference: resolved by id, never held
        let producer = catalog
            .find(producer_id)
            .ok_or_else(|| SfuError::ProducerGone(producer_id.clone()))?;

        match self.engine.can_consume(producer_id, &rtp_capabilities) {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    peer_id = %session.id,
                    producer_id = %producer_id,
                    "Rejecting consume with incompatible capabilities"
                );
                return Err(SfuError::IncompatibleCapabilities(producer_id.clone()));
            }
            Err(EngineError::ProducerNotFound(_)) => {
                return Err(SfuError::ProducerGone(producer_id.clone()));
            }
            Err(e) => return Err(SfuError::engine("check capabilities", e)),
        }

        let info = self
            .engine
            .consume(&transport.id, producer_id, rtp_capabilities)
            .await
            .map_err(|e| match e {
                EngineError::ProducerNotFound(_) => SfuError::ProducerGone(producer_id.clone()),
                EngineError::CannotConsume(_) => {
                    SfuError::IncompatibleCapabilities(producer_id.clone())
                }
                other => SfuError::engine("consume", other),
            })?;

        let handle = ConsumerHandle {
            id: info.id,
            kind: info.kind,
            producer_id: info.producer_id,
            peer_id: session.id.clone(),
            transport_id: transport.id,
            rtp_parameters: info.rtp_parameters,
        };
        if let Err(rejected) = session.record_consumer(handle.clone()) {
            if let Err(e) = self.engine.close_consumer(&rejected.id).await {
                warn!(consumer_id = %rejected.id, error = %e, "Failed to close orphaned consumer");
            }
            return Err(SfuError::SessionNotFound(session.id.clone()));
        }

        info!(
            peer_id = %session.id,
            consumer_id = %handle.id,
            producer_id = %producer_id,
            producer_peer = %producer.peer_id,
            kind = %handle.kind,
            "Consumer created"
        );
        Ok(handle)
    }

    /// Forget a consumer whose producer went away.
    /// Returns false if the session no longer tracks it.
    pub fn mark_dead(&self, session: &PeerSession, consumer_id: &ConsumerId) -> bool {
        let removed = session.remove_consumer(consumer_id).is_some();
        if removed {
            debug!(peer_id = %session.id, consumer_id = %consumer_id, "Consumer marked dead");
        }
        removed
    }

    /// Close every consumer the session owns. Teardown only.
    pub async fn remove_all(&self, session: &PeerSession) -> usize {
        let consumers = session.take_consumers();
        let count = consumers.len();
        for consumer in consumers {
            match self.engine.close_consumer(&consumer.id).await {
                // already closed together with its producer
                Ok(()) | Err(EngineError::ConsumerNotFound(_)) => {}
                Err(e) => warn!(
                    peer_id = %session.id,
                    consumer_id = %consumer.id,
                    error = %e,
                    "Failed to close consumer during teardown"
                ),
            }
        }
        debug!(peer_id = %session.id, count, "Consumers closed");
        count
    }
}
