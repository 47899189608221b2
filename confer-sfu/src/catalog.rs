//! Producer catalog
//!
//! Producers are stored on the session that created them. The catalog adds
//! them through the engine and answers visibility queries by scanning the
//! registry, so there is no second index to keep consistent.

use crate::engine::{MediaEngine, RtpParameters};
use crate::error::{Result, SfuError};
use crate::message::ProducerDescriptor;
use crate::registry::PeerRegistry;
use crate::session::{PeerSession, ProducerHandle};
use crate::types::{AppData, Direction, MediaKind, PeerId, ProducerId, TransportId};
use std::iter::FlatMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ProducerCatalog {
    registry: Arc<PeerRegistry>,
    engine: Arc<dyn MediaEngine>,
}

impl ProducerCatalog {
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>, engine: Arc<dyn MediaEngine>) -> Self {
        Self { registry, engine }
    }

    /// Create a producer on one of the session's send transports
    pub async fn add_producer(
        &self,
        session: &PeerSession,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerHandle> {
        if !session.has_transport(Direction::Send) {
            return Err(SfuError::NoSendTransport);
        }
        let transport = session
            .transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != Direction::Send {
            return Err(SfuError::NoSendTransport);
        }

        let info = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await
            .map_err(|e| SfuError::engine("produce", e))?;

        let handle = ProducerHandle {
            id: info.id,
            kind: info.kind,
            peer_id: session.id.clone(),
            transport_id: transport_id.clone(),
            app_data,
        };
        if let Err(rejected) = session.record_producer(handle.clone()) {
            if let Err(e) = self.engine.close_producer(&rejected.id).await {
                warn!(producer_id = %rejected.id, error = %e, "Failed to close orphaned producer");
            }
            return Err(SfuError::SessionNotFound(session.id.clone()));
        }

        info!(
            peer_id = %session.id,
            producer_id = %handle.id,
            kind = %handle.kind,
            "Producer added"
        );
        Ok(handle)
    }

    /// Producers of every peer other than `requester`
    #[must_use]
    pub fn list_visible_to(&self, requester: &PeerId) -> VisibleProducers {
        VisibleProducers {
            registry: Arc::clone(&self.registry),
            requester: requester.clone(),
        }
    }

    /// Resolve a producer id to its live handle
    #[must_use]
    pub fn find(&self, producer_id: &ProducerId) -> Option<ProducerHandle> {
        self.registry
            .all()
            .iter()
            .filter(|session| !session.is_closing())
            .find_map(|session| session.producer(producer_id))
    }

    /// Close every producer the session owns. Teardown only.
    pub async fn remove_all(&self, session: &PeerSession) -> usize {
        let producers = session.take_producers();
        let count = producers.len();
        for producer in producers {
            if let Err(e) = self.engine.close_producer(&producer.id).await {
                warn!(
                    peer_id = %session.id,
                    producer_id = %producer.id,
                    error = %e,
                    "Failed to close producer during teardown"
                );
            }
        }
        debug!(peer_id = %session.id, count, "Producers closed");
        count
    }
}

/// Lazy view over the producers visible to one peer.
///
/// Each call to [`VisibleProducers::iter`] starts a fresh scan. Order is stable
/// within a peer (insertion order) and unspecified across peers. A peer that
/// disconnects mid-scan simply contributes nothing.
pub struct VisibleProducers {
    registry: Arc<PeerRegistry>,
    requester: PeerId,
}

pub type VisibleIter = FlatMap<
    std::vec::IntoIter<Arc<PeerSession>>,
    Vec<ProducerDescriptor>,
    fn(Arc<PeerSession>) -> Vec<ProducerDescriptor>,
>;

fn descriptors_of(session: Arc<PeerSession>) -> Vec<ProducerDescriptor> {
    session.producer_descriptors()
}

impl VisibleProducers {
    #[must_use]
    pub fn iter(&self) -> VisibleIter {
        self.registry
            .others(&self.requester)
            .into_iter()
            .flat_map(descriptors_of as fn(Arc<PeerSession>) -> Vec<ProducerDescriptor>)
    }
}

impl IntoIterator for &VisibleProducers {
    type Item = ProducerDescriptor;
    type IntoIter = VisibleIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
