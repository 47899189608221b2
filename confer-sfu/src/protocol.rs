//! Session protocol
//!
//! Top-level orchestration: one [`SessionProtocol`] serves every connected
//! peer. The transport layer calls [`SessionProtocol::connect`] when a peer
//! arrives, forwards each decoded request to [`SessionProtocol::handle`] and
//! calls [`SessionProtocol::disconnect`] when the connection ends.

use crate::broker::ConsumerBroker;
use crate::catalog::ProducerCatalog;
use crate::config::SfuConfig;
use crate::engine::{EngineError, EngineEvent, MediaEngine, RtpCapabilities, RtpParameters};
use crate::error::{Result, SfuError};
use crate::message::{ConsumerDescriptor, Notification, Reply, Request};
use crate::negotiator::TransportNegotiator;
use crate::registry::PeerRegistry;
use crate::session::{PeerSession, SessionState};
use crate::types::{AppData, MediaKind, PeerId, ProducerId, TransportId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Global signaling statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuStats {
    /// Number of connected peers
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    /// False once the media engine died
    pub accepting: bool,
}

pub struct SessionProtocol {
    config: SfuConfig,
    engine: Arc<dyn MediaEngine>,
    registry: Arc<PeerRegistry>,
    negotiator: TransportNegotiator,
    catalog: ProducerCatalog,
    broker: ConsumerBroker,
    accepting: AtomicBool,
    /// Serializes the peer limit check with registration
    admission: Mutex<()>,
}

impl SessionProtocol {
    #[must_use]
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Self {
        Self::with_registry(config, engine, Arc::new(PeerRegistry::new()))
    }

    #[must_use]
    pub fn with_registry(
        config: SfuConfig,
        engine: Arc<dyn MediaEngine>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        info!(
            max_peers = config.max_peers,
            outbound_queue_capacity = config.outbound_queue_capacity,
            cascade_close = engine.closes_children_with_transport(),
            "Session protocol initialized"
        );

        Self {
            negotiator: TransportNegotiator::new(Arc::clone(&engine)),
            catalog: ProducerCatalog::new(Arc::clone(&registry), Arc::clone(&engine)),
            broker: ConsumerBroker::new(Arc::clone(&engine)),
            config,
            engine,
            registry,
            accepting: AtomicBool::new(true),
            admission: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Register a new peer and hand back its notification stream
    pub fn connect(
        &self,
        peer_id: PeerId,
    ) -> Result<(Arc<PeerSession>, mpsc::Receiver<Notification>)> {
        if !self.is_accepting() {
            return Err(SfuError::Unavailable("media engine is down".to_string()));
        }

        let _admission = self.admission.lock();

        // Enforce peer limit (0 = unlimited)
        if self.config.max_peers > 0 && self.registry.len() >= self.config.max_peers {
            warn!(
                peer_id = %peer_id,
                current_peers = self.registry.len(),
                max_peers = self.config.max_peers,
                "Peer limit reached"
            );
            return Err(SfuError::Unavailable("peer limit reached".to_string()));
        }

        self.registry
            .register(peer_id, self.config.outbound_queue_capacity)
    }

    /// Dispatch one request from `peer_id`
    pub async fn handle(&self, peer_id: &PeerId, request: Request) -> Result<Reply> {
        let session = self
            .registry
            .lookup(peer_id)
            .filter(|session| !session.is_closing())
            .ok_or_else(|| SfuError::SessionNotFound(peer_id.clone()))?;

        let method = request.method();
        debug!(peer_id = %peer_id, method, "Handling request");

        let result = match request {
            Request::GetCapabilities {} => self.get_capabilities(&session),
            Request::CreateTransport { direction } => self
                .negotiator
                .create_transport(&session, direction)
                .await
                .map(Reply::Transport),
            Request::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self
                .negotiator
                .connect_transport(&session, &transport_id, dtls_parameters)
                .await
                .map(|()| Reply::Connected { connected: true }),
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                self.produce(&session, transport_id, kind, rtp_parameters, app_data)
                    .await
            }
            Request::Consume {
                producer_id,
                rtp_capabilities,
                transport_id,
            } => {
                self.consume(&session, producer_id, rtp_capabilities, transport_id)
                    .await
            }
            Request::GetProducers {} => Ok(Reply::Producers(
                self.catalog.list_visible_to(peer_id).iter().collect(),
            )),
        };

        if let Err(e) = &result {
            debug!(peer_id = %peer_id, method, code = e.code(), error = %e, "Request failed");
        }
        result
    }

    fn get_capabilities(&self, session: &PeerSession) -> Result<Reply> {
        let capabilities = self.engine.capabilities().map_err(|e| match e {
            EngineError::NotReady | EngineError::Closed(_) => SfuError::EngineNotReady,
            other => SfuError::engine("get capabilities", other),
        })?;
        session.advance(SessionState::CapabilitiesExchanged);
        Ok(Reply::Capabilities(capabilities))
    }

    async fn produce(
        &self,
        session: &PeerSession,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<Reply> {
        let producer = self
            .catalog
            .add_producer(session, &transport_id, kind, rtp_parameters, app_data)
            .await?;

        // Recorded above, so any peer reacting to this can already find it
        let descriptor = producer.descriptor();
        let notification = Notification::NewProducer {
            peer_id: descriptor.peer_id,
            producer_id: descriptor.producer_id,
            kind: descriptor.kind,
            app_data: descriptor.app_data,
        };
        let mut delivered = 0usize;
        let announced = session.announce_producer(|| {
            for other in self.registry.others(&session.id) {
                if other.notify(notification.clone()) {
                    delivered += 1;
                }
            }
        });
        if !announced {
            debug!(
                peer_id = %session.id,
                producer_id = %producer.id,
                "Session closing, producer not announced"
            );
            return Ok(Reply::Produced { id: producer.id });
        }
        debug!(
            peer_id = %session.id,
            producer_id = %producer.id,
            delivered,
            "Broadcast new producer"
        );

        Ok(Reply::Produced { id: producer.id })
    }

    async fn consume(
        &self,
        session: &PeerSession,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        transport_id: Option<TransportId>,
    ) -> Result<Reply> {
        let consumer = self
            .broker
            .consume(
                &self.catalog,
                session,
                &producer_id,
                rtp_capabilities,
                transport_id.as_ref(),
            )
            .await?;

        let app_data = self
            .catalog
            .find(&consumer.producer_id)
            .map(|producer| producer.app_data)
            .unwrap_or_default();

        Ok(Reply::Consumer(ConsumerDescriptor {
            id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            app_data,
        }))
    }

    /// Tear down the session of `peer_id`.
    ///
    /// Safe to call any number of times and concurrently; only the first call
    /// does any work. Returns whether this call performed the teardown.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let Some(session) = self.registry.lookup(peer_id) else {
            debug!(peer_id = %peer_id, "Disconnect for unknown peer");
            return false;
        };
        if !session.begin_close() {
            debug!(peer_id = %peer_id, "Disconnect already in progress");
            return false;
        }

        let left = Notification::ParticipantLeft {
            peer_id: peer_id.clone(),
        };
        for other in self.registry.others(peer_id) {
            other.notify(left.clone());
        }

        self.registry.unregister(peer_id);

        let cascades = self.engine.closes_children_with_transport();
        let (consumers, producers) = if cascades {
            (0, 0)
        } else {
            (
                self.broker.remove_all(&session).await,
                self.catalog.remove_all(&session).await,
            )
        };

        // Trust boundary: closing a transport is relied on to close the
        // producers and consumers created on it inside the engine. Remote
        // consumers of this peer's producers learn about it from engine events.
        let transports = session.take_transports();
        let transport_count = transports.len();
        for transport in &transports {
            if let Err(e) = self.negotiator.close(&session, transport).await {
                warn!(
                    peer_id = %peer_id,
                    transport_id = %transport.id,
                    error = %e,
                    "Failed to close transport, continuing teardown"
                );
            }
        }

        session.take_producers();
        session.take_consumers();
        session.advance(SessionState::Closed);

        info!(
            peer_id = %peer_id,
            transports = transport_count,
            producers,
            consumers,
            cascades,
            connected_secs = session.connected_for().as_secs(),
            "Peer disconnected"
        );
        true
    }

    /// Relay engine lifecycle events into session state and notifications
    pub fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::ConsumerClosed {
                peer_id,
                consumer_id,
                producer_id,
            } => {
                let Some(session) = self.registry.lookup(&peer_id) else {
                    return;
                };
                if self.broker.mark_dead(&session, &consumer_id) {
                    session.notify(Notification::ConsumerClosed {
                        consumer_id,
                        producer_id,
                    });
                }
            }
            EngineEvent::ProducerClosed {
                peer_id,
                producer_id,
            } => {
                if let Some(session) = self.registry.lookup(&peer_id) {
                    if session.remove_producer(&producer_id).is_some() {
                        debug!(
                            peer_id = %peer_id,
                            producer_id = %producer_id,
                            "Producer closed by engine"
                        );
                    }
                }
            }
            EngineEvent::TransportClosed {
                peer_id,
                transport_id,
            } => {
                debug!(
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    "Transport closed by engine"
                );
            }
            EngineEvent::Died { reason } => {
                self.accepting.store(false, Ordering::SeqCst);
                error!(reason = %reason, "Media engine died, no longer accepting peers");
            }
        }
    }

    /// Subscribe to engine events and relay them until the engine or this
    /// protocol goes away.
    pub fn spawn_engine_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.engine.subscribe();
        let protocol: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(protocol) = protocol.upgrade() else {
                            break;
                        };
                        protocol.handle_engine_event(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Engine event watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Engine event watcher stopped");
        })
    }

    #[must_use]
    pub fn stats(&self) -> SfuStats {
        let mut stats = SfuStats {
            accepting: self.is_accepting(),
            ..Default::default()
        };
        for session in self.registry.all() {
            let session_stats = session.stats();
            stats.peers += 1;
            stats.transports += session_stats.transports;
            stats.producers += session_stats.producers;
            stats.consumers += session_stats.consumers;
        }
        stats
    }
}
