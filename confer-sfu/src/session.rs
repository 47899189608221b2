//! Per-peer session state
//!
//! A [`PeerSession`] tracks the engine resources negotiated on behalf of one
//! connected peer and owns the sending half of that peer's notification queue.
//! Resource lists are only mutated for requests naming this peer, or by the
//! teardown path once the session is marked closing.

use crate::engine::RtpParameters;
use crate::message::{Notification, ProducerDescriptor};
use crate::types::{
    AppData, ConsumerId, Direction, DtlsState, MediaKind, PeerId, ProducerId, TransportId,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Expected progress of a peer through the signaling handshake.
///
/// Labels describe usage; they never gate requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Connected,
    CapabilitiesExchanged,
    Negotiating,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportHandle {
    pub id: TransportId,
    pub direction: Direction,
    pub dtls_state: DtlsState,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
}

impl TransportHandle {
    #[must_use]
    pub fn new(id: TransportId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            dtls_state: DtlsState::New,
            created_at: Instant::now(),
            connected_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerHandle {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
    pub transport_id: TransportId,
    pub app_data: AppData,
}

impl ProducerHandle {
    #[must_use]
    pub fn descriptor(&self) -> ProducerDescriptor {
        ProducerDescriptor {
            peer_id: self.peer_id.clone(),
            producer_id: self.id.clone(),
            kind: self.kind,
            app_data: self.app_data.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub kind: MediaKind,
    /// Lookup key only; the producer is owned by another session
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub transport_id: TransportId,
    pub rtp_parameters: RtpParameters,
}

/// Resource counts of a single session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// One connected peer
#[derive(Debug)]
pub struct PeerSession {
    pub id: PeerId,
    connected_at: Instant,
    state: Mutex<SessionState>,
    closing: AtomicBool,
    transports: RwLock<Vec<TransportHandle>>,
    producers: RwLock<Vec<ProducerHandle>>,
    consumers: RwLock<Vec<ConsumerHandle>>,
    notify_tx: mpsc::Sender<Notification>,
}

impl PeerSession {
    /// Create a session and the receiving half of its notification queue
    #[must_use]
    pub fn new(id: PeerId, queue_capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::channel(queue_capacity.max(1));
        let session = Self {
            id,
            connected_at: Instant::now(),
            state: Mutex::new(SessionState::Connected),
            closing: AtomicBool::new(false),
            transports: RwLock::new(Vec::new()),
            producers: RwLock::new(Vec::new()),
            consumers: RwLock::new(Vec::new()),
            notify_tx,
        };
        (session, notify_rx)
    }

    /// Queue a notification without waiting.
    /// Returns false if the queue is full (slow peer) or closed.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.notify_tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(peer_id = %self.id, ?dropped, "Notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer_id = %self.id, "Notification queue closed");
                false
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move forward to `next`; never moves backwards and never leaves `Closed`
    pub fn advance(&self, next: SessionState) {
        let mut state = self.state.lock();
        if next > *state {
            debug!(peer_id = %self.id, from = ?*state, to = ?next, "Session state advanced");
            *state = next;
        }
    }

    #[must_use]
    pub fn connected_for(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Mark the session as being torn down.
    /// Returns true only for the first caller.
    pub fn begin_close(&self) -> bool {
        let _producers = self.producers.write();
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Run `announce` for a recorded producer unless the session is closing.
    /// Teardown waits for an announcement in flight, so a peer never sees
    /// this session leave before one of its producers appears.
    pub fn announce_producer(&self, announce: impl FnOnce()) -> bool {
        let _producers = self.producers.read();
        if self.is_closing() {
            return false;
        }
        announce();
        true
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    // Recording methods take the list lock before checking `closing`, and
    // teardown sets `closing` before draining, so nothing recorded after the
    // drain can be missed. A rejected handle is returned to the caller, which
    // owns closing it in the engine.

    pub fn add_transport(&self, handle: TransportHandle) -> Result<(), TransportHandle> {
        let mut transports = self.transports.write();
        if self.is_closing() {
            return Err(handle);
        }
        transports.push(handle);
        Ok(())
    }

    #[must_use]
    pub fn transport(&self, id: &TransportId) -> Option<TransportHandle> {
        self.transports.read().iter().find(|t| &t.id == id).cloned()
    }

    #[must_use]
    pub fn has_transport(&self, direction: Direction) -> bool {
        self.transports
            .read()
            .iter()
            .any(|t| t.direction == direction && t.dtls_state != DtlsState::Closed)
    }

    #[must_use]
    pub fn transports_with(&self, direction: Direction) -> usize {
        self.transports
            .read()
            .iter()
            .filter(|t| t.direction == direction && t.dtls_state != DtlsState::Closed)
            .count()
    }

    /// Update the DTLS state of a tracked transport. Returns false if unknown.
    pub fn set_dtls_state(&self, id: &TransportId, dtls_state: DtlsState) -> bool {
        let mut transports = self.transports.write();
        let Some(transport) = transports.iter_mut().find(|t| &t.id == id) else {
            return false;
        };
        transport.dtls_state = dtls_state;
        if dtls_state == DtlsState::Connected {
            transport.connected_at = Some(Instant::now());
        }
        true
    }

    /// The recv transport consumers are placed on when the peer names none:
    /// the most recently connected one, else the most recently created one.
    #[must_use]
    pub fn preferred_recv_transport(&self) -> Option<TransportHandle> {
        let transports = self.transports.read();
        let open = || {
            transports
                .iter()
                .filter(|t| t.direction == Direction::Recv && t.dtls_state != DtlsState::Closed)
        };
        open()
            .filter(|t| t.connected_at.is_some())
            .max_by_key(|t| t.connected_at)
            .or_else(|| open().last())
            .cloned()
    }

    pub fn record_producer(&self, handle: ProducerHandle) -> Result<(), ProducerHandle> {
        let mut producers = self.producers.write();
        if self.is_closing() {
            return Err(handle);
        }
        producers.push(handle);
        Ok(())
    }

    #[must_use]
    pub fn producer(&self, id: &ProducerId) -> Option<ProducerHandle> {
        self.producers.read().iter().find(|p| &p.id == id).cloned()
    }

    /// Producers in insertion order; empty once the session is closing
    #[must_use]
    pub fn producer_descriptors(&self) -> Vec<ProducerDescriptor> {
        let producers = self.producers.read();
        if self.is_closing() {
            return Vec::new();
        }
        producers.iter().map(ProducerHandle::descriptor).collect()
    }

    pub fn remove_producer(&self, id: &ProducerId) -> Option<ProducerHandle> {
        let mut producers = self.producers.write();
        let index = producers.iter().position(|p| &p.id == id)?;
        Some(producers.remove(index))
    }

    pub fn record_consumer(&self, handle: ConsumerHandle) -> Result<(), ConsumerHandle> {
        let mut consumers = self.consumers.write();
        if self.is_closing() {
            return Err(handle);
        }
        consumers.push(handle);
        Ok(())
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<ConsumerHandle> {
        self.consumers.read().clone()
    }

    pub fn remove_consumer(&self, id: &ConsumerId) -> Option<ConsumerHandle> {
        let mut consumers = self.consumers.write();
        let index = consumers.iter().position(|c| &c.id == id)?;
        Some(consumers.remove(index))
    }

    /// Drain every tracked transport. Teardown only.
    pub fn take_transports(&self) -> Vec<TransportHandle> {
        std::mem::take(&mut *self.transports.write())
    }

    /// Drain every tracked producer. Teardown only.
    pub fn take_producers(&self) -> Vec<ProducerHandle> {
        std::mem::take(&mut *self.producers.write())
    }

    /// Drain every tracked consumer. Teardown only.
    pub fn take_consumers(&self) -> Vec<ConsumerHandle> {
        std::mem::take(&mut *self.consumers.write())
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            transports: self.transports.read().len(),
            producers: self.producers.read().len(),
            consumers: self.consumers.read().len(),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        debug!(
            peer_id = %self.id,
            connected_secs = self.connected_at.elapsed().as_secs(),
            "PeerSession dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(peer: &str, id: &str) -> ProducerHandle {
        ProducerHandle {
            id: ProducerId::from(id),
            kind: MediaKind::Audio,
            peer_id: PeerId::from(peer),
            transport_id: TransportId::from("t"),
            app_data: AppData::new(),
        }
    }

    #[test]
    fn test_state_only_moves_forward() {
        let (session, _rx) = PeerSession::new(PeerId::from("a"), 4);
        assert_eq!(session.state(), SessionState::Connected);

        session.advance(SessionState::Negotiating);
        session.advance(SessionState::CapabilitiesExchanged);
        assert_eq!(session.state(), SessionState::Negotiating);

        session.advance(SessionState::Closed);
        session.advance(SessionState::Active);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_no_announcement_once_closing() {
        let (session, _rx) = PeerSession::new(PeerId::from("a"), 4);
        let mut announced = 0;
        assert!(session.announce_producer(|| announced += 1));

        assert!(session.begin_close());
        assert!(!session.announce_producer(|| announced += 1));
        assert_eq!(announced, 1);
    }

    #[test]
    fn test_debug_names_peer() {
        let (session, _rx) = PeerSession::new(PeerId::from("debug-peer"), 4);
        let rendered = format!("{session:?}");
        assert!(rendered.contains("debug-peer"));
    }

    #[tokio::test]
    async fn test_notify_drops_when_queue_full() {
        let (session, mut rx) = PeerSession::new(PeerId::from("a"), 1);
        let left = |p: &str| Notification::ParticipantLeft {
            peer_id: PeerId::from(p),
        };

        assert!(session.notify(left("b")));
        assert!(!session.notify(left("c")));
        assert_eq!(rx.recv().await, Some(left("b")));

        drop(rx);
        assert!(!session.notify(left("d")));
    }

    #[test]
    fn test_begin_close_is_exclusive_and_blocks_recording() {
        let (session, _rx) = PeerSession::new(PeerId::from("a"), 4);
        session.record_producer(producer("a", "p1")).unwrap();

        assert!(session.begin_close());
        assert!(!session.begin_close());

        let rejected = session.record_producer(producer("a", "p2")).unwrap_err();
        assert_eq!(rejected.id.as_str(), "p2");
        assert!(session
            .add_transport(TransportHandle::new(TransportId::from("t2"), Direction::Send))
            .is_err());
        assert!(session.producer_descriptors().is_empty());
        assert_eq!(session.take_producers().len(), 1);
    }

    #[test]
    fn test_preferred_recv_transport_tie_break() {
        let (session, _rx) = PeerSession::new(PeerId::from("a"), 4);
        assert!(session.preferred_recv_transport().is_none());

        for id in ["r1", "r2", "r3"] {
            session
                .add_transport(TransportHandle::new(TransportId::from(id), Direction::Recv))
                .unwrap();
        }
        session
            .add_transport(TransportHandle::new(TransportId::from("s1"), Direction::Send))
            .unwrap();

        // nothing connected: newest recv transport
        assert_eq!(session.preferred_recv_transport().unwrap().id.as_str(), "r3");

        assert!(session.set_dtls_state(&TransportId::from("r1"), DtlsState::Connected));
        assert_eq!(session.preferred_recv_transport().unwrap().id.as_str(), "r1");

        std::thread::sleep(std::time::Duration::from_millis(2));
        session.set_dtls_state(&TransportId::from("r2"), DtlsState::Connected);
        assert_eq!(session.preferred_recv_transport().unwrap().id.as_str(), "r2");

        assert!(!session.set_dtls_state(&TransportId::from("missing"), DtlsState::Connected));
        assert_eq!(session.transports_with(Direction::Recv), 3);
    }

    #[test]
    fn test_producer_descriptors_keep_insertion_order() {
        let (session, _rx) = PeerSession::new(PeerId::from("a"), 4);
        for id in ["p1", "p2", "p3"] {
            session.record_producer(producer("a", id)).unwrap();
        }
        session.remove_producer(&ProducerId::from("p2"));

        let ids: Vec<_> = session
            .producer_descriptors()
            .into_iter()
            .map(|d| d.producer_id.to_string())
            .collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(session.stats().producers, 2);
    }
}
