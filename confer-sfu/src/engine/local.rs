//! In-process media engine
//!
//! Models a single router: transports belong to a peer and a direction,
//! producers live on connected send transports, consumers on recv transports.
//! Closing a producer closes every consumer of it; closing a transport closes
//! its children when `cascade_close` is set.

use super::rtp::{CodecKey, RtcpFeedback};
use super::{
    ConsumerInfo, DtlsFingerprint, DtlsParameters, DtlsRole, EngineError, EngineEvent,
    IceCandidate, IceParameters, MediaEngine, ProducerInfo, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpParameters, TransportParams,
};
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Capacity of the engine event channel
const ENGINE_EVENT_CAPACITY: usize = 1024;

/// Local media engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IP address advertised in ICE candidates
    pub announced_ip: String,
    /// Lowest UDP port handed out for transports
    pub rtc_min_port: u16,
    /// Highest UDP port handed out for transports
    pub rtc_max_port: u16,
    /// Close producers and consumers together with their transport
    pub cascade_close: bool,
    /// Codecs the router accepts
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            cascade_close: true,
            media_codecs: default_media_codecs(),
        }
    }
}

fn feedback(kind: &str, parameter: &str) -> RtcpFeedback {
    RtcpFeedback {
        kind: kind.to_string(),
        parameter: parameter.to_string(),
    }
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Opus, VP8 and baseline H264
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = vec![
        feedback("nack", ""),
        feedback("nack", "pli"),
        feedback("ccm", "fir"),
        feedback("goog-remb", ""),
        feedback("transport-cc", ""),
    ];
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(100),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: vec![feedback("transport-cc", "")],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: Some(102),
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1
            })),
            rtcp_feedback: video_feedback,
        },
    ]
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    vec![
        RtpHeaderExtension {
            kind: None,
            uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
            preferred_id: 1,
        },
        RtpHeaderExtension {
            kind: Some(MediaKind::Audio),
            uri: "urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_string(),
            preferred_id: 10,
        },
        RtpHeaderExtension {
            kind: None,
            uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
            preferred_id: 4,
        },
    ]
}

fn is_rtx(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().ends_with("/rtx")
}

fn random_ssrc() -> u32 {
    // low 32 bits of a v4 uuid are random
    (uuid::Uuid::new_v4().as_u128() & u128::from(u32::MAX)) as u32
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

struct LocalTransport {
    peer_id: PeerId,
    direction: Direction,
    connected: bool,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
    /// Next consumer MID; never reused on this transport
    next_mid: u32,
}

struct LocalProducer {
    peer_id: PeerId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: Vec<ConsumerId>,
}

struct LocalConsumer {
    peer_id: PeerId,
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
}

impl EngineState {
    fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<LocalConsumer> {
        let consumer = self.consumers.remove(consumer_id)?;
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.retain(|id| id != consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.retain(|id| id != consumer_id);
        }
        Some(consumer)
    }

    fn remove_producer(
        &mut self,
        producer_id: &ProducerId,
        events: &mut Vec<EngineEvent>,
    ) -> Option<LocalProducer> {
        let producer = self.producers.remove(producer_id)?;
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.retain(|id| id != producer_id);
        }
        for consumer_id in &producer.consumers {
            if let Some(consumer) = self.consumers.remove(consumer_id) {
                if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
                    transport.consumers.retain(|id| id != consumer_id);
                }
                events.push(EngineEvent::ConsumerClosed {
                    peer_id: consumer.peer_id,
                    consumer_id: consumer_id.clone(),
                    producer_id: producer_id.clone(),
                });
            }
        }
        events.push(EngineEvent::ProducerClosed {
            peer_id: producer.peer_id.clone(),
            producer_id: producer_id.clone(),
        });
        Some(producer)
    }
}

/// In-process [`MediaEngine`] implementation
pub struct LocalMediaEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    alive: AtomicBool,
    next_port: AtomicU32,
    events: broadcast::Sender<EngineEvent>,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        info!(
            announced_ip = %config.announced_ip,
            codecs = config.media_codecs.len(),
            cascade_close = config.cascade_close,
            "Local media engine started"
        );
        Self {
            config,
            state: Mutex::new(EngineState::default()),
            alive: AtomicBool::new(true),
            next_port: AtomicU32::new(0),
            events,
        }
    }

    /// Mark the engine dead. Every later call fails and subscribers get
    /// [`EngineEvent::Died`].
    pub fn shutdown(&self, reason: impl Into<String>) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let reason = reason.into();
            error!(reason = %reason, "Local media engine died");
            let _ = self.events.send(EngineEvent::Died { reason });
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().producers.contains_key(producer_id)
    }

    #[must_use]
    pub fn has_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.state.lock().consumers.contains_key(consumer_id)
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EngineError::Closed("worker died".to_string()))
        }
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn next_port(&self) -> u16 {
        let min = u32::from(self.config.rtc_min_port);
        let max = u32::from(self.config.rtc_max_port).max(min);
        let span = max - min + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(min + offset).unwrap_or(self.config.rtc_min_port)
    }

    fn router_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        let key = CodecKey::from(codec);
        self.config
            .media_codecs
            .iter()
            .find(|candidate| CodecKey::from(*candidate).matches(&key))
    }

    fn validate_rtp_parameters(
        &self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<(), EngineError> {
        let mut media_codecs = rtp_parameters
            .codecs
            .iter()
            .filter(|codec| !is_rtx(&codec.mime_type))
            .peekable();
        if media_codecs.peek().is_none() {
            return Err(EngineError::InvalidRtpParameters(
                "no media codecs".to_string(),
            ));
        }
        for codec in media_codecs {
            let key = CodecKey::from(codec);
            if key.kind() != Some(kind) {
                return Err(EngineError::InvalidRtpParameters(format!(
                    "codec {} does not match kind {kind}",
                    codec.mime_type
                )));
            }
            if self.router_codec(codec).is_none() {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }
        Ok(())
    }
}

/// First non-RTX codec of the producer and the peer codec able to receive it
fn match_consumer_codec<'a, 'b>(
    producer: &'a LocalProducer,
    rtp_capabilities: &'b RtpCapabilities,
) -> Option<(&'a RtpCodecParameters, &'b RtpCodecCapability)> {
    let codec = producer
        .rtp_parameters
        .codecs
        .iter()
        .find(|codec| !is_rtx(&codec.mime_type))?;
    let key = CodecKey::from(codec);
    rtp_capabilities
        .codecs
        .iter()
        .find(|cap| cap.kind == producer.kind && CodecKey::from(*cap).matches(&key))
        .map(|cap| (codec, cap))
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    fn capabilities(&self) -> Result<RtpCapabilities, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::NotReady);
        }
        Ok(RtpCapabilities {
            codecs: self.config.media_codecs.clone(),
            header_extensions: default_header_extensions(),
        })
    }

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParams, EngineError> {
        self.ensure_alive()?;

        let id = TransportId::random();
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.config.announced_ip.clone(),
                protocol: "udp".to_string(),
                port: self.next_port(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        };

        self.state.lock().transports.insert(
            id.clone(),
            LocalTransport {
                peer_id: peer_id.clone(),
                direction,
                connected: false,
                producers: Vec::new(),
                consumers: Vec::new(),
                next_mid: 0,
            },
        );
        debug!(peer_id = %peer_id, transport_id = %id, %direction, "Engine transport created");
        Ok(params)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidDtlsParameters(
                "missing fingerprints".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        transport.connected = true;
        debug!(
            transport_id = %transport_id,
            role = ?dtls_parameters.role,
            "Engine transport connected"
        );
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        self.ensure_alive()?;
        self.validate_rtp_parameters(kind, &rtp_parameters)?;

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != Direction::Send {
            return Err(EngineError::WrongDirection {
                transport: transport_id.clone(),
                expected: Direction::Send,
                actual: transport.direction,
            });
        }
        if !transport.connected {
            return Err(EngineError::NotConnected(transport_id.clone()));
        }

        let id = ProducerId::random();
        transport.producers.push(id.clone());
        let peer_id = transport.peer_id.clone();
        state.producers.insert(
            id.clone(),
            LocalProducer {
                peer_id,
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
                consumers: Vec::new(),
            },
        );
        debug!(transport_id = %transport_id, producer_id = %id, %kind, "Engine producer created");

        Ok(ProducerInfo {
            id,
            kind,
            rtp_parameters,
        })
    }

    fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.ensure_alive()?;
        let state = self.state.lock();
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        Ok(match_consumer_codec(producer, rtp_capabilities).is_some())
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        self.ensure_alive()?;

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != Direction::Recv {
            return Err(EngineError::WrongDirection {
                transport: transport_id.clone(),
                expected: Direction::Recv,
                actual: transport.direction,
            });
        }
        let consumer_peer = transport.peer_id.clone();
        let mid = transport.next_mid.to_string();

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        let (codec, cap) = match_consumer_codec(producer, &rtp_capabilities)
            .ok_or_else(|| EngineError::CannotConsume(producer_id.clone()))?;

        let kind = producer.kind;
        let rtp_parameters = RtpParameters {
            mid: Some(mid),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: cap.rtcp_feedback.clone(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(random_ssrc()),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: true,
            },
        };

        let id = ConsumerId::random();
        state.consumers.insert(
            id.clone(),
            LocalConsumer {
                peer_id: consumer_peer,
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
            },
        );
        if let Some(producer) = state.producers.get_mut(producer_id) {
            producer.consumers.push(id.clone());
        }
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.consumers.push(id.clone());
            transport.next_mid += 1;
        }
        debug!(
            transport_id = %transport_id,
            producer_id = %producer_id,
            consumer_id = %id,
            "Engine consumer created"
        );

        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let transport = state
                .transports
                .remove(transport_id)
                .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;

            if self.config.cascade_close {
                for producer_id in &transport.producers {
                    state.remove_producer(producer_id, &mut events);
                }
                for consumer_id in &transport.consumers {
                    state.remove_consumer(consumer_id);
                }
            }
            events.push(EngineEvent::TransportClosed {
                peer_id: transport.peer_id,
                transport_id: transport_id.clone(),
            });
        }
        debug!(transport_id = %transport_id, "Engine transport closed");
        self.emit(events);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        let mut events = Vec::new();
        self.state
            .lock()
            .remove_producer(producer_id, &mut events)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        self.emit(events);
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.state
            .lock()
            .remove_consumer(consumer_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::ConsumerNotFound(consumer_id.clone()))
    }

    fn closes_children_with_transport(&self) -> bool {
        self.config.cascade_close
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
