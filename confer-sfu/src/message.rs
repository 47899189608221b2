//! Signaling wire messages
//!
//! Every frame is a JSON object. Requests carry an optional numeric `id`
//! correlation token that is echoed back in the matching response, so a client
//! can await replies out of band from the notification stream.
//!
//! ```json
//! {"id": 7, "method": "createTransport", "data": {"direction": "send"}}
//! {"type": "response", "id": 7, "ok": true, "data": {"id": "...", ...}}
//! {"type": "notification", "event": "newProducer", "data": {"peerId": "...", ...}}
//! ```

use crate::engine::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::error::SfuError;
use crate::types::{AppData, ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};

/// Client → server request
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "method",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    GetCapabilities {},
    CreateTransport {
        direction: Direction,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: AppData,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        transport_id: Option<TransportId>,
    },
    GetProducers {},
}

impl Request {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetCapabilities {} => "getCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::GetProducers {} => "getProducers",
        }
    }
}

/// A request frame with its correlation token
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

impl ClientMessage {
    /// Parse a text frame
    ///
    /// A missing or `null` `data` is read as `{}`, so methods without a
    /// payload accept all three forms.
    pub fn parse(text: &str) -> Result<Self, SfuError> {
        let invalid = |e: serde_json::Error| SfuError::InvalidRequest(e.to_string());
        let mut frame: serde_json::Value = serde_json::from_str(text).map_err(invalid)?;
        if let Some(object) = frame.as_object_mut() {
            let data = object.entry("data").or_insert(serde_json::Value::Null);
            if data.is_null() {
                *data = serde_json::Value::Object(serde_json::Map::new());
            }
        }
        serde_json::from_value(frame).map_err(invalid)
    }
}

/// A producer as seen by other peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub app_data: AppData,
}

/// What a peer needs to set up the receiving side of a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

/// Successful response payloads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Capabilities(RtpCapabilities),
    Transport(TransportParams),
    Connected { connected: bool },
    Produced { id: ProducerId },
    Consumer(ConsumerDescriptor),
    Producers(Vec<ProducerDescriptor>),
}

/// Server → client event, delivered best effort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    /// First frame of every connection, tells the peer its id
    Welcome { peer_id: PeerId },
    NewProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
        app_data: AppData,
    },
    ParticipantLeft { peer_id: PeerId },
    /// The producer behind one of the peer's consumers went away
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Server → client frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response {
        id: Option<u64>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Reply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Notification(Notification),
}

impl ServerMessage {
    /// Response frame for the request carrying `id`
    #[must_use]
    pub fn response(id: Option<u64>, result: &Result<Reply, SfuError>) -> Self {
        match result {
            Ok(reply) => Self::Response {
                id,
                ok: true,
                data: Some(reply.clone()),
                error: None,
            },
            Err(err) => Self::Response {
                id,
                ok: false,
                data: None,
                error: Some(ErrorBody::from(err)),
            },
        }
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}
