//! Common types used throughout the SFU signaling layer

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier
            #[must_use]
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a connected peer. Unique for the lifetime of its connection.
    PeerId
);
string_id!(
    /// Identifier of an engine transport
    TransportId
);
string_id!(
    /// Identifier of an engine producer
    ProducerId
);
string_id!(
    /// Identifier of an engine consumer
    ConsumerId
);

/// Opaque application metadata attached to a producer
pub type AppData = serde_json::Map<String, serde_json::Value>;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a transport, seen from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Peer sends media into the SFU (producers live here)
    Send,
    /// Peer receives media from the SFU (consumers live here)
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

/// DTLS state of a tracked transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = PeerId::from("peer-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-1\"");

        let parsed: ProducerId = serde_json::from_str("\"p-9\"").unwrap();
        assert_eq!(parsed.as_str(), "p-9");
    }

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(TransportId::random(), TransportId::random());
    }

    #[test]
    fn test_kind_and_direction_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        let dir: Direction = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(dir, Direction::Recv);
        assert_eq!(Direction::Send.to_string(), "send");
    }
}
