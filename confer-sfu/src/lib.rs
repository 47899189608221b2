//! Confer SFU signaling
//!
//! Session orchestration for a Selective Forwarding Unit. Peers connect over a
//! signaling channel, exchange RTP capabilities, negotiate WebRTC transports,
//! publish media as producers and subscribe to each other's producers as
//! consumers. Media itself flows through a [`MediaEngine`]; this crate only
//! decides which engine resources exist and who is told about them.
//!
//! ## Architecture
//!
//! - **`SessionProtocol`**: Dispatches peer requests and runs teardown
//! - **`PeerRegistry`**: Concurrent map of peer id to `PeerSession`
//! - **`TransportNegotiator`**: Creates and connects send/recv transports
//! - **`ProducerCatalog`**: Adds producers and lists what each peer may consume
//! - **`ConsumerBroker`**: Capability-checked consumer creation
//! - **`MediaEngine`**: Engine adapter; `LocalMediaEngine` is the in-process one
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confer_sfu::{EngineConfig, LocalMediaEngine, PeerId, Request, SessionProtocol, SfuConfig};
//!
//! let engine = Arc::new(LocalMediaEngine::new(EngineConfig::default()));
//! let protocol = Arc::new(SessionProtocol::new(SfuConfig::default(), engine));
//! protocol.spawn_engine_watcher();
//!
//! let (session, notifications) = protocol.connect(PeerId::random())?;
//! let reply = protocol.handle(&session.id, Request::GetCapabilities {}).await?;
//! protocol.disconnect(&session.id).await;
//! ```

mod broker;
mod catalog;
mod config;
pub mod engine;
mod error;
pub mod message;
mod negotiator;
mod protocol;
mod registry;
mod session;
mod types;

pub use broker::ConsumerBroker;
pub use catalog::{ProducerCatalog, VisibleIter, VisibleProducers};
pub use config::SfuConfig;
pub use engine::{EngineConfig, EngineError, EngineEvent, LocalMediaEngine, MediaEngine};
pub use error::{Result, SfuError};
pub use message::{ClientMessage, Notification, Reply, Request, ServerMessage};
pub use negotiator::TransportNegotiator;
pub use protocol::{SessionProtocol, SfuStats};
pub use registry::PeerRegistry;
pub use session::{
    ConsumerHandle, PeerSession, ProducerHandle, SessionState, SessionStats, TransportHandle,
};
pub use types::{
    AppData, ConsumerId, Direction, DtlsState, MediaKind, PeerId, ProducerId, TransportId,
};
