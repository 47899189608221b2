//! Confer signaling server
//!
//! Serves the SFU signaling protocol from `confer-sfu` over WebSocket, with
//! layered configuration and structured logging.

pub mod config;
pub mod http;
pub mod logging;
pub mod server;

pub use config::{load_config, Config};
