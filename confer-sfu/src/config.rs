//! SFU signaling configuration

use serde::{Deserialize, Serialize};

/// Session layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrently connected peers (0 = unlimited)
    pub max_peers: usize,
    /// Capacity of each peer's notification queue.
    /// Notifications to a peer whose queue is full are dropped.
    pub outbound_queue_capacity: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_peers: 0,
            outbound_queue_capacity: 256,
        }
    }
}
