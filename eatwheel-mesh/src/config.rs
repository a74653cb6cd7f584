//! Tunables for sessions, the coordinator and transports.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Gap between `request-storage` attempts while joining a room (default: 1s)
    pub storage_retry_interval: Duration,
    /// Give up joining after this long. `None` retries until cancelled.
    pub storage_max_wait: Option<Duration>,
    /// First re-dial delay for a known but unlinked peer (default: 1s)
    pub redial_base: Duration,
    /// Re-dial delay ceiling (default: 30s)
    pub redial_cap: Duration,
    /// Dial plus hello exchange must finish within this (default: 10s)
    pub handshake_timeout: Duration,
    /// Messages buffered per same-origin channel subscriber (default: 256)
    pub channel_capacity: usize,
    /// Frames buffered per link direction (default: 256)
    pub link_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            storage_retry_interval: Duration::from_secs(1),
            storage_max_wait: None,
            redial_base: Duration::from_secs(1),
            redial_cap: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            link_buffer: 256,
        }
    }
}

impl MeshConfig {
    /// Short timers so multi-device tests settle quickly.
    pub fn for_testing() -> Self {
        Self {
            storage_retry_interval: Duration::from_millis(50),
            storage_max_wait: Some(Duration::from_secs(5)),
            redial_base: Duration::from_millis(50),
            redial_cap: Duration::from_millis(400),
            handshake_timeout: Duration::from_secs(2),
            channel_capacity: 256,
            link_buffer: 64,
        }
    }
}
