//! Centralized configuration for links, brokers and plugin processes.
//!
//! Fixed limits are associated constants, as elsewhere in the workspace.
//! [`BrokerConfig`] carries the few values a caller may want to override per
//! broker.

use std::time::Duration;

/// Link and plugin process limits.
pub struct LinkConfig;

impl LinkConfig {
    // Framing
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    // Queues
    pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
    pub const ENDPOINT_QUEUE_DEPTH: usize = 64;

    // Broker table
    pub const MAX_ENDPOINTS: usize = 4096;

    // In-memory links
    pub const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

    // Plugin process
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
    pub const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const HANDSHAKE_PREFIX: &'static str = "RPC_PORT=";
}

/// Per-broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum accepted frame payload in bytes.
    pub max_frame_size: usize,
    /// Depth of the link's outbound frame queue.
    pub outbound_queue_depth: usize,
    /// Depth of each endpoint's request queue.
    pub endpoint_queue_depth: usize,
    /// Maximum number of live endpoints on this broker.
    pub max_endpoints: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: LinkConfig::MAX_FRAME_SIZE,
            outbound_queue_depth: LinkConfig::OUTBOUND_QUEUE_DEPTH,
            endpoint_queue_depth: LinkConfig::ENDPOINT_QUEUE_DEPTH,
            max_endpoints: LinkConfig::MAX_ENDPOINTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_link_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_frame_size, LinkConfig::MAX_FRAME_SIZE);
        assert_eq!(config.max_endpoints, LinkConfig::MAX_ENDPOINTS);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(LinkConfig::HANDSHAKE_TIMEOUT > LinkConfig::CONNECT_TIMEOUT);
        assert!(LinkConfig::PROCESS_EXIT_TIMEOUT > Duration::ZERO);
    }
}
