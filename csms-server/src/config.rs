//! Configuration for the central system server

use std::net::SocketAddr;
use std::time::Duration;

use crate::ocpp::OcppVersion;

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: SocketAddr,

    /// OCPP version; selects the subprotocol and the inbound action set
    pub version: OcppVersion,

    /// Require HTTP Basic credentials on upgrade
    pub require_basic_auth: bool,

    /// Default deadline for server-initiated calls
    pub request_timeout: Duration,

    // WebSocket limits
    pub max_message_size: usize,
    pub max_frame_size: usize,

    /// Capacity of each connection's inbound call queue and outgoing frame queue
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8180)),
            version: OcppVersion::V16,
            require_basic_auth: false,
            request_timeout: Duration::from_secs(30),
            max_message_size: 64 << 10,
            max_frame_size: 16 << 10,
            queue_capacity: 64,
        }
    }
}

impl ServerConfig {
    /// Create config listening on the given address
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: OcppVersion) -> Self {
        self.version = version;
        self
    }

    /// Require Basic credentials from every station
    pub fn with_basic_auth(mut self) -> Self {
        self.require_basic_auth = true;
        self
    }

    /// Set the default deadline of server-initiated calls
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set WebSocket message and frame size limits
    pub fn with_size_limits(mut self, max_message_size: usize, max_frame_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the per-connection queue capacity; at least one
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();

        assert_eq!(config.listen_addr.port(), 8180);
        assert_eq!(config.version.subprotocol(), "ocpp1.6");
        assert!(!config.require_basic_auth);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_config_builder() {
        let config = ServerConfig::new("127.0.0.1:9000".parse().unwrap())
            .with_basic_auth()
            .with_request_timeout(Duration::from_secs(5))
            .with_size_limits(1024, 512);

        assert_eq!(config.listen_addr.port(), 9000);
        assert!(config.require_basic_auth);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_size, 512);

        assert_eq!(ServerConfig::default().with_queue_capacity(0).queue_capacity, 1);
    }
}
