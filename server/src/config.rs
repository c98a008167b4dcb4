//! Frontend configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Liveness settings the connector applies to its transports.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// How often clients are expected to send a heartbeat
    pub interval: Duration,
    /// Silence after which a peer is considered gone
    pub timeout: Duration,
    /// How long shutdown waits for queued closing notices to go out
    pub close_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(25),
            timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Identifier of this frontend process, stamped on every session
    pub frontend_id: String,
    pub bind: SocketAddr,
    /// Allow at most one session per bound uid
    pub single_session: bool,
    pub max_sessions: usize,
    pub client_version: u32,
    /// Admission and completion bound for the serial task filter
    pub serial_timeout: Duration,
    /// Flush period of buffered push schedulers
    pub flush_interval: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            frontend_id: "connector-server-1".to_string(),
            bind: SocketAddr::from(([127, 0, 0, 1], 3010)),
            single_session: false,
            max_sessions: 1024,
            client_version: relay_shared::PROTOCOL_VERSION,
            serial_timeout: Duration::from_secs(3),
            flush_interval: Duration::from_millis(20),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}
