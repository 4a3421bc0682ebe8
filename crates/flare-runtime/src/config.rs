//! Client runtime configuration

use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by all runtime services.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host name of the Flare server; also the deterministic salt component.
    pub server_host: String,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a single unary call.
    pub call_timeout: Duration,
    /// Timeout for one read from the inbound stream. Expiry is benign; the
    /// listener just polls again.
    pub read_timeout: Duration,
    /// Keep-alive interval on the inbound stream.
    pub ping_interval: Duration,
    /// Connection attempts per reconnection episode before giving up.
    pub reconnect_attempts: u32,
    /// Pause between reconnection attempts.
    pub reconnect_pause: Duration,
    /// Argon2 memory cost used for new registrations, in KiB.
    pub argon_memory_cost_kib: u32,
    /// Argon2 iteration count used for new registrations.
    pub argon_time_cost: u32,
    /// Timeout for one wait on the credential-update channel.
    pub credential_wait_timeout: Duration,
    /// Where `save_credentials` writes the plaintext credential dump, if
    /// anywhere.
    pub credential_dump_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(5),
            reconnect_attempts: 3,
            reconnect_pause: Duration::from_secs(1),
            argon_memory_cost_kib: flare_core::crypto::DEFAULT_MEMORY_COST_KIB,
            argon_time_cost: flare_core::crypto::DEFAULT_TIME_COST,
            credential_wait_timeout: Duration::from_secs(60),
            credential_dump_path: None,
        }
    }
}

impl ClientConfig {
    pub fn for_host(server_host: impl Into<String>) -> Self {
        Self {
            server_host: server_host.into(),
            ..Self::default()
        }
    }
}
