//! Command line and environment configuration

use crate::matcher::MatchingPolicy;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Rendezvous and relay server for WebRTC signaling
#[derive(Parser, Debug, Clone)]
#[command(name = "rendezvous-signaling", version, about)]
pub struct Config {
    /// Address to bind to
    #[arg(long, env = "RENDEZVOUS_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to listen on
    #[arg(long, env = "RENDEZVOUS_PORT", default_value_t = 8080)]
    pub port: u16,

    /// How frames find their destination
    #[arg(long, env = "RENDEZVOUS_POLICY", value_enum, default_value_t = MatchingPolicy::Addressed)]
    pub policy: MatchingPolicy,

    /// Under addressed routing, only let paired clients address their peer
    #[arg(long, env = "RENDEZVOUS_ENFORCE_PEER")]
    pub enforce_peer: bool,

    /// Seconds a client may wait in the pairing pool (unset: no limit)
    #[arg(long, env = "RENDEZVOUS_PAIRING_TIMEOUT_SECS")]
    pub pairing_timeout_secs: Option<u64>,

    /// Seconds a record may stay without a connection before it is evicted
    /// (unset: records are kept for the lifetime of the process)
    #[arg(long, env = "RENDEZVOUS_IDLE_RECORD_TTL_SECS")]
    pub idle_record_ttl_secs: Option<u64>,

    /// Seconds between cleanup sweeps
    #[arg(long, env = "RENDEZVOUS_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Seconds between server pings; a connection silent for two periods is dropped
    #[arg(long, env = "RENDEZVOUS_KEEPALIVE_SECS", default_value_t = 30)]
    pub keepalive_secs: u64,

    /// Largest inbound text frame that is relayed
    #[arg(long, env = "RENDEZVOUS_MAX_FRAME_BYTES", default_value_t = 64 * 1024)]
    pub max_frame_bytes: usize,

    /// Emit logs as JSON
    #[arg(long, env = "RENDEZVOUS_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }

    /// Runtime settings shared by handlers and connection workers
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            policy: self.policy,
            enforce_peer: self.enforce_peer,
            pairing_timeout: self.pairing_timeout_secs.map(Duration::from_secs),
            idle_record_ttl: self.idle_record_ttl_secs.map(Duration::from_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            keepalive: Duration::from_secs(self.keepalive_secs.max(1)),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

/// Settings of one server instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub policy: MatchingPolicy,
    pub enforce_peer: bool,
    pub pairing_timeout: Option<Duration>,
    pub idle_record_ttl: Option<Duration>,
    pub sweep_interval: Duration,
    pub keepalive: Duration,
    pub max_frame_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            policy: MatchingPolicy::Addressed,
            enforce_peer: false,
            pairing_timeout: None,
            idle_record_ttl: None,
            sweep_interval: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            max_frame_bytes: 64 * 1024,
        }
    }
}
