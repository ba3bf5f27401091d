//! Runtime configuration for the relay
//!
//! Read once at startup by the embedding engine and handed to the relay
//! service; requests may narrow but not widen these settings.

use serde::Deserialize;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Lowest local port to probe (inclusive)
    pub min_port: u16,

    /// Highest local port to probe (exclusive)
    pub max_port: u16,

    /// Default buffer size for pipeline adapters
    pub buffer: usize,

    /// Type-of-service byte for media sockets
    pub tos: Option<u32>,

    /// Default timeout before "no media ever received" fires, in ms;
    /// zero disables it
    pub timeout_ms: u64,

    /// Default timeout before "media stopped arriving" fires, in ms;
    /// zero disables it
    pub idle_timeout_ms: u64,

    /// Send a priming datagram when the remote address is learned
    pub drill_hole: bool,

    /// Trust remote addresses observed on the wire over signalled ones
    pub auto_addr: bool,

    /// Watchdog tick for pump tasks, in ms
    pub sleep_ms: u64,

    /// Message name used for media timeout notifications
    pub notify_message: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_port: 16384,
            max_port: 32768,
            buffer: 240,
            tos: None,
            timeout_ms: 0,
            idle_timeout_ms: 0,
            drill_hole: false,
            auto_addr: true,
            sleep_ms: 20,
            notify_message: "chan.notify".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_ms.max(1))
    }

    pub fn port_range(&self) -> rmedia_rtp_core::PortRange {
        rmedia_rtp_core::PortRange::new(self.min_port, self.max_port)
    }
}
