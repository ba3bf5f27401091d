//! Transfer statistics for media sessions

use std::net::SocketAddr;

/// Counters for one media session or relay leg
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Total packets sent
    pub packets_sent: u64,

    /// Total packets received
    pub packets_received: u64,

    /// Total payload bytes sent
    pub bytes_sent: u64,

    /// Total payload bytes received
    pub bytes_received: u64,

    /// Packets lost, derived from sequence gaps
    pub packets_lost: u64,

    /// Duplicate packets received
    pub packets_duplicated: u64,

    /// Out-of-order packets received
    pub packets_out_of_order: u64,

    /// Telephone events received
    pub events_received: u64,

    /// RTCP packets received on the companion socket
    pub rtcp_received: u64,

    /// Interarrival jitter estimate in milliseconds (RFC 3550)
    pub jitter_ms: f64,

    /// Remote address of the most recent packet
    pub remote_addr: Option<SocketAddr>,
}

impl TransferStats {
    /// Render the compact `PS=..,OS=..,PR=..,OR=..,PL=..` summary used in
    /// terminate responses and hangup messages.
    pub fn summary(&self) -> String {
        format!(
            "PS={},OS={},PR={},OR={},PL={}",
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.packets_lost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_format() {
        let stats = TransferStats {
            packets_sent: 10,
            bytes_sent: 1600,
            packets_received: 8,
            bytes_received: 1280,
            packets_lost: 2,
            ..Default::default()
        };
        assert_eq!(stats.summary(), "PS=10,OS=1600,PR=8,OR=1280,PL=2");
    }
}
