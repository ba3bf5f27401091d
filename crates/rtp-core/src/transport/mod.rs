//! Network transport for RTP/RTCP and UDPTL
//!
//! This module provides the UDP socket pair, local port allocation and the
//! send/receive primitives used by the session pumps.

pub mod port;
pub mod udp;

pub use port::{PortRange, MAX_BIND_ATTEMPTS};
pub use udp::UdpTransport;

use std::net::IpAddr;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct RtpTransportConfig {
    /// Local address to bind on
    pub local_ip: IpAddr,

    /// Port range to probe for the RTP socket
    pub port_range: PortRange,

    /// Bind the adjacent RTCP socket as well
    pub rtcp: bool,

    /// Type-of-service byte for outgoing packets
    pub tos: Option<u32>,

    /// Send a priming datagram when the remote address is learned, to open
    /// NAT bindings ("drill hole")
    pub drill_hole: bool,
}

impl Default for RtpTransportConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port_range: PortRange::default(),
            rtcp: true,
            tos: None,
            drill_hole: false,
        }
    }
}
