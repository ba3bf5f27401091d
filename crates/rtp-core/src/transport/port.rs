//! Local port allocation for RTP/RTCP socket pairs
//!
//! RTP binds to an even port so RTCP can take the adjacent odd one. Ports
//! are probed randomly inside the configured range, up to a bounded number
//! of attempts.

use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

/// Maximum number of bind attempts before giving up on a range
pub const MAX_BIND_ATTEMPTS: usize = 10;

/// A half-open local port range `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Number of even candidate ports in the range
    pub fn even_slots(&self) -> u16 {
        if self.max <= self.min {
            return 0;
        }
        let first = self.min + (self.min & 1);
        if first >= self.max {
            0
        } else {
            (self.max - first + 1) / 2
        }
    }

    /// Pick a random even port from the range
    fn pick_even(&self) -> Option<u16> {
        let slots = self.even_slots();
        if slots == 0 {
            return None;
        }
        let first = self.min + (self.min & 1);
        let slot = rand::thread_rng().gen_range(0..slots);
        Some(first + slot * 2)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { min: 16384, max: 32768 }
    }
}

/// Build a bound std UDP socket, optionally setting the TOS byte first
fn bind_std(addr: SocketAddr, tos: Option<u32>) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(tos) = tos {
        if addr.is_ipv4() {
            if let Err(e) = socket.set_tos(tos) {
                warn!("Failed to set TOS {} on socket: {}", tos, e);
            }
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn into_tokio(socket: std::net::UdpSocket) -> Result<UdpSocket> {
    UdpSocket::from_std(socket)
        .map_err(|e| Error::Transport(format!("Failed to register socket: {}", e)))
}

/// Bind an RTP socket (and optionally the adjacent RTCP socket) on an even
/// port from the given range.
///
/// Random even ports are probed, `MAX_BIND_ATTEMPTS` at most; a range with a
/// single even candidate is probed exactly once.
pub fn bind_pair(
    local_ip: IpAddr,
    range: PortRange,
    with_rtcp: bool,
    tos: Option<u32>,
) -> Result<(std::net::UdpSocket, Option<std::net::UdpSocket>)> {
    let slots = range.even_slots();
    if slots == 0 {
        return Err(Error::PortExhausted { min: range.min, max: range.max });
    }
    let attempts = if slots == 1 { 1 } else { MAX_BIND_ATTEMPTS };

    for attempt in 0..attempts {
        let port = match range.pick_even() {
            Some(p) => p,
            None => break,
        };
        let rtp = match bind_std(SocketAddr::new(local_ip, port), tos) {
            Ok(s) => s,
            Err(e) => {
                debug!("Port {} busy (attempt {}): {}", port, attempt + 1, e);
                continue;
            }
        };
        if !with_rtcp {
            return Ok((rtp, None));
        }
        match bind_std(SocketAddr::new(local_ip, port + 1), tos) {
            Ok(rtcp) => return Ok((rtp, Some(rtcp))),
            Err(e) => {
                // RTCP port taken, release the RTP socket and try elsewhere
                debug!("RTCP port {} busy (attempt {}): {}", port + 1, attempt + 1, e);
                drop(rtp);
            }
        }
    }

    Err(Error::PortExhausted { min: range.min, max: range.max })
}

/// Async wrapper around [`bind_pair`] returning tokio sockets
pub fn bind_pair_tokio(
    local_ip: IpAddr,
    range: PortRange,
    with_rtcp: bool,
    tos: Option<u32>,
) -> Result<(UdpSocket, Option<UdpSocket>)> {
    let (rtp, rtcp) = bind_pair(local_ip, range, with_rtcp, tos)?;
    let rtp = into_tokio(rtp)?;
    let rtcp = match rtcp {
        Some(s) => Some(into_tokio(s)?),
        None => None,
    };
    Ok((rtp, rtcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_even_slots() {
        assert_eq!(PortRange::new(20000, 20010).even_slots(), 5);
        assert_eq!(PortRange::new(20001, 20003).even_slots(), 1);
        assert_eq!(PortRange::new(20000, 20001).even_slots(), 1);
        assert_eq!(PortRange::new(20001, 20002).even_slots(), 0);
        assert_eq!(PortRange::new(20010, 20000).even_slots(), 0);
    }

    #[test]
    fn test_bound_port_is_even_and_in_range() {
        let range = PortRange::new(21000, 21100);
        let (rtp, rtcp) = bind_pair(LOCALHOST, range, true, None).unwrap();
        let port = rtp.local_addr().unwrap().port();
        assert_eq!(port % 2, 0);
        assert!(port >= range.min && port < range.max);
        assert_eq!(rtcp.unwrap().local_addr().unwrap().port(), port + 1);
    }

    #[test]
    fn test_single_slot_range() {
        let range = PortRange::new(21200, 21201);
        let (rtp, _) = bind_pair(LOCALHOST, range, false, None).unwrap();
        assert_eq!(rtp.local_addr().unwrap().port(), 21200);

        // The only candidate is now taken: exactly one attempt, then failure
        let err = bind_pair(LOCALHOST, range, false, None).unwrap_err();
        assert!(matches!(err, Error::PortExhausted { .. }));
    }

    #[test]
    fn test_empty_range_fails() {
        let range = PortRange::new(21301, 21302);
        assert!(bind_pair(LOCALHOST, range, false, None).is_err());
    }
}
