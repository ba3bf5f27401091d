//! UDP transport for RTP/RTCP and UDPTL
//!
//! Owns the bound socket pair and the remote addresses, and de-duplicates
//! transient I/O error logging: each direction logs once when it enters the
//! error state and once when it recovers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{port, RtpTransportConfig};
use crate::error::Error;
use crate::sync::OnceLatch;
use crate::Result;

/// UDP transport with an RTP socket and an optional adjacent RTCP socket
pub struct UdpTransport {
    /// RTP (or UDPTL) socket
    rtp_socket: Arc<UdpSocket>,

    /// RTCP socket, bound on port+1 when configured
    rtcp_socket: Option<Arc<UdpSocket>>,

    /// Transport configuration
    config: RtpTransportConfig,

    /// Remote RTP address
    remote_rtp: Mutex<Option<SocketAddr>>,

    /// Remote RTCP address
    remote_rtcp: Mutex<Option<SocketAddr>>,

    /// Drill-hole priming happens once per transport
    drill: OnceLatch,

    /// Error-state flags for log de-duplication
    send_failing: AtomicBool,
    recv_failing: AtomicBool,
}

impl UdpTransport {
    /// Bind a transport from the configured port range
    pub fn bind(config: RtpTransportConfig) -> Result<Self> {
        let (rtp, rtcp) =
            port::bind_pair_tokio(config.local_ip, config.port_range, config.rtcp, config.tos)?;
        let local = rtp.local_addr()?;
        debug!("Bound media transport on {} (rtcp: {})", local, rtcp.is_some());

        Ok(Self {
            rtp_socket: Arc::new(rtp),
            rtcp_socket: rtcp.map(Arc::new),
            config,
            remote_rtp: Mutex::new(None),
            remote_rtcp: Mutex::new(None),
            drill: OnceLatch::armed(),
            send_failing: AtomicBool::new(false),
            recv_failing: AtomicBool::new(false),
        })
    }

    /// Local RTP address
    pub fn local_rtp_addr(&self) -> Result<SocketAddr> {
        self.rtp_socket
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local RTP address: {}", e)))
    }

    /// Local RTCP address, when a separate socket is bound
    pub fn local_rtcp_addr(&self) -> Option<SocketAddr> {
        self.rtcp_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Remote RTP address, when known
    pub fn remote_rtp_addr(&self) -> Option<SocketAddr> {
        *self.remote_rtp.lock().unwrap()
    }

    /// Install the remote address pair (RTCP is RTP port + 1) and fire the
    /// drill-hole priming datagram if configured.
    pub async fn set_remote(&self, addr: SocketAddr) {
        {
            *self.remote_rtp.lock().unwrap() = Some(addr);
            let rtcp = SocketAddr::new(addr.ip(), addr.port().saturating_add(1));
            *self.remote_rtcp.lock().unwrap() = Some(rtcp);
        }

        if self.config.drill_hole && self.drill.fire() {
            // A minimal datagram is enough to open most NAT bindings
            if let Err(e) = self.rtp_socket.send_to(&[0u8; 1], addr).await {
                debug!("Drill-hole packet to {} failed: {}", addr, e);
            } else {
                debug!("Sent drill-hole packet to {}", addr);
            }
            if let (Some(socket), Some(rtcp)) =
                (&self.rtcp_socket, *self.remote_rtcp.lock().unwrap())
            {
                let _ = socket.send_to(&[0u8; 1], rtcp).await;
            }
        }
    }

    /// Send raw RTP bytes to the known remote address
    pub async fn send_rtp_bytes(&self, bytes: &[u8]) -> Result<()> {
        let dest = self
            .remote_rtp_addr()
            .ok_or_else(|| Error::Transport("No remote RTP address".to_string()))?;

        match self.rtp_socket.send_to(bytes, dest).await {
            Ok(_) => {
                if self.send_failing.swap(false, Ordering::AcqRel) {
                    info!("RTP send to {} recovered", dest);
                }
                Ok(())
            }
            Err(e) => {
                if !self.send_failing.swap(true, Ordering::AcqRel) {
                    warn!("RTP send to {} failing: {}", dest, e);
                }
                Err(Error::Transport(format!("Failed to send RTP packet: {}", e)))
            }
        }
    }

    /// Send raw RTCP bytes, preferring the dedicated RTCP socket
    pub async fn send_rtcp_bytes(&self, bytes: &[u8]) -> Result<()> {
        let dest = self
            .remote_rtcp
            .lock()
            .unwrap()
            .ok_or_else(|| Error::Transport("No remote RTCP address".to_string()))?;
        let socket = self.rtcp_socket.as_ref().unwrap_or(&self.rtp_socket);
        socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| Error::Transport(format!("Failed to send RTCP packet: {}", e)))?;
        Ok(())
    }

    /// Receive one datagram on the RTP socket
    pub async fn recv_rtp(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        match self.rtp_socket.recv_from(buffer).await {
            Ok(ok) => {
                if self.recv_failing.swap(false, Ordering::AcqRel) {
                    info!("RTP receive recovered");
                }
                Ok(ok)
            }
            Err(e) => {
                if !self.recv_failing.swap(true, Ordering::AcqRel) {
                    warn!("RTP receive failing: {}", e);
                }
                Err(Error::Transport(format!("Failed to receive packet: {}", e)))
            }
        }
    }

    /// Receive one datagram on the RTCP socket, if one is bound
    pub async fn recv_rtcp(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let socket = self
            .rtcp_socket
            .as_ref()
            .ok_or_else(|| Error::Transport("No RTCP socket".to_string()))?;
        socket
            .recv_from(buffer)
            .await
            .map_err(|e| Error::Transport(format!("Failed to receive RTCP packet: {}", e)))
    }

    /// RTP socket handle for pump tasks
    pub(crate) fn rtp_socket(&self) -> Arc<UdpSocket> {
        self.rtp_socket.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PortRange;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(range: PortRange, rtcp: bool) -> RtpTransportConfig {
        RtpTransportConfig {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: range,
            rtcp,
            tos: None,
            drill_hole: false,
        }
    }

    #[tokio::test]
    async fn test_transport_bind_pair() {
        let transport = UdpTransport::bind(test_config(PortRange::new(22000, 22100), true)).unwrap();
        let rtp = transport.local_rtp_addr().unwrap();
        let rtcp = transport.local_rtcp_addr().unwrap();
        assert_eq!(rtp.port() % 2, 0);
        assert_eq!(rtcp.port(), rtp.port() + 1);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpTransport::bind(test_config(PortRange::new(22200, 22300), false)).unwrap();
        let b = UdpTransport::bind(test_config(PortRange::new(22200, 22300), false)).unwrap();

        a.set_remote(b.local_rtp_addr().unwrap()).await;
        a.send_rtp_bytes(b"hello media").await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.recv_rtp(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello media");
        assert_eq!(from, a.local_rtp_addr().unwrap());
    }

    #[tokio::test]
    async fn test_drill_hole_fires_once() {
        let mut config = test_config(PortRange::new(22400, 22500), false);
        config.drill_hole = true;
        let a = UdpTransport::bind(config).unwrap();
        let b = UdpTransport::bind(test_config(PortRange::new(22400, 22500), false)).unwrap();

        let dest = b.local_rtp_addr().unwrap();
        a.set_remote(dest).await;
        a.set_remote(dest).await;

        let mut buf = [0u8; 16];
        let (len, _) = b.recv_rtp(&mut buf).await.unwrap();
        assert_eq!(len, 1);

        // Only one priming datagram despite two set_remote calls
        let second =
            tokio::time::timeout(std::time::Duration::from_millis(100), b.recv_rtp(&mut buf)).await;
        assert!(second.is_err());
    }
}
