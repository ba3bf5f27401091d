//! Bidirectional RTP reflector
//!
//! Relays raw packets between two independently negotiated legs without
//! touching the generic media pipeline. Each leg owns a transport and a
//! passive monitor; a periodic tick watches liveness. Identity mismatches
//! and unparsable SDP answers are fatal to the relay instance only.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rmedia_rtp_core::{PortRange, RtpTransportConfig, UdpTransport, DEFAULT_MAX_PACKET_SIZE};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::message::{self, MessageBus};
use crate::monitor::RtpMonitor;
use crate::sdp::SdpInfo;

/// A relay between two RTP legs
pub struct RtpReflector {
    /// Calling leg id; always known
    leg_a: String,

    /// Called leg id; filled in once the callee answers
    leg_b: Mutex<Option<String>>,

    transport_a: Arc<UdpTransport>,
    transport_b: Arc<UdpTransport>,

    monitor_a: Arc<RtpMonitor>,
    monitor_b: Arc<RtpMonitor>,

    /// Legs that reported hangup so far
    hung_up: Mutex<HashSet<String>>,

    pumps: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,

    monitor_timeout: Duration,
    notify_name: String,
    bus: Arc<dyn MessageBus>,
}

fn transport_config(
    local_ip: IpAddr,
    range: PortRange,
    rtcp: bool,
    drill_hole: bool,
    tos: Option<u32>,
) -> RtpTransportConfig {
    RtpTransportConfig { local_ip, port_range: range, rtcp, tos, drill_hole }
}

impl RtpReflector {
    /// Allocate both legs' transports and point leg A at the caller's
    /// media address from the execute SDP.
    pub async fn create(
        config: &RelayConfig,
        bus: Arc<dyn MessageBus>,
        leg_a: String,
        local_ip: IpAddr,
        range: PortRange,
        rtcp: bool,
        drill_hole: bool,
        caller_sdp: &SdpInfo,
    ) -> Result<Arc<Self>> {
        let transport_a = Arc::new(UdpTransport::bind(transport_config(
            local_ip, range, rtcp, drill_hole, config.tos,
        ))?);
        let transport_b = Arc::new(UdpTransport::bind(transport_config(
            local_ip, range, rtcp, drill_hole, config.tos,
        ))?);

        let caller_addr = caller_sdp
            .addr
            .parse::<IpAddr>()
            .map_err(|e| Error::BadSdp(format!("bad connection address: {}", e)))?;
        transport_a.set_remote(std::net::SocketAddr::new(caller_addr, caller_sdp.port)).await;

        let monitor_timeout = Duration::from_millis(if config.idle_timeout_ms > 0 {
            config.idle_timeout_ms
        } else {
            config.timeout_ms
        });

        let reflector = Arc::new(Self {
            monitor_a: Arc::new(RtpMonitor::new(Some(leg_a.clone()))),
            monitor_b: Arc::new(RtpMonitor::new(Some(leg_a.clone()))),
            leg_a,
            leg_b: Mutex::new(None),
            transport_a,
            transport_b,
            hung_up: Mutex::new(HashSet::new()),
            pumps: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(true)),
            monitor_timeout,
            notify_name: config.notify_message.clone(),
            bus,
        });
        reflector.start();

        info!(
            "Created reflector for {} (A: {:?}, B: {:?})",
            reflector.leg_a,
            reflector.local_a_addr(),
            reflector.local_b_addr()
        );
        Ok(reflector)
    }

    pub fn leg_a(&self) -> &str {
        &self.leg_a
    }

    pub fn leg_b(&self) -> Option<String> {
        self.leg_b.lock().unwrap().clone()
    }

    pub fn has_leg(&self, leg_id: &str) -> bool {
        self.leg_a == leg_id || self.leg_b.lock().unwrap().as_deref() == Some(leg_id)
    }

    /// Local address the caller's SDP is rewritten to
    pub fn local_a_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport_a.local_rtp_addr().ok()
    }

    /// Local address the callee's SDP is rewritten to
    pub fn local_b_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport_b.local_rtp_addr().ok()
    }

    fn spawn_relay(
        &self,
        from: Arc<UdpTransport>,
        to: Arc<UdpTransport>,
        monitor: Arc<RtpMonitor>,
        label: &'static str,
    ) -> JoinHandle<()> {
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            while running.load(Ordering::Acquire) {
                match from.recv_rtp(&mut buffer).await {
                    Ok((len, _addr)) => {
                        if len >= 12 && (buffer[0] >> 6) == 2 {
                            monitor.saw_rtp(len, buffer[1] & 0x7f);
                        }
                        // Forward raw; the far leg may not be bound yet
                        if to.remote_rtp_addr().is_some() {
                            if let Err(e) = to.send_rtp_bytes(&buffer[..len]).await {
                                debug!("Relay {} send failed: {}", label, e);
                            }
                        }
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
    }

    fn spawn_rtcp_relay(
        &self,
        from: Arc<UdpTransport>,
        to: Arc<UdpTransport>,
        monitor: Arc<RtpMonitor>,
    ) -> Option<JoinHandle<()>> {
        from.local_rtcp_addr()?;
        let running = self.running.clone();
        Some(tokio::spawn(async move {
            let mut buffer = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            while running.load(Ordering::Acquire) {
                match from.recv_rtcp(&mut buffer).await {
                    Ok((len, _)) => {
                        monitor.saw_rtcp(len);
                        let _ = to.send_rtcp_bytes(&buffer[..len]).await;
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        }))
    }

    fn start(self: &Arc<Self>) {
        let mut pumps = self.pumps.lock().unwrap();
        pumps.push(self.spawn_relay(
            self.transport_a.clone(),
            self.transport_b.clone(),
            self.monitor_a.clone(),
            "A->B",
        ));
        pumps.push(self.spawn_relay(
            self.transport_b.clone(),
            self.transport_a.clone(),
            self.monitor_b.clone(),
            "B->A",
        ));
        if let Some(pump) =
            self.spawn_rtcp_relay(self.transport_a.clone(), self.transport_b.clone(), self.monitor_a.clone())
        {
            pumps.push(pump);
        }
        if let Some(pump) =
            self.spawn_rtcp_relay(self.transport_b.clone(), self.transport_a.clone(), self.monitor_b.clone())
        {
            pumps.push(pump);
        }

        // Liveness tick
        if !self.monitor_timeout.is_zero() {
            let running = self.running.clone();
            let monitors = [self.monitor_a.clone(), self.monitor_b.clone()];
            let bus = self.bus.clone();
            let notify_name = self.notify_name.clone();
            let timeout = self.monitor_timeout;
            pumps.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                while running.load(Ordering::Acquire) {
                    tick.tick().await;
                    let now = Instant::now();
                    for monitor in &monitors {
                        if let Some(id) = monitor.check_timeout(now, timeout) {
                            warn!("Reflector media timeout towards {}", id);
                            bus.enqueue(message::timeout_notify(&notify_name, &id, false));
                        }
                    }
                }
            }));
        }
    }

    /// Complete leg B from the answer: validate the id against any earlier
    /// sighting and bind the remote media address from the answer SDP.
    pub async fn answer(&self, leg_b_id: &str, answer_sdp: &SdpInfo) -> Result<()> {
        {
            let mut leg_b = self.leg_b.lock().unwrap();
            match leg_b.as_deref() {
                Some(existing) if existing != leg_b_id => {
                    return Err(Error::Other(format!(
                        "leg B mismatch: {} answered, {} expected",
                        leg_b_id, existing
                    )));
                }
                _ => *leg_b = Some(leg_b_id.to_string()),
            }
        }

        let addr = answer_sdp
            .addr
            .parse::<IpAddr>()
            .map_err(|e| Error::BadSdp(format!("bad connection address: {}", e)))?;
        self.transport_b.set_remote(std::net::SocketAddr::new(addr, answer_sdp.port)).await;

        // Both legs are live now
        self.monitor_a.start_clock();
        self.monitor_b.start_clock();
        info!("Reflector {} answered by {}", self.leg_a, leg_b_id);
        Ok(())
    }

    /// Record one leg's hangup, flushing its statistics into the message.
    /// Returns true when the reflector should be removed: both legs hung
    /// up, or leg B was never filled in.
    pub fn hangup(&self, leg_id: &str, msg: &mut crate::message::Message) -> bool {
        msg.set("stats_a", self.monitor_a.summary());
        msg.set("stats_b", self.monitor_b.summary());

        let mut hung_up = self.hung_up.lock().unwrap();
        hung_up.insert(leg_id.to_string());

        match self.leg_b.lock().unwrap().as_deref() {
            None => true,
            Some(leg_b) => hung_up.contains(self.leg_a.as_str()) && hung_up.contains(leg_b),
        }
    }

    /// Stop all pump tasks
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);
        let pumps = std::mem::take(&mut *self.pumps.lock().unwrap());
        for pump in pumps {
            pump.abort();
            let _ = pump.await;
        }
        debug!("Closed reflector for {}", self.leg_a);
    }
}

impl Drop for RtpReflector {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
    }
}
