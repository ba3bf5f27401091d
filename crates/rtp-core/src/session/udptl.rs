//! UDPTL fax receive session and pump
//!
//! The fax path forwards whole IFP datagrams keyed by UDPTL sequence number.
//! Duplicates are passed through unchanged; lost datagrams are recovered
//! from the redundancy entries of later ones where possible.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{TimeoutConfig, TimeoutWatch};
use crate::packet::udptl::{clamp_max_datagram, clamp_redundancy, UdptlPacket};
use crate::stats::TransferStats;
use crate::transport::{RtpTransportConfig, UdpTransport};
use crate::{Result, DEFAULT_MAX_PACKET_SIZE};

/// Callbacks fired by a UDPTL receive session.
///
/// Invoked from the packet pump; implementations must not block.
pub trait UdptlEvents: Send + Sync {
    /// An IFP datagram arrived (or was recovered from redundancy). The
    /// UDPTL sequence number takes the place of an RTP timestamp.
    fn on_receive_datagram(&self, payload: Bytes, seq: u16, recovered: bool);

    /// Media timeout expired
    fn on_timeout(&self, initial: bool);
}

/// Socket-free UDPTL receive state machine
pub struct UdptlReceiver {
    listener: Arc<dyn UdptlEvents>,

    /// Next sequence number expected, once traffic has started
    expected_seq: Option<u16>,

    watch: TimeoutWatch,
    stats: TransferStats,
}

impl UdptlReceiver {
    pub fn new(listener: Arc<dyn UdptlEvents>, timeout: TimeoutConfig) -> Self {
        Self { listener, expected_seq: None, watch: TimeoutWatch::new(timeout), stats: TransferStats::default() }
    }

    pub fn set_timeout(&mut self, config: TimeoutConfig) {
        self.watch.config = config;
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.clone()
    }

    pub(crate) fn note_remote(&mut self, addr: SocketAddr) {
        self.stats.remote_addr = Some(addr);
    }

    /// Feed one parsed datagram through the state machine
    pub fn process_datagram(&mut self, packet: &UdptlPacket) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.primary.len() as u64;
        self.watch.on_media(Instant::now());

        if let Some(expected) = self.expected_seq {
            let gap = packet.seq.wrapping_sub(expected);
            if gap > 0 && gap < 0x8000 {
                self.stats.packets_lost += gap as u64;
                // Entry i repeats the IFP packet for seq - 1 - i; replay the
                // covered ones in ascending sequence order.
                let mut recovered = Vec::new();
                for back in 0..gap {
                    if let Some(entry) = packet.redundancy.get(back as usize) {
                        let seq = packet.seq.wrapping_sub(1).wrapping_sub(back);
                        recovered.push((seq, entry.clone()));
                    }
                }
                for (seq, entry) in recovered.into_iter().rev() {
                    debug!("Recovered UDPTL datagram {} from redundancy", seq);
                    self.stats.packets_lost -= 1;
                    self.listener.on_receive_datagram(entry, seq, true);
                }
            }
            // Duplicates and replays pass through: no dedup at this layer
        }
        self.expected_seq = Some(packet.seq.wrapping_add(1));

        self.listener.on_receive_datagram(packet.primary.clone(), packet.seq, false);
    }

    /// Evaluate timeouts; dispatches at most one notification per transition
    pub fn check_timeout(&mut self, now: Instant) {
        if let Some(initial) = self.watch.check(now) {
            self.listener.on_timeout(initial);
        }
    }
}

/// UDPTL session configuration
#[derive(Debug, Clone)]
pub struct UdptlSessionConfig {
    /// Transport settings; the RTCP socket is never used for fax
    pub transport: RtpTransportConfig,

    /// Negotiated maximum datagram size (already clamped by the caller or
    /// clamped here)
    pub max_datagram: u16,

    /// Negotiated redundancy count
    pub redundancy: u8,

    /// Media timeout thresholds
    pub timeout: TimeoutConfig,

    /// Watchdog tick for the pump task
    pub poll_interval: Duration,
}

impl Default for UdptlSessionConfig {
    fn default() -> Self {
        let mut transport = RtpTransportConfig::default();
        transport.rtcp = false;
        Self {
            transport,
            max_datagram: crate::packet::MAX_DATAGRAM_DEFAULT,
            redundancy: 0,
            timeout: TimeoutConfig::default(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Send-side state: recent primaries become redundancy entries
struct UdptlSendState {
    history: VecDeque<Bytes>,
}

/// A UDPTL session: transport, receive state machine, pump task and sender
pub struct UdptlSession {
    transport: Arc<UdpTransport>,
    receiver: Arc<Mutex<UdptlReceiver>>,
    send: Mutex<UdptlSendState>,
    max_datagram: u16,
    redundancy: u8,
    poll_interval: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl UdptlSession {
    /// Bind the transport and build the session; the pump starts with
    /// [`start`](Self::start). Must run inside a tokio runtime.
    pub fn bind(config: UdptlSessionConfig, listener: Arc<dyn UdptlEvents>) -> Result<Self> {
        let mut transport_config = config.transport.clone();
        transport_config.rtcp = false;
        let transport = Arc::new(UdpTransport::bind(transport_config)?);
        let receiver = Arc::new(Mutex::new(UdptlReceiver::new(listener, config.timeout)));

        Ok(Self {
            transport,
            receiver,
            send: Mutex::new(UdptlSendState { history: VecDeque::new() }),
            max_datagram: clamp_max_datagram(config.max_datagram),
            redundancy: clamp_redundancy(config.redundancy as u32),
            poll_interval: config.poll_interval,
            pump: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_rtp_addr()
    }

    /// Effective maximum datagram size after clamping
    pub fn max_datagram(&self) -> u16 {
        self.max_datagram
    }

    /// Effective redundancy count after clamping
    pub fn redundancy(&self) -> u8 {
        self.redundancy
    }

    pub async fn set_remote(&self, addr: SocketAddr) {
        self.transport.set_remote(addr).await;
    }

    pub fn set_timeout(&self, config: TimeoutConfig) {
        self.receiver.lock().unwrap().set_timeout(config);
    }

    pub fn stats(&self) -> TransferStats {
        let mut stats = self.receiver.lock().unwrap().stats();
        stats.packets_sent = self.packets_sent.load(Ordering::Relaxed);
        stats.bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        stats
    }

    /// Start the datagram pump. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let transport = self.transport.clone();
        let receiver = self.receiver.clone();
        let running = self.running.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    result = transport.recv_rtp(&mut buffer) => {
                        match result {
                            Ok((len, addr)) => {
                                match UdptlPacket::parse(&buffer[..len]) {
                                    Ok(packet) => {
                                        let mut rx = receiver.lock().unwrap();
                                        rx.note_remote(addr);
                                        rx.process_datagram(&packet);
                                    }
                                    Err(e) => debug!("Failed to parse UDPTL datagram: {}", e),
                                }
                            }
                            Err(_) => {
                                tokio::time::sleep(Duration::from_millis(10)).await;
                            }
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {
                        receiver.lock().unwrap().check_timeout(Instant::now());
                    }
                }
            }
        });
        *self.pump.lock().unwrap() = Some(handle);
    }

    /// Send one IFP datagram. The caller supplies the sequence number: the
    /// pipeline's timestamp argument is reinterpreted as a sequence on the
    /// fax path.
    pub async fn send_datagram(&self, payload: Bytes, seq: u16) -> Result<()> {
        let packet = {
            let mut send = self.send.lock().unwrap();
            let mut packet = UdptlPacket::new(seq, payload.clone());
            for prev in send.history.iter().rev() {
                packet.redundancy.push(prev.clone());
            }
            send.history.push_back(payload.clone());
            while send.history.len() > self.redundancy as usize {
                send.history.pop_front();
            }
            packet
        };

        let wire = packet.serialize(self.max_datagram)?;
        self.transport.send_rtp_bytes(&wire).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the pump; same ordering contract as the RTP session
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);
        let pump = self.pump.lock().unwrap().take();
        if let Some(handle) = pump {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for UdptlSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        datagrams: StdMutex<Vec<(u16, bool, Vec<u8>)>>,
        timeouts: StdMutex<Vec<bool>>,
    }

    impl UdptlEvents for Recorder {
        fn on_receive_datagram(&self, payload: Bytes, seq: u16, recovered: bool) {
            self.datagrams.lock().unwrap().push((seq, recovered, payload.to_vec()));
        }
        fn on_timeout(&self, initial: bool) {
            self.timeouts.lock().unwrap().push(initial);
        }
    }

    fn datagram(seq: u16, payload: &'static [u8], redundancy: &[&'static [u8]]) -> UdptlPacket {
        let mut packet = UdptlPacket::new(seq, Bytes::from_static(payload));
        for entry in redundancy {
            packet.redundancy.push(Bytes::from_static(entry));
        }
        packet
    }

    #[test]
    fn test_in_order_delivery() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = UdptlReceiver::new(recorder.clone(), TimeoutConfig::default());

        rx.process_datagram(&datagram(0, b"ifp-0", &[]));
        rx.process_datagram(&datagram(1, b"ifp-1", &[]));

        let seen = recorder.datagrams.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0, false, b"ifp-0".to_vec()));
        assert_eq!(seen[1], (1, false, b"ifp-1".to_vec()));
    }

    #[test]
    fn test_recovery_from_redundancy() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = UdptlReceiver::new(recorder.clone(), TimeoutConfig::default());

        rx.process_datagram(&datagram(0, b"ifp-0", &[]));
        // Datagram 1 lost; datagram 2 carries it as redundancy entry 0
        rx.process_datagram(&datagram(2, b"ifp-2", &[b"ifp-1"]));

        let seen = recorder.datagrams.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], (1, true, b"ifp-1".to_vec()));
        assert_eq!(seen[2], (2, false, b"ifp-2".to_vec()));
        assert_eq!(rx.stats().packets_lost, 0);
    }

    #[test]
    fn test_unrecoverable_gap_counts_lost() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = UdptlReceiver::new(recorder.clone(), TimeoutConfig::default());

        rx.process_datagram(&datagram(0, b"ifp-0", &[]));
        rx.process_datagram(&datagram(3, b"ifp-3", &[b"ifp-2"]));

        // Seq 1 stays lost, seq 2 recovered
        let seen = recorder.datagrams.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], (2, true, b"ifp-2".to_vec()));
        assert_eq!(rx.stats().packets_lost, 1);
    }

    #[test]
    fn test_duplicates_pass_through() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = UdptlReceiver::new(recorder.clone(), TimeoutConfig::default());

        rx.process_datagram(&datagram(5, b"ifp-5", &[]));
        rx.process_datagram(&datagram(5, b"ifp-5", &[]));

        assert_eq!(recorder.datagrams.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_udptl_end_to_end() {
        use crate::transport::PortRange;

        let recorder = Arc::new(Recorder::default());
        let mut config = UdptlSessionConfig::default();
        config.transport.local_ip = "127.0.0.1".parse().unwrap();
        config.transport.port_range = PortRange::new(23400, 23500);
        config.redundancy = 2;
        let session = UdptlSession::bind(config.clone(), recorder.clone()).unwrap();
        session.start();

        let sender = UdptlSession::bind(config, Arc::new(Recorder::default())).unwrap();
        sender.set_remote(session.local_addr().unwrap()).await;

        sender.send_datagram(Bytes::from_static(b"page data 0"), 0).await.unwrap();
        sender.send_datagram(Bytes::from_static(b"page data 1"), 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = recorder.datagrams.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert!(!seen[0].1);

        session.close().await;
        sender.close().await;
    }

    #[test]
    fn test_clamps_applied_at_bind() {
        // Clamping is covered at packet level; the session applies it on bind
        let mut config = UdptlSessionConfig::default();
        config.max_datagram = 50;
        config.redundancy = 200u8;
        assert_eq!(clamp_max_datagram(config.max_datagram), 250);
    }
}
