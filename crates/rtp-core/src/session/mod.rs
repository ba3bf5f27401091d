//! Receive-session state machines and the packet pump
//!
//! The wire-facing state machine ([`RtpReceiver`]) is deliberately free of
//! sockets and tasks so its sequence, SSRC, payload-change and event logic
//! can be tested in isolation. [`RtpSession`] wraps a receiver together with
//! a transport, the pump task and the send side.
//!
//! Listener callbacks run on the pump task and must not block: the intended
//! implementations only flip flags and enqueue messages for the control
//! side.

mod udptl;

pub use udptl::{UdptlEvents, UdptlReceiver, UdptlSession, UdptlSessionConfig};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::packet::{RtpHeader, RtpPacket, TelephoneEvent, RTP_MIN_HEADER_SIZE};
use crate::srtp::SrtpContext;
use crate::stats::TransferStats;
use crate::sync::OnceLatch;
use crate::transport::{RtpTransportConfig, UdpTransport};
use crate::{Result, DEFAULT_MAX_PACKET_SIZE, EVENT_CNG_FAX_TONE, SILENCE_PAYLOAD_TYPE};

/// Default telephone-event payload type
pub const DEFAULT_EVENT_PAYLOAD: u8 = 101;

/// Callbacks fired by an RTP receive session.
///
/// All methods are invoked from the packet pump and must return quickly
/// without taking call-control locks.
pub trait SessionEvents: Send + Sync {
    /// Media payload received. `missed` is set when the loss counter
    /// advanced since the previous delivery.
    fn on_receive_data(&self, payload: Bytes, timestamp: u32, marker: bool, missed: bool);

    /// A DTMF key event completed decoding
    fn on_dtmf(&self, tone: char, duration: u16, timestamp: u32);

    /// CNG fax calling tone detected; fired at most once per session
    fn on_fax_tone(&self);

    /// Media timeout expired. `initial` distinguishes "no media ever
    /// received" from "media stopped arriving".
    fn on_timeout(&self, initial: bool);
}

/// SSRC acceptance policy
#[derive(Debug, Clone, Copy, Default)]
pub struct SsrcPolicy {
    /// Accept any new SSRC without an explicit resync
    pub any_ssrc: bool,
}

/// Media timeout thresholds in milliseconds; zero disables a threshold
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutConfig {
    /// Fires when no media was ever received
    pub initial_ms: u64,

    /// Fires when media stops arriving after it had started
    pub idle_ms: u64,
}

/// Tracks media arrival against the configured thresholds and enforces the
/// at-most-once-per-transition notification contract.
struct TimeoutWatch {
    config: TimeoutConfig,
    started_at: Instant,
    last_media: Option<Instant>,
    notify: OnceLatch,
}

impl TimeoutWatch {
    fn new(config: TimeoutConfig) -> Self {
        Self { config, started_at: Instant::now(), last_media: None, notify: OnceLatch::armed() }
    }

    fn on_media(&mut self, now: Instant) {
        self.last_media = Some(now);
        self.notify.rearm();
    }

    /// Returns `Some(initial)` exactly once per silent period
    fn check(&mut self, now: Instant) -> Option<bool> {
        match self.last_media {
            None => {
                if self.config.initial_ms > 0
                    && now.duration_since(self.started_at).as_millis() as u64
                        >= self.config.initial_ms
                    && self.notify.fire()
                {
                    return Some(true);
                }
            }
            Some(last) => {
                if self.config.idle_ms > 0
                    && now.duration_since(last).as_millis() as u64 >= self.config.idle_ms
                    && self.notify.fire()
                {
                    return Some(false);
                }
            }
        }
        None
    }
}

/// Socket-free RTP receive state machine.
///
/// Fed parsed packets by the pump; dispatches media, DTMF, fax-tone and
/// timeout callbacks to its listener.
pub struct RtpReceiver {
    listener: Arc<dyn SessionEvents>,

    policy: SsrcPolicy,

    /// Forces acceptance of the next SSRC change; consumed on use
    resync: OnceLatch,

    /// CNG fax tone is reported at most once per session
    fax_expected: OnceLatch,

    ssrc: Option<u32>,

    /// Payload type installed by negotiation or first observation
    expected_payload: Option<u8>,

    /// Telephone-event payload type
    event_payload: u8,

    /// Installed silence indicator payload, once observed
    silence_payload: Option<u8>,

    /// Last unexpected payload already warned about
    warned_payload: Option<u8>,

    /// Event code currently decoding, to report each key press once
    current_event: Option<u8>,

    last_seq: Option<u16>,
    lost: u64,
    reported_lost: u64,

    /// Interarrival jitter state (RFC 3550 A.8)
    clock_rate: u32,
    epoch: Instant,
    last_transit: Option<i64>,
    jitter_units: f64,

    watch: TimeoutWatch,
    stats: TransferStats,
}

impl RtpReceiver {
    pub fn new(
        listener: Arc<dyn SessionEvents>,
        policy: SsrcPolicy,
        event_payload: u8,
        timeout: TimeoutConfig,
    ) -> Self {
        Self {
            listener,
            policy,
            resync: OnceLatch::disarmed(),
            fax_expected: OnceLatch::armed(),
            ssrc: None,
            expected_payload: None,
            event_payload,
            silence_payload: None,
            warned_payload: None,
            current_event: None,
            last_seq: None,
            lost: 0,
            reported_lost: 0,
            clock_rate: 8000,
            epoch: Instant::now(),
            last_transit: None,
            jitter_units: 0.0,
            watch: TimeoutWatch::new(timeout),
            stats: TransferStats::default(),
        }
    }

    /// Install the payload type negotiated for this session
    pub fn set_expected_payload(&mut self, payload_type: u8) {
        self.expected_payload = Some(payload_type);
        self.warned_payload = None;
    }

    /// Force acceptance of the next SSRC change
    pub fn request_resync(&mut self) {
        self.resync.rearm();
    }

    /// Replace the SSRC acceptance policy
    pub fn set_any_ssrc(&mut self, any_ssrc: bool) {
        self.policy.any_ssrc = any_ssrc;
    }

    /// Replace the telephone-event payload type
    pub fn set_event_payload(&mut self, event_payload: u8) {
        self.event_payload = event_payload;
    }

    /// Replace the timeout thresholds, keeping the current arrival state
    pub fn set_timeout(&mut self, config: TimeoutConfig) {
        self.watch.config = config;
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.clone()
    }

    pub(crate) fn note_remote(&mut self, addr: SocketAddr) {
        self.stats.remote_addr = Some(addr);
    }

    pub(crate) fn note_rtcp(&mut self) {
        self.stats.rtcp_received += 1;
    }

    /// Track a sequence number, classifying gaps, duplicates and late
    /// arrivals
    fn track_seq(&mut self, seq: u16) {
        match self.last_seq {
            None => self.last_seq = Some(seq),
            Some(last) => {
                let delta = seq.wrapping_sub(last);
                if delta == 0 {
                    self.stats.packets_duplicated += 1;
                } else if delta < 0x8000 {
                    if delta > 1 {
                        self.lost += (delta - 1) as u64;
                        self.stats.packets_lost = self.lost;
                    }
                    self.last_seq = Some(seq);
                } else {
                    self.stats.packets_out_of_order += 1;
                }
            }
        }
    }

    /// Apply the SSRC policy; returns false when the packet must be dropped
    fn accept_ssrc(&mut self, ssrc: u32, marker: bool) -> bool {
        match self.ssrc {
            None => {
                self.ssrc = Some(ssrc);
                true
            }
            Some(current) if current == ssrc => true,
            Some(current) => {
                if self.policy.any_ssrc || self.resync.fire() {
                    debug!(
                        "Accepting new SSRC {:08x} (was {:08x}, marker {})",
                        ssrc, current, marker
                    );
                    self.ssrc = Some(ssrc);
                    self.last_seq = None;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Telephone-event payload: decode and dispatch DTMF / fax callbacks
    fn process_event(&mut self, packet: &RtpPacket) {
        let event = match TelephoneEvent::parse(&packet.payload) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("Dropping malformed telephone event: {}", e);
                return;
            }
        };
        self.stats.events_received += 1;

        // Report each distinct event once, on its first packet
        let fresh = self.current_event != Some(event.event);
        if fresh {
            self.current_event = Some(event.event);
            if event.event == EVENT_CNG_FAX_TONE {
                if self.fax_expected.fire() {
                    info!("Fax CNG tone detected");
                    self.listener.on_fax_tone();
                }
            } else if let Some(tone) = event.to_dtmf_char() {
                self.listener.on_dtmf(tone, event.duration, packet.header.timestamp);
            } else {
                debug!("Ignoring telephone event {}", event.event);
            }
        }
        if event.end {
            self.current_event = None;
        }
    }

    /// Interarrival jitter per RFC 3550: smoothed difference of transit
    /// time variation, in timestamp units
    fn update_jitter(&mut self, rtp_timestamp: u32) {
        let arrival =
            (self.epoch.elapsed().as_secs_f64() * self.clock_rate as f64) as i64;
        let transit = arrival - rtp_timestamp as i64;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter_units += (d - self.jitter_units) / 16.0;
            self.stats.jitter_ms = self.jitter_units * 1000.0 / self.clock_rate as f64;
        }
        self.last_transit = Some(transit);
    }

    /// Media payload: payload-change policy, loss marking, forward
    fn process_media(&mut self, packet: &RtpPacket) {
        let pt = packet.header.payload_type;

        if pt == SILENCE_PAYLOAD_TYPE {
            // Comfort-noise indicator: install silently, do not forward
            if self.silence_payload != Some(pt) {
                debug!("Installing silence payload {}", pt);
                self.silence_payload = Some(pt);
            }
            return;
        }

        match self.expected_payload {
            None => {
                // First observed media payload is accepted quietly
                self.expected_payload = Some(pt);
            }
            Some(expected) if expected != pt => {
                if self.warned_payload != Some(pt) {
                    warn!("Unexpected payload change {} -> {}", expected, pt);
                    self.warned_payload = Some(pt);
                }
                // The packet is still forwarded
            }
            _ => {}
        }

        let missed = self.lost > self.reported_lost;
        self.reported_lost = self.lost;

        self.listener.on_receive_data(
            packet.payload.clone(),
            packet.header.timestamp,
            packet.header.marker,
            missed,
        );
    }

    /// Feed one parsed packet through the state machine
    pub fn process_packet(&mut self, packet: &RtpPacket) {
        if !self.accept_ssrc(packet.header.ssrc, packet.header.marker) {
            debug!("Dropping packet with unaccepted SSRC {:08x}", packet.header.ssrc);
            return;
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;
        self.watch.on_media(Instant::now());
        self.track_seq(packet.header.sequence_number);

        if packet.header.payload_type == self.event_payload {
            self.process_event(packet);
        } else {
            self.update_jitter(packet.header.timestamp);
            self.process_media(packet);
        }
    }

    /// Evaluate timeouts; dispatches at most one notification per transition
    pub fn check_timeout(&mut self, now: Instant) {
        if let Some(initial) = self.watch.check(now) {
            self.listener.on_timeout(initial);
        }
    }
}

/// RTP session configuration options
#[derive(Debug, Clone)]
pub struct RtpSessionConfig {
    /// Transport (local address, port range, RTCP, TOS, drill hole)
    pub transport: RtpTransportConfig,

    /// Telephone-event payload type
    pub event_payload: u8,

    /// SSRC acceptance policy
    pub ssrc_policy: SsrcPolicy,

    /// Media timeout thresholds
    pub timeout: TimeoutConfig,

    /// Watchdog tick for the pump task
    pub poll_interval: Duration,
}

impl Default for RtpSessionConfig {
    fn default() -> Self {
        Self {
            transport: RtpTransportConfig::default(),
            event_payload: DEFAULT_EVENT_PAYLOAD,
            ssrc_policy: SsrcPolicy::default(),
            timeout: TimeoutConfig::default(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Send-side sequence state
struct SendState {
    ssrc: u32,
    seq: u16,
    payload_type: u8,

    /// Pad outgoing payloads to a multiple of this; values below 2 disable
    padding: usize,
}

/// An RTP session: transport, receive state machine, pump task and sender
pub struct RtpSession {
    transport: Arc<UdpTransport>,
    receiver: Arc<Mutex<RtpReceiver>>,
    send: Mutex<SendState>,
    srtp_tx: Mutex<Option<SrtpContext>>,
    srtp_rx: Arc<Mutex<Option<SrtpContext>>>,
    event_payload: std::sync::atomic::AtomicU8,
    poll_interval: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
    rtcp_pump: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl RtpSession {
    /// Bind the transport and build the session. The pump is not started
    /// until [`start`](Self::start) is called.
    ///
    /// Must run inside a tokio runtime.
    pub fn bind(config: RtpSessionConfig, listener: Arc<dyn SessionEvents>) -> Result<Self> {
        let transport = Arc::new(UdpTransport::bind(config.transport.clone())?);
        let receiver = Arc::new(Mutex::new(RtpReceiver::new(
            listener,
            config.ssrc_policy,
            config.event_payload,
            config.timeout,
        )));

        let mut rng = rand::thread_rng();
        let send = SendState { ssrc: rng.gen(), seq: rng.gen(), payload_type: 0, padding: 0 };

        Ok(Self {
            transport,
            receiver,
            send: Mutex::new(send),
            srtp_tx: Mutex::new(None),
            srtp_rx: Arc::new(Mutex::new(None)),
            event_payload: std::sync::atomic::AtomicU8::new(config.event_payload),
            poll_interval: config.poll_interval,
            pump: Mutex::new(None),
            rtcp_pump: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        })
    }

    /// Local RTP address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_rtp_addr()
    }

    /// Install the remote address pair
    pub async fn set_remote(&self, addr: SocketAddr) {
        self.transport.set_remote(addr).await;
    }

    /// Install SRTP contexts; `None` means cleartext for that direction
    pub fn set_srtp(&self, tx: Option<SrtpContext>, rx: Option<SrtpContext>) {
        *self.srtp_tx.lock().unwrap() = tx;
        *self.srtp_rx.lock().unwrap() = rx;
    }

    /// Install the negotiated outgoing payload type
    pub fn set_payload_type(&self, payload_type: u8) {
        self.send.lock().unwrap().payload_type = payload_type;
        self.receiver.lock().unwrap().set_expected_payload(payload_type);
    }

    pub fn set_timeout(&self, config: TimeoutConfig) {
        self.receiver.lock().unwrap().set_timeout(config);
    }

    /// Pad outgoing payloads to a multiple of `padding` bytes
    pub fn set_padding(&self, padding: usize) {
        self.send.lock().unwrap().padding = padding;
    }

    pub fn request_resync(&self) {
        self.receiver.lock().unwrap().request_resync();
    }

    /// Replace the SSRC acceptance policy
    pub fn set_any_ssrc(&self, any_ssrc: bool) {
        self.receiver.lock().unwrap().set_any_ssrc(any_ssrc);
    }

    /// Replace the telephone-event payload type for both directions
    pub fn set_event_payload(&self, event_payload: u8) {
        self.event_payload.store(event_payload, Ordering::Relaxed);
        self.receiver.lock().unwrap().set_event_payload(event_payload);
    }

    /// Combined send/receive statistics
    pub fn stats(&self) -> TransferStats {
        let mut stats = self.receiver.lock().unwrap().stats();
        stats.packets_sent = self.packets_sent.load(Ordering::Relaxed);
        stats.bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        stats
    }

    /// Start the packet pump. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let transport = self.transport.clone();
        let receiver = self.receiver.clone();
        let srtp_rx = self.srtp_rx.clone();
        let running = self.running.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut buffer = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            while running.load(Ordering::Acquire) {
                tokio::select! {
                    result = transport.recv_rtp(&mut buffer) => {
                        match result {
                            Ok((len, addr)) => {
                                if len < RTP_MIN_HEADER_SIZE {
                                    debug!("Received packet too small to be RTP: {} bytes", len);
                                    continue;
                                }
                                let data = &buffer[..len];
                                let parsed = {
                                    let mut guard = srtp_rx.lock().unwrap();
                                    match guard.as_mut() {
                                        Some(ctx) => ctx.unprotect(data),
                                        None => RtpPacket::parse(data),
                                    }
                                };
                                match parsed {
                                    Ok(packet) => {
                                        let mut rx = receiver.lock().unwrap();
                                        rx.note_remote(addr);
                                        rx.process_packet(&packet);
                                    }
                                    Err(e) => debug!("Failed to parse RTP packet: {}", e),
                                }
                            }
                            Err(_) => {
                                // Error already logged by the transport
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

        // Drain the companion RTCP socket so it cannot back up
        if self.transport.local_rtcp_addr().is_some() {
            let transport = self.transport.clone();
            let receiver = self.receiver.clone();
            let running = self.running.clone();
            let handle = tokio::spawn(async move {
                let mut buffer = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
                while running.load(Ordering::Acquire) {
                    match transport.recv_rtcp(&mut buffer).await {
                        Ok(_) => receiver.lock().unwrap().note_rtcp(),
                        Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
            });
            *self.rtcp_pump.lock().unwrap() = Some(handle);
        }

        debug!("Started RTP session pump on {:?}", self.transport.local_rtp_addr().ok());
    }

    fn next_header(&self, timestamp: u32, marker: bool) -> RtpHeader {
        let mut send = self.send.lock().unwrap();
        send.seq = send.seq.wrapping_add(1);
        let mut header = RtpHeader::new(send.payload_type, send.seq, timestamp, send.ssrc);
        header.marker = marker;
        header
    }

    /// Pad a payload to the configured multiple; the final octet carries
    /// the pad count per RFC 3550
    fn apply_padding(&self, packet: &mut RtpPacket) {
        let padding = self.send.lock().unwrap().padding;
        if padding < 2 || packet.payload.len() % padding == 0 {
            return;
        }
        let pad = padding - packet.payload.len() % padding;
        let mut padded = Vec::with_capacity(packet.payload.len() + pad);
        padded.extend_from_slice(&packet.payload);
        padded.extend(std::iter::repeat(0u8).take(pad - 1));
        padded.push(pad as u8);
        packet.payload = Bytes::from(padded);
        packet.header.padding = true;
    }

    async fn send_packet(&self, packet: RtpPacket) -> Result<()> {
        let wire = {
            let mut guard = self.srtp_tx.lock().unwrap();
            match guard.as_mut() {
                Some(ctx) => ctx.protect(&packet)?,
                None => packet.serialize()?,
            }
        };
        self.transport.send_rtp_bytes(&wire).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send one media payload with the negotiated payload type
    pub async fn send_payload(&self, payload: Bytes, timestamp: u32, marker: bool) -> Result<()> {
        let header = self.next_header(timestamp, marker);
        let mut packet = RtpPacket::new(header, payload);
        self.apply_padding(&mut packet);
        self.send_packet(packet).await
    }

    /// Send an out-of-band DTMF tone as RFC 2833 event packets
    pub async fn send_dtmf(&self, tone: char, duration_ms: u32) -> Result<()> {
        let code = match TelephoneEvent::code_for_char(tone) {
            Some(c) => c,
            None => {
                return Err(crate::Error::InvalidParameter(format!("Not a DTMF tone: {}", tone)))
            }
        };
        // Duration in 8 kHz timestamp units
        let units = (duration_ms.saturating_mul(8)).min(u16::MAX as u32) as u16;
        let timestamp = duration_ms.saturating_mul(8);

        let begin = TelephoneEvent::new(code, false, 10, units);
        let end = TelephoneEvent::new(code, true, 10, units);

        for (i, ev) in [begin, end, end].iter().enumerate() {
            let mut header = self.next_header(timestamp, i == 0);
            header.payload_type = self.event_payload.load(Ordering::Relaxed);
            self.send_packet(RtpPacket::new(header, ev.serialize())).await?;
        }
        Ok(())
    }

    /// Stop the pump and close down. Safe to call more than once.
    ///
    /// Teardown order matters: the pump is stopped and awaited first, so no
    /// listener callback can be in flight when the transport is released.
    pub async fn close(&self) {
        self.running.store(false, Ordering::Release);
        let pump = self.pump.lock().unwrap().take();
        if let Some(handle) = pump {
            handle.abort();
            let _ = handle.await;
        }
        let rtcp = self.rtcp_pump.lock().unwrap().take();
        if let Some(handle) = rtcp {
            handle.abort();
            let _ = handle.await;
        }
        debug!("Closed RTP session on {:?}", self.transport.local_rtp_addr().ok());
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        // Backstop for sessions dropped without an explicit close
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.rtcp_pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Set up a simple test logger
    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    #[derive(Default)]
    struct Recorder {
        data: StdMutex<Vec<(u32, bool, bool)>>,
        dtmf: StdMutex<Vec<char>>,
        fax: AtomicU64,
        timeouts: StdMutex<Vec<bool>>,
    }

    impl SessionEvents for Recorder {
        fn on_receive_data(&self, _payload: Bytes, timestamp: u32, marker: bool, missed: bool) {
            self.data.lock().unwrap().push((timestamp, marker, missed));
        }
        fn on_dtmf(&self, tone: char, _duration: u16, _timestamp: u32) {
            self.dtmf.lock().unwrap().push(tone);
        }
        fn on_fax_tone(&self) {
            self.fax.fetch_add(1, Ordering::SeqCst);
        }
        fn on_timeout(&self, initial: bool) {
            self.timeouts.lock().unwrap().push(initial);
        }
    }

    fn receiver_with(recorder: Arc<Recorder>, policy: SsrcPolicy) -> RtpReceiver {
        RtpReceiver::new(recorder, policy, DEFAULT_EVENT_PAYLOAD, TimeoutConfig::default())
    }

    fn media_packet(seq: u16, ts: u32, ssrc: u32) -> RtpPacket {
        RtpPacket::new_with_payload(8, seq, ts, ssrc, Bytes::from_static(b"payload"))
    }

    fn event_packet(seq: u16, event: TelephoneEvent, ssrc: u32) -> RtpPacket {
        RtpPacket::new_with_payload(DEFAULT_EVENT_PAYLOAD, seq, 0, ssrc, event.serialize())
    }

    #[test]
    fn test_media_forwarded_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        for seq in 1..=3u16 {
            rx.process_packet(&media_packet(seq, seq as u32 * 160, 0x1111));
        }
        let data = recorder.data.lock().unwrap();
        assert_eq!(data.len(), 3);
        assert!(data.iter().all(|(_, _, missed)| !missed));
    }

    #[test]
    fn test_loss_sets_missed_flag_once() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        rx.process_packet(&media_packet(1, 160, 0x1111));
        // Sequence 2 and 3 lost
        rx.process_packet(&media_packet(4, 640, 0x1111));
        rx.process_packet(&media_packet(5, 800, 0x1111));

        let data = recorder.data.lock().unwrap();
        assert_eq!(data.iter().map(|(_, _, m)| *m as u32).collect::<Vec<_>>(), vec![0, 1, 0]);
        assert_eq!(rx.stats().packets_lost, 2);
    }

    #[test]
    fn test_new_ssrc_dropped_without_resync() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        rx.process_packet(&media_packet(1, 160, 0x1111));
        rx.process_packet(&media_packet(2, 320, 0x2222));
        assert_eq!(recorder.data.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_resync_accepts_new_ssrc_once() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        rx.process_packet(&media_packet(1, 160, 0x1111));
        rx.request_resync();
        rx.process_packet(&media_packet(100, 320, 0x2222));
        // Resync is one-shot: a third SSRC is dropped again
        rx.process_packet(&media_packet(200, 480, 0x3333));

        assert_eq!(recorder.data.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_any_ssrc_policy() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy { any_ssrc: true });

        rx.process_packet(&media_packet(1, 160, 0x1111));
        rx.process_packet(&media_packet(9, 320, 0x2222));
        rx.process_packet(&media_packet(17, 480, 0x3333));
        assert_eq!(recorder.data.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_dtmf_reported_once_per_event() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        // Three packets of the same key press: begin, update, end
        rx.process_packet(&event_packet(1, TelephoneEvent::new(5, false, 10, 160), 0x1111));
        rx.process_packet(&event_packet(2, TelephoneEvent::new(5, false, 10, 320), 0x1111));
        rx.process_packet(&event_packet(3, TelephoneEvent::new(5, true, 10, 480), 0x1111));
        // A second key press is reported again
        rx.process_packet(&event_packet(4, TelephoneEvent::new(5, false, 10, 160), 0x1111));
        rx.process_packet(&event_packet(5, TelephoneEvent::new(5, true, 10, 320), 0x1111));

        assert_eq!(*recorder.dtmf.lock().unwrap(), vec!['5', '5']);
    }

    #[test]
    fn test_fax_tone_fires_once_per_session() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());

        rx.process_packet(&event_packet(
            1,
            TelephoneEvent::new(EVENT_CNG_FAX_TONE, true, 0, 160),
            0x1111,
        ));
        rx.process_packet(&event_packet(
            2,
            TelephoneEvent::new(EVENT_CNG_FAX_TONE, true, 0, 160),
            0x1111,
        ));

        assert_eq!(recorder.fax.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_silence_payload_installed_quietly() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());
        rx.set_expected_payload(8);

        let cn = RtpPacket::new_with_payload(
            SILENCE_PAYLOAD_TYPE,
            1,
            160,
            0x1111,
            Bytes::from_static(&[0x40]),
        );
        rx.process_packet(&cn);

        // Comfort noise is not forwarded as media
        assert!(recorder.data.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unexpected_payload_still_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = receiver_with(recorder.clone(), SsrcPolicy::default());
        rx.set_expected_payload(8);

        let other =
            RtpPacket::new_with_payload(0, 1, 160, 0x1111, Bytes::from_static(b"mulaw frame"));
        rx.process_packet(&other);
        assert_eq!(recorder.data.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_initial_timeout_fires_once() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = RtpReceiver::new(
            recorder.clone(),
            SsrcPolicy::default(),
            DEFAULT_EVENT_PAYLOAD,
            TimeoutConfig { initial_ms: 10, idle_ms: 0 },
        );

        let later = Instant::now() + Duration::from_millis(50);
        rx.check_timeout(later);
        rx.check_timeout(later + Duration::from_millis(50));
        rx.check_timeout(later + Duration::from_millis(100));

        assert_eq!(*recorder.timeouts.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_idle_timeout_after_media_then_rearm() {
        let recorder = Arc::new(Recorder::default());
        let mut rx = RtpReceiver::new(
            recorder.clone(),
            SsrcPolicy::default(),
            DEFAULT_EVENT_PAYLOAD,
            TimeoutConfig { initial_ms: 10, idle_ms: 10 },
        );

        rx.process_packet(&media_packet(1, 160, 0x1111));
        let later = Instant::now() + Duration::from_millis(50);
        rx.check_timeout(later);
        rx.check_timeout(later + Duration::from_millis(50));
        assert_eq!(*recorder.timeouts.lock().unwrap(), vec![false]);

        // Media resumes, then stops again: one more notification
        rx.process_packet(&media_packet(2, 320, 0x1111));
        rx.check_timeout(Instant::now() + Duration::from_millis(200));
        assert_eq!(*recorder.timeouts.lock().unwrap(), vec![false, false]);
    }

    #[tokio::test]
    async fn test_session_end_to_end() {
        use crate::transport::PortRange;

        init_test_logging();

        let recorder = Arc::new(Recorder::default());
        let mut config = RtpSessionConfig::default();
        config.transport.local_ip = "127.0.0.1".parse().unwrap();
        config.transport.port_range = PortRange::new(23000, 23100);
        config.transport.rtcp = false;
        let session = RtpSession::bind(config, recorder.clone()).unwrap();
        session.set_payload_type(8);
        session.start();

        let mut peer_config = RtpSessionConfig::default();
        peer_config.transport.local_ip = "127.0.0.1".parse().unwrap();
        peer_config.transport.port_range = PortRange::new(23000, 23100);
        peer_config.transport.rtcp = false;
        let peer = RtpSession::bind(peer_config, Arc::new(Recorder::default())).unwrap();
        peer.set_payload_type(8);
        peer.set_remote(session.local_addr().unwrap()).await;

        peer.send_payload(Bytes::from_static(b"frame one"), 160, true).await.unwrap();
        peer.send_payload(Bytes::from_static(b"frame two"), 320, false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let data = recorder.data.lock().unwrap().clone();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].0, 160);
        assert!(data[0].1);

        session.close().await;
        peer.close().await;
    }

    #[tokio::test]
    async fn test_session_srtp_end_to_end() {
        use crate::srtp::{CryptoSuite, MasterKey, SrtpContext};
        use crate::transport::PortRange;

        let master = MasterKey::generate();
        let recorder = Arc::new(Recorder::default());

        let mut config = RtpSessionConfig::default();
        config.transport.local_ip = "127.0.0.1".parse().unwrap();
        config.transport.port_range = PortRange::new(23200, 23300);
        config.transport.rtcp = false;
        let session = RtpSession::bind(config, recorder.clone()).unwrap();
        session.set_payload_type(8);
        session.set_srtp(None, Some(SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master)));
        session.start();

        let mut peer_config = RtpSessionConfig::default();
        peer_config.transport.local_ip = "127.0.0.1".parse().unwrap();
        peer_config.transport.port_range = PortRange::new(23200, 23300);
        peer_config.transport.rtcp = false;
        let peer = RtpSession::bind(peer_config, Arc::new(Recorder::default())).unwrap();
        peer.set_payload_type(8);
        peer.set_srtp(Some(SrtpContext::new(CryptoSuite::AesCm128HmacSha1_80, &master)), None);
        peer.set_remote(session.local_addr().unwrap()).await;

        peer.send_payload(Bytes::from_static(b"secret frame"), 160, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(recorder.data.lock().unwrap().len(), 1);

        session.close().await;
        peer.close().await;
    }
}
