//! The call-visible channel wrapper
//!
//! An [`RtpChannel`] binds one media leg to one signalling call. It owns
//! exactly one RTP or UDPTL session, at most one data source and one data
//! consumer, and mediates setup, restart, SRTP negotiation, DTMF/fax
//! detection and timeout policy. Packet-pump callbacks never call the call
//! layer synchronously: everything crosses over as enqueued bus messages.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, warn};

use rmedia_rtp_core::packet::udptl::{clamp_max_datagram, clamp_redundancy};
use rmedia_rtp_core::srtp::{CryptoSuite, MasterKey, SrtpContext};
use rmedia_rtp_core::{
    RtpSession, RtpSessionConfig, SessionEvents, TimeoutConfig, TransferStats, UdptlEvents,
    UdptlSession, UdptlSessionConfig,
};

use crate::adapters::{ChannelConsumer, ChannelSource, DataFlags};
use crate::config::RelayConfig;
use crate::direction::Direction;
use crate::error::{Error, Result};
use crate::message::{self, Message, MessageBus};
use crate::payload;

/// Module name reported in aggregate statistics
pub const MODULE_NAME: &str = "mediarelay";

/// Fax divert settings, taken from setup requests
#[derive(Debug, Default, Clone)]
struct FaxSettings {
    divert: Option<String>,
    caller: String,
    called: String,
}

/// State shared between the channel, its adapters and the pump listeners
pub(crate) struct ChannelShared {
    /// Cleared on terminate; adapters and listeners check it everywhere
    valid: Arc<AtomicBool>,

    /// Call id used as the target of asynchronous notifications
    master_id: Mutex<String>,

    /// Direction bitmask, read from the packet pump
    direction: AtomicU8,

    /// The source-swap slot: the only state shared between the packet pump
    /// (read, busy-flag protected) and the control side (write)
    source: Mutex<Option<Arc<ChannelSource>>>,

    fax: Mutex<FaxSettings>,

    bus: Arc<dyn MessageBus>,
    notify_name: String,

    /// Counters for the aggregate module.update on teardown
    no_media_events: AtomicU64,
    lost_media_events: AtomicU64,
}

impl ChannelShared {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn master_id(&self) -> String {
        self.master_id.lock().unwrap().clone()
    }

    fn direction(&self) -> Direction {
        Direction::from_bits(self.direction.load(Ordering::Acquire))
    }

    fn set_direction(&self, direction: Direction) {
        self.direction.store(direction.bits(), Ordering::Release);
    }

    /// Forward payload into the pipeline under the busy-flag handshake.
    ///
    /// The source is borrowed inside the swap lock and marked busy before
    /// the lock is released; a concurrent detach waits for the flag.
    fn forward(&self, payload: Bytes, timestamp: u32, flags: DataFlags) {
        if !self.is_valid() || !self.direction().can_receive() {
            return;
        }
        let source = {
            let guard = self.source.lock().unwrap();
            match guard.as_ref() {
                Some(source) => {
                    source.busy().begin();
                    source.clone()
                }
                None => return,
            }
        };
        source.deliver(payload, timestamp, flags);
        source.busy().end();
    }

    fn handle_dtmf(&self, tone: char, duration: u16) {
        if !self.is_valid() {
            return;
        }
        self.bus.enqueue(message::dtmf_masquerade(&self.master_id(), tone, duration));
    }

    fn handle_fax(&self) {
        if !self.is_valid() {
            return;
        }
        let fax = self.fax.lock().unwrap().clone();
        let master = self.master_id();
        match fax.divert {
            Some(divert) => {
                info!("Diverting fax call {} to {}", master, divert);
                self.bus.enqueue(message::fax_divert(&master, &divert, &fax.caller, &fax.called));
            }
            None => self.bus.enqueue(message::fax_notify(&master)),
        }
    }

    fn handle_timeout(&self, initial: bool) {
        if !self.is_valid() {
            return;
        }
        if initial {
            self.no_media_events.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lost_media_events.fetch_add(1, Ordering::Relaxed);
        }
        let master = self.master_id();
        warn!("Media timeout on {} (initial: {})", master, initial);
        self.bus.enqueue(message::timeout_notify(&self.notify_name, &master, initial));
    }
}

/// Listener installed into an RTP session; only flips flags and enqueues
struct RtpListener {
    shared: Arc<ChannelShared>,
}

impl SessionEvents for RtpListener {
    fn on_receive_data(&self, payload: Bytes, timestamp: u32, marker: bool, missed: bool) {
        self.shared.forward(payload, timestamp, DataFlags { marker, missed });
    }

    fn on_dtmf(&self, tone: char, duration: u16, _timestamp: u32) {
        self.shared.handle_dtmf(tone, duration);
    }

    fn on_fax_tone(&self) {
        self.shared.handle_fax();
    }

    fn on_timeout(&self, initial: bool) {
        self.shared.handle_timeout(initial);
    }
}

/// Listener installed into a UDPTL session
struct UdptlListener {
    shared: Arc<ChannelShared>,
}

impl UdptlEvents for UdptlListener {
    fn on_receive_datagram(&self, payload: Bytes, seq: u16, _recovered: bool) {
        // The UDPTL sequence number travels in place of an RTP timestamp
        self.shared.forward(payload, seq as u32, DataFlags::default());
    }

    fn on_timeout(&self, initial: bool) {
        self.shared.handle_timeout(initial);
    }
}

/// Exactly one of the two session types exists per channel
pub enum SessionKind {
    Rtp(RtpSession),
    Udptl(UdptlSession),
}

impl SessionKind {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            SessionKind::Rtp(s) => s.local_addr().ok(),
            SessionKind::Udptl(s) => s.local_addr().ok(),
        }
    }

    async fn set_remote(&self, addr: SocketAddr) {
        match self {
            SessionKind::Rtp(s) => s.set_remote(addr).await,
            SessionKind::Udptl(s) => s.set_remote(addr).await,
        }
    }

    fn set_timeout(&self, config: TimeoutConfig) {
        match self {
            SessionKind::Rtp(s) => s.set_timeout(config),
            SessionKind::Udptl(s) => s.set_timeout(config),
        }
    }

    fn stats(&self) -> TransferStats {
        match self {
            SessionKind::Rtp(s) => s.stats(),
            SessionKind::Udptl(s) => s.stats(),
        }
    }

    async fn close(&self) {
        match self {
            SessionKind::Rtp(s) => s.close().await,
            SessionKind::Udptl(s) => s.close().await,
        }
    }
}

/// Control-side mutable state; touched only by the control thread
struct ChannelState {
    format: Option<String>,
    remote: Option<SocketAddr>,
    started: bool,
    auto_addr: bool,
    buffer: usize,
}

/// A reference-counted media channel bound to one signalling call
pub struct RtpChannel {
    id: String,
    endpoint: String,
    media: String,
    shared: Arc<ChannelShared>,
    session: SessionKind,
    state: Mutex<ChannelState>,
    consumer: Mutex<Option<Arc<ChannelConsumer>>>,
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..12).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::BadAddress(format!("{}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::BadAddress(host.to_string()))
}

impl RtpChannel {
    /// Create a channel with its session, binding a local port from the
    /// configured range. Registered by the caller; must run inside a tokio
    /// runtime.
    pub(crate) fn create(
        config: &RelayConfig,
        bus: Arc<dyn MessageBus>,
        local_ip: IpAddr,
        endpoint: String,
        media: String,
        direction: Direction,
        msg: &Message,
        udptl: bool,
    ) -> Result<Arc<Self>> {
        let prefix = if udptl { "udptl" } else { "yrtp" };
        let id = format!("{}/{}", prefix, random_suffix());

        let shared = Arc::new(ChannelShared {
            valid: Arc::new(AtomicBool::new(true)),
            master_id: Mutex::new(msg.get_or("id", &endpoint).to_string()),
            direction: AtomicU8::new(direction.bits()),
            source: Mutex::new(None),
            fax: Mutex::new(FaxSettings::default()),
            bus,
            notify_name: config.notify_message.clone(),
            no_media_events: AtomicU64::new(0),
            lost_media_events: AtomicU64::new(0),
        });

        let mut transport = rmedia_rtp_core::RtpTransportConfig::default();
        transport.local_ip = local_ip;
        transport.port_range = config.port_range();
        transport.tos = match msg.get_int("tos", -1) {
            tos if tos >= 0 => Some(tos as u32),
            _ => config.tos,
        };
        transport.drill_hole = msg.get_bool("drillhole", config.drill_hole);

        let poll_interval = match msg.get_int("msleep", -1) {
            ms if ms > 0 => std::time::Duration::from_millis(ms as u64),
            _ => config.poll_interval(),
        };

        let session = if udptl {
            transport.rtcp = false;
            let max_datagram = msg
                .get_int("t38maxdatagram", msg.get_int("sdp_T38FaxMaxDatagram", 0))
                .clamp(0, u16::MAX as i64) as u16;
            let redundancy = if msg.get("t38redundancy").is_some() {
                msg.get_int("t38redundancy", 0).max(0) as u32
            } else if msg.get("sdp_T38FaxUdpEC") == Some("t38UDPRedundancy") {
                2
            } else {
                0
            };
            let udptl_config = UdptlSessionConfig {
                transport,
                max_datagram: clamp_max_datagram(max_datagram),
                redundancy: clamp_redundancy(redundancy),
                timeout: TimeoutConfig::default(),
                poll_interval,
            };
            let listener = Arc::new(UdptlListener { shared: shared.clone() });
            let session = UdptlSession::bind(udptl_config, listener)?;
            session.start();
            SessionKind::Udptl(session)
        } else {
            transport.rtcp = true;
            let event_payload = msg.get_int("evpayload", 101);
            if !(0..128).contains(&event_payload) {
                return Err(Error::PayloadOutOfRange(event_payload));
            }
            let rtp_config = RtpSessionConfig {
                transport,
                event_payload: event_payload as u8,
                ssrc_policy: rmedia_rtp_core::SsrcPolicy { any_ssrc: msg.get_bool("anyssrc", false) },
                timeout: TimeoutConfig::default(),
                poll_interval,
            };
            let listener = Arc::new(RtpListener { shared: shared.clone() });
            let session = RtpSession::bind(rtp_config, listener)?;
            session.start();
            SessionKind::Rtp(session)
        };

        let channel = Arc::new(Self {
            id,
            endpoint,
            media,
            shared,
            session,
            state: Mutex::new(ChannelState {
                format: None,
                remote: None,
                started: false,
                auto_addr: config.auto_addr,
                buffer: config.buffer,
            }),
            consumer: Mutex::new(None),
        });

        info!(
            "Created {} channel {} for {} on {:?}",
            channel.media,
            channel.id,
            channel.endpoint,
            channel.local_addr()
        );
        Ok(channel)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn media(&self) -> &str {
        &self.media
    }

    pub fn valid(&self) -> bool {
        self.shared.is_valid()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.local_addr()
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction()
    }

    pub fn is_udptl(&self) -> bool {
        matches!(self.session, SessionKind::Udptl(_))
    }

    pub fn format(&self) -> Option<String> {
        self.state.lock().unwrap().format.clone()
    }

    /// Configured buffer size, for the pipeline to size its stages
    pub fn buffer_size(&self) -> usize {
        self.state.lock().unwrap().buffer
    }

    pub fn stats(&self) -> TransferStats {
        self.session.stats()
    }

    /// OR capability bits into the direction mask
    pub fn add_direction(&self, direction: Direction) {
        let combined = self.shared.direction().with(direction);
        self.shared.set_direction(combined);
    }

    /// The explicit full stop: clears both direction bits
    pub fn full_stop(&self) {
        self.shared.set_direction(Direction::STOPPED);
    }

    /// Current source, or a lazily created one
    pub fn get_source(&self) -> Arc<ChannelSource> {
        let mut guard = self.shared.source.lock().unwrap();
        match guard.as_ref() {
            Some(source) => source.clone(),
            None => {
                let format = self.state.lock().unwrap().format.clone().unwrap_or_default();
                let source = Arc::new(ChannelSource::new(format, self.shared.valid.clone()));
                *guard = Some(source.clone());
                source
            }
        }
    }

    /// Current consumer, or a lazily created one
    pub fn get_consumer(self: &Arc<Self>) -> Arc<ChannelConsumer> {
        let mut guard = self.consumer.lock().unwrap();
        match guard.as_ref() {
            Some(consumer) => consumer.clone(),
            None => {
                let format = self.state.lock().unwrap().format.clone().unwrap_or_default();
                let consumer = Arc::new(ChannelConsumer::new(
                    format,
                    self.shared.valid.clone(),
                    Arc::downgrade(self),
                ));
                *guard = Some(consumer.clone());
                consumer
            }
        }
    }

    /// Detach both adapters, waiting out any in-flight forward call, so the
    /// pipeline rebuilds them with a new format.
    fn refresh_adapters(&self) {
        let old = self.shared.source.lock().unwrap().take();
        if let Some(source) = old {
            source.busy().wait_idle();
            source.detach_sink();
        }
        *self.consumer.lock().unwrap() = None;
    }

    /// Negotiate format/payload from request parameters
    fn negotiate_format(&self, msg: &Message) -> Result<()> {
        let format_param = msg.get("format");
        let payload_param = msg.get_int("payload", -1);

        let (format, payload_type) = match (format_param, payload_param) {
            (Some(format), -1) => {
                let pt = payload::format_to_payload(format)
                    .ok_or_else(|| Error::UnsupportedFormat(format.to_string()))?;
                (format.to_string(), pt)
            }
            (None, pt) if pt >= 0 => {
                if pt > 127 {
                    return Err(Error::PayloadOutOfRange(pt));
                }
                let format = payload::payload_to_format(pt as u8)
                    .ok_or_else(|| Error::UnsupportedFormat(format!("payload {}", pt)))?;
                (format.to_string(), pt as u8)
            }
            (Some(format), pt) => {
                if !(0..128).contains(&pt) {
                    return Err(Error::PayloadOutOfRange(pt));
                }
                (format.to_string(), pt as u8)
            }
            (None, _) => return Err(Error::UnsupportedFormat("no format or payload".to_string())),
        };

        if let SessionKind::Rtp(session) = &self.session {
            session.set_payload_type(payload_type);
        }

        let mut state = self.state.lock().unwrap();
        let format_changed = state.format.as_deref().is_some_and(|f| f != format);
        state.format = Some(format.clone());
        drop(state);

        if format_changed {
            // Force the pipeline to rebuild its codec chain
            debug!("Format change on {}, refreshing adapters", self.id);
            self.refresh_adapters();
        }
        debug!("Negotiated {} (payload {}) on {}", format, payload_type, self.id);
        Ok(())
    }

    /// SDES SRTP negotiation. A fresh negotiation always wins; failure is
    /// non-fatal and falls back to cleartext.
    fn negotiate_srtp(&self, msg: &mut Message) {
        let (suite_name, offer_key) = match (msg.get("crypto_suite"), msg.get("crypto_key")) {
            (Some(suite), Some(key)) => (suite.to_string(), key.to_string()),
            _ => return,
        };
        let session = match &self.session {
            SessionKind::Rtp(session) => session,
            SessionKind::Udptl(_) => return,
        };

        let negotiated = CryptoSuite::from_name(&suite_name)
            .and_then(|suite| SrtpContext::negotiate(&suite_name, &offer_key).map(|rx| (suite, rx)));
        let Some((suite, rx)) = negotiated else {
            warn!("SRTP negotiation failed on {} (suite {}), using cleartext", self.id, suite_name);
            return;
        };
        let local_key = MasterKey::generate();
        let tx = SrtpContext::new(suite, &local_key);

        session.set_srtp(Some(tx), Some(rx));
        msg.set("ocrypto_suite", suite.name());
        msg.set("ocrypto_key", local_key.to_base64());
        info!("SRTP enabled on {} with suite {}", self.id, suite.name());
    }

    /// Apply the remote address under the auto-address policy
    async fn apply_remote(&self, addr: SocketAddr, msg: &Message) -> Result<()> {
        let apply = {
            let mut state = self.state.lock().unwrap();
            let auto = msg.get_bool("autoaddr", state.auto_addr);
            if state.remote.is_some() && state.remote != Some(addr) && !auto {
                debug!("Ignoring signalled address change to {} on {}", addr, self.id);
                false
            } else {
                state.remote = Some(addr);
                true
            }
        };
        if apply {
            self.session.set_remote(addr).await;
        }
        Ok(())
    }

    fn apply_fax_params(&self, msg: &Message) {
        if let Some(divert) = msg.get("fax_divert") {
            let mut fax = self.shared.fax.lock().unwrap();
            fax.divert = Some(divert.to_string());
            fax.caller = msg.get_or("fax_caller", "").to_string();
            fax.called = msg.get_or("fax_called", "").to_string();
        }
    }

    /// Apply a setup/restart request.
    ///
    /// With a remote host/port this performs the first-time start (format,
    /// SRTP, timeouts, direction) or, if already started, only updates the
    /// remote address and forces an SSRC resync. Without a remote address
    /// it is a setup-only call (SRTP key exchange, UDPTL negotiation).
    ///
    /// Returns true when the session was started by this call.
    pub async fn setup(&self, msg: &mut Message, config: &RelayConfig) -> Result<bool> {
        if !self.valid() {
            return Err(Error::InvalidChannel);
        }

        if let Some(id) = msg.get("id") {
            *self.shared.master_id.lock().unwrap() = id.to_string();
        }
        if let Some(dir) = msg.get("direction") {
            self.add_direction(Direction::from_param(dir));
        }
        self.apply_fax_params(msg);

        let remote = match (msg.get("remoteip"), msg.get_int("remoteport", -1)) {
            (Some(host), port) if port >= 0 => Some(resolve_addr(host, port as u16)?),
            _ => None,
        };

        let Some(addr) = remote else {
            // Setup-only: prepare security or fax parameters without
            // starting transmission
            self.negotiate_srtp(msg);
            if let SessionKind::Udptl(session) = &self.session {
                msg.set("t38maxdatagram", session.max_datagram().to_string());
            }
            return Ok(false);
        };

        let already_started = self.state.lock().unwrap().started;
        if already_started {
            // Idempotent restart: address update plus resync only
            self.apply_remote(addr, msg).await?;
            if let SessionKind::Rtp(session) = &self.session {
                session.request_resync();
            }
            return Ok(false);
        }

        if let SessionKind::Rtp(session) = &self.session {
            if msg.get("evpayload").is_some() {
                let ev = msg.get_int("evpayload", 101);
                if !(0..128).contains(&ev) {
                    return Err(Error::PayloadOutOfRange(ev));
                }
                session.set_event_payload(ev as u8);
            }
            if msg.get("anyssrc").is_some() {
                session.set_any_ssrc(msg.get_bool("anyssrc", false));
            }
            self.negotiate_format(msg)?;
        }
        self.negotiate_srtp(msg);

        let timeout = TimeoutConfig {
            initial_ms: msg.get_int("timeout", config.timeout_ms as i64).max(0) as u64,
            idle_ms: msg.get_int("idle_timeout", config.idle_timeout_ms as i64).max(0) as u64,
        };
        self.session.set_timeout(timeout);

        if let SessionKind::Rtp(session) = &self.session {
            let padding = msg.get_int("padding", 0);
            if padding > 1 {
                session.set_padding(padding as usize);
            }
        }

        if let Some(buffer) = msg.get("buffer") {
            if let Ok(size) = buffer.parse::<usize>() {
                self.state.lock().unwrap().buffer = size;
            }
        }

        self.apply_remote(addr, msg).await?;
        self.state.lock().unwrap().started = true;
        info!("Started {} towards {}", self.id, addr);
        Ok(true)
    }

    /// Send one media buffer; called by the consumer
    pub(crate) async fn send_media(&self, payload: Bytes, timestamp: u32, marker: bool) -> Result<()> {
        if !self.valid() {
            return Err(Error::InvalidChannel);
        }
        if !self.direction().can_send() {
            return Ok(());
        }
        match &self.session {
            SessionKind::Rtp(session) => session.send_payload(payload, timestamp, marker).await?,
            SessionKind::Udptl(session) => {
                // Pipeline timestamps are sequence numbers on the fax path
                session.send_datagram(payload, timestamp as u16).await?
            }
        }
        Ok(())
    }

    /// Send out-of-band DTMF; silently ignored on fax channels
    pub async fn send_dtmf(&self, tone: char, duration_ms: u32) -> Result<()> {
        match &self.session {
            SessionKind::Rtp(session) => session.send_dtmf(tone, duration_ms).await,
            SessionKind::Udptl(_) => Ok(()),
        }
        .map_err(Error::from)
    }

    /// Terminate the channel: mark invalid, detach adapters after any
    /// in-flight forward completes, stop the session, flush statistics.
    pub async fn terminate(&self, response: Option<&mut Message>) {
        if !self.shared.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        self.full_stop();
        self.refresh_adapters();
        self.session.close().await;

        let stats = self.session.stats();
        if let Some(msg) = response {
            msg.set("stats", stats.summary());
        }
        self.shared.bus.enqueue(message::module_update(
            MODULE_NAME,
            self.shared.no_media_events.load(Ordering::Relaxed),
            self.shared.lost_media_events.load(Ordering::Relaxed),
        ));
        info!("Terminated {} ({})", self.id, stats.summary());
    }
}

impl Drop for RtpChannel {
    fn drop(&mut self) {
        debug!("Destroying channel {}", self.id);
    }
}
