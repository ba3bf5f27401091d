//! The relay service: engine request handlers
//!
//! One service instance owns the configuration, the registries and the
//! outbound bus. Handlers return `false` when a request is not for this
//! module (or fails setup), so the engine can try other handlers.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use rmedia_rtp_core::PortRange;

use crate::config::RelayConfig;
use crate::direction::Direction;
use crate::message::{self, Message, MessageBus};
use crate::reflector::RtpReflector;
use crate::registry::{ChannelRegistry, ReflectorRegistry};
use crate::sdp;
use crate::wrapper::RtpChannel;

/// Prefix selecting this module in attach requests
const RTP_PREFIX: &str = "rtp/";

/// Guess the local address that routes towards a remote one
pub fn guess_local_ip(remote: IpAddr) -> Option<IpAddr> {
    let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let probe = std::net::UdpSocket::bind(bind_addr).ok()?;
    probe.connect((remote, 9)).ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}

/// Media relay service
pub struct RelayService {
    config: RelayConfig,
    bus: Arc<dyn MessageBus>,
    channels: ChannelRegistry,
    reflectors: ReflectorRegistry,
}

impl RelayService {
    pub fn new(config: RelayConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self { config, bus, channels: ChannelRegistry::new(), reflectors: ReflectorRegistry::new() }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn reflectors(&self) -> &ReflectorRegistry {
        &self.reflectors
    }

    /// Route one engine message to its handler
    pub async fn handle_message(&self, msg: &mut Message) -> bool {
        match msg.name() {
            "chan.attach" => self.handle_attach(msg).await,
            "chan.rtp" => self.handle_rtp_setup(msg).await,
            "chan.dtmf" => self.handle_dtmf(msg).await,
            "call.execute" => self.handle_reflect_execute(msg).await,
            "call.answered" => self.handle_reflect_answer(msg).await,
            "chan.hangup" => self.handle_reflect_hangup(msg).await,
            _ => false,
        }
    }

    /// Local address for a new channel: explicit, or guessed from the
    /// remote address
    fn local_ip_for(&self, msg: &Message) -> Option<IpAddr> {
        if let Some(local) = msg.get("localip") {
            return local.parse().ok();
        }
        let remote: IpAddr = msg.get("remoteip")?.parse().ok()?;
        guess_local_ip(remote)
    }

    fn fill_response(&self, msg: &mut Message, channel: &RtpChannel, status: &str) {
        if let Some(addr) = channel.local_addr() {
            msg.set("localip", addr.ip().to_string());
            msg.set("localport", addr.port().to_string());
        }
        msg.set("rtpid", channel.id());
        msg.set("status", status);
    }

    fn find_or_create_channel(
        &self,
        msg: &Message,
        media: &str,
        direction: Direction,
        udptl: bool,
    ) -> Option<(Arc<RtpChannel>, bool)> {
        if let Some(rtpid) = msg.get("rtpid") {
            if let Some(channel) = self.channels.find_by_id(rtpid) {
                return Some((channel, false));
            }
        }
        let endpoint = msg.get("id")?;
        if let Some(channel) = self.channels.find_by_endpoint(endpoint, media) {
            return Some((channel, false));
        }

        let local_ip = self.local_ip_for(msg)?;
        let channel = match RtpChannel::create(
            &self.config,
            self.bus.clone(),
            local_ip,
            endpoint.to_string(),
            media.to_string(),
            direction,
            msg,
            udptl,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Channel setup failed for {}: {}", endpoint, e);
                return None;
            }
        };

        // The registry enforces (endpoint, media) uniqueness; a racing
        // insert hands back the winner
        let registered = self.channels.insert(channel.clone());
        let created = Arc::ptr_eq(&registered, &channel);
        Some((registered, created))
    }

    /// media-attach request: plug a source and/or consumer of this module
    /// into a call endpoint
    pub async fn handle_attach(&self, msg: &mut Message) -> bool {
        let wants_source = msg.get("source").map(|s| s.starts_with(RTP_PREFIX)).unwrap_or(false);
        let wants_consumer =
            msg.get("consumer").map(|s| s.starts_with(RTP_PREFIX)).unwrap_or(false);
        if !wants_source && !wants_consumer {
            return false;
        }

        let media = msg.get_or("media", "audio").to_string();
        let mut direction = Direction::STOPPED;
        if wants_source {
            direction = direction.with(Direction::RECV);
        }
        if wants_consumer {
            direction = direction.with(Direction::SEND);
        }

        let Some((channel, created)) = self.find_or_create_channel(msg, &media, direction, false)
        else {
            return false;
        };

        if wants_source {
            channel.add_direction(Direction::RECV);
            let _ = channel.get_source();
        }
        if wants_consumer {
            channel.add_direction(Direction::SEND);
            let _ = channel.get_consumer();
        }

        self.fill_response(msg, &channel, if created { "created" } else { "updated" });
        true
    }

    /// rtp-setup request: create/update/terminate a media leg
    pub async fn handle_rtp_setup(&self, msg: &mut Message) -> bool {
        let transport = msg.get_or("transport", "RTP/AVP").to_string();
        let udptl = transport.eq_ignore_ascii_case("udptl");
        if !udptl && !transport.starts_with("RTP/") {
            return false;
        }

        if msg.get_bool("terminate", false) {
            let Some(channel) = msg.get("rtpid").and_then(|id| self.channels.remove(id)) else {
                return false;
            };
            channel.terminate(Some(msg)).await;
            msg.set("status", "terminated");
            return true;
        }

        let media = msg.get_or("media", if udptl { "image" } else { "audio" }).to_string();
        let direction = Direction::from_param(msg.get_or("direction", "bidir"));

        let Some((channel, created)) = self.find_or_create_channel(msg, &media, direction, udptl)
        else {
            return false;
        };

        match channel.setup(msg, &self.config).await {
            Ok(_started) => {
                self.fill_response(msg, &channel, if created { "created" } else { "updated" });
                true
            }
            Err(e) => {
                warn!("Setup failed on {}: {}", channel.id(), e);
                if created {
                    // A channel that never completed setup does not linger
                    self.channels.remove(channel.id());
                    channel.terminate(None).await;
                }
                false
            }
        }
    }

    /// dtmf-send request: forward digits out-of-band on a channel
    pub async fn handle_dtmf(&self, msg: &Message) -> bool {
        let Some(channel) = msg.get("targetid").and_then(|id| self.channels.find_by_id(id)) else {
            return false;
        };
        let Some(text) = msg.get("text") else {
            return false;
        };
        let duration = msg.get_int("duration", 100).max(0) as u32;

        for tone in text.chars() {
            if let Err(e) = channel.send_dtmf(tone, duration).await {
                debug!("DTMF '{}' not sent on {}: {}", tone, channel.id(), e);
            }
        }
        true
    }

    /// reflect-execute: start relaying leg A of a forwarded call
    pub async fn handle_reflect_execute(&self, msg: &mut Message) -> bool {
        if !msg.get_bool("rtp_forward", false) || !msg.get_bool("rtp_reflect", false) {
            return false;
        }
        let Some(leg_a) = msg.get("id").map(str::to_string) else {
            return false;
        };
        let Some(body) = msg.get("sdp_raw").map(str::to_string) else {
            return false;
        };
        let info = match sdp::parse_sdp(&body) {
            Ok(info) => info,
            Err(e) => {
                warn!("Reflector for {} rejected SDP: {}", leg_a, e);
                return false;
            }
        };

        let local_ip = match msg
            .get("rtp_localip")
            .and_then(|s| s.parse().ok())
            .or_else(|| info.addr.parse().ok().and_then(guess_local_ip))
        {
            Some(ip) => ip,
            None => return false,
        };
        let range = PortRange::new(
            msg.get_int("rtp_minport", self.config.min_port as i64) as u16,
            msg.get_int("rtp_maxport", self.config.max_port as i64) as u16,
        );
        let rtcp = msg.get_bool("rtp_rtcp", true);
        let drill = msg.get_bool("rtp_drillhole", self.config.drill_hole);

        let reflector = match RtpReflector::create(
            &self.config,
            self.bus.clone(),
            leg_a,
            local_ip,
            range,
            rtcp,
            drill,
            &info,
        )
        .await
        {
            Ok(reflector) => reflector,
            Err(e) => {
                warn!("Reflector allocation failed: {}", e);
                return false;
            }
        };

        let Some(local) = reflector.local_a_addr() else {
            return false;
        };
        msg.set("sdp_raw", sdp::rewrite_sdp(&body, &local.ip().to_string(), local.port()));
        self.reflectors.insert(reflector);
        true
    }

    /// reflect-answer: complete leg B, or drop the relay on mismatch
    pub async fn handle_reflect_answer(&self, msg: &mut Message) -> bool {
        let Some(leg_b) = msg.get("id").map(str::to_string) else {
            return false;
        };
        let Some(peer) = msg.get("peerid").map(str::to_string) else {
            return false;
        };
        let Some(reflector) = self.reflectors.find_by_leg_a(&peer) else {
            return false;
        };

        let parsed = msg
            .get("sdp_raw")
            .map(str::to_string)
            .ok_or_else(|| crate::error::Error::BadSdp("no SDP in answer".to_string()))
            .and_then(|body| sdp::parse_sdp(&body).map(|info| (body, info)));

        let (body, info) = match parsed {
            Ok(ok) => ok,
            Err(e) => {
                warn!("Dropping reflector {}: {}", peer, e);
                self.drop_reflector(&reflector).await;
                return false;
            }
        };

        if let Err(e) = reflector.answer(&leg_b, &info).await {
            warn!("Dropping reflector {}: {}", peer, e);
            self.drop_reflector(&reflector).await;
            return false;
        }

        if let Some(local) = reflector.local_b_addr() {
            msg.set("sdp_raw", sdp::rewrite_sdp(&body, &local.ip().to_string(), local.port()));
        }
        true
    }

    /// reflect-hangup: flush statistics, remove once both legs are gone
    pub async fn handle_reflect_hangup(&self, msg: &mut Message) -> bool {
        let Some(leg) = msg.get("id").map(str::to_string) else {
            return false;
        };
        let Some(reflector) = self.reflectors.find_by_leg(&leg) else {
            return false;
        };
        if reflector.hangup(&leg, msg) {
            self.reflectors.remove(reflector.leg_a());
            reflector.close().await;
        }
        true
    }

    /// Tear down a failed reflector and drop the surviving leg
    async fn drop_reflector(&self, reflector: &Arc<RtpReflector>) {
        self.reflectors.remove(reflector.leg_a());
        reflector.close().await;
        self.bus.enqueue(message::call_drop(reflector.leg_a()));
    }

    /// Drain both registries at shutdown
    pub async fn shutdown(&self) {
        let channels = self.channels.drain();
        info!("Shutting down relay service ({} channels)", channels.len());
        for channel in channels {
            channel.terminate(None).await;
        }
        for reflector in self.reflectors.drain() {
            reflector.close().await;
        }
    }
}
