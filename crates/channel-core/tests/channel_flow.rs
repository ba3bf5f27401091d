//! End-to-end request flows against the relay service

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rmedia_channel_core::{Message, QueueBus, RelayConfig, RelayService};
use rmedia_rtp_core::{RtpPacket, TelephoneEvent};

fn make_service(min_port: u16, max_port: u16) -> (RelayService, Arc<QueueBus>) {
    let bus = Arc::new(QueueBus::new());
    let mut config = RelayConfig::default();
    config.min_port = min_port;
    config.max_port = max_port;
    (RelayService::new(config, bus.clone()), bus)
}

fn attach_message(call_id: &str) -> Message {
    Message::new("chan.attach")
        .with("source", "rtp/")
        .with("media", "audio")
        .with("id", call_id)
        .with("localip", "127.0.0.1")
}

#[tokio::test]
async fn attach_creates_channel_with_local_address() {
    let (service, _bus) = make_service(24000, 24100);

    let mut msg = attach_message("sip/100");
    assert!(service.handle_message(&mut msg).await);

    assert_eq!(msg.get("localip"), Some("127.0.0.1"));
    let port: u16 = msg.get("localport").unwrap().parse().unwrap();
    assert_eq!(port % 2, 0);
    assert!((24000..24100).contains(&port));
    assert!(msg.get("rtpid").unwrap().starts_with("yrtp/"));
    assert_eq!(msg.get("status"), Some("created"));
    assert_eq!(service.channels().len(), 1);

    let channel = service.channels().find_by_id(msg.get("rtpid").unwrap()).unwrap();
    assert!(channel.direction().can_receive());
}

#[tokio::test]
async fn attach_is_unique_per_endpoint_and_media() {
    let (service, _bus) = make_service(24100, 24200);

    let mut first = attach_message("sip/101");
    let mut second = attach_message("sip/101");
    let mut other_media = attach_message("sip/101").with("media", "video");

    assert!(service.handle_message(&mut first).await);
    assert!(service.handle_message(&mut second).await);
    assert!(service.handle_message(&mut other_media).await);

    // Same (endpoint, media) pair reuses the wrapper
    assert_eq!(first.get("rtpid"), second.get("rtpid"));
    assert_eq!(second.get("status"), Some("updated"));
    // A different media label gets its own wrapper
    assert_ne!(first.get("rtpid"), other_media.get("rtpid"));
    assert_eq!(service.channels().len(), 2);
}

#[tokio::test]
async fn attach_without_address_is_not_handled() {
    let (service, _bus) = make_service(24200, 24300);

    // Neither localip nor remoteip to guess from
    let mut msg = Message::new("chan.attach").with("source", "rtp/").with("id", "sip/102");
    assert!(!service.handle_message(&mut msg).await);
    assert_eq!(msg.get("localport"), None);
    assert_eq!(service.channels().len(), 0);
}

#[tokio::test]
async fn attach_ignores_other_modules() {
    let (service, _bus) = make_service(24300, 24400);

    let mut msg = Message::new("chan.attach")
        .with("source", "wave/play/test.au")
        .with("id", "sip/103")
        .with("localip", "127.0.0.1");
    assert!(!service.handle_message(&mut msg).await);
}

fn setup_message(call_id: &str, remote_port: u16) -> Message {
    Message::new("chan.rtp")
        .with("transport", "RTP/AVP")
        .with("id", call_id)
        .with("media", "audio")
        .with("format", "alaw")
        .with("direction", "bidir")
        .with("remoteip", "127.0.0.1")
        .with("remoteport", remote_port.to_string())
        .with("localip", "127.0.0.1")
}

#[tokio::test]
async fn setup_negotiates_alaw_and_is_idempotent() {
    let (service, _bus) = make_service(24400, 24500);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let mut msg = setup_message("sip/200", peer_port);
    assert!(service.handle_message(&mut msg).await);
    assert_eq!(msg.get("status"), Some("created"));
    let rtpid = msg.get("rtpid").unwrap().to_string();

    let channel = service.channels().find_by_id(&rtpid).unwrap();
    assert_eq!(channel.format().as_deref(), Some("alaw"));

    // A second identical request only updates: same wrapper, no
    // renegotiation, resync forced
    let mut again = setup_message("sip/200", peer_port).with("rtpid", rtpid.clone());
    assert!(service.handle_message(&mut again).await);
    assert_eq!(again.get("status"), Some("updated"));
    assert_eq!(again.get("rtpid"), Some(rtpid.as_str()));
    assert_eq!(service.channels().len(), 1);
}

#[tokio::test]
async fn setup_rejects_unknown_format() {
    let (service, _bus) = make_service(24500, 24600);

    let mut msg = setup_message("sip/201", 30000).with("format", "codec2");
    assert!(!service.handle_message(&mut msg).await);
    // The failed channel does not linger in the registry
    assert_eq!(service.channels().len(), 0);
}

#[tokio::test]
async fn setup_rejects_payload_out_of_range() {
    let (service, _bus) = make_service(24600, 24700);

    let mut msg = Message::new("chan.rtp")
        .with("transport", "RTP/AVP")
        .with("id", "sip/202")
        .with("payload", "200")
        .with("remoteip", "127.0.0.1")
        .with("remoteport", "30000")
        .with("localip", "127.0.0.1");
    assert!(!service.handle_message(&mut msg).await);
    assert_eq!(service.channels().len(), 0);
}

#[tokio::test]
async fn setup_answers_srtp_offer() {
    use rmedia_rtp_core::srtp::MasterKey;

    let (service, _bus) = make_service(24700, 24800);
    let offer_key = MasterKey::generate().to_base64();

    let mut msg = setup_message("sip/203", 30002)
        .with("crypto_suite", "AES_CM_128_HMAC_SHA1_80")
        .with("crypto_key", offer_key);
    assert!(service.handle_message(&mut msg).await);

    assert_eq!(msg.get("ocrypto_suite"), Some("AES_CM_128_HMAC_SHA1_80"));
    let answer_key = msg.get("ocrypto_key").unwrap();
    assert!(MasterKey::from_base64(answer_key).is_ok());
}

#[tokio::test]
async fn setup_with_bad_srtp_falls_back_to_cleartext() {
    let (service, _bus) = make_service(24800, 24900);

    let mut msg = setup_message("sip/204", 30004)
        .with("crypto_suite", "NOT_A_SUITE")
        .with("crypto_key", "junk");
    // Setup still succeeds, without a crypto answer
    assert!(service.handle_message(&mut msg).await);
    assert_eq!(msg.get("ocrypto_suite"), None);
}

#[tokio::test]
async fn udptl_setup_clamps_max_datagram() {
    let (service, _bus) = make_service(24900, 25000);

    // Setup-only request: negotiate fax parameters without starting
    let mut msg = Message::new("chan.rtp")
        .with("transport", "udptl")
        .with("id", "sip/300")
        .with("localip", "127.0.0.1")
        .with("t38maxdatagram", "50");
    assert!(service.handle_message(&mut msg).await);

    // Below the sane floor of 96 the effective maximum becomes 250
    assert_eq!(msg.get("t38maxdatagram"), Some("250"));
    assert!(msg.get("rtpid").unwrap().starts_with("udptl/"));
}

#[tokio::test]
async fn terminate_flushes_stats_and_unregisters() {
    let (service, bus) = make_service(25000, 25100);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/400", peer.local_addr().unwrap().port());
    assert!(service.handle_message(&mut msg).await);
    let rtpid = msg.get("rtpid").unwrap().to_string();
    bus.drain();

    let mut terminate = Message::new("chan.rtp")
        .with("transport", "RTP/AVP")
        .with("terminate", "yes")
        .with("rtpid", rtpid.clone());
    assert!(service.handle_message(&mut terminate).await);

    assert_eq!(terminate.get("status"), Some("terminated"));
    assert!(terminate.get("stats").unwrap().starts_with("PS="));
    assert_eq!(service.channels().len(), 0);

    // Aggregate statistics go out on the bus
    let drained = bus.drain();
    assert!(drained.iter().any(|m| m.name() == "module.update"));

    // Terminating again is not handled
    let mut again = Message::new("chan.rtp")
        .with("transport", "RTP/AVP")
        .with("terminate", "yes")
        .with("rtpid", rtpid);
    assert!(!service.handle_message(&mut again).await);
}

/// Build the raw bytes of a telephone-event packet
fn event_packet_bytes(seq: u16, ssrc: u32, event: TelephoneEvent) -> Vec<u8> {
    let packet = RtpPacket::new_with_payload(101, seq, 800, ssrc, event.serialize());
    packet.serialize().unwrap().to_vec()
}

#[tokio::test]
async fn dtmf_detection_notifies_master() {
    let (service, bus) = make_service(25100, 25200);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/500", peer.local_addr().unwrap().port());
    assert!(service.handle_message(&mut msg).await);
    let local_port: u16 = msg.get("localport").unwrap().parse().unwrap();
    let dest = format!("127.0.0.1:{}", local_port);

    // One full key press: begin then end
    peer.send_to(&event_packet_bytes(1, 0x42, TelephoneEvent::new(5, false, 10, 160)), &dest)
        .await
        .unwrap();
    peer.send_to(&event_packet_bytes(2, 0x42, TelephoneEvent::new(5, true, 10, 480)), &dest)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let drained = bus.drain();
    let dtmf: Vec<_> = drained
        .iter()
        .filter(|m| m.name() == "chan.masquerade" && m.get("message") == Some("chan.dtmf"))
        .collect();
    assert_eq!(dtmf.len(), 1);
    assert_eq!(dtmf[0].get("text"), Some("5"));
    assert_eq!(dtmf[0].get("id"), Some("sip/500"));
}

#[tokio::test]
async fn fax_tone_notifies_once() {
    let (service, bus) = make_service(25200, 25300);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/501", peer.local_addr().unwrap().port());
    assert!(service.handle_message(&mut msg).await);
    let local_port: u16 = msg.get("localport").unwrap().parse().unwrap();
    let dest = format!("127.0.0.1:{}", local_port);

    // CNG tone arrives twice; only the first one may notify
    peer.send_to(&event_packet_bytes(1, 0x43, TelephoneEvent::new(36, true, 0, 160)), &dest)
        .await
        .unwrap();
    peer.send_to(&event_packet_bytes(2, 0x43, TelephoneEvent::new(36, true, 0, 160)), &dest)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let drained = bus.drain();
    let fax: Vec<_> = drained.iter().filter(|m| m.name() == "call.fax").collect();
    assert_eq!(fax.len(), 1);
    assert_eq!(fax[0].get("id"), Some("sip/501"));
}

#[tokio::test]
async fn fax_divert_masquerades_execute() {
    let (service, bus) = make_service(25300, 25400);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/502", peer.local_addr().unwrap().port())
        .with("fax_divert", "fax/receive")
        .with("fax_caller", "12345")
        .with("fax_called", "67890");
    assert!(service.handle_message(&mut msg).await);
    let local_port: u16 = msg.get("localport").unwrap().parse().unwrap();
    let dest = format!("127.0.0.1:{}", local_port);

    peer.send_to(&event_packet_bytes(1, 0x44, TelephoneEvent::new(36, true, 0, 160)), &dest)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let drained = bus.drain();
    let divert: Vec<_> = drained
        .iter()
        .filter(|m| m.name() == "chan.masquerade" && m.get("message") == Some("call.execute"))
        .collect();
    assert_eq!(divert.len(), 1);
    assert_eq!(divert[0].get("callto"), Some("fax/receive"));
    assert_eq!(divert[0].get("caller"), Some("12345"));
}

#[tokio::test]
async fn outbound_dtmf_reaches_the_wire() {
    let (service, _bus) = make_service(25400, 25500);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/503", peer.local_addr().unwrap().port());
    assert!(service.handle_message(&mut msg).await);
    let rtpid = msg.get("rtpid").unwrap().to_string();

    let mut dtmf = Message::new("chan.dtmf")
        .with("targetid", rtpid)
        .with("text", "1#")
        .with("duration", "80");
    assert!(service.handle_message(&mut dtmf).await);

    // Each digit goes out as begin + two end packets
    let mut events = Vec::new();
    for _ in 0..6 {
        let mut buf = [0u8; 256];
        let recv =
            tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf)).await;
        let (len, _) = recv.expect("expected event packet").unwrap();
        let packet = RtpPacket::parse(&buf[..len]).unwrap();
        assert_eq!(packet.header.payload_type, 101);
        events.push(TelephoneEvent::parse(&packet.payload).unwrap());
    }
    assert_eq!(events[0].to_dtmf_char(), Some('1'));
    assert!(!events[0].end);
    assert!(events[2].end);
    assert_eq!(events[3].to_dtmf_char(), Some('#'));
}

#[tokio::test]
async fn media_timeout_notification() {
    let (service, bus) = make_service(25500, 25600);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/504", peer.local_addr().unwrap().port())
        .with("timeout", "50");
    assert!(service.handle_message(&mut msg).await);

    // No media ever arrives: exactly one initial timeout notification
    tokio::time::sleep(Duration::from_millis(400)).await;

    let drained = bus.drain();
    let timeouts: Vec<_> = drained
        .iter()
        .filter(|m| m.name() == "chan.notify" && m.get("reason") == Some("nomedia"))
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].get("event"), Some("timeout"));
    assert_eq!(timeouts[0].get("initial"), Some("true"));
    assert_eq!(timeouts[0].get("id"), Some("sip/504"));
}

#[tokio::test]
async fn media_flows_to_attached_sink() {
    use rmedia_channel_core::{DataFlags, MediaSink};
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<(u32, usize)>>);
    impl MediaSink for Collect {
        fn deliver(&self, payload: Bytes, timestamp: u32, _flags: DataFlags) {
            self.0.lock().unwrap().push((timestamp, payload.len()));
        }
    }

    let (service, _bus) = make_service(25600, 25700);
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut msg = setup_message("sip/505", peer.local_addr().unwrap().port());
    assert!(service.handle_message(&mut msg).await);
    let channel = service.channels().find_by_id(msg.get("rtpid").unwrap()).unwrap();

    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    channel.get_source().attach_sink(sink.clone());

    let local_port: u16 = msg.get("localport").unwrap().parse().unwrap();
    let dest = format!("127.0.0.1:{}", local_port);
    let media = RtpPacket::new_with_payload(8, 10, 1600, 0x77, Bytes::from_static(&[0x55; 160]));
    peer.send_to(&media.serialize().unwrap(), &dest).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = sink.0.lock().unwrap().clone();
    assert_eq!(seen, vec![(1600, 160)]);
}
