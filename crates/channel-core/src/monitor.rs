//! Passive RTP monitor
//!
//! Counts packets and bytes flowing through a reflector leg without taking
//! part in forwarding. A periodic tick compares the activity clock against
//! a timeout and yields an at-most-once notification target.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sentinel for "no payload type observed yet"
const NO_PAYLOAD: u32 = u32::MAX;

/// Passive statistics collector for one relay leg
pub struct RtpMonitor {
    /// RTP packets and payload bytes seen
    packets: AtomicU64,
    bytes: AtomicU64,

    /// RTCP packets and bytes seen
    rtcp_packets: AtomicU64,
    rtcp_bytes: AtomicU64,

    /// Last observed payload type
    last_payload: AtomicU32,

    /// Activity clocks; started when the leg goes live
    clocks: Mutex<MonitorClocks>,

    /// Call id to notify on timeout; taken exactly once
    notify_id: Mutex<Option<String>>,
}

#[derive(Default)]
struct MonitorClocks {
    start: Option<Instant>,
    last_activity: Option<Instant>,
}

impl RtpMonitor {
    pub fn new(notify_id: Option<String>) -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            rtcp_packets: AtomicU64::new(0),
            rtcp_bytes: AtomicU64::new(0),
            last_payload: AtomicU32::new(NO_PAYLOAD),
            clocks: Mutex::new(MonitorClocks::default()),
            notify_id: Mutex::new(notify_id),
        }
    }

    /// Start the activity clock (leg answered)
    pub fn start_clock(&self) {
        let mut clocks = self.clocks.lock().unwrap();
        let now = Instant::now();
        if clocks.start.is_none() {
            clocks.start = Some(now);
        }
        clocks.last_activity = Some(now);
    }

    /// Record one RTP packet
    pub fn saw_rtp(&self, len: usize, payload_type: u8) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_payload.store(payload_type as u32, Ordering::Relaxed);
        self.clocks.lock().unwrap().last_activity = Some(Instant::now());
    }

    /// Record one RTCP packet
    pub fn saw_rtcp(&self, len: usize) {
        self.rtcp_packets.fetch_add(1, Ordering::Relaxed);
        self.rtcp_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.clocks.lock().unwrap().last_activity = Some(Instant::now());
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn last_payload(&self) -> Option<u8> {
        match self.last_payload.load(Ordering::Relaxed) {
            NO_PAYLOAD => None,
            pt => Some(pt as u8),
        }
    }

    /// Compact per-leg summary for hangup messages
    pub fn summary(&self) -> String {
        format!(
            "P={},O={},PT={}",
            self.packets(),
            self.bytes(),
            self.last_payload().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
        )
    }

    /// Timeout tick. When the clock has been running and no activity was
    /// seen within `timeout`, yields the notify id exactly once; subsequent
    /// ticks return `None`.
    pub fn check_timeout(&self, now: Instant, timeout: Duration) -> Option<String> {
        if timeout.is_zero() {
            return None;
        }
        let idle = {
            let clocks = self.clocks.lock().unwrap();
            match (clocks.start, clocks.last_activity) {
                (Some(_), Some(last)) => now.duration_since(last) >= timeout,
                _ => false,
            }
        };
        if idle {
            return self.notify_id.lock().unwrap().take();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let monitor = RtpMonitor::new(None);
        monitor.saw_rtp(172, 8);
        monitor.saw_rtp(172, 8);
        monitor.saw_rtcp(60);

        assert_eq!(monitor.packets(), 2);
        assert_eq!(monitor.bytes(), 344);
        assert_eq!(monitor.last_payload(), Some(8));
        assert_eq!(monitor.summary(), "P=2,O=344,PT=8");
    }

    #[test]
    fn test_timeout_notifies_at_most_once() {
        let monitor = RtpMonitor::new(Some("sip/42".to_string()));
        monitor.start_clock();

        let later = Instant::now() + Duration::from_secs(10);
        let timeout = Duration::from_secs(5);

        assert_eq!(monitor.check_timeout(later, timeout), Some("sip/42".to_string()));
        // The latch is spent
        assert_eq!(monitor.check_timeout(later + Duration::from_secs(10), timeout), None);
    }

    #[test]
    fn test_no_timeout_before_clock_starts() {
        let monitor = RtpMonitor::new(Some("sip/42".to_string()));
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(monitor.check_timeout(later, Duration::from_secs(5)), None);
    }

    #[test]
    fn test_activity_defers_timeout() {
        let monitor = RtpMonitor::new(Some("sip/42".to_string()));
        monitor.start_clock();
        monitor.saw_rtp(100, 0);

        let soon = Instant::now() + Duration::from_millis(100);
        assert_eq!(monitor.check_timeout(soon, Duration::from_secs(5)), None);
    }
}
