//! Engine message contracts
//!
//! The relay talks to the rest of the engine exclusively through named
//! parameter-list messages. Inbound requests are handled by the relay
//! service; outbound notifications are enqueued on a [`MessageBus`] and
//! never dispatched synchronously from a packet pump.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// A named message with string parameters
#[derive(Debug, Clone, Default)]
pub struct Message {
    name: String,
    params: HashMap<String, String>,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: HashMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter value, if present and non-empty
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// Parameter value or a default
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Boolean parameter; absent means `default`
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("true") | Some("yes") | Some("on") | Some("enable") | Some("1") => true,
            Some("false") | Some("no") | Some("off") | Some("disable") | Some("0") => false,
            _ => default,
        }
    }

    /// Integer parameter; absent or malformed means `default`
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Set a parameter, replacing any existing value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Builder-style parameter setter
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

/// Asynchronous message sink towards the engine.
///
/// `enqueue` must be non-blocking: it is called from packet pumps.
pub trait MessageBus: Send + Sync {
    fn enqueue(&self, msg: Message);
}

/// Bus implementation backed by an unbounded channel, used by the engine
/// glue and by tests to observe notifications.
pub struct QueueBus {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl QueueBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<Message> {
        let mut rx = self.rx.lock().unwrap();
        let mut drained = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            drained.push(msg);
        }
        drained
    }
}

impl MessageBus for QueueBus {
    fn enqueue(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }
}

/// Builders for the notifications the relay produces

/// DTMF detected on a channel: masqueraded as a `chan.dtmf` for the master
pub fn dtmf_masquerade(master_id: &str, tone: char, duration: u16) -> Message {
    Message::new("chan.masquerade")
        .with("message", "chan.dtmf")
        .with("id", master_id)
        .with("text", tone.to_string())
        .with("duration", duration.to_string())
        .with("detected", "inband")
}

/// Fax tone detected and a divert target is configured: execute the divert
pub fn fax_divert(master_id: &str, divert: &str, caller: &str, called: &str) -> Message {
    Message::new("chan.masquerade")
        .with("message", "call.execute")
        .with("id", master_id)
        .with("callto", divert)
        .with("caller", caller)
        .with("called", called)
        .with("reason", "fax")
}

/// Fax tone detected without a divert target
pub fn fax_notify(master_id: &str) -> Message {
    Message::new("call.fax").with("id", master_id).with("detected", "inband")
}

/// Media timeout notification
pub fn timeout_notify(notify_name: &str, target_id: &str, initial: bool) -> Message {
    Message::new(notify_name)
        .with("id", target_id)
        .with("reason", "nomedia")
        .with("event", "timeout")
        .with("initial", if initial { "true" } else { "false" })
}

/// Reflector failure: drop the surviving leg
pub fn call_drop(leg_id: &str) -> Message {
    Message::new("call.drop").with("id", leg_id).with("reason", "nomedia")
}

/// Aggregate statistics on module level
pub fn module_update(module: &str, no_media: u64, lost_media: u64) -> Message {
    Message::new("module.update")
        .with("module", module)
        .with("nomedia", no_media.to_string())
        .with("lostmedia", lost_media.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_accessors() {
        let mut msg = Message::new("chan.rtp");
        msg.set("remoteip", "203.0.113.5");
        msg.set("remoteport", "30000");
        msg.set("anyssrc", "yes");
        msg.set("empty", "");

        assert_eq!(msg.get("remoteip"), Some("203.0.113.5"));
        assert_eq!(msg.get_int("remoteport", 0), 30000);
        assert!(msg.get_bool("anyssrc", false));
        assert!(!msg.get_bool("missing", false));
        // Empty values read as absent
        assert_eq!(msg.get("empty"), None);
        assert_eq!(msg.get_or("media", "audio"), "audio");
    }

    #[test]
    fn test_queue_bus_drains_in_order() {
        let bus = QueueBus::new();
        bus.enqueue(Message::new("first"));
        bus.enqueue(Message::new("second"));

        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name(), "first");
        assert_eq!(drained[1].name(), "second");
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn test_notification_shapes() {
        let dtmf = dtmf_masquerade("sip/123", '5', 80);
        assert_eq!(dtmf.name(), "chan.masquerade");
        assert_eq!(dtmf.get("message"), Some("chan.dtmf"));
        assert_eq!(dtmf.get("text"), Some("5"));

        let timeout = timeout_notify("chan.notify", "yrtp/abc", true);
        assert_eq!(timeout.get("reason"), Some("nomedia"));
        assert_eq!(timeout.get("event"), Some("timeout"));
        assert_eq!(timeout.get("initial"), Some("true"));

        let drop = call_drop("sip/9");
        assert_eq!(drop.name(), "call.drop");
        assert_eq!(drop.get("reason"), Some("nomedia"));
    }
}
