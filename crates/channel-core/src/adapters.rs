//! Pipeline adapters: data source and data consumer
//!
//! `ChannelSource` pushes network payload into the engine's media pipeline;
//! `ChannelConsumer` takes pipeline payload and sends it to the network.
//! Both refuse to move data once their owning channel is no longer valid,
//! letting the pipeline detect and unplug dead endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use rmedia_rtp_core::BusyFlag;

use crate::payload;
use crate::wrapper::RtpChannel;

/// Delivery flags accompanying forwarded payload
#[derive(Debug, Clone, Copy, Default)]
pub struct DataFlags {
    /// RTP marker bit
    pub marker: bool,

    /// The loss counter advanced since the previous delivery
    pub missed: bool,
}

/// Engine-side sink a source feeds into.
///
/// Called from the packet pump; implementations must not block.
pub trait MediaSink: Send + Sync {
    fn deliver(&self, payload: Bytes, timestamp: u32, flags: DataFlags);
}

/// Engine-side feed interface implemented by the consumer: the pipeline
/// pushes payload toward the network through it.
#[async_trait]
pub trait MediaFeed: Send + Sync {
    /// Negotiated format name
    fn format(&self) -> &str;

    /// False once the owning channel is gone or terminated
    fn valid(&self) -> bool;

    /// Push one buffer toward the network. On the fax path the timestamp
    /// argument is a UDPTL sequence number.
    async fn consume(&self, payload: Bytes, timestamp: u32, marker: bool);
}

/// Data source: forwards received network payload into the pipeline.
///
/// The owning channel holds it in the source-swap slot; the packet pump
/// borrows it under that lock, marks it busy, forwards outside the lock and
/// clears busy. Detachment waits on the busy flag before releasing the
/// last reference it controls.
pub struct ChannelSource {
    format: String,
    valid: Arc<AtomicBool>,
    busy: BusyFlag,
    sink: Mutex<Option<Arc<dyn MediaSink>>>,
}

impl ChannelSource {
    pub(crate) fn new(format: String, valid: Arc<AtomicBool>) -> Self {
        Self { format, valid, busy: BusyFlag::new(), sink: Mutex::new(None) }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// False once the owning channel is gone or terminated
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The busy flag used for the detach handshake
    pub(crate) fn busy(&self) -> &BusyFlag {
        &self.busy
    }

    /// Plug the engine pipeline in
    pub fn attach_sink(&self, sink: Arc<dyn MediaSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Unplug the engine pipeline
    pub fn detach_sink(&self) {
        *self.sink.lock().unwrap() = None;
    }

    /// Forward one payload into the pipeline. Caller must hold the busy
    /// flag (see [`RtpChannel`] forwarding).
    pub(crate) fn deliver(&self, payload: Bytes, timestamp: u32, flags: DataFlags) {
        if !self.valid() {
            return;
        }
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.deliver(payload, timestamp, flags);
        }
    }
}

/// Data consumer: sends pipeline payload to the network.
///
/// For splitable (fixed sample size) formats, oversized buffers whose
/// length is an exact multiple of the preferred chunk are fragmented, the
/// timestamp advancing by each fragment's length. Anything else goes out
/// as one buffer-sized send.
pub struct ChannelConsumer {
    format: String,
    splitable: bool,
    chunk: usize,
    valid: Arc<AtomicBool>,
    channel: Weak<RtpChannel>,
}

impl ChannelConsumer {
    pub(crate) fn new(format: String, valid: Arc<AtomicBool>, channel: Weak<RtpChannel>) -> Self {
        let splitable = payload::is_splitable(&format);
        let chunk = payload::preferred_chunk(&format);
        Self { format, splitable, chunk, valid, channel }
    }

    pub fn is_splitable(&self) -> bool {
        self.splitable
    }
}

#[async_trait]
impl MediaFeed for ChannelConsumer {
    fn format(&self) -> &str {
        &self.format
    }

    fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && self.channel.strong_count() > 0
    }

    async fn consume(&self, payload: Bytes, timestamp: u32, marker: bool) {
        if !self.valid() {
            return;
        }
        let channel = match self.channel.upgrade() {
            Some(ch) => ch,
            None => return,
        };

        if self.splitable
            && self.chunk > 0
            && payload.len() > self.chunk
            && payload.len() % self.chunk == 0
        {
            let mut offset = 0;
            let mut ts = timestamp;
            let mut first = true;
            while offset < payload.len() {
                let fragment = payload.slice(offset..offset + self.chunk);
                if let Err(e) = channel.send_media(fragment, ts, marker && first).await {
                    debug!("Fragment send failed on {}: {}", channel.id(), e);
                    return;
                }
                offset += self.chunk;
                ts = ts.wrapping_add(self.chunk as u32);
                first = false;
            }
        } else if let Err(e) = channel.send_media(payload, timestamp, marker).await {
            debug!("Send failed on {}: {}", channel.id(), e);
        }
    }
}
