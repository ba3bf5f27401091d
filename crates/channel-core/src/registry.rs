//! Process-scoped registries of live channels and reflectors
//!
//! Constructed once by the relay service and drained at shutdown. Lookups
//! hand out fresh references under the registry mutex; insertion and
//! removal happen under the same mutex, so a half-constructed entry is
//! never observable and a lookup racing a teardown simply misses.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::reflector::RtpReflector;
use crate::wrapper::RtpChannel;

/// Registry of live media channels
pub struct ChannelRegistry {
    channels: Mutex<Vec<Arc<RtpChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { channels: Mutex::new(Vec::new()) }
    }

    /// Insert a channel. At most one live channel may exist per
    /// (endpoint, media) pair: when one already exists it is returned
    /// instead and the candidate is not inserted.
    pub fn insert(&self, channel: Arc<RtpChannel>) -> Arc<RtpChannel> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(existing) = channels
            .iter()
            .find(|c| c.endpoint() == channel.endpoint() && c.media() == channel.media())
        {
            return existing.clone();
        }
        channels.push(channel.clone());
        channel
    }

    /// Find by wrapper id
    pub fn find_by_id(&self, id: &str) -> Option<Arc<RtpChannel>> {
        self.channels.lock().unwrap().iter().find(|c| c.id() == id).cloned()
    }

    /// Find by (call endpoint, media) pair
    pub fn find_by_endpoint(&self, endpoint: &str, media: &str) -> Option<Arc<RtpChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.endpoint() == endpoint && c.media() == media)
            .cloned()
    }

    /// Remove by wrapper id, returning the removed channel
    pub fn remove(&self, id: &str) -> Option<Arc<RtpChannel>> {
        let mut channels = self.channels.lock().unwrap();
        let index = channels.iter().position(|c| c.id() == id)?;
        debug!("Unregistering channel {}", id);
        Some(channels.swap_remove(index))
    }

    /// Take every registered channel, for shutdown draining
    pub fn drain(&self) -> Vec<Arc<RtpChannel>> {
        std::mem::take(&mut *self.channels.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

/// Registry of live reflectors
pub struct ReflectorRegistry {
    reflectors: Mutex<Vec<Arc<RtpReflector>>>,
}

impl ReflectorRegistry {
    pub fn new() -> Self {
        Self { reflectors: Mutex::new(Vec::new()) }
    }

    pub fn insert(&self, reflector: Arc<RtpReflector>) {
        self.reflectors.lock().unwrap().push(reflector);
    }

    /// Find by either leg id
    pub fn find_by_leg(&self, leg_id: &str) -> Option<Arc<RtpReflector>> {
        self.reflectors.lock().unwrap().iter().find(|r| r.has_leg(leg_id)).cloned()
    }

    /// Find by the leg-A id only
    pub fn find_by_leg_a(&self, leg_id: &str) -> Option<Arc<RtpReflector>> {
        self.reflectors.lock().unwrap().iter().find(|r| r.leg_a() == leg_id).cloned()
    }

    pub fn remove(&self, leg_a: &str) -> Option<Arc<RtpReflector>> {
        let mut reflectors = self.reflectors.lock().unwrap();
        let index = reflectors.iter().position(|r| r.leg_a() == leg_a)?;
        debug!("Unregistering reflector for {}", leg_a);
        Some(reflectors.swap_remove(index))
    }

    pub fn drain(&self) -> Vec<Arc<RtpReflector>> {
        std::mem::take(&mut *self.reflectors.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.reflectors.lock().unwrap().len()
    }
}
