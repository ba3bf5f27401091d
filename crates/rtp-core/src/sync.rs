//! Small synchronization primitives shared by the session and adapter layers
//!
//! `OnceLatch` makes the various "exactly once" contracts (fax tone detected,
//! timeout notified, SSRC resync requested) explicit state transitions instead
//! of bare booleans. `BusyFlag` is the lock-free handshake that orders a data
//! source's destruction after any in-flight forward call.

use std::sync::atomic::{AtomicBool, Ordering};

/// A re-armable one-shot latch.
///
/// `fire()` succeeds exactly once per arming; `rearm()` makes the next
/// `fire()` succeed again. All transitions are atomic.
#[derive(Debug)]
pub struct OnceLatch {
    armed: AtomicBool,
}

impl OnceLatch {
    /// Create a latch that is ready to fire.
    pub const fn armed() -> Self {
        Self { armed: AtomicBool::new(true) }
    }

    /// Create a latch that will not fire until re-armed.
    pub const fn disarmed() -> Self {
        Self { armed: AtomicBool::new(false) }
    }

    /// Attempt the transition. Returns `true` for exactly one caller per arming.
    pub fn fire(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Make the next `fire()` succeed again.
    pub fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Whether the latch would currently fire.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Busy-flag handshake between a packet pump and a destructor.
///
/// The pump sets the flag before forwarding data and clears it afterwards;
/// a teardown path that has already unlinked the object spins with
/// cooperative yielding until the flag clears, guaranteeing no forward call
/// is in flight when the object is released.
#[derive(Debug)]
pub struct BusyFlag {
    busy: AtomicBool,
}

impl BusyFlag {
    pub const fn new() -> Self {
        Self { busy: AtomicBool::new(false) }
    }

    /// Mark a forward call as in flight.
    pub fn begin(&self) {
        self.busy.store(true, Ordering::Release);
    }

    /// Mark the in-flight forward call as finished.
    pub fn end(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Spin-yield until no forward call is in flight.
    ///
    /// Callers must have unlinked the object first so no new forward can
    /// begin; otherwise this may never return.
    pub fn wait_idle(&self) {
        while self.is_busy() {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latch_fires_once() {
        let latch = OnceLatch::armed();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(!latch.fire());
    }

    #[test]
    fn test_latch_rearm() {
        let latch = OnceLatch::disarmed();
        assert!(!latch.fire());
        latch.rearm();
        assert!(latch.fire());
        assert!(!latch.fire());
    }

    #[test]
    fn test_latch_fires_once_concurrently() {
        let latch = Arc::new(OnceLatch::armed());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            handles.push(std::thread::spawn(move || latch.fire() as u32));
        }
        let fired: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_busy_flag_handshake() {
        let flag = Arc::new(BusyFlag::new());
        flag.begin();

        let waiter = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                flag.wait_idle();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        flag.end();
        waiter.join().unwrap();
        assert!(!flag.is_busy());
    }
}
