//! Coalescing wake signal
//!
//! A binary signal the decode worker and collector block on with a bounded
//! timeout. Multiple notifications coalesce into one pending wake; they never
//! queue. The notify side takes no lock, so it is callable from the real-time
//! render thread.
//!
//! A notification racing a waiter between its flag re-check and the condvar
//! wait can be missed; the timed wait bounds that miss, which is why every
//! loop built on this signal must tolerate spurious timeout wakeups and
//! re-derive its condition.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Bounded wait used by the decode worker and the collector. Re-checking
/// state this often caps the worst-case latency of reacting to freed buffer
/// space, a stop request, or a missed wake.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a wake. Non-blocking; coalesces with any already-pending wake.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.condvar.notify_one();
    }

    /// Wait until notified or the timeout elapses.
    ///
    /// Returns true if a notification was consumed, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::SeqCst) {
            return true;
        }
        let mut guard = self.mutex.lock();
        if self.pending.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.pending.swap(false, Ordering::SeqCst)
    }
}
