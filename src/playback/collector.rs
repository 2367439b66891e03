//! Decoder state reclamation
//!
//! Destruction of a DecoderState can block (decoder teardown closes files),
//! so it must never happen on the render thread. The accounting pass only
//! marks states collectible and wakes this thread; the actual swap-to-empty
//! and drop happen here.

use crate::playback::engine::EngineShared;
use crate::playback::signal::WAIT_TIMEOUT;
use std::sync::Arc;
use tracing::debug;

/// Collector thread entry point
pub(crate) fn run(shared: Arc<EngineShared>) {
    debug!("Collector started");
    while !shared.is_shutting_down() {
        shared.collector_signal.wait_timeout(WAIT_TIMEOUT);
        let collected = shared.active.collect();
        if collected > 0 {
            debug!("Collected {} decoder state(s)", collected);
        }
    }
    // Final sweep so engine teardown frees everything
    let remaining = shared.active.clear_all();
    if remaining > 0 {
        debug!("Collected {} decoder state(s) at shutdown", remaining);
    }
    debug!("Collector stopped");
}
