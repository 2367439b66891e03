//! Pending track queue
//!
//! Ordered, mutex-guarded list of tracks awaiting activation by the decode
//! worker. Normal enqueue appends; play-now requests push to the front. The
//! mutex guards all mutation and size queries; it is never taken on the
//! render path.

use crate::playback::events::Track;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Default)]
pub struct DecoderQueue {
    inner: Mutex<VecDeque<Track>>,
}

impl DecoderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track for playback after everything already queued
    pub fn push_back(&self, track: Track) {
        let mut q = self.inner.lock();
        q.push_back(track);
        debug!("Enqueued track, queue depth {}", q.len());
    }

    /// Push a track ahead of everything queued (play-now)
    pub fn push_front(&self, track: Track) {
        let mut q = self.inner.lock();
        q.push_front(track);
        debug!("Front-queued track, queue depth {}", q.len());
    }

    /// Claim the next track to decode
    pub fn pop_front(&self) -> Option<Track> {
        self.inner.lock().pop_front()
    }

    /// Drain and drop all pending tracks, returning how many were discarded.
    /// A no-op on an empty queue.
    pub fn clear(&self) -> usize {
        let mut q = self.inner.lock();
        let n = q.len();
        q.clear();
        if n > 0 {
            debug!("Cleared {} queued track(s)", n);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::AudioFormat;
    use crate::error::Result;
    use crate::playback::events::Track;

    struct StubDecoder {
        total: u64,
    }

    impl crate::audio::decoder::Decoder for StubDecoder {
        fn format(&self) -> AudioFormat {
            AudioFormat::new(44100, 2)
        }
        fn supports_seeking(&self) -> bool {
            false
        }
        fn read_audio(&mut self, _out: &mut [f32], _max_frames: usize) -> Result<usize> {
            Ok(0)
        }
        fn seek_to_frame(&mut self, _frame: u64) -> Result<u64> {
            Err(crate::error::Error::SeekUnsupported)
        }
        fn current_frame(&self) -> u64 {
            0
        }
        fn total_frames(&self) -> Option<u64> {
            Some(self.total)
        }
    }

    fn track(total: u64) -> Track {
        Track::new(Box::new(StubDecoder { total }))
    }

    #[test]
    fn test_fifo_order() {
        let q = DecoderQueue::new();
        q.push_back(track(1));
        q.push_back(track(2));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_front().unwrap().decoder.total_frames(), Some(1));
        assert_eq!(q.pop_front().unwrap().decoder.total_frames(), Some(2));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_push_front_preempts() {
        let q = DecoderQueue::new();
        q.push_back(track(1));
        q.push_front(track(2));
        assert_eq!(q.pop_front().unwrap().decoder.total_frames(), Some(2));
        assert_eq!(q.pop_front().unwrap().decoder.total_frames(), Some(1));
    }

    #[test]
    fn test_clear_on_empty_is_noop() {
        let q = DecoderQueue::new();
        assert_eq!(q.clear(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_clear_drops_pending() {
        let q = DecoderQueue::new();
        q.push_back(track(1));
        q.push_back(track(2));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
