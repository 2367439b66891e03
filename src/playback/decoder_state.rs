//! Per-track playback state and the active decoder table
//!
//! A [`DecoderState`] exists from the moment the decode worker claims a track
//! until the collector reclaims it, spanning three threads: the worker
//! decodes through it, the render thread's accounting pass advances its
//! counters, and the collector destroys it. Counters are plain atomics; the
//! owned decoder sits behind a mutex only the worker touches while the state
//! is alive.
//!
//! The [`ActiveDecoderTable`] is a fixed set of atomically-swappable slots.
//! Claim and release are compare-and-swap against empty, so the worker and
//! collector never race on a slot, and the accounting path reads snapshots
//! without taking any lock.

use crate::audio::decoder::Decoder;
use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use crate::playback::events::{Track, TrackEvents};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Maximum simultaneously active (decoding or draining) tracks. Draining
/// tracks linger only as long as their tail remains in the ring buffer, so
/// this bound is generous.
pub const ACTIVE_DECODER_SLOTS: usize = 8;

/// Sentinel: track length not yet known
const TOTAL_FRAMES_UNKNOWN: u64 = u64::MAX;

/// Sentinel: no seek requested
const NO_PENDING_SEEK: u64 = u64::MAX;

/// Where a track is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackStatus {
    /// The worker is still producing frames for this track
    Decoding = 0,
    /// End of decode reached; unrendered frames remain in the ring
    Draining = 1,
    /// No further reads of this track's data will occur; safe to free
    Collectible = 2,
}

impl TrackStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TrackStatus::Decoding,
            1 => TrackStatus::Draining,
            _ => TrackStatus::Collectible,
        }
    }
}

/// Bookkeeping for one active track.
pub struct DecoderState {
    /// Owned decoder. Locked only by the decode worker while the state is
    /// active; freed with the state on the collector thread.
    decoder: Mutex<Box<dyn Decoder>>,
    events: Arc<dyn TrackEvents>,
    format: AudioFormat,
    seekable: bool,
    /// This track's first frame's position on the global timeline. Assigned
    /// once at activation.
    starting_timestamp: u64,
    /// Track length in frames. Starts from the container's estimate if it
    /// has one; authoritative only once finalized at end of stream.
    total_frames: AtomicU64,
    /// Frames of this track rendered so far, track-relative
    frames_rendered: AtomicU64,
    /// Requested seek target; last write wins
    pending_seek: AtomicU64,
    status: AtomicU8,
    stop_requested: AtomicBool,
}

impl DecoderState {
    pub fn new(track: Track, starting_timestamp: u64) -> Self {
        let format = track.decoder.format();
        let seekable = track.decoder.supports_seeking();
        let total = track.decoder.total_frames().unwrap_or(TOTAL_FRAMES_UNKNOWN);
        Self {
            decoder: Mutex::new(track.decoder),
            events: track.events,
            format,
            seekable,
            starting_timestamp,
            total_frames: AtomicU64::new(total),
            frames_rendered: AtomicU64::new(0),
            pending_seek: AtomicU64::new(NO_PENDING_SEEK),
            status: AtomicU8::new(TrackStatus::Decoding as u8),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn supports_seeking(&self) -> bool {
        self.seekable
    }

    pub fn starting_timestamp(&self) -> u64 {
        self.starting_timestamp
    }

    pub fn events(&self) -> &dyn TrackEvents {
        &*self.events
    }

    /// Lock the owned decoder. Worker-only while active.
    pub fn decoder(&self) -> parking_lot::MutexGuard<'_, Box<dyn Decoder>> {
        self.decoder.lock()
    }

    pub fn status(&self) -> TrackStatus {
        TrackStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_collectible(&self) -> bool {
        self.status() == TrackStatus::Collectible
    }

    pub fn set_draining(&self) {
        self.status
            .store(TrackStatus::Draining as u8, Ordering::SeqCst);
        // The worker no longer services this track, so an unapplied seek
        // would otherwise shadow the real position forever
        self.pending_seek.store(NO_PENDING_SEEK, Ordering::SeqCst);
    }

    pub fn mark_collectible(&self) {
        self.status
            .store(TrackStatus::Collectible as u8, Ordering::SeqCst);
        self.pending_seek.store(NO_PENDING_SEEK, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Track length if known (estimated before EOS, exact after)
    pub fn total_frames(&self) -> Option<u64> {
        match self.total_frames.load(Ordering::SeqCst) {
            TOTAL_FRAMES_UNKNOWN => None,
            n => Some(n),
        }
    }

    /// Record the authoritative track length at end of stream
    pub fn finalize_total_frames(&self, frames: u64) {
        self.total_frames.store(frames, Ordering::SeqCst);
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::SeqCst)
    }

    /// Attribute rendered frames; returns the new rendered count
    pub fn add_frames_rendered(&self, frames: u64) -> u64 {
        self.frames_rendered.fetch_add(frames, Ordering::SeqCst) + frames
    }

    /// Snap the rendered counter after a seek jump
    pub fn set_frames_rendered(&self, frames: u64) {
        self.frames_rendered.store(frames, Ordering::SeqCst);
    }

    /// Frames still to attribute to this track. Unbounded while the track is
    /// still decoding: until end of stream, every rendered frame on the
    /// timeline past earlier tracks belongs to it.
    pub fn frames_remaining(&self) -> u64 {
        match self.status() {
            TrackStatus::Decoding => u64::MAX,
            _ => self
                .total_frames
                .load(Ordering::SeqCst)
                .saturating_sub(self.frames_rendered()),
        }
    }

    /// Publish a seek request; the worker applies it asynchronously.
    /// Concurrent requests: last write wins, no queueing. Ignored once the
    /// track has left Decoding, since no one would ever apply it.
    pub fn request_seek(&self, target_frame: u64) {
        if self.status() == TrackStatus::Decoding {
            self.pending_seek.store(target_frame, Ordering::SeqCst);
        }
    }

    /// Consume the pending seek request, if any
    pub fn take_pending_seek(&self) -> Option<u64> {
        match self.pending_seek.swap(NO_PENDING_SEEK, Ordering::SeqCst) {
            NO_PENDING_SEEK => None,
            target => Some(target),
        }
    }

    /// Peek the pending seek request without consuming it
    pub fn pending_seek(&self) -> Option<u64> {
        match self.pending_seek.load(Ordering::SeqCst) {
            NO_PENDING_SEEK => None,
            target => Some(target),
        }
    }
}

/// Fixed-size table of the currently active tracks.
#[derive(Default)]
pub struct ActiveDecoderTable {
    slots: [ArcSwapOption<DecoderState>; ACTIVE_DECODER_SLOTS],
}

impl ActiveDecoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free slot for a newly activated state.
    ///
    /// Fails when every slot is occupied, which means tracks are finishing
    /// faster than the collector can reclaim them.
    pub fn claim(&self, state: Arc<DecoderState>) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let empty = slot.load();
            if empty.is_none() {
                let prev = slot.compare_and_swap(&empty, Some(Arc::clone(&state)));
                if prev.is_none() {
                    return Ok(i);
                }
            }
        }
        Err(Error::InvalidState(
            "no free active decoder slot".to_string(),
        ))
    }

    /// The earliest non-collectible state on the timeline: the track whose
    /// audio is at (or nearest to) the playback position now.
    pub fn current(&self) -> Option<Arc<DecoderState>> {
        let mut best: Option<Arc<DecoderState>> = None;
        for slot in &self.slots {
            let guard = slot.load();
            if let Some(state) = &*guard {
                if state.is_collectible() {
                    continue;
                }
                match &best {
                    Some(b) if b.starting_timestamp() <= state.starting_timestamp() => {}
                    _ => best = Some(Arc::clone(state)),
                }
            }
        }
        best
    }

    /// Snapshot all non-collectible states into `out`, sorted by ascending
    /// starting timestamp. Returns the count. No heap allocation; safe on
    /// the render-adjacent accounting path.
    pub fn snapshot_ordered(
        &self,
        out: &mut [Option<Arc<DecoderState>>; ACTIVE_DECODER_SLOTS],
    ) -> usize {
        let mut n = 0;
        for slot in &self.slots {
            let guard = slot.load();
            if let Some(state) = &*guard {
                if state.is_collectible() {
                    continue;
                }
                // Insertion sort; the table is tiny
                let mut i = n;
                while i > 0 {
                    let prev = out[i - 1].as_ref().map(|s| s.starting_timestamp());
                    if prev.is_some_and(|ts| ts > state.starting_timestamp()) {
                        out[i] = out[i - 1].take();
                        i -= 1;
                    } else {
                        break;
                    }
                }
                out[i] = Some(Arc::clone(state));
                n += 1;
            }
        }
        n
    }

    /// Request every active state to stop and become collectible
    pub fn stop_all(&self) {
        for slot in &self.slots {
            let guard = slot.load();
            if let Some(state) = &*guard {
                state.request_stop();
                state.mark_collectible();
            }
        }
    }

    /// Swap collectible slots to empty and drop their states.
    /// Returns how many were reclaimed. Collector-thread only; the drop may
    /// block on decoder teardown.
    pub fn collect(&self) -> usize {
        let mut collected = 0;
        for slot in &self.slots {
            let cur = slot.load();
            let Some(state) = &*cur else { continue };
            if !state.is_collectible() {
                continue;
            }
            let prev = slot.compare_and_swap(&cur, None);
            let swapped = match (&*prev, &*cur) {
                (Some(p), Some(c)) => Arc::ptr_eq(p, c),
                _ => false,
            };
            if swapped {
                collected += 1;
            }
        }
        collected
    }

    /// Unconditionally empty every slot. Engine teardown only.
    pub fn clear_all(&self) -> usize {
        let mut cleared = 0;
        for slot in &self.slots {
            if slot.swap(None).is_some() {
                cleared += 1;
            }
        }
        cleared
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.load().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    struct StubDecoder {
        total: Option<u64>,
        seekable: bool,
    }

    impl Decoder for StubDecoder {
        fn format(&self) -> AudioFormat {
            AudioFormat::new(44100, 2)
        }
        fn supports_seeking(&self) -> bool {
            self.seekable
        }
        fn read_audio(&mut self, _out: &mut [f32], _max_frames: usize) -> Result<usize> {
            Ok(0)
        }
        fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
            Ok(frame)
        }
        fn current_frame(&self) -> u64 {
            0
        }
        fn total_frames(&self) -> Option<u64> {
            self.total
        }
    }

    fn state(starting_timestamp: u64, total: Option<u64>) -> Arc<DecoderState> {
        let track = Track::new(Box::new(StubDecoder {
            total,
            seekable: true,
        }));
        Arc::new(DecoderState::new(track, starting_timestamp))
    }

    #[test]
    fn test_new_state_defaults() {
        let s = state(100, Some(44100));
        assert_eq!(s.starting_timestamp(), 100);
        assert_eq!(s.status(), TrackStatus::Decoding);
        assert_eq!(s.frames_rendered(), 0);
        assert_eq!(s.total_frames(), Some(44100));
        assert!(s.pending_seek().is_none());
        assert!(!s.stop_requested());
    }

    #[test]
    fn test_unknown_total_until_finalized() {
        let s = state(0, None);
        assert_eq!(s.total_frames(), None);
        s.finalize_total_frames(12345);
        assert_eq!(s.total_frames(), Some(12345));
    }

    #[test]
    fn test_frames_remaining_unbounded_while_decoding() {
        let s = state(0, Some(1000));
        assert_eq!(s.frames_remaining(), u64::MAX);
        s.set_draining();
        s.add_frames_rendered(400);
        assert_eq!(s.frames_remaining(), 600);
    }

    #[test]
    fn test_seek_last_write_wins() {
        let s = state(0, Some(1000));
        s.request_seek(100);
        s.request_seek(200);
        assert_eq!(s.take_pending_seek(), Some(200));
        assert_eq!(s.take_pending_seek(), None);
    }

    #[test]
    fn test_pending_seek_cleared_when_leaving_decoding() {
        let s = state(0, Some(1000));
        s.request_seek(500);
        s.set_draining();
        assert!(s.pending_seek().is_none());
        assert!(s.take_pending_seek().is_none());

        let s = state(0, Some(1000));
        s.request_seek(500);
        s.mark_collectible();
        assert!(s.pending_seek().is_none());

        // Requests arriving after the transition are ignored outright
        let s = state(0, Some(1000));
        s.set_draining();
        s.request_seek(500);
        assert!(s.pending_seek().is_none());
    }

    #[test]
    fn test_table_claim_and_collect() {
        let table = ActiveDecoderTable::new();
        let s = state(0, Some(100));
        table.claim(Arc::clone(&s)).unwrap();
        assert_eq!(table.occupied(), 1);

        // Not collectible yet
        assert_eq!(table.collect(), 0);
        s.mark_collectible();
        assert_eq!(table.collect(), 1);
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_table_full() {
        let table = ActiveDecoderTable::new();
        for i in 0..ACTIVE_DECODER_SLOTS {
            table.claim(state(i as u64, None)).unwrap();
        }
        assert!(table.claim(state(99, None)).is_err());
    }

    #[test]
    fn test_current_is_earliest_non_collectible() {
        let table = ActiveDecoderTable::new();
        let a = state(0, Some(100));
        let b = state(100, Some(100));
        table.claim(Arc::clone(&a)).unwrap();
        table.claim(Arc::clone(&b)).unwrap();

        assert_eq!(table.current().unwrap().starting_timestamp(), 0);
        a.mark_collectible();
        assert_eq!(table.current().unwrap().starting_timestamp(), 100);
        b.mark_collectible();
        assert!(table.current().is_none());
    }

    #[test]
    fn test_snapshot_ordered() {
        let table = ActiveDecoderTable::new();
        // Claim out of timestamp order
        table.claim(state(200, None)).unwrap();
        table.claim(state(0, None)).unwrap();
        table.claim(state(100, None)).unwrap();

        let mut out: [Option<Arc<DecoderState>>; ACTIVE_DECODER_SLOTS] = Default::default();
        let n = table.snapshot_ordered(&mut out);
        assert_eq!(n, 3);
        let ts: Vec<u64> = out[..n]
            .iter()
            .map(|s| s.as_ref().unwrap().starting_timestamp())
            .collect();
        assert_eq!(ts, vec![0, 100, 200]);
    }

    #[test]
    fn test_stop_all() {
        let table = ActiveDecoderTable::new();
        let a = state(0, None);
        let b = state(100, None);
        table.claim(Arc::clone(&a)).unwrap();
        table.claim(Arc::clone(&b)).unwrap();

        table.stop_all();
        assert!(a.stop_requested() && a.is_collectible());
        assert!(b.stop_requested() && b.is_collectible());
        assert_eq!(table.collect(), 2);
    }
}
