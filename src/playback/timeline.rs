//! Global playback timeline
//!
//! Three counters stitch per-track positions into one continuous frame
//! timeline over the shared ring buffer: `frames_decoded` and
//! `frames_rendered` (absolute positions of the write and read edges) and
//! `next_starting_timestamp` (where the next activated track begins).
//!
//! All updates use SeqCst read-modify-write operations; the counters are read
//! from the decode worker, the render thread, and control threads, and the
//! flow-control invariant `frames_rendered <= frames_decoded` depends on
//! cross-thread visibility.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Timeline {
    /// Absolute frame position of the write edge
    frames_decoded: AtomicU64,
    /// Absolute frame position of the read edge
    frames_rendered: AtomicU64,
    /// Starting timestamp the next activated track will be assigned
    next_starting_timestamp: AtomicU64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::SeqCst)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::SeqCst)
    }

    pub fn next_starting_timestamp(&self) -> u64 {
        self.next_starting_timestamp.load(Ordering::SeqCst)
    }

    /// Frames decoded but not yet rendered
    pub fn frames_available_to_read(&self) -> u64 {
        self.frames_decoded()
            .saturating_sub(self.frames_rendered())
    }

    /// Free space in a ring of `capacity_frames`
    pub fn frames_available_to_write(&self, capacity_frames: usize) -> u64 {
        (capacity_frames as u64).saturating_sub(self.frames_available_to_read())
    }

    pub fn add_decoded(&self, frames: u64) {
        self.frames_decoded.fetch_add(frames, Ordering::SeqCst);
    }

    pub fn add_rendered(&self, frames: u64) {
        self.frames_rendered.fetch_add(frames, Ordering::SeqCst);
    }

    /// Reserve timeline space for a finished track of `track_frames` length
    pub fn advance_next_starting_timestamp(&self, track_frames: u64) {
        self.next_starting_timestamp
            .fetch_add(track_frames, Ordering::SeqCst);
    }

    /// Apply a seek's position jump: move the write edge by the signed frame
    /// delta and snap the read edge to it, so the skipped-over range counts
    /// as instantaneously rendered. Returns the new absolute position.
    pub fn apply_seek(&self, delta_frames: i64) -> u64 {
        let new_decoded = if delta_frames >= 0 {
            self.frames_decoded
                .fetch_add(delta_frames as u64, Ordering::SeqCst)
                + delta_frames as u64
        } else {
            let back = delta_frames.unsigned_abs();
            self.frames_decoded.fetch_sub(back, Ordering::SeqCst) - back
        };
        self.frames_rendered.store(new_decoded, Ordering::SeqCst);
        new_decoded
    }

    /// Zero all counters. Only valid while the render path is stopped.
    pub fn reset(&self) {
        self.frames_decoded.store(0, Ordering::SeqCst);
        self.frames_rendered.store(0, Ordering::SeqCst);
        self.next_starting_timestamp.store(0, Ordering::SeqCst);
    }
}
