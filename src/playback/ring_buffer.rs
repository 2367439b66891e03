//! Absolute-indexed circular sample store
//!
//! Unlike a cursor-based ring, store and fetch address frames by an absolute,
//! monotonically increasing position on the global playback timeline; the
//! buffer wraps internally by modulo capacity. Multiple tracks share one
//! timeline this way, which is what makes transitions gapless.
//!
//! Construction splits the buffer into a [`RingWriter`] and a [`RingReader`],
//! so single-producer/single-consumer is enforced by ownership rather than
//! convention. Neither half takes a lock; `fetch` performs no allocation and
//! is safe on a real-time thread.
//!
//! Memory safety of the concurrent halves rests on the flow-control
//! invariant: the writer only stores frames the reader has consumed past
//! (checked against `consumed_through`), and the reader only fetches frames
//! the writer has published (checked against `written_through`).

use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct RingInner {
    /// Interleaved f32 samples, `capacity_frames * channels` long
    storage: UnsafeCell<Box<[f32]>>,
    /// Frame capacity, always a power of two
    capacity_frames: usize,
    channels: usize,
    /// Absolute frame position up to which data has been written.
    /// SeqCst: published writes must be visible to the reader before the
    /// position advance is.
    written_through: AtomicU64,
    /// Absolute frame position up to which the reader has consumed
    consumed_through: AtomicU64,
}

// Concurrent access to `storage` is disjoint: the writer touches only frames
// past `consumed_through`, the reader only frames before `written_through`,
// and the two ranges cannot overlap within one capacity window.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

impl RingInner {
    /// Copy `samples` into the ring at the given absolute frame, wrapping.
    ///
    /// Caller must have validated the range against `consumed_through`.
    fn write_samples(&self, samples: &[f32], abs_frame: u64) {
        let cap_samples = self.capacity_frames * self.channels;
        let start = (abs_frame as usize & (self.capacity_frames - 1)) * self.channels;
        let base = unsafe { (*self.storage.get()).as_mut_ptr() };

        let first = samples.len().min(cap_samples - start);
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), base.add(start), first);
            if first < samples.len() {
                std::ptr::copy_nonoverlapping(
                    samples.as_ptr().add(first),
                    base,
                    samples.len() - first,
                );
            }
        }
    }

    /// Copy samples out of the ring starting at the given absolute frame.
    fn read_samples(&self, dest: &mut [f32], abs_frame: u64) {
        let cap_samples = self.capacity_frames * self.channels;
        let start = (abs_frame as usize & (self.capacity_frames - 1)) * self.channels;
        let base = unsafe { (*self.storage.get()).as_ptr() };

        let first = dest.len().min(cap_samples - start);
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(start), dest.as_mut_ptr(), first);
            if first < dest.len() {
                std::ptr::copy_nonoverlapping(base, dest.as_mut_ptr().add(first), dest.len() - first);
            }
        }
    }
}

/// Producer half, held by the decode worker
pub struct RingWriter {
    inner: Arc<RingInner>,
}

/// Consumer half, owned by the render pipeline
pub struct RingReader {
    inner: Arc<RingInner>,
}

/// Allocate a ring and split it into its producer and consumer halves.
///
/// `capacity_frames` is rounded up to the next power of two.
pub fn with_capacity(format: AudioFormat, capacity_frames: usize) -> (RingWriter, RingReader) {
    let capacity_frames = capacity_frames.max(2).next_power_of_two();
    let channels = format.channels as usize;
    let inner = Arc::new(RingInner {
        storage: UnsafeCell::new(vec![0.0; capacity_frames * channels].into_boxed_slice()),
        capacity_frames,
        channels,
        written_through: AtomicU64::new(0),
        consumed_through: AtomicU64::new(0),
    });
    (
        RingWriter {
            inner: Arc::clone(&inner),
        },
        RingReader { inner },
    )
}

impl RingWriter {
    pub fn capacity_frames(&self) -> usize {
        self.inner.capacity_frames
    }

    pub fn channels(&self) -> usize {
        self.inner.channels
    }

    /// Write `frames` frames of interleaved samples at an absolute position.
    ///
    /// Fails with [`Error::CapacityExceeded`] if the store would overwrite
    /// frames the reader has not consumed. Flow control belongs to the
    /// caller; this check catches logic errors rather than providing
    /// backpressure.
    pub fn store(&mut self, samples: &[f32], frames: usize, abs_start_frame: u64) -> Result<()> {
        debug_assert_eq!(samples.len(), frames * self.inner.channels);
        if frames == 0 {
            return Ok(());
        }
        if frames > self.inner.capacity_frames {
            return Err(Error::CapacityExceeded {
                start_frame: abs_start_frame,
                frames,
                read_position: self.inner.consumed_through.load(Ordering::SeqCst),
            });
        }

        let consumed = self.inner.consumed_through.load(Ordering::SeqCst);
        let end = abs_start_frame + frames as u64;
        if end > consumed + self.inner.capacity_frames as u64 {
            return Err(Error::CapacityExceeded {
                start_frame: abs_start_frame,
                frames,
                read_position: consumed,
            });
        }

        self.inner.write_samples(samples, abs_start_frame);
        self.inner.written_through.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }
}

impl RingReader {
    pub fn capacity_frames(&self) -> usize {
        self.inner.capacity_frames
    }

    pub fn channels(&self) -> usize {
        self.inner.channels
    }

    /// Absolute frame position up to which data has been written
    pub fn written_through(&self) -> u64 {
        self.inner.written_through.load(Ordering::SeqCst)
    }

    /// Read up to `frames` frames starting at an absolute position.
    ///
    /// With `allow_partial`, copies whatever prefix of the range has been
    /// written and returns the frame count (possibly zero). Without it, a
    /// range extending past the written position fails with
    /// [`Error::DataUnavailable`]. Never blocks, never allocates.
    pub fn fetch(
        &mut self,
        dest: &mut [f32],
        frames: usize,
        abs_start_frame: u64,
        allow_partial: bool,
    ) -> Result<usize> {
        debug_assert!(dest.len() >= frames * self.inner.channels);
        if frames == 0 {
            return Ok(0);
        }

        let written = self.inner.written_through.load(Ordering::SeqCst);
        let end = abs_start_frame + frames as u64;
        let to_read = if end <= written {
            frames
        } else if allow_partial {
            written.saturating_sub(abs_start_frame).min(frames as u64) as usize
        } else {
            return Err(Error::DataUnavailable {
                start_frame: abs_start_frame,
                frames,
                write_position: written,
            });
        };

        if to_read > 0 {
            self.inner.read_samples(
                &mut dest[..to_read * self.inner.channels],
                abs_start_frame,
            );
            self.inner
                .consumed_through
                .fetch_max(abs_start_frame + to_read as u64, Ordering::SeqCst);
        }
        Ok(to_read)
    }
}
