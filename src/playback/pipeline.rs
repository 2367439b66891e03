//! Real-time render path
//!
//! [`RenderPipeline`] is handed to the output sink and lives on the sink's
//! callback thread. [`RenderPipeline::render`] fills the device buffer from
//! the ring; [`RenderPipeline::after_render`] attributes the consumed frames
//! to their tracks. Neither takes a lock, allocates, nor performs I/O; a
//! violation here is an audible dropout.
//!
//! The pipeline owns the ring's consumer half outright, so no second fetch
//! cursor can exist anywhere in the program.

use crate::playback::decoder_state::{DecoderState, ACTIVE_DECODER_SLOTS};
use crate::playback::engine::EngineShared;
use crate::playback::ring_buffer::RingReader;
use crate::playback::WRITE_CHUNK_FRAMES;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

/// Log at most one underrun warning per this many occurrences
const UNDERRUN_WARN_INTERVAL: u64 = 1000;

pub struct RenderPipeline {
    reader: RingReader,
    shared: Arc<EngineShared>,
    underruns: u64,
}

impl RenderPipeline {
    pub(crate) fn new(reader: RingReader, shared: Arc<EngineShared>) -> Self {
        Self {
            reader,
            shared,
            underruns: 0,
        }
    }

    /// Channel count of the interleaved audio this pipeline produces
    pub fn channels(&self) -> usize {
        self.reader.channels()
    }

    /// Format this pipeline's audio is in. Takes a lock; call from setup
    /// code, not the render callback.
    pub fn format(&self) -> crate::audio::types::AudioFormat {
        let negotiated = *self.shared.negotiated_format.lock();
        negotiated.unwrap_or(crate::audio::types::AudioFormat::new(44100, 2))
    }

    /// Fill `out` (interleaved, whole frames) from the ring buffer.
    ///
    /// Returns the number of frames of real audio written; the remainder of
    /// `out`, if any, is zeroed. An empty ring yields a full buffer of
    /// silence and is success, not an error.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let channels = self.reader.channels();
        let requested = out.len() / channels;

        let available = self.shared.timeline.frames_available_to_read();
        if available == 0 {
            out.fill(0.0);
            self.shared.output_silent.store(true, Ordering::SeqCst);
            if self.shared.active.occupied() > 0 {
                self.note_underrun(requested);
            }
            return 0;
        }

        let to_read = (available.min(requested as u64)) as usize;
        let position = self.shared.timeline.frames_rendered();
        match self
            .reader
            .fetch(&mut out[..to_read * channels], to_read, position, false)
        {
            Ok(_) => {}
            Err(e) => {
                // Unreachable under the flow-control invariant
                warn!("Render fetch failed: {}", e);
                out.fill(0.0);
                self.shared.output_silent.store(true, Ordering::SeqCst);
                return 0;
            }
        }

        self.shared.timeline.add_rendered(to_read as u64);
        self.shared.output_silent.store(false, Ordering::SeqCst);

        if to_read < requested {
            out[to_read * channels..].fill(0.0);
            self.note_underrun(requested - to_read);
        }

        // Wake the decoder once a full write chunk is free
        if self
            .shared
            .timeline
            .frames_available_to_write(self.reader.capacity_frames())
            >= WRITE_CHUNK_FRAMES as u64
        {
            self.shared.decode_signal.notify();
        }

        to_read
    }

    /// Attribute the frames just rendered to their tracks, in timeline
    /// order. A single pass can straddle a track boundary; the earlier track
    /// absorbs its tail and the next track takes the rest, which is how
    /// per-track positions stay correct across a gapless transition.
    pub fn after_render(&mut self, frames_rendered: usize) {
        if frames_rendered == 0 {
            return;
        }
        let mut remaining = frames_rendered as u64;

        let mut states: [Option<Arc<DecoderState>>; ACTIVE_DECODER_SLOTS] = Default::default();
        let count = self.shared.active.snapshot_ordered(&mut states);

        for state in states[..count].iter().flatten() {
            if remaining == 0 {
                break;
            }
            let take = state.frames_remaining().min(remaining);
            if take == 0 {
                continue;
            }

            if state.frames_rendered() == 0 {
                state.events().rendering_started();
            }
            state.add_frames_rendered(take);
            remaining -= take;

            // Zero remaining is only possible once the track is draining
            // with its finalized total fully attributed
            if state.frames_remaining() == 0 {
                state.events().rendering_finished();
                state.mark_collectible();
                self.shared.collector_signal.notify();
                trace!(
                    "Track at timestamp {} fully rendered",
                    state.starting_timestamp()
                );
            }
        }

        // Queue exhausted: the frames just played were the last ones
        if self.shared.active.current().is_none() {
            self.shared.playback_exhausted.store(true, Ordering::SeqCst);
            trace!("No active tracks remain; playback exhausted");
        }
    }

    /// True once after each applied seek. Sinks holding DSP state (effect
    /// tails, resampler history) should flush it when this fires, since the
    /// timeline jumped discontinuously.
    pub fn take_discontinuity(&self) -> bool {
        self.shared.discontinuity.swap(false, Ordering::SeqCst)
    }

    fn note_underrun(&mut self, frames_short: usize) {
        self.underruns += 1;
        if self.underruns % UNDERRUN_WARN_INTERVAL == 1 {
            warn!(
                "Audio underrun: {} frames short (occurrence {})",
                frames_short, self.underruns
            );
        }
    }
}
