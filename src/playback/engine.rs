//! Engine state and the playback control surface
//!
//! [`EngineShared`] is the hub every thread hangs off: timeline counters, the
//! active decoder table, the pending queue, the two wake signals, and the
//! producer half of the ring buffer. [`Player`] owns the threads and the
//! output sink and exposes the control operations, all callable from any
//! thread; none of them ever blocks on the render callback.

use crate::audio::output::OutputSink;
use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use crate::playback::decoder_state::ActiveDecoderTable;
use crate::playback::events::Track;
use crate::playback::pipeline::RenderPipeline;
use crate::playback::queue::DecoderQueue;
use crate::playback::ring_buffer::{self, RingWriter};
use crate::playback::signal::Signal;
use crate::playback::timeline::Timeline;
use crate::playback::{collector, worker, DEFAULT_RING_CAPACITY_FRAMES};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// State shared between the control surface, the decode worker, the render
/// pipeline, and the collector.
pub(crate) struct EngineShared {
    pub(crate) timeline: Timeline,
    pub(crate) active: ActiveDecoderTable,
    pub(crate) queue: DecoderQueue,
    pub(crate) decode_signal: Signal,
    pub(crate) collector_signal: Signal,
    /// Producer half of the current ring; replaced on play-now. Locked by
    /// the worker per store and by the control surface on reallocation,
    /// never by the render path.
    pub(crate) writer: Mutex<Option<RingWriter>>,
    /// Format the output was negotiated at; enqueue matches against this
    pub(crate) negotiated_format: Mutex<Option<AudioFormat>>,
    pub(crate) shutting_down: AtomicBool,
    /// Set by post-render accounting when the last track's last frame went
    /// out and nothing else is active
    pub(crate) playback_exhausted: AtomicBool,
    /// Whether the last render pass emitted silence
    pub(crate) output_silent: AtomicBool,
    /// A seek jumped the timeline; sinks with DSP state should flush it
    pub(crate) discontinuity: AtomicBool,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            timeline: Timeline::new(),
            active: ActiveDecoderTable::new(),
            queue: DecoderQueue::new(),
            decode_signal: Signal::new(),
            collector_signal: Signal::new(),
            writer: Mutex::new(None),
            negotiated_format: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            playback_exhausted: AtomicBool::new(false),
            output_silent: AtomicBool::new(true),
            discontinuity: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every active track and wake both background threads
    pub(crate) fn stop_active_decoders(&self) {
        self.active.stop_all();
        self.decode_signal.notify();
        self.collector_signal.notify();
    }

    pub(crate) fn ring_capacity(&self) -> Option<usize> {
        self.writer.lock().as_ref().map(|w| w.capacity_frames())
    }
}

/// Enqueue failure. A format mismatch hands the track back to the caller;
/// the queue and whatever is playing are left untouched.
#[derive(Debug, ThisError)]
pub enum EnqueueError {
    #[error("{error}")]
    Rejected { track: Track, error: Error },
    #[error(transparent)]
    Engine(Error),
}

/// Gapless playback engine.
///
/// Owns the decode worker and collector threads and the output sink. Dropping
/// the player tears everything down and joins both threads.
pub struct Player {
    shared: Arc<EngineShared>,
    sink: Box<dyn OutputSink>,
    ring_capacity: usize,
    worker: Option<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
}

impl Player {
    /// Build an engine around the given output sink with the default ring
    /// capacity.
    pub fn new(sink: Box<dyn OutputSink>) -> Result<Self> {
        Self::with_ring_capacity(sink, DEFAULT_RING_CAPACITY_FRAMES)
    }

    /// Build an engine with an explicit ring capacity in frames (rounded up
    /// to a power of two).
    ///
    /// Fails if either background thread cannot be spawned; that failure is
    /// unrecoverable and nothing is left running.
    pub fn with_ring_capacity(sink: Box<dyn OutputSink>, ring_capacity: usize) -> Result<Self> {
        let shared = Arc::new(EngineShared::new());

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("decode-worker".to_string())
            .spawn(move || worker::run(worker_shared))
            .map_err(|e| Error::Engine(format!("Failed to spawn decode worker: {}", e)))?;

        let collector_shared = Arc::clone(&shared);
        let collector = match std::thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collector::run(collector_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.shutting_down.store(true, Ordering::SeqCst);
                shared.decode_signal.notify();
                let _ = worker.join();
                return Err(Error::Engine(format!("Failed to spawn collector: {}", e)));
            }
        };

        info!("Playback engine started (ring capacity {} frames)", ring_capacity);
        Ok(Self {
            shared,
            sink,
            ring_capacity,
            worker: Some(worker),
            collector: Some(collector),
        })
    }

    /// Resume (or begin) audible playback
    pub fn play(&mut self) -> Result<()> {
        self.sink.resume()
    }

    /// Pause the output; decode continues until the ring fills
    pub fn pause(&mut self) -> Result<()> {
        self.sink.pause()
    }

    /// Whether the sink is running and playback has not exhausted the queue
    pub fn is_playing(&self) -> bool {
        self.sink.is_running() && !self.shared.playback_exhausted.load(Ordering::SeqCst)
    }

    /// Whether the last render pass produced silence
    pub fn is_output_silent(&self) -> bool {
        self.shared.output_silent.load(Ordering::SeqCst)
    }

    /// Stop playback: pause the sink, stop and discard active tracks, and
    /// zero the timeline. Queued tracks are kept.
    pub fn stop(&mut self) -> Result<()> {
        self.sink.pause()?;
        self.shared.stop_active_decoders();
        self.shared.timeline.reset();
        self.shared.playback_exhausted.store(false, Ordering::SeqCst);
        debug!("Playback stopped");
        Ok(())
    }

    /// Pre-empt whatever is playing with `track`, on a fresh timeline.
    ///
    /// Pending queue entries are discarded. The sink's playing/paused state
    /// is preserved: if the engine was paused, the new track is prepared but
    /// not audible until [`Player::play`].
    pub fn play_now(&mut self, track: Track) -> Result<()> {
        let was_playing = self.sink.is_running();
        self.sink.stop()?;

        self.shared.stop_active_decoders();
        self.shared.queue.clear();
        self.shared.timeline.reset();
        self.shared.playback_exhausted.store(false, Ordering::SeqCst);
        self.shared.discontinuity.store(false, Ordering::SeqCst);

        let format = track.format();
        let (writer, reader) = ring_buffer::with_capacity(format, self.ring_capacity);
        *self.shared.writer.lock() = Some(writer);
        *self.shared.negotiated_format.lock() = Some(format);
        info!("Play now: {} on a fresh timeline", format);

        self.shared.queue.push_front(track);
        self.shared.decode_signal.notify();

        let pipeline = RenderPipeline::new(reader, Arc::clone(&self.shared));
        self.sink.start(pipeline)?;
        if !was_playing {
            self.sink.pause()?;
        }
        Ok(())
    }

    /// Convenience: open a file and pre-empt playback with it
    pub fn play_path<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        self.play_now(Track::from_path(path)?)
    }

    /// Append a track for gapless playback after the current material.
    ///
    /// Falls back to [`Player::play_now`] when nothing is active and the
    /// queue is empty. Otherwise the track's sample rate and channel count
    /// must match the negotiated output format; a mismatch returns the track
    /// unconsumed.
    pub fn enqueue(&mut self, track: Track) -> std::result::Result<(), EnqueueError> {
        let negotiated = *self.shared.negotiated_format.lock();
        let idle = self.shared.active.current().is_none() && self.shared.queue.is_empty();

        let expected = match negotiated {
            Some(fmt) if !idle => fmt,
            _ => return self.play_now(track).map_err(EnqueueError::Engine),
        };

        let actual = track.format();
        if !actual.is_compatible_with(&expected) {
            warn!("Enqueue rejected: queue is {}, track is {}", expected, actual);
            return Err(EnqueueError::Rejected {
                track,
                error: Error::FormatMismatch { expected, actual },
            });
        }

        self.shared.queue.push_back(track);
        self.shared.decode_signal.notify();
        Ok(())
    }

    /// Convenience: open a file and enqueue it
    pub fn enqueue_path<P: AsRef<std::path::Path>>(
        &mut self,
        path: P,
    ) -> std::result::Result<(), EnqueueError> {
        let track = Track::from_path(path).map_err(EnqueueError::Engine)?;
        self.enqueue(track)
    }

    /// Discard all queued (not yet activated) tracks. No-op when empty.
    pub fn clear_queue(&self) -> usize {
        self.shared.queue.clear()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Format the output is currently negotiated at
    pub fn format(&self) -> Option<AudioFormat> {
        *self.shared.negotiated_format.lock()
    }

    /// Request an asynchronous seek of the current track to a track-relative
    /// frame. The worker applies it; position getters report the target
    /// until then. Last request wins if several race.
    pub fn seek_to_frame(&self, frame: u64) -> Result<()> {
        let state = self
            .shared
            .active
            .current()
            .ok_or_else(|| Error::InvalidState("no active track to seek".to_string()))?;
        if !state.supports_seeking() {
            return Err(Error::SeekUnsupported);
        }
        state.request_seek(frame);
        self.shared.decode_signal.notify();
        debug!("Seek requested to frame {}", frame);
        Ok(())
    }

    /// Seek the current track to a position in seconds
    pub fn seek_to_time(&self, seconds: f64) -> Result<()> {
        let state = self
            .shared
            .active
            .current()
            .ok_or_else(|| Error::InvalidState("no active track to seek".to_string()))?;
        if !state.supports_seeking() {
            return Err(Error::SeekUnsupported);
        }
        let mut frame = state.format().seconds_to_frames(seconds.max(0.0));
        if let Some(total) = state.total_frames() {
            frame = frame.min(total);
        }
        state.request_seek(frame);
        self.shared.decode_signal.notify();
        Ok(())
    }

    /// Skip ahead by `seconds` from the current position
    pub fn seek_forward(&self, seconds: f64) -> Result<()> {
        let now = self.current_time().unwrap_or(0.0);
        self.seek_to_time(now + seconds)
    }

    /// Skip back by `seconds`, clamped to the start of the track
    pub fn seek_backward(&self, seconds: f64) -> Result<()> {
        let now = self.current_time().unwrap_or(0.0);
        self.seek_to_time((now - seconds).max(0.0))
    }

    /// Current track's playback position in frames. While a seek is pending
    /// this reports the requested target.
    pub fn current_frame(&self) -> Option<u64> {
        let state = self.shared.active.current()?;
        Some(state.pending_seek().unwrap_or_else(|| state.frames_rendered()))
    }

    /// Current track's length in frames, if known yet
    pub fn total_frames(&self) -> Option<u64> {
        self.shared.active.current()?.total_frames()
    }

    /// Current track's playback position in seconds
    pub fn current_time(&self) -> Option<f64> {
        let state = self.shared.active.current()?;
        let frame = state.pending_seek().unwrap_or_else(|| state.frames_rendered());
        Some(state.format().frames_to_seconds(frame))
    }

    /// Current track's duration in seconds, if known yet
    pub fn total_time(&self) -> Option<f64> {
        let state = self.shared.active.current()?;
        let total = state.total_frames()?;
        Some(state.format().frames_to_seconds(total))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.stop_active_decoders();
        let _ = self.sink.stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
        self.shared.queue.clear();
        self.shared.active.clear_all();
        debug!("Playback engine shut down");
    }
}
