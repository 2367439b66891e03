//! Persistent decode worker
//!
//! One thread loops over queue entries for the life of the engine. Per track
//! it registers a [`DecoderState`] on the global timeline, claims a table
//! slot, then decodes in write-chunk batches into the ring buffer, gated on
//! free space and woken by the render path's signal. Seeks are applied here,
//! off the real-time path. End of stream finalizes the track's length and
//! moves on to the next queue entry.
//!
//! A decode error is an implicit end of stream for that track only; the
//! queue keeps moving.

use crate::playback::decoder_state::DecoderState;
use crate::playback::engine::EngineShared;
use crate::playback::events::Track;
use crate::playback::signal::WAIT_TIMEOUT;
use crate::playback::WRITE_CHUNK_FRAMES;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Worker thread entry point
pub(crate) fn run(shared: Arc<EngineShared>) {
    debug!("Decode worker started");
    while !shared.is_shutting_down() {
        match shared.queue.pop_front() {
            Some(track) => decode_track(&shared, track),
            None => {
                shared.decode_signal.wait_timeout(WAIT_TIMEOUT);
            }
        }
    }
    debug!("Decode worker stopped");
}

/// Decode one track to completion (or until stopped).
fn decode_track(shared: &Arc<EngineShared>, track: Track) {
    let Some(capacity) = shared.ring_capacity() else {
        // No ring allocated; nothing can consume this track's audio
        warn!("Dropping queued track: no ring buffer allocated");
        return;
    };

    let starting_timestamp = shared.timeline.next_starting_timestamp();
    let format = track.format();
    let state = Arc::new(DecoderState::new(track, starting_timestamp));
    if let Err(e) = shared.active.claim(Arc::clone(&state)) {
        warn!("Dropping track: {}", e);
        return;
    }
    info!(
        "Activated track at timestamp {} ({})",
        starting_timestamp, format
    );

    let channels = format.channels as usize;
    let mut scratch = vec![0.0f32; WRITE_CHUNK_FRAMES * channels];

    loop {
        if state.stop_requested() || shared.is_shutting_down() {
            debug!("Track at timestamp {} stopped", starting_timestamp);
            state.mark_collectible();
            shared.collector_signal.notify();
            return;
        }

        // Seeks are honored even when the ring is full: applying one frees
        // the whole buffer by snapping the read edge to the write edge
        if let Some(target) = state.take_pending_seek() {
            apply_seek(shared, &state, target);
        }

        // Fill while at least one write chunk of space is free
        while shared.timeline.frames_available_to_write(capacity) >= WRITE_CHUNK_FRAMES as u64 {
            if state.stop_requested() || shared.is_shutting_down() {
                state.mark_collectible();
                shared.collector_signal.notify();
                return;
            }

            if let Some(target) = state.take_pending_seek() {
                apply_seek(shared, &state, target);
            }

            let mut decoder = state.decoder();
            let starting_frame = decoder.current_frame();
            let produced = match decoder.read_audio(&mut scratch, WRITE_CHUNK_FRAMES) {
                Ok(n) => n,
                Err(e) => {
                    // Implicit end of stream; one bad track must not halt
                    // the queue
                    warn!("Decode error, ending track: {}", e);
                    0
                }
            };
            drop(decoder);

            // A preemption can land while the read was in flight; the chunk
            // would otherwise be stored against the fresh timeline
            if state.stop_requested() || shared.is_shutting_down() {
                state.mark_collectible();
                shared.collector_signal.notify();
                return;
            }

            if produced > 0 && starting_frame == 0 {
                state.events().decoding_started();
            }

            if produced == 0 {
                finish_track(shared, &state, starting_frame);
                return;
            }

            let abs_position = starting_timestamp + starting_frame;
            let store_result = {
                let mut writer = shared.writer.lock();
                match writer.as_mut() {
                    Some(w) => w.store(&scratch[..produced * channels], produced, abs_position),
                    None => {
                        warn!("Ring buffer gone mid-decode, ending track");
                        state.mark_collectible();
                        shared.collector_signal.notify();
                        return;
                    }
                }
            };
            match store_result {
                Ok(()) => shared.timeline.add_decoded(produced as u64),
                Err(e) => {
                    // Flow control should make this unreachable; fatal to
                    // this track only
                    error!("Ring buffer store failed: {}", e);
                    finish_track(shared, &state, starting_frame);
                    return;
                }
            }
        }

        shared.decode_signal.wait_timeout(WAIT_TIMEOUT);
    }
}

/// End-of-stream bookkeeping: the decoder's final position is the
/// authoritative track length, even when an up-front estimate existed.
fn finish_track(shared: &Arc<EngineShared>, state: &Arc<DecoderState>, total_frames: u64) {
    state.events().decoding_finished();
    state.finalize_total_frames(total_frames);
    state.set_draining();
    if total_frames == 0 {
        // Nothing will ever be attributed to an empty track, so accounting
        // cannot retire it
        state.mark_collectible();
        shared.collector_signal.notify();
    }
    shared.timeline.advance_next_starting_timestamp(total_frames);
    info!(
        "Track at timestamp {} finished decoding: {} frames, now draining",
        state.starting_timestamp(),
        total_frames
    );
}

/// Apply a pending seek: ask the decoder, then jump the timeline by the
/// frames actually skipped and snap this track's rendered counter to the
/// reached position. On failure playback continues from where it was.
fn apply_seek(shared: &Arc<EngineShared>, state: &Arc<DecoderState>, target: u64) {
    let mut decoder = state.decoder();
    let before = decoder.current_frame();
    match decoder.seek_to_frame(target) {
        Ok(reached) => {
            drop(decoder);
            let delta = reached as i64 - before as i64;
            let position = shared.timeline.apply_seek(delta);
            state.set_frames_rendered(reached);
            shared
                .discontinuity
                .store(true, std::sync::atomic::Ordering::SeqCst);
            debug!(
                "Seek to {} reached {} (timeline now {})",
                target, reached, position
            );
        }
        Err(e) => {
            warn!("Seek to frame {} failed: {}", target, e);
        }
    }
}
