//! # Gapless Playback Engine
//!
//! Decodes audio off the real-time path and feeds a fixed-latency output
//! callback continuously, supporting queued tracks, mid-stream seeking, and
//! gapless transitions between same-format tracks.
//!
//! **Architecture:** decode worker thread → absolute-indexed ring buffer →
//! real-time render callback → post-render per-track accounting → collector.
//! All tracks share one continuous frame timeline; each track maps into it at
//! its own starting timestamp, which is what makes transitions gapless.

pub mod audio;
pub mod error;
pub mod playback;

pub use audio::decoder::{Decoder, SymphoniaDecoder};
pub use audio::output::{CpalOutput, OutputSink};
pub use audio::types::AudioFormat;
pub use error::{Error, Result};
pub use playback::engine::{EnqueueError, Player};
pub use playback::events::{Track, TrackEvents};
pub use playback::pipeline::RenderPipeline;
