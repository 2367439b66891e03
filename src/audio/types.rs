//! Core audio data types
//!
//! Samples everywhere in the engine are f32 in [-1.0, 1.0], interleaved by
//! channel: `[ch0, ch1, ch0, ch1, ...]` for stereo. A *frame* is one sample
//! per channel at a single time instant.

use std::fmt;

/// Stream format of a track or of the negotiated output.
///
/// Two tracks can share the ring buffer timeline only when their formats are
/// compatible; that check is what keeps transitions gapless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Whether a track of this format can append to a timeline negotiated at
    /// `other` without renegotiating the output.
    pub fn is_compatible_with(&self, other: &AudioFormat) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }

    /// Convert a frame count at this format to seconds
    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// Convert a time in seconds to the nearest frame count
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f64).round() as u64
    }

    /// Number of f32 samples in `frames` frames of interleaved audio
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}
