//! Error types for the playback engine
//!
//! Defines engine-specific error types using thiserror for clear error
//! propagation. Per-track failures are contained to that track; the only
//! unrecoverable variants are the ones raised during engine construction.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// A ring buffer store would overwrite unconsumed audio.
    ///
    /// Indicates broken flow control; fatal to the track that triggered it.
    #[error(
        "ring buffer capacity exceeded: store of {frames} frames at {start_frame} \
         overlaps unconsumed data (read position {read_position})"
    )]
    CapacityExceeded {
        start_frame: u64,
        frames: usize,
        read_position: u64,
    },

    /// A ring buffer fetch requested frames that have not been written.
    ///
    /// Treated as underrun by the render path, not corruption.
    #[error("data unavailable: fetch of {frames} frames at {start_frame} exceeds written position {write_position}")]
    DataUnavailable {
        start_frame: u64,
        frames: usize,
        write_position: u64,
    },

    /// Enqueued track's format differs from the negotiated output format
    #[error("format mismatch: queue is {expected}, track is {actual}")]
    FormatMismatch {
        expected: crate::audio::types::AudioFormat,
        actual: crate::audio::types::AudioFormat,
    },

    /// The current track's decoder cannot seek
    #[error("seeking not supported by the current track")]
    SeekUnsupported,

    /// The decoder failed to execute a seek
    #[error("seek failed: {0}")]
    SeekFailed(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Engine construction or thread management errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
