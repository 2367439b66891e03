//! Per-track lifecycle notifications
//!
//! Four hooks fire over a track's life: decoding started (first frame
//! decoded), decoding finished (end of stream reached), rendering started
//! (first frame attributed by post-render accounting), rendering finished
//! (last frame attributed). The rendering hooks run on the real-time thread's
//! accounting pass, so implementations must be fast and must not block.

use crate::audio::decoder::Decoder;
use crate::audio::types::AudioFormat;
use crate::error::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Lifecycle listener for one track. All hooks default to no-ops.
pub trait TrackEvents: Send + Sync {
    /// The decoder produced the track's first frame
    fn decoding_started(&self) {}

    /// The decoder reached end of stream (the track may still be draining)
    fn decoding_finished(&self) {}

    /// The track's first frame was just rendered
    fn rendering_started(&self) {}

    /// The track's last frame was just rendered
    fn rendering_finished(&self) {}
}

/// Listener that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl TrackEvents for NoEvents {}

/// A decoder paired with its lifecycle listener, ready to enqueue.
pub struct Track {
    pub decoder: Box<dyn Decoder>,
    pub events: Arc<dyn TrackEvents>,
}

impl Track {
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        Self {
            decoder,
            events: Arc::new(NoEvents),
        }
    }

    pub fn with_events(decoder: Box<dyn Decoder>, events: Arc<dyn TrackEvents>) -> Self {
        Self { decoder, events }
    }

    /// Open a file with [`crate::SymphoniaDecoder`]
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let decoder = crate::audio::decoder::SymphoniaDecoder::from_path(path)?;
        Ok(Self::new(Box::new(decoder)))
    }

    pub fn format(&self) -> AudioFormat {
        self.decoder.format()
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("format", &self.format())
            .field("position", &self.decoder.current_frame())
            .field("total_frames", &self.decoder.total_frames())
            .finish()
    }
}
