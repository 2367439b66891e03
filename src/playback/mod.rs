//! Playback pipeline: queue → decode worker → ring buffer → render callback
//! → post-render accounting → collector

pub mod collector;
pub mod decoder_state;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod queue;
pub mod ring_buffer;
pub mod signal;
pub mod timeline;
pub mod worker;

/// Frames decoded and stored per pass. Batching at this size avoids
/// thrashing the ring buffer with tiny stores, and the render path uses the
/// same threshold to decide when freed space is worth a decoder wake.
pub const WRITE_CHUNK_FRAMES: usize = 2048;

/// Default ring buffer capacity in frames (power of two)
pub const DEFAULT_RING_CAPACITY_FRAMES: usize = 16384;
