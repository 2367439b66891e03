//! Audio subsystem: formats, decoding, and device output

pub mod decoder;
pub mod output;
pub mod types;
