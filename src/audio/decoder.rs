//! Audio decoding behind a chunked, seekable trait boundary
//!
//! The engine never touches codec internals; it sees a [`Decoder`] that
//! produces bounded chunks of interleaved f32 and can (maybe) seek.
//! [`SymphoniaDecoder`] is the file-backed implementation covering MP3, FLAC,
//! AAC, Vorbis, WAV and friends.

use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;
use tracing::{debug, warn};

/// Decode errors on isolated packets are not fatal; the correct action is to
/// fetch the next packet and try again. More than this many consecutive
/// failures is fatal for the track.
const MAX_DECODE_RETRIES: usize = 3;

/// Format-specific decoder collaborator.
///
/// Implementations produce audio in bounded chunks so the caller controls
/// pacing, and report position in frames relative to the start of the track.
pub trait Decoder: Send {
    /// Stream format (sample rate and channel count)
    fn format(&self) -> AudioFormat;

    /// Whether [`Decoder::seek_to_frame`] can be expected to succeed
    fn supports_seeking(&self) -> bool;

    /// Decode up to `max_frames` frames of interleaved samples into `out`.
    ///
    /// `out` must hold at least `max_frames * channels` samples. Returns the
    /// number of frames actually produced; 0 signals end of stream.
    fn read_audio(&mut self, out: &mut [f32], max_frames: usize) -> Result<usize>;

    /// Seek to the given track-relative frame.
    ///
    /// Returns the frame actually reached, which may differ from the request
    /// when the container rounds to a packet boundary.
    fn seek_to_frame(&mut self, frame: u64) -> Result<u64>;

    /// Next frame [`Decoder::read_audio`] will produce, track-relative
    fn current_frame(&self) -> u64;

    /// Total track length in frames, if the container reports it up front.
    ///
    /// Some formats cannot; their length is only known once decoding hits
    /// end of stream.
    fn total_frames(&self) -> Option<u64>;
}

/// Incremental decoder over symphonia's probe/format/codec stack.
///
/// Holds at most one decoded packet of samples between calls, so memory use
/// is bounded regardless of track length.
pub struct SymphoniaDecoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    format: AudioFormat,
    time_base: Option<TimeBase>,
    total_frames: Option<u64>,
    /// Next frame read_audio will produce, track-relative
    position: u64,
    seekable: bool,
    /// Leftover samples from the last decoded packet
    pending: Option<SampleBuffer<f32>>,
    /// Consumed prefix of `pending`, in samples
    pending_offset: usize,
}

impl SymphoniaDecoder {
    /// Open a file and probe its format.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening {}", path.display());

        let file = std::fs::File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open {}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        Self::from_media_source(mss, hint)
    }

    /// Probe an arbitrary media source.
    pub fn from_media_source(mss: MediaSourceStream, hint: Hint) -> Result<Self> {
        let seekable = mss.is_seekable();

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;

        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("Sample rate not found".to_string()))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("Channel count not found".to_string()))?;

        let time_base = codec_params.time_base;
        let format = AudioFormat::new(sample_rate, channels);
        let total_frames = codec_params.n_frames.map(|n| match time_base {
            Some(tb) => ts_to_frames(tb, n, sample_rate),
            None => n,
        });

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

        debug!(
            "Probed track {}: {}, {:?} total frames",
            track_id, format, total_frames
        );

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            format,
            time_base,
            total_frames,
            position: 0,
            seekable,
            pending: None,
            pending_offset: 0,
        })
    }

    /// Copy buffered samples into `out`, returning frames copied.
    fn drain_pending(&mut self, out: &mut [f32], max_frames: usize) -> usize {
        let channels = self.format.channels as usize;
        let Some(buf) = &self.pending else {
            return 0;
        };

        let samples = &buf.samples()[self.pending_offset..];
        let frames_buffered = samples.len() / channels;
        let frames = frames_buffered.min(max_frames);
        let n_samples = frames * channels;
        out[..n_samples].copy_from_slice(&samples[..n_samples]);

        self.pending_offset += n_samples;
        if self.pending_offset >= buf.samples().len() {
            self.pending = None;
            self.pending_offset = 0;
        }
        frames
    }

    /// Decode the next packet of this track into `pending`.
    ///
    /// Returns false at end of stream.
    fn decode_next_packet(&mut self) -> Result<bool> {
        let mut retries = 0;
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(Error::Decode(format!("Error reading packet: {}", e))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let duration = decoded.capacity() as u64;
                    // Reuse the buffer when the packet fits; packets in a
                    // stream are normally uniform capacity.
                    match &mut self.pending {
                        Some(buf) if buf.capacity() >= decoded.frames() * spec.channels.count() => {
                            buf.copy_interleaved_ref(decoded);
                        }
                        pending => {
                            let mut buf = SampleBuffer::<f32>::new(duration, spec);
                            buf.copy_interleaved_ref(decoded);
                            *pending = Some(buf);
                        }
                    }
                    self.pending_offset = 0;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    retries += 1;
                    warn!("Decode error (attempt {}): {}", retries, e);
                    if retries > MAX_DECODE_RETRIES {
                        return Err(Error::Decode(format!(
                            "Decoding failed on {} consecutive packets: {}",
                            retries, e
                        )));
                    }
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(Error::Decode(format!("Decode error: {}", e))),
            }
        }
    }

    /// Decode and discard `frames` frames after a container-level seek, so the
    /// reported position is sample-accurate rather than packet-rounded.
    fn skip_frames(&mut self, mut frames: u64) -> Result<()> {
        let channels = self.format.channels as usize;
        while frames > 0 {
            if self.pending.is_none() && !self.decode_next_packet()? {
                break;
            }
            let Some(buf) = &self.pending else { break };
            let buffered = ((buf.samples().len() - self.pending_offset) / channels) as u64;
            let skip = buffered.min(frames);
            self.pending_offset += skip as usize * channels;
            if self.pending_offset >= buf.samples().len() {
                self.pending = None;
                self.pending_offset = 0;
            }
            self.position += skip;
            frames -= skip;
        }
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn read_audio(&mut self, out: &mut [f32], max_frames: usize) -> Result<usize> {
        let channels = self.format.channels as usize;
        debug_assert!(out.len() >= max_frames * channels);

        let mut produced = 0;
        while produced < max_frames {
            if self.pending.is_none() && !self.decode_next_packet()? {
                break;
            }
            let start = produced * channels;
            let end = max_frames * channels;
            produced += self.drain_pending(&mut out[start..end], max_frames - produced);
        }

        self.position += produced as u64;
        Ok(produced)
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64> {
        if !self.seekable {
            return Err(Error::SeekUnsupported);
        }

        let time = self.format.frames_to_seconds(frame);
        let seeked_to = self
            .format_reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: time.into(),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::SeekFailed(e.to_string()))?;

        // The container lands on a packet boundary at or before the target.
        self.decoder.reset();
        self.pending = None;
        self.pending_offset = 0;
        self.position = match self.time_base {
            Some(tb) => ts_to_frames(tb, seeked_to.actual_ts, self.format.sample_rate),
            None => seeked_to.actual_ts,
        };

        if frame > self.position {
            let skip = frame - self.position;
            self.skip_frames(skip)
                .map_err(|e| Error::SeekFailed(e.to_string()))?;
        }

        debug!("Seek to frame {} reached {}", frame, self.position);
        Ok(self.position)
    }

    fn current_frame(&self) -> u64 {
        self.position
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }
}

/// Convert a track-timebase timestamp to frames at `sample_rate`
fn ts_to_frames(tb: TimeBase, ts: u64, sample_rate: u32) -> u64 {
    let time = tb.calc_time(ts);
    (time.seconds as f64 * sample_rate as f64 + time.frac * sample_rate as f64).round() as u64
}
