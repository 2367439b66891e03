//! Audio output using cpal
//!
//! The engine treats the output device as a black box behind [`OutputSink`]:
//! something that takes ownership of a [`RenderPipeline`] and thereafter
//! periodically calls its render contract from a real-time thread.
//! [`CpalOutput`] is the device-backed implementation; tests substitute their
//! own sink and pump the pipeline by hand.

use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use crate::playback::pipeline::RenderPipeline;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Output sink collaborator.
///
/// `start` hands the sink the render pipeline; the sink must invoke
/// `pipeline.render` and then `pipeline.after_render` with the produced frame
/// count on every callback. `stop` tears the stream down and drops the
/// pipeline (the engine builds a fresh one on the next start).
pub trait OutputSink {
    fn start(&mut self, pipeline: RenderPipeline) -> Result<()>;

    /// Halt audible output without discarding the stream
    fn pause(&mut self) -> Result<()>;

    /// Resume audible output after a pause
    fn resume(&mut self) -> Result<()>;

    /// Tear down the stream and drop the pipeline
    fn stop(&mut self) -> Result<()>;

    /// Whether the sink is currently producing audio (started, not paused)
    fn is_running(&self) -> bool;
}

/// Device-backed sink using cpal.
pub struct CpalOutput {
    device: Device,
    stream: Option<Stream>,
    running: bool,
    /// Set by the stream error callback; the next control call can observe
    /// that the device went away
    error_flag: Arc<AtomicBool>,
}

impl CpalOutput {
    /// List available audio output device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open an output device, falling back to the default when the requested
    /// name is not found.
    pub fn new(device_name: Option<String>) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;
            match devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                Some(dev) => {
                    info!("Found requested audio device: {}", name);
                    dev
                }
                None => {
                    warn!(
                        "Requested device '{}' not found, falling back to default device",
                        name
                    );
                    host.default_output_device().ok_or_else(|| {
                        Error::AudioOutput(format!(
                            "Device '{}' not found and no default device available",
                            name
                        ))
                    })?
                }
            }
        } else {
            let dev = host
                .default_output_device()
                .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?;
            info!(
                "Using default audio device: {}",
                dev.name().unwrap_or_else(|_| "Unknown".to_string())
            );
            dev
        };

        Ok(Self {
            device,
            stream: None,
            running: false,
            error_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether the stream error callback has fired since the last start
    pub fn had_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    /// Find a device config matching the engine's negotiated format exactly.
    ///
    /// Sample-rate conversion is out of scope here, so a device that cannot
    /// do the track's native rate and channel count is an error rather than
    /// a silent resample.
    fn find_config(&self, format: AudioFormat) -> Result<(StreamConfig, SampleFormat)> {
        let configs = self
            .device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?;

        let mut fallback: Option<(StreamConfig, SampleFormat)> = None;
        for supported in configs {
            let matches = supported.channels() == format.channels
                && supported.min_sample_rate().0 <= format.sample_rate
                && supported.max_sample_rate().0 >= format.sample_rate;
            if !matches {
                continue;
            }
            let sample_format = supported.sample_format();
            let config = supported
                .with_sample_rate(cpal::SampleRate(format.sample_rate))
                .config();
            if sample_format == SampleFormat::F32 {
                return Ok((config, sample_format));
            }
            if fallback.is_none()
                && matches!(sample_format, SampleFormat::I16 | SampleFormat::U16)
            {
                fallback = Some((config, sample_format));
            }
        }

        fallback.ok_or_else(|| {
            Error::AudioOutput(format!("Output device does not support {}", format))
        })
    }
}

impl OutputSink for CpalOutput {
    fn start(&mut self, mut pipeline: RenderPipeline) -> Result<()> {
        let format = pipeline.format();
        let (config, sample_format) = self.find_config(format)?;
        debug!(
            "Starting output stream: {} as {:?}, buffer {:?}",
            format, sample_format, config.buffer_size
        );

        self.error_flag.store(false, Ordering::SeqCst);
        let error_flag = Arc::clone(&self.error_flag);
        let err_fn = move |e| {
            error!("Audio stream error: {}", e);
            error_flag.store(true, Ordering::SeqCst);
        };

        let stream = match sample_format {
            SampleFormat::F32 => self
                .device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _| {
                        let frames = pipeline.render(data);
                        pipeline.after_render(frames);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))?,
            SampleFormat::I16 => {
                // Render in f32 and convert; scratch sized up front so the
                // callback stays allocation-free
                let mut scratch = vec![0.0f32; 16384 * format.channels as usize];
                self.device
                    .build_output_stream(
                        &config,
                        move |data: &mut [i16], _| {
                            let n = data.len().min(scratch.len());
                            let frames = pipeline.render(&mut scratch[..n]);
                            pipeline.after_render(frames);
                            for (dst, src) in data.iter_mut().zip(&scratch[..n]) {
                                *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            }
                            data[n..].fill(0);
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))?
            }
            SampleFormat::U16 => {
                let mut scratch = vec![0.0f32; 16384 * format.channels as usize];
                self.device
                    .build_output_stream(
                        &config,
                        move |data: &mut [u16], _| {
                            let n = data.len().min(scratch.len());
                            let frames = pipeline.render(&mut scratch[..n]);
                            pipeline.after_render(frames);
                            for (dst, src) in data.iter_mut().zip(&scratch[..n]) {
                                let s = src.clamp(-1.0, 1.0);
                                *dst = ((s + 1.0) * 0.5 * u16::MAX as f32) as u16;
                            }
                            data[n..].fill(u16::MAX / 2);
                        },
                        err_fn,
                        None,
                    )
                    .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))?
            }
            other => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;
        self.stream = Some(stream);
        self.running = true;
        info!("Audio output started at {}", format);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| Error::AudioOutput(format!("Failed to pause stream: {}", e)))?;
            self.running = false;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| Error::AudioOutput(format!("Failed to resume stream: {}", e)))?;
            self.running = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // Dropping the stream releases the device and the pipeline
            drop(stream);
            debug!("Audio output stream stopped");
        }
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
