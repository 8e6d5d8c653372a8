//! Device output: plays a [`SoftwareContext`] through the default cpal
//! output device.
//!
//! The device callback pulls audio straight from the graph, so the
//! context clock runs at the device's pace.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error};

use crate::config::AudioSettings;
use crate::engine::AudioEngine;
use crate::error::OutputError;
use crate::graph::SoftwareContext;

pub struct DeviceOutput {
    context: SoftwareContext,
    /// Kept alive for as long as playback runs.
    _stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}

impl DeviceOutput {
    /// Open the default output device and start pulling from a fresh
    /// context at the device's sample rate.
    pub fn open() -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(OutputError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| OutputError::Config(e.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();
        let context = SoftwareContext::new(sample_rate as f64);
        let source = context.clone();
        let width = channels as usize;

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    source.render_interleaved(data, width);
                },
                |err| error!("Audio stream error: {err}"),
                None,
            ),
            cpal::SampleFormat::I16 => {
                let mut scratch: Vec<f32> = vec![0.0; 4096];
                device.build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if scratch.len() < data.len() {
                            scratch.resize(data.len(), 0.0);
                        }
                        let scratch = &mut scratch[..data.len()];
                        source.render_interleaved(scratch, width);
                        for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                            *out = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                    },
                    |err| error!("Audio stream error: {err}"),
                    None,
                )
            }
            other => return Err(OutputError::Config(format!("sample format {other:?}"))),
        }
        .map_err(|e| OutputError::Stream(e.to_string()))?;

        stream.play().map_err(|e| OutputError::Stream(e.to_string()))?;
        debug!(sample_rate, channels, "audio stream started");

        Ok(DeviceOutput {
            context,
            _stream: stream,
            sample_rate,
            channels,
        })
    }

    /// An engine whose graph plays through this device. The engine's
    /// sample rate is taken from the device.
    pub fn engine(&self, settings: AudioSettings) -> AudioEngine<SoftwareContext> {
        let context = self.context.clone();
        let settings = AudioSettings {
            sample_rate: self.sample_rate as f64,
            ..settings
        };
        AudioEngine::new(settings, move |_| context.clone())
    }

    pub fn context(&self) -> &SoftwareContext {
        &self.context
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}
