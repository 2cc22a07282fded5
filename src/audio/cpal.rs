// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, SupportedBufferSize};
use tracing::{debug, error, info, span, warn, Level};

use super::thread_priority::{
    callback_thread_priority, configure_audio_thread_priority, rt_audio_enabled,
};
use super::{
    AudioError, DeviceInfo, ErrorCallback, OutputStream, RenderCallback, StreamInfo, StreamRequest,
};

/// Sample formats we can render into, best first.
const FORMAT_PREFERENCE: [SampleFormat; 3] =
    [SampleFormat::F32, SampleFormat::I32, SampleFormat::I16];

/// Smallest buffer we will ask for when the device reports a range.
const MIN_BURST_FRAMES: u32 = 16;

/// A cpal output device, looked up by name each time a stream is opened so a device that went
/// away and came back can be reopened.
pub struct Backend {
    device_name: String,
}

impl Backend {
    pub fn new(device_name: &str) -> Backend {
        Backend {
            device_name: device_name.to_string(),
        }
    }

    /// Lists cpal output devices across every available host.
    pub fn list() -> Result<Vec<DeviceInfo>, AudioError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout().map_err(|e| AudioError::HostError(e.to_string()))?;
        let _shh_stderr = shh::stderr().map_err(|e| AudioError::HostError(e.to_string()))?;

        let mut devices = Vec::new();
        for host_id in cpal::available_hosts() {
            let host =
                cpal::host_from_id(host_id).map_err(|e| AudioError::HostError(e.to_string()))?;
            let host_devices = match host.output_devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs.map(|c| c.channels()).max().unwrap_or(0);
                if max_channels == 0 {
                    continue;
                }

                let Ok(name) = device.name() else {
                    continue;
                };
                devices.push(DeviceInfo {
                    name,
                    host: host_id.name().to_string(),
                    max_channels,
                    default_sample_rate: device
                        .default_output_config()
                        .ok()
                        .map(|c| c.sample_rate().0),
                });
            }
        }

        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    fn find_device(&self) -> Result<cpal::Device, AudioError> {
        let _shh_stderr = shh::stderr().map_err(|e| AudioError::HostError(e.to_string()))?;
        let host = cpal::default_host();
        if self.device_name == "default" {
            return host.default_output_device().ok_or(AudioError::NoDefaultDevice);
        }

        host.output_devices()
            .map_err(|e| AudioError::HostError(e.to_string()))?
            .find(|device| {
                device
                    .name()
                    .map(|name| name.trim() == self.device_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| AudioError::DeviceNotFound(self.device_name.clone()))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (cpal)", self.device_name)
    }
}

/// Picks a supported configuration for the request and the burst size to build buffers from.
fn negotiate(
    device: &cpal::Device,
    request: &StreamRequest,
) -> Result<(cpal::SupportedStreamConfig, u32), AudioError> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .filter(|c| c.channels() == request.channels)
        .collect();
    if supported.is_empty() {
        return Err(AudioError::ConfigError(format!(
            "no {}-channel output configuration",
            request.channels
        )));
    }

    let default_rate = device
        .default_output_config()
        .ok()
        .map(|c| c.sample_rate().0);
    let in_range = |c: &cpal::SupportedStreamConfigRange, rate: u32| {
        rate >= c.min_sample_rate().0 && rate <= c.max_sample_rate().0
    };

    let range = FORMAT_PREFERENCE
        .iter()
        .find_map(|format| {
            supported.iter().find(|c| {
                c.sample_format() == *format
                    && request.sample_rate.map_or(true, |rate| in_range(c, rate))
            })
        })
        .or_else(|| {
            FORMAT_PREFERENCE
                .iter()
                .find_map(|format| supported.iter().find(|c| c.sample_format() == *format))
        })
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("{:?}", supported[0].sample_format()))
        })?;

    let rate = match (request.sample_rate, default_rate) {
        (Some(rate), _) if in_range(range, rate) => rate,
        (Some(rate), fallback) => {
            let fallback = fallback
                .filter(|r| in_range(range, *r))
                .unwrap_or(range.max_sample_rate().0);
            warn!(
                requested = rate,
                using = fallback,
                "Audio device doesn't support the requested rate"
            );
            fallback
        }
        (None, Some(rate)) if in_range(range, rate) => rate,
        (None, _) => range.max_sample_rate().0,
    };

    let burst = match range.buffer_size() {
        SupportedBufferSize::Range { min, max } => (*min).max(MIN_BURST_FRAMES).min(*max),
        SupportedBufferSize::Unknown => request.burst_frames,
    };

    Ok((range.clone().with_sample_rate(cpal::SampleRate(rate)), burst))
}

fn buffer_frames(config: &cpal::SupportedStreamConfig, burst: u32, bursts: u32) -> u32 {
    let frames = burst.saturating_mul(bursts.max(1));
    match config.buffer_size() {
        SupportedBufferSize::Range { min, max } => frames.clamp(*min, *max),
        SupportedBufferSize::Unknown => frames,
    }
}

impl super::Backend for Backend {
    fn open(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        mut on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        let span = span!(Level::INFO, "open stream (cpal)");
        let _enter = span.enter();

        let device = self.find_device()?;
        let (supported, burst) = negotiate(&device, request)?;
        let frames = buffer_frames(&supported, burst, request.buffer_bursts);
        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Fixed(frames),
        };

        let error_callback = move |err: cpal::StreamError| {
            on_error(AudioError::StreamError(err.to_string()));
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_f32(&device, &config, render, error_callback),
            SampleFormat::I32 => {
                build_converted::<i32>(&device, &config, frames, render, error_callback)
            }
            SampleFormat::I16 => {
                build_converted::<i16>(&device, &config, frames, render, error_callback)
            }
            other => return Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        let info = StreamInfo {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            burst_frames: burst,
            buffer_frames: frames,
        };
        info!(
            device = self.device_name,
            sample_rate = info.sample_rate,
            channels = info.channels,
            format = ?supported.sample_format(),
            burst = info.burst_frames,
            buffer = info.buffer_frames,
            latency_ms = info.buffer_frames as f32 * 1000.0 / info.sample_rate.max(1) as f32,
            "Opened output stream"
        );
        Ok(Box::new(Stream { stream, info }))
    }
}

/// f32 callback: render directly into the CPAL buffer.
fn build_f32(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderCallback,
    error_callback: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError> {
    let priority = callback_thread_priority();
    let rt_audio = rt_audio_enabled();
    let mut priority_set = false;
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                configure_audio_thread_priority(priority, rt_audio, &mut priority_set);
                render(data);
            },
            error_callback,
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

/// Integer callback: render into a preallocated f32 buffer and convert.
fn build_converted<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: u32,
    mut render: RenderCallback,
    error_callback: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let priority = callback_thread_priority();
    let rt_audio = rt_audio_enabled();
    let mut priority_set = false;
    // Hosts may deliver more frames than requested.
    let mut scratch = vec![0.0f32; 4 * frames as usize * config.channels as usize];
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                configure_audio_thread_priority(priority, rt_audio, &mut priority_set);
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let buffer = &mut scratch[..data.len()];
                render(buffer);
                for (dst, src) in data.iter_mut().zip(buffer.iter()) {
                    *dst = T::from_sample(*src);
                }
            },
            error_callback,
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

/// An open cpal stream.
struct Stream {
    stream: cpal::Stream,
    info: StreamInfo,
}

impl OutputStream for Stream {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        debug!("Pausing cpal stream");
        self.stream
            .pause()
            .map_err(|e| AudioError::StreamPauseError(e.to_string()))
    }
}
