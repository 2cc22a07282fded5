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
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

use super::error::ConfigError;
use crate::audio::StreamRequest;
use crate::automation::TriggerTimings;
use crate::engine::StartPolicy;

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_BUFFER_BURSTS: u32 = 2;
const DEFAULT_BURST_FRAMES: u32 = 192;
const DEFAULT_START_ATTEMPTS: u32 = 3;
const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(20);
const DEFAULT_FADE_STEPS: u32 = 300;
const DEFAULT_TRIGGER_FADE: Duration = Duration::from_millis(180);
const DEFAULT_SETTLE: Duration = Duration::from_millis(20);
const DEFAULT_RELEASE_STOP_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BLOCK_FRAMES: usize = 4096;

/// Upper bound for the buffer multiple the latency tuner may grow to.
const MAX_BUFFER_BURSTS: u32 = 8;

/// A YAML representation of the engine configuration. Every field is optional.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Engine {
    /// The output device. "default" picks the host default, names starting with "mock" pick
    /// the mock backend.
    device: Option<String>,

    /// Output channel count.
    channels: Option<u16>,

    /// Preferred device sample rate. The device default is used when unset or unsupported.
    sample_rate: Option<u32>,

    /// Buffer size as a multiple of the device burst.
    buffer_bursts: Option<u32>,

    /// Burst size assumed when the device does not report one.
    burst_frames: Option<u32>,

    /// How many times to try starting the stream.
    start_attempts: Option<u32>,

    /// Pause between start attempts.
    start_retry_delay: Option<String>,

    /// Steps in a gain ramp.
    fade_steps: Option<u32>,

    /// Fade length used when triggering and releasing.
    trigger_fade: Option<String>,

    /// Pause between starting voices and fading them in.
    settle: Option<String>,

    /// Delay after a release before every voice is stopped.
    release_stop_delay: Option<String>,

    /// Largest block a voice renders at once. Sizes preallocated buffers.
    max_block_frames: Option<usize>,
}

impl Engine {
    /// New will create a new engine configuration for the given device with defaults elsewhere.
    pub fn new(device: &str) -> Engine {
        Engine {
            device: Some(device.to_string()),
            ..Default::default()
        }
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn channels(&self) -> u16 {
        self.channels.unwrap_or(DEFAULT_CHANNELS)
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn buffer_bursts(&self) -> u32 {
        self.buffer_bursts.unwrap_or(DEFAULT_BUFFER_BURSTS)
    }

    pub fn burst_frames(&self) -> u32 {
        self.burst_frames.unwrap_or(DEFAULT_BURST_FRAMES)
    }

    pub fn start_attempts(&self) -> u32 {
        self.start_attempts.unwrap_or(DEFAULT_START_ATTEMPTS)
    }

    pub fn start_retry_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "start_retry_delay",
            &self.start_retry_delay,
            DEFAULT_START_RETRY_DELAY,
        )
    }

    pub fn fade_steps(&self) -> u32 {
        self.fade_steps.unwrap_or(DEFAULT_FADE_STEPS)
    }

    pub fn trigger_fade(&self) -> Result<Duration, ConfigError> {
        parse_duration("trigger_fade", &self.trigger_fade, DEFAULT_TRIGGER_FADE)
    }

    pub fn settle(&self) -> Result<Duration, ConfigError> {
        parse_duration("settle", &self.settle, DEFAULT_SETTLE)
    }

    pub fn release_stop_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "release_stop_delay",
            &self.release_stop_delay,
            DEFAULT_RELEASE_STOP_DELAY,
        )
    }

    pub fn max_block_frames(&self) -> usize {
        self.max_block_frames.unwrap_or(DEFAULT_MAX_BLOCK_FRAMES)
    }

    /// The stream the engine asks the backend for.
    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest {
            channels: self.channels(),
            sample_rate: self.sample_rate(),
            buffer_bursts: self.buffer_bursts(),
            max_buffer_bursts: MAX_BUFFER_BURSTS.max(self.buffer_bursts()),
            burst_frames: self.burst_frames(),
        }
    }

    pub fn start_policy(&self) -> Result<StartPolicy, ConfigError> {
        Ok(StartPolicy {
            attempts: self.start_attempts(),
            retry_delay: self.start_retry_delay()?,
        })
    }

    pub fn trigger_timings(&self) -> Result<TriggerTimings, ConfigError> {
        Ok(TriggerTimings {
            fade_steps: self.fade_steps(),
            fade: self.trigger_fade()?,
            settle: self.settle()?,
            release_stop_delay: self.release_stop_delay()?,
        })
    }

    /// Checks every value, including the durations, so problems surface at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels() == 0 {
            return Err(invalid("channels", "must be at least 1"));
        }
        if self.sample_rate == Some(0) {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if self.buffer_bursts() == 0 {
            return Err(invalid("buffer_bursts", "must be at least 1"));
        }
        if self.burst_frames() == 0 {
            return Err(invalid("burst_frames", "must be at least 1"));
        }
        if self.start_attempts() == 0 {
            return Err(invalid("start_attempts", "must be at least 1"));
        }
        if self.fade_steps() == 0 {
            return Err(invalid("fade_steps", "must be at least 1"));
        }
        if self.max_block_frames() == 0 {
            return Err(invalid("max_block_frames", "must be at least 1"));
        }
        self.start_policy()?;
        self.trigger_timings()?;
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_duration(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::Duration {
                field,
                value: value.clone(),
                reason: e.to_string(),
            })?
            .into()),
        None => Ok(default),
    }
}
