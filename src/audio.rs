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
//! Output backends.
//!
//! A [`Backend`] opens output streams that pull interleaved f32 audio from a render callback.
//! Streams are opened, started and dropped on the engine's stream thread, so they need not be
//! `Send`.

use std::fmt;
use std::sync::Arc;

pub mod cpal;
pub mod error;
pub mod mock;
pub mod thread_priority;

pub use error::AudioError;

/// Fills an interleaved output buffer. Runs on the device's real-time thread.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Receives stream-fatal errors, possibly on a device thread.
pub type ErrorCallback = Box<dyn FnMut(AudioError) + Send + 'static>;

/// What the engine asks a backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub channels: u16,
    /// Preferred rate. The device default is used when unset or unsupported.
    pub sample_rate: Option<u32>,
    /// Buffer size as a multiple of the device burst.
    pub buffer_bursts: u32,
    /// Largest multiple the latency tuner may grow the buffer to.
    pub max_buffer_bursts: u32,
    /// Burst assumed when the device does not report one.
    pub burst_frames: u32,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: None,
            buffer_bursts: 2,
            max_buffer_bursts: 8,
            burst_frames: 192,
        }
    }
}

/// The stream a backend actually opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub burst_frames: u32,
    pub buffer_frames: u32,
}

pub trait Backend: fmt::Display + Send + Sync {
    /// Opens a stopped output stream.
    fn open(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputStream>, AudioError>;
}

pub trait OutputStream {
    fn info(&self) -> StreamInfo;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;
}

/// An output device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub host: String,
    pub max_channels: u16,
    pub default_sample_rate: Option<u32>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name, self.max_channels, self.host
        )?;
        if let Some(rate) = self.default_sample_rate {
            write!(f, " {}Hz", rate)?;
        }
        Ok(())
    }
}

/// Lists output devices known to cpal.
pub fn list_devices() -> Result<Vec<DeviceInfo>, AudioError> {
    cpal::Backend::list()
}

/// Gets the backend for the given device name.
pub fn get_backend(device: &str) -> Arc<dyn Backend> {
    if device.starts_with("mock") {
        return Arc::new(mock::Backend::new(device));
    }
    Arc::new(cpal::Backend::new(device))
}
