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
//! Decoded PCM storage consumed by voices.
//!
//! A [`SampleStore`] is immutable once built. It holds interleaved f32 samples for a
//! mono or stereo source along with the rate they were decoded (or resampled) at.

use std::path::Path;
use std::time::Duration;

pub mod decode;
pub mod error;
pub mod resample;

pub use error::StoreError;

/// Interleaved, single-precision PCM with its metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleStore {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl SampleStore {
    /// Builds a store from interleaved samples. Only mono and stereo sources are accepted,
    /// and the sample count must be a whole number of frames.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self, StoreError> {
        if !(1..=2).contains(&channels) {
            return Err(StoreError::UnsupportedChannels(channels));
        }
        if samples.len() % channels as usize != 0 {
            return Err(StoreError::MisalignedFrames {
                len: samples.len(),
                channels,
            });
        }

        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Decodes a WAV container held in memory.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        decode::decode_wav_bytes(bytes)
    }

    /// Decodes an MP3 stream from disk.
    pub fn from_mp3_file(path: &Path) -> Result<Self, StoreError> {
        decode::decode_mp3_file(path)
    }

    /// Decodes any supported format from disk, guessing the container from the extension.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        decode::decode_file(path)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channel_count(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total interleaved samples (frames × channels).
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length at the store's own rate. Zero if the rate is unknown.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    /// Bytes held by the sample data.
    pub fn memory_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SampleStore, StoreError};

    #[test]
    fn rejects_more_than_two_channels() {
        let result = SampleStore::new(vec![0.0; 12], 3, 44100);
        assert!(matches!(result, Err(StoreError::UnsupportedChannels(3))));
        let result = SampleStore::new(vec![], 0, 44100);
        assert!(matches!(result, Err(StoreError::UnsupportedChannels(0))));
    }

    #[test]
    fn rejects_partial_frames() {
        let result = SampleStore::new(vec![0.0; 5], 2, 44100);
        assert!(matches!(
            result,
            Err(StoreError::MisalignedFrames { len: 5, channels: 2 })
        ));
    }

    #[test]
    fn metadata() {
        let store = SampleStore::new(vec![0.5; 88200], 2, 44100).unwrap();
        assert_eq!(2, store.channel_count());
        assert_eq!(44100, store.sample_rate());
        assert_eq!(88200, store.num_samples());
        assert_eq!(44100, store.frame_count());
        assert_eq!(Duration::from_secs(1), store.duration());
        assert_eq!(88200 * 4, store.memory_size());
        assert!(!store.is_empty());

        let empty = SampleStore::new(vec![], 1, 0).unwrap();
        assert!(empty.is_empty());
        assert_eq!(Duration::ZERO, empty.duration());
    }
}
