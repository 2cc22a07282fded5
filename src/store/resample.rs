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
//! Offline conversion of a [`SampleStore`] to the device rate.
//!
//! Runs on the loading thread. The whole store is converted up front so the render callback
//! never resamples.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use super::{SampleStore, StoreError};

/// Input block size for the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

impl SampleStore {
    /// Returns this store converted to `target_rate`. Stores already at the target rate, empty
    /// stores and stores without a known rate are returned unchanged.
    pub fn resampled(self, target_rate: u32) -> Result<SampleStore, StoreError> {
        if target_rate == 0
            || self.sample_rate == 0
            || self.sample_rate == target_rate
            || self.is_empty()
        {
            return Ok(self);
        }

        let source_rate = self.sample_rate;
        let failed = |_| StoreError::ResamplingFailed(source_rate, target_rate);
        let channels = self.channels as usize;
        let frames = self.frame_count();

        let sinc_params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            oversampling_factor: 128,
            interpolation: SincInterpolationType::Linear,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = target_rate as f64 / source_rate as f64;
        let mut resampler =
            SincFixedIn::<f32>::new(ratio, 1.0, sinc_params, INPUT_BLOCK_SIZE, channels)
                .map_err(|_| StoreError::ResamplingFailed(source_rate, target_rate))?;

        let planar = deinterleave(&self.samples, channels);
        let expected = (frames as f64 * ratio).round() as usize;
        let delay = resampler.output_delay();

        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];
        let mut scratch = resampler.output_buffer_allocate(true);

        let mut position = 0;
        while frames - position >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let block: Vec<&[f32]> = planar
                .iter()
                .map(|channel| &channel[position..position + needed])
                .collect();
            let (consumed, produced) = resampler
                .process_into_buffer(&block, &mut scratch, None)
                .map_err(failed)?;
            append_planar(&mut output, &scratch, produced);
            position += consumed;
        }

        if position < frames {
            let block: Vec<&[f32]> = planar.iter().map(|channel| &channel[position..]).collect();
            let (_, produced) = resampler
                .process_partial_into_buffer(Some(block.as_slice()), &mut scratch, None)
                .map_err(failed)?;
            append_planar(&mut output, &scratch, produced);
        }

        // Flush the filter's delay line.
        while output[0].len() < expected + delay {
            let (_, produced) = resampler
                .process_partial_into_buffer(None::<&[&[f32]]>, &mut scratch, None)
                .map_err(failed)?;
            if produced == 0 {
                break;
            }
            append_planar(&mut output, &scratch, produced);
        }

        let available = output[0].len().saturating_sub(delay).min(expected);
        let mut samples = Vec::with_capacity(available * channels);
        for frame in delay..delay + available {
            for channel in &output {
                samples.push(channel[frame]);
            }
        }

        debug!(
            source_rate,
            target_rate,
            frames_in = frames,
            frames_out = available,
            "Resampled store"
        );
        SampleStore::new(samples, self.channels, target_rate)
    }
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (channel, sample) in planar.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }
    planar
}

fn append_planar(output: &mut [Vec<f32>], scratch: &[Vec<f32>], frames: usize) {
    for (out, produced) in output.iter_mut().zip(scratch) {
        out.extend_from_slice(&produced[..frames]);
    }
}
