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
//! Tempo and pitch scaling for a single interleaved stream.
//!
//! Wraps signalsmith-stretch behind a push/pull FIFO so a voice can feed exactly the raw input
//! a render period needs and read back a fixed number of output frames. At unity tempo with no
//! transposition the stretcher is bypassed and input is passed through unchanged, unless the
//! owner asks for it to stay engaged so its latency matches other processors that are
//! stretching.

use signalsmith_stretch::Stretch;

/// Slowest supported tempo ratio.
pub const MIN_TEMPO_RATIO: f64 = 0.5;
/// Fastest supported tempo ratio.
pub const MAX_TEMPO_RATIO: f64 = 2.0;
/// Largest transposition in either direction.
pub const MAX_PITCH_SEMITONES: f64 = 12.0;

/// A push/pull time-stretch processor bound to one rate and channel count.
///
/// Input is queued with [`push`](Self::push) and processed output is drained with
/// [`pull`](Self::pull). The tempo ratio is input frames consumed per output frame, so a ratio
/// of 2.0 plays twice as fast. Running short of input is normal: `pull` returns fewer frames
/// and the caller pads.
pub struct TimeStretchProcessor {
    stretcher: Stretch,
    sample_rate: u32,
    channels: usize,
    tempo_ratio: f64,
    pitch_semitones: f64,
    /// Interleaved input not yet consumed, starting at `read_pos`.
    input: Vec<f32>,
    read_pos: usize,
    /// Fractional input frame carried between pulls so pacing stays exact over time.
    phase: f64,
    /// Whether the stretcher has been fed since its last reset.
    engaged: bool,
    passthrough_allowed: bool,
}

impl TimeStretchProcessor {
    /// Creates a processor with room for `capacity_frames` of queued input before the FIFO has to
    /// grow.
    pub fn new(sample_rate: u32, channels: u16, capacity_frames: usize) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            stretcher: Stretch::preset_default(channels as u32, sample_rate.max(1)),
            sample_rate,
            channels,
            tempo_ratio: 1.0,
            pitch_semitones: 0.0,
            input: Vec::with_capacity(capacity_frames * channels),
            read_pos: 0,
            phase: 0.0,
            engaged: false,
            passthrough_allowed: true,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn tempo_ratio(&self) -> f64 {
        self.tempo_ratio
    }

    pub fn pitch_semitones(&self) -> f64 {
        self.pitch_semitones
    }

    /// Sets the tempo ratio, clamped to the supported range. Buffered input is kept.
    /// Non-finite or non-positive ratios are ignored.
    pub fn set_tempo_ratio(&mut self, ratio: f64) {
        if !ratio.is_finite() || ratio <= 0.0 {
            return;
        }
        self.tempo_ratio = ratio.clamp(MIN_TEMPO_RATIO, MAX_TEMPO_RATIO);
    }

    /// Sets the transposition in semitones, clamped to one octave either way. Buffered input is
    /// kept. Non-finite values are ignored.
    pub fn set_pitch_semitones(&mut self, semitones: f64) {
        if !semitones.is_finite() {
            return;
        }
        self.pitch_semitones = semitones.clamp(-MAX_PITCH_SEMITONES, MAX_PITCH_SEMITONES);
        self.stretcher
            .set_transpose_factor_semitones(self.pitch_semitones as f32, None);
    }

    /// Allows or forbids the unity pass-through. While forbidden, unity settings still run
    /// through the stretcher and carry its latency.
    pub fn set_passthrough_allowed(&mut self, allowed: bool) {
        self.passthrough_allowed = allowed;
    }

    /// True when output is a straight copy of input.
    pub fn is_bypassed(&self) -> bool {
        self.passthrough_allowed && self.tempo_ratio == 1.0 && self.pitch_semitones == 0.0
    }

    /// Queues interleaved input. Any trailing partial frame is dropped.
    pub fn push(&mut self, interleaved: &[f32]) {
        if self.read_pos > 0 {
            self.input.copy_within(self.read_pos.., 0);
            self.input.truncate(self.input.len() - self.read_pos);
            self.read_pos = 0;
        }
        let whole = interleaved.len() - interleaved.len() % self.channels;
        self.input.extend_from_slice(&interleaved[..whole]);
    }

    /// Queues `frames` frames of silence, used to drain the stretcher after the last real input.
    pub fn push_silence(&mut self, frames: usize) {
        self.push(&[]);
        self.input.resize(self.input.len() + frames * self.channels, 0.0);
    }

    /// Raw input frames queued and not yet consumed.
    pub fn queued_frames(&self) -> usize {
        (self.input.len() - self.read_pos) / self.channels
    }

    /// Output frames that can be pulled right now.
    pub fn available_frames(&self) -> usize {
        let queued = self.queued_frames();
        if self.is_bypassed() {
            return queued;
        }
        ((queued as f64 - self.phase).max(0.0) / self.tempo_ratio).floor() as usize
    }

    /// Input frames that still need to be pushed before `output_frames` can be pulled.
    pub fn input_frames_needed(&self, output_frames: usize) -> usize {
        let queued = self.queued_frames();
        if self.is_bypassed() {
            return output_frames.saturating_sub(queued);
        }
        let required = (output_frames as f64 * self.tempo_ratio + self.phase).ceil() as usize;
        required.saturating_sub(queued)
    }

    /// Writes up to `max_frames` processed frames into `output` and returns how many were written.
    /// The rest of `output` is left untouched.
    pub fn pull(&mut self, output: &mut [f32], max_frames: usize) -> usize {
        let channels = self.channels;
        let frames = max_frames
            .min(output.len() / channels)
            .min(self.available_frames());
        if frames == 0 {
            return 0;
        }
        let out = &mut output[..frames * channels];

        if self.is_bypassed() {
            self.engaged = false;
            self.phase = 0.0;
            let end = self.read_pos + frames * channels;
            out.copy_from_slice(&self.input[self.read_pos..end]);
            self.read_pos = end;
        } else {
            if !self.engaged {
                self.stretcher.reset();
                self.engaged = true;
            }
            let exact = frames as f64 * self.tempo_ratio + self.phase;
            let consume = (exact.floor() as usize).min(self.queued_frames());
            self.phase = (exact - consume as f64).min(1.0);
            let end = self.read_pos + consume * channels;
            self.stretcher.process(&self.input[self.read_pos..end], out);
            self.read_pos = end;
        }

        if self.read_pos == self.input.len() {
            self.input.clear();
            self.read_pos = 0;
        }
        frames
    }

    /// Discards queued input and the stretcher's internal state.
    pub fn reset(&mut self) {
        self.stretcher.reset();
        self.input.clear();
        self.read_pos = 0;
        self.phase = 0.0;
        self.engaged = false;
    }

    /// Latency of the stretcher in frames while it is engaged.
    pub fn latency_frames(&self) -> usize {
        self.stretcher.input_latency() + self.stretcher.output_latency()
    }

    /// Output frames still held inside the stretcher once input stops, or 0 when bypassed.
    pub fn tail_frames(&self) -> usize {
        if self.is_bypassed() {
            return 0;
        }
        let input = self.stretcher.input_latency() as f64 / self.tempo_ratio;
        input.ceil() as usize + self.stretcher.output_latency()
    }
}
