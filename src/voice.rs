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
//! Sample playback voices.
//!
//! A voice is split in two. [`VoiceControl`] is shared between the control threads and the
//! audio callback and holds every parameter as an atomic. [`Voice`] is the render half: it
//! owns the sample data and the time-stretch processor and is only ever touched by the
//! thread that renders it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::store::SampleStore;
use crate::stretch::TimeStretchProcessor;
use crate::util::{AtomicF32, AtomicF32Pair, AtomicF64};

/// Tempo and transposition shared by every voice in the ensemble.
#[derive(Debug)]
pub struct EnsembleParams {
    tempo_ratio: AtomicF64,
    pitch_semitones: AtomicF64,
}

impl EnsembleParams {
    pub fn new() -> Self {
        Self {
            tempo_ratio: AtomicF64::new(1.0),
            pitch_semitones: AtomicF64::new(0.0),
        }
    }

    pub fn tempo_ratio(&self) -> f64 {
        self.tempo_ratio.load()
    }

    pub fn set_tempo_ratio(&self, ratio: f64) {
        self.tempo_ratio.store(ratio)
    }

    pub fn pitch_semitones(&self) -> f64 {
        self.pitch_semitones.load()
    }

    pub fn set_pitch_semitones(&self, semitones: f64) {
        self.pitch_semitones.store(semitones)
    }

    /// True when any voice's audio has to go through a stretcher.
    pub fn is_stretched(&self) -> bool {
        self.tempo_ratio() != 1.0 || self.pitch_semitones() != 0.0
    }
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes (left, right) coefficients for a pan position in [-1, 1].
pub fn pan_coefficients(gain: f32, pan: f32) -> (f32, f32) {
    let right = 0.5 * pan + 0.5;
    (gain * (1.0 - right), gain * right)
}

#[derive(Debug, Clone, Copy)]
struct PanGain {
    pan: f32,
    gain: f32,
}

/// The shared half of a voice.
///
/// Positions are interleaved sample indices into the voice's store. For stereo stores they are
/// always frame aligned.
#[derive(Debug)]
pub struct VoiceControl {
    sample_rate: u32,
    channels: u16,
    num_samples: usize,
    /// Writers serialize here so the published coefficients always match (pan, gain).
    params: Mutex<PanGain>,
    gain: AtomicF32,
    coefficients: AtomicF32Pair,
    playing: AtomicBool,
    cursor: AtomicUsize,
    /// Bumped on every play, stop and seek. The render half resets its processor when it sees a
    /// new value.
    epoch: AtomicU32,
    pitch_exempt: AtomicBool,
}

impl VoiceControl {
    fn new(store: &SampleStore, pan: f32) -> Self {
        let pan = sanitize_pan(pan);
        let (left, right) = pan_coefficients(1.0, pan);
        Self {
            sample_rate: store.sample_rate(),
            channels: store.channel_count(),
            num_samples: store.num_samples(),
            params: Mutex::new(PanGain { pan, gain: 1.0 }),
            gain: AtomicF32::new(1.0),
            coefficients: AtomicF32Pair::new(left, right),
            playing: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
            epoch: AtomicU32::new(0),
            pitch_exempt: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels
    }

    /// Total interleaved samples in the store.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn pan(&self) -> f32 {
        self.params.lock().pan
    }

    pub fn gain(&self) -> f32 {
        self.params.lock().gain
    }

    /// The (left, right) coefficients currently applied by the mixer.
    pub fn coefficients(&self) -> (f32, f32) {
        self.coefficients.load()
    }

    /// Sets the pan position, clamped to [-1, 1], and recomputes the coefficients.
    pub fn set_pan(&self, pan: f32) {
        let mut params = self.params.lock();
        params.pan = sanitize_pan(pan);
        self.publish(&params);
    }

    /// Sets the gain, floored at zero, and recomputes the coefficients.
    pub fn set_gain(&self, gain: f32) {
        let mut params = self.params.lock();
        params.gain = if gain.is_nan() { 0.0 } else { gain.max(0.0) };
        self.publish(&params);
    }

    fn publish(&self, params: &PanGain) {
        let (left, right) = pan_coefficients(params.gain, params.pan);
        self.gain.store(params.gain);
        self.coefficients.store(left, right);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Current playback position in interleaved samples.
    pub fn current_sample_index(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Starts playback from `start_sample`, clamped to the last frame and aligned down to a frame
    /// boundary. Does nothing for an empty store.
    pub fn play(&self, start_sample: usize) {
        if self.num_samples == 0 {
            return;
        }
        self.cursor
            .store(self.clamp_position(start_sample), Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.playing.store(true, Ordering::Release);
    }

    /// Starts playback at the same frame as a reference position taken from a store with
    /// `reference_channels` channels.
    pub fn play_from_reference(&self, reference_sample: usize, reference_channels: u16) {
        self.play(self.convert_reference(reference_sample, reference_channels));
    }

    /// Translates a position in another store's sample units into this store's.
    pub fn convert_reference(&self, reference_sample: usize, reference_channels: u16) -> usize {
        let frame = reference_sample / reference_channels.max(1) as usize;
        frame * self.channels as usize
    }

    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Moves the cursor to `seconds`, clamped to the store. Does not change the playing state.
    pub fn set_current_time(&self, seconds: f64) {
        let Some(per_second) = self.samples_per_second() else {
            warn!("Cannot seek a voice without a sample rate");
            return;
        };
        if self.num_samples == 0 {
            return;
        }
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let position = (seconds * per_second).round() as usize;
        self.cursor
            .store(self.clamp_position(position), Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Current playback position in seconds.
    pub fn current_time(&self) -> f64 {
        match self.samples_per_second() {
            Some(per_second) => self.current_sample_index() as f64 / per_second,
            None => {
                warn!("Voice has no sample rate, reporting time 0");
                0.0
            }
        }
    }

    /// Length of the store in seconds.
    pub fn total_length(&self) -> f64 {
        match self.samples_per_second() {
            Some(per_second) => self.num_samples as f64 / per_second,
            None => {
                warn!("Voice has no sample rate, reporting length 0");
                0.0
            }
        }
    }

    pub fn set_pitch_exempt(&self, exempt: bool) {
        self.pitch_exempt.store(exempt, Ordering::Release);
    }

    pub fn is_pitch_exempt(&self) -> bool {
        self.pitch_exempt.load(Ordering::Acquire)
    }

    fn samples_per_second(&self) -> Option<f64> {
        (self.sample_rate > 0).then(|| self.sample_rate as f64 * self.channels as f64)
    }

    fn clamp_position(&self, position: usize) -> usize {
        let channels = self.channels as usize;
        let last_frame = self.num_samples.saturating_sub(channels);
        let position = position.min(last_frame);
        position - position % channels
    }
}

fn sanitize_pan(pan: f32) -> f32 {
    if pan.is_nan() {
        0.0
    } else {
        pan.clamp(-1.0, 1.0)
    }
}

/// The render half of a voice.
pub struct Voice {
    control: Arc<VoiceControl>,
    store: SampleStore,
    processor: TimeStretchProcessor,
    /// Processed frames for one block, interleaved at the store's channel count.
    scratch: Vec<f32>,
    max_block_frames: usize,
    applied_epoch: u32,
    applied_tempo: f64,
    applied_pitch: f64,
    /// Output frames left to drain from the stretcher after the store ran out.
    tail_remaining: usize,
}

impl Voice {
    /// Creates a stopped voice at unity gain. `max_block_frames` sizes the render buffers so
    /// mixing never allocates.
    pub fn new(store: SampleStore, pan: f32, max_block_frames: usize) -> Self {
        let max_block_frames = max_block_frames.max(1);
        let channels = store.channel_count();
        let control = Arc::new(VoiceControl::new(&store, pan));
        let processor =
            TimeStretchProcessor::new(store.sample_rate(), channels, 2 * max_block_frames + 2);
        Self {
            control,
            scratch: vec![0.0; max_block_frames * channels as usize],
            store,
            processor,
            max_block_frames,
            applied_epoch: 0,
            applied_tempo: 1.0,
            applied_pitch: 0.0,
            tail_remaining: 0,
        }
    }

    pub fn control(&self) -> &Arc<VoiceControl> {
        &self.control
    }

    pub fn processor(&self) -> &TimeStretchProcessor {
        &self.processor
    }

    /// Plays from `start_sample` and drops any processed audio left from before.
    pub fn play(&mut self, start_sample: usize) {
        self.control.play(start_sample);
        self.reset_processor();
    }

    /// Stops and drops any processed audio so the next play starts clean.
    pub fn stop(&mut self) {
        self.control.stop();
        self.reset_processor();
    }

    fn reset_processor(&mut self) {
        self.processor.reset();
        self.tail_remaining = 0;
        self.applied_epoch = self.control.epoch.load(Ordering::Acquire);
    }

    /// Applies control changes made since the last render.
    pub fn sync(&mut self, params: &EnsembleParams) {
        let epoch = self.control.epoch.load(Ordering::Acquire);
        if epoch != self.applied_epoch {
            self.processor.reset();
            self.tail_remaining = 0;
            self.applied_epoch = epoch;
        }

        // Exempt voices share the latency of the shifted ones.
        self.processor.set_passthrough_allowed(!params.is_stretched());

        let tempo = params.tempo_ratio();
        if tempo != self.applied_tempo {
            self.processor.set_tempo_ratio(tempo);
            self.applied_tempo = tempo;
        }

        let pitch = if self.control.is_pitch_exempt() {
            0.0
        } else {
            params.pitch_semitones()
        };
        if pitch != self.applied_pitch {
            self.processor.set_pitch_semitones(pitch);
            self.applied_pitch = pitch;
        }
    }

    /// Adds `frames` frames of this voice into `out`, which is interleaved with `out_channels`
    /// channels. Output channels past the second are left alone. Advances the cursor by the raw
    /// input consumed. When the store runs out the stretcher's tail is drained, if it is engaged,
    /// and then the voice stops.
    pub fn mix(
        &mut self,
        out: &mut [f32],
        out_channels: usize,
        frames: usize,
        params: &EnsembleParams,
    ) {
        if !self.control.is_playing() || out_channels == 0 {
            return;
        }
        self.sync(params);

        let frames = frames.min(out.len() / out_channels);
        let mut done = 0;
        while done < frames {
            let block = (frames - done).min(self.max_block_frames);
            let region = &mut out[done * out_channels..(done + block) * out_channels];
            if !self.mix_block(region, out_channels, block) {
                break;
            }
            done += block;
        }
    }

    fn mix_block(&mut self, out: &mut [f32], out_channels: usize, frames: usize) -> bool {
        let control = &*self.control;
        if !control.is_playing() {
            return false;
        }

        let channels = self.store.channel_count() as usize;
        let num_samples = self.store.num_samples();
        let cursor = control.current_sample_index();
        let remaining_frames = num_samples.saturating_sub(cursor) / channels;
        if remaining_frames == 0 {
            return self.drain_block(out, out_channels, frames);
        }

        let push_frames = remaining_frames.min(self.processor.input_frames_needed(frames));
        let push_end = cursor + push_frames * channels;
        self.processor.push(&self.store.samples()[cursor..push_end]);

        let scratch = &mut self.scratch[..frames * channels];
        scratch.fill(0.0);
        let pulled = self.processor.pull(scratch, frames);
        add_scaled(out, out_channels, &scratch[..pulled * channels], channels, control);

        // A position written by the control side since the load above wins.
        if control
            .cursor
            .compare_exchange(cursor, push_end, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && push_end >= num_samples
        {
            self.tail_remaining = self.processor.tail_frames();
            if self.tail_remaining == 0 {
                control.playing.store(false, Ordering::Release);
                return false;
            }
        }
        true
    }

    /// Feeds silence through the stretcher to flush out the audio it still holds.
    fn drain_block(&mut self, out: &mut [f32], out_channels: usize, frames: usize) -> bool {
        let control = &*self.control;
        let frames = frames.min(self.tail_remaining);
        if frames == 0 {
            control.playing.store(false, Ordering::Release);
            return false;
        }

        let channels = self.store.channel_count() as usize;
        let needed = self.processor.input_frames_needed(frames);
        self.processor.push_silence(needed);
        let scratch = &mut self.scratch[..frames * channels];
        scratch.fill(0.0);
        let pulled = self.processor.pull(scratch, frames);
        add_scaled(out, out_channels, &scratch[..pulled * channels], channels, control);

        self.tail_remaining -= frames;
        if self.tail_remaining == 0 {
            control.playing.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

/// Adds processed frames into `out` using the voice's current gain and coefficients.
fn add_scaled(
    out: &mut [f32],
    out_channels: usize,
    processed: &[f32],
    channels: usize,
    control: &VoiceControl,
) {
    let gain = control.gain.load();
    let (left, right) = control.coefficients();
    match (channels, out_channels) {
        (1, 1) => {
            for (out, sample) in out.iter_mut().zip(processed) {
                *out += sample * gain;
            }
        }
        (1, _) => {
            for (out, sample) in out.chunks_exact_mut(out_channels).zip(processed) {
                out[0] += sample * left;
                out[1] += sample * right;
            }
        }
        (_, 1) => {
            for (out, frame) in out.iter_mut().zip(processed.chunks_exact(2)) {
                *out += frame[0] * left + frame[1] * right;
            }
        }
        _ => {
            for (out, frame) in out
                .chunks_exact_mut(out_channels)
                .zip(processed.chunks_exact(2))
            {
                out[0] += frame[0] * left;
                out[1] += frame[1] * right;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{pan_coefficients, EnsembleParams, Voice};
    use crate::store::SampleStore;
    use crate::testutil::audio_test_utils::{calculate_rms, sine};

    fn mono(value: f32, frames: usize) -> SampleStore {
        SampleStore::new(vec![value; frames], 1, 44100).unwrap()
    }

    fn stereo(left: f32, right: f32, frames: usize) -> SampleStore {
        let samples = (0..frames).flat_map(|_| [left, right]).collect();
        SampleStore::new(samples, 2, 44100).unwrap()
    }

    #[test]
    fn pan_is_clamped_and_midpoint_halves_gain() {
        let voice = Voice::new(mono(0.0, 16), 0.0, 64);
        let control = voice.control();
        assert_eq!((0.5, 0.5), control.coefficients());

        control.set_pan(3.0);
        assert_eq!(1.0, control.pan());
        assert_eq!((0.0, 1.0), control.coefficients());

        control.set_pan(-7.5);
        assert_eq!(-1.0, control.pan());
        assert_eq!((1.0, 0.0), control.coefficients());

        control.set_pan(f32::NAN);
        assert_eq!(0.0, control.pan());
    }

    #[test]
    fn every_setter_recomputes_coefficients() {
        let voice = Voice::new(mono(0.0, 16), 0.5, 64);
        let control = voice.control();
        assert_eq!(pan_coefficients(1.0, 0.5), control.coefficients());

        control.set_gain(0.4);
        assert_eq!(pan_coefficients(0.4, 0.5), control.coefficients());
        control.set_pan(-0.5);
        assert_eq!(pan_coefficients(0.4, -0.5), control.coefficients());
        control.set_gain(-2.0);
        assert_eq!(0.0, control.gain());
        assert_eq!((0.0, 0.0), control.coefficients());
    }

    #[test]
    fn play_clamps_and_aligns() {
        let voice = Voice::new(stereo(0.1, 0.2, 100), 0.0, 64);
        let control = voice.control();

        control.play(7);
        assert!(control.is_playing());
        assert_eq!(6, control.current_sample_index());

        control.play(10_000);
        assert_eq!(198, control.current_sample_index());

        control.stop();
        assert!(!control.is_playing());
    }

    #[test]
    fn play_on_empty_store_is_ignored() {
        let voice = Voice::new(SampleStore::new(vec![], 2, 44100).unwrap(), 0.0, 64);
        voice.control().play(0);
        assert!(!voice.control().is_playing());
    }

    #[test]
    fn reference_positions_are_converted_by_frame() {
        let mono_voice = Voice::new(mono(0.0, 1000), 0.0, 64);
        let stereo_voice = Voice::new(stereo(0.0, 0.0, 1000), 0.0, 64);

        mono_voice.control().play_from_reference(400, 2);
        assert_eq!(200, mono_voice.control().current_sample_index());

        stereo_voice.control().play_from_reference(200, 1);
        assert_eq!(400, stereo_voice.control().current_sample_index());

        stereo_voice.control().play_from_reference(401, 2);
        assert_eq!(400, stereo_voice.control().current_sample_index());
    }

    #[test]
    fn stop_then_play_leaves_no_backlog() {
        let params = EnsembleParams::new();
        params.set_tempo_ratio(1.5);
        let mut voice = Voice::new(mono(0.3, 44100), 0.0, 256);
        voice.play(0);

        let mut out = vec![0.0; 101];
        voice.mix(&mut out, 1, 101, &params);
        assert!(voice.processor().queued_frames() > 0);

        voice.stop();
        voice.play(0);
        assert_eq!(0, voice.processor().queued_frames());
        assert_eq!(0, voice.processor().available_frames());
    }

    #[test]
    fn control_side_restart_resets_on_next_render() {
        let params = EnsembleParams::new();
        params.set_tempo_ratio(1.5);
        let mut voice = Voice::new(mono(0.3, 44100), 0.0, 256);
        voice.play(0);

        let mut out = vec![0.0; 101];
        voice.mix(&mut out, 1, 101, &params);
        assert!(voice.processor().queued_frames() > 0);

        voice.control().stop();
        voice.control().play(0);
        voice.sync(&params);
        assert_eq!(0, voice.processor().queued_frames());
    }

    #[test]
    fn silent_voice_leaves_output_unchanged() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(mono(0.9, 1000), 0.0, 64);
        let mut out: Vec<f32> = (0..128).map(|i| i as f32 * 0.01).collect();
        let before = out.clone();
        voice.mix(&mut out, 2, 64, &params);
        assert_eq!(before, out);
        assert_eq!(0, voice.control().current_sample_index());
    }

    #[test]
    fn seek_round_trips_within_a_sample() {
        let voice = Voice::new(stereo(0.0, 0.0, 44100 * 3), 0.0, 64);
        let control = voice.control();
        let period = 1.0 / 44100.0;
        for t in [0.0, 0.25, 1.0, 1.333, 2.9999, 3.0] {
            control.set_current_time(t);
            let got = control.current_time();
            assert!((got - t).abs() <= period + 1e-12, "{} -> {}", t, got);
            assert_eq!(0, control.current_sample_index() % 2);
        }

        control.set_current_time(-5.0);
        assert_eq!(0.0, control.current_time());
        assert!((control.total_length() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_sample_rate_reports_zero() {
        let voice = Voice::new(SampleStore::new(vec![0.0; 100], 1, 0).unwrap(), 0.0, 64);
        let control = voice.control();
        control.set_current_time(1.0);
        assert_eq!(0, control.current_sample_index());
        assert_eq!(0.0, control.current_time());
        assert_eq!(0.0, control.total_length());
    }

    #[test]
    fn mono_into_stereo_is_half_amplitude() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(mono(0.8, 1000), 0.0, 64);
        voice.play(0);

        let mut out = vec![0.0; 128];
        voice.mix(&mut out, 2, 64, &params);
        assert!(out.iter().all(|s| (s - 0.4).abs() < 1e-6));
        assert_eq!(64, voice.control().current_sample_index());
    }

    #[test]
    fn mixing_is_additive() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(mono(0.5, 100), 0.0, 64);
        voice.play(0);
        let mut out = vec![0.25; 10];
        voice.mix(&mut out, 1, 10, &params);
        assert!(out.iter().all(|s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn stereo_sources_follow_coefficients() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(stereo(0.2, 0.6, 100), 1.0, 64);
        voice.play(0);
        let mut out = vec![0.0; 20];
        voice.mix(&mut out, 2, 10, &params);
        for frame in out.chunks_exact(2) {
            assert_eq!(0.0, frame[0]);
            assert!((frame[1] - 0.6).abs() < 1e-6);
        }

        let mut voice = Voice::new(stereo(0.2, 0.6, 100), 0.0, 64);
        voice.play(0);
        let mut out = vec![0.0; 10];
        voice.mix(&mut out, 1, 10, &params);
        assert!(out.iter().all(|s| (s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn wide_outputs_only_use_the_first_two_channels() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(mono(1.0, 100), -1.0, 64);
        voice.play(0);
        let mut out = vec![0.0; 40];
        voice.mix(&mut out, 4, 10, &params);
        for frame in out.chunks_exact(4) {
            assert_eq!([1.0, 0.0, 0.0, 0.0], frame);
        }
    }

    #[test]
    fn ten_second_voice_ends_exactly_at_frame_count() {
        let params = EnsembleParams::new();
        let frames = 44100 * 10;
        let mut voice = Voice::new(mono(0.1, frames), 0.0, 512);
        voice.play(0);

        let mut out = vec![0.0; 512];
        let mut last = voice.control().current_sample_index();
        let mut periods = 0;
        while voice.control().is_playing() {
            voice.mix(&mut out, 1, 512, &params);
            let cursor = voice.control().current_sample_index();
            assert!(cursor > last, "cursor stalled at {}", cursor);
            assert!(cursor <= frames);
            assert_eq!(cursor == frames, !voice.control().is_playing());
            last = cursor;
            periods += 1;
        }
        assert_eq!(frames, last);
        assert_eq!((frames + 511) / 512, periods);

        // An exhausted voice contributes nothing further.
        out.fill(0.0);
        voice.mix(&mut out, 1, 512, &params);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(frames, voice.control().current_sample_index());
    }

    #[test]
    fn large_periods_are_split_into_blocks() {
        let params = EnsembleParams::new();
        let mut voice = Voice::new(mono(0.5, 1000), 0.0, 64);
        voice.play(0);
        let mut out = vec![0.0; 300];
        voice.mix(&mut out, 1, 300, &params);
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
        assert_eq!(300, voice.control().current_sample_index());
    }

    #[test]
    fn faster_tempo_consumes_more_input() {
        let params = EnsembleParams::new();
        params.set_tempo_ratio(2.0);
        let mut voice = Voice::new(mono(0.5, 44100), 0.0, 512);
        voice.play(0);
        let mut out = vec![0.0; 512];
        for _ in 0..10 {
            out.fill(0.0);
            voice.mix(&mut out, 1, 512, &params);
        }
        assert_eq!(10 * 1024, voice.control().current_sample_index());
        assert_eq!(2.0, voice.processor().tempo_ratio());
    }

    #[test]
    fn pitch_exempt_voices_ignore_transposition() {
        let params = EnsembleParams::new();
        params.set_pitch_semitones(5.0);
        let mut voice = Voice::new(mono(0.5, 4410), 0.0, 64);
        voice.control().set_pitch_exempt(true);
        voice.sync(&params);
        assert_eq!(0.0, voice.processor().pitch_semitones());

        voice.control().set_pitch_exempt(false);
        voice.sync(&params);
        assert_eq!(5.0, voice.processor().pitch_semitones());
    }

    fn first_audible_frame(voice: &mut Voice, params: &EnsembleParams) -> Option<usize> {
        voice.play(0);
        let mut rendered = vec![0.0; 512 * 24];
        for block in rendered.chunks_exact_mut(512) {
            voice.mix(block, 1, 512, params);
        }
        rendered.iter().position(|s| s.abs() > 0.01)
    }

    #[test]
    fn pitch_exempt_voices_stay_aligned_with_shifted_ones() {
        let params = EnsembleParams::new();
        params.set_pitch_semitones(5.0);
        let source = sine(440.0, 0.5, 44100, 44100);
        let mut shifted = Voice::new(SampleStore::new(source.clone(), 1, 44100).unwrap(), 0.0, 512);
        let mut exempt = Voice::new(SampleStore::new(source, 1, 44100).unwrap(), 0.0, 512);
        exempt.control().set_pitch_exempt(true);

        let shifted_onset = first_audible_frame(&mut shifted, &params).unwrap();
        let exempt_onset = first_audible_frame(&mut exempt, &params).unwrap();
        assert!(!exempt.processor().is_bypassed());
        assert_eq!(0.0, exempt.processor().pitch_semitones());

        let latency = exempt.processor().latency_frames();
        assert!(exempt_onset > 64, "exempt voice skipped the stretcher");
        assert!(
            shifted_onset.abs_diff(exempt_onset) < latency / 4,
            "onsets {} and {} with latency {}",
            shifted_onset,
            exempt_onset,
            latency
        );
    }

    #[test]
    fn unstretched_ensemble_passes_through() {
        let params = EnsembleParams::new();
        let store = SampleStore::new(sine(440.0, 0.5, 44100, 4410), 1, 44100).unwrap();
        let mut voice = Voice::new(store, 0.0, 512);
        voice.control().set_pitch_exempt(true);
        assert_eq!(Some(1), first_audible_frame(&mut voice, &params));
        assert!(voice.processor().is_bypassed());
    }

    #[test]
    fn stretched_voice_drains_its_tail_before_stopping() {
        let params = EnsembleParams::new();
        params.set_tempo_ratio(1.5);
        let frames = 8820;
        let store = SampleStore::new(sine(440.0, 0.5, 44100, frames), 1, 44100).unwrap();
        let mut voice = Voice::new(store, 0.0, 512);
        voice.play(0);

        let mut out = vec![0.0; 512];
        let mut tail = Vec::new();
        let mut periods = 0;
        while voice.control().is_playing() {
            let at_end = voice.control().current_sample_index() == frames;
            out.fill(0.0);
            voice.mix(&mut out, 1, 512, &params);
            if at_end {
                tail.extend_from_slice(&out);
            }
            periods += 1;
            assert!(periods < 200, "voice never stopped");
        }

        assert_eq!(frames, voice.control().current_sample_index());
        let expected = voice.processor().tail_frames();
        assert!(tail.len() >= expected && tail.len() < expected + 512);
        assert!(calculate_rms(&tail[..512]) > 0.05);
    }
}
