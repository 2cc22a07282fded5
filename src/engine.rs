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
//! The mixing engine.
//!
//! [`MixEngine`] is the control API. It owns three things:
//!
//! * the [`Mixer`](mixer::Mixer), which holds the render halves of the voices and is driven by
//!   the device callback,
//! * the stream supervisor thread, which owns the device stream and handles faults,
//! * the automation thread, which runs triggers and fades.
//!
//! The [`Ensemble`] is the state all three share: the control halves of the voices, tempo and
//! pitch, and the gains stored while the ensemble is released.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::audio::{self, Backend};
use crate::automation::{Automation, Release, TriggerDown, TriggerTimings};
use crate::config;
use crate::fade::{Fade, FadeTarget, StoredGains};
use crate::store::SampleStore;
use crate::stretch::{MAX_PITCH_SEMITONES, MAX_TEMPO_RATIO, MIN_TEMPO_RATIO};
use crate::voice::{EnsembleParams, Voice, VoiceControl};

pub mod error;
pub mod latency;
pub mod mixer;
pub mod stream;

pub use crate::audio::StreamInfo;
pub use error::EngineError;
pub use stream::{StartPolicy, StreamState};

use latency::LatencyStats;
use mixer::Mixer;
use stream::{StreamContext, StreamSupervisor};

/// State shared by the control side, the mixer and the automation jobs.
#[derive(Debug, Default)]
pub struct Ensemble {
    voices: RwLock<Vec<Arc<VoiceControl>>>,
    params: EnsembleParams,
    stored_gains: StoredGains,
}

impl Ensemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every voice in index order.
    pub fn voices(&self) -> Vec<Arc<VoiceControl>> {
        self.voices.read().clone()
    }

    pub fn voice(&self, index: usize) -> Option<Arc<VoiceControl>> {
        self.voices.read().get(index).cloned()
    }

    pub fn voice_count(&self) -> usize {
        self.voices.read().len()
    }

    pub fn params(&self) -> &EnsembleParams {
        &self.params
    }

    pub fn stored_gains(&self) -> &StoredGains {
        &self.stored_gains
    }

    pub(crate) fn push_voice(&self, voice: Arc<VoiceControl>) {
        self.voices.write().push(voice);
    }

    pub(crate) fn clear_voices(&self) {
        self.voices.write().clear();
        self.stored_gains.clear();
    }
}

pub struct MixEngine {
    ensemble: Arc<Ensemble>,
    mixer: Arc<Mutex<Mixer>>,
    stats: Arc<LatencyStats>,
    timings: TriggerTimings,
    max_block_frames: usize,
    // Dropped before the automation thread so no job outlives the stream.
    stream: StreamSupervisor,
    automation: Automation,
}

impl MixEngine {
    /// Creates an engine for the configured device. No stream is opened until
    /// [`configure`](Self::configure) or [`open`](Self::open) is called.
    pub fn new(config: &config::Engine) -> Result<MixEngine, EngineError> {
        MixEngine::with_backend(audio::get_backend(config.device()), config)
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        config: &config::Engine,
    ) -> Result<MixEngine, EngineError> {
        config.validate()?;
        let request = config.stream_request();
        let ensemble = Arc::new(Ensemble::new());
        let stats = Arc::new(LatencyStats::new(request.buffer_bursts));
        let mixer = Arc::new(Mutex::new(Mixer::new(
            ensemble.clone(),
            stats.clone(),
            request.max_buffer_bursts,
        )));

        info!(device = %backend, "Creating mix engine");
        let stream = StreamSupervisor::spawn(StreamContext {
            backend,
            request,
            policy: config.start_policy()?,
            ensemble: ensemble.clone(),
            mixer: mixer.clone(),
            stats: stats.clone(),
        })
        .map_err(|e| EngineError::Spawn("stream", e))?;
        let automation = Automation::new().map_err(|e| EngineError::Spawn("automation", e))?;

        Ok(MixEngine {
            ensemble,
            mixer,
            stats,
            timings: config.trigger_timings()?,
            max_block_frames: config.max_block_frames(),
            stream,
            automation,
        })
    }

    /// Sets the output channel count and opens a stream with it.
    pub fn configure(&self, channels: u16) -> bool {
        if channels == 0 {
            warn!("Cannot configure an output with no channels");
            return false;
        }
        self.stream.configure(channels)
    }

    /// Opens a stopped stream, replacing any open one. The device rate becomes the engine's rate.
    pub fn open(&self) -> bool {
        self.stream.open()
    }

    /// Starts the stream, retrying a bounded number of times.
    pub fn start(&self) -> bool {
        self.stream.start()
    }

    /// Stops and closes the stream. Does nothing if it is already closed.
    pub fn teardown(&self) {
        self.stream.teardown();
    }

    /// Stops every voice, then reopens and restarts the stream.
    pub fn restart_stream(&self) -> bool {
        self.stream.restart()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream.info()
    }

    /// The rate of the open stream, which is the rate voices are loaded at.
    pub fn sample_rate(&self) -> Option<u32> {
        self.stream.info().map(|info| info.sample_rate)
    }

    pub fn buffer_frames(&self) -> Option<u32> {
        self.stream.info().map(|info| info.buffer_frames)
    }

    /// Late render callbacks seen since the engine was created.
    pub fn xrun_count(&self) -> u64 {
        self.stats.xruns()
    }

    /// True once the engine has recovered from a device fault, until cleared.
    pub fn output_reset(&self) -> bool {
        self.stream.output_reset()
    }

    pub fn clear_output_reset(&self) {
        self.stream.clear_output_reset();
    }

    /// Adds a voice for `store`, converted to the stream's rate, and returns its index.
    pub fn add_voice(&self, store: SampleStore, pan: f32) -> Result<usize, EngineError> {
        let rate = self.sample_rate().ok_or(EngineError::NoStream)?;
        let store = store.resampled(rate)?;
        let channels = store.channel_count();
        let duration = store.duration();
        let voice = Voice::new(store, pan, self.max_block_frames);
        let index = self.mixer.lock().add(voice);
        info!(voice = index, channels, pan, ?duration, "Added voice");
        Ok(index)
    }

    /// Loads a voice from an in-memory WAV file.
    pub fn load_wav(&self, bytes: &[u8], pan: f32) -> Result<usize, EngineError> {
        self.add_voice(SampleStore::from_wav_bytes(bytes)?, pan)
    }

    pub fn load_mp3(&self, path: &Path, pan: f32) -> Result<usize, EngineError> {
        self.add_voice(SampleStore::from_mp3_file(path)?, pan)
    }

    /// Loads a voice from any supported file, chosen by extension.
    pub fn load_file(&self, path: &Path, pan: f32) -> Result<usize, EngineError> {
        self.add_voice(SampleStore::from_file(path)?, pan)
    }

    /// Drops every voice. Indexes start from zero again afterwards.
    pub fn unload_all(&self) {
        let mut mixer = self.mixer.lock();
        let count = mixer.voice_count();
        mixer.clear();
        info!(voices = count, "Unloaded all voices");
    }

    pub fn voice_count(&self) -> usize {
        self.ensemble.voice_count()
    }

    fn voice(&self, index: usize) -> Option<Arc<VoiceControl>> {
        let voice = self.ensemble.voice(index);
        if voice.is_none() {
            warn!(
                voice = index,
                voices = self.voice_count(),
                "Voice index out of range"
            );
        }
        voice
    }

    /// Starts the whole ensemble at voice `index`'s position and fades it in.
    pub fn trigger_down(&self, index: usize) {
        if self.voice(index).is_none() {
            return;
        }
        info!(voice = index, "Trigger down");
        self.automation.submit(Box::new(TriggerDown::new(
            self.ensemble.clone(),
            index,
            self.timings,
        )));
    }

    /// Fades the ensemble out and stops every voice.
    pub fn trigger_up(&self, index: usize) {
        if self.voice(index).is_none() {
            return;
        }
        info!(voice = index, "Trigger up");
        self.automation
            .submit(Box::new(Release::new(self.ensemble.clone(), self.timings)));
    }

    /// Releases the ensemble, then triggers it again from voice `index`'s position.
    pub fn retrigger(&self, index: usize) {
        if self.voice(index).is_none() {
            return;
        }
        info!(voice = index, "Retrigger");
        let trigger = TriggerDown::new(self.ensemble.clone(), index, self.timings);
        self.automation.submit(Box::new(
            Release::new(self.ensemble.clone(), self.timings).and_then(Box::new(trigger)),
        ));
    }

    /// Ramps every voice's gain to `gain` over `duration`. A later fade of the same length
    /// always ends on its own target, even when it overlaps this one.
    pub fn fade_to(&self, gain: f32, duration: Duration) {
        let gain = gain.max(0.0);
        info!(gain, duration = ?duration, "Fade");
        self.submit_fade(FadeTarget::Gain(gain), duration);
    }

    /// Ramps every voice back to its stored gain, or to unity when none was stored, then clears
    /// the stored gains.
    pub fn fade_to_stored(&self, duration: Duration) {
        info!(duration = ?duration, "Fade to stored gains");
        self.submit_fade(FadeTarget::Stored, duration);
    }

    fn submit_fade(&self, target: FadeTarget, duration: Duration) {
        self.automation.submit(Box::new(Fade::new(
            self.ensemble.clone(),
            target,
            duration,
            self.timings.fade_steps,
        )));
    }

    pub fn pan(&self, index: usize) -> f32 {
        self.voice(index).map_or(0.0, |v| v.pan())
    }

    pub fn set_pan(&self, index: usize, pan: f32) {
        if let Some(voice) = self.voice(index) {
            voice.set_pan(pan);
        }
    }

    pub fn gain(&self, index: usize) -> f32 {
        self.voice(index).map_or(0.0, |v| v.gain())
    }

    /// Sets a voice's gain. While the ensemble is released the stored gain is updated too, so
    /// the next trigger restores the new value.
    pub fn set_gain(&self, index: usize, gain: f32) {
        if let Some(voice) = self.voice(index) {
            voice.set_gain(gain);
            self.ensemble.stored_gains().update(index, voice.gain());
        }
    }

    pub fn tempo(&self) -> f64 {
        self.ensemble.params().tempo_ratio()
    }

    /// Sets the ensemble tempo ratio, clamped to the supported range.
    pub fn set_tempo(&self, ratio: f64) {
        if !ratio.is_finite() || ratio <= 0.0 {
            warn!(ratio, "Ignoring invalid tempo ratio");
            return;
        }
        let clamped = ratio.clamp(MIN_TEMPO_RATIO, MAX_TEMPO_RATIO);
        if clamped != ratio {
            warn!(ratio, clamped, "Tempo ratio out of range");
        }
        self.ensemble.params().set_tempo_ratio(clamped);
    }

    pub fn pitch_semitones(&self) -> f64 {
        self.ensemble.params().pitch_semitones()
    }

    /// Sets the ensemble transposition, clamped to an octave either way.
    pub fn set_pitch_semitones(&self, semitones: f64) {
        if !semitones.is_finite() {
            warn!(semitones, "Ignoring invalid pitch shift");
            return;
        }
        self.ensemble
            .params()
            .set_pitch_semitones(semitones.clamp(-MAX_PITCH_SEMITONES, MAX_PITCH_SEMITONES));
    }

    /// Marks the listed voices as exempt from the pitch shift and clears the rest.
    pub fn set_pitch_exempt(&self, indexes: &[usize]) {
        for index in indexes {
            if *index >= self.voice_count() {
                warn!(voice = index, "Voice index out of range");
            }
        }
        for (index, voice) in self.ensemble.voices().iter().enumerate() {
            voice.set_pitch_exempt(indexes.contains(&index));
        }
    }

    pub fn is_playing(&self, index: usize) -> bool {
        self.voice(index).is_some_and(|v| v.is_playing())
    }

    pub fn current_sample_index(&self, index: usize) -> usize {
        self.voice(index).map_or(0, |v| v.current_sample_index())
    }

    pub fn current_time(&self, index: usize) -> f64 {
        self.voice(index).map_or(0.0, |v| v.current_time())
    }

    pub fn total_length(&self, index: usize) -> f64 {
        self.voice(index).map_or(0.0, |v| v.total_length())
    }

    /// Playback position of the ensemble: the first playing voice, or the first voice.
    pub fn playback_time(&self) -> f64 {
        let voices = self.ensemble.voices();
        voices
            .iter()
            .find(|v| v.is_playing())
            .or(voices.first())
            .map_or(0.0, |v| v.current_time())
    }

    /// Moves every voice to `seconds`.
    pub fn set_current_time(&self, seconds: f64) {
        for voice in self.ensemble.voices() {
            voice.set_current_time(seconds);
        }
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        info!(xruns = self.stats.xruns(), "Shutting down mix engine");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{EngineError, MixEngine, StreamState};
    use crate::audio::mock;
    use crate::config;
    use crate::store::SampleStore;
    use crate::testutil::{eventually, write_wav};

    fn engine() -> (mock::Backend, MixEngine) {
        let backend = mock::Backend::new("mock-device");
        let config = config::parse(
            r#"
            device: mock-device
            start_retry_delay: 1ms
            trigger_fade: 30ms
            fade_steps: 10
            settle: 5ms
            release_stop_delay: 40ms
            "#,
        )
        .unwrap();
        let engine = MixEngine::with_backend(Arc::new(backend.clone()), &config).unwrap();
        (backend, engine)
    }

    fn constant(value: f32, channels: u16, seconds: usize, rate: u32) -> SampleStore {
        let len = seconds * rate as usize * channels as usize;
        SampleStore::new(vec![value; len], channels, rate).unwrap()
    }

    #[test]
    fn test_loading_needs_a_stream() {
        let (_, engine) = engine();
        let result = engine.add_voice(constant(0.5, 1, 1, 44100), 0.0);
        assert!(matches!(result, Err(EngineError::NoStream)));
        assert_eq!(0, engine.voice_count());
    }

    #[test]
    fn test_configure_binds_rate_and_resamples_voices() {
        let (backend, engine) = engine();
        backend.set_sample_rate(48000);
        assert!(engine.configure(2));
        assert_eq!(Some(48000), engine.sample_rate());
        assert_eq!(StreamState::Open, engine.stream_state());
        assert_eq!(Some(512), engine.buffer_frames());

        let index = engine.add_voice(constant(0.5, 1, 1, 24000), 0.0).unwrap();
        assert_eq!(0, index);
        assert!((engine.total_length(0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_buffer_follows_the_device_burst() {
        let (backend, engine) = engine();
        backend.set_burst_frames(128);
        assert!(engine.configure(2));
        assert_eq!(Some(256), engine.buffer_frames());
        assert_eq!(Some(128), engine.stream_info().map(|info| info.burst_frames));
    }

    #[test]
    fn test_index_validation_is_a_no_op() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.set_pan(3, 1.0);
        engine.set_gain(3, 0.5);
        engine.trigger_down(3);
        engine.trigger_up(3);
        engine.retrigger(3);
        assert_eq!(0.0, engine.pan(3));
        assert_eq!(0.0, engine.gain(3));
        assert_eq!(0.0, engine.current_time(3));
        assert_eq!(0.0, engine.total_length(3));
        assert_eq!(0, engine.current_sample_index(3));
        assert!(!engine.is_playing(3));
    }

    #[test]
    fn test_pan_gain_and_ensemble_params() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.add_voice(constant(0.5, 2, 1, 44100), 0.0).unwrap();

        engine.set_pan(0, -3.0);
        assert_eq!(-1.0, engine.pan(0));
        engine.set_gain(0, 0.5);
        assert_eq!(0.5, engine.gain(0));

        engine.set_tempo(1.25);
        assert_eq!(1.25, engine.tempo());
        engine.set_tempo(10.0);
        assert_eq!(2.0, engine.tempo());
        engine.set_tempo(f64::NAN);
        assert_eq!(2.0, engine.tempo());

        engine.set_pitch_semitones(-3.0);
        assert_eq!(-3.0, engine.pitch_semitones());
        engine.set_pitch_semitones(40.0);
        assert_eq!(12.0, engine.pitch_semitones());
    }

    #[test]
    fn test_trigger_plays_every_voice_then_releases() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        assert!(engine.start());
        engine.add_voice(constant(0.5, 1, 10, 44100), -0.5).unwrap();
        engine.add_voice(constant(0.5, 2, 10, 44100), 0.5).unwrap();

        engine.trigger_down(1);
        eventually(
            || engine.is_playing(0) && engine.is_playing(1),
            "Ensemble never started",
        );
        eventually(
            || engine.current_sample_index(0) > 0,
            "Voices never advanced",
        );
        eventually(
            || engine.gain(0) == 1.0 && engine.gain(1) == 1.0,
            "Ensemble never faded in",
        );
        // Mono and stereo voices stay on the same frame.
        assert!((engine.current_time(0) - engine.current_time(1)).abs() < 0.05);

        engine.trigger_up(0);
        eventually(
            || !engine.is_playing(0) && !engine.is_playing(1),
            "Ensemble never stopped",
        );
        assert_eq!(0.0, engine.gain(0));
    }

    #[test]
    fn test_gain_set_while_released_is_restored() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        assert!(engine.start());
        engine.add_voice(constant(0.5, 1, 10, 44100), 0.0).unwrap();

        engine.trigger_down(0);
        eventually(|| engine.is_playing(0), "Voice never started");
        engine.trigger_up(0);
        eventually(|| !engine.is_playing(0), "Voice never stopped");

        engine.set_gain(0, 0.25);
        engine.trigger_down(0);
        eventually(|| engine.is_playing(0), "Voice never restarted");
        eventually(|| engine.gain(0) == 0.25, "Stored gain not restored");
        eventually(
            || !engine.ensemble.stored_gains().is_captured(),
            "Stored gains never cleared",
        );
    }

    #[test]
    fn test_overlapping_fades_end_on_the_later_target() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        engine.add_voice(constant(0.5, 2, 1, 44100), 0.0).unwrap();

        engine.fade_to(0.0, Duration::from_millis(180));
        std::thread::sleep(Duration::from_millis(50));
        assert!(engine.gain(0) < 1.0);
        engine.fade_to(1.0, Duration::from_millis(180));

        eventually(
            || engine.gain(0) == 1.0 && engine.gain(1) == 1.0,
            "Later fade never reached its target",
        );
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(1.0, engine.gain(0));
        assert_eq!(1.0, engine.gain(1));
    }

    #[test]
    fn test_fade_to_stored_restores_captured_gains() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        engine.set_gain(1, 0.5);

        engine.ensemble.stored_gains().capture(&engine.ensemble.voices());
        engine.fade_to(0.0, Duration::from_millis(20));
        eventually(
            || engine.gain(0) == 0.0 && engine.gain(1) == 0.0,
            "Fade out never finished",
        );

        engine.fade_to_stored(Duration::from_millis(20));
        eventually(
            || engine.gain(0) == 1.0 && engine.gain(1) == 0.5,
            "Stored gains never restored",
        );
        eventually(
            || !engine.ensemble.stored_gains().is_captured(),
            "Stored gains never cleared",
        );

        // Nothing stored falls back to unity.
        engine.fade_to_stored(Duration::ZERO);
        eventually(|| engine.gain(1) == 1.0, "Unity never restored");
    }

    #[test]
    fn test_seek_applies_to_every_voice() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.add_voice(constant(0.5, 1, 10, 44100), 0.0).unwrap();
        engine.add_voice(constant(0.5, 2, 10, 44100), 0.0).unwrap();

        engine.set_current_time(2.5);
        assert!((engine.current_time(0) - 2.5).abs() < 1e-6);
        assert!((engine.current_time(1) - 2.5).abs() < 1e-6);
        assert_eq!(110_250, engine.current_sample_index(0));
        assert_eq!(220_500, engine.current_sample_index(1));
        assert!((engine.playback_time() - 2.5).abs() < 1e-6);

        engine.set_current_time(60.0);
        assert!(engine.current_time(0) < 10.0);
    }

    #[test]
    fn test_pitch_exemption() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        for _ in 0..3 {
            engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        }
        engine.set_pitch_exempt(&[1, 7]);
        let voices = engine.ensemble.voices();
        assert!(!voices[0].is_pitch_exempt());
        assert!(voices[1].is_pitch_exempt());
        assert!(!voices[2].is_pitch_exempt());
    }

    #[test]
    fn test_unload_all_resets_indexes() {
        let (_, engine) = engine();
        assert!(engine.configure(2));
        engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap();
        engine.unload_all();
        assert_eq!(0, engine.voice_count());
        assert_eq!(0, engine.add_voice(constant(0.5, 1, 1, 44100), 0.0).unwrap());
    }

    #[test]
    fn test_load_wav_bytes() {
        let (_, engine) = engine();
        assert!(engine.configure(2));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("click.wav");
        write_wav(&path, &[vec![1000i16; 4410], vec![-1000i16; 4410]], 44100).unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let index = engine.load_wav(&bytes, 0.0).unwrap();
        assert!((engine.total_length(index) - 0.1).abs() < 1e-6);
        let index = engine.load_file(&path, 0.0).unwrap();
        assert_eq!(1, index);
    }

    #[test]
    fn test_fault_recovery_stops_voices_and_flags_output_reset() {
        let (backend, engine) = engine();
        assert!(engine.configure(2));
        assert!(engine.start());
        engine.add_voice(constant(0.5, 1, 10, 44100), 0.0).unwrap();
        engine.trigger_down(0);
        eventually(|| engine.is_playing(0), "Voice never started");

        backend.inject_fault("device disconnected");
        eventually(|| engine.output_reset(), "Engine never recovered");
        assert!(!engine.is_playing(0));
        assert_eq!(StreamState::Started, engine.stream_state());
        engine.clear_output_reset();
        assert!(!engine.output_reset());

        assert!(engine.restart_stream());
        assert!(!engine.output_reset());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (_, engine) = engine();
        engine.teardown();
        assert!(engine.configure(1));
        assert!(engine.start());
        engine.teardown();
        engine.teardown();
        assert_eq!(StreamState::Closed, engine.stream_state());
        assert_eq!(None, engine.sample_rate());
        assert!(!engine.configure(0));
    }
}
