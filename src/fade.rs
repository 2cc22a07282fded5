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
//! Linear gain ramps across the ensemble.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::automation::{Job, Step};
use crate::engine::Ensemble;
use crate::voice::VoiceControl;

/// Gains captured when the ensemble is released, restored by the next trigger.
#[derive(Debug, Default)]
pub struct StoredGains(Mutex<Option<Vec<f32>>>);

impl StoredGains {
    /// Captures the current gain of every voice unless a capture already exists.
    pub fn capture(&self, voices: &[Arc<VoiceControl>]) {
        let mut stored = self.0.lock();
        if stored.is_none() {
            *stored = Some(voices.iter().map(|v| v.gain()).collect());
        }
    }

    pub fn get(&self) -> Option<Vec<f32>> {
        self.0.lock().clone()
    }

    /// Updates the stored gain for one voice if a capture exists.
    pub fn update(&self, index: usize, gain: f32) {
        if let Some(gains) = self.0.lock().as_mut() {
            if let Some(stored) = gains.get_mut(index) {
                *stored = gain;
            }
        }
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    pub fn is_captured(&self) -> bool {
        self.0.lock().is_some()
    }
}

/// Where a fade ends up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeTarget {
    /// Every voice ramps to the same gain.
    Gain(f32),
    /// Every voice ramps back to its stored gain, or to unity when nothing was stored. The store
    /// is cleared when the ramp completes.
    Stored,
}

/// Ramps every voice's gain from wherever it is when the fade starts to the target.
///
/// Starting gains are captured at the fade's first poll, so fades issued back to back each ramp
/// from their own snapshot. Of two overlapping fades with the same duration the later one writes
/// last. A longer earlier fade keeps writing until its own end. Intermediate values are plain
/// gain writes and never touch the stored gains.
pub struct Fade {
    ensemble: Arc<Ensemble>,
    target: FadeTarget,
    duration: Duration,
    steps: u32,
    plan: Option<FadePlan>,
}

struct FadePlan {
    voices: Vec<Arc<VoiceControl>>,
    from: Vec<f32>,
    to: Vec<f32>,
    started: Instant,
    step: u32,
}

impl Fade {
    pub fn new(ensemble: Arc<Ensemble>, target: FadeTarget, duration: Duration, steps: u32) -> Self {
        Self {
            ensemble,
            target,
            duration,
            steps: steps.max(1),
            plan: None,
        }
    }

    fn start(&self, now: Instant) -> FadePlan {
        let voices = self.ensemble.voices();
        let from: Vec<f32> = voices.iter().map(|v| v.gain()).collect();
        let to = match self.target {
            FadeTarget::Gain(gain) => vec![gain; voices.len()],
            FadeTarget::Stored => {
                let stored = self.ensemble.stored_gains().get().unwrap_or_default();
                (0..voices.len())
                    .map(|i| stored.get(i).copied().unwrap_or(1.0))
                    .collect()
            }
        };
        debug!(
            voices = voices.len(),
            target = ?self.target,
            duration = ?self.duration,
            "Starting fade"
        );
        FadePlan {
            voices,
            from,
            to,
            started: now,
            step: 0,
        }
    }

    fn finish(&self) -> Step {
        if self.target == FadeTarget::Stored {
            self.ensemble.stored_gains().clear();
        }
        Step::Done
    }
}

impl Job for Fade {
    fn name(&self) -> &'static str {
        "fade"
    }

    fn poll(&mut self, now: Instant) -> Step {
        let steps = self.steps;
        let interval = self.duration / steps;

        if self.plan.is_none() {
            let plan = self.start(now);
            if self.duration.is_zero() {
                for (voice, to) in plan.voices.iter().zip(&plan.to) {
                    voice.set_gain(*to);
                }
                return self.finish();
            }
            let next = plan.started + interval;
            self.plan = Some(plan);
            return Step::Continue(next);
        }
        let Some(plan) = self.plan.as_mut() else {
            return Step::Done;
        };

        plan.step += 1;
        if plan.step >= steps {
            for (voice, to) in plan.voices.iter().zip(&plan.to) {
                voice.set_gain(*to);
            }
            return self.finish();
        }

        let progress = plan.step as f32 / steps as f32;
        for ((voice, from), to) in plan.voices.iter().zip(&plan.from).zip(&plan.to) {
            voice.set_gain(from + (to - from) * progress);
        }
        Step::Continue(plan.started + interval * plan.step + interval)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{Fade, FadeTarget, StoredGains};
    use crate::automation::{Job, Step};
    use crate::engine::Ensemble;
    use crate::store::SampleStore;
    use crate::voice::Voice;

    fn ensemble(voices: usize) -> Arc<Ensemble> {
        let ensemble = Arc::new(Ensemble::new());
        for _ in 0..voices {
            let voice = Voice::new(SampleStore::new(vec![0.0; 64], 1, 44100).unwrap(), 0.0, 64);
            ensemble.push_voice(voice.control().clone());
        }
        ensemble
    }

    /// Drives a job to completion, pretending each deadline is met exactly.
    fn run_to_end(job: &mut dyn Job, start: Instant) -> usize {
        let mut now = start;
        let mut polls = 0;
        loop {
            polls += 1;
            match job.poll(now) {
                Step::Continue(next) => {
                    assert!(next >= now);
                    now = next;
                }
                Step::Done => return polls,
                Step::Then(_) => panic!("fades do not chain"),
            }
        }
    }

    #[test]
    fn ramps_linearly_to_target() {
        let ensemble = ensemble(2);
        let mut fade = Fade::new(
            ensemble.clone(),
            FadeTarget::Gain(0.0),
            Duration::from_millis(100),
            4,
        );
        let start = Instant::now();

        assert!(matches!(fade.poll(start), Step::Continue(_)));
        assert_eq!(1.0, ensemble.voice(0).unwrap().gain());
        fade.poll(start + Duration::from_millis(25));
        assert!((ensemble.voice(0).unwrap().gain() - 0.75).abs() < 1e-6);
        fade.poll(start + Duration::from_millis(50));
        assert!((ensemble.voice(1).unwrap().gain() - 0.5).abs() < 1e-6);
        fade.poll(start + Duration::from_millis(75));
        assert!(matches!(
            fade.poll(start + Duration::from_millis(100)),
            Step::Done
        ));
        assert_eq!(0.0, ensemble.voice(0).unwrap().gain());
        assert_eq!(0.0, ensemble.voice(1).unwrap().gain());
    }

    #[test]
    fn deadlines_cover_the_duration() {
        let ensemble = ensemble(1);
        let mut fade = Fade::new(
            ensemble,
            FadeTarget::Gain(0.5),
            Duration::from_millis(180),
            300,
        );
        let start = Instant::now();
        let mut now = start;
        let mut last = start;
        loop {
            match fade.poll(now) {
                Step::Continue(next) => {
                    last = next;
                    now = next;
                }
                _ => break,
            }
        }
        assert_eq!(start + Duration::from_millis(180), last);
    }

    #[test]
    fn zero_duration_jumps() {
        let ensemble = ensemble(1);
        let mut fade = Fade::new(ensemble.clone(), FadeTarget::Gain(0.2), Duration::ZERO, 300);
        assert!(matches!(fade.poll(Instant::now()), Step::Done));
        assert_eq!(0.2, ensemble.voice(0).unwrap().gain());
    }

    #[test]
    fn stored_target_restores_and_clears() {
        let ensemble = ensemble(3);
        ensemble.voice(0).unwrap().set_gain(0.3);
        ensemble.voice(1).unwrap().set_gain(0.6);
        ensemble.stored_gains().capture(&ensemble.voices()[..2]);
        for voice in ensemble.voices() {
            voice.set_gain(0.0);
        }

        let mut fade = Fade::new(
            ensemble.clone(),
            FadeTarget::Stored,
            Duration::from_millis(10),
            10,
        );
        run_to_end(&mut fade, Instant::now());

        assert!((ensemble.voice(0).unwrap().gain() - 0.3).abs() < 1e-6);
        assert!((ensemble.voice(1).unwrap().gain() - 0.6).abs() < 1e-6);
        // Voices without a stored gain come back at unity.
        assert_eq!(1.0, ensemble.voice(2).unwrap().gain());
        assert!(!ensemble.stored_gains().is_captured());
    }

    #[test]
    fn overlapping_fades_use_their_own_snapshots() {
        let ensemble = ensemble(1);
        let voice = ensemble.voice(0).unwrap();
        let start = Instant::now();

        let mut down = Fade::new(
            ensemble.clone(),
            FadeTarget::Gain(0.0),
            Duration::from_millis(180),
            300,
        );
        let mut up = Fade::new(
            ensemble.clone(),
            FadeTarget::Gain(1.0),
            Duration::from_millis(180),
            300,
        );

        // Interleave the two as the scheduler would, the second starting 50ms late.
        let mut down_at = Some(start);
        let mut up_at = Some(start + Duration::from_millis(50));
        while down_at.is_some() || up_at.is_some() {
            let next_down = down_at.unwrap_or(Instant::now() + Duration::from_secs(3600));
            let next_up = up_at.unwrap_or(Instant::now() + Duration::from_secs(3600));
            if down_at.is_some() && next_down <= next_up {
                down_at = match down.poll(next_down) {
                    Step::Continue(next) => Some(next),
                    _ => None,
                };
            } else {
                up_at = match up.poll(next_up) {
                    Step::Continue(next) => Some(next),
                    _ => None,
                };
            }
        }
        assert!((voice.gain() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stored_gains_only_capture_once() {
        let ensemble = ensemble(2);
        let stored = StoredGains::default();
        stored.capture(&ensemble.voices());
        ensemble.voice(0).unwrap().set_gain(0.1);
        stored.capture(&ensemble.voices());
        assert_eq!(Some(vec![1.0, 1.0]), stored.get());

        stored.update(1, 0.4);
        stored.update(9, 0.4);
        assert_eq!(Some(vec![1.0, 0.4]), stored.get());

        stored.clear();
        stored.update(0, 0.5);
        assert_eq!(None, stored.get());
    }
}
