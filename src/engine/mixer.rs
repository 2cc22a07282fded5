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
// Render callback body. The callback only ever try-locks the mixer, so control-side structural
// changes (adding or clearing voices) can never stall it; a contended period renders silence.
use std::sync::Arc;
use std::time::Instant;

use super::latency::{LatencyStats, LatencyTuner};
use super::Ensemble;
use crate::audio::StreamInfo;
use crate::voice::Voice;

pub struct Mixer {
    voices: Vec<Voice>,
    channels: usize,
    ensemble: Arc<Ensemble>,
    tuner: LatencyTuner,
}

impl Mixer {
    pub fn new(ensemble: Arc<Ensemble>, stats: Arc<LatencyStats>, max_bursts: u32) -> Self {
        Self {
            voices: Vec::new(),
            channels: 0,
            ensemble,
            tuner: LatencyTuner::new(stats, max_bursts),
        }
    }

    /// Adapts to a freshly opened stream.
    pub fn bind(&mut self, info: &StreamInfo) {
        self.channels = info.channels as usize;
        self.tuner.bind(info);
    }

    /// Adds a voice and returns its index.
    pub fn add(&mut self, voice: Voice) -> usize {
        self.ensemble.push_voice(voice.control().clone());
        self.voices.push(voice);
        self.voices.len() - 1
    }

    /// Drops every voice.
    pub fn clear(&mut self) {
        self.ensemble.clear_voices();
        self.voices.clear();
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Renders one period into `out`.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        if self.channels == 0 {
            return;
        }
        let frames = out.len() / self.channels;
        let params = self.ensemble.params();
        for voice in self.voices.iter_mut() {
            voice.mix(out, self.channels, frames, params);
        }
        self.tuner.tick(Instant::now(), frames);
    }
}
