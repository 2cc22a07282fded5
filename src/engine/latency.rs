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
//! Late callback detection.
//!
//! The tuner runs once per render period. A callback that arrives more than one and a half
//! periods after the previous one is counted as an xrun and grows the recommended buffer by one
//! burst, up to a ceiling. The recommendation takes effect the next time the stream is opened.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::StreamInfo;

/// Counters shared between the tuner and the control side.
#[derive(Debug)]
pub struct LatencyStats {
    xruns: AtomicU64,
    recommended_bursts: AtomicU32,
}

impl LatencyStats {
    pub fn new(buffer_bursts: u32) -> Self {
        Self {
            xruns: AtomicU64::new(0),
            recommended_bursts: AtomicU32::new(buffer_bursts.max(1)),
        }
    }

    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// Buffer size, in bursts, to request on the next open.
    pub fn recommended_bursts(&self) -> u32 {
        self.recommended_bursts.load(Ordering::Relaxed)
    }
}

pub struct LatencyTuner {
    stats: Arc<LatencyStats>,
    max_bursts: u32,
    sample_rate: u32,
    last: Option<Instant>,
}

impl LatencyTuner {
    pub fn new(stats: Arc<LatencyStats>, max_bursts: u32) -> Self {
        Self {
            stats,
            max_bursts: max_bursts.max(1),
            sample_rate: 0,
            last: None,
        }
    }

    /// Rebinds to a freshly opened stream.
    pub fn bind(&mut self, info: &StreamInfo) {
        self.sample_rate = info.sample_rate;
        self.last = None;
    }

    pub fn stats(&self) -> &Arc<LatencyStats> {
        &self.stats
    }

    /// Records a callback for `frames` frames arriving at `now`.
    pub fn tick(&mut self, now: Instant, frames: usize) {
        let last = self.last.replace(now);
        let Some(last) = last else {
            return;
        };
        if self.sample_rate == 0 || frames == 0 {
            return;
        }

        let period = Duration::from_secs_f64(frames as f64 / self.sample_rate as f64);
        if now.saturating_duration_since(last) > period.mul_f64(1.5) {
            self.stats.xruns.fetch_add(1, Ordering::Relaxed);
            let max = self.max_bursts;
            let _ = self.stats.recommended_bursts.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |bursts| (bursts < max).then_some(bursts + 1),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{LatencyStats, LatencyTuner};
    use crate::audio::StreamInfo;

    fn tuner(max_bursts: u32) -> LatencyTuner {
        let mut tuner = LatencyTuner::new(Arc::new(LatencyStats::new(2)), max_bursts);
        tuner.bind(&StreamInfo {
            sample_rate: 48000,
            channels: 2,
            burst_frames: 240,
            buffer_frames: 480,
        });
        tuner
    }

    #[test]
    fn on_time_callbacks_are_not_xruns() {
        let mut tuner = tuner(8);
        let start = Instant::now();
        for i in 0..10u32 {
            tuner.tick(start + Duration::from_millis(10) * i, 480);
        }
        assert_eq!(0, tuner.stats().xruns());
        assert_eq!(2, tuner.stats().recommended_bursts());
    }

    #[test]
    fn late_callbacks_grow_the_buffer_up_to_the_ceiling() {
        let mut tuner = tuner(4);
        let start = Instant::now();
        tuner.tick(start, 480);
        // 480 frames at 48 kHz is 10 ms, so 16 ms is late.
        for i in 1..=5u32 {
            tuner.tick(start + Duration::from_millis(16) * i, 480);
        }
        assert_eq!(5, tuner.stats().xruns());
        assert_eq!(4, tuner.stats().recommended_bursts());
    }

    #[test]
    fn rebinding_forgets_the_previous_callback() {
        let mut tuner = tuner(8);
        let start = Instant::now();
        tuner.tick(start, 480);
        tuner.bind(&StreamInfo {
            sample_rate: 44100,
            channels: 2,
            burst_frames: 256,
            buffer_frames: 512,
        });
        tuner.tick(start + Duration::from_secs(1), 512);
        assert_eq!(0, tuner.stats().xruns());
    }
}
