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
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{info, span, Level};

use super::{AudioError, ErrorCallback, OutputStream, RenderCallback, StreamInfo, StreamRequest};

const MOCK_SAMPLE_RATE: u32 = 44100;
const MOCK_BURST_FRAMES: u32 = 256;

/// A mock backend. Renders on its own thread at roughly real-time pace and throws the audio
/// away, keeping the most recent buffer for inspection. Failures can be injected.
#[derive(Clone)]
pub struct Backend {
    name: String,
    state: Arc<MockState>,
}

struct MockState {
    sample_rate: AtomicU32,
    burst_frames: AtomicU32,
    fail_opens: AtomicU32,
    fail_starts: AtomicU32,
    opens: AtomicU32,
    renders: AtomicU64,
    last_output: Mutex<Vec<f32>>,
    /// Error callback of the most recently opened stream.
    on_error: Mutex<Option<ErrorCallback>>,
}

impl Backend {
    /// Gets the given mock device.
    pub fn new(name: &str) -> Backend {
        Backend {
            name: name.to_string(),
            state: Arc::new(MockState {
                sample_rate: AtomicU32::new(MOCK_SAMPLE_RATE),
                burst_frames: AtomicU32::new(MOCK_BURST_FRAMES),
                fail_opens: AtomicU32::new(0),
                fail_starts: AtomicU32::new(0),
                opens: AtomicU32::new(0),
                renders: AtomicU64::new(0),
                last_output: Mutex::new(Vec::new()),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Sets the rate the next opened stream runs at.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.state.sample_rate.store(sample_rate, Ordering::SeqCst);
    }

    /// Sets the burst the next opened stream reports.
    pub fn set_burst_frames(&self, burst_frames: u32) {
        self.state.burst_frames.store(burst_frames, Ordering::SeqCst);
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` starts fail.
    pub fn fail_next_starts(&self, count: u32) {
        self.state.fail_starts.store(count, Ordering::SeqCst);
    }

    /// Reports a stream-fatal error as the device would on disconnect.
    pub fn inject_fault(&self, reason: &str) {
        if let Some(on_error) = self.state.on_error.lock().as_mut() {
            on_error(AudioError::StreamError(reason.to_string()));
        }
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Buffers rendered so far across every stream.
    pub fn render_count(&self) -> u64 {
        self.state.renders.load(Ordering::SeqCst)
    }

    /// A copy of the most recently rendered buffer.
    pub fn last_output(&self) -> Vec<f32> {
        self.state.last_output.lock().clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

impl super::Backend for Backend {
    fn open(
        &self,
        request: &StreamRequest,
        render: RenderCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        if Self::take_failure(&self.state.fail_opens) {
            return Err(AudioError::StreamBuildError("injected open failure".into()));
        }

        let sample_rate = request
            .sample_rate
            .unwrap_or_else(|| self.state.sample_rate.load(Ordering::SeqCst));
        let burst_frames = self.state.burst_frames.load(Ordering::SeqCst);
        let info = StreamInfo {
            sample_rate,
            channels: request.channels,
            burst_frames,
            buffer_frames: burst_frames * request.buffer_bursts.max(1),
        };
        *self.state.on_error.lock() = Some(on_error);
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        info!(
            device = self.name,
            sample_rate,
            buffer = info.buffer_frames,
            "Opened mock stream"
        );

        Ok(Box::new(Stream {
            state: self.state.clone(),
            info,
            render: Some(render),
            runner: None,
        }))
    }
}

struct Stream {
    state: Arc<MockState>,
    info: StreamInfo,
    /// Handed to the render thread on start and returned when it stops.
    render: Option<RenderCallback>,
    runner: Option<(Sender<()>, thread::JoinHandle<RenderCallback>)>,
}

impl OutputStream for Stream {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.runner.is_some() {
            return Ok(());
        }
        if Backend::take_failure(&self.state.fail_starts) {
            return Err(AudioError::StreamPlayError("injected start failure".into()));
        }
        let Some(mut render) = self.render.take() else {
            return Err(AudioError::StreamPlayError("stream has no renderer".into()));
        };

        let state = self.state.clone();
        let samples = self.info.buffer_frames as usize * self.info.channels as usize;
        let period = Duration::from_secs_f64(
            self.info.buffer_frames as f64 / self.info.sample_rate.max(1) as f64,
        );
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let span = span!(Level::DEBUG, "mock stream");
            let _enter = span.enter();

            let mut buffer = vec![0.0f32; samples];
            loop {
                render(&mut buffer);
                state.renders.fetch_add(1, Ordering::SeqCst);
                state.last_output.lock().clone_from(&buffer);

                // Wait for a signal or until the next period is due.
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            render
        });
        self.runner = Some((stop_tx, handle));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let Some((stop_tx, handle)) = self.runner.take() else {
            return Ok(());
        };
        drop(stop_tx);
        match handle.join() {
            Ok(render) => {
                self.render = Some(render);
                Ok(())
            }
            Err(_) => Err(AudioError::StreamPauseError(
                "Error while joining thread!".into(),
            )),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
