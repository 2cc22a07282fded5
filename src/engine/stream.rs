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
//! The stream supervisor.
//!
//! Device streams are opened, started, stopped and dropped on one dedicated thread, which is
//! the only owner of the stream handle. Control calls are sent to it as commands and wait for
//! the outcome. Stream-fatal errors reported by the device arrive as commands too, tagged with
//! the generation of the stream that raised them so that stale reports are ignored.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, span, warn, Level};

use super::latency::LatencyStats;
use super::mixer::Mixer;
use super::Ensemble;
use crate::audio::{AudioError, Backend, OutputStream, StreamInfo, StreamRequest};

/// Output stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Open,
    Started,
}

/// Bounded retry of stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_millis(20),
        }
    }
}

enum Command {
    Configure { channels: u16, reply: Sender<bool> },
    Open { reply: Sender<bool> },
    Start { reply: Sender<bool> },
    Restart { reply: Sender<bool> },
    Teardown { reply: Sender<bool> },
    Fault { generation: u64, reason: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: StreamState,
    info: Option<StreamInfo>,
}

/// State readable without a round trip to the supervisor thread.
struct Shared {
    status: Mutex<Status>,
    output_reset: AtomicBool,
}

/// Everything the supervisor thread needs to manage streams.
pub(crate) struct StreamContext {
    pub backend: Arc<dyn Backend>,
    pub request: StreamRequest,
    pub policy: StartPolicy,
    pub ensemble: Arc<Ensemble>,
    pub mixer: Arc<Mutex<Mixer>>,
    pub stats: Arc<LatencyStats>,
}

/// Handle to the supervisor thread. Dropping it tears the stream down and joins the thread.
pub(crate) struct StreamSupervisor {
    sender: Sender<Command>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn spawn(context: StreamContext) -> io::Result<StreamSupervisor> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: StreamState::Closed,
                info: None,
            }),
            output_reset: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let faults = sender.clone();
        let handle = thread::Builder::new()
            .name("ensemble-stream".into())
            .spawn(move || {
                // Streams are not Send, so the worker is built on its own thread.
                let worker = Worker {
                    channels: context.request.channels,
                    context,
                    shared: worker_shared,
                    faults,
                    stream: None,
                    generation: 0,
                    bound_rate: None,
                };
                worker.run(receiver)
            })?;
        Ok(StreamSupervisor {
            sender,
            shared,
            handle: Some(handle),
        })
    }

    fn request(&self, command: impl FnOnce(Sender<bool>) -> Command) -> bool {
        let (reply, response) = bounded(1);
        if self.sender.send(command(reply)).is_err() {
            warn!("Stream thread has stopped");
            return false;
        }
        response.recv().unwrap_or(false)
    }

    pub fn configure(&self, channels: u16) -> bool {
        self.request(|reply| Command::Configure { channels, reply })
    }

    pub fn open(&self) -> bool {
        self.request(|reply| Command::Open { reply })
    }

    pub fn start(&self) -> bool {
        self.request(|reply| Command::Start { reply })
    }

    pub fn restart(&self) -> bool {
        self.request(|reply| Command::Restart { reply })
    }

    pub fn teardown(&self) {
        self.request(|reply| Command::Teardown { reply });
    }

    pub fn state(&self) -> StreamState {
        self.shared.status.lock().state
    }

    pub fn info(&self) -> Option<StreamInfo> {
        self.shared.status.lock().info
    }

    pub fn output_reset(&self) -> bool {
        self.shared.output_reset.load(Ordering::Acquire)
    }

    pub fn clear_output_reset(&self) {
        self.shared.output_reset.store(false, Ordering::Release);
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Stream thread panicked");
            }
        }
    }
}

struct Worker {
    context: StreamContext,
    shared: Arc<Shared>,
    faults: Sender<Command>,
    channels: u16,
    stream: Option<Box<dyn OutputStream>>,
    /// Incremented for every opened stream.
    generation: u64,
    bound_rate: Option<u32>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<Command>) {
        let span = span!(Level::INFO, "stream", device = %self.context.backend);
        let _enter = span.enter();

        while let Ok(command) = receiver.recv() {
            match command {
                Command::Configure { channels, reply } => {
                    self.channels = channels;
                    let _ = reply.send(self.open());
                }
                Command::Open { reply } => {
                    let _ = reply.send(self.open());
                }
                Command::Start { reply } => {
                    let _ = reply.send(self.start());
                }
                Command::Restart { reply } => {
                    info!("Restarting output stream");
                    let _ = reply.send(self.recover());
                }
                Command::Teardown { reply } => {
                    self.teardown();
                    let _ = reply.send(true);
                }
                Command::Fault { generation, reason } => {
                    if generation != self.generation || self.stream.is_none() {
                        continue;
                    }
                    error!(reason, "Output stream failed, recovering");
                    if self.recover() {
                        self.shared.output_reset.store(true, Ordering::Release);
                        info!("Output stream recovered");
                    } else {
                        error!("Unable to recover output stream");
                    }
                }
                Command::Shutdown => break,
            }
        }
        self.teardown();
    }

    fn set_status(&self, state: StreamState, info: Option<StreamInfo>) {
        *self.shared.status.lock() = Status { state, info };
    }

    fn state(&self) -> StreamState {
        self.shared.status.lock().state
    }

    /// Opens a stopped stream, replacing any existing one.
    fn open(&mut self) -> bool {
        self.close();
        self.generation += 1;

        let request = StreamRequest {
            channels: self.channels,
            buffer_bursts: self.context.stats.recommended_bursts(),
            ..self.context.request.clone()
        };
        let mixer = self.context.mixer.clone();
        let render = Box::new(move |out: &mut [f32]| match mixer.try_lock() {
            Some(mut mixer) => mixer.render(out),
            None => out.fill(0.0),
        });
        let faults = self.faults.clone();
        let generation = self.generation;
        let on_error = Box::new(move |e: AudioError| {
            let _ = faults.try_send(Command::Fault {
                generation,
                reason: e.to_string(),
            });
        });

        match self.context.backend.open(&request, render, on_error) {
            Ok(stream) => {
                let info = stream.info();
                {
                    let mut mixer = self.context.mixer.lock();
                    if self.bound_rate.is_some_and(|rate| rate != info.sample_rate)
                        && mixer.voice_count() > 0
                    {
                        warn!(
                            previous = self.bound_rate,
                            sample_rate = info.sample_rate,
                            "Output rate changed with voices loaded, they will play off pitch"
                        );
                    }
                    mixer.bind(&info);
                }
                self.bound_rate = Some(info.sample_rate);
                self.stream = Some(stream);
                self.set_status(StreamState::Open, Some(info));
                info!(
                    sample_rate = info.sample_rate,
                    channels = info.channels,
                    buffer = info.buffer_frames,
                    burst = info.burst_frames,
                    "Output stream open"
                );
                true
            }
            Err(e) => {
                error!(err = %e, "Unable to open output stream");
                self.set_status(StreamState::Closed, None);
                false
            }
        }
    }

    /// Starts the stream, opening it first if needed. Failed starts are retried after a pause
    /// with a fresh stream.
    fn start(&mut self) -> bool {
        if self.state() == StreamState::Started {
            return true;
        }

        let attempts = self.context.policy.attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                spin_sleep::sleep(self.context.policy.retry_delay);
            }
            if (attempt > 1 || self.stream.is_none()) && !self.open() {
                continue;
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            match stream.start() {
                Ok(()) => {
                    let info = stream.info();
                    self.set_status(StreamState::Started, Some(info));
                    info!(attempt, "Output stream started");
                    return true;
                }
                Err(e) => warn!(attempt, attempts, err = %e, "Unable to start output stream"),
            }
        }
        error!(attempts, "Giving up starting output stream");
        false
    }

    /// Stops every voice, then reopens and restarts the stream.
    fn recover(&mut self) -> bool {
        for voice in self.context.ensemble.voices() {
            voice.stop();
        }
        self.teardown();
        self.open() && self.start()
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.stop() {
                warn!(err = %e, "Unable to stop output stream");
            }
        }
    }

    fn teardown(&mut self) {
        if self.stream.is_none() {
            return;
        }
        self.close();
        self.set_status(StreamState::Closed, None);
        info!(
            xruns = self.context.stats.xruns(),
            recommended_bursts = self.context.stats.recommended_bursts(),
            "Output stream closed"
        );
    }
}
