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
//! A cooperative job scheduler for automation that outlives a single call: fades, triggers and
//! releases.
//!
//! All jobs run on one non-real-time thread. Each job is polled when its deadline comes due and
//! reports when it wants to run next, so many ramps can be in flight without a thread each.
//! Jobs due at the same instant are polled in the order they were submitted. Dropping the
//! [`Automation`] stops the thread and discards unfinished jobs.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, span, warn, Level};

use crate::engine::Ensemble;
use crate::fade::{Fade, FadeTarget};

/// What a job wants after being polled.
pub enum Step {
    /// Poll again at the given instant.
    Continue(Instant),
    /// Replace this job with another, polled straight away in this job's place.
    Then(Box<dyn Job>),
    /// Finished.
    Done,
}

/// A unit of automation work.
pub trait Job: Send {
    fn name(&self) -> &'static str;

    /// Advances the job. `now` is the time the scheduler woke up.
    fn poll(&mut self, now: Instant) -> Step;
}

struct Scheduled {
    due: Instant,
    job: Box<dyn Job>,
}

/// Handle to the automation thread.
pub struct Automation {
    sender: Option<Sender<Box<dyn Job>>>,
    handle: Option<JoinHandle<()>>,
}

impl Automation {
    pub fn new() -> io::Result<Automation> {
        let (sender, receiver) = unbounded::<Box<dyn Job>>();
        let handle = thread::Builder::new()
            .name("ensemble-automation".into())
            .spawn(move || run(receiver))?;
        Ok(Automation {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queues a job. It is first polled as soon as the thread picks it up.
    pub fn submit(&self, job: Box<dyn Job>) {
        let name = job.name();
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if sender.send(job).is_err() {
            warn!(job = name, "Automation thread has stopped, dropping job");
        }
    }
}

impl Drop for Automation {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Automation thread panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Box<dyn Job>>) {
    let span = span!(Level::DEBUG, "automation");
    let _enter = span.enter();

    let mut jobs: Vec<Scheduled> = Vec::new();
    loop {
        let received = match jobs.iter().map(|s| s.due).min() {
            Some(deadline) => receiver.recv_deadline(deadline),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(job) => jobs.push(Scheduled {
                due: Instant::now(),
                job,
            }),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(job) = receiver.try_recv() {
            jobs.push(Scheduled {
                due: Instant::now(),
                job,
            });
        }

        let now = Instant::now();
        let mut index = 0;
        while index < jobs.len() {
            if jobs[index].due > now {
                index += 1;
                continue;
            }
            match jobs[index].job.poll(now) {
                Step::Continue(due) => {
                    jobs[index].due = due;
                    index += 1;
                }
                Step::Then(next) => {
                    debug!(from = jobs[index].job.name(), to = next.name(), "Job chained");
                    jobs[index] = Scheduled { due: now, job: next };
                    index += 1;
                }
                Step::Done => {
                    debug!(job = jobs[index].job.name(), "Job finished");
                    jobs.remove(index);
                }
            }
        }
    }

    if !jobs.is_empty() {
        debug!(pending = jobs.len(), "Automation stopped with jobs in flight");
    }
}

/// Timing of the trigger and release sequences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerTimings {
    pub fade_steps: u32,
    pub fade: Duration,
    pub settle: Duration,
    pub release_stop_delay: Duration,
}

impl Default for TriggerTimings {
    fn default() -> Self {
        Self {
            fade_steps: 300,
            fade: Duration::from_millis(180),
            settle: Duration::from_millis(20),
            release_stop_delay: Duration::from_millis(200),
        }
    }
}

/// Starts every voice at the triggered voice's position, lets the streams settle, then fades
/// the ensemble back to its stored gains.
pub struct TriggerDown {
    ensemble: Arc<Ensemble>,
    index: usize,
    timings: TriggerTimings,
    started: bool,
}

impl TriggerDown {
    pub fn new(ensemble: Arc<Ensemble>, index: usize, timings: TriggerTimings) -> Self {
        Self {
            ensemble,
            index,
            timings,
            started: false,
        }
    }
}

impl Job for TriggerDown {
    fn name(&self) -> &'static str {
        "trigger down"
    }

    fn poll(&mut self, now: Instant) -> Step {
        if !self.started {
            self.started = true;
            let voices = self.ensemble.voices();
            let Some(reference) = voices.get(self.index) else {
                warn!(voice = self.index, "Triggered voice no longer exists");
                return Step::Done;
            };
            let position = reference.current_sample_index();
            let channels = reference.channel_count();
            for voice in &voices {
                voice.play_from_reference(position, channels);
            }
            debug!(
                voice = self.index,
                position,
                voices = voices.len(),
                "Ensemble started"
            );
            return Step::Continue(now + self.timings.settle);
        }

        Step::Then(Box::new(Fade::new(
            self.ensemble.clone(),
            FadeTarget::Stored,
            self.timings.fade,
            self.timings.fade_steps,
        )))
    }
}

/// Captures the ensemble's gains, fades everything out, then stops every voice once the stop
/// delay has passed. Optionally hands over to another job when finished.
pub struct Release {
    ensemble: Arc<Ensemble>,
    timings: TriggerTimings,
    state: ReleaseState,
    and_then: Option<Box<dyn Job>>,
}

enum ReleaseState {
    Idle,
    Fading { fade: Fade, stop_at: Instant },
    Waiting { stop_at: Instant },
}

impl Release {
    pub fn new(ensemble: Arc<Ensemble>, timings: TriggerTimings) -> Self {
        Self {
            ensemble,
            timings,
            state: ReleaseState::Idle,
            and_then: None,
        }
    }

    /// Runs `job` once every voice has been stopped.
    pub fn and_then(mut self, job: Box<dyn Job>) -> Self {
        self.and_then = Some(job);
        self
    }

    fn stop_all(&mut self) -> Step {
        for voice in self.ensemble.voices() {
            voice.stop();
        }
        debug!("Ensemble released");
        match self.and_then.take() {
            Some(job) => Step::Then(job),
            None => Step::Done,
        }
    }
}

impl Job for Release {
    fn name(&self) -> &'static str {
        "release"
    }

    fn poll(&mut self, now: Instant) -> Step {
        match &mut self.state {
            ReleaseState::Idle => {
                self.ensemble
                    .stored_gains()
                    .capture(&self.ensemble.voices());
                let mut fade = Fade::new(
                    self.ensemble.clone(),
                    FadeTarget::Gain(0.0),
                    self.timings.fade,
                    self.timings.fade_steps,
                );
                let stop_at = now + self.timings.release_stop_delay;
                match fade.poll(now) {
                    Step::Continue(next) => {
                        self.state = ReleaseState::Fading { fade, stop_at };
                        Step::Continue(next.min(stop_at))
                    }
                    _ => {
                        self.state = ReleaseState::Waiting { stop_at };
                        Step::Continue(stop_at)
                    }
                }
            }
            ReleaseState::Fading { fade, stop_at } => {
                let stop_at = *stop_at;
                match fade.poll(now) {
                    Step::Continue(next) => Step::Continue(next),
                    _ if now >= stop_at => self.stop_all(),
                    _ => {
                        self.state = ReleaseState::Waiting { stop_at };
                        Step::Continue(stop_at)
                    }
                }
            }
            ReleaseState::Waiting { stop_at } => {
                if now >= *stop_at {
                    self.stop_all()
                } else {
                    Step::Continue(*stop_at)
                }
            }
        }
    }
}
