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
//! A real-time, multi-voice sample playback engine.
//!
//! Samples are decoded into [`store::SampleStore`]s, attached to a [`engine::MixEngine`] as
//! voices and rendered into a single low-latency output stream. The whole ensemble follows one
//! tempo and pitch setting, applied per voice by a [`stretch::TimeStretchProcessor`], and is
//! started and stopped together with short fades.

pub mod audio;
pub mod automation;
pub mod config;
pub mod engine;
pub mod fade;
pub mod store;
pub mod stretch;
pub mod util;
pub mod voice;

#[cfg(test)]
mod testutil;

pub use engine::{EngineError, MixEngine};
