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
/// Errors surfaced by the engine's loading API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No output stream has been opened, so there is no rate to load samples at")]
    NoStream,

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("Unable to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}
