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
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use tracing::debug;

pub mod engine;
pub mod error;

pub use engine::Engine;
pub use error::ConfigError;

/// Loads the engine configuration from an optional YAML file, with `ENSEMBLE_*` environment
/// variables taking precedence.
pub fn load(path: Option<&Path>) -> Result<Engine, ConfigError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        debug!(path = %path.display(), "Loading configuration");
        builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
    }
    let engine: Engine = builder
        .add_source(Environment::with_prefix("ENSEMBLE").try_parsing(true))
        .build()?
        .try_deserialize()?;
    engine.validate()?;
    Ok(engine)
}

/// Parses an engine configuration from a YAML string.
pub fn parse(yaml: &str) -> Result<Engine, ConfigError> {
    let engine: Engine = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    engine.validate()?;
    Ok(engine)
}
