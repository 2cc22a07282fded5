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
use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ensemble::audio;
use ensemble::config;
use ensemble::store::SampleStore;
use ensemble::util::{duration_minutes_seconds, filename_display};
use ensemble::MixEngine;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A multi-voice sample player with tempo and pitch control."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Decodes a file and prints its format.
    Info {
        /// The audio file to inspect.
        path: PathBuf,
    },
    /// Plays files together as one ensemble.
    Play {
        /// The audio files to play. Each becomes one voice.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Engine configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Tempo ratio, 1.0 being the original speed.
        #[arg(short, long, default_value_t = 1.0)]
        tempo: f64,
        /// Transposition in semitones.
        #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
        pitch: f64,
        /// Pan for every voice, -1.0 (left) to 1.0 (right).
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        pan: f32,
        /// Indexes of voices that keep their original pitch.
        #[arg(long, value_delimiter = ',')]
        pitch_exempt: Vec<usize>,
        /// Start position in seconds.
        #[arg(long, default_value_t = 0.0)]
        start: f64,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Info { path } => {
            let store = SampleStore::from_file(&path)?;
            println!("{}:", filename_display(&path));
            println!("- Channels: {}", store.channel_count());
            println!("- Sample rate: {}Hz", store.sample_rate());
            println!("- Frames: {}", store.frame_count());
            println!(
                "- Duration: {}",
                duration_minutes_seconds(store.duration())
            );
            println!("- Memory: {} bytes", store.memory_size());
        }
        Commands::Play {
            paths,
            config: config_path,
            tempo,
            pitch,
            pan,
            pitch_exempt,
            start,
        } => {
            let engine_config = config::load(config_path.as_deref())?;
            let engine = MixEngine::new(&engine_config)?;
            if !engine.configure(engine_config.channels()) {
                return Err("unable to open the output device".into());
            }
            let rate = engine
                .sample_rate()
                .ok_or("output device did not report a sample rate")?;

            // Decode and convert in parallel, then attach in argument order.
            let stores = paths
                .par_iter()
                .map(|path| {
                    SampleStore::from_file(path)
                        .and_then(|store| store.resampled(rate))
                        .map_err(|e| format!("{}: {}", path.display(), e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            for (path, store) in paths.iter().zip(stores) {
                let index = engine.add_voice(store, pan)?;
                info!(voice = index, file = filename_display(path), "Loaded");
            }

            engine.set_tempo(tempo);
            engine.set_pitch_semitones(pitch);
            engine.set_pitch_exempt(&pitch_exempt);
            engine.set_current_time(start);

            if !engine.start() {
                return Err("unable to start the output stream".into());
            }
            engine.trigger_down(0);
            wait_for_end(&engine, paths.len());

            engine.trigger_up(0);
            thread::sleep(Duration::from_millis(250));
            engine.teardown();
            println!("Finished ({} xruns).", engine.xrun_count());
        }
    }

    Ok(())
}

/// Blocks until every voice has finished. A device fault stops all voices, so playback picks up
/// again from where the ensemble was.
fn wait_for_end(engine: &MixEngine, voices: usize) {
    // Give the trigger time to start the ensemble.
    thread::sleep(Duration::from_millis(100));
    let mut position = engine.playback_time();
    loop {
        thread::sleep(Duration::from_millis(50));
        if engine.output_reset() {
            engine.clear_output_reset();
            warn!(position, "Output was reset, resuming");
            engine.set_current_time(position);
            engine.trigger_down(0);
            thread::sleep(Duration::from_millis(100));
            continue;
        }
        if (0..voices).all(|index| !engine.is_playing(index)) {
            return;
        }
        position = engine.playback_time();
    }
}
