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
use std::sync::Arc;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use duration_string::DurationString;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use trackbus::audio;
use trackbus::config::EngineConfig;
use trackbus::convert::{self, ConversionFormat};
use trackbus::playsync::CancelHandle;
use trackbus::util::duration_minutes_seconds;
use trackbus::{MixEngine, Track, TransportState};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A multitrack mixing and transport engine."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio devices.
    Devices {},
    /// Plays tracks through the configured device until the mix ends.
    Play {
        /// The path to the engine config.
        config_path: PathBuf,
        /// Tracks relative to the storage root, as <FILE> or <FILE>@<OFFSET>.
        /// The offset is a fraction of the mix length.
        #[arg(required = true)]
        tracks: Vec<Track>,
    },
    /// Renders tracks to a WAV file in the storage root.
    Bounce {
        /// The path to the engine config.
        config_path: PathBuf,
        /// Tracks relative to the storage root, as <FILE> or <FILE>@<OFFSET>.
        #[arg(required = true)]
        tracks: Vec<Track>,
    },
    /// Records the configured input to a WAV file in the storage root.
    Record {
        /// The path to the engine config.
        config_path: PathBuf,
        /// How long to record for, e.g. 30s or 2m.
        duration: String,
    },
    /// Converts an audio file, writing the result next to the input.
    Convert {
        /// The file to convert.
        input: PathBuf,
        /// Output format: aiff, wav, aac or mp3.
        #[arg(short, long, default_value = "aiff")]
        format: String,
        /// Output sample rate.
        #[arg(short, long, default_value_t = 44100)]
        sample_rate: u32,
        /// Output bit depth. 32-bit WAV writes float samples.
        #[arg(short, long, default_value_t = 16)]
        bits: u16,
        /// Output bit rate for mp3.
        #[arg(long, default_value_t = 192_000)]
        bit_rate: u32,
    },
}

fn load_engine(config: &EngineConfig, tracks: Vec<Track>) -> Result<Arc<MixEngine>, Box<dyn Error>> {
    let engine = Arc::new(MixEngine::new(config)?);
    let report = engine.load_all_tracks_and_add_to_mix(tracks);
    for (track, err) in report.failed.iter() {
        warn!(track = %track, err = %err, "Skipping track");
    }
    if report.loaded.is_empty() {
        return Err("no tracks could be loaded".into());
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
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
        Commands::Play {
            config_path,
            tracks,
        } => {
            let config = EngineConfig::deserialize(&config_path)?;
            let engine = load_engine(&config, tracks)?;
            println!(
                "Playing {} tracks ({})",
                engine.tracks().len(),
                duration_minutes_seconds(Duration::from_secs_f64(engine.mix_length()))
            );

            engine.play()?;
            let mut interval = tokio::time::interval(config.progress_interval()?);
            loop {
                interval.tick().await;
                engine.tick()?;
                if engine.transport_state() == TransportState::Stopped {
                    break;
                }
            }
        }
        Commands::Bounce {
            config_path,
            tracks,
        } => {
            let config = EngineConfig::deserialize(&config_path)?;
            let engine = load_engine(&config, tracks)?;
            let cancel = CancelHandle::new();
            let path = tokio::task::spawn_blocking(move || engine.bounce(&cancel)).await??;
            match path {
                Some(path) => println!("Bounced to {}", path.display()),
                None => println!("Nothing to bounce."),
            }
        }
        Commands::Record {
            config_path,
            duration,
        } => {
            let duration: Duration = DurationString::from_string(duration)
                .map_err(|e| e.to_string())?
                .into();
            let config = EngineConfig::deserialize(&config_path)?;
            let engine = MixEngine::new(&config)?;

            let filename = engine.start_capture()?;
            println!(
                "Recording {} to {}",
                duration_minutes_seconds(duration),
                filename
            );
            tokio::time::sleep(duration).await;
            if let Some(path) = engine.stop_capture()? {
                println!("Recorded {}", path.display());
            }
        }
        Commands::Convert {
            input,
            format,
            sample_rate,
            bits,
            bit_rate,
        } => {
            let format = match format.to_lowercase().as_str() {
                "aiff" | "aif" => ConversionFormat::Aiff {
                    sample_rate,
                    bits_per_sample: bits,
                },
                "wav" => ConversionFormat::Wav {
                    sample_rate,
                    bits_per_sample: bits,
                },
                "aac" | "m4a" => ConversionFormat::Aac { sample_rate },
                "mp3" => ConversionFormat::Mp3 {
                    sample_rate,
                    bit_rate,
                },
                other => return Err(format!("unknown output format {}", other).into()),
            };
            let output = convert::convert(&input, format)?;
            println!("Converted to {}", output.display());
        }
    }

    Ok(())
}
