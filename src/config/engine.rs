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
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, File};
use duration_string::DurationString;
use serde::Deserialize;

use super::ConfigError;

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_MAX_RENDER_FRAMES: usize = 4096;
const DEFAULT_MAX_RENDER_STALLS: u32 = 1000;
const DEFAULT_RENDER_STALL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CAPTURE_QUEUE_BUFFERS: usize = 16;
const DEFAULT_START_ATTEMPTS: u32 = 3;
const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_SKIP_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(16);

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct EngineConfig {
    /// Directory that track identifiers resolve against and that recordings
    /// and bounces are written to.
    storage_root: PathBuf,

    /// The output device. Names starting with "mock" select the mock device.
    device: Option<String>,

    /// The input device used for capture. Defaults to the host's default input.
    input_device: Option<String>,

    /// Mix bus sample rate in Hz.
    sample_rate: Option<u32>,

    /// Mix bus channel count.
    channels: Option<u16>,

    /// Frames rendered per offline render call.
    max_render_frames: Option<usize>,

    /// Consecutive soft stalls tolerated before a bounce fails.
    max_render_stalls: Option<u32>,

    /// Time without render progress tolerated before a bounce fails.
    render_stall_timeout: Option<String>,

    /// Input buffers queued between the input callback and the capture writer.
    capture_queue_buffers: Option<usize>,

    /// Attempts made to start the device or create an output file.
    start_attempts: Option<u32>,

    /// Delay between those attempts.
    start_retry_delay: Option<String>,

    /// Distance moved by skip_forward.
    skip_interval: Option<String>,

    /// How often hosts should tick the transport.
    progress_interval: Option<String>,
}

impl EngineConfig {
    /// Creates a configuration with every optional field at its default.
    pub fn new<P: Into<PathBuf>>(storage_root: P) -> EngineConfig {
        EngineConfig {
            storage_root: storage_root.into(),
            device: None,
            input_device: None,
            sample_rate: None,
            channels: None,
            max_render_frames: None,
            max_render_stalls: None,
            render_stall_timeout: None,
            capture_queue_buffers: None,
            start_attempts: None,
            start_retry_delay: None,
            skip_interval: None,
            progress_interval: None,
        }
    }

    /// Loads and validates a configuration file.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that have no sensible fallback.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate() == 0 {
            return Err(ConfigError::Invalid {
                field: "sample_rate",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.channels() == 0 {
            return Err(ConfigError::Invalid {
                field: "channels",
                reason: "must be greater than 0".to_string(),
            });
        }
        self.render_stall_timeout()?;
        self.start_retry_delay()?;
        self.skip_interval()?;
        self.progress_interval()?;
        Ok(())
    }

    /// Sets the output device.
    pub fn with_device(mut self, device: &str) -> EngineConfig {
        self.device = Some(device.to_string());
        self
    }

    /// Sets the bus format.
    pub fn with_format(mut self, sample_rate: u32, channels: u16) -> EngineConfig {
        self.sample_rate = Some(sample_rate);
        self.channels = Some(channels);
        self
    }

    /// Sets the stall limits for offline rendering.
    pub fn with_render_limits(mut self, max_stalls: u32, stall_timeout: &str) -> EngineConfig {
        self.max_render_stalls = Some(max_stalls);
        self.render_stall_timeout = Some(stall_timeout.to_string());
        self
    }

    /// Sets the offline render block size.
    pub fn with_max_render_frames(mut self, frames: usize) -> EngineConfig {
        self.max_render_frames = Some(frames);
        self
    }

    /// Sets the capture queue depth.
    pub fn with_capture_queue_buffers(mut self, buffers: usize) -> EngineConfig {
        self.capture_queue_buffers = Some(buffers);
        self
    }

    /// Sets how often, and how far apart, device starts and file creation are attempted.
    pub fn with_start_policy(mut self, attempts: u32, retry_delay: &str) -> EngineConfig {
        self.start_attempts = Some(attempts);
        self.start_retry_delay = Some(retry_delay.to_string());
        self
    }

    /// Sets the distance moved by skip_forward.
    pub fn with_skip_interval(mut self, interval: &str) -> EngineConfig {
        self.skip_interval = Some(interval.to_string());
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn input_device(&self) -> Option<&str> {
        self.input_device.as_deref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn channels(&self) -> u16 {
        self.channels.unwrap_or(DEFAULT_CHANNELS)
    }

    /// Frames per offline render call, never less than 1.
    pub fn max_render_frames(&self) -> usize {
        self.max_render_frames
            .unwrap_or(DEFAULT_MAX_RENDER_FRAMES)
            .max(1)
    }

    pub fn max_render_stalls(&self) -> u32 {
        self.max_render_stalls.unwrap_or(DEFAULT_MAX_RENDER_STALLS)
    }

    pub fn render_stall_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "render_stall_timeout",
            &self.render_stall_timeout,
            DEFAULT_RENDER_STALL_TIMEOUT,
        )
    }

    /// Capture queue depth, never less than 1.
    pub fn capture_queue_buffers(&self) -> usize {
        self.capture_queue_buffers
            .unwrap_or(DEFAULT_CAPTURE_QUEUE_BUFFERS)
            .max(1)
    }

    /// Start attempts, never less than 1.
    pub fn start_attempts(&self) -> u32 {
        self.start_attempts.unwrap_or(DEFAULT_START_ATTEMPTS).max(1)
    }

    pub fn start_retry_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "start_retry_delay",
            &self.start_retry_delay,
            DEFAULT_START_RETRY_DELAY,
        )
    }

    pub fn skip_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("skip_interval", &self.skip_interval, DEFAULT_SKIP_INTERVAL)
    }

    pub fn progress_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "progress_interval",
            &self.progress_interval,
            DEFAULT_PROGRESS_INTERVAL,
        )
    }
}

fn parse_duration(
    field: &'static str,
    value: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })?
            .into()),
        None => Ok(default),
    }
}
