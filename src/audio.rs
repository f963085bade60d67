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
use std::{fmt, sync::Arc};

use crate::config;

pub mod cpal;
pub mod format;
pub mod mixer;
pub mod mock;
pub mod sample_source;
mod thread_priority;

pub use format::{SampleFormat, StreamFormat, TargetFormat};
pub use mixer::AudioMixer;

/// Receives interleaved f32 input buffers on the device's input callback.
/// Implementations must not block.
pub type InputSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Errors raised by an audio device.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("no device found with name {0}")]
    NotFound(String),

    #[error("device {0} has no usable input")]
    NoInput(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("an input sink is already attached")]
    InputBusy,
}

/// Outcome of one offline render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// The given number of frames were rendered.
    Success(usize),
    /// A device node could not supply input yet. Retry.
    InsufficientInput,
    /// Rendering is not possible in the current context. Retry.
    CannotRenderNow,
    /// A hard failure, carrying the device status code.
    Error(i32),
}

/// The audio graph host: a live output stream pulling the mix bus, an
/// optional input stream feeding a sink, and an offline render mode.
pub trait Device: fmt::Display + Send + Sync {
    /// The format the device renders the bus in.
    fn output_format(&self) -> StreamFormat;

    /// The native format of the input, or None if it cannot be queried.
    fn input_format(&self) -> Option<StreamFormat>;

    /// Starts pulling the mixer into the output. Starting a running device is a no-op.
    fn start(&self, mixer: Arc<AudioMixer>) -> Result<(), DeviceError>;

    /// Stops the output (and input, if attached). Stopping a stopped device is a no-op.
    fn stop(&self);

    /// Returns true while the output is running.
    fn is_running(&self) -> bool;

    /// Attaches an input sink. Input flows while the device is running.
    fn attach_input(&self, sink: InputSink) -> Result<(), DeviceError>;

    /// Detaches the input sink, if any.
    fn detach_input(&self);

    /// Switches the device into offline render mode.
    fn enter_offline(&self, _max_frames: usize) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Leaves offline render mode.
    fn exit_offline(&self) {}

    /// Renders up to `frames` frames of the mixer into `output`.
    fn render_offline(&self, mixer: &AudioMixer, output: &mut [f32], frames: usize) -> RenderStatus {
        mixer.process_into_output(output, frames);
        RenderStatus::Success(frames)
    }
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, DeviceError> {
    cpal::Device::list()
}

/// Gets the device named in the engine configuration.
pub fn get_device(config: &config::EngineConfig) -> Result<Arc<dyn Device>, DeviceError> {
    let format = StreamFormat::new(config.sample_rate(), config.channels());
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device, format)));
    };

    Ok(Arc::new(cpal::Device::get(
        device,
        config.input_device(),
        format,
    )?))
}
