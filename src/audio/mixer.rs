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
// The mix bus. Every voice is one input here; the device producer thread and
// the offline renderer both pull mixed frames through process_into_output.
use std::f32::consts::FRAC_PI_4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::audio::format::StreamFormat;

/// Global input ID counter.
static NEXT_INPUT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one input attached to the mixer.
pub type InputId = u64;

/// Playback state of a single mixer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// Not advancing; position is zero after a reset.
    Stopped,
    /// Advancing one frame per mixed frame.
    Playing,
    /// Not advancing; position is frozen.
    Paused,
}

/// Decoded audio scheduled on an input, starting at a frame of the input's
/// own timeline.
#[derive(Clone)]
pub struct ScheduledAudio {
    /// Interleaved samples at the mixer's sample rate.
    pub data: Arc<Vec<f32>>,
    /// Channels in `data`.
    pub channels: u16,
    /// Frame of the input timeline at which the first sample plays.
    pub start_frame: u64,
}

impl ScheduledAudio {
    /// Number of frames of audio.
    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.data.len() / self.channels as usize) as u64
    }
}

/// Represents one input connected to the bus.
struct MixerInput {
    id: InputId,
    gain: f32,
    pan: f32,
    state: InputState,
    scheduled: Option<ScheduledAudio>,
    /// Frames advanced since the input last started from zero.
    position: u64,
}

/// Sums every attached input into the bus format.
pub struct AudioMixer {
    inputs: RwLock<Vec<MixerInput>>,
    format: StreamFormat,
}

impl AudioMixer {
    /// Creates a new audio mixer
    pub fn new(format: StreamFormat) -> Self {
        Self {
            inputs: RwLock::new(Vec::new()),
            format,
        }
    }

    /// The bus format.
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Gets the number of output channels
    pub fn num_channels(&self) -> u16 {
        self.format.channels
    }

    /// Gets the sample rate
    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Attaches a new silent, stopped input at unity gain and center pan.
    pub fn attach(&self) -> InputId {
        let id = NEXT_INPUT_ID.fetch_add(1, Ordering::Relaxed);
        self.inputs.write().push(MixerInput {
            id,
            gain: 1.0,
            pan: 0.0,
            state: InputState::Stopped,
            scheduled: None,
            position: 0,
        });
        id
    }

    /// Detaches an input. Returns false if it was not attached.
    pub fn detach(&self, id: InputId) -> bool {
        let mut inputs = self.inputs.write();
        let before = inputs.len();
        inputs.retain(|input| input.id != id);
        inputs.len() != before
    }

    /// Returns true if the input is attached.
    pub fn is_attached(&self, id: InputId) -> bool {
        self.inputs.read().iter().any(|input| input.id == id)
    }

    /// Number of attached inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.read().len()
    }

    fn with_input<T>(&self, id: InputId, f: impl FnOnce(&mut MixerInput) -> T) -> Option<T> {
        let mut inputs = self.inputs.write();
        inputs.iter_mut().find(|input| input.id == id).map(f)
    }

    /// Replaces whatever is scheduled on the input.
    pub fn schedule(&self, id: InputId, audio: ScheduledAudio) -> bool {
        self.with_input(id, |input| input.scheduled = Some(audio))
            .is_some()
    }

    /// Starts or resumes the input from its current position.
    pub fn play(&self, id: InputId) -> bool {
        self.with_input(id, |input| input.state = InputState::Playing)
            .is_some()
    }

    /// Freezes the input at its current position.
    pub fn pause(&self, id: InputId) -> bool {
        self.with_input(id, |input| {
            if input.state == InputState::Playing {
                input.state = InputState::Paused;
            }
        })
        .is_some()
    }

    /// Stops the input, rewinds it to zero and clears scheduled audio.
    pub fn reset(&self, id: InputId) -> bool {
        self.with_input(id, |input| {
            input.state = InputState::Stopped;
            input.position = 0;
            input.scheduled = None;
        })
        .is_some()
    }

    /// Moves the input's timeline to the given frame.
    pub fn seek(&self, id: InputId, frame: u64) -> bool {
        self.with_input(id, |input| input.position = frame)
            .is_some()
    }

    /// Sets the input gain, clamped to [0, 1].
    pub fn set_gain(&self, id: InputId, gain: f32) -> bool {
        self.with_input(id, |input| input.gain = gain.clamp(0.0, 1.0))
            .is_some()
    }

    /// Sets the input pan, clamped to [-1, 1].
    pub fn set_pan(&self, id: InputId, pan: f32) -> bool {
        self.with_input(id, |input| input.pan = pan.clamp(-1.0, 1.0))
            .is_some()
    }

    pub fn gain(&self, id: InputId) -> Option<f32> {
        self.with_input(id, |input| input.gain)
    }

    pub fn pan(&self, id: InputId) -> Option<f32> {
        self.with_input(id, |input| input.pan)
    }

    pub fn state(&self, id: InputId) -> Option<InputState> {
        self.with_input(id, |input| input.state)
    }

    /// Frames the input has advanced since it last started from zero.
    pub fn position(&self, id: InputId) -> Option<u64> {
        self.with_input(id, |input| input.position)
    }

    /// Mixes `frames` frames into the front of `output`, overwriting it.
    /// `output` must hold at least `frames * num_channels` samples.
    pub fn process_into_output(&self, output: &mut [f32], frames: usize) {
        let out_channels = self.format.channels as usize;
        let len = (frames * out_channels).min(output.len());
        let frames = len / out_channels.max(1);
        output[..len].fill(0.0);

        let mut inputs = self.inputs.write();
        for input in inputs.iter_mut() {
            if input.state != InputState::Playing {
                continue;
            }
            mix_input(input, &mut output[..len], frames, out_channels);
            input.position += frames as u64;
        }
    }

    /// Processes multiple frames of audio mixing into a new buffer.
    pub fn process_frames(&self, num_frames: usize) -> Vec<f32> {
        let mut frames = vec![0.0f32; num_frames * self.format.channels as usize];
        self.process_into_output(&mut frames, num_frames);
        frames
    }
}

/// Adds the overlap of the input's scheduled audio with the current block.
fn mix_input(input: &MixerInput, output: &mut [f32], frames: usize, out_channels: usize) {
    let audio = match input.scheduled.as_ref() {
        Some(audio) => audio,
        None => return,
    };
    let src_channels = audio.channels as usize;
    if src_channels == 0 || out_channels == 0 {
        return;
    }

    let block_start = input.position;
    let block_end = block_start + frames as u64;
    let audio_start = audio.start_frame;
    let audio_end = audio_start + audio.frames();
    let from = block_start.max(audio_start);
    let to = block_end.min(audio_end);
    if from >= to {
        return;
    }

    let (left, right) = pan_gains(input.pan, src_channels);
    for pos in from..to {
        let src = (pos - audio_start) as usize * src_channels;
        let dst = (pos - block_start) as usize * out_channels;
        route_frame(
            &audio.data[src..src + src_channels],
            &mut output[dst..dst + out_channels],
            input.gain,
            left,
            right,
        );
    }
}

/// Equal-power pan for mono sources, balance for everything wider.
fn pan_gains(pan: f32, src_channels: usize) -> (f32, f32) {
    if src_channels == 1 {
        let angle = (pan + 1.0) * FRAC_PI_4;
        (angle.cos(), angle.sin())
    } else {
        ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
    }
}

fn route_frame(frame: &[f32], out: &mut [f32], gain: f32, left: f32, right: f32) {
    if out.len() == 1 {
        let sum: f32 = frame.iter().sum();
        out[0] += sum / frame.len() as f32 * gain;
        return;
    }
    if frame.len() == 1 {
        out[0] += frame[0] * gain * left;
        out[1] += frame[0] * gain * right;
        return;
    }
    for (ch, sample) in frame.iter().enumerate().take(out.len()) {
        let balance = match ch {
            0 => left,
            1 => right,
            _ => 1.0,
        };
        out[ch] += sample * gain * balance;
    }
}
