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

//! Voice allocation for tracks.
//!
//! Tokenized tracks reuse freed voices. Tracks without a token always get a
//! fresh voice and are addressed by file and start frame.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::loader::LoadedTrack;
use crate::audio::mixer::{InputId, InputState};
use crate::audio::AudioMixer;
use crate::tracks::TrackToken;

/// Global voice ID counter.
static NEXT_VOICE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a voice for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(u64);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Free,
    InUse,
}

/// One mixer input, attached for as long as the voice exists.
struct Voice {
    id: VoiceId,
    input: InputId,
    state: VoiceState,
}

/// What a tokenized voice is playing.
struct Binding {
    voice: VoiceId,
    path: PathBuf,
    start_frame: Option<u64>,
}

/// A voice bound to a track without a token. Bindings compare by path and
/// start frame only, so two identical untokenized tracks cannot be told apart.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyBinding {
    pub path: PathBuf,
    pub start_frame: Option<u64>,
    voice: VoiceId,
}

/// Gain and pan of a voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceMix {
    pub gain: f32,
    pub pan: f32,
}

impl LegacyBinding {
    fn matches(&self, path: &Path, start_frame: Option<u64>) -> bool {
        self.path == path && self.start_frame == start_frame
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }
}

/// Reusable playback voices on a shared mixer. Every method that changes a
/// voice's state also updates its binding, so the two never disagree.
pub struct VoicePool {
    mixer: Arc<AudioMixer>,
    /// Voices in creation order.
    voices: Vec<Voice>,
    bindings: HashMap<TrackToken, Binding>,
    legacy: Vec<LegacyBinding>,
}

impl VoicePool {
    pub fn new(mixer: Arc<AudioMixer>) -> VoicePool {
        VoicePool {
            mixer,
            voices: Vec::new(),
            bindings: HashMap::new(),
            legacy: Vec::new(),
        }
    }

    pub fn mixer(&self) -> &Arc<AudioMixer> {
        &self.mixer
    }

    fn attach_voice(&mut self) -> VoiceId {
        let id = VoiceId(NEXT_VOICE_ID.fetch_add(1, Ordering::Relaxed));
        let input = self.mixer.attach();
        debug!(voice = %id, input, "Attached voice");
        self.voices.push(Voice {
            id,
            input,
            state: VoiceState::InUse,
        });
        id
    }

    fn voice(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.iter().find(|v| v.id == id)
    }

    fn voice_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        self.voices.iter_mut().find(|v| v.id == id)
    }

    fn input_of(&self, id: VoiceId) -> Option<InputId> {
        self.voice(id).map(|v| v.input)
    }

    /// Schedules decoded audio on a voice. A token already bound keeps its
    /// voice; a new token takes the first free voice or attaches one. Without
    /// a token a new voice is always attached. The voice is left stopped.
    pub fn schedule_file(
        &mut self,
        path: &Path,
        track: &LoadedTrack,
        start_frame: Option<u64>,
        token: Option<TrackToken>,
    ) -> VoiceId {
        let voice = match token {
            Some(token) => {
                let voice = match self.bindings.get(&token) {
                    Some(binding) => binding.voice,
                    None => self.allocate(),
                };
                self.bindings.insert(
                    token,
                    Binding {
                        voice,
                        path: path.to_path_buf(),
                        start_frame,
                    },
                );
                voice
            }
            None => {
                let voice = self.attach_voice();
                self.legacy.push(LegacyBinding {
                    path: path.to_path_buf(),
                    start_frame,
                    voice,
                });
                voice
            }
        };

        if let Some(input) = self.input_of(voice) {
            self.mixer.reset(input);
            self.mixer
                .schedule(input, track.scheduled_at(start_frame.unwrap_or(0)));
        }
        info!(
            voice = %voice,
            token = ?token,
            path = ?path,
            start_frame = start_frame.unwrap_or(0),
            "Scheduled file"
        );
        voice
    }

    /// Takes the first free voice, resetting its gain and pan, or attaches a
    /// new one.
    fn allocate(&mut self) -> VoiceId {
        let free = self
            .voices
            .iter_mut()
            .find(|v| v.state == VoiceState::Free)
            .map(|v| {
                v.state = VoiceState::InUse;
                (v.id, v.input)
            });
        match free {
            Some((id, input)) => {
                self.mixer.set_gain(input, 1.0);
                self.mixer.set_pan(input, 0.0);
                debug!(voice = %id, "Reusing free voice");
                id
            }
            None => self.attach_voice(),
        }
    }

    /// Frees the voice bound to the token. The voice stays attached, stopped
    /// and empty, ready for reuse.
    pub fn release_voice(&mut self, token: TrackToken) -> Option<VoiceId> {
        let binding = self.bindings.remove(&token)?;
        let input = {
            let voice = self.voice_mut(binding.voice)?;
            voice.state = VoiceState::Free;
            voice.input
        };
        self.mixer.reset(input);
        debug!(voice = %binding.voice, token = %token, "Released voice");
        Some(binding.voice)
    }

    /// Detaches a voice from the mixer and forgets it.
    pub fn unload(&mut self, id: VoiceId) -> bool {
        let Some(index) = self.voices.iter().position(|v| v.id == id) else {
            return false;
        };
        let voice = self.voices.remove(index);
        self.mixer.detach(voice.input);
        self.bindings.retain(|_, binding| binding.voice != id);
        self.legacy.retain(|binding| binding.voice != id);
        debug!(voice = %id, "Unloaded voice");
        true
    }

    /// Unloads every voice bound to an untokenized track. Returns each one's
    /// file and mix settings in binding order.
    pub fn unload_all_legacy(&mut self) -> Vec<(PathBuf, VoiceMix)> {
        let unloaded: Vec<(VoiceId, PathBuf, Option<VoiceMix>)> = self
            .legacy
            .iter()
            .map(|b| (b.voice, b.path.clone(), self.mix(b.voice)))
            .collect();
        let mut settings = Vec::with_capacity(unloaded.len());
        for (voice, path, mix) in unloaded {
            self.unload(voice);
            if let Some(mix) = mix {
                settings.push((path, mix));
            }
        }
        settings
    }

    /// Current gain and pan of a voice.
    pub fn mix(&self, voice: VoiceId) -> Option<VoiceMix> {
        let input = self.input_of(voice)?;
        Some(VoiceMix {
            gain: self.mixer.gain(input)?,
            pan: self.mixer.pan(input)?,
        })
    }

    pub fn apply_mix(&self, voice: VoiceId, mix: VoiceMix) -> bool {
        self.input_of(voice).is_some_and(|input| {
            self.mixer.set_gain(input, mix.gain) && self.mixer.set_pan(input, mix.pan)
        })
    }

    pub fn set_volume(&self, token: TrackToken, volume: f32) -> bool {
        self.bound_input(token)
            .is_some_and(|input| self.mixer.set_gain(input, volume))
    }

    pub fn set_pan(&self, token: TrackToken, pan: f32) -> bool {
        self.bound_input(token)
            .is_some_and(|input| self.mixer.set_pan(input, pan))
    }

    pub fn set_legacy_volume(&self, path: &Path, start_frame: Option<u64>, volume: f32) -> bool {
        self.legacy_input(path, start_frame)
            .is_some_and(|input| self.mixer.set_gain(input, volume))
    }

    pub fn set_legacy_pan(&self, path: &Path, start_frame: Option<u64>, pan: f32) -> bool {
        self.legacy_input(path, start_frame)
            .is_some_and(|input| self.mixer.set_pan(input, pan))
    }

    pub fn volume(&self, token: TrackToken) -> Option<f32> {
        self.bound_input(token)
            .and_then(|input| self.mixer.gain(input))
    }

    pub fn pan(&self, token: TrackToken) -> Option<f32> {
        self.bound_input(token).and_then(|input| self.mixer.pan(input))
    }

    fn bound_input(&self, token: TrackToken) -> Option<InputId> {
        self.bindings
            .get(&token)
            .and_then(|binding| self.input_of(binding.voice))
    }

    fn legacy_input(&self, path: &Path, start_frame: Option<u64>) -> Option<InputId> {
        self.legacy
            .iter()
            .find(|binding| binding.matches(path, start_frame))
            .and_then(|binding| self.input_of(binding.voice))
    }

    fn in_use_inputs(&self) -> impl Iterator<Item = InputId> + '_ {
        self.voices
            .iter()
            .filter(|v| v.state == VoiceState::InUse)
            .map(|v| v.input)
    }

    /// Starts or resumes every in-use voice.
    pub fn play_all(&self) {
        for input in self.in_use_inputs() {
            self.mixer.play(input);
        }
    }

    pub fn pause_all(&self) {
        for input in self.in_use_inputs() {
            self.mixer.pause(input);
        }
    }

    /// Moves every in-use voice to the given frame.
    pub fn seek_all(&self, frame: u64) {
        for input in self.in_use_inputs() {
            self.mixer.seek(input, frame);
        }
    }

    /// Starts a single voice at the given frame.
    pub fn play_from(&self, voice: VoiceId, frame: u64) {
        if let Some(input) = self.input_of(voice) {
            self.mixer.seek(input, frame);
            self.mixer.play(input);
        }
    }

    /// Position in frames of the first in-use tokenized voice, else the first
    /// untokenized voice, else 0. Only as accurate as that one voice.
    pub fn current_position(&self) -> u64 {
        let tokenized = self.voices.iter().find(|v| {
            v.state == VoiceState::InUse && self.bindings.values().any(|b| b.voice == v.id)
        });
        let voice = match tokenized {
            Some(voice) => Some(voice.id),
            None => self.legacy.first().map(|b| b.voice),
        };
        voice
            .and_then(|id| self.input_of(id))
            .and_then(|input| self.mixer.position(input))
            .unwrap_or(0)
    }

    /// Returns true if any in-use voice is playing.
    pub fn any_playing(&self) -> bool {
        self.in_use_inputs()
            .any(|input| self.mixer.state(input) == Some(InputState::Playing))
    }

    pub fn voice_for(&self, token: TrackToken) -> Option<VoiceId> {
        self.bindings.get(&token).map(|b| b.voice)
    }

    /// The file and start frame bound to the token.
    pub fn binding_for(&self, token: TrackToken) -> Option<(&Path, Option<u64>)> {
        self.bindings
            .get(&token)
            .map(|b| (b.path.as_path(), b.start_frame))
    }

    pub fn legacy_bindings(&self) -> &[LegacyBinding] {
        &self.legacy
    }

    pub fn state(&self, voice: VoiceId) -> Option<VoiceState> {
        self.voice(voice).map(|v| v.state)
    }

    pub fn input_state(&self, voice: VoiceId) -> Option<InputState> {
        self.input_of(voice).and_then(|input| self.mixer.state(input))
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use_inputs().count()
    }

    pub fn free_count(&self) -> usize {
        self.voice_count() - self.in_use_count()
    }

    /// Returns true if no voice is in use.
    pub fn is_idle(&self) -> bool {
        self.in_use_count() == 0
    }
}
