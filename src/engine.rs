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
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::watch;
use tracing::{debug, info, span, warn, Level, Span};

use crate::audio::{self, AudioMixer, Device};
use crate::bounce::{self, RenderLimits};
use crate::capture::CaptureSession;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::playsync::CancelHandle;
use crate::tracks::{LoadReport, Track, TrackRegistry, TrackToken};
use crate::transport::{self, PlayTransition, Transport, TransportState};
use crate::util;
use crate::voices::{LoadedTrack, TrackLoader, VoiceId, VoicePool, VoiceState};

#[cfg(test)]
mod tests;

/// The exclusive mode the engine is in, if any.
enum Session {
    Capture(CaptureSession),
    Bounce,
}

impl Session {
    fn kind(&self) -> &'static str {
        match self {
            Session::Capture(_) => "capture",
            Session::Bounce => "bounce",
        }
    }
}

/// Everything the control plane mutates, guarded by one lock.
struct EngineState {
    pool: VoicePool,
    registry: TrackRegistry,
    transport: Transport,
    session: Option<Session>,
}

impl EngineState {
    /// Rejects transport changes while a bounce owns the mix.
    fn check_not_bouncing(&self) -> Result<(), EngineError> {
        match self.session {
            Some(Session::Bounce) => Err(EngineError::SessionActive("bounce")),
            _ => Ok(()),
        }
    }

    fn is_capturing(&self) -> bool {
        matches!(self.session, Some(Session::Capture(_)))
    }
}

/// Plays a set of file-backed tracks through a device, records input and
/// bounces the mix. All mutations go through one lock; the device pulls the
/// shared mixer on its own threads.
pub struct MixEngine {
    device: Arc<dyn Device>,
    mixer: Arc<AudioMixer>,
    loader: TrackLoader,
    state: Mutex<EngineState>,
    storage_root: PathBuf,
    sample_rate: u32,
    limits: RenderLimits,
    start_attempts: u32,
    start_retry_delay: Duration,
    skip_interval: Duration,
    capture_queue_buffers: usize,
    span: Span,
}

impl MixEngine {
    /// Creates an engine on the device named in the configuration.
    pub fn new(config: &EngineConfig) -> Result<MixEngine, EngineError> {
        let device = audio::get_device(config)?;
        MixEngine::with_device(config, device)
    }

    /// Creates an engine on the given device. The mix bus takes the device's
    /// output format.
    pub fn with_device(
        config: &EngineConfig,
        device: Arc<dyn Device>,
    ) -> Result<MixEngine, EngineError> {
        config.validate()?;
        let format = device.output_format();
        let mixer = Arc::new(AudioMixer::new(format));
        let storage_root = config.storage_root().to_path_buf();
        info!(device = %device, format = %format, root = ?storage_root, "Creating mix engine");

        Ok(MixEngine {
            loader: TrackLoader::new(format.sample_rate),
            state: Mutex::new(EngineState {
                pool: VoicePool::new(mixer.clone()),
                registry: TrackRegistry::new(storage_root.clone()),
                transport: Transport::new(),
                session: None,
            }),
            device,
            mixer,
            storage_root,
            sample_rate: format.sample_rate,
            limits: RenderLimits {
                max_frames: config.max_render_frames(),
                max_stalls: config.max_render_stalls(),
                stall_timeout: config.render_stall_timeout()?,
            },
            start_attempts: config.start_attempts(),
            start_retry_delay: config.start_retry_delay()?,
            skip_interval: config.skip_interval()?,
            capture_queue_buffers: config.capture_queue_buffers(),
            span: span!(Level::INFO, "engine"),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Starts the device, retrying a bounded number of times.
    fn start_device(&self) -> Result<(), EngineError> {
        if self.device.is_running() {
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            match self.device.start(self.mixer.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.start_attempts => {
                    warn!(device = %self.device, attempts = attempt, err = %e, "Unable to start device");
                    return Err(EngineError::GraphStart(e));
                }
                Err(e) => {
                    debug!(device = %self.device, attempt, err = %e, "Device start failed, retrying");
                    attempt += 1;
                    thread::sleep(self.start_retry_delay);
                }
            }
        }
    }

    fn decode(&self, path: &Path) -> Result<LoadedTrack, EngineError> {
        self.loader
            .load(path)
            .map_err(|e| EngineError::unavailable(path.display().to_string(), e))
    }

    fn start_frame(&self, registry: &TrackRegistry, track: &Track) -> Option<u64> {
        track
            .start_offset()
            .map(|offset| transport::offset_to_frame(offset, registry.mix_length(), self.sample_rate))
    }

    /// Schedules a decoded track and lines its voice up with the transport.
    fn schedule(
        &self,
        state: &mut EngineState,
        track: &Track,
        path: &Path,
        loaded: &LoadedTrack,
    ) -> VoiceId {
        let position = state.pool.current_position();
        let start_frame = self.start_frame(&state.registry, track);
        let voice = state
            .pool
            .schedule_file(path, loaded, start_frame, track.token());
        state.registry.register(track.clone());

        match state.transport.state() {
            TransportState::Playing => state.pool.play_from(voice, position),
            TransportState::Paused => state.pool.seek_all(position),
            TransportState::Stopped => {}
        }
        voice
    }

    /// Loads a track and adds it to the mix. Re-adding a token rebinds the
    /// same voice.
    pub fn add_track(&self, track: Track) -> Result<VoiceId, EngineError> {
        let _enter = self.span.enter();

        let path = {
            let state = self.state.lock();
            state.check_not_bouncing()?;
            state.registry.resolve(&track)?
        };
        let loaded = self.decode(&path)?;

        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        state.registry.record_duration(track.file(), loaded.duration());
        let voice = self.schedule(&mut state, &track, &path, &loaded);
        info!(track = %track, voice = %voice, "Added track");
        Ok(voice)
    }

    /// Loads every track, decoding in parallel, and adds those that loaded.
    /// Start offsets resolve against the mix length after the whole batch.
    pub fn load_all_tracks_and_add_to_mix(&self, tracks: Vec<Track>) -> LoadReport {
        let _enter = self.span.enter();
        let mut report = LoadReport::default();

        let resolved: Vec<(Track, Result<PathBuf, EngineError>)> = {
            let state = self.state.lock();
            if state.check_not_bouncing().is_err() {
                report.failed = tracks
                    .into_iter()
                    .map(|track| (track, EngineError::SessionActive("bounce")))
                    .collect();
                return report;
            }
            tracks
                .into_iter()
                .map(|track| {
                    let path = state.registry.resolve(&track);
                    (track, path)
                })
                .collect()
        };

        let decoded: Vec<(Track, Result<(PathBuf, LoadedTrack), EngineError>)> = resolved
            .into_par_iter()
            .map(|(track, path)| {
                let result = path.and_then(|path| {
                    let loaded = self.decode(&path)?;
                    Ok((path, loaded))
                });
                (track, result)
            })
            .collect();

        let mut state = self.state.lock();
        let mut ready = Vec::new();
        for (track, result) in decoded {
            match result {
                Ok((path, loaded)) => {
                    state.registry.record_duration(track.file(), loaded.duration());
                    ready.push((track, path, loaded));
                }
                Err(e) => {
                    warn!(track = %track, err = %e, "Unable to load track");
                    report.failed.push((track, e));
                }
            }
        }
        for (track, path, loaded) in ready {
            self.schedule(&mut state, &track, &path, &loaded);
            report.loaded.push(track);
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Loaded tracks"
        );
        report
    }

    /// Removes a tokenized track, freeing its voice for reuse. Its duration
    /// stays recorded; its decoded audio is dropped once no track uses it.
    pub fn remove_track(&self, token: TrackToken) -> Result<bool, EngineError> {
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        let released = state.pool.release_voice(token).is_some();
        let removed = state.registry.unregister(token);
        if let Some(track) = &removed {
            self.evict_unused(&state.registry, track.file());
        }
        Ok(released || removed.is_some())
    }

    /// Unloads every untokenized track.
    pub fn remove_legacy_tracks(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        let files: Vec<String> = state
            .registry
            .tracks()
            .iter()
            .filter(|t| t.token().is_none())
            .map(|t| t.file().to_string())
            .collect();
        state.pool.unload_all_legacy();
        state.registry.unregister_legacy();
        for file in files {
            self.evict_unused(&state.registry, &file);
        }
        Ok(())
    }

    /// Drops the decoded audio of a file no registered track refers to.
    fn evict_unused(&self, registry: &TrackRegistry, file: &str) {
        if registry.tracks().iter().any(|t| t.file() == file) {
            return;
        }
        if self.loader.evict(&self.storage_root.join(file)) {
            debug!(
                file,
                cached = self.loader.cached_count(),
                memory_kb = self.loader.total_memory_usage() / 1024,
                "Evicted decoded track"
            );
        }
    }

    pub fn set_volume(&self, token: TrackToken, volume: f32) -> bool {
        self.state.lock().pool.set_volume(token, volume)
    }

    pub fn set_pan(&self, token: TrackToken, pan: f32) -> bool {
        self.state.lock().pool.set_pan(token, pan)
    }

    /// Sets the gain of the first untokenized track playing the track's file
    /// from the frame its offset resolves to against the current mix length.
    pub fn set_legacy_volume(&self, track: &Track, volume: f32) -> bool {
        let state = self.state.lock();
        let path = self.storage_root.join(track.file());
        let start_frame = self.start_frame(&state.registry, track);
        state.pool.set_legacy_volume(&path, start_frame, volume)
    }

    /// Sets the pan of an untokenized track, matched like `set_legacy_volume`.
    pub fn set_legacy_pan(&self, track: &Track, pan: f32) -> bool {
        let state = self.state.lock();
        let path = self.storage_root.join(track.file());
        let start_frame = self.start_frame(&state.registry, track);
        state.pool.set_legacy_pan(&path, start_frame, pan)
    }

    pub fn volume(&self, token: TrackToken) -> Option<f32> {
        self.state.lock().pool.volume(token)
    }

    pub fn pan(&self, token: TrackToken) -> Option<f32> {
        self.state.lock().pool.pan(token)
    }

    /// Starts or resumes the mix. Playing again while playing pauses. Does
    /// nothing when no voice is in use.
    pub fn play(&self) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        if state.pool.is_idle() {
            debug!("Nothing to play");
            return Ok(());
        }

        if state.transport.state() != TransportState::Playing {
            self.start_device()?;
        }
        match state.transport.play() {
            PlayTransition::Started | PlayTransition::Resumed => state.pool.play_all(),
            PlayTransition::Paused => state.pool.pause_all(),
        }
        info!(state = %state.transport.state(), "Play");
        Ok(())
    }

    /// Pauses every voice if playing.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        if state.transport.pause() {
            state.pool.pause_all();
            info!(position = state.pool.current_position(), "Paused");
        }
        Ok(())
    }

    /// Stops and rewinds the mix, stops the device, and reschedules every
    /// registered track from scratch.
    pub fn stop(&self) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        self.stop_locked(&mut state);
        Ok(())
    }

    fn stop_locked(&self, state: &mut EngineState) {
        let previous = state.transport.stop();
        if !state.is_capturing() {
            self.device.stop();
        }
        self.reload(state);
        info!(previous = %previous, "Stopped");
    }

    /// Resets every voice by scheduling each registered track again. Legacy
    /// voices are unloaded and recreated with the gain and pan they had.
    fn reload(&self, state: &mut EngineState) {
        let mut legacy_mixes = state.pool.unload_all_legacy();
        let tracks = state.registry.tracks().to_vec();
        for track in tracks {
            let loaded = state
                .registry
                .resolve(&track)
                .and_then(|path| Ok((self.decode(&path)?, path)));
            match loaded {
                Ok((loaded, path)) => {
                    let start_frame = self.start_frame(&state.registry, &track);
                    let voice = state
                        .pool
                        .schedule_file(&path, &loaded, start_frame, track.token());
                    if track.token().is_none() {
                        if let Some(index) = legacy_mixes.iter().position(|(p, _)| *p == path) {
                            let (_, mix) = legacy_mixes.remove(index);
                            state.pool.apply_mix(voice, mix);
                        }
                    }
                }
                Err(e) => warn!(track = %track, err = %e, "Unable to reload track"),
            }
        }
    }

    /// Publishes progress and stops the mix once it has played through,
    /// unless a capture is running. Returns the progress.
    pub fn tick(&self) -> Result<f64, EngineError> {
        let mut state = self.state.lock();
        if matches!(state.session, Some(Session::Bounce)) {
            return Ok(state.transport.progress());
        }
        let progress = transport::compute_progress(
            state.pool.current_position(),
            self.sample_rate,
            state.registry.mix_length(),
        );
        state.transport.set_progress(progress);

        if progress >= 1.0
            && state.transport.state() != TransportState::Stopped
            && !state.is_capturing()
        {
            info!("Reached the end of the mix");
            self.stop_locked(&mut state);
            return Ok(1.0);
        }
        Ok(progress.min(1.0))
    }

    /// Restarts the mix from the top, playing again if it was playing. Does
    /// nothing while the device is not running.
    pub fn skip_backward(&self) -> Result<(), EngineError> {
        if !self.device.is_running() {
            return Ok(());
        }
        let was_playing = self.transport_state() == TransportState::Playing;
        self.stop()?;
        if was_playing {
            self.play()?;
        }
        Ok(())
    }

    /// Moves every voice forward by the skip interval, up to the end of the
    /// mix. Does nothing while the device is not running.
    pub fn skip_forward(&self) -> Result<(), EngineError> {
        if !self.device.is_running() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        let mix_length = state.registry.mix_length();
        let end = transport::offset_to_frame(1.0, mix_length, self.sample_rate);
        let skip = (self.skip_interval.as_secs_f64() * self.sample_rate as f64).round() as u64;
        let frame = state.pool.current_position().saturating_add(skip).min(end);
        self.seek_locked(&mut state, frame, mix_length);
        Ok(())
    }

    /// Moves every voice to a fraction of the mix. The transport state is kept.
    pub fn scrub(&self, fraction: f64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.check_not_bouncing()?;
        let mix_length = state.registry.mix_length();
        let frame = transport::offset_to_frame(fraction, mix_length, self.sample_rate);
        self.seek_locked(&mut state, frame, mix_length);
        Ok(())
    }

    fn seek_locked(&self, state: &mut EngineState, frame: u64, mix_length: f64) {
        state.pool.seek_all(frame);
        state
            .transport
            .set_progress(transport::compute_progress(frame, self.sample_rate, mix_length));
        debug!(frame, "Seeked");
    }

    /// Starts recording the device input to `<root>/<uuid>.wav`. Returns the
    /// generated file name.
    pub fn start_capture(&self) -> Result<String, EngineError> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if let Some(session) = &state.session {
            return Err(EngineError::SessionActive(session.kind()));
        }

        let format = self.device.input_format().ok_or_else(|| {
            EngineError::unavailable(self.device.to_string(), "input format cannot be queried")
        })?;
        let (session, sink) = CaptureSession::create(
            &self.storage_root,
            format,
            self.capture_queue_buffers,
            self.start_attempts,
            self.start_retry_delay,
        )?;

        self.device.stop();
        let started = self
            .device
            .attach_input(sink)
            .map_err(EngineError::from)
            .and_then(|()| self.start_device());
        if let Err(e) = started {
            self.device.detach_input();
            discard_capture(session);
            if state.transport.state() == TransportState::Playing {
                if let Err(e) = self.start_device() {
                    warn!(err = %e, "Unable to restart playback after failed capture");
                }
            }
            return Err(e);
        }

        let filename = session.filename().to_string();
        state.session = Some(Session::Capture(session));
        Ok(filename)
    }

    /// Stops recording and returns the finished file, or None when no
    /// capture is running.
    pub fn stop_capture(&self) -> Result<Option<PathBuf>, EngineError> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let session = match state.session.take() {
            Some(Session::Capture(session)) => session,
            other => {
                state.session = other;
                return Ok(None);
            }
        };

        self.device.stop();
        self.device.detach_input();
        let path = session.finish()?;
        if state.transport.state() == TransportState::Playing {
            self.start_device()?;
        }
        Ok(Some(path))
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().is_capturing()
    }

    /// Renders the whole mix to `<root>/<uuid>.wav` faster than real time.
    /// Returns None when the mix is empty.
    pub fn bounce(&self, cancel: &CancelHandle) -> Result<Option<PathBuf>, EngineError> {
        let _enter = self.span.enter();
        let total_frames = {
            let mut state = self.state.lock();
            if let Some(session) = &state.session {
                return Err(EngineError::SessionActive(session.kind()));
            }
            let mix_length = state.registry.mix_length();
            if mix_length <= 0.0 || state.pool.is_idle() {
                return Ok(None);
            }

            state.pool.pause_all();
            state.transport.stop();
            self.device.stop();
            state.pool.seek_all(0);
            state.pool.play_all();
            state.session = Some(Session::Bounce);
            self.mixer.format().seconds_to_frames(mix_length)
        };

        let path = util::generated_wav_path(&self.storage_root);
        let result = bounce::render_to_file(
            self.device.as_ref(),
            &self.mixer,
            &path,
            total_frames,
            self.limits,
            cancel,
            (self.start_attempts, self.start_retry_delay),
        );

        let mut state = self.state.lock();
        state.session = None;
        self.reload(&mut state);
        result.map(|()| Some(path))
    }

    pub fn transport_state(&self) -> TransportState {
        self.state.lock().transport.state()
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().transport.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.state.lock().transport.subscribe_progress()
    }

    pub fn subscribe_transport(&self) -> watch::Receiver<TransportState> {
        self.state.lock().transport.subscribe_state()
    }

    /// Position of the mix in frames.
    pub fn current_position(&self) -> u64 {
        self.state.lock().pool.current_position()
    }

    /// Length of the mix in seconds: the longest loaded track.
    pub fn mix_length(&self) -> f64 {
        self.state.lock().registry.mix_length()
    }

    /// Decoded duration of a track file in seconds, 0 when unknown.
    pub fn duration(&self, file: &str) -> f64 {
        self.state.lock().registry.duration(file)
    }

    pub fn try_duration(&self, file: &str) -> Option<f64> {
        self.state.lock().registry.try_duration(file)
    }

    /// Drops a recorded duration so it no longer counts toward the mix
    /// length, along with the decoded audio if no track still uses the file.
    pub fn forget_duration(&self, file: &str) -> Option<f64> {
        let mut state = self.state.lock();
        let forgotten = state.registry.forget_duration(file);
        self.evict_unused(&state.registry, file);
        forgotten
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.state.lock().registry.tracks().to_vec()
    }

    pub fn voice_for(&self, token: TrackToken) -> Option<VoiceId> {
        self.state.lock().pool.voice_for(token)
    }

    pub fn voice_state(&self, voice: VoiceId) -> Option<VoiceState> {
        self.state.lock().pool.state(voice)
    }

    pub fn voice_count(&self) -> usize {
        self.state.lock().pool.voice_count()
    }

    pub fn free_voice_count(&self) -> usize {
        self.state.lock().pool.free_count()
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        let session = self.state.get_mut().session.take();
        if let Some(Session::Capture(session)) = session {
            self.device.stop();
            self.device.detach_input();
            if let Err(e) = session.finish() {
                warn!(err = %e, "Unable to finish capture");
            }
        }
        self.device.stop();
    }
}

/// Finishes a capture that never started and removes its file.
fn discard_capture(session: CaptureSession) {
    match session.finish() {
        Ok(path) => {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = ?path, err = %e, "Unable to remove capture file");
            }
        }
        Err(e) => warn!(err = %e, "Unable to discard capture"),
    }
}
