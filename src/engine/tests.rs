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
use std::{error::Error, sync::Arc};

use super::*;
use crate::audio::mixer::InputState;
use crate::audio::{mock, RenderStatus, StreamFormat};
use crate::testutil::{read_float_wav, write_constant_wav};
use crate::voices::VoiceMix;

const RATE: u32 = 1000;

struct Fixture {
    dir: tempfile::TempDir,
    device: Arc<mock::Device>,
    engine: MixEngine,
}

impl Fixture {
    fn new() -> Result<Fixture, Box<dyn Error>> {
        Fixture::with_config(|config| config)
    }

    fn with_config(
        customize: impl FnOnce(EngineConfig) -> EngineConfig,
    ) -> Result<Fixture, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let config = customize(
            EngineConfig::new(dir.path())
                .with_device("mock")
                .with_format(RATE, 2)
                .with_start_policy(3, "1ms"),
        );
        let device = Arc::new(mock::Device::manual(
            StreamFormat::new(RATE, 2),
            Some(StreamFormat::new(RATE, 1)),
        ));
        let engine = MixEngine::with_device(&config, device.clone())?;
        Ok(Fixture {
            dir,
            device,
            engine,
        })
    }

    /// Writes a stereo track of the given length under the storage root.
    fn write_track(&self, name: &str, seconds: f64) -> Result<(), Box<dyn Error>> {
        let frames = (seconds * RATE as f64).round() as usize;
        write_constant_wav(self.dir.path().join(name), 0.25, 2, frames, RATE)
    }

    fn wav_files(&self) -> Result<Vec<PathBuf>, Box<dyn Error>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(self.dir.path())? {
            files.push(entry?.path());
        }
        Ok(files)
    }
}

#[test]
fn test_distinct_tokens_get_distinct_voices() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;

    let first = fixture.engine.add_track(Track::new("a.wav"))?;
    let second = fixture.engine.add_track(Track::new("a.wav"))?;
    assert_ne!(first, second);
    assert_eq!(fixture.engine.voice_count(), 2);
    Ok(())
}

#[test]
fn test_readding_token_rebinds_same_voice() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    let track = Track::new("a.wav");

    let first = fixture.engine.add_track(track.clone())?;
    let again = fixture.engine.add_track(track.with_offset(0.5))?;
    assert_eq!(first, again);
    assert_eq!(fixture.engine.voice_count(), 1);
    assert_eq!(fixture.engine.tracks().len(), 1);
    Ok(())
}

#[test]
fn test_released_voice_is_reused_first() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    let removed = Track::new("a.wav");
    let token = removed.token().ok_or("tokenized")?;

    let voice = fixture.engine.add_track(removed)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    assert!(fixture.engine.remove_track(token)?);
    assert_eq!(fixture.engine.voice_state(voice), Some(VoiceState::Free));
    assert_eq!(fixture.engine.free_voice_count(), 1);

    let reused = fixture.engine.add_track(Track::new("a.wav"))?;
    assert_eq!(reused, voice);
    assert_eq!(fixture.engine.voice_state(voice), Some(VoiceState::InUse));
    assert_eq!(fixture.engine.voice_count(), 2);
    Ok(())
}

#[test]
fn test_position_is_zero_after_stop() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 2.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;

    fixture.engine.play()?;
    fixture.device.pump(500);
    assert_eq!(fixture.engine.current_position(), 500);

    fixture.engine.stop()?;
    assert_eq!(fixture.engine.current_position(), 0);
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    assert_eq!(fixture.engine.progress(), 0.0);
    assert!(!fixture.device.is_running());

    // The mix plays again from the top.
    fixture.engine.play()?;
    fixture.device.pump(100);
    assert_eq!(fixture.engine.current_position(), 100);
    Ok(())
}

#[test]
fn test_mix_length_is_longest_track() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("short.wav", 9.5)?;
    fixture.write_track("long.wav", 12.0)?;

    fixture.engine.add_track(Track::new("short.wav"))?;
    fixture.engine.add_track(Track::new("long.wav").with_offset(0.5))?;
    assert!((fixture.engine.mix_length() - 12.0).abs() < 1e-9);
    assert!((fixture.engine.duration("short.wav") - 9.5).abs() < 1e-9);
    assert_eq!(fixture.engine.duration("missing.wav"), 0.0);
    Ok(())
}

#[test]
fn test_play_pause_play_toggle() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("five.wav", 5.0)?;
    fixture.write_track("eight.wav", 8.0)?;
    fixture.engine.add_track(Track::new("five.wav"))?;
    fixture.engine.add_track(Track::new("eight.wav"))?;
    assert!((fixture.engine.mix_length() - 8.0).abs() < 1e-9);

    let mut states = fixture.engine.subscribe_transport();
    fixture.engine.play()?;
    assert_eq!(*states.borrow_and_update(), TransportState::Playing);
    fixture.engine.pause()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Paused);
    fixture.engine.play()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Playing);

    // Playing again while playing pauses.
    fixture.engine.play()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Paused);
    let position = fixture.engine.current_position();
    fixture.device.pump(100);
    assert_eq!(fixture.engine.current_position(), position);
    Ok(())
}

#[test]
fn test_play_with_empty_mix_does_nothing() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.engine.play()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    assert!(!fixture.device.is_running());
    Ok(())
}

#[test]
fn test_batch_load_tolerates_failures() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("good.wav", 1.5)?;

    let report = fixture.engine.load_all_tracks_and_add_to_mix(vec![
        Track::new("good.wav"),
        Track::new("missing.wav"),
    ]);
    assert!(!report.is_complete());
    assert_eq!(report.loaded.len(), 1);
    assert_eq!(report.loaded[0].file(), "good.wav");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.file(), "missing.wav");
    assert!(matches!(
        report.failed[0].1,
        EngineError::ResourceUnavailable { .. }
    ));

    assert!((fixture.engine.duration("good.wav") - 1.5).abs() < 1e-9);
    assert_eq!(fixture.engine.try_duration("missing.wav"), None);
    assert_eq!(fixture.engine.voice_count(), 1);
    Ok(())
}

#[test]
fn test_batch_offsets_use_final_mix_length() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.write_track("b.wav", 4.0)?;

    let late = Track::new("a.wav").with_offset(0.5);
    let token = late.token().ok_or("tokenized")?;
    let report = fixture
        .engine
        .load_all_tracks_and_add_to_mix(vec![late, Track::new("b.wav")]);
    assert!(report.is_complete());

    let state = fixture.engine.state.lock();
    assert_eq!(state.pool.binding_for(token).map(|b| b.1), Some(Some(2000)));
    Ok(())
}

#[test]
fn test_capture_writes_input() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    let filename = fixture.engine.start_capture()?;
    assert!(filename.ends_with(".wav"));
    assert!(fixture.dir.path().join(&filename).exists());
    assert!(fixture.engine.is_capturing());
    assert!(fixture.device.is_running());

    assert!(matches!(
        fixture.engine.start_capture(),
        Err(EngineError::SessionActive("capture"))
    ));
    assert!(matches!(
        fixture.engine.bounce(&CancelHandle::new()),
        Err(EngineError::SessionActive("capture"))
    ));

    assert!(fixture.device.feed_input(&[0.5; 10]));
    assert!(fixture.device.feed_input(&[-0.5; 6]));

    let path = fixture.engine.stop_capture()?.ok_or("capture path")?;
    assert_eq!(path, fixture.dir.path().join(&filename));
    assert!(!fixture.engine.is_capturing());
    assert!(!fixture.device.has_input());

    let (spec, samples) = read_float_wav(&path)?;
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(samples.len(), 16);
    assert_eq!(samples[0], 0.5);
    assert_eq!(samples[15], -0.5);

    assert_eq!(fixture.engine.stop_capture()?, None);
    Ok(())
}

#[test]
fn test_capture_without_input_is_unavailable() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let config = EngineConfig::new(dir.path()).with_format(RATE, 2);
    let device = Arc::new(mock::Device::manual(StreamFormat::new(RATE, 2), None));
    let engine = MixEngine::with_device(&config, device)?;

    assert!(matches!(
        engine.start_capture(),
        Err(EngineError::ResourceUnavailable { .. })
    ));
    assert!(!engine.is_capturing());
    Ok(())
}

#[test]
fn test_capture_suppresses_auto_stop() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 0.5)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture.engine.play()?;
    fixture.engine.start_capture()?;

    fixture.device.pump(600);
    assert_eq!(fixture.engine.tick()?, 1.0);
    assert_eq!(fixture.engine.transport_state(), TransportState::Playing);

    fixture.engine.stop_capture()?;
    fixture.engine.tick()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    Ok(())
}

#[test]
fn test_bounce_writes_whole_mix() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 0.5)?;
    fixture.write_track("b.wav", 1.25)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture.engine.add_track(Track::new("b.wav"))?;
    fixture.engine.play()?;
    fixture.device.pump(300);

    let path = fixture
        .engine
        .bounce(&CancelHandle::new())?
        .ok_or("bounce path")?;
    assert!(path.starts_with(fixture.dir.path()));

    let (spec, samples) = read_float_wav(&path)?;
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(samples.len(), 1250 * 2);
    // Both tracks play from the top.
    assert!(samples[0] > 0.25);

    assert_eq!(fixture.device.offline_exits(), 1);
    assert!(!fixture.device.is_offline());
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    assert_eq!(fixture.engine.current_position(), 0);
    Ok(())
}

#[test]
fn test_bounce_empty_mix() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    assert_eq!(fixture.engine.bounce(&CancelHandle::new())?, None);
    assert_eq!(fixture.device.offline_exits(), 0);
    Ok(())
}

#[test]
fn test_bounce_failure_removes_file() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture
        .device
        .script_render([RenderStatus::Success(100), RenderStatus::Error(0x6e6f7065)]);

    let result = fixture.engine.bounce(&CancelHandle::new());
    match result {
        Err(e @ EngineError::RenderFailed { .. }) => {
            assert!(e.to_string().contains("'nope'"));
        }
        other => panic!("expected a render failure, got {:?}", other),
    }
    assert_eq!(fixture.wav_files()?, vec![fixture.dir.path().join("a.wav")]);
    assert_eq!(fixture.device.offline_exits(), 1);

    // The engine is usable again.
    assert!(fixture.engine.bounce(&CancelHandle::new())?.is_some());
    Ok(())
}

#[test]
fn test_bounce_stalls_are_bounded() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::with_config(|config| config.with_render_limits(2, "5s"))?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture
        .device
        .script_render([RenderStatus::InsufficientInput; 5]);

    assert!(matches!(
        fixture.engine.bounce(&CancelHandle::new()),
        Err(EngineError::RenderStalled { stalls: 3, .. })
    ));
    assert_eq!(fixture.device.offline_exits(), 1);
    Ok(())
}

#[test]
fn test_bounce_cancelled() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    let cancel = CancelHandle::new();
    cancel.cancel();

    assert!(matches!(
        fixture.engine.bounce(&cancel),
        Err(EngineError::Cancelled)
    ));
    assert_eq!(fixture.wav_files()?.len(), 1);
    assert_eq!(fixture.device.offline_exits(), 1);
    Ok(())
}

#[test]
fn test_device_start_is_retried() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;

    fixture.device.fail_next_starts(2);
    fixture.engine.play()?;
    assert!(fixture.device.is_running());
    assert_eq!(fixture.engine.transport_state(), TransportState::Playing);

    fixture.engine.stop()?;
    fixture.device.fail_next_starts(3);
    assert!(matches!(
        fixture.engine.play(),
        Err(EngineError::GraphStart(_))
    ));
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    Ok(())
}

#[test]
fn test_tick_auto_stops_at_end() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    let progress = fixture.engine.subscribe_progress();

    fixture.engine.play()?;
    fixture.device.pump(250);
    assert!((fixture.engine.tick()? - 0.25).abs() < 1e-9);
    assert!((*progress.borrow() - 0.25).abs() < 1e-9);

    fixture.device.pump(800);
    assert_eq!(fixture.engine.tick()?, 1.0);
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);
    assert_eq!(fixture.engine.current_position(), 0);
    Ok(())
}

#[test]
fn test_scrub_keeps_state() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 2.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture.engine.play()?;
    fixture.engine.pause()?;

    fixture.engine.scrub(0.5)?;
    assert_eq!(fixture.engine.current_position(), 1000);
    assert_eq!(fixture.engine.progress(), 0.5);
    assert_eq!(fixture.engine.transport_state(), TransportState::Paused);

    fixture.engine.scrub(3.0)?;
    assert_eq!(fixture.engine.current_position(), 2000);
    Ok(())
}

#[test]
fn test_skip_forward_clamps_to_end() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::with_config(|config| config.with_skip_interval("1s"))?;
    fixture.write_track("a.wav", 2.5)?;
    fixture.engine.add_track(Track::new("a.wav"))?;

    // Not running: nothing moves.
    fixture.engine.skip_forward()?;
    assert_eq!(fixture.engine.current_position(), 0);

    fixture.engine.play()?;
    fixture.engine.skip_forward()?;
    assert_eq!(fixture.engine.current_position(), 1000);
    fixture.engine.skip_forward()?;
    fixture.engine.skip_forward()?;
    assert_eq!(fixture.engine.current_position(), 2500);
    Ok(())
}

#[test]
fn test_skip_backward_restarts_playback() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 2.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;

    fixture.engine.skip_backward()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Stopped);

    fixture.engine.play()?;
    fixture.device.pump(700);
    fixture.engine.skip_backward()?;
    assert_eq!(fixture.engine.transport_state(), TransportState::Playing);
    assert_eq!(fixture.engine.current_position(), 0);
    fixture.device.pump(10);
    assert_eq!(fixture.engine.current_position(), 10);
    Ok(())
}

#[test]
fn test_track_added_while_playing_is_aligned() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 2.0)?;
    fixture.write_track("b.wav", 2.0)?;
    let first = Track::new("a.wav");
    let first_token = first.token().ok_or("tokenized")?;
    fixture.engine.add_track(first)?;
    fixture.engine.play()?;
    fixture.device.pump(400);

    let late = fixture.engine.add_track(Track::new("b.wav"))?;
    assert_eq!(
        fixture.engine.state.lock().pool.input_state(late),
        Some(InputState::Playing)
    );
    fixture.device.pump(100);

    // With the first track gone, the position comes from the late one.
    fixture.engine.remove_track(first_token)?;
    assert_eq!(fixture.engine.current_position(), 500);
    Ok(())
}

#[test]
fn test_volume_and_pan() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    let track = Track::new("a.wav");
    let token = track.token().ok_or("tokenized")?;
    fixture.engine.add_track(track)?;

    assert!(fixture.engine.set_volume(token, 1.5));
    assert_eq!(fixture.engine.volume(token), Some(1.0));
    assert!(fixture.engine.set_pan(token, -0.25));
    assert_eq!(fixture.engine.pan(token), Some(-0.25));
    assert!(!fixture.engine.set_volume(TrackToken::new(), 0.5));
    Ok(())
}

#[test]
fn test_legacy_tracks_survive_stop() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.engine.add_track(Track::legacy("a.wav"))?;
    fixture.engine.add_track(Track::legacy("a.wav"))?;
    assert_eq!(fixture.engine.voice_count(), 2);
    assert!(fixture.engine.set_legacy_volume(&Track::legacy("a.wav"), 0.5));
    assert!(!fixture
        .engine
        .set_legacy_volume(&Track::legacy("a.wav").with_offset(0.5), 0.5));

    fixture.engine.stop()?;
    assert_eq!(fixture.engine.voice_count(), 2);
    assert_eq!(fixture.engine.tracks().len(), 2);

    fixture.engine.remove_legacy_tracks()?;
    assert_eq!(fixture.engine.voice_count(), 0);
    assert!(fixture.engine.tracks().is_empty());
    Ok(())
}

#[test]
fn test_unresolvable_track_is_rejected() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    assert!(matches!(
        fixture.engine.add_track(Track::new("../escape.wav")),
        Err(EngineError::ResourceUnavailable { .. })
    ));
    assert!(matches!(
        fixture.engine.add_track(Track::new("nope.wav")),
        Err(EngineError::ResourceUnavailable { .. })
    ));
    assert_eq!(fixture.engine.voice_count(), 0);
    Ok(())
}

#[test]
fn test_legacy_mix_survives_stop() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    let track = Track::legacy("a.wav");
    fixture.engine.add_track(track.clone())?;
    assert!(fixture.engine.set_legacy_volume(&track, 0.5));
    assert!(fixture.engine.set_legacy_pan(&track, -1.0));

    fixture.engine.play()?;
    let before = fixture.device.pump(10);
    assert_eq!(&before[..2], &[0.125, 0.0]);

    fixture.engine.stop()?;
    fixture.engine.play()?;
    let after = fixture.device.pump(10);
    assert_eq!(after, before);

    let state = fixture.engine.state.lock();
    let voice = state.pool.legacy_bindings()[0].voice();
    assert_eq!(
        state.pool.mix(voice),
        Some(VoiceMix {
            gain: 0.5,
            pan: -1.0
        })
    );
    Ok(())
}

#[test]
fn test_legacy_volume_resolves_offset_against_current_mix() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.write_track("long.wav", 4.0)?;
    let late = Track::legacy("a.wav").with_offset(0.5);
    fixture.engine.add_track(late.clone())?;
    assert!(fixture.engine.set_legacy_volume(&late, 0.5));

    // The longer track moves the offset's frame, but the voice keeps its
    // schedule until the next stop.
    fixture.engine.add_track(Track::new("long.wav"))?;
    assert!(!fixture.engine.set_legacy_volume(&late, 0.25));

    fixture.engine.stop()?;
    assert!(fixture.engine.set_legacy_volume(&late, 0.25));
    assert!(fixture.engine.set_legacy_pan(&late, 0.5));

    let state = fixture.engine.state.lock();
    let binding = &state.pool.legacy_bindings()[0];
    assert_eq!(binding.start_frame, Some(2000));
    assert_eq!(
        state.pool.mix(binding.voice()),
        Some(VoiceMix {
            gain: 0.25,
            pan: 0.5
        })
    );
    Ok(())
}

#[test]
fn test_removed_tracks_release_decoded_audio() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 1.0)?;
    fixture.write_track("b.wav", 1.0)?;
    let first = Track::new("a.wav");
    let second = Track::new("a.wav");
    let (first_token, second_token) = (
        first.token().ok_or("tokenized")?,
        second.token().ok_or("tokenized")?,
    );
    fixture.engine.add_track(first)?;
    fixture.engine.add_track(second)?;
    fixture.engine.add_track(Track::legacy("b.wav"))?;
    assert_eq!(fixture.engine.loader.cached_count(), 2);
    let both = fixture.engine.loader.total_memory_usage();

    // Another track still plays a.wav.
    fixture.engine.remove_track(first_token)?;
    assert_eq!(fixture.engine.loader.cached_count(), 2);

    fixture.engine.remove_track(second_token)?;
    assert_eq!(fixture.engine.loader.cached_count(), 1);
    assert!(fixture.engine.loader.total_memory_usage() < both);

    // b.wav is still registered, so only its duration goes.
    assert_eq!(fixture.engine.forget_duration("b.wav"), Some(1.0));
    assert_eq!(fixture.engine.loader.cached_count(), 1);

    fixture.engine.remove_legacy_tracks()?;
    assert_eq!(fixture.engine.loader.cached_count(), 0);
    assert_eq!(fixture.engine.loader.total_memory_usage(), 0);
    Ok(())
}

#[test]
fn test_failed_capture_restores_playback() -> Result<(), Box<dyn Error>> {
    let fixture = Fixture::new()?;
    fixture.write_track("a.wav", 2.0)?;
    fixture.engine.add_track(Track::new("a.wav"))?;
    fixture.engine.play()?;

    fixture.device.fail_next_starts(3);
    assert!(matches!(
        fixture.engine.start_capture(),
        Err(EngineError::GraphStart(_))
    ));
    assert!(!fixture.engine.is_capturing());
    assert!(!fixture.device.has_input());
    assert!(fixture.device.is_running());
    assert_eq!(fixture.wav_files()?, vec![fixture.dir.path().join("a.wav")]);
    Ok(())
}
