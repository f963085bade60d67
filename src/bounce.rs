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

//! Offline rendering of the mix to a file.
//!
//! The device is switched into offline mode and pulled in blocks as fast as it
//! will render. Soft failures are retried but bounded by a stall count and a
//! timeout, and the render can be cancelled between blocks.

use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, info, span, warn, Level};

use crate::audio::{AudioMixer, Device, RenderStatus};
use crate::diagnostics;
use crate::error::EngineError;
use crate::playsync::CancelHandle;
use crate::util::{self, WavFileWriter};

/// Pause between retries of a soft render failure.
const STALL_BACKOFF: Duration = Duration::from_millis(1);

/// Bounds on one offline render.
#[derive(Debug, Clone, Copy)]
pub struct RenderLimits {
    /// Frames requested per render call.
    pub max_frames: usize,
    /// Consecutive soft stalls tolerated.
    pub max_stalls: u32,
    /// Time without progress tolerated.
    pub stall_timeout: Duration,
}

/// Leaves offline mode when dropped, whatever path the render exits by.
struct OfflineGuard<'a> {
    device: &'a dyn Device,
}

impl<'a> OfflineGuard<'a> {
    fn enter(device: &'a dyn Device, max_frames: usize) -> Result<OfflineGuard<'a>, EngineError> {
        device.enter_offline(max_frames)?;
        Ok(OfflineGuard { device })
    }
}

impl Drop for OfflineGuard<'_> {
    fn drop(&mut self) {
        self.device.exit_offline();
        debug!(device = %self.device, "Left offline mode");
    }
}

/// Renders `total_frames` of the mixer into a WAV file at `path` in the bus
/// format. The voices must already be positioned and playing. The partial
/// file is removed if the render fails.
pub(crate) fn render_to_file(
    device: &dyn Device,
    mixer: &AudioMixer,
    path: &Path,
    total_frames: u64,
    limits: RenderLimits,
    cancel: &CancelHandle,
    (attempts, retry_delay): (u32, Duration),
) -> Result<(), EngineError> {
    let span = span!(Level::INFO, "bounce", path = ?path, total_frames);
    let _enter = span.enter();

    let mut writer = util::create_wav(path, mixer.format().wav_spec(), attempts, retry_delay)?;
    let result = OfflineGuard::enter(device, limits.max_frames).and_then(|_offline| {
        render_blocks(device, mixer, &mut writer, total_frames, limits, cancel)
    });

    let result = match result {
        Ok(()) => writer
            .finalize()
            .map_err(|e| EngineError::unavailable(path.display().to_string(), e)),
        Err(e) => {
            drop(writer);
            Err(e)
        }
    };
    if let Err(e) = &result {
        warn!(err = %e, "Bounce failed, removing partial file");
        if let Err(e) = fs::remove_file(path) {
            warn!(err = %e, "Unable to remove partial bounce file");
        }
    }
    result
}

fn render_blocks(
    device: &dyn Device,
    mixer: &AudioMixer,
    writer: &mut WavFileWriter,
    total_frames: u64,
    limits: RenderLimits,
    cancel: &CancelHandle,
) -> Result<(), EngineError> {
    let channels = mixer.num_channels() as usize;
    let max_frames = limits.max_frames.max(1);
    let mut scratch = vec![0.0f32; max_frames * channels];

    let mut written = 0u64;
    let mut stalls = 0u32;
    let mut last_progress = Instant::now();

    while written < total_frames {
        if cancel.is_cancelled() {
            info!(written, "Bounce cancelled");
            return Err(EngineError::Cancelled);
        }

        let requested = (total_frames - written).min(max_frames as u64) as usize;
        scratch.fill(0.0);
        let stalled = match device.render_offline(mixer, &mut scratch, requested) {
            RenderStatus::Success(0) => true,
            RenderStatus::Success(frames) => {
                let frames = frames.min(requested);
                for sample in &scratch[..frames * channels] {
                    writer
                        .write_sample(*sample)
                        .map_err(|e| EngineError::unavailable("bounce file", e))?;
                }
                written += frames as u64;
                stalls = 0;
                last_progress = Instant::now();
                false
            }
            RenderStatus::InsufficientInput | RenderStatus::CannotRenderNow => true,
            RenderStatus::Error(code) => {
                let _ = diagnostics::check(code, "offline render");
                return Err(EngineError::RenderFailed { status: code });
            }
        };

        if stalled {
            stalls += 1;
            let waited = last_progress.elapsed();
            if stalls > limits.max_stalls || waited >= limits.stall_timeout {
                warn!(stalls, waited = ?waited, "Offline render stalled");
                return Err(EngineError::RenderStalled { stalls, waited });
            }
            if cancel.wait_timeout(STALL_BACKOFF) {
                return Err(EngineError::Cancelled);
            }
        }
    }

    info!(frames = written, "Bounce rendered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::audio::mixer::ScheduledAudio;
    use crate::audio::{mock, StreamFormat};
    use crate::testutil::read_float_wav;

    fn limits() -> RenderLimits {
        RenderLimits {
            max_frames: 64,
            max_stalls: 3,
            stall_timeout: Duration::from_secs(5),
        }
    }

    fn playing_mixer() -> AudioMixer {
        let mixer = AudioMixer::new(StreamFormat::new(1000, 1));
        let input = mixer.attach();
        mixer.schedule(
            input,
            ScheduledAudio {
                data: Arc::new(vec![0.5; 1000]),
                channels: 1,
                start_frame: 0,
            },
        );
        mixer.play(input);
        mixer
    }

    #[test]
    fn test_renders_exact_frames() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let device = mock::Device::manual(StreamFormat::new(1000, 1), None);
        let mixer = playing_mixer();
        device.script_render([RenderStatus::Success(10), RenderStatus::CannotRenderNow]);

        render_to_file(
            &device,
            &mixer,
            &path,
            250,
            limits(),
            &CancelHandle::new(),
            (1, Duration::ZERO),
        )?;

        let (_, samples) = read_float_wav(&path)?;
        assert_eq!(samples.len(), 250);
        assert!(samples.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        assert_eq!(device.offline_exits(), 1);
        assert!(!device.is_offline());
        Ok(())
    }

    #[test]
    fn test_error_status_fails_and_removes_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let device = mock::Device::manual(StreamFormat::new(1000, 1), None);
        device.script_render([RenderStatus::Success(64), RenderStatus::Error(-50)]);

        let result = render_to_file(
            &device,
            &playing_mixer(),
            &path,
            500,
            limits(),
            &CancelHandle::new(),
            (1, Duration::ZERO),
        );
        assert!(matches!(result, Err(EngineError::RenderFailed { status: -50 })));
        assert!(!path.exists());
        assert_eq!(device.offline_exits(), 1);
        Ok(())
    }

    #[test]
    fn test_consecutive_stalls_are_bounded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let device = mock::Device::manual(StreamFormat::new(1000, 1), None);
        device.script_render([RenderStatus::InsufficientInput; 10]);

        let result = render_to_file(
            &device,
            &playing_mixer(),
            &path,
            500,
            limits(),
            &CancelHandle::new(),
            (1, Duration::ZERO),
        );
        assert!(matches!(result, Err(EngineError::RenderStalled { stalls: 4, .. })));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_stall_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let device = mock::Device::manual(StreamFormat::new(1000, 1), None);
        device.script_render([RenderStatus::CannotRenderNow; 10_000]);

        let limits = RenderLimits {
            max_stalls: u32::MAX,
            stall_timeout: Duration::from_millis(20),
            ..limits()
        };
        let result = render_to_file(
            &device,
            &playing_mixer(),
            &path,
            500,
            limits,
            &CancelHandle::new(),
            (1, Duration::ZERO),
        );
        match result {
            Err(EngineError::RenderStalled { waited, .. }) => {
                assert!(waited >= Duration::from_millis(20))
            }
            other => panic!("expected a stall, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_cancelled_render() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let device = mock::Device::manual(StreamFormat::new(1000, 1), None);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = render_to_file(
            &device,
            &playing_mixer(),
            &path,
            500,
            limits(),
            &cancel,
            (1, Duration::ZERO),
        );
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(!path.exists());
        assert_eq!(device.offline_exits(), 1);
        Ok(())
    }
}
