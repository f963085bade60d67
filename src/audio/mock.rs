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
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{AudioMixer, Device as _, DeviceError, InputSink, RenderStatus, StreamFormat};

/// Frames pulled per pacing step.
const PACE_BLOCK_FRAMES: usize = 512;

/// A mock device. Doesn't actually play anything. A paced mock pulls the mixer
/// (and feeds silent input) in real time; a manual mock only moves when pumped.
pub struct Device {
    name: String,
    format: StreamFormat,
    input: Option<StreamFormat>,
    paced: bool,
    running: Arc<AtomicBool>,
    offline: AtomicBool,
    offline_exits: AtomicUsize,
    pending_start_failures: AtomicU32,
    mixer: Mutex<Option<Arc<AudioMixer>>>,
    sink: Arc<Mutex<Option<InputSink>>>,
    render_script: Mutex<VecDeque<RenderStatus>>,
    pacer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Device {
    /// Gets the given mock device, paced in real time.
    pub fn get(name: &str, format: StreamFormat) -> Device {
        let mut device = Device::manual(format, Some(format));
        device.name = name.to_string();
        device.paced = true;
        device
    }

    /// Creates a mock that only renders when pumped.
    pub fn manual(format: StreamFormat, input: Option<StreamFormat>) -> Device {
        Device {
            name: "mock".to_string(),
            format,
            input,
            paced: false,
            running: Arc::new(AtomicBool::new(false)),
            offline: AtomicBool::new(false),
            offline_exits: AtomicUsize::new(0),
            pending_start_failures: AtomicU32::new(0),
            mixer: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            render_script: Mutex::new(VecDeque::new()),
            pacer: Mutex::new(None),
        }
    }

    /// Pulls frames through the mixer as the output stream would. Returns
    /// nothing when the device is not running.
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        if !self.is_running() {
            return Vec::new();
        }
        match self.mixer.lock().as_ref() {
            Some(mixer) => mixer.process_frames(frames),
            None => Vec::new(),
        }
    }

    /// Delivers an input buffer to the attached sink, as the input callback would.
    pub fn feed_input(&self, samples: &[f32]) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.sink.lock().as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` calls to start fail.
    pub fn fail_next_starts(&self, count: u32) {
        self.pending_start_failures.store(count, Ordering::Relaxed);
    }

    /// Queues statuses to return from render_offline before rendering normally.
    pub fn script_render(&self, statuses: impl IntoIterator<Item = RenderStatus>) {
        self.render_script.lock().extend(statuses);
    }

    /// Returns true if the device is in offline render mode.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Number of times offline mode was exited.
    pub fn offline_exits(&self) -> usize {
        self.offline_exits.load(Ordering::Relaxed)
    }

    /// Returns true if an input sink is attached.
    pub fn has_input(&self) -> bool {
        self.sink.lock().is_some()
    }

    fn spawn_pacer(&self, mixer: Arc<AudioMixer>) -> thread::JoinHandle<()> {
        let running = self.running.clone();
        let sink = self.sink.clone();
        let input_channels = self.input.map(|f| f.channels as usize).unwrap_or(0);
        let block = Duration::from_secs_f64(
            PACE_BLOCK_FRAMES as f64 / self.format.sample_rate.max(1) as f64,
        );
        thread::spawn(move || {
            let mut scratch = vec![0.0f32; PACE_BLOCK_FRAMES * mixer.num_channels() as usize];
            let silence = vec![0.0f32; PACE_BLOCK_FRAMES * input_channels];
            while running.load(Ordering::Relaxed) {
                mixer.process_into_output(&mut scratch, PACE_BLOCK_FRAMES);
                if let Some(sink) = sink.lock().as_mut() {
                    sink(&silence);
                }
                spin_sleep::sleep(block);
            }
        })
    }
}

impl super::Device for Device {
    fn output_format(&self) -> StreamFormat {
        self.format
    }

    fn input_format(&self) -> Option<StreamFormat> {
        self.input
    }

    fn start(&self, mixer: Arc<AudioMixer>) -> Result<(), DeviceError> {
        let failures = self.pending_start_failures.load(Ordering::Relaxed);
        if failures > 0 {
            self.pending_start_failures
                .store(failures - 1, Ordering::Relaxed);
            return Err(DeviceError::Stream("injected start failure".to_string()));
        }

        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        *self.mixer.lock() = Some(mixer.clone());
        if self.paced {
            *self.pacer.lock() = Some(self.spawn_pacer(mixer));
        }
        info!(device = self.name, "Mock device started");
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(pacer) = self.pacer.lock().take() {
            let _ = pacer.join();
        }
        debug!(device = self.name, "Mock device stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn attach_input(&self, sink: InputSink) -> Result<(), DeviceError> {
        if self.input.is_none() {
            return Err(DeviceError::NoInput(self.name.clone()));
        }
        let mut current = self.sink.lock();
        if current.is_some() {
            return Err(DeviceError::InputBusy);
        }
        *current = Some(sink);
        Ok(())
    }

    fn detach_input(&self) {
        self.sink.lock().take();
    }

    fn enter_offline(&self, max_frames: usize) -> Result<(), DeviceError> {
        self.offline.store(true, Ordering::Relaxed);
        debug!(device = self.name, max_frames, "Mock device entered offline mode");
        Ok(())
    }

    fn exit_offline(&self) {
        self.offline.store(false, Ordering::Relaxed);
        self.offline_exits.fetch_add(1, Ordering::Relaxed);
    }

    fn render_offline(&self, mixer: &AudioMixer, output: &mut [f32], frames: usize) -> RenderStatus {
        match self.render_script.lock().pop_front() {
            Some(RenderStatus::Success(n)) => {
                let n = n.min(frames);
                mixer.process_into_output(output, n);
                RenderStatus::Success(n)
            }
            Some(status) => status,
            None => {
                mixer.process_into_output(output, frames);
                RenderStatus::Success(frames)
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Device as _;
    use crate::testutil::eventually;

    #[test]
    fn test_start_failures_are_consumed() {
        let device = Device::manual(StreamFormat::new(44100, 2), None);
        let mixer = Arc::new(AudioMixer::new(device.output_format()));
        device.fail_next_starts(1);

        assert!(device.start(mixer.clone()).is_err());
        assert!(!device.is_running());
        assert!(device.start(mixer).is_ok());
        assert!(device.is_running());
    }

    #[test]
    fn test_input_requires_input_format() {
        let device = Device::manual(StreamFormat::new(44100, 2), None);
        assert!(matches!(
            device.attach_input(Box::new(|_| {})),
            Err(DeviceError::NoInput(_))
        ));
    }

    #[test]
    fn test_second_input_is_rejected() {
        let format = StreamFormat::new(44100, 2);
        let device = Device::manual(format, Some(format));
        device.attach_input(Box::new(|_| {})).unwrap();
        assert!(matches!(
            device.attach_input(Box::new(|_| {})),
            Err(DeviceError::InputBusy)
        ));
        device.detach_input();
        assert!(!device.has_input());
    }

    #[test]
    fn test_pump_requires_running() {
        let device = Device::manual(StreamFormat::new(44100, 2), None);
        assert!(device.pump(16).is_empty());
    }

    #[test]
    fn test_paced_device_advances_mixer() {
        let format = StreamFormat::new(44100, 2);
        let device = Device::get("mock-paced", format);
        let mixer = Arc::new(AudioMixer::new(format));
        let input = mixer.attach();
        mixer.play(input);

        let fed = Arc::new(AtomicUsize::new(0));
        let counter = fed.clone();
        device
            .attach_input(Box::new(move |data| {
                counter.fetch_add(data.len(), Ordering::Relaxed);
            }))
            .unwrap();
        device.start(mixer.clone()).unwrap();

        eventually(
            || mixer.position(input).unwrap_or(0) > 0,
            "paced device never pulled the mixer",
        );
        eventually(
            || fed.load(Ordering::Relaxed) > 0,
            "paced device never fed input",
        );
        device.stop();
        assert!(!device.is_running());
        assert_eq!(device.to_string(), "mock-paced (Mock)");
    }
}
