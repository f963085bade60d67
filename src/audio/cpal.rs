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
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{thread_priority, AudioMixer, DeviceError, InputSink, StreamFormat};

/// Frames mixed per producer step.
const BLOCK_FRAMES: usize = 512;

/// How long start waits for the output thread to report the stream state.
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock-free single producer, single consumer ring of samples.
struct CircularBuffer {
    /// Backing buffer
    buffer: Box<[std::cell::UnsafeCell<f32>]>,
    /// Capacity (must be power of 2)
    capacity: usize,
    /// Read position (consumer)
    read_pos: AtomicUsize,
    /// Write position (producer)
    write_pos: AtomicUsize,
}

// One thread writes, one thread reads, and the positions fence the regions.
unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two();
        Self {
            buffer: (0..cap).map(|_| std::cell::UnsafeCell::new(0.0)).collect(),
            capacity: cap,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    /// Samples available to read.
    #[inline]
    fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    /// Space available to write.
    #[inline]
    fn space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    /// Writes as many samples as fit. Returns the number written.
    fn write(&self, samples: &[f32]) -> usize {
        let to_write = self.space().min(samples.len());
        let write = self.write_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;
        for (i, sample) in samples[..to_write].iter().enumerate() {
            // SAFETY: the slot lies in the free region, which the reader never touches.
            unsafe { *self.buffer[(write + i) & mask].get() = *sample };
        }
        self.write_pos
            .store((write + to_write) & mask, Ordering::Release);
        to_write
    }

    /// Reads as many samples as are available. Returns the number read.
    fn read(&self, output: &mut [f32]) -> usize {
        let to_read = self.available().min(output.len());
        let read = self.read_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;
        for (i, slot) in output[..to_read].iter_mut().enumerate() {
            // SAFETY: the slot lies in the filled region, which the writer never touches.
            *slot = unsafe { *self.buffer[(read + i) & mask].get() };
        }
        self.read_pos.store((read + to_read) & mask, Ordering::Release);
        to_read
    }
}

/// A cpal output (and optional input) device hosting the mix bus.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal output device.
    output: cpal::Device,
    /// The cpal input device, if one is usable.
    input: Option<cpal::Device>,
    /// The bus format.
    format: StreamFormat,
    /// The native format of the input.
    input_format: Option<StreamFormat>,
    /// Set while the output is running. Stream threads exit when it clears.
    running: Arc<AtomicBool>,
    /// Set while the input stream should be running.
    input_running: Arc<AtomicBool>,
    /// The attached input sink.
    sink: Arc<Mutex<Option<InputSink>>>,
    /// Producer and output stream threads.
    output_threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Input stream thread.
    input_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) ({})", self.name, self.format, self.host_id.name())
    }
}

fn stream_error(e: impl fmt::Display) -> DeviceError {
    DeviceError::Stream(e.to_string())
}

/// Reads from the ring straight into the cpal buffer.
fn create_f32_callback(
    ring: Arc<CircularBuffer>,
) -> impl FnMut(&mut [f32], &cpal::OutputCallbackInfo) + Send + 'static {
    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        let read = ring.read(data);
        data[read..].fill(0.0);
    }
}

/// Reads from the ring into a reused scratch buffer and converts.
fn create_converting_callback<T>(
    ring: Arc<CircularBuffer>,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::new();
    move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        scratch.resize(data.len(), 0.0);
        let read = ring.read(&mut scratch);
        scratch[read..].fill(0.0);
        for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
            *dst = T::from_sample(src);
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: Arc<CircularBuffer>,
) -> Result<cpal::Stream, DeviceError> {
    let err_fn = |err: cpal::StreamError| error!(err = %err, "cpal output stream error");
    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_output_stream(
            config,
            create_converting_callback::<i16>(ring),
            err_fn,
            None,
        ),
        cpal::SampleFormat::I32 => device.build_output_stream(
            config,
            create_converting_callback::<i32>(ring),
            err_fn,
            None,
        ),
        _ => device.build_output_stream(config, create_f32_callback(ring), err_fn, None),
    };
    stream.map_err(stream_error)
}

fn build_input_stream(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    sink: Arc<Mutex<Option<InputSink>>>,
) -> Result<cpal::Stream, DeviceError> {
    let config = supported.config();
    let err_fn = |err: cpal::StreamError| error!(err = %err, "cpal input stream error");
    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|s| *s as f32 / 32768.0));
                    // Never block the input callback on the sink lock.
                    if let Some(mut guard) = sink.try_lock() {
                        if let Some(sink) = guard.as_mut() {
                            sink(&scratch);
                        }
                    }
                },
                err_fn,
                None,
            )
        }
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Some(mut guard) = sink.try_lock() {
                    if let Some(sink) = guard.as_mut() {
                        sink(data);
                    }
                }
            },
            err_fn,
            None,
        ),
    };
    stream.map_err(stream_error)
}

/// Parks the calling thread until `running` clears, keeping `stream` alive.
fn hold_stream(stream: cpal::Stream, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
}

impl Device {
    /// Lists the names of cpal output devices.
    pub fn list() -> Result<Vec<String>, DeviceError> {
        let mut names: Vec<String> = Device::list_cpal_devices(true)?
            .into_iter()
            .map(|(_, device)| device.name().unwrap_or_default())
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Lists cpal devices with either output or input configurations.
    fn list_cpal_devices(output: bool) -> Result<Vec<(cpal::HostId, cpal::Device)>, DeviceError> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout().map_err(stream_error)?;
        let _shh_stderr = shh::stderr().map_err(stream_error)?;

        let mut devices = Vec::new();
        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(host) => host,
                Err(e) => {
                    error!(err = %e, host = host_id.name(), "Unable to open host");
                    continue;
                }
            };
            let host_devices = match host.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(err = %e, host = host_id.name(), "Unable to list devices for host");
                    continue;
                }
            };

            for device in host_devices {
                let usable = if output {
                    device
                        .supported_output_configs()
                        .map(|mut configs| configs.next().is_some())
                        .unwrap_or(false)
                } else {
                    device
                        .supported_input_configs()
                        .map(|mut configs| configs.next().is_some())
                        .unwrap_or(false)
                };
                if usable {
                    devices.push((host_id, device));
                }
            }
        }
        Ok(devices)
    }

    fn find(name: &str, output: bool) -> Result<Option<(cpal::HostId, cpal::Device)>, DeviceError> {
        if name == "default" {
            let host = cpal::default_host();
            let device = if output {
                host.default_output_device()
            } else {
                host.default_input_device()
            };
            return Ok(device.map(|device| (host.id(), device)));
        }
        Ok(Device::list_cpal_devices(output)?
            .into_iter()
            .find(|(_, device)| {
                device
                    .name()
                    .map(|n| n.trim() == name)
                    .unwrap_or(false)
            }))
    }

    /// Gets the given cpal device. The input defaults to the host's default
    /// input; a missing input only disables capture.
    pub fn get(
        name: &str,
        input_name: Option<&str>,
        format: StreamFormat,
    ) -> Result<Device, DeviceError> {
        let (host_id, output) =
            Device::find(name, true)?.ok_or_else(|| DeviceError::NotFound(name.to_string()))?;

        let input = match Device::find(input_name.unwrap_or("default"), false) {
            Ok(Some((_, input))) => Some(input),
            Ok(None) => None,
            Err(e) => {
                warn!(err = %e, "Unable to find input device");
                None
            }
        };
        let input_format = input
            .as_ref()
            .and_then(|input| input.default_input_config().ok())
            .map(|config| StreamFormat::new(config.sample_rate().0, config.channels()));

        Ok(Device {
            name: output.name().unwrap_or_else(|_| name.to_string()),
            host_id,
            output,
            input,
            format,
            input_format,
            running: Arc::new(AtomicBool::new(false)),
            input_running: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(Mutex::new(None)),
            output_threads: Mutex::new(Vec::new()),
            input_thread: Mutex::new(None),
        })
    }

    /// Starts the input stream thread if an input and a sink are present.
    fn start_input(&self) -> Result<(), DeviceError> {
        let Some(device) = self.input.clone() else {
            return Err(DeviceError::NoInput(self.name.clone()));
        };
        if self.input_running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let supported = device.default_input_config().map_err(stream_error)?;
        let running = self.input_running.clone();
        let sink = self.sink.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let handle = thread::spawn(move || {
            let stream = match build_input_stream(&device, &supported, sink)
                .and_then(|stream| stream.play().map_err(stream_error).map(|_| stream))
            {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            info!("cpal input stream started");
            let _ = ready_tx.send(Ok(()));
            hold_stream(stream, &running);
        });
        *self.input_thread.lock() = Some(handle);

        match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop_input();
                Err(e)
            }
            Err(_) => {
                self.stop_input();
                Err(DeviceError::Stream("input stream did not start".to_string()))
            }
        }
    }

    fn stop_input(&self) {
        self.input_running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.input_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn join_output(&self) {
        for handle in self.output_threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl super::Device for Device {
    fn output_format(&self) -> StreamFormat {
        self.format
    }

    fn input_format(&self) -> Option<StreamFormat> {
        self.input_format
    }

    fn start(&self, mixer: Arc<AudioMixer>) -> Result<(), DeviceError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let num_channels = mixer.num_channels();
        // Roughly 100ms of audio between the producer and the callback.
        let capacity = (self.format.sample_rate as usize * num_channels as usize) / 10;
        let ring = Arc::new(CircularBuffer::new(capacity.max(1024)));

        let producer = {
            let running = self.running.clone();
            let ring = ring.clone();
            let priority = thread_priority::mix_thread_priority();
            let rt_audio = thread_priority::rt_audio_enabled();
            thread::spawn(move || {
                thread_priority::promote_current_thread(priority, rt_audio);
                let block_samples = BLOCK_FRAMES * num_channels as usize;
                let mut scratch = vec![0.0f32; block_samples];
                while running.load(Ordering::Relaxed) {
                    if ring.space() >= block_samples {
                        mixer.process_into_output(&mut scratch, BLOCK_FRAMES);
                        ring.write(&scratch);
                    } else {
                        thread::sleep(Duration::from_micros(500));
                    }
                }
            })
        };

        let sample_format = self
            .output
            .default_output_config()
            .map(|config| config.sample_format())
            .unwrap_or(cpal::SampleFormat::F32);
        let config = cpal::StreamConfig {
            channels: num_channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let output = {
            let device = self.output.clone();
            let running = self.running.clone();
            thread::spawn(move || {
                let stream = match build_output_stream(&device, &config, sample_format, ring)
                    .and_then(|stream| stream.play().map_err(stream_error).map(|_| stream))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!("cpal output stream started");
                let _ = ready_tx.send(Ok(()));
                hold_stream(stream, &running);
            })
        };
        self.output_threads.lock().extend([producer, output]);

        let started = match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Stream("output stream did not start".to_string())),
        };
        if let Err(e) = started {
            self.running.store(false, Ordering::Relaxed);
            self.join_output();
            return Err(e);
        }

        if self.sink.lock().is_some() {
            if let Err(e) = self.start_input() {
                warn!(err = %e, "Output started without input");
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.stop_input();
        self.join_output();
        info!(device = self.name, "cpal streams stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn attach_input(&self, sink: InputSink) -> Result<(), DeviceError> {
        if self.input.is_none() || self.input_format.is_none() {
            return Err(DeviceError::NoInput(self.name.clone()));
        }
        {
            let mut current = self.sink.lock();
            if current.is_some() {
                return Err(DeviceError::InputBusy);
            }
            *current = Some(sink);
        }
        if self.is_running() {
            if let Err(e) = self.start_input() {
                self.sink.lock().take();
                return Err(e);
            }
        }
        Ok(())
    }

    fn detach_input(&self) {
        self.stop_input();
        self.sink.lock().take();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.input_running.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
    }
}
