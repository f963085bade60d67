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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{error, info, span, warn, Level};

use crate::audio::{InputSink, StreamFormat};
use crate::error::EngineError;
use crate::util::{self, WavFileWriter};

/// Capacity of each recycled input buffer, in samples.
const BUFFER_CAPACITY: usize = 4096;

/// A live capture to a WAV file. The input callback copies each buffer into
/// a recycled one and queues it without blocking; a writer thread owns the
/// file and appends queued buffers.
pub struct CaptureSession {
    path: PathBuf,
    format: StreamFormat,
    overruns: Arc<AtomicU64>,
    writer: Option<thread::JoinHandle<Result<u64, hound::Error>>>,
}

impl CaptureSession {
    /// Creates `<root>/<uuid>.wav` in the input's format and starts the
    /// writer. Returns the session and the sink to attach to the input.
    pub fn create(
        root: &Path,
        format: StreamFormat,
        queue_buffers: usize,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<(CaptureSession, InputSink), EngineError> {
        let path = util::generated_wav_path(root);
        let writer = util::create_wav(&path, format.wav_spec(), attempts, retry_delay)?;

        let queue_buffers = queue_buffers.max(1);
        let (filled_tx, filled_rx) = bounded::<Vec<f32>>(queue_buffers);
        let (free_tx, free_rx) = recycled_buffers(queue_buffers, BUFFER_CAPACITY);

        let overruns = Arc::new(AtomicU64::new(0));
        let sink = input_sink(
            filled_tx,
            free_tx.clone(),
            free_rx,
            chunk_samples(BUFFER_CAPACITY, format.channels),
            overruns.clone(),
        );

        let thread_path = path.clone();
        let handle = thread::spawn(move || write_buffers(writer, filled_rx, free_tx, &thread_path));

        info!(path = ?path, format = %format, "Capture started");
        Ok((
            CaptureSession {
                path,
                format,
                overruns,
                writer: Some(handle),
            },
            sink,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The generated file name, relative to the storage root.
    pub fn filename(&self) -> &str {
        util::filename_display(&self.path)
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Input buffers dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Waits for the writer to drain the queue and finalize the file. The
    /// sink must already be detached, otherwise this waits for it to drop.
    pub fn finish(mut self) -> Result<PathBuf, EngineError> {
        let span = span!(Level::INFO, "capture finish");
        let _enter = span.enter();

        let frames = match self.writer.take().map(|handle| handle.join()) {
            Some(Ok(Ok(frames))) => frames,
            Some(Ok(Err(e))) => {
                return Err(EngineError::unavailable(self.path.display().to_string(), e));
            }
            Some(Err(_)) => {
                return Err(EngineError::unavailable(
                    self.path.display().to_string(),
                    "capture writer panicked",
                ));
            }
            None => 0,
        };

        let overruns = self.overruns();
        if overruns > 0 {
            warn!(overruns, "Input buffers were dropped during capture");
        }
        info!(path = ?self.path, frames, "Capture finished");
        Ok(self.path.clone())
    }
}

/// A pool of preallocated buffers, handed out through the receiver and
/// returned through the sender.
fn recycled_buffers(count: usize, capacity: usize) -> (Sender<Vec<f32>>, Receiver<Vec<f32>>) {
    let (free_tx, free_rx) = bounded::<Vec<f32>>(count);
    for _ in 0..count {
        let _ = free_tx.try_send(Vec::with_capacity(capacity));
    }
    (free_tx, free_rx)
}

/// The largest whole number of frames that fits in a buffer, in samples.
fn chunk_samples(capacity: usize, channels: u16) -> usize {
    let channels = channels.max(1) as usize;
    (capacity / channels).max(1) * channels
}

/// Builds the input callback. Input is copied in chunks of whole frames into
/// recycled buffers, so the callback never allocates. When no buffer is free
/// or the queue is full, the rest of the input is dropped and an overrun is
/// counted.
fn input_sink(
    filled_tx: Sender<Vec<f32>>,
    free_tx: Sender<Vec<f32>>,
    free_rx: Receiver<Vec<f32>>,
    chunk_samples: usize,
    overruns: Arc<AtomicU64>,
) -> InputSink {
    Box::new(move |data: &[f32]| {
        for chunk in data.chunks(chunk_samples) {
            let Ok(mut buffer) = free_rx.try_recv() else {
                overruns.fetch_add(1, Ordering::Relaxed);
                return;
            };
            buffer.clear();
            buffer.extend_from_slice(&chunk[..chunk.len().min(buffer.capacity())]);
            if let Err(TrySendError::Full(buffer) | TrySendError::Disconnected(buffer)) =
                filled_tx.try_send(buffer)
            {
                overruns.fetch_add(1, Ordering::Relaxed);
                let _ = free_tx.try_send(buffer);
                return;
            }
        }
    })
}

/// Appends queued buffers until every sender is gone. Returns frames written.
fn write_buffers(
    mut writer: WavFileWriter,
    filled_rx: Receiver<Vec<f32>>,
    free_tx: Sender<Vec<f32>>,
    path: &Path,
) -> Result<u64, hound::Error> {
    let channels = writer.spec().channels.max(1) as u64;
    let mut samples = 0u64;
    for buffer in filled_rx.iter() {
        for sample in buffer.iter() {
            if let Err(e) = writer.write_sample(*sample) {
                error!(path = ?path, err = %e, "Capture write failed");
                return Err(e);
            }
        }
        samples += buffer.len() as u64;
        let _ = free_tx.try_send(buffer);
    }
    writer.finalize()?;
    Ok(samples / channels)
}
