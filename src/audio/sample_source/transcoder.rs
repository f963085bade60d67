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
use parking_lot::Mutex;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::error::SampleSourceError;
use super::traits::{check_channels, SampleSource};

/// Input block size for the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

/// Sliding window of planar input waiting for the resampler.
struct PlanarInputBuffer {
    /// Per-channel input samples
    channels: Vec<Vec<f32>>,
    /// Whether the source has reached EOF
    source_finished: bool,
}

impl PlanarInputBuffer {
    fn new(num_channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); num_channels],
            source_finished: false,
        }
    }

    /// Number of frames currently buffered
    fn len(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    fn push_planar(&mut self, planar_input: &[Vec<f32>], num_frames: usize) {
        for (ch, input) in self.channels.iter_mut().zip(planar_input) {
            ch.extend_from_slice(&input[..num_frames.min(input.len())]);
        }
    }

    /// Drops the first `n` frames from every channel.
    fn drain_frames(&mut self, n: usize) {
        for ch in &mut self.channels {
            ch.drain(0..n.min(ch.len()));
        }
    }
}

/// Planar FIFO of resampled frames waiting to be handed out.
struct PlanarOutputFifo {
    /// Per-channel resampled samples
    channels: Vec<Vec<f32>>,
    /// Read position in frames
    read_pos: usize,
}

impl PlanarOutputFifo {
    fn new(num_channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); num_channels],
            read_pos: 0,
        }
    }

    /// Frames left to read
    fn available_frames(&self) -> usize {
        self.channels
            .first()
            .map(|c| c.len().saturating_sub(self.read_pos))
            .unwrap_or(0)
    }

    /// Appends up to max_frames to output. Returns the frames appended.
    fn drain_to_planar(&mut self, output: &mut [Vec<f32>], max_frames: usize) -> usize {
        let to_copy = self.available_frames().min(max_frames);
        if to_copy > 0 {
            for (out_ch, ch) in output.iter_mut().zip(&self.channels) {
                out_ch.extend_from_slice(&ch[self.read_pos..self.read_pos + to_copy]);
            }
            self.read_pos += to_copy;

            // Compact once enough has been consumed
            if self.read_pos > 4096 {
                for ch in self.channels.iter_mut() {
                    ch.drain(..self.read_pos);
                }
                self.read_pos = 0;
            }
        }
        to_copy
    }

    fn push_planar(&mut self, per_channel: &[Vec<f32>], num_frames: usize) {
        for (ch, input) in self.channels.iter_mut().zip(per_channel) {
            ch.extend_from_slice(&input[..num_frames.min(input.len())]);
        }
    }
}

/// Wraps a SampleSource and resamples it to a target rate with rubato.
/// Sources already at the target rate pass straight through.
pub struct AudioTranscoder<S: SampleSource> {
    source: S,
    /// Sinc resampler, in a Mutex so the transcoder stays Sync.
    resampler: Option<Mutex<SincFixedIn<f32>>>,
    source_rate: u32,
    target_rate: u32,
    channels: u16,
    input_buffer: PlanarInputBuffer,
    output_fifo: PlanarOutputFifo,
    /// Reused resampler output buffer.
    output_scratch: Vec<Vec<f32>>,
    /// Reused source read buffer.
    source_planar_buffer: Vec<Vec<f32>>,
}

impl<S> SampleSource for AudioTranscoder<S>
where
    S: SampleSource,
{
    fn next_chunk(
        &mut self,
        output: &mut [Vec<f32>],
        max_frames: usize,
    ) -> Result<usize, SampleSourceError> {
        // Same rate, pass through
        if self.resampler.is_none() {
            return self.source.next_chunk(output, max_frames);
        }

        check_channels(output, self.channels as usize)?;

        // Clear output buffers
        for ch in output.iter_mut() {
            ch.clear();
        }

        let mut total_frames = 0;
        while total_frames < max_frames {
            // Hand out whatever the FIFO already holds first
            total_frames += self
                .output_fifo
                .drain_to_planar(output, max_frames - total_frames);
            if total_frames >= max_frames {
                break;
            }

            let had_output = self.fill_output_fifo()?;

            // Nothing new and nothing left upstream
            if !had_output
                && self.input_buffer.source_finished
                && self.output_fifo.available_frames() == 0
            {
                break;
            }
        }

        Ok(total_frames)
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn bits_per_sample(&self) -> u16 {
        if self.resampler.is_some() {
            32
        } else {
            self.source.bits_per_sample()
        }
    }

    fn sample_format(&self) -> crate::audio::SampleFormat {
        if self.resampler.is_some() {
            crate::audio::SampleFormat::Float
        } else {
            self.source.sample_format()
        }
    }

    fn duration(&self) -> Option<std::time::Duration> {
        self.source.duration()
    }
}

impl<S> AudioTranscoder<S>
where
    S: SampleSource,
{
    /// Creates a transcoder producing `target_rate` from the source.
    pub fn new(source: S, target_rate: u32) -> Result<Self, SampleSourceError> {
        let source_rate = source.sample_rate();
        let channels = source.channel_count();
        if target_rate == 0 || source_rate == 0 {
            return Err(SampleSourceError::ResamplingFailed(source_rate, target_rate));
        }

        // No resampler at all when the rates already match
        let (resampler, output_scratch) = if source_rate != target_rate {
            let sinc_params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                oversampling_factor: 128,
                interpolation: SincInterpolationType::Linear,
                window: WindowFunction::BlackmanHarris2,
            };
            let r = SincFixedIn::<f32>::new(
                target_rate as f64 / source_rate as f64,
                1.0,
                sinc_params,
                INPUT_BLOCK_SIZE,
                channels as usize,
            )
            .map_err(|_| SampleSourceError::ResamplingFailed(source_rate, target_rate))?;

            let scratch = r.output_buffer_allocate(true);
            (Some(Mutex::new(r)), scratch)
        } else {
            (None, Vec::new())
        };

        Ok(AudioTranscoder {
            source,
            resampler,
            source_rate,
            target_rate,
            channels,
            input_buffer: PlanarInputBuffer::new(channels as usize),
            output_fifo: PlanarOutputFifo::new(channels as usize),
            output_scratch,
            source_planar_buffer: vec![Vec::with_capacity(INPUT_BLOCK_SIZE); channels as usize],
        })
    }

    /// Returns true if the source rate differs from the target rate.
    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Reads from the source and runs the resampler once. Returns true if
    /// any output was produced.
    fn fill_output_fifo(&mut self) -> Result<bool, SampleSourceError> {
        let Some(resampler) = self.resampler.as_ref() else {
            return Ok(false);
        };
        let mut resampler = resampler.lock();
        let input_frames_needed = resampler.input_frames_next();

        // Read from the source until the resampler has a full block
        while !self.input_buffer.source_finished && self.input_buffer.len() < input_frames_needed {
            let frames_needed = input_frames_needed - self.input_buffer.len();
            let frames_read = self
                .source
                .next_chunk(&mut self.source_planar_buffer, frames_needed)?;
            if frames_read == 0 {
                self.input_buffer.source_finished = true;
                break;
            }
            self.input_buffer
                .push_planar(&self.source_planar_buffer, frames_read);
        }

        // Full block, or flush the tail once the source is done
        let (nbr_in, nbr_out) = if self.input_buffer.len() >= input_frames_needed {
            resampler
                .process_into_buffer(&self.input_buffer.channels[..], &mut self.output_scratch[..], None)
                .map_err(|_| SampleSourceError::ResamplingFailed(self.source_rate, self.target_rate))?
        } else if self.input_buffer.source_finished && self.input_buffer.len() > 0 {
            let (_, nbr_out) = resampler
                .process_partial_into_buffer(
                    Some(&self.input_buffer.channels[..]),
                    &mut self.output_scratch[..],
                    None,
                )
                .map_err(|_| SampleSourceError::ResamplingFailed(self.source_rate, self.target_rate))?;
            (self.input_buffer.len(), nbr_out)
        } else {
            return Ok(false);
        };
        // Release the lock before touching our own buffers
        drop(resampler);

        self.input_buffer.drain_frames(nbr_in);
        if nbr_out > 0 {
            self.output_fifo.push_planar(&self.output_scratch, nbr_out);
            return Ok(true);
        }
        Ok(false)
    }
}
