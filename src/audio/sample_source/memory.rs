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
use super::error::SampleSourceError;
use super::traits::{check_channels, SampleSource};

/// A sample source over interleaved samples already in memory. Used to push
/// captured or synthesized audio through the transcoder.
///
/// Input samples are provided as interleaved for convenience but stored planar internally.
pub struct MemorySampleSource {
    /// Planar sample storage (one Vec per channel)
    planar_samples: Vec<Vec<f32>>,
    /// Current position in frames
    current_frame: usize,
    channel_count: u16,
    sample_rate: u32,
}

impl MemorySampleSource {
    /// Creates a new memory sample source from interleaved samples.
    /// The samples are converted to planar format internally; a trailing
    /// partial frame is dropped.
    pub fn new(interleaved_samples: &[f32], channel_count: u16, sample_rate: u32) -> Self {
        let num_channels = channel_count as usize;
        let num_frames = if num_channels > 0 {
            interleaved_samples.len() / num_channels
        } else {
            0
        };

        // Convert interleaved to planar
        let mut planar_samples = vec![Vec::with_capacity(num_frames); num_channels];
        for frame in interleaved_samples.chunks_exact(num_channels.max(1)).take(num_frames) {
            for (ch, sample) in frame.iter().enumerate() {
                planar_samples[ch].push(*sample);
            }
        }

        Self {
            planar_samples,
            current_frame: 0,
            channel_count,
            sample_rate,
        }
    }

    /// Returns the total number of frames
    fn total_frames(&self) -> usize {
        self.planar_samples.first().map(|c| c.len()).unwrap_or(0)
    }
}

impl SampleSource for MemorySampleSource {
    fn next_chunk(
        &mut self,
        output: &mut [Vec<f32>],
        max_frames: usize,
    ) -> Result<usize, SampleSourceError> {
        check_channels(output, self.channel_count as usize)?;

        // Clear output buffers
        for ch in output.iter_mut() {
            ch.clear();
        }

        let to_copy = self
            .total_frames()
            .saturating_sub(self.current_frame)
            .min(max_frames);
        if to_copy > 0 {
            let range = self.current_frame..self.current_frame + to_copy;
            for (out_ch, in_ch) in output.iter_mut().zip(self.planar_samples.iter()) {
                out_ch.extend_from_slice(&in_ch[range.clone()]);
            }
            self.current_frame += to_copy;
        }
        Ok(to_copy)
    }

    fn channel_count(&self) -> u16 {
        self.channel_count
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bits_per_sample(&self) -> u16 {
        32 // Memory samples are 32-bit float
    }

    fn sample_format(&self) -> crate::audio::SampleFormat {
        crate::audio::SampleFormat::Float
    }

    fn duration(&self) -> Option<std::time::Duration> {
        if self.sample_rate == 0 {
            return None;
        }
        Some(std::time::Duration::from_secs_f64(
            self.total_frames() as f64 / self.sample_rate as f64,
        ))
    }
}
