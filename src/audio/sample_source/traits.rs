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

/// Frames requested per chunk when draining a source completely.
const DRAIN_CHUNK_FRAMES: usize = 4096;

/// A source of audio samples that processes chunks in planar format.
/// Planar format stores all samples for channel 0, then all samples for channel 1, etc.
/// Decoders produce planar audio, and the mix bus and file writers interleave
/// only at the end.
pub trait SampleSource: Send + Sync {
    /// Get the next chunk of samples from the source in planar format.
    /// Each inner Vec corresponds to one channel, and every channel gets the
    /// same number of samples.
    /// Returns the number of frames (samples per channel) written (0 = EOF).
    /// Returns Err(error) if decoding failed.
    ///
    /// The output slice must have exactly channel_count() elements.
    /// Each channel Vec is cleared and filled with up to max_frames samples.
    fn next_chunk(
        &mut self,
        output: &mut [Vec<f32>],
        max_frames: usize,
    ) -> Result<usize, SampleSourceError>;

    /// Get the number of channels in this source
    fn channel_count(&self) -> u16;

    /// Get the sample rate of this source
    fn sample_rate(&self) -> u32;

    /// Get the bits per sample of this source
    fn bits_per_sample(&self) -> u16;

    /// Get the sample format of this source
    fn sample_format(&self) -> crate::audio::SampleFormat;

    /// Get the duration of this source, if the container reports it.
    /// Returns None if the duration is unknown, in which case callers measure
    /// what they decode instead.
    fn duration(&self) -> Option<std::time::Duration>;

    /// Drains the rest of the source into one interleaved buffer.
    /// Frames are written channel by channel: L R L R for stereo.
    fn read_interleaved(&mut self) -> Result<Vec<f32>, SampleSourceError> {
        let channels = self.channel_count() as usize;
        let mut planar = vec![Vec::with_capacity(DRAIN_CHUNK_FRAMES); channels];
        let mut interleaved = Vec::new();
        loop {
            let frames = self.next_chunk(&mut planar, DRAIN_CHUNK_FRAMES)?;
            if frames == 0 {
                break;
            }
            interleaved.reserve(frames * channels);
            for frame in 0..frames {
                for channel in planar.iter() {
                    interleaved.push(channel[frame]);
                }
            }
        }
        Ok(interleaved)
    }
}

/// Blanket implementation for Box<dyn SampleSource>
/// This allows the boxed source returned by the factory to be handed to
/// generic wrappers like the transcoder without a wrapper type.
impl SampleSource for Box<dyn SampleSource> {
    fn next_chunk(
        &mut self,
        output: &mut [Vec<f32>],
        max_frames: usize,
    ) -> Result<usize, SampleSourceError> {
        (**self).next_chunk(output, max_frames)
    }

    fn channel_count(&self) -> u16 {
        (**self).channel_count()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn bits_per_sample(&self) -> u16 {
        (**self).bits_per_sample()
    }

    fn sample_format(&self) -> crate::audio::SampleFormat {
        (**self).sample_format()
    }

    fn duration(&self) -> Option<std::time::Duration> {
        (**self).duration()
    }
}

/// Checks that a planar chunk buffer matches the source's channel count.
pub(crate) fn check_channels(
    output: &[Vec<f32>],
    expected: usize,
) -> Result<(), SampleSourceError> {
    if output.len() != expected {
        return Err(SampleSourceError::ChannelMismatch {
            expected,
            actual: output.len(),
        });
    }
    Ok(())
}
