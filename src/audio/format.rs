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

use std::fmt;

/// Sample format enumeration for audio processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Integer samples (e.g., 16-bit, 24-bit, 32-bit)
    Int,
    /// Floating point samples (32-bit float)
    Float,
}

impl SampleFormat {
    /// Convert to string representation
    pub fn as_str(self) -> &'static str {
        match self {
            SampleFormat::Float => "float",
            SampleFormat::Int => "int",
        }
    }

    /// The matching hound sample format for WAV output.
    pub fn to_hound(self) -> hound::SampleFormat {
        match self {
            SampleFormat::Float => hound::SampleFormat::Float,
            SampleFormat::Int => hound::SampleFormat::Int,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Target audio format for transcoding
#[derive(Debug, Clone, PartialEq)]
pub struct TargetFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Sample format (integer or float)
    pub sample_format: SampleFormat,
    /// Bits per sample
    pub bits_per_sample: u16,
}

impl TargetFormat {
    /// Creates a new TargetFormat, rejecting depths WAV cannot hold.
    pub fn new(
        sample_rate: u32,
        sample_format: SampleFormat,
        bits_per_sample: u16,
    ) -> Result<Self, String> {
        if sample_rate == 0 {
            return Err("sample rate must be greater than 0".to_string());
        }
        let supported = match sample_format {
            SampleFormat::Int => matches!(bits_per_sample, 8 | 16 | 24 | 32),
            SampleFormat::Float => bits_per_sample == 32,
        };
        if !supported {
            return Err(format!(
                "{} samples cannot be {} bits",
                sample_format, bits_per_sample
            ));
        }

        Ok(TargetFormat {
            sample_rate,
            sample_format,
            bits_per_sample,
        })
    }

    /// The WAV spec for this format with the given channel count.
    pub fn wav_spec(&self, channels: u16) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: self.sample_format.to_hound(),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}-bit {}",
            self.sample_rate, self.bits_per_sample, self.sample_format
        )
    }
}

/// The shape of an interleaved f32 stream: the mix bus, a device output or
/// a device input all share this description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channels per frame.
    pub channels: u16,
}

impl StreamFormat {
    /// Creates a new stream format.
    pub fn new(sample_rate: u32, channels: u16) -> StreamFormat {
        StreamFormat {
            sample_rate,
            channels,
        }
    }

    /// Converts seconds into a whole number of frames at this rate.
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f64).round() as u64
    }

    /// The WAV spec used when this stream is written to disk.
    pub fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}
