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

//! Streaming conversion of audio files to AIFF or WAV.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{info, span, warn, Level};

use crate::audio::sample_source::{
    create_sample_source_from_file, AudioTranscoder, SampleSource, SampleSourceError,
};
use crate::audio::{SampleFormat, TargetFormat};
use crate::util::{self, WavFileWriter};

mod aiff;

pub use aiff::AiffWriter;

/// Size of the working buffer a conversion streams through.
const CHUNK_BYTES: usize = 32 * 1024;

/// What to convert to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionFormat {
    /// Big-endian integer PCM AIFF, written to a sibling `.aiff`.
    Aiff {
        sample_rate: u32,
        bits_per_sample: u16,
    },
    /// PCM WAV. 32-bit output is float, anything narrower is integer.
    Wav {
        sample_rate: u32,
        bits_per_sample: u16,
    },
    /// AAC in an M4A container. No encoder is available.
    Aac { sample_rate: u32 },
    /// No encoder is available.
    Mp3 { sample_rate: u32, bit_rate: u32 },
}

impl ConversionFormat {
    fn extension(&self) -> &'static str {
        match self {
            ConversionFormat::Aiff { .. } => "aiff",
            ConversionFormat::Wav { .. } => "wav",
            ConversionFormat::Aac { .. } => "m4a",
            ConversionFormat::Mp3 { .. } => "mp3",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("conversion to {0} is not supported")]
    Unsupported(&'static str),

    #[error("invalid output format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Source(#[from] SampleSourceError),

    #[error("unable to write output: {0}")]
    Output(#[from] hound::Error),

    #[error("unable to write output: {0}")]
    Io(#[from] io::Error),
}

/// The open output file.
enum Output {
    Wav(WavFileWriter),
    Aiff(AiffWriter),
}

impl Output {
    fn create(
        path: &Path,
        target: &TargetFormat,
        channels: u16,
        aiff: bool,
    ) -> Result<Output, ConvertError> {
        if aiff {
            return Ok(Output::Aiff(AiffWriter::create(
                path,
                channels,
                target.sample_rate,
                target.bits_per_sample,
            )?));
        }
        Ok(Output::Wav(hound::WavWriter::create(
            path,
            target.wav_spec(channels),
        )?))
    }

    fn write_sample(&mut self, sample: f32, target: &TargetFormat) -> Result<(), ConvertError> {
        match self {
            Output::Aiff(writer) => writer.write_sample(sample)?,
            Output::Wav(writer) => match target.sample_format {
                SampleFormat::Float => writer.write_sample(sample)?,
                SampleFormat::Int => {
                    let scale = ((1i64 << (target.bits_per_sample.saturating_sub(1))) - 1) as f32;
                    writer.write_sample((sample.clamp(-1.0, 1.0) * scale).round() as i32)?
                }
            },
        }
        Ok(())
    }

    fn finalize(self) -> Result<(), ConvertError> {
        match self {
            Output::Aiff(writer) => writer.finalize()?,
            Output::Wav(writer) => writer.finalize()?,
        }
        Ok(())
    }
}

/// Converts `input`, writing a sibling file with the target's extension.
/// When that would be the input itself, the output is
/// `<stem>.converted.<ext>`. Returns the output path; a failed conversion
/// leaves no output behind.
pub fn convert(input: &Path, format: ConversionFormat) -> Result<PathBuf, ConvertError> {
    let (target, aiff) = match format {
        ConversionFormat::Aiff {
            sample_rate,
            bits_per_sample,
        } => (
            TargetFormat::new(sample_rate, SampleFormat::Int, bits_per_sample)
                .map_err(ConvertError::InvalidFormat)?,
            true,
        ),
        ConversionFormat::Wav {
            sample_rate,
            bits_per_sample,
        } => {
            let sample_format = if bits_per_sample == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            };
            (
                TargetFormat::new(sample_rate, sample_format, bits_per_sample)
                    .map_err(ConvertError::InvalidFormat)?,
                false,
            )
        }
        ConversionFormat::Aac { .. } => return Err(ConvertError::Unsupported("aac")),
        ConversionFormat::Mp3 { .. } => return Err(ConvertError::Unsupported("mp3")),
    };

    let span = span!(Level::INFO, "convert", input = ?input, target = %target);
    let _enter = span.enter();

    let source = create_sample_source_from_file(input)?;
    let channels = source.channel_count();
    let mut source = AudioTranscoder::new(source, target.sample_rate)?;

    let output = output_path(input, format);
    let mut writer = Output::create(&output, &target, channels, aiff)?;
    let result = stream(&mut source, &mut writer, &target).and_then(|frames| {
        writer.finalize()?;
        Ok(frames)
    });

    match result {
        Ok(frames) => {
            info!(output = ?output, frames, "Converted");
            Ok(output)
        }
        Err(e) => {
            warn!(err = %e, "Conversion failed, removing output");
            if let Err(e) = fs::remove_file(&output) {
                warn!(output = ?output, err = %e, "Unable to remove partial output");
            }
            Err(e)
        }
    }
}

/// The file a conversion of `input` writes to.
pub fn output_path(input: &Path, format: ConversionFormat) -> PathBuf {
    let extension = format.extension();
    let sibling = input.with_extension(extension);
    if sibling != input {
        return sibling;
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| util::filename_display(input).to_string());
    input.with_file_name(format!("{}.converted.{}", stem, extension))
}

/// Copies the source into the writer chunk by chunk. Returns frames written.
fn stream(
    source: &mut impl SampleSource,
    writer: &mut Output,
    target: &TargetFormat,
) -> Result<u64, ConvertError> {
    let channels = source.channel_count().max(1) as usize;
    let chunk_frames = (CHUNK_BYTES / (std::mem::size_of::<f32>() * channels)).max(1);
    let mut planar = vec![Vec::with_capacity(chunk_frames); channels];

    let mut total = 0u64;
    loop {
        let frames = source.next_chunk(&mut planar, chunk_frames)?;
        if frames == 0 {
            break;
        }
        for frame in 0..frames {
            for channel in planar.iter() {
                writer.write_sample(channel[frame], target)?;
            }
        }
        total += frames as u64;
    }
    Ok(total)
}
