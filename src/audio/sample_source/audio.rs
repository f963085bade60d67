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
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use super::error::SampleSourceError;
use super::traits::{check_channels, SampleSource};
use crate::audio::SampleFormat;

/// A sample source that decodes audio files (WAV, AIFF, FLAC, MP3 and whatever
/// else symphonia knows) into f32 samples.
pub struct AudioSampleSource {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    is_finished: bool,
    /// Decoded interleaved samples not yet handed out.
    pending: Vec<f32>,
    /// Read position within pending, in samples.
    pending_pos: usize,
    bits_per_sample: u16,
    channels: u16,
    sample_rate: u32,
    sample_format: SampleFormat,
    frames: Option<u64>,
}

impl SampleSource for AudioSampleSource {
    fn next_chunk(
        &mut self,
        output: &mut [Vec<f32>],
        max_frames: usize,
    ) -> Result<usize, SampleSourceError> {
        let channels = self.channels as usize;
        check_channels(output, channels)?;
        for ch in output.iter_mut() {
            ch.clear();
        }

        let mut written = 0;
        while written < max_frames {
            let pending_frames = (self.pending.len() - self.pending_pos) / channels;
            if pending_frames == 0 {
                if self.is_finished {
                    break;
                }
                self.pending.clear();
                self.pending_pos = 0;
                match Self::read_and_decode_next_packet_for_track(
                    self.format_reader.as_mut(),
                    self.decoder.as_mut(),
                    self.track_id,
                )? {
                    Some((samples, decoded_channels)) if decoded_channels == channels => {
                        self.pending = samples;
                    }
                    Some((_, decoded_channels)) => {
                        return Err(SampleSourceError::ChannelMismatch {
                            expected: channels,
                            actual: decoded_channels,
                        });
                    }
                    None => self.is_finished = true,
                }
                continue;
            }

            let take = pending_frames.min(max_frames - written);
            let end = self.pending_pos + take * channels;
            for frame in self.pending[self.pending_pos..end].chunks_exact(channels) {
                for (out_ch, sample) in output.iter_mut().zip(frame) {
                    out_ch.push(*sample);
                }
            }
            self.pending_pos = end;
            written += take;
        }
        Ok(written)
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    fn duration(&self) -> Option<Duration> {
        self.frames
            .map(|frames| Duration::from_secs_f64(frames as f64 / self.sample_rate as f64))
    }
}

impl AudioSampleSource {
    /// Opens an audio file and detects its container format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SampleSourceError> {
        let path = path.as_ref();
        let file_path = path.to_string_lossy().to_string();
        let undecodable = |reason: String| SampleSourceError::Undecodable {
            path: file_path.clone(),
            reason,
        };

        // Include the path so the caller sees which file failed.
        let file = File::open(path).map_err(|e| {
            SampleSourceError::IoError(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();
        let detected = get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| undecodable(e.to_string()))?;
        let mut format_reader = detected.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| undecodable("no audio track found".to_string()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .filter(|rate| *rate > 0)
            .ok_or_else(|| undecodable("sample rate not specified".to_string()))?;
        let bits_per_sample = params.bits_per_sample.unwrap_or(16) as u16;
        let sample_format = if params.codec == symphonia::core::codecs::CODEC_TYPE_PCM_F32LE
            || params.codec == symphonia::core::codecs::CODEC_TYPE_PCM_F32BE
            || params.codec == symphonia::core::codecs::CODEC_TYPE_PCM_F64LE
            || params.codec == symphonia::core::codecs::CODEC_TYPE_PCM_F64BE
        {
            SampleFormat::Float
        } else {
            SampleFormat::Int
        };

        let decoder_opts: DecoderOptions = Default::default();
        let mut decoder = get_codecs()
            .make(&params, &decoder_opts)
            .map_err(|e| undecodable(e.to_string()))?;

        // Some containers omit the channel layout. Decode the first packet to
        // find it and keep its samples.
        let (channels, pending) = match params.channels.map(|c| c.count() as u16) {
            Some(channels) if channels > 0 => (channels, Vec::new()),
            _ => match Self::read_and_decode_next_packet_for_track(
                format_reader.as_mut(),
                decoder.as_mut(),
                track_id,
            )? {
                Some((samples, channels)) => (channels as u16, samples),
                None => return Err(undecodable("channels not specified".to_string())),
            },
        };

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            is_finished: false,
            pending,
            pending_pos: 0,
            bits_per_sample,
            channels,
            sample_rate,
            sample_format,
            frames: params.n_frames,
        })
    }

    /// Reads the next packet. Ok(None) marks the end of the stream.
    fn read_next_packet(
        format_reader: &mut dyn FormatReader,
    ) -> Result<Option<Packet>, SampleSourceError> {
        match format_reader.next_packet() {
            Ok(packet) => Ok(Some(packet)),
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            // Some demuxers report the end of the stream as a decode error.
            Err(SymphoniaError::DecodeError(_)) => Ok(None),
            Err(e) => Err(SampleSourceError::AudioError(e)),
        }
    }

    /// Reads and decodes packets until one yields samples for the track.
    /// Returns the interleaved samples and their channel count, or None at EOF.
    fn read_and_decode_next_packet_for_track(
        format_reader: &mut dyn FormatReader,
        decoder: &mut dyn Decoder,
        track_id: u32,
    ) -> Result<Option<(Vec<f32>, usize)>, SampleSourceError> {
        loop {
            let packet = match Self::read_next_packet(format_reader) {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(None),
                Err(SampleSourceError::AudioError(SymphoniaError::ResetRequired)) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => return Err(e),
            };
            if packet.track_id() != track_id {
                continue;
            }
            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    decoder.decode(&packet)?
                }
                // A corrupt packet is skipped rather than ending the track.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(SampleSourceError::AudioError(e)),
            };
            let (samples, channels) = Self::decode_buffer_to_f32(decoded);
            if channels > 0 && !samples.is_empty() {
                return Ok(Some((samples, channels)));
            }
        }
    }

    /// Converts a decoded buffer to interleaved f32 samples.
    fn decode_buffer_to_f32(decoded: AudioBufferRef) -> (Vec<f32>, usize) {
        match decoded {
            AudioBufferRef::F32(buf) => Self::interleave_planar_samples(&buf, |s| s),
            AudioBufferRef::F64(buf) => Self::interleave_planar_samples(&buf, |s| s as f32),
            AudioBufferRef::S8(buf) => Self::interleave_planar_samples(&buf, Self::scale_s8),
            AudioBufferRef::S16(buf) => Self::interleave_planar_samples(&buf, Self::scale_s16),
            AudioBufferRef::S24(buf) => {
                Self::interleave_planar_samples(&buf, |s| Self::scale_s24(s.inner()))
            }
            AudioBufferRef::S32(buf) => Self::interleave_planar_samples(&buf, Self::scale_s32),
            AudioBufferRef::U8(buf) => Self::interleave_planar_samples(&buf, Self::scale_u8),
            AudioBufferRef::U16(buf) => Self::interleave_planar_samples(&buf, Self::scale_u16),
            AudioBufferRef::U24(buf) => {
                Self::interleave_planar_samples(&buf, |s| Self::scale_u24(s.inner()))
            }
            AudioBufferRef::U32(buf) => Self::interleave_planar_samples(&buf, Self::scale_u32),
        }
    }

    fn interleave_planar_samples<T, F>(buf: &AudioBuffer<T>, convert: F) -> (Vec<f32>, usize)
    where
        T: symphonia::core::sample::Sample,
        F: Fn(T) -> f32,
    {
        let frames = buf.frames();
        let channels = buf.spec().channels.count();
        let planes = buf.planes();
        let planes = planes.planes();
        let mut samples = Vec::with_capacity(frames * channels);
        for frame_idx in 0..frames {
            for plane in planes.iter().take(channels) {
                samples.push(convert(plane[frame_idx]));
            }
        }
        (samples, channels)
    }

    #[inline]
    pub(crate) fn scale_s8(sample: i8) -> f32 {
        sample as f32 / (1i64 << 7) as f32
    }

    #[inline]
    pub(crate) fn scale_s16(sample: i16) -> f32 {
        sample as f32 / (1i64 << 15) as f32
    }

    #[inline]
    pub(crate) fn scale_s24(sample: i32) -> f32 {
        sample as f32 / (1i64 << 23) as f32
    }

    #[inline]
    pub(crate) fn scale_s32(sample: i32) -> f32 {
        sample as f32 / (1i64 << 31) as f32
    }

    #[inline]
    pub(crate) fn scale_u8(sample: u8) -> f32 {
        (sample as f32 / u8::MAX as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u16(sample: u16) -> f32 {
        (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u24(sample: u32) -> f32 {
        let max = (1u32 << 24) - 1;
        (sample as f32 / max as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u32(sample: u32) -> f32 {
        (sample as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn test_decodes_int_wav() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tone.wav");
        write_wav(&path, vec![vec![0_i32, 16384, -16384], vec![1, 2, 3]], 44100)?;

        let mut source = AudioSampleSource::from_file(&path)?;
        assert_eq!(source.channel_count(), 2);
        assert_eq!(source.sample_rate(), 44100);
        assert_eq!(source.sample_format(), SampleFormat::Int);

        let samples = source.read_interleaved()?;
        assert_eq!(samples.len(), 6);
        assert_eq!(samples[0], 0.0);
        assert!((samples[2] - AudioSampleSource::scale_s32(16384)).abs() < 1e-9);
        assert_eq!(
            source.duration(),
            Some(Duration::from_secs_f64(3.0 / 44100.0))
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            AudioSampleSource::from_file("/nonexistent/track.wav"),
            Err(SampleSourceError::IoError(_))
        ));
    }

    #[test]
    fn test_garbage_file_is_undecodable() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"definitely not audio")?;
        assert!(matches!(
            AudioSampleSource::from_file(&path),
            Err(SampleSourceError::Undecodable { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_integer_scaling() {
        assert_eq!(AudioSampleSource::scale_s16(i16::MIN), -1.0);
        assert_eq!(AudioSampleSource::scale_s8(0), 0.0);
        assert_eq!(AudioSampleSource::scale_u8(0), -1.0);
        assert_eq!(AudioSampleSource::scale_u16(u16::MAX), 1.0);
    }
}
