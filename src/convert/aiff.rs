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

//! A streaming AIFF writer for big-endian integer PCM.
//!
//! The file is laid out as FORM, COMM and SSND chunks. Sizes and the frame
//! count are written as placeholders and patched on finalize.

use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

/// Offset of the FORM chunk size.
const FORM_SIZE_OFFSET: u64 = 4;
/// Offset of the frame count in the COMM chunk.
const FRAME_COUNT_OFFSET: u64 = 22;
/// Offset of the SSND chunk size.
const SSND_SIZE_OFFSET: u64 = 42;
/// Bytes from the start of the file to the first sample.
const HEADER_LEN: u64 = 54;

pub struct AiffWriter {
    writer: BufWriter<File>,
    channels: u16,
    bits_per_sample: u16,
    scale: f32,
    data_bytes: u64,
}

impl AiffWriter {
    /// Creates the file and writes its header. Only 8, 16, 24 and 32-bit
    /// samples can be written.
    pub fn create(
        path: &Path,
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
    ) -> io::Result<AiffWriter> {
        if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}-bit AIFF is not supported", bits_per_sample),
            ));
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(b"FORM")?;
        writer.write_all(&0u32.to_be_bytes())?;
        writer.write_all(b"AIFF")?;

        writer.write_all(b"COMM")?;
        writer.write_all(&18u32.to_be_bytes())?;
        writer.write_all(&(channels as i16).to_be_bytes())?;
        writer.write_all(&0u32.to_be_bytes())?;
        writer.write_all(&(bits_per_sample as i16).to_be_bytes())?;
        writer.write_all(&extended(sample_rate))?;

        writer.write_all(b"SSND")?;
        writer.write_all(&0u32.to_be_bytes())?;
        // Offset and block size.
        writer.write_all(&0u32.to_be_bytes())?;
        writer.write_all(&0u32.to_be_bytes())?;

        Ok(AiffWriter {
            writer,
            channels: channels.max(1),
            bits_per_sample,
            scale: ((1i64 << (bits_per_sample - 1)) - 1) as f32,
            data_bytes: 0,
        })
    }

    /// Writes one sample in [-1, 1]; out of range values are clipped.
    pub fn write_sample(&mut self, sample: f32) -> io::Result<()> {
        let value = (sample.clamp(-1.0, 1.0) * self.scale).round() as i32;
        let bytes = value.to_be_bytes();
        let encoded = match self.bits_per_sample {
            8 => &bytes[3..],
            16 => &bytes[2..],
            24 => &bytes[1..],
            _ => &bytes[..],
        };
        self.writer.write_all(encoded)?;
        self.data_bytes += encoded.len() as u64;
        Ok(())
    }

    /// Pads the sound data and fills in the chunk sizes and frame count.
    pub fn finalize(mut self) -> io::Result<()> {
        if self.data_bytes % 2 == 1 {
            self.writer.write_all(&[0])?;
        }
        let padded = self.data_bytes + self.data_bytes % 2;
        let frames = self.data_bytes / (self.channels as u64 * (self.bits_per_sample / 8) as u64);

        let form_size = to_u32(HEADER_LEN - 8 + padded)?;
        let ssnd_size = to_u32(8 + self.data_bytes)?;
        self.patch(FORM_SIZE_OFFSET, form_size)?;
        self.patch(FRAME_COUNT_OFFSET, to_u32(frames)?)?;
        self.patch(SSND_SIZE_OFFSET, ssnd_size)?;
        self.writer.flush()
    }

    fn patch(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(&value.to_be_bytes())
    }
}

fn to_u32(value: u64) -> io::Result<u32> {
    u32::try_from(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AIFF data exceeds 4 GiB"))
}

/// Encodes a sample rate as an 80-bit IEEE 754 extended float.
fn extended(rate: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    if rate == 0 {
        return out;
    }
    let shift = (rate as u64).leading_zeros();
    let exponent = (16383 + 63 - shift) as u16;
    out[..2].copy_from_slice(&exponent.to_be_bytes());
    out[2..].copy_from_slice(&((rate as u64) << shift).to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_sample_rates() {
        assert_eq!(
            extended(44100),
            [0x40, 0x0e, 0xac, 0x44, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            extended(48000),
            [0x40, 0x0e, 0xbb, 0x80, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(extended(1), [0x3f, 0xff, 0x80, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(extended(0), [0; 10]);
    }

    #[test]
    fn test_header_and_samples() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.aiff");
        let mut writer = AiffWriter::create(&path, 2, 44100, 16)?;
        for sample in [0.5, -0.5, 1.0, -2.0] {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 62);
        assert_eq!(&bytes[0..4], b"FORM");
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into()?), 54);
        assert_eq!(&bytes[8..12], b"AIFF");
        assert_eq!(&bytes[12..16], b"COMM");
        assert_eq!(i16::from_be_bytes(bytes[20..22].try_into()?), 2);
        assert_eq!(u32::from_be_bytes(bytes[22..26].try_into()?), 2);
        assert_eq!(i16::from_be_bytes(bytes[26..28].try_into()?), 16);
        assert_eq!(&bytes[38..42], b"SSND");
        assert_eq!(u32::from_be_bytes(bytes[42..46].try_into()?), 16);

        let samples: Vec<i16> = bytes[54..]
            .chunks(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![16384, -16384, 32767, -32767]);
        Ok(())
    }

    #[test]
    fn test_odd_data_is_padded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("odd.aiff");
        let mut writer = AiffWriter::create(&path, 1, 8000, 8)?;
        for _ in 0..3 {
            writer.write_sample(0.25)?;
        }
        writer.finalize()?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 58);
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into()?), 50);
        assert_eq!(u32::from_be_bytes(bytes[42..46].try_into()?), 11);
        assert_eq!(bytes[54..57], [32, 32, 32]);
        assert_eq!(bytes[57], 0);
        Ok(())
    }

    #[test]
    fn test_unsupported_depth() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AiffWriter::create(&dir.path().join("x.aiff"), 1, 8000, 12).is_err());
    }
}
