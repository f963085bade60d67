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
    any::TypeId,
    error::Error,
    fs::File,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use hound::{SampleFormat, WavSpec, WavWriter};

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(3);

    loop {
        if start.elapsed() > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
    }
}

/// Writes planar channel data to an interleaved WAV file. `f32` samples are
/// written as 32-bit float, `i32` as 32-bit int and `i16` as 16-bit int.
pub fn write_wav<P, S>(path: P, channels: Vec<Vec<S>>, sample_rate: u32) -> Result<(), Box<dyn Error>>
where
    P: AsRef<Path>,
    S: hound::Sample + Copy + 'static,
{
    let (sample_format, bits_per_sample) = if TypeId::of::<S>() == TypeId::of::<f32>() {
        (SampleFormat::Float, 32)
    } else if TypeId::of::<S>() == TypeId::of::<i32>() {
        (SampleFormat::Int, 32)
    } else if TypeId::of::<S>() == TypeId::of::<i16>() {
        (SampleFormat::Int, 16)
    } else {
        return Err("Unsupported sample format".into());
    };

    let num_channels = channels.len();
    assert!(num_channels <= u16::MAX.into(), "Too many channels!");
    let frames = channels.iter().map(|c| c.len()).max().unwrap_or(0);
    let mut writer = WavWriter::new(
        File::create(path)?,
        WavSpec {
            channels: num_channels as u16,
            sample_rate,
            bits_per_sample,
            sample_format,
        },
    )?;

    for frame in 0..frames {
        for channel in &channels {
            writer.write_sample(channel[frame])?;
        }
    }
    writer.finalize()?;

    Ok(())
}

/// Writes a constant-valued float WAV of the given length.
pub fn write_constant_wav<P: AsRef<Path>>(
    path: P,
    value: f32,
    channels: u16,
    frames: usize,
    sample_rate: u32,
) -> Result<(), Box<dyn Error>> {
    write_wav(
        path,
        vec![vec![value; frames]; channels as usize],
        sample_rate,
    )
}

/// Reads every sample of a float WAV, returning the spec alongside.
pub fn read_float_wav<P: AsRef<Path>>(path: P) -> Result<(WavSpec, Vec<f32>), Box<dyn Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let samples = reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?;
    Ok((spec, samples))
}
