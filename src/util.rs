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
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;

pub type WavFileWriter = hound::WavWriter<BufWriter<File>>;

/// Extracts a displayable file name from a path, returning a fallback if the name is unreadable.
pub fn filename_display(path: &Path) -> &str {
    path.file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("unreadable file name")
}

/// Outputs the given duration in a minutes:seconds format.
pub fn duration_minutes_seconds(duration: Duration) -> String {
    let minutes = duration.as_secs() / 60;
    let secs = duration.as_secs() - minutes * 60;
    format!("{}:{:02}", minutes, secs)
}

/// A fresh `<uuid>.wav` path under the root.
pub fn generated_wav_path(root: &Path) -> PathBuf {
    root.join(format!("{}.wav", Uuid::new_v4()))
}

/// Creates (or overwrites) a WAV file, retrying failed attempts after `delay`.
pub fn create_wav(
    path: &Path,
    spec: hound::WavSpec,
    attempts: u32,
    delay: Duration,
) -> Result<WavFileWriter, EngineError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match hound::WavWriter::create(path, spec) {
            Ok(writer) => return Ok(writer),
            Err(e) if attempt >= attempts => {
                return Err(EngineError::unavailable(path.display().to_string(), e));
            }
            Err(e) => {
                warn!(path = ?path, attempt, err = %e, "Unable to create file, retrying");
                attempt += 1;
                thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_duration_minutes_strings() {
        assert_eq!("0:00", duration_minutes_seconds(Duration::new(0, 0)));
        assert_eq!("0:05", duration_minutes_seconds(Duration::new(5, 0)));
        assert_eq!("1:00", duration_minutes_seconds(Duration::new(60, 0)));
        assert_eq!("60:06", duration_minutes_seconds(Duration::new(3606, 0)));
    }

    #[test]
    fn test_generated_paths_are_unique_wavs() {
        let a = generated_wav_path(Path::new("/tmp"));
        let b = generated_wav_path(Path::new("/tmp"));
        assert_ne!(a, b);
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("wav"));
        assert_eq!(filename_display(&a).len(), 36 + 4);
    }

    #[test]
    fn test_create_wav_fails_after_attempts() {
        let spec = crate::audio::StreamFormat::new(44100, 2).wav_spec();
        let result = create_wav(
            Path::new("/nonexistent/dir/out.wav"),
            spec,
            2,
            Duration::from_millis(1),
        );
        assert!(matches!(
            result,
            Err(EngineError::ResourceUnavailable { .. })
        ));
    }
}
