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
    collections::HashMap,
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;

/// Stable identity of a track across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackToken(Uuid);

impl TrackToken {
    pub fn new() -> TrackToken {
        TrackToken(Uuid::new_v4())
    }
}

impl Default for TrackToken {
    fn default() -> Self {
        TrackToken::new()
    }
}

impl fmt::Display for TrackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file-backed track submitted to the mix.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    file: String,
    start_offset: Option<f64>,
    token: Option<TrackToken>,
}

impl Track {
    /// A tokenized track with a fresh token.
    pub fn new(file: &str) -> Track {
        Track {
            file: file.to_string(),
            start_offset: None,
            token: Some(TrackToken::new()),
        }
    }

    /// A track without a token. Its voice can only be addressed by file and
    /// start frame.
    pub fn legacy(file: &str) -> Track {
        Track {
            file: file.to_string(),
            start_offset: None,
            token: None,
        }
    }

    /// Sets the start offset as a fraction of the mix length. Values are
    /// clamped to [0, 1]; NaN clears the offset.
    pub fn with_offset(mut self, offset: f64) -> Track {
        self.start_offset = if offset.is_nan() {
            None
        } else {
            Some(offset.clamp(0.0, 1.0))
        };
        self
    }

    pub fn with_token(mut self, token: TrackToken) -> Track {
        self.token = Some(token);
        self
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn start_offset(&self) -> Option<f64> {
        self.start_offset
    }

    pub fn token(&self) -> Option<TrackToken> {
        self.token
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(offset) = self.start_offset {
            write!(f, "@{}", offset)?;
        }
        Ok(())
    }
}

/// Parses `file` or `file@offset` into a tokenized track.
impl FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((file, offset)) if !file.is_empty() => {
                let offset = offset
                    .parse::<f64>()
                    .map_err(|e| format!("invalid offset in {}: {}", s, e))?;
                Ok(Track::new(file).with_offset(offset))
            }
            _ if s.is_empty() => Err("empty track".to_string()),
            _ => Ok(Track::new(s)),
        }
    }
}

/// The outcome of a batch load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Tracks that were loaded and scheduled.
    pub loaded: Vec<Track>,
    /// Tracks that failed, with the reason.
    pub failed: Vec<(Track, EngineError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Resolves track files under the storage root and remembers decoded
/// durations and the tracks currently in the mix.
pub struct TrackRegistry {
    root: PathBuf,
    durations: HashMap<String, f64>,
    tracks: Vec<Track>,
}

impl TrackRegistry {
    pub fn new<P: Into<PathBuf>>(root: P) -> TrackRegistry {
        TrackRegistry {
            root: root.into(),
            durations: HashMap::new(),
            tracks: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a track's file against the storage root. Absolute paths and
    /// parent components are rejected, and the file must exist.
    pub fn resolve(&self, track: &Track) -> Result<PathBuf, EngineError> {
        let relative = Path::new(track.file());
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if track.file().is_empty() || escapes {
            return Err(EngineError::unavailable(
                track.file(),
                "track files must be relative to the storage root",
            ));
        }

        let path = self.root.join(relative);
        if !path.is_file() {
            return Err(EngineError::unavailable(
                path.display().to_string(),
                "no such file",
            ));
        }
        Ok(path)
    }

    /// Records the decoded duration of a file, in seconds.
    pub fn record_duration(&mut self, file: &str, seconds: f64) {
        debug!(file, seconds, "Recorded track duration");
        self.durations.insert(file.to_string(), seconds.max(0.0));
    }

    /// Duration of a file in seconds, 0 when unknown.
    pub fn duration(&self, file: &str) -> f64 {
        self.try_duration(file).unwrap_or(0.0)
    }

    pub fn duration_of(&self, track: &Track) -> f64 {
        self.duration(track.file())
    }

    pub fn try_duration(&self, file: &str) -> Option<f64> {
        self.durations.get(file).copied()
    }

    /// Drops a recorded duration. Removing a track never does this on its own.
    pub fn forget_duration(&mut self, file: &str) -> Option<f64> {
        self.durations.remove(file)
    }

    /// The longest recorded duration in seconds, 0 when empty. Start offsets
    /// are not taken into account, so a late-starting track can run past it.
    pub fn mix_length(&self) -> f64 {
        self.durations.values().copied().fold(0.0, f64::max)
    }

    /// Adds a track to the mix. A tokenized track replaces any earlier track
    /// with the same token.
    pub fn register(&mut self, track: Track) {
        if let Some(token) = track.token() {
            if let Some(existing) = self.tracks.iter_mut().find(|t| t.token() == Some(token)) {
                *existing = track;
                return;
            }
        }
        self.tracks.push(track);
    }

    /// Removes the tokenized track from the mix. Its duration stays recorded.
    pub fn unregister(&mut self, token: TrackToken) -> Option<Track> {
        let index = self.tracks.iter().position(|t| t.token() == Some(token))?;
        Some(self.tracks.remove(index))
    }

    /// Removes every track without a token.
    pub fn unregister_legacy(&mut self) {
        self.tracks.retain(|t| t.token().is_some());
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
