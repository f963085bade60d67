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

//! Track loading and caching.
//!
//! Tracks are decoded entirely into memory and resampled to the bus rate, so
//! scheduling and seeking never touch the disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::audio::mixer::ScheduledAudio;
use crate::audio::sample_source::{
    create_sample_source_from_file, AudioTranscoder, SampleSource, SampleSourceError,
};

/// A decoded track, shared between every voice that schedules it.
#[derive(Clone)]
pub struct LoadedTrack {
    /// Interleaved samples at the bus rate.
    data: Arc<Vec<f32>>,
    channel_count: u16,
    sample_rate: u32,
    /// Duration of the source file in seconds.
    duration: f64,
}

impl LoadedTrack {
    /// Schedules this audio at the given frame of a voice's timeline.
    pub fn scheduled_at(&self, start_frame: u64) -> ScheduledAudio {
        ScheduledAudio {
            data: self.data.clone(),
            channels: self.channel_count,
            start_frame,
        }
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration of the source file in seconds.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Frames of decoded audio at the bus rate.
    pub fn frames(&self) -> usize {
        if self.channel_count == 0 {
            return 0;
        }
        self.data.len() / self.channel_count as usize
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Loads and caches decoded tracks. Safe to share across loader threads.
pub struct TrackLoader {
    cache: RwLock<HashMap<PathBuf, LoadedTrack>>,
    /// Bus sample rate every track is resampled to.
    target_sample_rate: u32,
}

impl TrackLoader {
    pub fn new(target_sample_rate: u32) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            target_sample_rate,
        }
    }

    /// Loads a track into memory, returning the cached copy when present.
    pub fn load(&self, path: &Path) -> Result<LoadedTrack, SampleSourceError> {
        if let Some(track) = self.cache.read().get(path) {
            debug!(path = ?path, "Using cached track");
            return Ok(track.clone());
        }

        info!(path = ?path, "Loading track into memory");
        let source = create_sample_source_from_file(path)?;
        let source_rate = source.sample_rate();
        let channel_count = source.channel_count();
        let reported = source.duration();

        let mut transcoder = AudioTranscoder::new(source, self.target_sample_rate)?;
        if transcoder.is_resampling() {
            info!(
                source_rate,
                target_rate = self.target_sample_rate,
                "Transcoding track"
            );
        }
        let data = transcoder.read_interleaved()?;

        // Prefer the container's frame count. Fall back to what was decoded.
        let duration = match reported {
            Some(duration) => duration.as_secs_f64(),
            None => {
                data.len() as f64
                    / channel_count.max(1) as f64
                    / self.target_sample_rate as f64
            }
        };

        let loaded = LoadedTrack {
            data: Arc::new(data),
            channel_count,
            sample_rate: self.target_sample_rate,
            duration,
        };
        info!(
            path = ?path,
            channels = channel_count,
            duration_secs = duration,
            memory_kb = loaded.memory_size() / 1024,
            "Track loaded"
        );

        self.cache
            .write()
            .insert(path.to_path_buf(), loaded.clone());
        Ok(loaded)
    }

    /// Drops a cached track so the next load decodes the file again.
    pub fn evict(&self, path: &Path) -> bool {
        self.cache.write().remove(path).is_some()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Returns the total memory used by cached tracks.
    pub fn total_memory_usage(&self) -> usize {
        self.cache.read().values().map(|t| t.memory_size()).sum()
    }
}

impl std::fmt::Debug for TrackLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackLoader")
            .field("cached_tracks", &self.cached_count())
            .field("target_sample_rate", &self.target_sample_rate)
            .finish()
    }
}
