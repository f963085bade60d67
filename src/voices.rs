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

//! Playback voices for file-backed tracks.
//!
//! This module provides:
//! - Track loading and caching (decoded fully into memory at the bus rate)
//! - The voice pool, binding tracks to reusable mixer inputs

mod loader;
mod pool;

pub use loader::{LoadedTrack, TrackLoader};
pub use pool::{LegacyBinding, VoiceId, VoiceMix, VoicePool, VoiceState};
