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

//! A multitrack mixing and transport engine: file-backed tracks on a pool of
//! voices, live playback through an audio device, input capture and offline
//! bounce of the whole mix.

pub mod audio;
pub mod bounce;
pub mod capture;
pub mod config;
pub mod convert;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod playsync;
pub mod tracks;
pub mod transport;
pub mod util;
pub mod voices;

#[cfg(test)]
pub mod testutil;

pub use engine::MixEngine;
pub use error::EngineError;
pub use tracks::{LoadReport, Track, TrackToken};
pub use transport::TransportState;
