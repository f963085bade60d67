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
use std::time::Duration;

use crate::audio::DeviceError;
use crate::config::ConfigError;

/// Errors surfaced by the mix engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A file could not be opened, created, decoded or queried.
    #[error("{resource} unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// The device refused to start after every attempt.
    #[error("unable to start the audio graph: {0}")]
    GraphStart(DeviceError),

    /// Capture and bounce are exclusive.
    #[error("a {0} session is already active")]
    SessionActive(&'static str),

    #[error("offline render failed with status {}", render_status(.status))]
    RenderFailed { status: i32 },

    #[error("offline render stalled ({stalls} consecutive stalls, {waited:?} without progress)")]
    RenderStalled { stalls: u32, waited: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn render_status(status: &i32) -> String {
    crate::diagnostics::status_tag(*status)
}

impl EngineError {
    pub(crate) fn unavailable(resource: impl Into<String>, reason: impl ToString) -> EngineError {
        EngineError::ResourceUnavailable {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}
