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
use std::fmt;

use tokio::sync::watch;
use tracing::debug;

/// Global transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
        };
        write!(f, "{}", name)
    }
}

/// What a play request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayTransition {
    /// Stopped -> Playing.
    Started,
    /// Paused -> Playing.
    Resumed,
    /// Playing -> Paused. Play toggles while playing.
    Paused,
}

/// The transport state machine. It only tracks state and progress and
/// publishes both; the engine applies the matching voice and device effects.
pub struct Transport {
    state: watch::Sender<TransportState>,
    progress: watch::Sender<f64>,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

impl Transport {
    pub fn new() -> Transport {
        let (state, _) = watch::channel(TransportState::Stopped);
        let (progress, _) = watch::channel(0.0);
        Transport { state, progress }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Transport state changed");
        }
    }

    pub fn play(&mut self) -> PlayTransition {
        match self.state() {
            TransportState::Stopped => {
                self.set_state(TransportState::Playing);
                PlayTransition::Started
            }
            TransportState::Paused => {
                self.set_state(TransportState::Playing);
                PlayTransition::Resumed
            }
            TransportState::Playing => {
                self.set_state(TransportState::Paused);
                PlayTransition::Paused
            }
        }
    }

    /// Playing -> Paused. Returns false (and does nothing) in any other state.
    pub fn pause(&mut self) -> bool {
        if self.state() != TransportState::Playing {
            return false;
        }
        self.set_state(TransportState::Paused);
        true
    }

    /// Any state -> Stopped, progress 0. Returns the previous state.
    pub fn stop(&mut self) -> TransportState {
        let previous = self.state();
        self.set_state(TransportState::Stopped);
        self.progress.send_replace(0.0);
        previous
    }

    /// Publishes progress, clamped to [0, 1].
    pub fn set_progress(&mut self, progress: f64) {
        self.progress.send_replace(progress.clamp(0.0, 1.0));
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }
}

/// Fraction of the mix played: position / sample_rate / mix_length. Not
/// clamped, so callers can see the mix end being passed. 0 for an empty mix.
pub fn compute_progress(position_frames: u64, sample_rate: u32, mix_length: f64) -> f64 {
    if mix_length <= 0.0 || sample_rate == 0 {
        return 0.0;
    }
    position_frames as f64 / sample_rate as f64 / mix_length
}

/// Frame at which a fractional offset of the mix falls.
pub fn offset_to_frame(offset: f64, mix_length: f64, sample_rate: u32) -> u64 {
    let seconds = offset.clamp(0.0, 1.0) * mix_length.max(0.0);
    (seconds * sample_rate as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let transport = Transport::new();
        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(transport.progress(), 0.0);
    }

    #[test]
    fn test_play_toggles() {
        let mut transport = Transport::new();
        assert_eq!(transport.play(), PlayTransition::Started);
        assert_eq!(transport.play(), PlayTransition::Paused);
        assert_eq!(transport.state(), TransportState::Paused);
        assert_eq!(transport.play(), PlayTransition::Resumed);
        assert_eq!(transport.state(), TransportState::Playing);
    }

    #[test]
    fn test_pause_only_from_playing() {
        let mut transport = Transport::new();
        assert!(!transport.pause());
        assert_eq!(transport.state(), TransportState::Stopped);

        transport.play();
        assert!(transport.pause());
        assert!(!transport.pause());
        assert_eq!(transport.state(), TransportState::Paused);
    }

    #[test]
    fn test_stop_resets_progress() {
        let mut transport = Transport::new();
        transport.play();
        transport.set_progress(0.4);
        assert_eq!(transport.stop(), TransportState::Playing);
        assert_eq!(transport.progress(), 0.0);
        assert_eq!(transport.stop(), TransportState::Stopped);
    }

    #[test]
    fn test_subscribers_see_changes() {
        let mut transport = Transport::new();
        let mut state = transport.subscribe_state();
        let progress = transport.subscribe_progress();

        transport.play();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), TransportState::Playing);

        transport.set_progress(1.7);
        assert_eq!(*progress.borrow(), 1.0);
    }

    #[test]
    fn test_compute_progress() {
        assert_eq!(compute_progress(44100, 44100, 2.0), 0.5);
        assert_eq!(compute_progress(44100, 44100, 0.0), 0.0);
        assert!(compute_progress(88200, 44100, 1.0) >= 1.0);
    }

    #[test]
    fn test_offset_to_frame() {
        assert_eq!(offset_to_frame(0.5, 10.0, 44100), 220500);
        assert_eq!(offset_to_frame(2.0, 1.0, 100), 100);
        assert_eq!(offset_to_frame(0.5, 0.0, 44100), 0);
    }
}
