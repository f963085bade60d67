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
use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

/// Represents the current cancel state.
#[derive(PartialEq)]
enum CancelState {
    Untouched,
    Cancelled,
}

/// A cancel handle is passed into long running engine operations such as a
/// bounce. The operation checks it between units of work.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<Mutex<CancelState>>,
    condvar: Arc<Condvar>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl CancelHandle {
    /// Creates a new cancel handle.
    pub fn new() -> CancelHandle {
        CancelHandle {
            cancelled: Arc::new(Mutex::new(CancelState::Untouched)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Returns true if the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock() == CancelState::Cancelled
    }

    /// Sleeps for up to `timeout`, waking early on cancel. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.cancelled.lock();
        if *state == CancelState::Untouched {
            self.condvar.wait_for(&mut state, timeout);
        }
        *state == CancelState::Cancelled
    }

    /// Cancels the operation.
    pub fn cancel(&self) {
        let mut cancel_state = self.cancelled.lock();
        if *cancel_state == CancelState::Untouched {
            *cancel_state = CancelState::Cancelled;
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn test_cancel_wakes_waiter() {
        let cancel_handle = CancelHandle::new();
        assert!(!cancel_handle.is_cancelled());

        let join = {
            let cancel_handle = cancel_handle.clone();
            thread::spawn(move || cancel_handle.wait_timeout(Duration::from_secs(30)))
        };

        let start = Instant::now();
        cancel_handle.cancel();
        assert!(join.join().unwrap());
        assert!(cancel_handle.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn test_wait_times_out_untouched() {
        let cancel_handle = CancelHandle::new();
        assert!(!cancel_handle.wait_timeout(Duration::from_millis(5)));
        assert!(!cancel_handle.is_cancelled());
    }

    #[test]
    fn test_cancelled_returns_immediately() {
        let cancel_handle = CancelHandle::default();
        cancel_handle.cancel();
        cancel_handle.cancel();
        assert!(cancel_handle.wait_timeout(Duration::from_secs(30)));
    }
}
