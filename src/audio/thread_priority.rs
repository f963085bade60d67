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

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Priority for the mix producer thread when TRACKBUS_THREAD_PRIORITY is unset.
const DEFAULT_MIX_THREAD_PRIORITY: u8 = 70;

/// Reads TRACKBUS_THREAD_PRIORITY (0-99). Read once per stream, never in the callback.
pub fn mix_thread_priority() -> ThreadPriority {
    std::env::var("TRACKBUS_THREAD_PRIORITY")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .filter(|n| *n < 100)
        .or(Some(DEFAULT_MIX_THREAD_PRIORITY))
        .and_then(|n| ThreadPriorityValue::try_from(n).ok())
        .map(ThreadPriority::Crossplatform)
        .unwrap_or(ThreadPriority::Max)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Whether to attempt SCHED_FIFO for the mix thread. Opt out with TRACKBUS_DISABLE_RT_AUDIO=1.
pub fn rt_audio_enabled() -> bool {
    !env_flag("TRACKBUS_DISABLE_RT_AUDIO")
}

/// Raises the calling thread's priority. Failures are logged and otherwise ignored.
pub fn promote_current_thread(priority: ThreadPriority, rt_audio: bool) {
    if let Err(e) = set_current_thread_priority(priority) {
        warn!(error = ?e, "Unable to raise mix thread priority");
    }

    #[cfg(unix)]
    if rt_audio {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        match set_thread_priority_and_policy(
            thread_native_id(),
            priority,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => info!("Enabled RT SCHED_FIFO for mix thread"),
            Err(e) => warn!(error = ?e, "Failed to set RT SCHED_FIFO for mix thread"),
        }
    }

    #[cfg(not(unix))]
    let _ = rt_audio;
}
