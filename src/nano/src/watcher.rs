//! Config file watcher: an event-loop timer polling the file's mtime.
//!
//! The watcher knows nothing about the registry; it holds only the reload
//! callback it was given. Edit-tool atomic replaces can race the stat, so a
//! failed stat silently re-arms.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use nano_runtime::LoopHandle;

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct PollState {
    last_mtime: Option<SystemTime>,
    last_change: Option<Instant>,
}

impl PollState {
    fn seeded(mtime: Option<SystemTime>) -> Self {
        Self {
            last_mtime: mtime,
            last_change: None,
        }
    }

    /// Reload only when the mtime differs from the last observed value and
    /// the debounce interval has elapsed since the prior change detection.
    fn observe(&mut self, mtime: SystemTime, now: Instant) -> bool {
        if self.last_mtime == Some(mtime) {
            return false;
        }
        if let Some(changed_at) = self.last_change {
            if now.duration_since(changed_at) < DEBOUNCE {
                return false;
            }
        }
        self.last_mtime = Some(mtime);
        self.last_change = Some(now);
        true
    }
}

/// Install the watcher timer. Returns the timer id (cancel to uninstall).
pub fn install(events: &LoopHandle, path: PathBuf, mut on_change: Box<dyn FnMut()>) -> u64 {
    let mut state = PollState::seeded(
        std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .ok(),
    );

    events.add_timer(
        POLL_INTERVAL,
        true,
        Box::new(move || {
            let mtime = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(mtime) => mtime,
                // Atomic-replace race or transiently missing file.
                Err(_) => return,
            };
            if state.observe(mtime, Instant::now()) {
                tracing::info!(path = %path.display(), "config change detected, reloading");
                on_change();
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtime(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn unchanged_mtime_never_reloads() {
        let mut state = PollState::seeded(Some(mtime(100)));
        let now = Instant::now();
        assert!(!state.observe(mtime(100), now));
        assert!(!state.observe(mtime(100), now + Duration::from_secs(60)));
    }

    #[test]
    fn changed_mtime_reloads_once() {
        let mut state = PollState::seeded(Some(mtime(100)));
        let now = Instant::now();
        assert!(state.observe(mtime(200), now));
        assert!(!state.observe(mtime(200), now + Duration::from_secs(60)));
    }

    #[test]
    fn changes_inside_the_debounce_window_are_suppressed() {
        let mut state = PollState::seeded(Some(mtime(100)));
        let now = Instant::now();
        assert!(state.observe(mtime(200), now));
        assert!(!state.observe(mtime(300), now + Duration::from_millis(100)));
        assert!(state.observe(mtime(300), now + Duration::from_secs(1)));
    }

    #[test]
    fn first_observation_with_no_seed_reloads() {
        let mut state = PollState::default();
        assert!(state.observe(mtime(100), Instant::now()));
    }
}
