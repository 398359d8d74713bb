//! CPU watchdog for a single handler invocation.
//!
//! A companion thread sleeps in small increments up to the app's budget,
//! checking a shared stop flag on each increment. If the budget elapses it
//! raises the app's terminate flag, which the engine's interrupt handler
//! observes on its next check and unwinds the running script. Stopping the
//! watchdog also clears the terminate flag, so a termination raised just as
//! the handler finished cannot poison the next request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct Watchdog {
    stop: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawn the watchdog armed for `budget`. `terminate` is the flag read
    /// by the engine's interrupt handler.
    pub fn arm(terminate: Arc<AtomicBool>, budget: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            let terminate = Arc::clone(&terminate);
            std::thread::spawn(move || {
                let deadline = Instant::now() + budget;
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(
                            budget_ms = budget.as_millis() as u64,
                            "execution budget exceeded, requesting termination"
                        );
                        terminate.store(true, Ordering::SeqCst);
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
            })
        };
        Self {
            stop,
            terminate,
            thread: Some(thread),
        }
    }

    /// Whether the watchdog requested termination.
    pub fn fired(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Stop the watchdog and cancel any termination still in flight.
    pub fn disarm(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // A terminate raised between the handler finishing and this point
        // must not leak into the next run.
        self.terminate.swap(false, Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarm_before_budget_never_fires() {
        let terminate = Arc::new(AtomicBool::new(false));
        let dog = Watchdog::arm(Arc::clone(&terminate), Duration::from_secs(5));
        assert!(!dog.fired());
        assert!(!dog.disarm());
        assert!(!terminate.load(Ordering::SeqCst));
    }

    #[test]
    fn fires_after_budget_and_disarm_clears_the_flag() {
        let terminate = Arc::new(AtomicBool::new(false));
        let dog = Watchdog::arm(Arc::clone(&terminate), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(dog.fired());
        assert!(dog.disarm(), "disarm should report the fired termination");
        assert!(
            !terminate.load(Ordering::SeqCst),
            "terminate flag must be cancelled after disarm"
        );
    }
}
