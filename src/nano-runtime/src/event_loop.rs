//! The cooperative event loop shared by every app in the process.
//!
//! One loop drives three source kinds: delay-based timers (which back the
//! JavaScript timer globals and the config watcher), and completions of
//! fetch operations posted by worker threads. All callbacks run on the
//! engine-driving thread; worker threads only ever touch the completion
//! queue, which is the single piece of cross-thread state (a mutex-guarded
//! vector plus an atomic in-flight counter).
//!
//! Timer callbacks are boxed closures. A closure owns whatever persistent
//! engine handles it captured, so the handle release paths are exactly the
//! drop paths of the closure: cancellation, or the final fire of a one-shot.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Upper bound on a single blocking wait, so the loop stays responsive to
/// work posted from other sources while `run_once` is parked.
const MAX_PARK: Duration = Duration::from_millis(50);

/// The outcome of a fetch performed on a worker thread, keyed back to the
/// promise resolver that is waiting for it.
#[derive(Debug)]
pub struct CompletedFetch {
    pub resolver_id: u64,
    pub result: Result<FetchResponse, String>,
}

/// The wire-level result of an outbound HTTP request.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Cross-thread half of the loop. Worker threads hold an `Arc` to this and
/// nothing else.
pub struct FetchQueue {
    completed: Mutex<Vec<CompletedFetch>>,
    in_flight: AtomicUsize,
    wakeup: Condvar,
}

impl FetchQueue {
    fn new() -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            wakeup: Condvar::new(),
        }
    }

    /// Record that a fetch has been handed to a worker thread.
    pub fn register(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Called from a worker thread once its request has finished (or failed).
    pub fn post(&self, completion: CompletedFetch) {
        let mut completed = match self.completed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        completed.push(completion);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.wakeup.notify_all();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct Timer {
    id: u64,
    deadline: Instant,
    interval: Option<Duration>,
    active: bool,
    // Taken out while the callback runs, so cancellation from inside the
    // callback is observable when deciding whether to re-arm.
    callback: Option<Box<dyn FnMut()>>,
}

pub struct EventLoop {
    timers: RefCell<Vec<Timer>>,
    next_timer_id: Cell<u64>,
    fetches: Arc<FetchQueue>,
}

/// Cloneable main-thread handle to the loop.
#[derive(Clone)]
pub struct LoopHandle(Rc<EventLoop>);

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    pub fn new() -> Self {
        Self(Rc::new(EventLoop {
            timers: RefCell::new(Vec::new()),
            next_timer_id: Cell::new(1),
            fetches: Arc::new(FetchQueue::new()),
        }))
    }

    /// Arm a timer. Returns a stable id, monotonically increasing from 1.
    /// `interval` timers are re-armed with a fresh absolute deadline after
    /// each fire, so a slow callback never causes a catch-up burst.
    pub fn add_timer(
        &self,
        delay: Duration,
        interval: bool,
        callback: Box<dyn FnMut()>,
    ) -> u64 {
        let id = self.0.next_timer_id.get();
        self.0.next_timer_id.set(id + 1);
        self.0.timers.borrow_mut().push(Timer {
            id,
            deadline: Instant::now() + delay,
            interval: interval.then_some(delay),
            active: true,
            callback: Some(callback),
        });
        id
    }

    /// Cancel a timer. Returns whether a live timer with that id existed.
    /// The callback (and any persistent handles it owns) is dropped here,
    /// or after the in-progress fire returns if cancelled mid-callback.
    pub fn cancel_timer(&self, id: u64) -> bool {
        let mut timers = self.0.timers.borrow_mut();
        let Some(pos) = timers.iter().position(|t| t.id == id && t.active) else {
            return false;
        };
        if timers[pos].callback.is_some() {
            timers.remove(pos);
        } else {
            // The callback is mid-fire; the tick that took it out decides
            // its fate once it returns.
            timers[pos].active = false;
        }
        true
    }

    /// True if any timer is armed or any fetch is in flight.
    pub fn has_pending_work(&self) -> bool {
        self.0.fetches.in_flight() > 0
            || self.0.timers.borrow().iter().any(|t| t.active)
            || !self
                .0
                .fetches
                .completed
                .lock()
                .map(|q| q.is_empty())
                .unwrap_or(true)
    }

    /// Run one non-blocking iteration: fire every due timer, in creation
    /// order for equal deadlines.
    pub fn tick(&self) {
        let now = Instant::now();
        loop {
            // Pull out exactly one due callback at a time; firing it may
            // add or cancel timers, so the borrow cannot be held across
            // the call.
            let due = {
                let mut timers = self.0.timers.borrow_mut();
                let idx = timers
                    .iter()
                    .position(|t| t.active && t.callback.is_some() && t.deadline <= now);
                match idx {
                    Some(idx) => {
                        let timer = &mut timers[idx];
                        Some((idx, timer.id, timer.callback.take()))
                    }
                    None => None,
                }
            };

            let Some((_, id, Some(mut callback))) = due else {
                break;
            };

            callback();

            let mut timers = self.0.timers.borrow_mut();
            let Some(pos) = timers.iter().position(|t| t.id == id) else {
                continue;
            };
            let timer = &mut timers[pos];
            match (timer.active, timer.interval) {
                (true, Some(period)) => {
                    timer.deadline = Instant::now() + period;
                    timer.callback = Some(callback);
                }
                // One-shot fired, or cancelled from inside its own
                // callback: release it (dropping `callback`).
                _ => {
                    timers.remove(pos);
                }
            }
        }

        // Cancelled timers that never got a chance to fire.
        self.0.timers.borrow_mut().retain(|t| t.active);
    }

    /// Block until at least one event is ready (or `limit`/an internal cap
    /// expires), then run one iteration.
    pub fn run_once(&self, limit: Option<Duration>) {
        let now = Instant::now();
        let until_timer = self
            .0
            .timers
            .borrow()
            .iter()
            .filter(|t| t.active)
            .map(|t| t.deadline.saturating_duration_since(now))
            .min();

        let mut wait = until_timer.unwrap_or(MAX_PARK).min(MAX_PARK);
        if let Some(limit) = limit {
            wait = wait.min(limit);
        }

        if !wait.is_zero() {
            let guard = match self.0.fetches.completed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.is_empty() {
                let _ = self.0.fetches.wakeup.wait_timeout(guard, wait);
            }
        }

        self.tick();
    }

    /// Move every posted fetch completion out of the queue. Main thread
    /// only; dispatching them back into their isolates is the caller's job.
    pub fn drain_fetch_completions(&self) -> Vec<CompletedFetch> {
        let mut completed = match self.0.fetches.completed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *completed)
    }

    /// The `Arc` handed to fetch worker threads.
    pub fn fetch_queue(&self) -> Arc<FetchQueue> {
        Arc::clone(&self.0.fetches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timer_ids_are_monotonic_from_one() {
        let events = LoopHandle::new();
        let a = events.add_timer(Duration::from_millis(1), false, Box::new(|| {}));
        let b = events.add_timer(Duration::from_millis(1), false, Box::new(|| {}));
        let c = events.add_timer(Duration::from_millis(1), true, Box::new(|| {}));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(c, 3);
    }

    #[test]
    fn equal_deadlines_fire_in_creation_order() {
        let events = LoopHandle::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let fired = fired.clone();
            events.add_timer(
                Duration::ZERO,
                false,
                Box::new(move || fired.borrow_mut().push(label)),
            );
        }
        events.tick();
        assert_eq!(*fired.borrow(), vec!["first", "second", "third"]);
        assert!(!events.has_pending_work());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let events = LoopHandle::new();
        let fired = Rc::new(Cell::new(false));
        let id = {
            let fired = fired.clone();
            events.add_timer(Duration::ZERO, false, Box::new(move || fired.set(true)))
        };
        assert!(events.cancel_timer(id));
        assert!(!events.cancel_timer(id));
        events.tick();
        assert!(!fired.get());
    }

    #[test]
    fn interval_rearms_until_cancelled() {
        let events = LoopHandle::new();
        let count = Rc::new(Cell::new(0u32));
        let id = {
            let count = count.clone();
            events.add_timer(
                Duration::ZERO,
                true,
                Box::new(move || count.set(count.get() + 1)),
            )
        };
        events.tick();
        assert_eq!(count.get(), 1);
        std::thread::sleep(Duration::from_millis(2));
        events.tick();
        assert_eq!(count.get(), 2);
        assert!(events.cancel_timer(id));
        events.tick();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn interval_cancelled_mid_callback_is_not_rearmed() {
        let events = LoopHandle::new();
        let count = Rc::new(Cell::new(0u32));
        let id_slot = Rc::new(Cell::new(0u64));
        let id = {
            let events = events.clone();
            let count = count.clone();
            let id_slot = id_slot.clone();
            events.clone().add_timer(
                Duration::ZERO,
                true,
                Box::new(move || {
                    count.set(count.get() + 1);
                    events.cancel_timer(id_slot.get());
                }),
            )
        };
        id_slot.set(id);
        events.tick();
        std::thread::sleep(Duration::from_millis(2));
        events.tick();
        assert_eq!(count.get(), 1);
        assert!(!events.has_pending_work());
    }

    #[test]
    fn fetch_completions_cross_threads() {
        let events = LoopHandle::new();
        let queue = events.fetch_queue();
        queue.register();
        assert!(events.has_pending_work());

        let worker = std::thread::spawn(move || {
            queue.post(CompletedFetch {
                resolver_id: 7,
                result: Err("connection refused".into()),
            });
        });
        worker.join().unwrap();

        let drained = events.drain_fetch_completions();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].resolver_id, 7);
        assert!(!events.has_pending_work());
    }
}
