//! Background timers.
//!
//! [`TimerService`] runs callbacks on its own thread at a deadline, once or
//! periodically. The server uses it to kill CGI processes that overrun
//! `cgi_timeout_ms`; embedding applications may schedule their own jobs.
//!
//! Entries live in a min-heap ordered by deadline. Cancellation is lazy: the
//! callback is dropped immediately and the stale heap entry is skipped when
//! it surfaces.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::sync::{lock, wait, wait_timeout};

/// Handle returned by [`TimerService::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback = Box<dyn FnMut() + Send>;

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Timer {
    callback: Callback,
    period: Option<Duration>,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<HeapEntry>,
    timers: HashMap<TimerId, Timer>,
    next_id: u64,
    running: Option<TimerId>,
    running_cancelled: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// A single-threaded timer wheel.
///
/// ```
/// use std::sync::mpsc;
/// use std::time::Duration;
/// use wharf::background::TimerService;
///
/// let timers = TimerService::start();
/// let (tx, rx) = mpsc::channel();
/// timers.add(Duration::from_millis(10), None, move || {
///     let _ = tx.send("fired");
/// });
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("fired"));
/// timers.stop();
/// ```
pub struct TimerService {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Spawns the timer thread.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("wharf-timer".into())
            .spawn(move || run(&worker));
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn timer thread");
                None
            }
        };
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Schedules `callback` after `delay`, then every `period` if given.
    pub fn add<F>(&self, delay: Duration, period: Option<Duration>, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;
        state.timers.insert(
            id,
            Timer {
                callback: Box::new(callback),
                period,
            },
        );
        state.heap.push(HeapEntry {
            deadline: Instant::now() + delay,
            id,
        });
        drop(state);
        self.shared.wakeup.notify_one();
        id
    }

    /// Cancels a timer. Returns `false` if it already fired (one-shot) or
    /// was cancelled before. A callback that is running right now finishes,
    /// but a periodic timer will not be rescheduled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = lock(&self.shared.state);
        if state.timers.remove(&id).is_some() {
            return true;
        }
        if state.running == Some(id) && !state.running_cancelled {
            state.running_cancelled = true;
            return true;
        }
        false
    }

    /// Number of timers still scheduled.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).timers.len()
    }

    /// Stops the thread and drops every pending callback. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.stopped = true;
            state.timers.clear();
            state.heap.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = lock(&self.thread).take() {
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared) {
    let mut state = lock(&shared.state);
    loop {
        if state.stopped {
            break;
        }
        let Some(deadline) = state.heap.peek().map(|next| next.deadline) else {
            state = wait(&shared.wakeup, state);
            continue;
        };
        let now = Instant::now();
        if deadline > now {
            state = wait_timeout(&shared.wakeup, state, deadline - now);
            continue;
        }

        let Some(entry) = state.heap.pop() else {
            continue;
        };
        let Some(mut timer) = state.timers.remove(&entry.id) else {
            // Cancelled while queued.
            continue;
        };
        state.running = Some(entry.id);
        state.running_cancelled = false;
        drop(state);

        if catch_unwind(AssertUnwindSafe(|| (timer.callback)())).is_err() {
            error!(timer = entry.id.0, "timer callback panicked");
        }

        state = lock(&shared.state);
        state.running = None;
        if let Some(period) = timer.period {
            if !state.running_cancelled && !state.stopped {
                state.heap.push(HeapEntry {
                    deadline: entry.deadline + period,
                    id: entry.id,
                });
                state.timers.insert(entry.id, timer);
            }
        }
    }
    debug!("timer thread exiting");
}
