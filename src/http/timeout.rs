//! Deadlines, cancellation and the timer service
//!
//! Synchronous code enforces time limits by passing a [`Deadline`] down to
//! every blocking poll. Asynchronous sends additionally register with the
//! client's [`TimerService`], which completes the caller's future when the
//! request timeout fires, and trips the request's [`CancelToken`] so the
//! worker stops too.

use super::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Optional absolute point in time after which an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No time limit
    pub fn none() -> Self {
        Deadline { at: None }
    }

    /// Deadline `timeout` from now, if given
    pub fn after(timeout: Option<Duration>) -> Self {
        Deadline {
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Deadline { at: Some(instant) }
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left, zero once expired; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail with a request timeout once expired
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(Error::RequestTimeout)
        } else {
            Ok(())
        }
    }

    /// The earlier of two deadlines
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline { at: Some(a.min(b)) },
            (a, b) => Deadline { at: a.or(b) },
        }
    }
}

/// Bounds for establishing one connection
///
/// The connect timeout and the request deadline run independently; which
/// one expires decides between a connect timeout and a request timeout.
#[derive(Debug, Clone, Copy)]
pub struct ConnectBudget {
    pub connect: Deadline,
    pub request: Deadline,
}

impl ConnectBudget {
    pub fn new(connect_timeout: Option<Duration>, request: Deadline) -> Self {
        ConnectBudget {
            connect: Deadline::after(connect_timeout),
            request,
        }
    }

    /// Effective deadline for the connect phase
    pub fn effective(&self) -> Deadline {
        self.connect.min(self.request)
    }

    /// Classify a timeout during connection establishment
    ///
    /// `cause` is the connection-level failure, kept as the source of a
    /// connect timeout.
    pub fn timeout_error(&self, cause: Error) -> Error {
        let request_first = match (self.connect.instant(), self.request.instant()) {
            (Some(c), Some(r)) => r < c,
            (None, Some(_)) => true,
            _ => false,
        };
        if request_first && self.request.is_expired() {
            Error::RequestTimeout
        } else {
            Error::ConnectTimeout {
                source: Box::new(cause),
            }
        }
    }
}

type CancelTask = Box<dyn FnOnce() + Send>;

struct CancelState {
    hooks: HashMap<u64, CancelTask>,
    next_id: u64,
    /// Dropped on cancellation, which disconnects every `signal` receiver
    trigger: Option<Sender<()>>,
}

struct CancelShared {
    /// Readable without the lock, so waiters may check it under their own locks
    cancelled: AtomicBool,
    state: Mutex<CancelState>,
    signal: Receiver<()>,
}

/// Cancellation flag shared by a request and whoever may abort it
///
/// Blocking code either polls [`check`](CancelToken::check), selects on
/// [`signal`](CancelToken::signal), or registers a hook that unblocks it
/// (shutting a socket down, waking a condition variable). Hooks run with
/// the token locked: once a [`CancelHook`] is dropped its hook never runs.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

/// Registration returned by [`CancelToken::on_cancel`]
#[must_use = "the hook is removed when this is dropped"]
pub struct CancelHook {
    shared: Arc<CancelShared>,
    id: Option<u64>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        CancelToken {
            shared: Arc::new(CancelShared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(CancelState {
                    hooks: HashMap::new(),
                    next_id: 0,
                    trigger: Some(trigger),
                }),
                signal,
            }),
        }
    }

    /// Trip the token and run every registered hook; true the first time
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        state.trigger = None;
        let mut hooks: Vec<(u64, CancelTask)> = state.hooks.drain().collect();
        hooks.sort_unstable_by_key(|(id, _)| *id);
        for (_, hook) in hooks {
            hook();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with a cancellation error once tripped
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receiver that becomes disconnected when the token trips
    ///
    /// Nothing is ever sent on it, so a `recv` arm in `select!` fires only
    /// on cancellation.
    pub fn signal(&self) -> &Receiver<()> {
        &self.shared.signal
    }

    /// Run `hook` on cancellation, or right away if already cancelled
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        let mut state = self.shared.state.lock();
        if self.is_cancelled() {
            hook();
            return CancelHook {
                shared: Arc::clone(&self.shared),
                id: None,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.hooks.insert(id, Box::new(hook));
        CancelHook {
            shared: Arc::clone(&self.shared),
            id: Some(id),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.state.lock().hooks.remove(&id);
        }
    }
}

type TimerTask = Box<dyn FnOnce() + Send>;

struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, TimerTask>,
    next_id: u64,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Single-thread timer that runs callbacks at their deadlines
///
/// Every scheduled callback runs at most once: either when its deadline
/// passes or never, if it was cancelled first.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || run_timers(&worker))?;

        Ok(TimerService {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` once `at` has passed
    pub fn schedule(&self, at: Instant, task: impl FnOnce() + Send + 'static) -> TimerId {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if state.stopped {
            return TimerId(id);
        }
        state.queue.push(Reverse((at, id)));
        state.tasks.insert(id, Box::new(task));
        drop(state);
        self.shared.wakeup.notify_one();
        TimerId(id)
    }

    /// Drop a scheduled task; false if it already ran
    pub fn cancel(&self, id: TimerId) -> bool {
        self.shared.state.lock().tasks.remove(&id.0).is_some()
    }

    /// Number of tasks still waiting
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Stop the timer thread, discarding pending tasks
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.tasks.clear();
            state.queue.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timers(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let now = Instant::now();
        match state.queue.peek().copied() {
            Some(Reverse((at, id))) if at <= now => {
                state.queue.pop();
                if let Some(task) = state.tasks.remove(&id) {
                    drop(state);
                    task();
                    state = shared.state.lock();
                }
            }
            Some(Reverse((at, _))) => {
                shared.wakeup.wait_until(&mut state, at);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}
