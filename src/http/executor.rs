//! Worker threads for asynchronous sends
//!
//! `HttpClient::send_async` queues the blocking pipeline onto a fixed set of
//! worker threads and hands back a [`ResponseFuture`]. The future can be
//! waited on from any thread or polled by an async runtime; it completes
//! exactly once, with whichever of the pipeline result, the request timer or
//! a cancellation gets there first.

use super::timeout::{CancelToken, TimerId, TimerService};
use super::{Error, Result};
use super::message::Response;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads running queued jobs in order
pub(crate) struct Executor {
    /// Taken on shutdown; workers finish the queue and exit
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn new(name: &str, workers: usize) -> Result<Executor> {
        let (jobs, queue) = crossbeam_channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, n))
                .spawn(move || run_worker(queue))?;
            handles.push(handle);
        }

        Ok(Executor {
            jobs: Mutex::new(Some(jobs)),
            workers: Mutex::new(handles),
        })
    }

    /// Queue `job`; fails once the executor was shut down
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let jobs = self.jobs.lock();
        let sent = match jobs.as_ref() {
            Some(jobs) => jobs.send(Box::new(job)).is_ok(),
            None => false,
        };
        if !sent {
            return Err(Error::IllegalState("client is shut down".to_string()));
        }
        trace!(queued = jobs.as_ref().map_or(0, Sender::len), "job queued");
        Ok(())
    }

    /// Stop accepting jobs, run the queued ones and join the workers
    pub(crate) fn shutdown(&self) {
        drop(self.jobs.lock().take());

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(queue: Receiver<Job>) {
    for job in queue.iter() {
        job();
    }
    debug!("worker exiting");
}

struct Slot {
    result: Option<Result<Response>>,
    done: bool,
    waker: Option<Waker>,
    timer: Option<(Arc<TimerService>, TimerId)>,
}

struct FutureShared {
    slot: Mutex<Slot>,
    ready: Condvar,
    /// Tripped by `cancel` and by the request timer to stop the worker
    cancel: CancelToken,
}

/// Pending result of [`HttpClient::send_async`](super::HttpClient::send_async)
pub struct ResponseFuture {
    shared: Arc<FutureShared>,
}

/// Completing side of a [`ResponseFuture`]
#[derive(Clone)]
pub(crate) struct Completer {
    shared: Arc<FutureShared>,
}

impl ResponseFuture {
    pub(crate) fn new() -> (ResponseFuture, Completer) {
        let shared = Arc::new(FutureShared {
            slot: Mutex::new(Slot {
                result: None,
                done: false,
                waker: None,
                timer: None,
            }),
            ready: Condvar::new(),
            cancel: CancelToken::new(),
        });
        (
            ResponseFuture {
                shared: Arc::clone(&shared),
            },
            Completer { shared },
        )
    }

    /// Future that is already complete
    pub(crate) fn ready(result: Result<Response>) -> ResponseFuture {
        let (future, completer) = ResponseFuture::new();
        completer.complete(result);
        future
    }

    /// Whether a result is available
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().done
    }

    /// Block until the response head arrives or the request fails
    pub fn wait(self) -> Result<Response> {
        let mut slot = self.shared.slot.lock();
        loop {
            if slot.done {
                return take(&mut slot);
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Like [`wait`](ResponseFuture::wait), but give the future back if
    /// nothing arrived within `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<Response>, ResponseFuture> {
        let until = Instant::now() + timeout;
        {
            let mut slot = self.shared.slot.lock();
            while !slot.done {
                if self.shared.ready.wait_until(&mut slot, until).timed_out() && !slot.done {
                    break;
                }
            }
            if slot.done {
                return Ok(take(&mut slot));
            }
        }
        Err(self)
    }

    /// Complete the future with a cancellation error unless it is done
    ///
    /// The worker running the request is interrupted as well: a blocked
    /// socket read is shut down and a pending HTTP/2 stream is reset.
    pub fn cancel(&self) -> bool {
        let completed = Completer {
            shared: Arc::clone(&self.shared),
        }
        .complete(Err(Error::Cancelled));
        if completed {
            self.shared.cancel.cancel();
        }
        completed
    }
}

fn take(slot: &mut Slot) -> Result<Response> {
    slot.result
        .take()
        .unwrap_or_else(|| Err(Error::IllegalState("response already taken".to_string())))
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if slot.done {
            return Poll::Ready(take(&mut slot));
        }
        match &slot.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Completer {
    /// Deliver `result`; false if the future was already complete
    pub(crate) fn complete(&self, result: Result<Response>) -> bool {
        let (waker, timer) = {
            let mut slot = self.shared.slot.lock();
            if slot.done {
                return false;
            }
            slot.done = true;
            slot.result = Some(result);
            (slot.waker.take(), slot.timer.take())
        };
        self.shared.ready.notify_all();
        if let Some((timers, id)) = timer {
            timers.cancel(id);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.slot.lock().done
    }

    /// Token the worker watches while running the request
    pub(crate) fn token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    /// Fail the future with a request timeout at `at`
    pub(crate) fn expire_at(&self, timers: &Arc<TimerService>, at: Instant) {
        let completer = self.clone();
        let id = timers.schedule(at, move || {
            if completer.complete(Err(Error::RequestTimeout)) {
                debug!("asynchronous request timed out");
                completer.token().cancel();
            }
        });
        let mut slot = self.shared.slot.lock();
        if slot.done {
            drop(slot);
            timers.cancel(id);
        } else {
            slot.timer = Some((Arc::clone(timers), id));
        }
    }
}
