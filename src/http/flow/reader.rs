//! Blocking consumers on top of a subscription

use super::{Subscriber, Subscription};
use crate::http::{Error, Result};
use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PullState<T> {
    items: VecDeque<T>,
    subscription: Option<Arc<dyn Subscription>>,
    subscribed: bool,
    requested: bool,
    done: bool,
    error: Option<Error>,
    /// Message of an error that was already handed out
    failure: Option<String>,
    closed: bool,
}

struct PullShared<T> {
    state: Mutex<PullState<T>>,
    ready: Condvar,
}

/// Blocking queue that requests one item at a time
///
/// Cloning yields another handle to the same queue, which lets one thread
/// block in [`next`](Pull::next) while another calls [`close`](Pull::close).
pub struct Pull<T> {
    shared: Arc<PullShared<T>>,
}

impl<T> Clone for Pull<T> {
    fn clone(&self) -> Self {
        Pull {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for Pull<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Pull<T> {
    pub fn new() -> Self {
        Pull {
            shared: Arc::new(PullShared {
                state: Mutex::new(PullState {
                    items: VecDeque::new(),
                    subscription: None,
                    subscribed: false,
                    requested: false,
                    done: false,
                    error: None,
                    failure: None,
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Subscriber feeding this queue; attach it to exactly one publisher
    pub fn subscriber(&self) -> PullSubscriber<T> {
        PullSubscriber {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block for the next item
    ///
    /// Returns `Ok(None)` at end of stream. The first call after a failure
    /// returns the original error; later calls return an I/O error naming it.
    pub fn next(&self, deadline: Option<Instant>) -> Result<Option<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(Error::io(io::ErrorKind::Other, closed_message(&state)));
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            if let Some(error) = state.error.take() {
                state.failure = Some(error.to_string());
                return Err(error);
            }
            if let Some(failure) = &state.failure {
                return Err(Error::io(
                    io::ErrorKind::Other,
                    format!("body stream failed: {}", failure),
                ));
            }
            if state.done {
                return Ok(None);
            }
            if !state.requested {
                if let Some(subscription) = state.subscription.clone() {
                    state.requested = true;
                    MutexGuard::unlocked(&mut state, || subscription.request(1));
                    continue;
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                        && !state.done
                        && state.error.is_none()
                        && !state.closed
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.shared.ready.wait(&mut state),
            }
        }
    }

    /// Cancel the upstream subscription, exactly once
    pub fn close(&self) {
        let subscription = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.items.clear();
            state.subscription.take()
        };
        self.shared.ready.notify_all();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Whether the stream ended or was closed
    pub fn is_finished(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed || (state.items.is_empty() && (state.done || state.failure.is_some()))
    }
}

fn closed_message<T>(state: &PullState<T>) -> String {
    match (&state.failure, &state.error) {
        (Some(cause), _) => format!("stream closed: {}", cause),
        (None, Some(cause)) => format!("stream closed: {}", cause),
        (None, None) => "stream closed".to_string(),
    }
}

/// Subscriber half of a [`Pull`]
pub struct PullSubscriber<T> {
    shared: Arc<PullShared<T>>,
}

impl<T: Send> Subscriber<T> for PullSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let mut state = self.shared.state.lock();
        if state.subscribed || state.closed {
            drop(state);
            subscription.cancel();
            return;
        }
        state.subscribed = true;
        state.subscription = Some(subscription);
        drop(state);
        self.shared.ready.notify_all();
    }

    fn on_next(&mut self, item: T) {
        let mut state = self.shared.state.lock();
        state.requested = false;
        if !state.closed {
            state.items.push_back(item);
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    fn on_error(&mut self, error: Error) {
        let mut state = self.shared.state.lock();
        state.subscription = None;
        state.error = Some(error);
        drop(state);
        self.shared.ready.notify_all();
    }

    fn on_complete(&mut self) {
        let mut state = self.shared.state.lock();
        state.subscription = None;
        state.done = true;
        drop(state);
        self.shared.ready.notify_all();
    }
}

/// Blocking `io::Read` over a byte subscription
///
/// Reads block until the publisher delivers data. Closing or dropping the
/// reader cancels the subscription; reads after that fail.
pub struct BodyReader {
    pull: Pull<Bytes>,
    current: Bytes,
    timeout: Option<Duration>,
}

impl BodyReader {
    /// Create a reader together with the subscriber that feeds it
    pub fn new() -> (BodyReader, PullSubscriber<Bytes>) {
        let pull = Pull::new();
        let subscriber = pull.subscriber();
        (
            BodyReader {
                pull,
                current: Bytes::new(),
                timeout: None,
            },
            subscriber,
        )
    }

    /// Bound each blocking read; expired reads fail with `TimedOut`
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Next chunk of the body, or `None` at the end
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match self.pull.next(deadline)? {
                Some(chunk) if chunk.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Handle that can close this reader from another thread
    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            pull: self.pull.clone(),
        }
    }

    /// Cancel the underlying subscription
    pub fn close(&mut self) {
        self.current.clear();
        self.pull.close();
    }
}

impl io::Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_empty() {
            match self.next_chunk() {
                Ok(Some(chunk)) => self.current = chunk,
                Ok(None) => return Ok(0),
                Err(Error::Io(e)) => return Err(e),
                Err(Error::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "body read timed out"))
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.pull.close();
    }
}

/// Cross-thread close handle for a [`BodyReader`]
#[derive(Clone)]
pub struct ReaderCloser {
    pull: Pull<Bytes>,
}

impl ReaderCloser {
    pub fn close(&self) {
        self.pull.close();
    }
}

/// Blocking iterator over decoded body lines
pub struct Lines {
    pull: Pull<String>,
    finished: bool,
}

impl Lines {
    pub(crate) fn new(pull: Pull<String>) -> Self {
        Lines {
            pull,
            finished: false,
        }
    }
}

impl Iterator for Lines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.pull.next(None) {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for Lines {
    fn drop(&mut self) {
        if !self.pull.is_finished() {
            self.pull.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::flow::{body, Emitter, Publisher};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_read_to_end() {
        let (mut reader, subscriber) = BodyReader::new();
        body::chunks(vec![
            Bytes::from_static(b"hello "),
            Bytes::from_static(b""),
            Bytes::from_static(b"world"),
        ])
        .subscribe(Box::new(subscriber));

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_small_reads() {
        let (mut reader, subscriber) = BodyReader::new();
        body::bytes("abcdef").subscribe(Box::new(subscriber));

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_blocking_read_from_producer_thread() {
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        let (mut reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));

        let producer = {
            let emitter = Arc::clone(&emitter);
            thread::spawn(move || {
                for i in 0..5u8 {
                    thread::sleep(Duration::from_millis(5));
                    emitter.push(Bytes::from(vec![b'0' + i]));
                }
                emitter.complete();
            })
        };

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, b"01234");
    }

    #[test]
    fn test_close_cancels_once_and_fails_reads() {
        struct CountingCancel(Arc<AtomicUsize>);
        impl crate::http::flow::emitter::DemandHooks for CountingCancel {
            fn on_cancel(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let cancels = Arc::new(AtomicUsize::new(0));
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        emitter.set_hooks(Arc::new(CountingCancel(Arc::clone(&cancels))));
        let (mut reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));

        reader.close();
        reader.close();
        drop(reader.closer());

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(err.to_string().contains("stream closed"));
        drop(reader);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(emitter.is_cancelled());
    }

    #[test]
    fn test_error_then_closed_reference_cause() {
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        let (mut reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));
        emitter.fail(Error::Protocol("peer reset".into()));

        let mut buf = [0u8; 8];
        let first = reader.read(&mut buf).unwrap_err();
        assert!(first.to_string().contains("peer reset"));
        let second = reader.read(&mut buf).unwrap_err();
        assert!(second.to_string().contains("peer reset"));

        reader.close();
        let third = reader.read(&mut buf).unwrap_err();
        assert!(third.to_string().contains("stream closed: "));
        assert!(third.to_string().contains("peer reset"));
    }

    #[test]
    fn test_close_from_other_thread_interrupts_read() {
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        let (mut reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));
        let closer = reader.closer();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            closer.close();
        });

        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).is_err());
        handle.join().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let emitter: Arc<Emitter<Bytes>> = Emitter::new();
        let (mut reader, subscriber) = BodyReader::new();
        emitter.subscribe(Box::new(subscriber));
        reader.set_timeout(Some(Duration::from_millis(20)));

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
