//! Credit-guarded item queue shared by every publisher

use super::{NoopSubscription, Subscriber, Subscription};
use crate::http::Error;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Callbacks into whatever feeds an emitter
///
/// Lazy publishers produce on `on_request`; adapters forward demand to their
/// own upstream. Hooks are dropped once the emitter reaches a terminal state.
pub trait DemandHooks: Send + Sync {
    fn on_request(&self, _n: u64) {}

    /// One queued item was handed to the subscriber
    fn on_delivered(&self) {}

    fn on_cancel(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No subscriber yet, producers may already push
    Idle,
    Active,
    Cancelled,
    Done,
}

enum Signal<T> {
    Next(T),
    Complete,
    Error(Error),
}

struct State<T> {
    phase: Phase,
    queue: VecDeque<T>,
    demand: u64,
    finish: Option<Result<(), Error>>,
    /// Protocol violation by the subscriber, delivered ahead of queued items
    violation: Option<Error>,
    /// A thread owns the subscriber and is delivering signals
    draining: bool,
}

impl<T> State<T> {
    fn next_signal(&mut self) -> Option<Signal<T>> {
        if self.phase != Phase::Active {
            return None;
        }
        if let Some(error) = self.violation.take() {
            self.enter_done();
            return Some(Signal::Error(error));
        }
        if self.demand > 0 {
            if let Some(item) = self.queue.pop_front() {
                self.demand -= 1;
                return Some(Signal::Next(item));
            }
        }
        if self.queue.is_empty() {
            if let Some(finish) = self.finish.take() {
                self.enter_done();
                return Some(match finish {
                    Ok(()) => Signal::Complete,
                    Err(e) => Signal::Error(e),
                });
            }
        }
        None
    }

    fn enter_done(&mut self) {
        self.phase = Phase::Done;
        self.queue.clear();
        self.demand = 0;
    }

    fn accepts_items(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Active) && self.finish.is_none()
    }
}

/// Single-subscriber publisher backed by a queue
///
/// Producers call [`push`](Emitter::push), [`complete`](Emitter::complete) and
/// [`fail`](Emitter::fail) from any thread. Items are only handed to the
/// subscriber while it has outstanding credit; terminal signals are delivered
/// once the queue is empty, whether or not credit remains.
///
/// With a capacity, `push` blocks while the queue is full. Blocking pushes
/// must not be made from inside a subscriber signal.
pub struct Emitter<T> {
    state: Mutex<State<T>>,
    space: Condvar,
    subscriber: Mutex<Option<Box<dyn Subscriber<T>>>>,
    hooks: Mutex<Option<Arc<dyn DemandHooks>>>,
    capacity: Option<usize>,
}

impl<T: Send + 'static> Emitter<T> {
    /// Create an emitter with an unbounded queue
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Create an emitter whose `push` blocks beyond `capacity` queued items
    pub fn bounded(capacity: usize) -> Arc<Self> {
        Self::build(Some(capacity.max(1)))
    }

    fn build(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Emitter {
            state: Mutex::new(State {
                phase: Phase::Idle,
                queue: VecDeque::new(),
                demand: 0,
                finish: None,
                violation: None,
                draining: false,
            }),
            space: Condvar::new(),
            subscriber: Mutex::new(None),
            hooks: Mutex::new(None),
            capacity,
        })
    }

    /// Install demand hooks; replaces previous hooks
    pub fn set_hooks(&self, hooks: Arc<dyn DemandHooks>) {
        let state = self.state.lock();
        if matches!(state.phase, Phase::Idle | Phase::Active) {
            *self.hooks.lock() = Some(hooks);
        }
    }

    /// Attach the single subscriber
    ///
    /// A second subscriber receives a no-op subscription followed by an
    /// `IllegalState` error.
    pub fn subscribe(self: &Arc<Self>, mut subscriber: Box<dyn Subscriber<T>>) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Idle {
                drop(state);
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                subscriber.on_error(Error::IllegalState(
                    "publisher already has a subscriber".to_string(),
                ));
                return;
            }
            state.phase = Phase::Active;
            // Hold back signals until on_subscribe has returned
            state.draining = true;
        }

        let subscription: Arc<dyn Subscription> = Arc::new(EmitterSubscription {
            emitter: Arc::clone(self),
        });
        subscriber.on_subscribe(subscription);

        let released = {
            let mut state = self.state.lock();
            state.draining = false;
            if state.phase == Phase::Active {
                *self.subscriber.lock() = Some(subscriber);
                None
            } else {
                Some(subscriber)
            }
        };
        drop(released);
        self.drain();
    }

    /// Queue an item, blocking while a bounded queue is full
    ///
    /// Returns `false` when the subscriber cancelled or the stream is
    /// already terminated; the item is dropped in that case.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            loop {
                if !state.accepts_items() {
                    return false;
                }
                match self.capacity {
                    Some(cap) if state.queue.len() >= cap => self.space.wait(&mut state),
                    _ => break,
                }
            }
            state.queue.push_back(item);
        }
        self.drain();
        true
    }

    /// Signal successful end of stream after queued items
    pub fn complete(&self) {
        self.finish(Ok(()));
    }

    /// Signal failure after queued items
    pub fn fail(&self, error: Error) {
        self.finish(Err(error));
    }

    fn finish(&self, result: Result<(), Error>) {
        {
            let mut state = self.state.lock();
            if !state.accepts_items() {
                return;
            }
            state.finish = Some(result);
        }
        self.drain();
    }

    /// Whether the consumer side went away
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().phase == Phase::Cancelled
    }

    /// Whether a terminal signal was delivered or the consumer cancelled
    pub fn is_closed(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Cancelled | Phase::Done)
    }

    /// Credit not yet covered by queued items
    pub fn unmet_demand(&self) -> u64 {
        let state = self.state.lock();
        if state.phase != Phase::Active {
            return 0;
        }
        state.demand.saturating_sub(state.queue.len() as u64)
    }

    /// Number of attached subscribers, 0 or 1
    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock();
        usize::from(state.phase == Phase::Active)
    }

    /// Cancel from the consumer side without a subscriber ever attaching
    pub fn abandon(&self) {
        self.cancel_inner(true);
    }

    fn request(&self, n: i64) {
        let hooks = {
            let mut state = self.state.lock();
            if state.phase != Phase::Active {
                return;
            }
            if n <= 0 {
                if state.violation.is_none() {
                    state.violation = Some(Error::IllegalArgument(format!(
                        "non-positive subscription request: {}",
                        n
                    )));
                }
                None
            } else {
                state.demand = state.demand.saturating_add(n as u64);
                self.hooks.lock().clone()
            }
        };

        match hooks {
            Some(hooks) => hooks.on_request(n as u64),
            None if n <= 0 => {
                if let Some(hooks) = self.hooks.lock().take() {
                    hooks.on_cancel();
                }
            }
            None => {}
        }
        self.drain();
    }

    fn cancel_inner(&self, from_idle: bool) {
        let (subscriber, hooks) = {
            let mut state = self.state.lock();
            let cancellable = match state.phase {
                Phase::Active => true,
                Phase::Idle => from_idle,
                _ => false,
            };
            if !cancellable {
                return;
            }
            state.phase = Phase::Cancelled;
            state.queue.clear();
            state.finish = None;
            self.space.notify_all();
            let subscriber = if state.draining {
                None
            } else {
                self.subscriber.lock().take()
            };
            (subscriber, self.hooks.lock().take())
        };
        drop(subscriber);
        if let Some(hooks) = hooks {
            hooks.on_cancel();
        }
    }

    /// Deliver signals until nothing is deliverable
    ///
    /// Only the thread that takes the subscriber out of its slot delivers;
    /// every other caller returns immediately and the drainer picks up
    /// their changes on its next pass.
    fn drain(&self) {
        let mut subscriber = {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            let Some(subscriber) = self.subscriber.lock().take() else {
                return;
            };
            state.draining = true;
            subscriber
        };

        loop {
            let signal = {
                let mut state = self.state.lock();
                match state.next_signal() {
                    Some(signal) => {
                        if state.queue.len() < self.capacity.unwrap_or(usize::MAX) {
                            self.space.notify_all();
                        }
                        signal
                    }
                    None => {
                        state.draining = false;
                        if state.phase == Phase::Active {
                            *self.subscriber.lock() = Some(subscriber);
                            return;
                        }
                        self.space.notify_all();
                        break;
                    }
                }
            };

            match signal {
                Signal::Next(item) => {
                    subscriber.on_next(item);
                    let hooks = self.hooks.lock().clone();
                    if let Some(hooks) = hooks {
                        hooks.on_delivered();
                    }
                }
                Signal::Complete => subscriber.on_complete(),
                Signal::Error(error) => subscriber.on_error(error),
            }
        }

        // Terminal or cancelled: release the subscriber and the hooks
        drop(subscriber);
        let hooks = self.hooks.lock().take();
        drop(hooks);
    }
}

struct EmitterSubscription<T> {
    emitter: Arc<Emitter<T>>,
}

impl<T: Send + 'static> Subscription for EmitterSubscription<T> {
    fn request(&self, n: i64) {
        self.emitter.request(n);
    }

    fn cancel(&self) {
        self.emitter.cancel_inner(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        items: Vec<u32>,
        completed: usize,
        errors: Vec<String>,
        subscription: Option<Arc<dyn Subscription>>,
    }

    struct Recorder {
        log: Arc<Mutex<Log>>,
        initial: i64,
        per_item: i64,
    }

    impl Subscriber<u32> for Recorder {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            self.log.lock().subscription = Some(Arc::clone(&subscription));
            if self.initial != 0 {
                subscription.request(self.initial);
            }
        }

        fn on_next(&mut self, item: u32) {
            let subscription = {
                let mut log = self.log.lock();
                log.items.push(item);
                log.subscription.clone()
            };
            if self.per_item > 0 {
                if let Some(s) = subscription {
                    s.request(self.per_item);
                }
            }
        }

        fn on_error(&mut self, error: Error) {
            self.log.lock().errors.push(error.to_string());
        }

        fn on_complete(&mut self) {
            self.log.lock().completed += 1;
        }
    }

    fn recorder(initial: i64, per_item: i64) -> (Box<Recorder>, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        (
            Box::new(Recorder {
                log: Arc::clone(&log),
                initial,
                per_item,
            }),
            log,
        )
    }

    #[test]
    fn test_items_only_flow_with_credit() {
        let emitter = Emitter::new();
        for i in 0..5 {
            emitter.push(i);
        }
        emitter.complete();

        let (sub, log) = recorder(2, 0);
        emitter.subscribe(sub);
        assert_eq!(log.lock().items, vec![0, 1]);
        assert_eq!(log.lock().completed, 0);

        let subscription = log.lock().subscription.clone().unwrap();
        subscription.request(10);
        assert_eq!(log.lock().items, vec![0, 1, 2, 3, 4]);
        assert_eq!(log.lock().completed, 1);
    }

    #[test]
    fn test_terminal_signal_without_credit() {
        let emitter: Arc<Emitter<u32>> = Emitter::new();
        let (sub, log) = recorder(0, 0);
        emitter.subscribe(sub);
        emitter.complete();
        assert_eq!(log.lock().completed, 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn test_reentrant_request_delivers_in_order() {
        let emitter = Emitter::new();
        for i in 0..100 {
            emitter.push(i);
        }
        emitter.complete();
        let (sub, log) = recorder(1, 1);
        emitter.subscribe(sub);
        let log = log.lock();
        assert_eq!(log.items, (0..100).collect::<Vec<_>>());
        assert_eq!(log.completed, 1);
    }

    #[test]
    fn test_non_positive_request_fails_once() {
        let emitter = Emitter::new();
        emitter.push(1);
        let (sub, log) = recorder(0, 0);
        emitter.subscribe(sub);
        let subscription = log.lock().subscription.clone().unwrap();
        subscription.request(0);
        subscription.request(-5);
        subscription.request(3);

        let log = log.lock();
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].contains("non-positive"));
        assert!(log.items.is_empty());
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let emitter: Arc<Emitter<u32>> = Emitter::new();
        let (first, _first_log) = recorder(1, 0);
        emitter.subscribe(first);
        let (second, second_log) = recorder(1, 0);
        emitter.subscribe(second);

        assert_eq!(second_log.lock().errors.len(), 1);
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[test]
    fn test_cancel_stops_delivery_and_calls_hook() {
        struct CountCancel(AtomicU64);
        impl DemandHooks for CountCancel {
            fn on_cancel(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let emitter = Emitter::new();
        let hooks = Arc::new(CountCancel(AtomicU64::new(0)));
        emitter.set_hooks(hooks.clone());
        let (sub, log) = recorder(1, 0);
        emitter.subscribe(sub);
        emitter.push(1);

        let subscription = log.lock().subscription.clone().unwrap();
        subscription.cancel();
        subscription.cancel();
        assert!(!emitter.push(2));
        subscription.request(5);

        assert_eq!(log.lock().items, vec![1]);
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn test_hooks_see_demand() {
        struct Lazy {
            emitter: std::sync::Weak<Emitter<u32>>,
            next: AtomicU64,
        }
        impl DemandHooks for Lazy {
            fn on_request(&self, n: u64) {
                let Some(emitter) = self.emitter.upgrade() else {
                    return;
                };
                for _ in 0..n {
                    let value = self.next.fetch_add(1, Ordering::SeqCst);
                    if value >= 3 {
                        emitter.complete();
                        return;
                    }
                    emitter.push(value as u32);
                }
            }
        }

        let emitter = Emitter::new();
        emitter.set_hooks(Arc::new(Lazy {
            emitter: Arc::downgrade(&emitter),
            next: AtomicU64::new(0),
        }));
        let (sub, log) = recorder(1, 1);
        emitter.subscribe(sub);

        let log = log.lock();
        assert_eq!(log.items, vec![0, 1, 2]);
        assert_eq!(log.completed, 1);
    }

    #[test]
    fn test_hooks_see_each_delivery() {
        struct CountDelivered(AtomicU64);
        impl DemandHooks for CountDelivered {
            fn on_delivered(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let emitter = Emitter::new();
        let hooks = Arc::new(CountDelivered(AtomicU64::new(0)));
        emitter.set_hooks(hooks.clone());
        for i in 0..4 {
            emitter.push(i);
        }
        let (sub, log) = recorder(1, 0);
        emitter.subscribe(sub);
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);

        let subscription = log.lock().subscription.clone().unwrap();
        subscription.request(2);
        assert_eq!(log.lock().items, vec![0, 1, 2]);
        assert_eq!(hooks.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bounded_push_waits_for_consumer() {
        let emitter = Emitter::bounded(2);
        let (sub, log) = recorder(0, 0);
        emitter.subscribe(sub);

        let producer = {
            let emitter = Arc::clone(&emitter);
            thread::spawn(move || {
                for i in 0..10 {
                    assert!(emitter.push(i));
                }
                emitter.complete();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(log.lock().items.is_empty());

        let subscription = log.lock().subscription.clone().unwrap();
        subscription.request(crate::http::flow::UNBOUNDED);
        producer.join().unwrap();

        let log = log.lock();
        assert_eq!(log.items, (0..10).collect::<Vec<_>>());
        assert_eq!(log.completed, 1);
    }

    #[test]
    fn test_abandon_unblocks_producer() {
        let emitter = Emitter::bounded(1);
        emitter.push(0u32);
        let producer = {
            let emitter = Arc::clone(&emitter);
            thread::spawn(move || emitter.push(1))
        };
        thread::sleep(Duration::from_millis(20));
        emitter.abandon();
        assert!(!producer.join().unwrap());
        assert!(emitter.is_cancelled());
    }
}
