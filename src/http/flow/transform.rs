//! Subscriber adapters that reshape a byte stream
//!
//! A [`TransformSubscriber`] sits between an upstream byte publisher and a
//! downstream subscriber. Downstream credit is honoured exactly: upstream
//! chunks are requested one at a time while the downstream still has unmet
//! demand, and whatever the transform produces beyond that demand waits in
//! the downstream queue.

use super::charset::{Charset, Decoder};
use super::emitter::{DemandHooks, Emitter};
use super::{Subscriber, Subscription};
use crate::http::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Stateful conversion from byte chunks to downstream items
pub trait Transform<T>: Send {
    fn push(&mut self, chunk: Bytes, out: &mut Vec<T>);

    /// Upstream completed; emit whatever is still buffered
    fn finish(&mut self, out: &mut Vec<T>);
}

#[derive(Default)]
struct Upstream {
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    /// At most one upstream chunk is requested at a time
    in_flight: AtomicBool,
}

impl Upstream {
    fn request_one(&self) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscription = self.subscription.lock().clone();
        if let Some(s) = subscription {
            s.request(1);
        }
    }

    fn received(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    fn cancel(&self) {
        let subscription = self.subscription.lock().take();
        if let Some(s) = subscription {
            s.cancel();
        }
    }
}

struct RelayHooks<T> {
    upstream: Arc<Upstream>,
    downstream: Weak<Emitter<T>>,
}

impl<T: Send + 'static> DemandHooks for RelayHooks<T> {
    fn on_request(&self, _n: u64) {
        let Some(downstream) = self.downstream.upgrade() else {
            return;
        };
        if downstream.unmet_demand() > 0 {
            self.upstream.request_one();
        }
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
    }
}

/// Upstream byte subscriber that feeds a transformed downstream
pub struct TransformSubscriber<T, X> {
    transform: X,
    downstream: Option<Box<dyn Subscriber<T>>>,
    emitter: Arc<Emitter<T>>,
    upstream: Arc<Upstream>,
    subscribed: bool,
    out: Vec<T>,
}

impl<T: Send + 'static, X: Transform<T>> TransformSubscriber<T, X> {
    pub fn new(transform: X, downstream: Box<dyn Subscriber<T>>) -> Self {
        TransformSubscriber {
            transform,
            downstream: Some(downstream),
            emitter: Emitter::new(),
            upstream: Arc::new(Upstream::default()),
            subscribed: false,
            out: Vec::new(),
        }
    }

    fn emit(&mut self) -> bool {
        for item in self.out.drain(..) {
            if !self.emitter.push(item) {
                return false;
            }
        }
        true
    }
}

impl<T: Send + 'static, X: Transform<T>> Subscriber<Bytes> for TransformSubscriber<T, X> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.subscribed {
            subscription.cancel();
            return;
        }
        self.subscribed = true;
        *self.upstream.subscription.lock() = Some(subscription);
        self.emitter.set_hooks(Arc::new(RelayHooks {
            upstream: Arc::clone(&self.upstream),
            downstream: Arc::downgrade(&self.emitter),
        }));
        if let Some(downstream) = self.downstream.take() {
            self.emitter.subscribe(downstream);
        }
    }

    fn on_next(&mut self, chunk: Bytes) {
        self.upstream.received();
        self.transform.push(chunk, &mut self.out);
        if !self.emit() {
            self.upstream.cancel();
            return;
        }
        if self.emitter.unmet_demand() > 0 {
            self.upstream.request_one();
        }
    }

    fn on_error(&mut self, error: Error) {
        self.out.clear();
        self.emitter.fail(error);
    }

    fn on_complete(&mut self) {
        self.transform.finish(&mut self.out);
        self.emit();
        self.emitter.complete();
    }
}

/// Coalesces chunks into buffers of exactly `size` bytes, except the last
#[derive(Debug)]
pub struct Coalesce {
    size: usize,
    buf: BytesMut,
}

impl Transform<Bytes> for Coalesce {
    fn push(&mut self, chunk: Bytes, out: &mut Vec<Bytes>) {
        self.buf.extend_from_slice(&chunk);
        while self.buf.len() >= self.size {
            out.push(self.buf.split_to(self.size).freeze());
        }
    }

    fn finish(&mut self, out: &mut Vec<Bytes>) {
        if !self.buf.is_empty() {
            out.push(self.buf.split().freeze());
        }
    }
}

/// Wrap `downstream` so it sees buffers of `size` bytes
///
/// Every buffer but the last holds exactly `size` bytes, so a body of `n`
/// bytes arrives in at most `ceil(n / size)` items.
pub fn buffering(
    downstream: Box<dyn Subscriber<Bytes>>,
    size: usize,
) -> Result<TransformSubscriber<Bytes, Coalesce>> {
    if size == 0 {
        return Err(Error::IllegalArgument("buffer size must be positive".to_string()));
    }
    Ok(TransformSubscriber::new(
        Coalesce {
            size,
            buf: BytesMut::with_capacity(size),
        },
        downstream,
    ))
}

/// Decodes text and splits on `\r\n`, `\r` or `\n`
///
/// A `\r\n` pair counts as one terminator even when the two bytes arrive in
/// different chunks. A trailing unterminated line is emitted at the end.
#[derive(Debug)]
pub struct LineSplitter {
    decoder: Decoder,
    text: String,
    line: String,
    after_cr: bool,
}

impl LineSplitter {
    pub fn new(charset: Charset) -> Self {
        LineSplitter {
            decoder: Decoder::new(charset),
            text: String::new(),
            line: String::new(),
            after_cr: false,
        }
    }

    fn split(&mut self, out: &mut Vec<String>) {
        for c in self.text.drain(..) {
            match c {
                '\n' if self.after_cr => self.after_cr = false,
                '\n' => out.push(std::mem::take(&mut self.line)),
                '\r' => {
                    out.push(std::mem::take(&mut self.line));
                    self.after_cr = true;
                }
                c => {
                    self.after_cr = false;
                    self.line.push(c);
                }
            }
        }
    }
}

impl Transform<String> for LineSplitter {
    fn push(&mut self, chunk: Bytes, out: &mut Vec<String>) {
        self.decoder.feed(&chunk, &mut self.text);
        self.split(out);
    }

    fn finish(&mut self, out: &mut Vec<String>) {
        self.decoder.finish(&mut self.text);
        self.split(out);
        if !self.line.is_empty() {
            out.push(std::mem::take(&mut self.line));
        }
    }
}

/// Wrap a line subscriber so it can consume a byte body
pub fn lines(
    downstream: Box<dyn Subscriber<String>>,
    charset: Charset,
) -> TransformSubscriber<String, LineSplitter> {
    TransformSubscriber::new(LineSplitter::new(charset), downstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::flow::body;
    use crate::http::flow::Publisher;
    use proptest::prelude::*;

    struct Collect<T> {
        items: Arc<Mutex<Vec<T>>>,
        done: Arc<Mutex<Option<std::result::Result<(), String>>>>,
        subscription: Option<Arc<dyn Subscription>>,
        cancel_after: Option<usize>,
    }

    impl<T: Send> Subscriber<T> for Collect<T> {
        fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
            subscription.request(1);
            self.subscription = Some(subscription);
        }

        fn on_next(&mut self, item: T) {
            let count = {
                let mut items = self.items.lock();
                items.push(item);
                items.len()
            };
            if let Some(s) = &self.subscription {
                if self.cancel_after == Some(count) {
                    s.cancel();
                } else {
                    s.request(1);
                }
            }
        }

        fn on_error(&mut self, error: Error) {
            *self.done.lock() = Some(Err(error.to_string()));
        }

        fn on_complete(&mut self) {
            *self.done.lock() = Some(Ok(()));
        }
    }

    type Outcome<T> = (Arc<Mutex<Vec<T>>>, Arc<Mutex<Option<std::result::Result<(), String>>>>);

    fn collector<T: Send + 'static>(cancel_after: Option<usize>) -> (Box<Collect<T>>, Outcome<T>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Mutex::new(None));
        (
            Box::new(Collect {
                items: Arc::clone(&items),
                done: Arc::clone(&done),
                subscription: None,
                cancel_after,
            }),
            (items, done),
        )
    }

    fn chunks(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn test_buffering_exact_sizes() {
        let publisher = body::chunks(chunks(&[b"abc", b"defgh", b"i", b"jklmnopq"]));
        let (sub, (items, done)) = collector::<Bytes>(None);
        publisher.subscribe(Box::new(buffering(sub, 4).unwrap()));

        let items = items.lock();
        let sizes: Vec<usize> = items.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 4, 4, 1]);
        let joined: Vec<u8> = items.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(joined, b"abcdefghijklmnopq");
        assert_eq!(*done.lock(), Some(Ok(())));
    }

    #[test]
    fn test_buffering_item_count_bound() {
        for total in [0usize, 1, 7, 8, 9, 100] {
            let data = vec![7u8; total];
            let parts: Vec<Bytes> = data.chunks(3).map(Bytes::copy_from_slice).collect();
            let (sub, (items, _)) = collector::<Bytes>(None);
            body::chunks(parts).subscribe(Box::new(buffering(sub, 8).unwrap()));
            assert!(items.lock().len() <= total.div_ceil(8));
        }
    }

    #[test]
    fn test_buffering_rejects_zero() {
        let (sub, _) = collector::<Bytes>(None);
        assert!(buffering(sub, 0).is_err());
    }

    #[test]
    fn test_buffering_cancel_propagates() {
        let publisher = body::chunks(chunks(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]));
        let (sub, (items, done)) = collector::<Bytes>(Some(2));
        publisher.subscribe(Box::new(buffering(sub, 4).unwrap()));

        assert_eq!(items.lock().len(), 2);
        assert_eq!(*done.lock(), None);
    }

    #[test]
    fn test_lines_mixed_terminators() {
        let publisher = body::chunks(chunks(&[b"one\r", b"\ntwo\rthree\n", b"\nfour"]));
        let (sub, (items, done)) = collector::<String>(None);
        publisher.subscribe(Box::new(lines(sub, Charset::utf8())));

        assert_eq!(*items.lock(), vec!["one", "two", "three", "", "four"]);
        assert_eq!(*done.lock(), Some(Ok(())));
    }

    #[test]
    fn test_lines_utf16() {
        let text = "α\nβ\r\nγ";
        let encoded: Vec<u8> = text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let parts: Vec<Bytes> = encoded.chunks(3).map(Bytes::copy_from_slice).collect();
        let (sub, (items, _)) = collector::<String>(None);
        body::chunks(parts).subscribe(Box::new(lines(sub, Charset::utf16le())));

        assert_eq!(*items.lock(), vec!["α", "β", "γ"]);
    }

    #[test]
    fn test_lines_reassemble_split_characters() {
        let text = "z\u{e9}\u{4e2d}\n\u{1f600}";
        let bytes = text.as_bytes();
        let mut encoded = bytes.to_vec();
        // Dangling lead byte of a 3-byte sequence
        encoded.push(0xE4);
        let parts: Vec<Bytes> = encoded.chunks(1).map(Bytes::copy_from_slice).collect();
        let (sub, (items, done)) = collector::<String>(None);
        body::chunks(parts).subscribe(Box::new(lines(sub, Charset::utf8())));

        assert_eq!(*items.lock(), vec!["z\u{e9}\u{4e2d}", "\u{1f600}\u{FFFD}"]);
        assert_eq!(*done.lock(), Some(Ok(())));
    }

    #[test]
    fn test_lines_upstream_error() {
        let publisher = body::iter(|| {
            vec![
                Ok(Bytes::from_static(b"a\n")),
                Err(Error::Protocol("boom".to_string())),
            ]
            .into_iter()
        });
        let (sub, (items, done)) = collector::<String>(None);
        publisher.subscribe(Box::new(lines(sub, Charset::utf8())));

        assert_eq!(*items.lock(), vec!["a"]);
        let done = done.lock().clone().unwrap();
        assert!(done.unwrap_err().contains("boom"));
    }

    proptest! {
        #[test]
        fn prop_buffering_preserves_bytes(
            parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..12),
            size in 1usize..32,
        ) {
            let total: usize = parts.iter().map(Vec::len).sum();
            let expected: Vec<u8> = parts.concat();
            let publisher = body::chunks(parts.into_iter().map(Bytes::from).collect());
            let (sub, (items, done)) = collector::<Bytes>(None);
            publisher.subscribe(Box::new(buffering(sub, size).unwrap()));

            let items = items.lock();
            let joined: Vec<u8> = items.iter().flat_map(|b| b.to_vec()).collect();
            prop_assert_eq!(joined, expected);
            prop_assert!(items.len() <= total.div_ceil(size));
            prop_assert_eq!(done.lock().clone(), Some(Ok(())));
        }
    }
}
