//! Request body publishers
//!
//! Every request body is a [`BodyPublisher`]: a byte publisher that may
//! declare its length up front. A known length is sent as `Content-Length`
//! and enforced while sending; an unknown length is sent chunked on
//! HTTP/1.1 and as plain DATA frames on HTTP/2.
//!
//! Each call to `subscribe` replays the body from the start, which is what
//! makes redirects and retries with a body possible.

use super::emitter::{DemandHooks, Emitter};
use super::{Publisher, Subscriber};
use crate::http::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Publisher of request body bytes
pub trait BodyPublisher: Publisher<Bytes> {
    /// Declared length in bytes, `None` when unknown
    fn content_length(&self) -> Option<u64>;
}

/// Shared, replayable request body
pub type Body = Arc<dyn BodyPublisher>;

/// Size of chunks read from files
const FILE_CHUNK: usize = 16 * 1024;

struct Fixed {
    chunks: Vec<Bytes>,
    length: Option<u64>,
}

impl Publisher<Bytes> for Fixed {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<Bytes>>) {
        let emitter = Emitter::new();
        for chunk in &self.chunks {
            emitter.push(chunk.clone());
        }
        emitter.complete();
        emitter.subscribe(subscriber);
    }
}

impl BodyPublisher for Fixed {
    fn content_length(&self) -> Option<u64> {
        self.length
    }
}

/// Empty body with a declared length of zero
pub fn empty() -> Body {
    Arc::new(Fixed {
        chunks: Vec::new(),
        length: Some(0),
    })
}

/// Body made of a single buffer
pub fn bytes(data: impl Into<Bytes>) -> Body {
    let data = data.into();
    let length = Some(data.len() as u64);
    Arc::new(Fixed {
        chunks: vec![data],
        length,
    })
}

/// UTF-8 text body
pub fn text(text: impl Into<String>) -> Body {
    bytes(text.into())
}

/// Body delivered as the given chunks, with a known total length
pub fn chunks(chunks: Vec<Bytes>) -> Body {
    let length = Some(chunks.iter().map(|c| c.len() as u64).sum());
    Arc::new(Fixed { chunks, length })
}

/// Body delivered as the given chunks with no declared length
pub fn streaming(chunks: Vec<Bytes>) -> Body {
    Arc::new(Fixed {
        chunks,
        length: None,
    })
}

/// Producer state behind a lazy publisher
struct Pump<I> {
    source: Mutex<Option<I>>,
    emitter: Weak<Emitter<Bytes>>,
}

impl<I> DemandHooks for Pump<I>
where
    I: Iterator<Item = Result<Bytes>> + Send,
{
    fn on_request(&self, n: u64) {
        let Some(emitter) = self.emitter.upgrade() else {
            return;
        };
        for _ in 0..n {
            // Take the next item without holding the lock across push
            let next = {
                let mut source = self.source.lock();
                let Some(iter) = source.as_mut() else {
                    return;
                };
                let next = iter.next();
                if !matches!(next, Some(Ok(_))) {
                    *source = None;
                }
                next
            };
            match next {
                Some(Ok(chunk)) => {
                    if !emitter.push(chunk) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    emitter.fail(e);
                    return;
                }
                None => {
                    emitter.complete();
                    return;
                }
            }
        }
    }

    fn on_cancel(&self) {
        self.source.lock().take();
    }
}

struct Lazy<F> {
    make: F,
    length: Option<u64>,
}

impl<F, I> Publisher<Bytes> for Lazy<F>
where
    F: Fn() -> I + Send + Sync,
    I: Iterator<Item = Result<Bytes>> + Send + 'static,
{
    fn subscribe(&self, subscriber: Box<dyn Subscriber<Bytes>>) {
        let emitter = Emitter::new();
        emitter.set_hooks(Arc::new(Pump {
            source: Mutex::new(Some((self.make)())),
            emitter: Arc::downgrade(&emitter),
        }));
        emitter.subscribe(subscriber);
    }
}

impl<F, I> BodyPublisher for Lazy<F>
where
    F: Fn() -> I + Send + Sync,
    I: Iterator<Item = Result<Bytes>> + Send + 'static,
{
    fn content_length(&self) -> Option<u64> {
        self.length
    }
}

/// Body pulled from a fresh iterator on every subscription
///
/// Chunks are produced only as the subscriber grants credit. An `Err`
/// item fails the subscription.
pub fn iter<F, I>(make: F) -> Body
where
    F: Fn() -> I + Send + Sync + 'static,
    I: Iterator<Item = Result<Bytes>> + Send + 'static,
{
    Arc::new(Lazy { make, length: None })
}

/// Lazy body with an explicit declared length
///
/// The declared length is trusted: sending fails with a length mismatch
/// error if the iterator yields more or fewer bytes.
pub fn iter_with_length<F, I>(make: F, length: u64) -> Body
where
    F: Fn() -> I + Send + Sync + 'static,
    I: Iterator<Item = Result<Bytes>> + Send + 'static,
{
    Arc::new(Lazy {
        make,
        length: Some(length),
    })
}

struct FileChunks {
    path: PathBuf,
    file: Option<File>,
    failed: bool,
}

impl Iterator for FileChunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.file.is_none() {
            match File::open(&self.path) {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
        let file = self.file.as_mut()?;
        let mut buf = vec![0u8; FILE_CHUNK];
        match file.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(Error::Io(e)))
            }
        }
    }
}

/// Body streamed from a file, length taken from its metadata
pub fn file(path: impl AsRef<Path>) -> Result<Body> {
    let path = path.as_ref().to_path_buf();
    let length = std::fs::metadata(&path)?.len();
    Ok(iter_with_length(
        move || FileChunks {
            path: path.clone(),
            file: None,
            failed: false,
        },
        length,
    ))
}

struct Declared {
    inner: Body,
    length: u64,
}

impl Publisher<Bytes> for Declared {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<Bytes>>) {
        self.inner.subscribe(subscriber);
    }
}

impl BodyPublisher for Declared {
    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Override the declared length of another body
pub fn declared_length(inner: Body, length: u64) -> Body {
    Arc::new(Declared { inner, length })
}

impl fmt::Debug for dyn BodyPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyPublisher")
            .field("content_length", &self.content_length())
            .finish()
    }
}
