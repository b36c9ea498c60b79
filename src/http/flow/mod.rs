//! Demand-driven body streaming
//!
//! Request and response bodies move as a sequence of immutable `Bytes`
//! chunks from a `Publisher` to exactly one `Subscriber`. The subscriber
//! grants credit with `Subscription::request(n)` and the publisher never
//! emits more items than it was granted. Exactly one terminal signal
//! (`on_complete` or `on_error`) ends a subscription; `cancel` stops it early.
//!
//! The building block for every publisher in this crate is
//! [`emitter::Emitter`], a credit-guarded queue: producers push items from any
//! thread, consumers add credit from any thread, and whichever thread finds
//! both an item and credit delivers it. Signals are never delivered
//! concurrently and a subscriber may call back into its subscription from
//! inside a signal without deadlocking.
//!
//! Adapters:
//!
//! - [`transform::buffering`] coalesces chunks into fixed-size buffers
//! - [`transform::lines`] decodes text and splits it into lines
//! - [`reader::BodyReader`] turns a subscription into a blocking `io::Read`

use super::Error;
use std::sync::Arc;

pub mod body;
pub mod charset;
pub mod emitter;
pub mod reader;
pub mod transform;

pub use body::{Body, BodyPublisher};
pub use charset::Charset;
pub use emitter::Emitter;
pub use reader::{BodyReader, Lines, Pull};
pub use transform::{buffering, lines, Transform, TransformSubscriber};

/// Credit channel from a subscriber back to its publisher
pub trait Subscription: Send + Sync {
    /// Grant `n` more items; `n <= 0` fails the subscription
    fn request(&self, n: i64);

    /// Stop the subscription; idempotent
    fn cancel(&self);
}

/// Receiver of a stream of items
pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    fn on_next(&mut self, item: T);

    fn on_error(&mut self, error: Error);

    fn on_complete(&mut self);
}

/// Source of a stream of items
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Box<dyn Subscriber<T>>);
}

/// Subscription handed to rejected subscribers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: i64) {}

    fn cancel(&self) {}
}

/// Unbounded demand, the equivalent of requesting everything at once
pub const UNBOUNDED: i64 = i64::MAX;
