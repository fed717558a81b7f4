use std::future::Future;
use std::pin::Pin;

use crate::error::SourceError;

/// Boxed future returned by every [`MessageSource`] method.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// One delivered message awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle used to settle this delivery.
    pub ack_id: String,
    pub data: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery when the
    /// source tracks it.
    pub delivery_attempt: u32,
}

/// At-least-once message source shared by all workers of a subscription.
///
/// The source decides how messages are distributed between concurrent
/// `receive` callers and when nacked or unsettled messages come back.
/// Ordering is best effort; duplicates are possible even without a nack.
pub trait MessageSource: Send + Sync {
    /// Wait for the next delivery. `None` means the source is closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a message (it may only delay its redelivery).
    fn receive(&self) -> SourceFuture<'_, Option<Delivery>>;

    /// The message will never be redelivered.
    fn ack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()>;

    /// Request redelivery at the source's discretion.
    fn nack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()>;

    /// Stop delivering and release the connection. Idempotent.
    fn close(&self) -> SourceFuture<'_, ()>;

    /// Short name for logs (e.g. the subscription path).
    fn name(&self) -> &str;
}
