use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use scanstate_api::{Delivery, MessageSource, SourceError, SourceFuture};

// ═══════════════════════════════════════════════════════════════
//  ChannelSource: in-process at-least-once queue
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Message>,
    in_flight: HashMap<String, Message>,
    next_id: u64,
    /// No more publishes; receivers see `None` once nothing is left to redeliver.
    finished: bool,
    /// Receivers see `None` immediately.
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Queue with ack tracking.
///
/// Every delivery stays in flight until acked. A nacked delivery goes to the
/// back of the queue with `delivery_attempt + 1` and a fresh ack id.
pub struct ChannelSource {
    shared: Arc<Shared>,
    name: String,
}

/// Publishing half of a [`ChannelSource`]. Cloneable.
#[derive(Clone)]
pub struct ChannelPublisher {
    shared: Arc<Shared>,
}

impl ChannelSource {
    pub fn new() -> (Self, ChannelPublisher) {
        Self::named("channel")
    }

    pub fn named(name: impl Into<String>) -> (Self, ChannelPublisher) {
        let shared = Arc::new(Shared { state: Mutex::new(State::default()), notify: Notify::new() });
        let publisher = ChannelPublisher { shared: shared.clone() };
        (Self { shared, name: name.into() }, publisher)
    }

    /// Messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Deliveries received but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Return every unsettled delivery to the queue, as a broker does when
    /// the ack deadline passes.
    pub fn expire_in_flight(&self) -> usize {
        let mut state = self.shared.lock();
        let expired: Vec<Message> = state.in_flight.drain().map(|(_, m)| m).collect();
        let n = expired.len();
        for mut msg in expired {
            msg.attempt += 1;
            state.queue.push_back(msg);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        n
    }

    fn settle(&self, ack_id: &str, redeliver: bool) -> Result<(), SourceError> {
        let mut state = self.shared.lock();
        let Some(mut msg) = state.in_flight.remove(ack_id) else {
            return Err(SourceError::Settle {
                ack_id: ack_id.to_string(),
                detail: "unknown or already settled ack id".into(),
            });
        };
        if redeliver {
            msg.attempt += 1;
            state.queue.push_back(msg);
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl MessageSource for ChannelSource {
    fn receive(&self) -> SourceFuture<'_, Option<Delivery>> {
        Box::pin(async move {
            loop {
                // Register interest before looking at the state so a publish
                // between the check and the await is not missed.
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = self.shared.lock();
                    if state.closed {
                        return Ok(None);
                    }
                    if let Some(msg) = state.queue.pop_front() {
                        state.next_id += 1;
                        let ack_id = format!("{}-{}", self.name, state.next_id);
                        let delivery = Delivery {
                            ack_id: ack_id.clone(),
                            data: msg.data.clone(),
                            delivery_attempt: msg.attempt,
                        };
                        state.in_flight.insert(ack_id, msg);
                        return Ok(Some(delivery));
                    }
                    if state.finished && state.in_flight.is_empty() {
                        return Ok(None);
                    }
                }

                notified.await;
            }
        })
    }

    fn ack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async move { self.settle(ack_id, false) })
    }

    fn nack<'a>(&'a self, ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async move { self.settle(ack_id, true) })
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            self.shared.lock().closed = true;
            self.shared.notify.notify_waiters();
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl ChannelPublisher {
    pub fn publish(&self, data: impl Into<Vec<u8>>) -> Result<(), SourceError> {
        let mut state = self.shared.lock();
        if state.closed || state.finished {
            return Err(SourceError::Unavailable("channel no longer accepts messages".into()));
        }
        state.queue.push_back(Message { data: data.into(), attempt: 1 });
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Stop accepting messages. Receivers drain what is queued or in flight
    /// and then see the end of the stream.
    pub fn finish(&self) {
        self.shared.lock().finished = true;
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn ack_removes_message() {
        let (source, publisher) = ChannelSource::new();
        publisher.publish("a").unwrap();

        let d = source.receive().await.unwrap().unwrap();
        assert_eq!(d.data, b"a");
        assert_eq!(d.delivery_attempt, 1);
        assert_eq!(source.in_flight(), 1);

        source.ack(&d.ack_id).await.unwrap();
        assert_eq!(source.in_flight(), 0);
        assert_eq!(source.pending(), 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let (source, publisher) = ChannelSource::new();
        publisher.publish("a").unwrap();

        let first = source.receive().await.unwrap().unwrap();
        source.nack(&first.ack_id).await.unwrap();

        let second = source.receive().await.unwrap().unwrap();
        assert_eq!(second.data, b"a");
        assert_eq!(second.delivery_attempt, 2);
        assert_ne!(first.ack_id, second.ack_id);
    }

    #[tokio::test]
    async fn unknown_ack_id_is_settle_error() {
        let (source, _publisher) = ChannelSource::new();
        let err = source.ack("nope").await.unwrap_err();
        assert!(matches!(err, SourceError::Settle { ref ack_id, .. } if ack_id == "nope"));
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let (source, publisher) = ChannelSource::new();
        publisher.publish("a").unwrap();
        let d = source.receive().await.unwrap().unwrap();
        source.ack(&d.ack_id).await.unwrap();
        assert!(source.ack(&d.ack_id).await.is_err());
    }

    #[tokio::test]
    async fn finish_ends_stream_after_in_flight_settles() {
        let (source, publisher) = ChannelSource::new();
        publisher.publish("a").unwrap();
        publisher.finish();
        assert!(publisher.publish("b").is_err());

        let d = source.receive().await.unwrap().unwrap();
        source.nack(&d.ack_id).await.unwrap();
        let d = source.receive().await.unwrap().unwrap();
        source.ack(&d.ack_id).await.unwrap();

        assert_eq!(source.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let (source, publisher) = ChannelSource::new();
        let source = Arc::new(source);

        let rx = source.clone();
        let waiter = tokio::spawn(async move { rx.receive().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish("late").unwrap();

        let d = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(d.data, b"late");
    }

    #[tokio::test]
    async fn close_wakes_receivers() {
        let (source, _publisher) = ChannelSource::new();
        let source = Arc::new(source);

        let rx = source.clone();
        let waiter = tokio::spawn(async move { rx.receive().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.close().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_receive_loses_nothing() {
        let (source, publisher) = ChannelSource::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), source.receive()).await;
        assert!(timed_out.is_err());

        publisher.publish("kept").unwrap();
        let d = source.receive().await.unwrap().unwrap();
        assert_eq!(d.data, b"kept");
    }

    #[tokio::test]
    async fn expire_returns_unsettled() {
        let (source, publisher) = ChannelSource::new();
        publisher.publish("a").unwrap();
        publisher.publish("b").unwrap();
        let _a = source.receive().await.unwrap().unwrap();

        assert_eq!(source.expire_in_flight(), 1);
        assert_eq!(source.pending(), 2);

        let b = source.receive().await.unwrap().unwrap();
        let a = source.receive().await.unwrap().unwrap();
        assert_eq!((b.data.as_slice(), b.delivery_attempt), (&b"b"[..], 1));
        assert_eq!((a.data.as_slice(), a.delivery_attempt), (&b"a"[..], 2));
    }
}
