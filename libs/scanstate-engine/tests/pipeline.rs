mod common;

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use scanstate_api::{
    Delivery, EntityKey, MessageSource, Observation, ObservationRecord, Page, SourceError,
    SourceFuture, StateStore, StoreError, StoreFuture, StoreKind,
};
use scanstate_engine::{
    ChannelSource, DecodeFailurePolicy, IngestStats, IngestionWorker, Supervisor,
    SupervisorSettings, WorkerError, WorkerSettings,
};
use scanstate_storage_memory::MemoryStore;

use common::{shuffle, v2_envelope};

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn settings(policy: DecodeFailurePolicy) -> WorkerSettings {
    WorkerSettings {
        decode_failure: policy,
        max_receive_failures: 3,
        receive_backoff: Duration::from_millis(1),
    }
}

/// Blocks every upsert until a permit is released.
struct GatedStore {
    inner: MemoryStore,
    entered: Notify,
    release: Semaphore,
}

impl GatedStore {
    fn new() -> Self {
        Self { inner: MemoryStore::default(), entered: Notify::new(), release: Semaphore::new(0) }
    }
}

impl StateStore for GatedStore {
    fn upsert<'a>(&'a self, observation: &'a Observation) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.entered.notify_one();
            let _permit = self.release.acquire().await.map_err(|_| StoreError::Closed)?;
            self.inner.upsert(observation).await
        })
    }

    fn get<'a>(&'a self, key: &'a EntityKey) -> StoreFuture<'a, Option<ObservationRecord>> {
        self.inner.get(key)
    }

    fn list(&self, page: Page) -> StoreFuture<'_, Vec<ObservationRecord>> {
        self.inner.list(page)
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        self.inner.close()
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }
}

/// Every receive fails.
struct BrokenSource;

impl MessageSource for BrokenSource {
    fn receive(&self) -> SourceFuture<'_, Option<Delivery>> {
        Box::pin(async { Err(SourceError::Unavailable("connection refused".into())) })
    }

    fn ack<'a>(&'a self, _ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn nack<'a>(&'a self, _ack_id: &'a str) -> SourceFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> SourceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

// ═══════════════════════════════════════════════════════════════
//  Worker
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn undecodable_message_is_nacked_by_default() {
    let (source, publisher) = ChannelSource::new();
    let source = Arc::new(source);
    publisher.publish("not json").unwrap();

    let stats = Arc::new(IngestStats::default());
    let worker = IngestionWorker::new(0, Arc::new(MemoryStore::default()), settings(DecodeFailurePolicy::Nack), stats.clone());
    let token = CancellationToken::new();
    let task = tokio::spawn(worker.run(source.clone(), token.clone()));

    wait_for("redeliveries", || stats.snapshot().nacked >= 3).await;
    token.cancel();
    task.await.unwrap().unwrap();

    let s = stats.snapshot();
    assert_eq!(s.acked, 0);
    assert_eq!(s.decode_failures, s.received);
    assert_eq!(source.in_flight(), 0);
    assert_eq!(source.pending(), 1);
}

#[tokio::test]
async fn undecodable_message_is_dropped_by_policy() {
    let (source, publisher) = ChannelSource::new();
    let source = Arc::new(source);
    publisher.publish("not json").unwrap();
    publisher.publish(v2_envelope("1.1.1.1", 80, "HTTP", 1, "ok")).unwrap();
    publisher.finish();

    let stats = Arc::new(IngestStats::default());
    let store = Arc::new(MemoryStore::default());
    let worker = IngestionWorker::new(0, store.clone(), settings(DecodeFailurePolicy::Drop), stats.clone());
    worker.run(source.clone(), CancellationToken::new()).await.unwrap();

    let s = stats.snapshot();
    assert_eq!((s.received, s.acked, s.nacked), (2, 2, 0));
    assert_eq!((s.decode_failures, s.applied), (1, 1));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn store_failure_is_nacked() {
    let (source, publisher) = ChannelSource::new();
    let source = Arc::new(source);
    publisher.publish(v2_envelope("1.1.1.1", 80, "HTTP", 1, "ok")).unwrap();

    let store = Arc::new(MemoryStore::default());
    store.close().await.unwrap();
    let stats = Arc::new(IngestStats::default());
    let worker = IngestionWorker::new(0, store, settings(DecodeFailurePolicy::Drop), stats.clone());
    let token = CancellationToken::new();
    let task = tokio::spawn(worker.run(source.clone(), token.clone()));

    wait_for("nack", || stats.snapshot().nacked >= 1).await;
    token.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(stats.snapshot().acked, 0);
    assert!(stats.snapshot().store_failures >= 1);
    assert_eq!(source.pending(), 1);
}

#[tokio::test]
async fn cancellation_finishes_in_flight_message() {
    let (source, publisher) = ChannelSource::new();
    let source = Arc::new(source);
    publisher.publish(v2_envelope("1.1.1.1", 80, "HTTP", 42, "in flight")).unwrap();
    publisher.publish(v2_envelope("1.1.1.1", 81, "HTTP", 43, "never received")).unwrap();

    let store = Arc::new(GatedStore::new());
    let stats = Arc::new(IngestStats::default());
    let worker = IngestionWorker::new(0, store.clone(), settings(DecodeFailurePolicy::Nack), stats.clone());
    let token = CancellationToken::new();
    let task = tokio::spawn(worker.run(source.clone(), token.clone()));

    store.entered.notified().await;
    token.cancel();
    store.release.add_permits(1);
    task.await.unwrap().unwrap();

    let s = stats.snapshot();
    assert_eq!((s.received, s.applied, s.acked), (1, 1, 1));
    assert_eq!(source.in_flight(), 0);
    assert_eq!(source.pending(), 1);
    let rec = store.get(&EntityKey::new("1.1.1.1", 80, "HTTP")).await.unwrap().unwrap();
    assert_eq!(rec.payload, "in flight");
}

#[tokio::test]
async fn repeated_receive_failures_end_worker() {
    let worker = IngestionWorker::new(
        7,
        Arc::new(MemoryStore::default()),
        settings(DecodeFailurePolicy::Nack),
        Arc::new(IngestStats::default()),
    );
    let err = worker.run(Arc::new(BrokenSource), CancellationToken::new()).await.unwrap_err();
    match err {
        WorkerError::Source { worker, failures, source } => {
            assert_eq!((worker, failures), (7, 3));
            assert_eq!(source, SourceError::Unavailable("connection refused".into()));
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Supervisor
// ═══════════════════════════════════════════════════════════════

fn supervisor_settings(concurrency: usize) -> SupervisorSettings {
    SupervisorSettings {
        concurrency,
        drain_timeout: Duration::from_secs(5),
        worker: settings(DecodeFailurePolicy::Nack),
    }
}

#[tokio::test]
async fn supervisor_runs_until_source_is_exhausted() {
    let (source, publisher) = ChannelSource::new();
    for ts in [1000, 2000, 500, 1500, 3000] {
        publisher.publish(v2_envelope("1.1.1.1", 80, "HTTP", ts, &format!("r{ts}"))).unwrap();
    }
    publisher.publish(v2_envelope("2.2.2.2", 22, "SSH", 5, "ssh")).unwrap();
    publisher.finish();

    let store = Arc::new(MemoryStore::default());
    let mut supervisor = Supervisor::start(supervisor_settings(4), store.clone(), Arc::new(source));
    assert_eq!(supervisor.running(), 4);

    supervisor.run_until(future::pending()).await.unwrap();
    let rec = store.get(&EntityKey::new("1.1.1.1", 80, "HTTP")).await.unwrap().unwrap();
    assert_eq!((rec.event_timestamp, rec.payload.as_str()), (3000, "r3000"));
    assert_eq!(store.len().await, 2);

    let s = supervisor.shutdown().await.unwrap();
    assert_eq!(s.received, 6);
    assert_eq!(s.acked, 6);
    assert_eq!(s.applied + s.skipped, 6);
}

#[tokio::test]
async fn shutdown_closes_source_and_store() {
    let (source, publisher) = ChannelSource::new();
    let store = Arc::new(MemoryStore::default());
    let mut supervisor = Supervisor::start(supervisor_settings(2), store.clone(), Arc::new(source));

    supervisor.run_until(future::ready(())).await.unwrap();
    let s = supervisor.shutdown().await.unwrap();

    assert_eq!(s.received, 0);
    assert!(publisher.publish("late").is_err());
    assert_eq!(store.get(&EntityKey::new("a", 1, "b")).await.unwrap_err(), StoreError::Closed);
}

#[tokio::test]
async fn worker_failure_is_reported() {
    let store = Arc::new(MemoryStore::default());
    let mut supervisor = Supervisor::start(supervisor_settings(2), store, Arc::new(BrokenSource));

    let err = supervisor.run_until(future::pending()).await.unwrap_err();
    assert!(matches!(err, WorkerError::Source { failures: 3, .. }));

    let again = supervisor.shutdown().await.unwrap_err();
    assert_eq!(again, err);
}

#[tokio::test]
async fn drain_timeout_aborts_stuck_workers() {
    let (source, publisher) = ChannelSource::new();
    let source = Arc::new(source);
    publisher.publish(v2_envelope("1.1.1.1", 80, "HTTP", 1, "stuck")).unwrap();

    let store = Arc::new(GatedStore::new());
    let settings = SupervisorSettings { drain_timeout: Duration::from_millis(50), ..supervisor_settings(1) };
    let supervisor = Supervisor::start(settings, store.clone(), source.clone());

    store.entered.notified().await;
    let s = supervisor.shutdown().await.unwrap();

    assert_eq!((s.received, s.acked, s.nacked), (1, 0, 0));
    // Never settled: a real broker would redeliver after its ack deadline.
    assert_eq!(source.in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_converge_to_max_timestamp() {
    for seed in [1u64, 7, 42] {
        let mut messages = Vec::new();
        for key in 0..20u32 {
            for ts in 0..25i64 {
                let ts = (ts * 37 + key as i64 * 11) % 997;
                messages.push((key, ts));
                // Duplicates, as after a redelivery.
                if ts % 5 == 0 {
                    messages.push((key, ts));
                }
            }
        }
        shuffle(&mut messages, seed);

        let (source, publisher) = ChannelSource::new();
        for (key, ts) in &messages {
            publisher.publish(v2_envelope("10.0.0.1", *key, "SVC", *ts, &format!("{key}@{ts}"))).unwrap();
        }
        publisher.finish();

        let store = Arc::new(MemoryStore::new(4));
        let mut supervisor = Supervisor::start(supervisor_settings(8), store.clone(), Arc::new(source));
        supervisor.run_until(future::pending()).await.unwrap();

        for key in 0..20u32 {
            let expected = messages.iter().filter(|(k, _)| *k == key).map(|(_, ts)| *ts).max().unwrap();
            let rec = store.get(&EntityKey::new("10.0.0.1", key, "SVC")).await.unwrap().unwrap();
            assert_eq!(rec.event_timestamp, expected, "seed {seed} key {key}");
            assert_eq!(rec.payload, format!("{key}@{expected}"));
        }

        let s = supervisor.shutdown().await.unwrap();
        assert_eq!(s.acked as usize, messages.len());
        assert_eq!(s.applied + s.skipped, s.received);
    }
}
