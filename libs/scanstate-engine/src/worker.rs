use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use scanstate_api::{
    DecodeError, Delivery, MessageSource, SourceError, StateStore, StoreError,
};

use crate::decode::decode_envelope;

/// Log target carrying dropped poison messages.
pub const POISON_TARGET: &str = "scanstate::poison";

const POISON_PREVIEW_BYTES: usize = 512;

// ═══════════════════════════════════════════════════════════════
//  Outcome / Disposition
// ═══════════════════════════════════════════════════════════════

/// Result of handling one message, before it is settled with the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Stored: first write for the key or strictly newer timestamp.
    Applied,
    /// Valid but not newer than stored state.
    Skipped,
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// How a message is settled with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// What to do with a message that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Request redelivery. A permanently malformed message keeps coming back
    /// until the source's own retry policy gives up on it.
    #[default]
    Nack,
    /// Ack the message and log it on [`POISON_TARGET`].
    Drop,
}

impl std::str::FromStr for DecodeFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nack" => Ok(DecodeFailurePolicy::Nack),
            "drop" => Ok(DecodeFailurePolicy::Drop),
            other => Err(format!("unknown decode failure policy: '{other}' (expected nack|drop)")),
        }
    }
}

/// Map a handling outcome to the ack/nack decision.
pub fn disposition(outcome: &Outcome, policy: DecodeFailurePolicy) -> Disposition {
    match outcome {
        Outcome::Applied | Outcome::Skipped => Disposition::Ack,
        Outcome::Failed(Failure::Store(_)) => Disposition::Nack,
        Outcome::Failed(Failure::Decode(_)) => match policy {
            DecodeFailurePolicy::Nack => Disposition::Nack,
            DecodeFailurePolicy::Drop => Disposition::Ack,
        },
    }
}

// ═══════════════════════════════════════════════════════════════
//  IngestStats
// ═══════════════════════════════════════════════════════════════

/// Counters shared by every worker of a supervisor.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    decode_failures: AtomicU64,
    store_failures: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    settle_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub decode_failures: u64,
    pub store_failures: u64,
    pub acked: u64,
    pub nacked: u64,
    pub settle_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Applied => &self.applied,
            Outcome::Skipped => &self.skipped,
            Outcome::Failed(Failure::Decode(_)) => &self.decode_failures,
            Outcome::Failed(Failure::Store(_)) => &self.store_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════
//  IngestionWorker
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub decode_failure: DecodeFailurePolicy,
    /// Consecutive `receive` failures after which the worker gives up.
    pub max_receive_failures: u32,
    pub receive_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            decode_failure: DecodeFailurePolicy::Nack,
            max_receive_failures: 5,
            receive_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {worker}: source failed {failures} times in a row: {source}")]
    Source {
        worker: usize,
        failures: u32,
        #[source]
        source: SourceError,
    },

    #[error("worker {worker} panicked: {detail}")]
    Panicked { worker: usize, detail: String },
}

/// Consumes deliveries: decode → upsert → ack/nack.
pub struct IngestionWorker {
    id: usize,
    store: Arc<dyn StateStore>,
    settings: WorkerSettings,
    stats: Arc<IngestStats>,
}

impl IngestionWorker {
    pub fn new(
        id: usize,
        store: Arc<dyn StateStore>,
        settings: WorkerSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self { id, store, settings, stats }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Decode and resolve one message. Touches the store only; never the source.
    pub async fn handle(&self, data: &[u8]) -> Outcome {
        let observation = match decode_envelope(data) {
            Ok(o) => o,
            Err(e) => return Outcome::Failed(Failure::Decode(e)),
        };

        match self.store.upsert(&observation).await {
            Ok(true) => {
                tracing::debug!(
                    worker = self.id,
                    key = %observation.key,
                    timestamp = observation.event_timestamp,
                    "applied observation"
                );
                Outcome::Applied
            }
            Ok(false) => {
                tracing::debug!(
                    worker = self.id,
                    key = %observation.key,
                    timestamp = observation.event_timestamp,
                    "skipped stale observation"
                );
                Outcome::Skipped
            }
            Err(e) => Outcome::Failed(Failure::Store(e)),
        }
    }

    /// Handle a delivery and settle it with the source.
    ///
    /// Always issues exactly one ack or nack, whatever the outcome.
    pub async fn process(&self, source: &dyn MessageSource, delivery: Delivery) -> Outcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let outcome = self.handle(&delivery.data).await;
        self.stats.record(&outcome);
        let action = disposition(&outcome, self.settings.decode_failure);

        if let Outcome::Failed(failure) = &outcome {
            match (failure, action) {
                (Failure::Decode(e), Disposition::Ack) => {
                    tracing::warn!(
                        target: POISON_TARGET,
                        worker = self.id,
                        ack_id = %delivery.ack_id,
                        attempt = delivery.delivery_attempt,
                        error = %e,
                        payload = %preview(&delivery.data),
                        "dropping undecodable message"
                    );
                }
                _ => {
                    tracing::warn!(
                        worker = self.id,
                        ack_id = %delivery.ack_id,
                        attempt = delivery.delivery_attempt,
                        error = %failure,
                        "failed to process message, requesting redelivery"
                    );
                }
            }
        }

        let settled = match action {
            Disposition::Ack => source.ack(&delivery.ack_id).await,
            Disposition::Nack => source.nack(&delivery.ack_id).await,
        };
        match settled {
            Ok(()) => {
                let counter = match action {
                    Disposition::Ack => &self.stats.acked,
                    Disposition::Nack => &self.stats.nacked,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Unsettled messages are redelivered by the source.
                self.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = self.id, ack_id = %delivery.ack_id, ?action, error = %e, "settle failed");
            }
        }

        outcome
    }

    /// Pull and process deliveries until cancelled or the source closes.
    ///
    /// Cancellation is only observed between messages: a received delivery
    /// is always fully processed and settled.
    pub async fn run(
        self,
        source: Arc<dyn MessageSource>,
        token: CancellationToken,
    ) -> Result<(), WorkerError> {
        tracing::info!(worker = self.id, source = %source.name(), "worker started");
        let mut failures = 0u32;

        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                r = source.receive() => r,
            };

            match received {
                Ok(Some(delivery)) => {
                    failures = 0;
                    self.process(&*source, delivery).await;
                }
                Ok(None) => {
                    tracing::info!(worker = self.id, "source closed");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.max_receive_failures {
                        tracing::error!(worker = self.id, failures, error = %e, "giving up on source");
                        return Err(WorkerError::Source { worker: self.id, failures, source: e });
                    }
                    tracing::warn!(worker = self.id, failures, error = %e, "receive failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.receive_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(worker = self.id, "worker stopped");
        Ok(())
    }
}

fn preview(data: &[u8]) -> String {
    let end = data.len().min(POISON_PREVIEW_BYTES);
    String::from_utf8_lossy(&data[..end]).into_owned()
}
