use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use scanstate_api::{MessageSource, StateStore};

use crate::worker::{IngestStats, IngestionWorker, StatsSnapshot, WorkerError, WorkerSettings};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub concurrency: usize,
    /// How long `shutdown` waits for workers to settle in-flight messages.
    pub drain_timeout: Duration,
    pub worker: WorkerSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self { concurrency: 4, drain_timeout: Duration::from_secs(10), worker: WorkerSettings::default() }
    }
}

/// Owns the worker tasks of one subscription and their shared resources.
pub struct Supervisor {
    settings: SupervisorSettings,
    store: Arc<dyn StateStore>,
    source: Arc<dyn MessageSource>,
    stats: Arc<IngestStats>,
    token: CancellationToken,
    workers: JoinSet<Result<(), WorkerError>>,
    ids: HashMap<Id, usize>,
    first_error: Option<WorkerError>,
}

impl Supervisor {
    /// Spawn `settings.concurrency` workers on the current runtime.
    pub fn start(
        settings: SupervisorSettings,
        store: Arc<dyn StateStore>,
        source: Arc<dyn MessageSource>,
    ) -> Self {
        let stats = Arc::new(IngestStats::default());
        let token = CancellationToken::new();
        let mut workers = JoinSet::new();
        let mut ids = HashMap::new();

        let concurrency = settings.concurrency.max(1);
        for id in 0..concurrency {
            let worker = IngestionWorker::new(id, store.clone(), settings.worker.clone(), stats.clone());
            let handle = workers.spawn(worker.run(source.clone(), token.clone()));
            ids.insert(handle.id(), id);
        }
        tracing::info!(
            workers = concurrency,
            source = %source.name(),
            store = %store.kind(),
            decode_failure = ?settings.worker.decode_failure,
            "supervisor started"
        );

        Self { settings, store, source, stats, token, workers, ids, first_error: None }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); child tasks may share it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Workers still running.
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Wait for `shutdown` to resolve or for every worker to end.
    ///
    /// Returns early with the first worker error. Remaining workers keep
    /// running until [`shutdown`](Self::shutdown) is called.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if self.workers.is_empty() {
                tracing::info!("all workers finished");
                return Ok(());
            }
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return Ok(());
                }
                Some(joined) = self.workers.join_next_with_id() => {
                    self.finish_worker(joined)?;
                }
            }
        }
    }

    /// Cancel workers, drain them, then close source and store.
    ///
    /// Returns the final counters, or the first worker error seen over the
    /// supervisor's lifetime.
    pub async fn shutdown(mut self) -> Result<StatsSnapshot, WorkerError> {
        self.token.cancel();

        let drain_timeout = self.settings.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = self.workers.join_next_with_id().await {
                let _ = self.finish_worker(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                timeout_ms = drain_timeout.as_millis() as u64,
                "drain timeout, aborting workers"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "source close error");
        }
        if let Err(e) = self.store.close().await {
            tracing::warn!(error = %e, "store close error");
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            received = snapshot.received,
            applied = snapshot.applied,
            skipped = snapshot.skipped,
            acked = snapshot.acked,
            nacked = snapshot.nacked,
            "supervisor stopped"
        );

        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }

    fn finish_worker(
        &mut self,
        joined: Result<(Id, Result<(), WorkerError>), JoinError>,
    ) -> Result<(), WorkerError> {
        let result = match joined {
            Ok((id, result)) => {
                self.ids.remove(&id);
                result
            }
            Err(e) => {
                let worker = self.ids.remove(&e.id()).unwrap_or_default();
                if e.is_cancelled() {
                    return Ok(());
                }
                Err(WorkerError::Panicked { worker, detail: e.to_string() })
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "worker terminated");
            if self.first_error.is_none() {
                self.first_error = Some(e.clone());
            }
        }
        result
    }
}
