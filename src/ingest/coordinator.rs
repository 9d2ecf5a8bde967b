//! Bounded-parallel dispatch of chunks to an ingest client.
//!
//! Tasks are spawned on a `JoinSet` up to the concurrency limit and each
//! one additionally holds an [`IngestScheduler`] permit while it talks to
//! the destination. Cancellation is cooperative: it is checked before a
//! task is spawned and again once its permit is granted, so tasks that
//! have not started are skipped while started ones run to completion.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::{ChunkSource, IngestClient};
use super::scheduler::IngestScheduler;
use super::{DispatchReport, FailurePolicy, IngestionOutcome, IngestionTask};
use crate::config::IngestConfig;
use crate::error::PipelineError;
use crate::streaming::Chunk;

/// Result of one spawned task.
struct TaskResult {
    outcome: IngestionOutcome,
    error: Option<PipelineError>,
}

/// Pushes chunks to an [`IngestClient`] with bounded concurrency.
pub struct IngestionCoordinator<C: IngestClient> {
    client: C,
    scheduler: IngestScheduler,
    table: String,
    compress: bool,
    policy: FailurePolicy,
    cancel: CancellationToken,
}

impl<C: IngestClient> IngestionCoordinator<C> {
    pub fn new(client: C, scheduler: IngestScheduler, table: impl Into<String>) -> Self {
        Self {
            client,
            scheduler,
            table: table.into(),
            compress: false,
            policy: FailurePolicy::FailFast,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a coordinator with its own scheduler sized from `config`.
    pub fn from_config(client: C, config: &IngestConfig) -> Result<Self, PipelineError> {
        let scheduler = IngestScheduler::new(config.max_concurrency)?;
        Ok(Self::with_shared_scheduler(client, config, scheduler))
    }

    /// Builds a coordinator whose ingestions draw on `scheduler`, which may
    /// be shared with other coordinators.
    pub fn with_shared_scheduler(
        client: C,
        config: &IngestConfig,
        scheduler: IngestScheduler,
    ) -> Self {
        Self::new(client, scheduler, config.table.clone())
            .with_compression(config.compress)
            .with_failure_policy(config.failure_policy)
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Aborts the dispatch when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Ingests every chunk.
    ///
    /// # Errors
    ///
    /// - `Cancelled` when the caller's token fired and left chunks skipped.
    /// - Under `FailFast`, the first terminal `Ingestion` failure; chunks
    ///   not yet started are skipped.
    /// - Under `BestEffort`, `AggregateIngestion` once every chunk was tried.
    ///
    /// Artifacts are left on disk in every case.
    pub async fn dispatch(&self, chunks: Vec<Chunk>) -> Result<DispatchReport, PipelineError> {
        let total = chunks.len();
        let max_jobs = self.scheduler.max_concurrent();
        // Child of the caller's token, so fail-fast never cancels the caller.
        let run = self.cancel.child_token();

        info!(
            "[INGEST] Dispatching {} chunk(s) to {} (max {} concurrent)",
            total, self.table, max_jobs
        );

        let mut pending = chunks
            .into_iter()
            .map(|chunk| IngestionTask::new(chunk, self.table.clone(), self.compress));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut outcomes: Vec<IngestionOutcome> = Vec::with_capacity(total);
        let mut failures: Vec<PipelineError> = Vec::new();

        loop {
            // Spawn tasks up to the concurrency limit
            while join_set.len() < max_jobs && !run.is_cancelled() {
                match pending.next() {
                    Some(task) => {
                        let client = self.client.clone();
                        let scheduler = self.scheduler.clone();
                        let cancel = run.clone();
                        join_set.spawn(process_task(client, scheduler, cancel, task));
                    }
                    None => break,
                }
            }

            // Nothing in flight: either all spawned and done, or cancelled
            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok(TaskResult { outcome, error }) => {
                    if let Some(e) = error {
                        warn!("[INGEST] Chunk {} failed: {}", outcome.task.dedup_key, e);
                        failures.push(e);
                        if self.policy == FailurePolicy::FailFast {
                            run.cancel();
                        }
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    warn!("[INGEST] Task join error: {:?}", e);
                    failures.push(PipelineError::Internal(format!("Ingest task join error: {}", e)));
                    if self.policy == FailurePolicy::FailFast {
                        run.cancel();
                    }
                }
            }
        }

        // Whatever was never spawned is skipped
        outcomes.extend(pending.map(IngestionOutcome::skipped));
        outcomes.sort_by_key(|o| o.task.chunk.sequence);

        let skipped = outcomes.iter().filter(|o| o.was_skipped()).count();
        let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
        info!(
            "[INGEST] Dispatch finished: {} succeeded, {} failed, {} skipped of {}",
            succeeded,
            failures.len(),
            skipped,
            total
        );

        if self.cancel.is_cancelled() && skipped > 0 {
            return Err(PipelineError::Cancelled);
        }

        let mut failures = failures.into_iter();
        match (self.policy, failures.next()) {
            (_, None) => Ok(DispatchReport { outcomes }),
            (FailurePolicy::FailFast, Some(first)) => Err(first),
            (FailurePolicy::BestEffort, Some(first)) => Err(PipelineError::AggregateIngestion {
                failed: failures.len() + 1,
                total,
                first: Box::new(first),
            }),
        }
    }
}

/// Runs one task: permit, open, ingest.
async fn process_task<C: IngestClient>(
    client: C,
    scheduler: IngestScheduler,
    cancel: CancellationToken,
    task: IngestionTask,
) -> TaskResult {
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = scheduler.acquire() => Some(permit),
    };

    let _permit = match permit {
        None => return skipped(task),
        Some(Err(e)) => return failed(task, 0, e),
        Some(Ok(p)) => p,
    };

    // Check cancellation after acquiring permit
    if cancel.is_cancelled() {
        return skipped(task);
    }

    let source = match ChunkSource::open(&task.chunk.path).await {
        Ok(source) => source,
        Err(e) => return failed(task, 0, e),
    };

    info!(
        "[INGEST] Ingesting {} ({} rows, {} bytes)",
        task.dedup_key,
        task.chunk.row_count,
        source.len()
    );

    match client.ingest(source, &task).await {
        Ok(receipt) => {
            info!(
                "[INGEST] Ingested {} after {} attempt(s){}",
                task.dedup_key,
                receipt.attempts,
                if receipt.deduplicated { " (already present)" } else { "" }
            );
            TaskResult {
                outcome: IngestionOutcome::success(task, receipt),
                error: None,
            }
        }
        Err(e) => {
            let attempts = e.attempts().unwrap_or(1);
            failed(task, attempts, e)
        }
    }
}

fn skipped(task: IngestionTask) -> TaskResult {
    TaskResult {
        outcome: IngestionOutcome::skipped(task),
        error: None,
    }
}

/// Every terminal failure surfaces as `Ingestion` naming the dedup key.
fn failed(task: IngestionTask, attempts: u32, error: PipelineError) -> TaskResult {
    let error = match error {
        e @ PipelineError::Ingestion { .. } => e,
        other => PipelineError::Ingestion {
            dedup_key: task.dedup_key.clone(),
            attempts,
            message: other.to_string(),
        },
    };
    let message = error.to_string();
    TaskResult {
        outcome: IngestionOutcome::failure(task, attempts, &message),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestReceipt;
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    /// Fake client recording dedup keys, optionally failing named chunks.
    #[derive(Clone, Default)]
    struct FakeIngestClient {
        ingested: Arc<Mutex<Vec<String>>>,
        fail_keys: Arc<HashSet<String>>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay_ms: u64,
        cancel_on_ingest: Option<CancellationToken>,
    }

    impl FakeIngestClient {
        fn failing(keys: &[&str]) -> Self {
            Self {
                fail_keys: Arc::new(keys.iter().map(|k| k.to_string()).collect()),
                ..Default::default()
            }
        }

        fn with_delay(mut self, ms: u64) -> Self {
            self.delay_ms = ms;
            self
        }

        async fn ingested(&self) -> Vec<String> {
            self.ingested.lock().await.clone()
        }
    }

    impl IngestClient for FakeIngestClient {
        fn ingest<'a>(
            &'a self,
            _source: ChunkSource,
            task: &'a IngestionTask,
        ) -> Pin<Box<dyn Future<Output = Result<IngestReceipt, PipelineError>> + Send + 'a>>
        {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.fail_keys.contains(&task.dedup_key) {
                    return Err(PipelineError::Ingestion {
                        dedup_key: task.dedup_key.clone(),
                        attempts: 4,
                        message: "HTTP 400".into(),
                    });
                }
                self.ingested.lock().await.push(task.dedup_key.clone());
                if let Some(token) = &self.cancel_on_ingest {
                    token.cancel();
                }
                Ok(IngestReceipt {
                    attempts: 1,
                    deduplicated: false,
                })
            })
        }
    }

    fn write_chunks(dir: &TempDir, n: u32) -> Vec<Chunk> {
        (0..n)
            .map(|i| {
                let path = dir.path().join(format!("calls_{}.csv", i));
                std::fs::write(&path, "h\n1\n").unwrap();
                Chunk {
                    sequence: i,
                    path,
                    row_count: 1,
                    byte_size: 4,
                    header: "h".into(),
                }
            })
            .collect()
    }

    fn coordinator(client: FakeIngestClient, max: usize) -> IngestionCoordinator<FakeIngestClient> {
        IngestionCoordinator::new(client, IngestScheduler::new(max).unwrap(), "CallDetails")
    }

    #[tokio::test]
    async fn ingests_every_chunk_with_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let client = FakeIngestClient::default();
        let report = coordinator(client.clone(), 3)
            .dispatch(write_chunks(&dir, 5))
            .await
            .unwrap();

        assert_eq!(report.total(), 5);
        assert!(report.outcomes.iter().all(|o| o.succeeded && o.attempts == 1));
        let keys: Vec<_> = report.outcomes.iter().map(|o| o.task.dedup_key.clone()).collect();
        assert_eq!(
            keys,
            (0..5).map(|i| format!("calls_{}.csv", i)).collect::<Vec<_>>()
        );
        let mut ingested = client.ingested().await;
        ingested.sort();
        assert_eq!(ingested.len(), 5);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let dir = TempDir::new().unwrap();
        let client = FakeIngestClient::default().with_delay(20);
        coordinator(client.clone(), 2)
            .dispatch(write_chunks(&dir, 6))
            .await
            .unwrap();
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_dispatch_is_ok() {
        let report = coordinator(FakeIngestClient::default(), 1)
            .dispatch(Vec::new())
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn fail_fast_returns_first_failure_and_skips_the_rest() {
        let dir = TempDir::new().unwrap();
        let client = FakeIngestClient::failing(&["calls_0.csv"]);
        let err = coordinator(client.clone(), 1)
            .dispatch(write_chunks(&dir, 4))
            .await
            .unwrap_err();

        match err {
            PipelineError::Ingestion {
                dedup_key,
                attempts,
                ..
            } => {
                assert_eq!(dedup_key, "calls_0.csv");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected Ingestion error, got {:?}", other),
        }
        assert!(client.ingested().await.is_empty());
        // Artifacts are retained.
        assert!(dir.path().join("calls_0.csv").exists());
        assert!(dir.path().join("calls_3.csv").exists());
    }

    #[tokio::test]
    async fn best_effort_attempts_everything() {
        let dir = TempDir::new().unwrap();
        let client = FakeIngestClient::failing(&["calls_1.csv", "calls_3.csv"]);
        let err = coordinator(client.clone(), 2)
            .with_failure_policy(FailurePolicy::BestEffort)
            .dispatch(write_chunks(&dir, 5))
            .await
            .unwrap_err();

        match err {
            PipelineError::AggregateIngestion { failed, total, .. } => {
                assert_eq!(failed, 2);
                assert_eq!(total, 5);
            }
            other => panic!("expected AggregateIngestion, got {:?}", other),
        }
        assert_eq!(client.ingested().await.len(), 3);
    }

    #[tokio::test]
    async fn missing_artifact_fails_its_task() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 1);
        std::fs::remove_file(&chunks[0].path).unwrap();

        let err = coordinator(FakeIngestClient::default(), 1)
            .dispatch(chunks)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn external_cancellation_skips_unstarted_chunks() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let client = FakeIngestClient::default().with_delay(50);
        let coordinator = coordinator(client.clone(), 1).with_cancellation(cancel.clone());

        let chunks = write_chunks(&dir, 5);
        let handle = tokio::spawn(async move { coordinator.dispatch(chunks).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        let ingested = client.ingested().await;
        assert!(
            !ingested.is_empty() && ingested.len() < 5,
            "expected the started chunk only, got {:?}",
            ingested
        );
    }

    #[tokio::test]
    async fn cancellation_after_last_chunk_keeps_the_report() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let client = FakeIngestClient {
            cancel_on_ingest: Some(cancel.clone()),
            ..Default::default()
        };

        let report = coordinator(client.clone(), 1)
            .with_cancellation(cancel.clone())
            .dispatch(write_chunks(&dir, 1))
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(report.total(), 1);
        assert!(report.outcomes[0].succeeded);
    }

    #[tokio::test]
    async fn shared_scheduler_caps_two_coordinators() {
        let dir = TempDir::new().unwrap();
        let scheduler = IngestScheduler::new(2).unwrap();
        let client = FakeIngestClient::default().with_delay(20);
        let config = IngestConfig {
            max_concurrency: 2,
            ..Default::default()
        };

        let a = IngestionCoordinator::with_shared_scheduler(
            client.clone(),
            &config,
            scheduler.clone(),
        );
        let b = IngestionCoordinator::with_shared_scheduler(client.clone(), &config, scheduler);
        let chunks = write_chunks(&dir, 8);
        let (first, second) = tokio::join!(
            a.dispatch(chunks[..4].to_vec()),
            b.dispatch(chunks[4..].to_vec())
        );

        assert_eq!(first.unwrap().total(), 4);
        assert_eq!(second.unwrap().total(), 4);
        assert_eq!(client.ingested().await.len(), 8);
        assert!(client.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn redispatch_uses_same_keys() {
        let dir = TempDir::new().unwrap();
        let chunks = write_chunks(&dir, 3);
        let client = FakeIngestClient::default();
        let c = coordinator(client.clone(), 2);

        let first = c.dispatch(chunks.clone()).await.unwrap();
        let second = c.dispatch(chunks).await.unwrap();
        let keys = |r: &DispatchReport| {
            r.outcomes
                .iter()
                .map(|o| o.task.dedup_key.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), keys(&second));
    }
}
