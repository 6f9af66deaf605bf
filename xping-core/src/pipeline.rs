//! Orchestration between the delivery client and the offline queue
//!
//! The [`Dispatcher`] owns the one rule of the pipeline: a batch that was not
//! delivered goes to disk. It also drains the queue back to the endpoint a
//! bounded slice at a time, and keeps the counters behind
//! [`crate::Collector::stats`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{EnvironmentProvider, SystemEnvironment};
use crate::config::Config;
use crate::delivery::{BatchSender, DeliveryClient};
use crate::error::{Error, Result};
use crate::queue::OfflineQueue;
use crate::types::{TestBatch, UploadErrorKind, UploadResult};

/// What happened to one batch handed to [`Dispatcher::deliver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint accepted the batch
    Delivered { records: usize, result: UploadResult },
    /// Not delivered; persisted for a later reconciliation. `error_kind` is
    /// `None` when the send was cancelled or never attempted.
    Queued {
        records: usize,
        error_kind: Option<UploadErrorKind>,
    },
    /// Not delivered and the queue refused it
    Lost { records: usize },
}

impl DeliveryOutcome {
    pub fn records(&self) -> usize {
        match self {
            DeliveryOutcome::Delivered { records, .. }
            | DeliveryOutcome::Queued { records, .. }
            | DeliveryOutcome::Lost { records } => *records,
        }
    }
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Executions accepted by `record`
    pub recorded: usize,
    /// Executions refused by `record` (buffer full or shut down)
    pub dropped: usize,
    pub batches_flushed: usize,
    pub records_delivered: usize,
    /// Uploads that returned a failed result
    pub upload_failures: usize,
    pub records_queued: usize,
    /// Records neither delivered nor accepted by the offline queue
    pub records_lost: usize,
    /// Queued records later delivered by reconciliation
    pub records_reconciled: usize,
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub recorded: AtomicUsize,
    pub dropped: AtomicUsize,
    pub batches_flushed: AtomicUsize,
    pub records_delivered: AtomicUsize,
    pub upload_failures: AtomicUsize,
    pub records_queued: AtomicUsize,
    pub records_lost: AtomicUsize,
    pub records_reconciled: AtomicUsize,
}

impl PipelineCounters {
    pub(crate) fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        PipelineStats {
            recorded: get(&self.recorded),
            dropped: get(&self.dropped),
            batches_flushed: get(&self.batches_flushed),
            records_delivered: get(&self.records_delivered),
            upload_failures: get(&self.upload_failures),
            records_queued: get(&self.records_queued),
            records_lost: get(&self.records_lost),
            records_reconciled: get(&self.records_reconciled),
        }
    }
}

/// Sends batches and falls back to the offline queue.
pub struct Dispatcher {
    sender: Arc<dyn BatchSender>,
    queue: Arc<OfflineQueue>,
    drain_batch_size: usize,
    retention: Option<Duration>,
    counters: Arc<PipelineCounters>,
}

impl Dispatcher {
    pub fn new(sender: Arc<dyn BatchSender>, queue: Arc<OfflineQueue>) -> Self {
        Self {
            sender,
            queue,
            drain_batch_size: 100,
            retention: None,
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    /// Records re-sent per reconciliation
    pub fn with_drain_batch_size(mut self, drain_batch_size: usize) -> Self {
        self.drain_batch_size = drain_batch_size.max(1);
        self
    }

    /// Queue slots older than `retention` are removed at startup
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Build the HTTP client and queue described by `config`, describing the
    /// host with [`SystemEnvironment`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_env(config, &SystemEnvironment::default())
    }

    pub fn from_config_with_env(config: &Config, env: &dyn EnvironmentProvider) -> Result<Self> {
        config.validate()?;
        let client = DeliveryClient::new(config.client.clone(), env.session_metadata())?;
        let queue = OfflineQueue::from_config(&config.queue)?;

        Ok(Self::new(Arc::new(client), Arc::new(queue))
            .with_drain_batch_size(config.queue.drain_batch_size)
            .with_retention(config.queue.retention()))
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &Arc<PipelineCounters> {
        &self.counters
    }

    /// Records waiting in the offline queue
    pub async fn queued_records(&self) -> Result<usize> {
        self.with_queue(|queue| queue.size()).await
    }

    /// Send `batch`; anything not delivered is persisted.
    ///
    /// Cancelling `cancel` abandons an in-flight send (including its retry
    /// backoff) and persists the batch. An already cancelled token persists
    /// without sending.
    pub async fn deliver(&self, batch: TestBatch, cancel: &CancellationToken) -> DeliveryOutcome {
        let records = batch.len();
        if records == 0 {
            return DeliveryOutcome::Delivered {
                records,
                result: UploadResult::success(0, None, 0),
            };
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.sender.send(&batch) => Some(result),
        };

        match result {
            Some(result) if result.success => {
                PipelineCounters::add(&self.counters.records_delivered, records);
                DeliveryOutcome::Delivered { records, result }
            }
            Some(result) => {
                PipelineCounters::add(&self.counters.upload_failures, 1);
                warn!(
                    batch_id = %batch.batch_id,
                    records,
                    kind = ?result.error_kind,
                    status = ?result.status_code,
                    attempts = result.attempts,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "Upload failed, queueing batch offline"
                );
                self.store(batch, result.error_kind).await
            }
            None => {
                info!(
                    batch_id = %batch.batch_id,
                    records,
                    "Delivery cancelled, queueing batch offline"
                );
                self.store(batch, None).await
            }
        }
    }

    /// Persist `batch` without sending it
    pub async fn persist(&self, batch: TestBatch) -> DeliveryOutcome {
        self.store(batch, None).await
    }

    /// Re-send up to `drain_batch_size` queued records as one batch.
    ///
    /// Returns how many records were delivered. On failure the records go
    /// back into the queue.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> usize {
        if cancel.is_cancelled() {
            return 0;
        }

        let drain = self.drain_batch_size;
        let executions = match self.with_queue(move |queue| queue.dequeue(drain)).await {
            Ok(executions) => executions,
            Err(e) => {
                warn!(error = %e, "Failed to read offline queue");
                return 0;
            }
        };
        if executions.is_empty() {
            return 0;
        }

        let batch = TestBatch::new(executions);
        let records = batch.len();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.sender.send(&batch) => Some(result),
        };

        match result {
            Some(result) if result.success => {
                PipelineCounters::add(&self.counters.records_reconciled, records);
                PipelineCounters::add(&self.counters.records_delivered, records);
                info!(batch_id = %batch.batch_id, records, "Reconciled queued records");
                records
            }
            other => {
                if let Some(result) = other {
                    debug!(
                        records,
                        kind = ?result.error_kind,
                        "Reconciliation upload failed, re-queueing"
                    );
                }
                self.requeue(batch).await;
                0
            }
        }
    }

    /// Remove queue slots older than the configured retention
    pub async fn cleanup(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        match self.with_queue(move |queue| queue.cleanup(retention)).await {
            Ok(0) => 0,
            Ok(removed) => {
                info!(removed, retention_secs = retention.as_secs(), "Removed expired queue slots");
                removed
            }
            Err(e) => {
                warn!(error = %e, "Offline queue cleanup failed");
                0
            }
        }
    }

    async fn store(&self, batch: TestBatch, error_kind: Option<UploadErrorKind>) -> DeliveryOutcome {
        let records = batch.len();
        let batch_id = batch.batch_id;

        match self.with_queue(move |queue| queue.enqueue(&batch)).await {
            Ok(()) => {
                PipelineCounters::add(&self.counters.records_queued, records);
                DeliveryOutcome::Queued {
                    records,
                    error_kind,
                }
            }
            Err(e) => {
                PipelineCounters::add(&self.counters.records_lost, records);
                warn!(%batch_id, records, error = %e, "Offline queue rejected batch, records lost");
                DeliveryOutcome::Lost { records }
            }
        }
    }

    /// Put records taken by reconciliation back
    async fn requeue(&self, batch: TestBatch) {
        let records = batch.len();
        if let Err(e) = self.with_queue(move |queue| queue.enqueue(&batch)).await {
            PipelineCounters::add(&self.counters.records_lost, records);
            warn!(records, error = %e, "Failed to re-queue records, records lost");
        }
    }

    async fn with_queue<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&OfflineQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("queue task failed: {}", e))))?
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::config::{ClientConfig, QueueConfig};
    use crate::types::fixtures;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer, dir: &TempDir) -> Config {
        Config {
            client: ClientConfig {
                endpoint: format!("{}/upload", server.uri()),
                api_key: Some("test-key".to_string()),
                project_id: Some("proj".to_string()),
                max_attempts: 3,
                retry_base_delay_ms: 5,
                retry_max_delay_ms: 20,
                retry_jitter_ms: 0,
                ..Default::default()
            },
            queue: QueueConfig {
                directory: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unauthorized_batch_lands_in_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::from_config(&config_for(&server, &dir)).unwrap();

        let batch = TestBatch::new(fixtures::executions(0..2));
        let outcome = dispatcher.deliver(batch.clone(), &CancellationToken::new()).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Queued {
                records: 2,
                error_kind: Some(UploadErrorKind::AuthenticationError)
            }
        );
        let queued = dispatcher.queue().dequeue(10).unwrap();
        assert_eq!(queued, batch.executions);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_queued_not_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::from_config(&config_for(&server, &dir)).unwrap();

        let outcome = dispatcher
            .deliver(TestBatch::new(fixtures::executions(0..4)), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Queued { records: 4, .. }));
        assert_eq!(dispatcher.queued_records().await.unwrap(), 4);
        assert_eq!(dispatcher.stats().records_lost, 0);
    }
}
