//! Buffering front end of the pipeline
//!
//! The [`Collector`] accepts executions from any thread and hands them to
//! delivery in batches when:
//! - The buffer reaches `batch_size` (one or more whole batches)
//! - `flush_interval` elapses since the last flush (everything buffered)
//! - [`Collector::flush`] or [`Collector::shutdown`] is called
//!
//! ## Tasks
//!
//! ```text
//! record() ──► buffer ──► worker (timer / threshold) ──┐
//!                 └──────► flush() ────────────────────┴─► job channel ──► delivery task ──► Dispatcher
//! ```
//!
//! A single delivery task consumes the job channel, so batches reach the
//! endpoint (or the offline queue) in the order they were flushed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{EnvironmentProvider, ExecutionSink};
use crate::config::{CollectorConfig, Config};
use crate::error::{Error, Result};
use crate::pipeline::{DeliveryOutcome, Dispatcher, PipelineCounters, PipelineStats};
use crate::types::{TestBatch, TestExecution};

const JOB_CHANNEL_CAPACITY: usize = 64;

/// Whether `record` kept the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Accepted,
    /// Buffer full or collector shut down
    Dropped,
}

/// Outcome of the batches taken by one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushSummary {
    pub batches: usize,
    pub records: usize,
    pub delivered: usize,
    pub queued: usize,
    pub lost: usize,
}

impl FlushSummary {
    fn add(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered { records, .. } => self.delivered += records,
            DeliveryOutcome::Queued { records, .. } => self.queued += records,
            DeliveryOutcome::Lost { records } => self.lost += records,
        }
    }
}

/// Result of [`Collector::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSummary {
    /// The final flush
    pub flushed: FlushSummary,
    /// In-flight delivery was cut short and persisted
    pub timed_out: bool,
    pub stats: PipelineStats,
}

enum Job {
    Deliver {
        batch: TestBatch,
        done: Option<oneshot::Sender<DeliveryOutcome>>,
    },
    Reconcile,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Take {
    /// Only complete `batch_size` batches
    WholeBatches,
    All,
}

struct Buffer {
    records: Vec<TestExecution>,
    closed: bool,
}

/// State shared between the collector handle and its worker
struct Shared {
    config: CollectorConfig,
    buffer: Mutex<Buffer>,
    threshold: Notify,
    /// Signals an explicit flush so the worker restarts its interval
    flushed: Notify,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    /// Serializes take-and-enqueue so concurrent flushes keep buffer order
    dispatch_order: tokio::sync::Mutex<()>,
    counters: Arc<PipelineCounters>,
}

impl Shared {
    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_sender(&self) -> Option<mpsc::Sender<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close_jobs(&self) {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Move buffered records into delivery jobs.
    ///
    /// With `wait`, returns one receiver per batch carrying its outcome.
    async fn flush_buffered(&self, take: Take, wait: bool) -> Vec<oneshot::Receiver<DeliveryOutcome>> {
        let _order = self.dispatch_order.lock().await;

        let batches = {
            let mut buffer = self.lock_buffer();
            take_batches(&mut buffer.records, self.config.batch_size, take)
        };
        if batches.is_empty() {
            return Vec::new();
        }

        let Some(jobs) = self.job_sender() else {
            let records: usize = batches.iter().map(TestBatch::len).sum();
            PipelineCounters::add(&self.counters.records_lost, records);
            warn!(records, "Delivery stopped, flushed records lost");
            return Vec::new();
        };

        let mut receivers = Vec::with_capacity(batches.len());
        for batch in batches {
            PipelineCounters::add(&self.counters.batches_flushed, 1);
            debug!(batch_id = %batch.batch_id, records = batch.len(), "Flushing batch");

            let (done, receiver) = if wait {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            if let Err(mpsc::error::SendError(job)) = jobs.send(Job::Deliver { batch, done }).await {
                if let Job::Deliver { batch, .. } = job {
                    PipelineCounters::add(&self.counters.records_lost, batch.len());
                    warn!(batch_id = %batch.batch_id, records = batch.len(), "Delivery task gone, batch lost");
                }
                continue;
            }
            receivers.extend(receiver);
        }
        receivers
    }
}

fn take_batches(records: &mut Vec<TestExecution>, batch_size: usize, take: Take) -> Vec<TestBatch> {
    let count = match take {
        Take::WholeBatches => records.len() / batch_size * batch_size,
        Take::All => records.len(),
    };
    if count == 0 {
        return Vec::new();
    }

    let mut taken = records.drain(..count);
    let mut batches = Vec::with_capacity(count.div_ceil(batch_size));
    loop {
        let chunk: Vec<TestExecution> = taken.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        batches.push(TestBatch::new(chunk));
    }
    batches
}

async fn collect_outcomes(receivers: Vec<oneshot::Receiver<DeliveryOutcome>>) -> FlushSummary {
    let mut summary = FlushSummary {
        batches: receivers.len(),
        ..Default::default()
    };
    for receiver in receivers {
        match receiver.await {
            Ok(outcome) => {
                summary.records += outcome.records();
                summary.add(&outcome);
            }
            Err(_) => warn!("Delivery task ended without reporting a batch outcome"),
        }
    }
    summary
}

async fn run_worker(shared: Arc<Shared>, stop: CancellationToken) {
    let period = shared.config.flush_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = shared.threshold.notified() => {
                shared.flush_buffered(Take::WholeBatches, false).await;
                ticker.reset();
            }
            _ = shared.flushed.notified() => ticker.reset(),
            _ = ticker.tick() => {
                shared.flush_buffered(Take::All, false).await;
                if let Some(jobs) = shared.job_sender() {
                    // Skipped when delivery is backed up; the next tick retries
                    let _ = jobs.try_send(Job::Reconcile);
                }
            }
        }
    }
    debug!("Collector worker stopped");
}

async fn run_delivery(dispatcher: Arc<Dispatcher>, mut jobs: mpsc::Receiver<Job>, abort: CancellationToken) {
    dispatcher.cleanup().await;

    while let Some(job) = jobs.recv().await {
        match job {
            Job::Deliver { batch, done } => {
                let outcome = dispatcher.deliver(batch, &abort).await;
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
            Job::Reconcile => {
                dispatcher.reconcile(&abort).await;
            }
        }
    }
    debug!("Delivery task stopped");
}

/// Buffers executions and drives their delivery.
///
/// Create with [`Collector::start`] (or [`Collector::from_config`]) inside a
/// Tokio runtime and end with [`Collector::shutdown`]. Dropping a collector
/// without shutting it down stops its worker and loses buffered records.
pub struct Collector {
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    stop_worker: CancellationToken,
    abort_delivery: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Spawn the worker and delivery tasks on the current Tokio runtime.
    pub fn start(config: CollectorConfig, dispatcher: Dispatcher) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("collector must be started inside a Tokio runtime".to_string()))?;

        let dispatcher = Arc::new(dispatcher);
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);

        info!(
            batch_size = config.batch_size,
            buffer_capacity = config.buffer_capacity,
            flush_interval_ms = config.flush_interval_ms,
            "Starting collector"
        );

        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                records: Vec::with_capacity(config.batch_size),
                closed: false,
            }),
            config,
            threshold: Notify::new(),
            flushed: Notify::new(),
            jobs: Mutex::new(Some(jobs_tx)),
            dispatch_order: tokio::sync::Mutex::new(()),
            counters: Arc::clone(dispatcher.counters()),
        });

        let stop_worker = CancellationToken::new();
        let abort_delivery = CancellationToken::new();
        let delivery = runtime.spawn(run_delivery(
            Arc::clone(&dispatcher),
            jobs_rx,
            abort_delivery.clone(),
        ));
        let worker = runtime.spawn(run_worker(Arc::clone(&shared), stop_worker.clone()));

        Ok(Self {
            shared,
            dispatcher,
            stop_worker,
            abort_delivery,
            worker: Mutex::new(Some(worker)),
            delivery: Mutex::new(Some(delivery)),
        })
    }

    /// Start a collector from configuration
    ///
    /// Returns None if uploads are disabled or credentials are missing.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if !config.client.is_ready() {
            debug!("Uploads disabled or credentials missing, collector not started");
            return Ok(None);
        }
        let dispatcher = Dispatcher::from_config(config)?;
        Self::start(config.collector.clone(), dispatcher).map(Some)
    }

    /// Like [`Collector::from_config`] with a custom environment description
    pub fn from_config_with_env(config: &Config, env: &dyn EnvironmentProvider) -> Result<Option<Self>> {
        if !config.client.is_ready() {
            return Ok(None);
        }
        let dispatcher = Dispatcher::from_config_with_env(config, env)?;
        Self::start(config.collector.clone(), dispatcher).map(Some)
    }

    /// Buffer one execution. Never blocks on I/O.
    pub fn record(&self, execution: TestExecution) -> RecordStatus {
        let counters = &self.shared.counters;
        let buffered = {
            let mut buffer = self.shared.lock_buffer();
            if buffer.closed || buffer.records.len() >= self.shared.config.buffer_capacity {
                None
            } else {
                buffer.records.push(execution);
                Some(buffer.records.len())
            }
        };

        match buffered {
            Some(len) => {
                PipelineCounters::add(&counters.recorded, 1);
                if len >= self.shared.config.batch_size {
                    self.shared.threshold.notify_one();
                }
                RecordStatus::Accepted
            }
            None => {
                PipelineCounters::add(&counters.dropped, 1);
                debug!("Execution dropped, buffer full or collector closed");
                RecordStatus::Dropped
            }
        }
    }

    /// Deliver everything buffered so far and wait for the outcome.
    pub async fn flush(&self) -> FlushSummary {
        let receivers = self.shared.flush_buffered(Take::All, true).await;
        self.shared.flushed.notify_one();
        collect_outcomes(receivers).await
    }

    /// [`Collector::shutdown`] bounded by the configured `shutdown_timeout_secs`
    pub async fn close(&self) -> ShutdownSummary {
        self.shutdown(self.shared.config.shutdown_timeout()).await
    }

    /// Stop accepting records, flush, and wait up to `timeout` for delivery.
    ///
    /// Batches still undelivered at the deadline are written to the offline
    /// queue. Calling this twice is harmless; the second call flushes nothing.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownSummary {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 3600));
        {
            let mut buffer = self.shared.lock_buffer();
            if buffer.closed {
                return ShutdownSummary {
                    flushed: FlushSummary::default(),
                    timed_out: false,
                    stats: self.stats(),
                };
            }
            buffer.closed = true;
        }
        info!(
            pending = self.pending_count(),
            timeout_ms = timeout.as_millis() as u64,
            "Shutting down collector"
        );

        let watchdog = {
            let abort = self.abort_delivery.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                abort.cancel();
            })
        };

        self.stop_worker.cancel();
        let worker = lock_handle(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Collector worker failed");
            }
        }

        let receivers = self.shared.flush_buffered(Take::All, true).await;
        self.shared.close_jobs();

        let delivery = lock_handle(&self.delivery).take();
        if let Some(delivery) = delivery {
            if let Err(e) = delivery.await {
                warn!(error = %e, "Delivery task failed");
            }
        }
        watchdog.abort();

        let timed_out = self.abort_delivery.is_cancelled();
        let flushed = collect_outcomes(receivers).await;
        let stats = self.stats();

        if timed_out {
            warn!(
                queued = flushed.queued,
                "Shutdown timeout reached, undelivered batches persisted"
            );
        }
        info!(
            delivered = stats.records_delivered,
            queued = stats.records_queued,
            lost = stats.records_lost,
            dropped = stats.dropped,
            "Collector shut down"
        );

        ShutdownSummary {
            flushed,
            timed_out,
            stats,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.dispatcher.stats()
    }

    /// Records buffered and not yet flushed
    pub fn pending_count(&self) -> usize {
        self.shared.lock_buffer().records.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_buffer().closed
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

fn lock_handle(handle: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for Collector {
    fn drop(&mut self) {
        if !self.is_closed() {
            let pending = self.pending_count();
            if pending > 0 {
                warn!(pending, "Collector dropped without shutdown, buffered records lost");
            }
            self.stop_worker.cancel();
        }
    }
}

#[async_trait]
impl ExecutionSink for Collector {
    fn record(&self, execution: TestExecution) -> RecordStatus {
        Collector::record(self, execution)
    }

    async fn flush(&self) -> FlushSummary {
        Collector::flush(self).await
    }

    async fn shutdown(&self, timeout: Duration) -> ShutdownSummary {
        Collector::shutdown(self, timeout).await
    }
}

/// Synchronous wrapper for [`Collector`]
///
/// Owns a small Tokio runtime for hosts without one. Must not be created or
/// dropped from inside another runtime.
pub struct BlockingCollector {
    inner: Collector,
    runtime: tokio::runtime::Runtime,
}

impl BlockingCollector {
    pub fn start(config: CollectorConfig, dispatcher: Dispatcher) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("xping-sdk")
            .enable_all()
            .build()?;

        let inner = {
            let _guard = runtime.enter();
            Collector::start(config, dispatcher)?
        };
        Ok(Self { inner, runtime })
    }

    /// Returns None if uploads are disabled or credentials are missing.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if !config.client.is_ready() {
            return Ok(None);
        }
        let dispatcher = Dispatcher::from_config(config)?;
        Self::start(config.collector.clone(), dispatcher).map(Some)
    }

    pub fn record(&self, execution: TestExecution) -> RecordStatus {
        self.inner.record(execution)
    }

    /// Flush and wait for delivery (blocking)
    pub fn flush(&self) -> FlushSummary {
        self.runtime.block_on(self.inner.flush())
    }

    /// Shut down (blocking)
    pub fn shutdown(&self, timeout: Duration) -> ShutdownSummary {
        self.runtime.block_on(self.inner.shutdown(timeout))
    }

    /// Shut down with the configured timeout (blocking)
    pub fn close(&self) -> ShutdownSummary {
        self.runtime.block_on(self.inner.close())
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::mock::MockSender;
    use crate::queue::OfflineQueue;
    use crate::types::{fixtures, UploadErrorKind};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn collector_config(batch_size: usize, buffer_capacity: usize, flush_interval_ms: u64) -> CollectorConfig {
        CollectorConfig {
            batch_size,
            buffer_capacity,
            flush_interval_ms,
            ..Default::default()
        }
    }

    fn dispatcher(sender: Arc<MockSender>, dir: &TempDir) -> Dispatcher {
        let queue = OfflineQueue::open(dir.path(), 10_000).unwrap();
        Dispatcher::new(sender, Arc::new(queue))
    }

    fn start(sender: Arc<MockSender>, config: CollectorConfig) -> (Collector, TempDir) {
        let dir = TempDir::new().unwrap();
        let collector = Collector::start(config, dispatcher(sender, &dir)).unwrap();
        (collector, dir)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_take_batches() {
        let mut records = fixtures::executions(0..7);
        let batches = take_batches(&mut records, 3, Take::WholeBatches);
        assert_eq!(batches.iter().map(TestBatch::len).collect::<Vec<_>>(), vec![3, 3]);
        assert_eq!(records.len(), 1);

        let batches = take_batches(&mut records, 3, Take::All);
        assert_eq!(batches.len(), 1);
        assert!(records.is_empty());
        assert!(take_batches(&mut records, 3, Take::All).is_empty());
    }

    #[test]
    fn test_start_requires_runtime() {
        let dir = TempDir::new().unwrap();
        let result = Collector::start(
            CollectorConfig::default(),
            dispatcher(Arc::new(MockSender::new()), &dir),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_config_without_credentials() {
        let config = Config::default();
        assert!(Collector::from_config(&config).unwrap().is_none());
        assert!(BlockingCollector::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_threshold_flush_takes_one_full_batch() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 60_000));

        for n in 0..150 {
            assert_eq!(collector.record(fixtures::execution(n)), RecordStatus::Accepted);
        }

        wait_for(|| sender.sent_records() == 100).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 100);
        assert_eq!(collector.pending_count(), 50);
    }

    #[tokio::test]
    async fn test_timer_flushes_partial_batch() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 50));

        for n in 0..3 {
            collector.record(fixtures::execution(n));
        }

        wait_for(|| sender.sent_records() == 3).await;
        assert_eq!(collector.pending_count(), 0);
        assert_eq!(collector.stats().batches_flushed, 1);
    }

    #[tokio::test]
    async fn test_explicit_flush_restarts_interval() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 400));

        tokio::time::sleep(Duration::from_millis(300)).await;
        collector.record(fixtures::execution(0));
        assert_eq!(collector.flush().await.delivered, 1);

        // Past the original tick but inside the restarted interval
        collector.record(fixtures::execution(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(collector.pending_count(), 1);
        assert_eq!(sender.sent_records(), 1);

        wait_for(|| sender.sent_records() == 2).await;
        assert_eq!(collector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_records() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender, collector_config(10, 10, 60_000));

        let statuses: Vec<_> = (0..15).map(|n| collector.record(fixtures::execution(n))).collect();

        assert_eq!(statuses.iter().filter(|s| **s == RecordStatus::Accepted).count(), 10);
        assert_eq!(statuses[14], RecordStatus::Dropped);
        let stats = collector.stats();
        assert_eq!(stats.recorded, 10);
        assert_eq!(stats.dropped, 5);
    }

    #[tokio::test]
    async fn test_flush_reports_outcomes() {
        let sender = Arc::new(MockSender::failing(UploadErrorKind::ServerError, 1));
        let (collector, _dir) = start(sender.clone(), collector_config(10, 100, 60_000));

        for n in 0..4 {
            collector.record(fixtures::execution(n));
        }
        let summary = collector.flush().await;
        assert_eq!(
            summary,
            FlushSummary {
                batches: 1,
                records: 4,
                delivered: 0,
                queued: 4,
                lost: 0,
            }
        );

        for n in 4..6 {
            collector.record(fixtures::execution(n));
        }
        let summary = collector.flush().await;
        assert_eq!(summary.delivered, 2);
        assert_eq!(collector.dispatcher().queued_records().await.unwrap(), 4);

        assert_eq!(collector.flush().await, FlushSummary::default());
    }

    #[tokio::test]
    async fn test_flushes_keep_record_order() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 60_000));

        let executions = fixtures::executions(0..6);
        let expected: Vec<_> = executions.iter().map(|e| e.execution_id()).collect();

        let mut executions = executions.into_iter();
        for execution in executions.by_ref().take(3) {
            collector.record(execution);
        }
        collector.flush().await;
        for execution in executions {
            collector.record(execution);
        }
        collector.flush().await;

        let delivered: Vec<_> = sender
            .sent()
            .iter()
            .flat_map(|b| b.executions.iter().map(|e| e.execution_id()))
            .collect();
        assert_eq!(delivered, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_flushes_deliver_each_record_once() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(7, 1000, 20));
        let collector = Arc::new(collector);

        let mut handles = Vec::new();
        for task in 0..4i64 {
            let collector = Arc::clone(&collector);
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    collector.record(fixtures::execution(task * 100 + n));
                    if n % 5 == 0 {
                        collector.flush().await;
                    }
                }
                collector.flush().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        collector.shutdown(Duration::from_secs(5)).await;

        let ids: Vec<_> = sender
            .sent()
            .iter()
            .flat_map(|b| b.executions.iter().map(|e| e.execution_id()))
            .collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);
        assert!(sender.sent().iter().all(|b| b.len() <= 7));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 60_000));

        for n in 0..5 {
            collector.record(fixtures::execution(n));
        }
        let summary = collector.shutdown(Duration::from_secs(5)).await;

        assert!(!summary.timed_out);
        assert_eq!(summary.flushed.delivered, 5);
        assert_eq!(summary.stats.records_delivered, 5);
        assert_eq!(sender.sent_records(), 5);

        assert_eq!(collector.record(fixtures::execution(9)), RecordStatus::Dropped);
        let again = collector.shutdown(Duration::from_secs(1)).await;
        assert_eq!(again.flushed, FlushSummary::default());
    }

    #[tokio::test]
    async fn test_shutdown_timeout_persists_undelivered() {
        let sender = Arc::new(MockSender::new().with_delay(Duration::from_secs(30)));
        let (collector, dir) = start(sender.clone(), collector_config(2, 100, 60_000));

        for n in 0..5 {
            collector.record(fixtures::execution(n));
        }

        let started = std::time::Instant::now();
        let summary = collector.shutdown(Duration::from_millis(200)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.timed_out);
        assert!(sender.sent().is_empty());
        assert_eq!(summary.stats.records_queued, 5);
        assert_eq!(summary.stats.records_lost, 0);

        let queue = OfflineQueue::open(dir.path(), 10_000).unwrap();
        assert_eq!(queue.size().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_close_uses_configured_timeout() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 60_000));
        collector.record(fixtures::execution(0));

        let summary = collector.close().await;
        assert!(!summary.timed_out);
        assert_eq!(summary.flushed.delivered, 1);
        assert!(collector.is_closed());

        let slow = Arc::new(MockSender::new().with_delay(Duration::from_secs(30)));
        let config = CollectorConfig {
            shutdown_timeout_secs: 0,
            ..collector_config(100, 1000, 60_000)
        };
        let (collector, _dir) = start(slow.clone(), config);
        collector.record(fixtures::execution(1));

        let summary = collector.close().await;
        assert!(summary.timed_out);
        assert_eq!(summary.stats.records_queued, 1);
        assert!(slow.sent().is_empty());
    }

    #[tokio::test]
    async fn test_timer_reconciles_queued_records() {
        let sender = Arc::new(MockSender::new());
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path(), 10_000).unwrap());
        queue
            .enqueue(&TestBatch::new(fixtures::executions(0..3)))
            .unwrap();

        let collector = Collector::start(
            collector_config(100, 1000, 30),
            Dispatcher::new(sender.clone(), Arc::clone(&queue)),
        )
        .unwrap();

        wait_for(|| collector.stats().records_reconciled == 3).await;
        assert_eq!(sender.sent_records(), 3);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_usable_as_execution_sink() {
        let sender = Arc::new(MockSender::new());
        let (collector, _dir) = start(sender.clone(), collector_config(100, 1000, 60_000));
        let sink: Arc<dyn ExecutionSink> = Arc::new(collector);

        assert_eq!(sink.record(fixtures::execution(1)), RecordStatus::Accepted);
        let summary = sink.shutdown(Duration::from_secs(5)).await;
        assert_eq!(summary.flushed.delivered, 1);
    }

    #[test]
    fn test_blocking_collector() {
        let sender = Arc::new(MockSender::new());
        let dir = TempDir::new().unwrap();
        let collector =
            BlockingCollector::start(collector_config(100, 1000, 60_000), dispatcher(sender.clone(), &dir))
                .unwrap();

        for n in 0..3 {
            collector.record(fixtures::execution(n));
        }
        assert_eq!(collector.pending_count(), 3);

        let summary = collector.flush();
        assert_eq!(summary.delivered, 3);

        collector.record(fixtures::execution(3));
        let summary = collector.shutdown(Duration::from_secs(5));
        assert_eq!(summary.flushed.delivered, 1);
        assert_eq!(collector.stats().records_delivered, 4);
    }
}
