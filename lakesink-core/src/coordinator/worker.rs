//! The per-partition worker actor. Owns the partition's buffer and runs the
//! whole flush path inline: drain, readiness, handle acquisition, bounded
//! insert, rejection routing, offset advance. One message at a time, so the
//! buffer and the offset advance never race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::buffer::PartitionBuffer;
use crate::client::{IngestClient, IngestConnector, InsertReport, RejectReason};
use crate::config::SinkConfig;
use crate::error::Error;
use crate::metrics::{SinkMetrics, partition_labels};
use crate::pool::ClientPool;
use crate::record::{SinkRecord, TopicPartition};
use crate::router::{DeadLetterSink, ErrorRouter};
use crate::tracker::OffsetTracker;

pub(super) enum WorkerMessage {
    Append {
        record: SinkRecord,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// Timer tick; flushes when the buffer has aged past its limit.
    Tick,
    /// Drains and flushes whatever is pending, used on close and shutdown.
    Flush {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

pub(super) struct PartitionWorker<C, D>
where
    C: IngestConnector,
    D: DeadLetterSink,
{
    partition: TopicPartition,
    mailbox: mpsc::Receiver<WorkerMessage>,
    buffer: PartitionBuffer,
    connector: Arc<C>,
    pool: Arc<ClientPool<C>>,
    tracker: OffsetTracker,
    router: Arc<ErrorRouter<D>>,
    config: SinkConfig,
    metrics: Arc<SinkMetrics>,
    labels: Vec<(String, String)>,
    /// Destination verified writable. Cleared when the store rejects rows as
    /// malformed, so the next flush re-checks before sending.
    ready: bool,
    /// Ask the store for its committed offset before the next insert. Set on
    /// start and whenever a handle is invalidated mid-batch, where rows may
    /// have landed without an acknowledged report.
    reconcile: bool,
    /// First terminal failure (flush gave up, or the buffer ceiling was
    /// breached); every later call fails fast with a clone until the
    /// partition is closed.
    poisoned: Option<Error>,
    cancel: CancellationToken,
}

impl<C, D> PartitionWorker<C, D>
where
    C: IngestConnector,
    D: DeadLetterSink,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        partition: TopicPartition,
        mailbox: mpsc::Receiver<WorkerMessage>,
        connector: Arc<C>,
        pool: Arc<ClientPool<C>>,
        tracker: OffsetTracker,
        router: Arc<ErrorRouter<D>>,
        config: SinkConfig,
        metrics: Arc<SinkMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = PartitionBuffer::new(partition.clone(), config.buffer.clone());
        let labels = partition_labels(&partition);
        Self {
            partition,
            mailbox,
            buffer,
            connector,
            pool,
            tracker,
            router,
            config,
            metrics,
            labels,
            ready: false,
            reconcile: true,
            poisoned: None,
            cancel,
        }
    }

    pub(super) async fn run(mut self) {
        info!(partition = %self.partition, "Partition worker started");
        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
        info!(partition = %self.partition, "Partition worker stopped");
    }

    async fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Append { record, respond_to } => {
                let result = self.handle_append(record).await;
                let _ = respond_to.send(result);
            }
            WorkerMessage::Tick => {
                if self.poisoned.is_none()
                    && self.buffer.should_flush()
                    && let Err(e) = self.flush().await
                {
                    self.poison(e);
                }
            }
            WorkerMessage::Flush { respond_to } => {
                let result = match &self.poisoned {
                    Some(e) => Err(e.clone()),
                    None => {
                        let result = self.flush().await;
                        if let Err(ref e) = result {
                            self.poison(e.clone());
                        }
                        result
                    }
                };
                let _ = respond_to.send(result);
            }
        }
    }

    async fn handle_append(&mut self, record: SinkRecord) -> Result<()> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        if let Err(e) = self.buffer.append(record) {
            // A caller that outran acknowledgement; terminal for the partition.
            self.poison(e.clone());
            return Err(e);
        }
        self.metrics
            .records_buffered
            .get_or_create(&self.labels)
            .inc();
        if self.buffer.should_flush()
            && let Err(e) = self.flush().await
        {
            self.poison(e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn poison(&mut self, error: Error) {
        error!(partition = %self.partition, err = %error, "Partition failed; rejecting traffic until close");
        self.poisoned = Some(error);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let records = self.buffer.drain()?;
        let result = self.flush_batch(records).await;
        self.buffer.mark_flush_complete();
        result
    }

    /// Pushes one drained batch to completion: every record either accepted
    /// by the store, dead-lettered, or requeued into the buffer on giving up.
    async fn flush_batch(&mut self, mut records: Vec<SinkRecord>) -> Result<()> {
        let Some(batch_last_offset) = records.last().map(|r| r.offset) else {
            return Ok(());
        };
        let mut delays = self
            .config
            .retry
            .backoff
            .delays(self.config.retry.max_flush_attempts.saturating_sub(1));
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.metrics.flush_attempts.get_or_create(&self.labels).inc();
            // The insert races shutdown; a cancelled worker requeues and
            // returns instead of waiting out a slow store call.
            let cancel = self.cancel.clone();
            let attempt_result = tokio::select! {
                result = self.attempt_insert(&mut records) => result,
                _ = cancel.cancelled() => {
                    self.buffer.requeue(records);
                    return Err(Error::Task(format!(
                        "partition {}: flush cancelled during shutdown",
                        self.partition
                    )));
                }
            };
            let failure = match attempt_result {
                Ok(report) => {
                    let sent = std::mem::take(&mut records);
                    match self.settle(sent, report, batch_last_offset).await {
                        Ok(retry) if retry.is_empty() => return Ok(()),
                        Ok(retry) => {
                            records = retry;
                            format!("{} rows transiently refused", records.len())
                        }
                        // fatal or untolerated malformed rows: nothing to requeue,
                        // redelivery after restart covers the rest of the batch
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    self.metrics.flush_failures.get_or_create(&self.labels).inc();
                    if !e.is_retryable() {
                        self.buffer.requeue(records);
                        return Err(e);
                    }
                    e.to_string()
                }
            };
            match delays.next() {
                Some(delay) => {
                    warn!(
                        partition = %self.partition,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %failure,
                        "Flush attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.buffer.requeue(records);
                            return Err(Error::Task(format!(
                                "partition {}: flush cancelled during shutdown",
                                self.partition
                            )));
                        }
                    }
                }
                None => {
                    self.buffer.requeue(records);
                    return Err(Error::RetriesExhausted(format!(
                        "partition {}: {attempt} flush attempts failed, last: {failure}",
                        self.partition
                    )));
                }
            }
        }
    }

    /// One insert attempt against the pooled handle. Transport-class failures
    /// invalidate the handle and flag the partition for offset reconciliation,
    /// since rows of the failed call may still land.
    async fn attempt_insert(&mut self, records: &mut Vec<SinkRecord>) -> Result<InsertReport> {
        if !self.ready {
            if let Err(e) = self.connector.ensure_ready(&self.partition).await {
                let msg = format!("partition {} readiness: {e}", self.partition);
                return Err(if e.is_retryable() {
                    Error::FlushTransport(msg)
                } else {
                    Error::Task(msg)
                });
            }
            self.ready = true;
        }

        let handle = self.pool.acquire(&self.partition).await?;

        if self.reconcile {
            match handle.client().committed_offset(&self.partition).await {
                Err(e) => {
                    self.pool.invalidate(&handle);
                    let msg = format!("partition {} offset reconciliation: {e}", self.partition);
                    return Err(if e.is_retryable() {
                        Error::FlushTransport(msg)
                    } else {
                        Error::Task(msg)
                    });
                }
                Ok(Some(committed)) => {
                    let before = records.len();
                    records.retain(|r| r.offset > committed);
                    if before != records.len() {
                        info!(
                            partition = %self.partition,
                            committed,
                            dropped = before - records.len(),
                            "Dropped rows already durable in the store"
                        );
                    }
                    let next = committed + 1;
                    if self
                        .tracker
                        .committed(&self.partition)
                        .is_none_or(|stored| next > stored)
                    {
                        self.tracker.advance(&self.partition, next)?;
                    }
                }
                Ok(None) => {}
            }
            self.reconcile = false;
            if records.is_empty() {
                return Ok(InsertReport::default());
            }
        }

        let started = Instant::now();
        match timeout(
            self.config.flush_timeout(),
            handle.client().insert_rows(&self.partition, records),
        )
        .await
        {
            Err(_) => {
                self.pool.invalidate(&handle);
                self.reconcile = true;
                Err(Error::FlushTransport(format!(
                    "partition {}: insert of {} rows timed out after {}ms",
                    self.partition,
                    records.len(),
                    self.config.flush_timeout_ms
                )))
            }
            Ok(Err(e)) => {
                self.pool.invalidate(&handle);
                self.reconcile = true;
                let msg = format!("partition {}: {e}", self.partition);
                Err(if e.is_retryable() {
                    Error::FlushTransport(msg)
                } else {
                    Error::Task(msg)
                })
            }
            Ok(Ok(report)) => {
                self.metrics
                    .flush_time
                    .get_or_create(&self.labels)
                    .observe(started.elapsed().as_secs_f64());
                Ok(report)
            }
        }
    }

    /// Splits a report into accepted, dead-lettered and to-retry rows, then
    /// advances the committable offset to the first row still owed to the
    /// store, or past the batch when nothing is owed.
    async fn settle(
        &mut self,
        sent: Vec<SinkRecord>,
        report: InsertReport,
        batch_last_offset: i64,
    ) -> Result<Vec<SinkRecord>> {
        if sent.is_empty() {
            // reconciliation found the whole batch already durable and has
            // advanced the tracker itself
            return Ok(Vec::new());
        }
        let total = sent.len();
        let mut rejected_by_index: HashMap<usize, RejectReason> =
            HashMap::with_capacity(report.rejected.len());
        for rejection in report.rejected {
            if rejection.index >= total {
                return Err(Error::Task(format!(
                    "partition {}: store rejected row {} of a {total}-row batch",
                    self.partition, rejection.index
                )));
            }
            rejected_by_index.insert(rejection.index, rejection.reason);
        }

        let mut accepted = 0u64;
        let mut rejections = Vec::with_capacity(rejected_by_index.len());
        for (index, record) in sent.into_iter().enumerate() {
            match rejected_by_index.remove(&index) {
                Some(reason) => rejections.push((record, reason)),
                None => accepted += 1,
            }
        }

        let routed = self.router.route(rejections).await?;
        if routed.saw_malformed {
            // the destination may need repair before it accepts anything else
            self.ready = false;
        }
        if accepted > 0 {
            self.metrics
                .records_flushed
                .get_or_create(&self.labels)
                .inc_by(accepted);
        }
        if routed.dead_lettered > 0 {
            self.metrics
                .records_dead_lettered
                .get_or_create(&self.labels)
                .inc_by(routed.dead_lettered as u64);
        }

        let next = match routed.retry.first() {
            Some(record) => record.offset,
            None => batch_last_offset + 1,
        };
        self.tracker.advance(&self.partition, next)?;
        Ok(routed.retry)
    }
}
