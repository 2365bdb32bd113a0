//! The ingestion service behind the task facade: one worker actor per
//! assigned partition, a shared client pool, a shared offset tracker, and a
//! timer that makes buffer age limits fire on quiet partitions.

mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::client::IngestConnector;
use crate::config::SinkConfig;
use crate::error::Error;
use crate::metrics::SinkMetrics;
use crate::pool::ClientPool;
use crate::record::{SinkRecord, TopicPartition};
use crate::router::{DeadLetterSink, ErrorRouter};
use crate::tracker::OffsetTracker;

use self::worker::{PartitionWorker, WorkerMessage};

const TICK_FLOOR: Duration = Duration::from_millis(25);
const TICK_CEILING: Duration = Duration::from_secs(1);

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMessage>,
    join: JoinHandle<()>,
}

pub(crate) struct IngestCoordinator<C, D>
where
    C: IngestConnector,
    D: DeadLetterSink,
{
    config: SinkConfig,
    connector: Arc<C>,
    pool: Arc<ClientPool<C>>,
    tracker: OffsetTracker,
    router: Arc<ErrorRouter<D>>,
    metrics: Arc<SinkMetrics>,
    workers: Arc<RwLock<HashMap<TopicPartition, WorkerHandle>>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<C, D> IngestCoordinator<C, D>
where
    C: IngestConnector + Send + Sync + 'static,
    D: DeadLetterSink + Send + Sync + 'static,
{
    pub(crate) fn new(
        connector: Arc<C>,
        config: SinkConfig,
        dead_letter: Arc<D>,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        let pool = Arc::new(ClientPool::new(
            Arc::clone(&connector),
            config.pool.clone(),
            Arc::clone(&metrics),
        ));
        let router = Arc::new(ErrorRouter::new(
            config.tolerance,
            dead_letter,
            config.dead_letter_timeout(),
        ));
        let workers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let period = (config.buffer.max_age() / 4).clamp(TICK_FLOOR, TICK_CEILING);
        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&workers),
            period,
            cancel.child_token(),
        ));
        Self {
            config,
            connector,
            pool,
            tracker: OffsetTracker::new(),
            router,
            metrics,
            workers,
            cancel,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Starts a worker for every newly assigned partition. Already open
    /// partitions are left untouched.
    pub(crate) fn open(&self, partitions: Vec<TopicPartition>) {
        let mut workers = self.workers.write();
        for partition in partitions {
            if workers.contains_key(&partition) {
                continue;
            }
            let handle = self.spawn_worker(partition.clone());
            info!(partition = %partition, "Opened partition");
            workers.insert(partition, handle);
        }
    }

    /// Hands one record to its partition worker and waits for it to be
    /// staged. Blocks while the worker's mailbox is full, which is how flush
    /// pressure propagates back to the caller.
    pub(crate) async fn put(&self, record: SinkRecord) -> Result<()> {
        let partition = record.topic_partition();
        let tx = {
            let workers = self.workers.read();
            match workers.get(&partition) {
                Some(handle) => handle.tx.clone(),
                None => {
                    return Err(Error::Task(format!(
                        "record at offset {} for unassigned partition {partition}",
                        record.offset
                    )));
                }
            }
        };
        let (respond_to, response) = oneshot::channel();
        tx.send(WorkerMessage::Append { record, respond_to })
            .await
            .map_err(|_| {
                Error::ActorPatternRecv(format!("partition {partition} worker mailbox closed"))
            })?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    /// Latest committable offset per open partition, from the shared tracker.
    pub(crate) fn offsets(&self) -> HashMap<TopicPartition, i64> {
        self.tracker.snapshot()
    }

    /// Flushes and tears down the named partitions. The first flush failure
    /// is surfaced after every partition has been torn down; its offsets stay
    /// at the last durable value so the log redelivers from there.
    pub(crate) async fn close(&self, partitions: &[TopicPartition]) -> Result<()> {
        let mut first_error = None;
        for partition in partitions {
            let handle = { self.workers.write().remove(partition) };
            let Some(handle) = handle else {
                continue;
            };
            if let Err(e) = self.close_worker(partition, handle).await
                && first_error.is_none()
            {
                first_error = Some(e);
            }
            self.tracker.forget(partition);
            info!(partition = %partition, "Closed partition");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Final-flushes every partition within the grace period, then stops the
    /// workers, the timer and the client pool. Idempotent; a second call
    /// finds nothing to do.
    pub(crate) async fn shutdown(&self) {
        let handles: Vec<(TopicPartition, WorkerHandle)> =
            { self.workers.write().drain().collect() };
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();

        let mut responses = Vec::with_capacity(handles.len());
        let mut joins = Vec::with_capacity(handles.len());
        for (partition, handle) in handles {
            let (respond_to, response) = oneshot::channel();
            if handle
                .tx
                .try_send(WorkerMessage::Flush { respond_to })
                .is_err()
            {
                warn!(partition = %partition, "Worker mailbox full or gone at shutdown, skipping its final flush");
            } else {
                responses.push((partition, response));
            }
            joins.push(handle.join);
            // the sender drops here, closing the mailbox behind the flush
        }

        for (partition, response) in responses {
            match timeout_at(deadline, response).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!(partition = %partition, err = %e, "Final flush failed; offsets keep their last durable value");
                }
                Ok(Err(_)) => {
                    warn!(partition = %partition, "Worker dropped its final flush response");
                }
                Err(_) => {
                    warn!(partition = %partition, "Shutdown grace period expired, cancelling outstanding flushes");
                    self.cancel.cancel();
                }
            }
        }

        self.cancel.cancel();
        for result in futures::future::join_all(joins).await {
            if let Err(e) = result {
                warn!(err = %e, "Partition worker task failed to stop cleanly");
            }
        }
        let ticker = { self.ticker.lock().take() };
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        self.pool.shutdown().await;
        info!("Ingestion coordinator shut down");
    }

    fn spawn_worker(&self, partition: TopicPartition) -> WorkerHandle {
        let (tx, mailbox) = mpsc::channel(self.config.worker_mailbox);
        let worker = PartitionWorker::new(
            partition,
            mailbox,
            Arc::clone(&self.connector),
            Arc::clone(&self.pool),
            self.tracker.clone(),
            Arc::clone(&self.router),
            self.config.clone(),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        );
        let join = tokio::spawn(worker.run());
        WorkerHandle { tx, join }
    }

    async fn close_worker(&self, partition: &TopicPartition, handle: WorkerHandle) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        let flush_result = match handle.tx.send(WorkerMessage::Flush { respond_to }).await {
            Ok(()) => match response.await {
                Ok(result) => result,
                Err(e) => Err(Error::ActorPatternRecv(e.to_string())),
            },
            Err(_) => Err(Error::ActorPatternRecv(format!(
                "partition {partition} worker mailbox closed"
            ))),
        };
        drop(handle.tx);
        if let Err(e) = handle.join.await {
            warn!(partition = %partition, err = %e, "Partition worker task failed to stop cleanly");
        }
        flush_result
    }
}

/// Broadcasts [`WorkerMessage::Tick`] to every worker so age-based flushes
/// fire without fresh traffic. A full mailbox skips the tick; that worker is
/// busy flushing already.
async fn run_ticker(
    workers: Arc<RwLock<HashMap<TopicPartition, WorkerHandle>>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let senders: Vec<mpsc::Sender<WorkerMessage>> =
            { workers.read().values().map(|w| w.tx.clone()).collect() };
        for tx in senders {
            let _ = tx.try_send(WorkerMessage::Tick);
        }
    }
}
