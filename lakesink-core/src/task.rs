//! The host-facing sink task. The host owns the log consumer; it opens
//! assigned partitions, feeds drained records to [`SinkTask::put`], commits
//! what [`SinkTask::pre_commit`] reports, and closes partitions on
//! reassignment. Everything between put and the remote store runs here.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus_client::registry::Registry;
use tracing::info;

use crate::Result;
use crate::client::IngestConnector;
use crate::config::SinkConfig;
use crate::coordinator::IngestCoordinator;
use crate::metrics::SinkMetrics;
use crate::record::{SinkRecord, TopicPartition};
use crate::router::{DeadLetterSink, LogDeadLetter};

/// Assembles a [`SinkTask`] from a connector, a config and an optional
/// dead-letter reporter. Without one, rejected records are logged through
/// [`LogDeadLetter`].
pub struct SinkTaskBuilder<C, D = LogDeadLetter> {
    connector: Arc<C>,
    config: SinkConfig,
    dead_letter: Arc<D>,
}

impl<C> SinkTaskBuilder<C, LogDeadLetter>
where
    C: IngestConnector + Send + Sync + 'static,
{
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            config: SinkConfig::default(),
            dead_letter: Arc::new(LogDeadLetter),
        }
    }
}

impl<C, D> SinkTaskBuilder<C, D>
where
    C: IngestConnector + Send + Sync + 'static,
    D: DeadLetterSink + Send + Sync + 'static,
{
    pub fn with_config(mut self, config: SinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dead_letter<D2>(self, dead_letter: D2) -> SinkTaskBuilder<C, D2>
    where
        D2: DeadLetterSink + Send + Sync + 'static,
    {
        SinkTaskBuilder {
            connector: self.connector,
            config: self.config,
            dead_letter: Arc::new(dead_letter),
        }
    }

    /// Validates the config and starts the ingestion service. The task is
    /// live from here on and must be shut down.
    pub fn build(self) -> Result<SinkTask<C, D>> {
        self.config.validate()?;
        let metrics = Arc::new(SinkMetrics::new());
        let coordinator = IngestCoordinator::new(
            self.connector,
            self.config,
            self.dead_letter,
            Arc::clone(&metrics),
        );
        info!("Sink task started");
        Ok(SinkTask {
            coordinator,
            metrics,
        })
    }
}

/// A running sink task.
pub struct SinkTask<C, D = LogDeadLetter>
where
    C: IngestConnector,
    D: DeadLetterSink,
{
    coordinator: IngestCoordinator<C, D>,
    metrics: Arc<SinkMetrics>,
}

impl<C, D> SinkTask<C, D>
where
    C: IngestConnector + Send + Sync + 'static,
    D: DeadLetterSink + Send + Sync + 'static,
{
    /// Opens newly assigned partitions. Records for partitions never opened
    /// are rejected by [`SinkTask::put`].
    pub fn open(&self, partitions: Vec<TopicPartition>) {
        self.coordinator.open(partitions);
    }

    /// Stages a batch of drained records into their partition buffers,
    /// flushing inline wherever a threshold is crossed. The call returns once
    /// every record is staged; it blocks while buffers are flushing, which is
    /// the host's signal to stop draining.
    pub async fn put(&self, records: Vec<SinkRecord>) -> Result<()> {
        for record in records {
            self.coordinator.put(record).await?;
        }
        Ok(())
    }

    /// The offsets safe to commit back to the log, one per open partition:
    /// everything below each value is durable in the store or dead-lettered.
    /// Copy-on-read; flushes keep running while the host commits.
    pub fn pre_commit(&self) -> HashMap<TopicPartition, i64> {
        self.coordinator.offsets()
    }

    /// Flushes and releases the named partitions, surfacing the first flush
    /// failure after all of them are down. Call before the log reassigns
    /// them elsewhere.
    pub async fn close(&self, partitions: &[TopicPartition]) -> Result<()> {
        self.coordinator.close(partitions).await
    }

    /// Final-flushes everything within the configured grace period and
    /// releases the remote handles. Offsets of a failed final flush stay
    /// uncommitted, so the log redelivers those records on restart.
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        info!("Sink task stopped");
    }

    /// Registers the task's metrics into the host's registry, under the
    /// `lakesink` prefix.
    pub fn register_metrics(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }
}
