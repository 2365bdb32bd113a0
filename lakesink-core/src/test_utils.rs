//! Test doubles shared across the in-module tests: a scriptable in-memory
//! connector/client pair and an in-memory dead-letter reporter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::Result;
use crate::client::{
    ClientError, ClientResult, IngestClient, IngestConnector, InsertReport, RejectReason,
    RowRejection,
};
use crate::record::{SinkRecord, TopicPartition};
use crate::router::DeadLetterSink;

pub(crate) fn tp(topic: &str, partition: i32) -> TopicPartition {
    TopicPartition::new(topic, partition)
}

/// A record with `byte_size() == value.len()`, keeping buffer byte math in
/// tests easy to follow.
pub(crate) fn record(topic: &str, partition: i32, offset: i64, value: &str) -> SinkRecord {
    SinkRecord {
        topic: topic.into(),
        partition,
        offset,
        key: None,
        value: Bytes::copy_from_slice(value.as_bytes()),
        timestamp: None,
        headers: Arc::new(HashMap::new()),
    }
}

/// Scripted behavior for one `insert_rows` call. Calls with no script entry
/// accept the whole batch.
#[derive(Debug)]
pub(crate) enum InsertOutcome {
    Accept,
    Reject(Vec<RowRejection>),
    Fail(ClientError),
    /// Sleeps before accepting, long enough for the caller's timeout to fire.
    Hang(Duration),
}

/// Observable state shared by a [`MockConnector`] and every [`MockClient`] it
/// hands out.
#[derive(Default)]
pub(crate) struct MockState {
    connects: AtomicUsize,
    connect_failures: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    closed: Mutex<Vec<usize>>,
    ready_partitions: Mutex<Vec<TopicPartition>>,
    ready_failures: AtomicUsize,
    insert_script: Mutex<HashMap<TopicPartition, VecDeque<InsertOutcome>>>,
    inserts: Mutex<Vec<(TopicPartition, Vec<i64>)>>,
    committed: Mutex<HashMap<TopicPartition, i64>>,
}

impl MockState {
    /// Number of successful connects so far. Also the id of the next client.
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Ids of closed clients, in close order.
    pub(crate) fn closed_clients(&self) -> Vec<usize> {
        self.closed.lock().clone()
    }

    pub(crate) fn fail_next_ready(&self, n: usize) {
        self.ready_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.ready_partitions.lock().len()
    }

    pub(crate) fn script_insert(&self, partition: &TopicPartition, outcome: InsertOutcome) {
        self.insert_script
            .lock()
            .entry(partition.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Every `insert_rows` call seen so far, as (partition, offsets) pairs.
    pub(crate) fn inserted(&self) -> Vec<(TopicPartition, Vec<i64>)> {
        self.inserts.lock().clone()
    }

    pub(crate) fn insert_count(&self) -> usize {
        self.inserts.lock().len()
    }

    pub(crate) fn set_committed(&self, partition: &TopicPartition, offset: i64) {
        self.committed.lock().insert(partition.clone(), offset);
    }

    fn take_connect_failure(&self) -> bool {
        self.connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_ready_failure(&self) -> bool {
        self.ready_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    pub(crate) state: Arc<MockState>,
}

impl IngestConnector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, _name: &str) -> ClientResult<Self::Client> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.take_connect_failure() {
            return Err(ClientError::Connection {
                endpoint: "mock".to_string(),
                error: "scripted connect failure".to_string(),
            });
        }
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockClient {
            id,
            state: Arc::clone(&self.state),
        })
    }

    async fn ensure_ready(&self, partition: &TopicPartition) -> ClientResult<()> {
        self.state.ready_partitions.lock().push(partition.clone());
        if self.state.take_ready_failure() {
            return Err(ClientError::Store("scripted readiness failure".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct MockClient {
    id: usize,
    state: Arc<MockState>,
}

impl IngestClient for MockClient {
    async fn insert_rows(
        &self,
        partition: &TopicPartition,
        rows: &[SinkRecord],
    ) -> ClientResult<InsertReport> {
        let outcome = self
            .state
            .insert_script
            .lock()
            .get_mut(partition)
            .and_then(|queue| queue.pop_front());
        self.state
            .inserts
            .lock()
            .push((partition.clone(), rows.iter().map(|r| r.offset).collect()));
        match outcome {
            None | Some(InsertOutcome::Accept) => Ok(InsertReport::default()),
            Some(InsertOutcome::Reject(rejected)) => Ok(InsertReport { rejected }),
            Some(InsertOutcome::Fail(e)) => Err(e),
            Some(InsertOutcome::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(InsertReport::default())
            }
        }
    }

    async fn committed_offset(&self, partition: &TopicPartition) -> ClientResult<Option<i64>> {
        Ok(self.state.committed.lock().get(partition).copied())
    }

    async fn close(&self) -> ClientResult<()> {
        self.state.closed.lock().push(self.id);
        Ok(())
    }
}

/// Dead-letter reporter that records reports, optionally after a delay.
/// Clones share the report log, so a test can keep one half and hand the
/// other to the task builder.
#[derive(Default, Clone)]
pub(crate) struct InMemoryDeadLetter {
    delay: Option<Duration>,
    reports: Arc<Mutex<Vec<(SinkRecord, RejectReason)>>>,
}

impl InMemoryDeadLetter {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn reports(&self) -> Vec<(SinkRecord, RejectReason)> {
        self.reports.lock().clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetter {
    async fn report(&self, record: SinkRecord, reason: RejectReason) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reports.lock().push((record, reason));
        Ok(())
    }
}
