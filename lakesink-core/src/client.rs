//! The seam to the remote analytical store. The core never speaks the store's
//! wire protocol; it drives these traits and interprets the per-row
//! [`InsertReport`] they return. Hosts implement [`IngestConnector`] over the
//! store's SDK and hand it to the task builder.

use std::fmt;

use thiserror::Error;

use crate::record::{SinkRecord, TopicPartition};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the remote store integration. Retryability drives the
/// flush loop: retryable errors invalidate the handle and are re-attempted
/// with backoff, the rest fail the owning partition.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Connecting to {endpoint}: {error}")]
    Connection { endpoint: String, error: String },

    #[error("Transport - {0}")]
    Transport(String),

    #[error("Authentication - {0}")]
    Auth(String),

    #[error("Store - {0}")]
    Store(String),
}

impl ClientError {
    /// Whether another attempt against a fresh handle can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClientError::Auth(_))
    }
}

/// Why the store refused a single row of an otherwise successful insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The row can never be accepted (schema mismatch, unparseable payload).
    /// Routed by the error tolerance policy.
    Malformed(String),
    /// The row was refused by a condition that can clear (row-level
    /// throttling). Requeued and retried, never dead-lettered.
    Transient(String),
    /// The store signalled a non-recoverable condition for this row. Always
    /// fails the task.
    Fatal(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed(msg) => write!(f, "malformed: {msg}"),
            RejectReason::Transient(msg) => write!(f, "transient: {msg}"),
            RejectReason::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// One refused row of an insert call. `index` points into the batch slice
/// passed to [`IngestClient::insert_rows`].
#[derive(Debug, Clone)]
pub struct RowRejection {
    pub index: usize,
    pub reason: RejectReason,
}

/// Outcome of one insert call. Rows not named in `rejected` were accepted and
/// are durable once the store commits them; an empty report means the whole
/// batch was accepted.
#[derive(Debug, Clone, Default)]
pub struct InsertReport {
    pub rejected: Vec<RowRejection>,
}

impl InsertReport {
    pub fn all_accepted(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A live handle into the remote store, owned by the client pool and borrowed
/// by partition workers for the duration of one flush.
#[trait_variant::make(IngestClient: Send)]
#[allow(dead_code)]
pub trait LocalIngestClient {
    /// Inserts one partition's records as a single call. A returned report
    /// covers row-level refusals; a `ClientError` means the call as a whole
    /// failed and no row should be assumed durable.
    async fn insert_rows(
        &self,
        partition: &TopicPartition,
        rows: &[SinkRecord],
    ) -> ClientResult<InsertReport>;

    /// The latest offset the store has durably committed for the partition,
    /// `None` when the store has never seen it.
    async fn committed_offset(&self, partition: &TopicPartition) -> ClientResult<Option<i64>>;

    /// Releases remote resources held by this handle. Called by the pool when
    /// the handle is replaced or the task shuts down.
    async fn close(&self) -> ClientResult<()>;
}

/// Creates [`IngestClient`] handles and provisions remote destinations.
/// Creation is expensive (authentication, channel setup) which is why handles
/// are pooled and shared.
#[trait_variant::make(IngestConnector: Send)]
#[allow(dead_code)]
pub trait LocalIngestConnector {
    type Client: IngestClient + Send + Sync + 'static;

    /// Opens a new handle. `name` identifies the handle in the store's
    /// observability surface.
    async fn connect(&self, name: &str) -> ClientResult<Self::Client>;

    /// Ensures the destination for the partition exists and is writable.
    /// Invoked before a partition's first flush and again after the store
    /// rejects rows as malformed.
    async fn ensure_ready(&self, partition: &TopicPartition) -> ClientResult<()>;
}
