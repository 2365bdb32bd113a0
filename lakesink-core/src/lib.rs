//! Core of a sink task that drains records from a partitioned log, buffers
//! them per partition and forwards them durably into a remote analytical
//! store. The host owns the log consumer and the store SDK; this crate owns
//! everything in between: buffering, flushing with retries, offset tracking,
//! client pooling and dead-lettering.

pub use self::error::{Error, Result};
pub use self::record::{SinkRecord, TopicPartition};
pub use self::task::{SinkTask, SinkTaskBuilder};

/// Traits the host implements over the store's SDK.
pub mod client;
pub mod config;
pub mod error;
pub mod record;
/// Tolerance policy and dead-letter reporting for store-rejected rows.
pub mod router;
pub mod task;

mod buffer;
mod coordinator;
mod metrics;
mod pool;
mod tracker;

#[cfg(test)]
mod test_utils;
