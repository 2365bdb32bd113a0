//! A record drained from the partitioned log, carried unchanged from `put`
//! through the partition buffer to the remote insert. Records are immutable
//! once buffered; ownership moves from the host into the buffer and from the
//! buffer into the flush call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Identity of a single partition of a topic. Cheap to clone, usable as a map
/// key everywhere offsets or buffers are tracked per partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One record of the partitioned log.
/// NOTE: it is cheap to clone, payload and headers are reference counted.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    /// topic this record was read from
    pub topic: Arc<str>,
    /// partition within the topic
    pub partition: i32,
    /// offset within the partition, assigned by the log
    pub offset: i64,
    /// optional record key
    pub key: Option<Bytes>,
    /// record payload
    pub value: Bytes,
    /// record timestamp as stamped by the log, if any
    pub timestamp: Option<DateTime<Utc>>,
    /// headers, forwarded verbatim to the dead-letter reporter
    pub headers: Arc<HashMap<String, String>>,
}

impl SinkRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: Arc::clone(&self.topic),
            partition: self.partition,
        }
    }

    /// Approximate in-memory size used for buffer byte accounting.
    pub fn byte_size(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len())
            + self.value.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}
