//! Pipeline metrics, recorded per partition. The task registers them into a
//! caller-supplied registry; the core never owns an exposition endpoint and
//! keeps no global registry so concurrent tasks stay independent.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::record::TopicPartition;

const REGISTRY_PREFIX: &str = "lakesink";

const RECORDS_BUFFERED: &str = "records_buffered";
const RECORDS_FLUSHED: &str = "records_flushed";
const RECORDS_DEAD_LETTERED: &str = "records_dead_lettered";
const FLUSH_ATTEMPTS: &str = "flush_attempts";
const FLUSH_FAILURES: &str = "flush_failures";
const FLUSH_TIME: &str = "flush_time";
const CLIENTS_CREATED: &str = "clients_created";
const CLIENTS_INVALIDATED: &str = "clients_invalidated";

const TOPIC_LABEL: &str = "topic";
const PARTITION_LABEL: &str = "partition";

/// Family of metrics for the sink pipeline.
pub(crate) struct SinkMetrics {
    pub(crate) records_buffered: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_flushed: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_dead_lettered: Family<Vec<(String, String)>, Counter>,
    pub(crate) flush_attempts: Family<Vec<(String, String)>, Counter>,
    pub(crate) flush_failures: Family<Vec<(String, String)>, Counter>,
    /// Flush latency in seconds, successful attempts only.
    pub(crate) flush_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) clients_created: Counter,
    pub(crate) clients_invalidated: Counter,
}

impl SinkMetrics {
    pub(crate) fn new() -> Self {
        Self {
            records_buffered: Family::<Vec<(String, String)>, Counter>::default(),
            records_flushed: Family::<Vec<(String, String)>, Counter>::default(),
            records_dead_lettered: Family::<Vec<(String, String)>, Counter>::default(),
            flush_attempts: Family::<Vec<(String, String)>, Counter>::default(),
            flush_failures: Family::<Vec<(String, String)>, Counter>::default(),
            // exponential buckets in the range 5ms to ~10s
            flush_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            }),
            clients_created: Counter::default(),
            clients_invalidated: Counter::default(),
        }
    }

    /// Registers every metric under the `lakesink` prefix.
    pub(crate) fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix(REGISTRY_PREFIX);
        registry.register(
            RECORDS_BUFFERED,
            "A Counter to keep track of the total number of records staged into partition buffers",
            self.records_buffered.clone(),
        );
        registry.register(
            RECORDS_FLUSHED,
            "A Counter to keep track of the total number of records accepted by the remote store",
            self.records_flushed.clone(),
        );
        registry.register(
            RECORDS_DEAD_LETTERED,
            "A Counter to keep track of the total number of records forwarded to the dead-letter reporter",
            self.records_dead_lettered.clone(),
        );
        registry.register(
            FLUSH_ATTEMPTS,
            "A Counter to keep track of the total number of flush attempts against the remote store",
            self.flush_attempts.clone(),
        );
        registry.register(
            FLUSH_FAILURES,
            "A Counter to keep track of the total number of flush attempts that failed as a whole",
            self.flush_failures.clone(),
        );
        registry.register(
            FLUSH_TIME,
            "A Histogram to keep track of flush latency in seconds",
            self.flush_time.clone(),
        );
        registry.register(
            CLIENTS_CREATED,
            "A Counter to keep track of the total number of remote client handles created",
            self.clients_created.clone(),
        );
        registry.register(
            CLIENTS_INVALIDATED,
            "A Counter to keep track of the total number of remote client handles invalidated",
            self.clients_invalidated.clone(),
        );
    }
}

pub(crate) fn partition_labels(partition: &TopicPartition) -> Vec<(String, String)> {
    vec![
        (TOPIC_LABEL.to_string(), partition.topic.to_string()),
        (PARTITION_LABEL.to_string(), partition.partition.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;

    use super::*;
    use crate::test_utils::tp;

    #[test]
    fn registers_and_encodes_under_prefix() {
        let metrics = SinkMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics
            .records_flushed
            .get_or_create(&partition_labels(&tp("orders", 0)))
            .inc_by(42);
        metrics.clients_created.inc();

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("lakesink_records_flushed_total"));
        assert!(out.contains("topic=\"orders\""));
        assert!(out.contains("partition=\"0\""));
        assert!(out.contains("42"));
        assert!(out.contains("lakesink_clients_created_total 1"));
    }

    #[test]
    fn partition_labels_carry_topic_and_partition() {
        let labels = partition_labels(&tp("returns", 12));
        assert_eq!(
            labels,
            vec![
                ("topic".to_string(), "returns".to_string()),
                ("partition".to_string(), "12".to_string()),
            ]
        );
    }
}
