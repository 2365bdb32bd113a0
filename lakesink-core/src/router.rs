//! Routing of per-row rejections coming back from the remote store. The
//! tolerance policy decides whether malformed rows kill the task or go to the
//! dead-letter reporter; transient refusals always go back to the flush loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::Result;
use crate::client::RejectReason;
use crate::config::ErrorTolerance;
use crate::error::Error;
use crate::record::SinkRecord;

/// Receives records the pipeline permanently gives up on. Implementations
/// must be prompt; dispatch runs under a bounded timeout and a slow reporter
/// drops the report, never the pipeline.
#[trait_variant::make(DeadLetterSink: Send)]
#[allow(dead_code)]
pub trait LocalDeadLetterSink {
    /// Reports one rejected record with the reason the store refused it.
    async fn report(&self, record: SinkRecord, reason: RejectReason) -> Result<()>;
}

/// Built-in reporter for hosts without a dead-letter queue: renders the
/// record as JSON and logs it at warn level.
#[derive(Debug, Clone, Default)]
pub struct LogDeadLetter;

impl DeadLetterSink for LogDeadLetter {
    async fn report(&self, record: SinkRecord, reason: RejectReason) -> Result<()> {
        let payload = json!({
            "topic": record.topic.as_ref(),
            "partition": record.partition,
            "offset": record.offset,
            "key": record.key.as_ref().map(|k| String::from_utf8_lossy(k.as_ref()).into_owned()),
            "value": String::from_utf8_lossy(record.value.as_ref()).into_owned(),
            "timestamp": record.timestamp.map(|t| t.to_rfc3339()),
            "headers": record.headers.as_ref(),
            "reason": reason.to_string(),
        });
        warn!(dead_letter = %payload, "Record rejected by the store");
        Ok(())
    }
}

/// Outcome of routing one flush's rejections.
#[derive(Debug, Default)]
pub(crate) struct RoutedBatch {
    /// Records handed to the dead-letter reporter; their offsets advance.
    pub(crate) dead_lettered: usize,
    /// Transiently refused records, in offset order, to be requeued.
    pub(crate) retry: Vec<SinkRecord>,
    /// Whether any rejection was malformed-class; the worker re-checks
    /// destination readiness before its next flush.
    pub(crate) saw_malformed: bool,
}

pub(crate) struct ErrorRouter<D> {
    tolerance: ErrorTolerance,
    dead_letter: Arc<D>,
    dispatch_timeout: Duration,
}

impl<D> ErrorRouter<D>
where
    D: DeadLetterSink,
{
    pub(crate) fn new(
        tolerance: ErrorTolerance,
        dead_letter: Arc<D>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            tolerance,
            dead_letter,
            dispatch_timeout,
        }
    }

    /// Classifies every rejection of one flush. An error return means the
    /// task must stop; nothing is dead-lettered past the first fatal row.
    pub(crate) async fn route(
        &self,
        rejections: Vec<(SinkRecord, RejectReason)>,
    ) -> Result<RoutedBatch> {
        let mut routed = RoutedBatch::default();
        for (record, reason) in rejections {
            match (reason, self.tolerance) {
                (RejectReason::Transient(_), _) => routed.retry.push(record),
                (RejectReason::Fatal(msg), _) => {
                    return Err(Error::FatalRecord(format!(
                        "{} offset {}: {msg}",
                        record.topic_partition(),
                        record.offset
                    )));
                }
                (RejectReason::Malformed(msg), ErrorTolerance::None) => {
                    return Err(Error::MalformedRecord(format!(
                        "{} offset {}: {msg}",
                        record.topic_partition(),
                        record.offset
                    )));
                }
                (RejectReason::Malformed(msg), ErrorTolerance::All) => {
                    routed.saw_malformed = true;
                    self.dispatch(record, RejectReason::Malformed(msg)).await;
                    routed.dead_lettered += 1;
                }
            }
        }
        Ok(routed)
    }

    /// Fire-and-forget under the bounded timeout.
    async fn dispatch(&self, record: SinkRecord, reason: RejectReason) {
        let partition = record.topic_partition();
        let offset = record.offset;
        match timeout(self.dispatch_timeout, self.dead_letter.report(record, reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(partition = %partition, offset, err = %e, "Dead-letter reporter failed, report dropped");
            }
            Err(_) => {
                error!(partition = %partition, offset, "Dead-letter dispatch timed out, report dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test_utils::{InMemoryDeadLetter, record};

    fn router(
        tolerance: ErrorTolerance,
        dead_letter: &Arc<InMemoryDeadLetter>,
    ) -> ErrorRouter<InMemoryDeadLetter> {
        ErrorRouter::new(tolerance, Arc::clone(dead_letter), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn tolerated_malformed_rows_are_dead_lettered() {
        let dead_letter = Arc::new(InMemoryDeadLetter::default());
        let router = router(ErrorTolerance::All, &dead_letter);

        let routed = router
            .route(vec![(
                record("orders", 0, 4, "bad"),
                RejectReason::Malformed("missing column".to_string()),
            )])
            .await
            .unwrap();

        assert_eq!(routed.dead_lettered, 1);
        assert!(routed.retry.is_empty());
        assert!(routed.saw_malformed);

        let reports = dead_letter.reports();
        assert_eq!(reports.len(), 1);
        let (reported, reason) = &reports[0];
        assert_eq!(reported.offset, 4);
        assert_eq!(
            *reason,
            RejectReason::Malformed("missing column".to_string())
        );
    }

    #[tokio::test]
    async fn strict_tolerance_fails_on_malformed() {
        let dead_letter = Arc::new(InMemoryDeadLetter::default());
        let router = router(ErrorTolerance::None, &dead_letter);

        let err = router
            .route(vec![(
                record("orders", 2, 9, "bad"),
                RejectReason::Malformed("unparseable".to_string()),
            )])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MalformedRecord(_)));
        assert!(err.to_string().contains("orders-2 offset 9"));
        assert!(dead_letter.reports().is_empty());
    }

    #[tokio::test]
    async fn transient_rows_are_returned_for_retry() {
        let dead_letter = Arc::new(InMemoryDeadLetter::default());
        let router = router(ErrorTolerance::All, &dead_letter);

        let routed = router
            .route(vec![
                (
                    record("orders", 0, 1, "locked"),
                    RejectReason::Transient("row locked".to_string()),
                ),
                (
                    record("orders", 0, 2, "bad"),
                    RejectReason::Malformed("bad".to_string()),
                ),
            ])
            .await
            .unwrap();

        assert_eq!(routed.retry.len(), 1);
        assert_eq!(routed.retry[0].offset, 1);
        assert_eq!(routed.dead_lettered, 1);
        assert_eq!(dead_letter.reports().len(), 1);
    }

    #[tokio::test]
    async fn fatal_rows_stop_the_task_regardless_of_tolerance() {
        let dead_letter = Arc::new(InMemoryDeadLetter::default());
        let router = router(ErrorTolerance::All, &dead_letter);

        let err = router
            .route(vec![(
                record("orders", 0, 3, "v"),
                RejectReason::Fatal("table dropped".to_string()),
            )])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FatalRecord(_)));
        assert!(dead_letter.reports().is_empty());
    }

    #[tokio::test]
    async fn slow_reporter_does_not_stall_routing() {
        let dead_letter =
            Arc::new(InMemoryDeadLetter::default().with_delay(Duration::from_millis(500)));
        let router = ErrorRouter::new(
            ErrorTolerance::All,
            Arc::clone(&dead_letter),
            Duration::from_millis(20),
        );

        let started = Instant::now();
        let routed = router
            .route(vec![(
                record("orders", 0, 1, "bad"),
                RejectReason::Malformed("bad".to_string()),
            )])
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(300));
        // the report was dropped, the record still counts as handled
        assert_eq!(routed.dead_lettered, 1);
        assert!(dead_letter.reports().is_empty());
    }
}
