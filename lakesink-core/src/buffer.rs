//! Per-partition staging buffer. Records wait here, in offset order, until a
//! count, byte or age threshold makes the buffer due for a flush. The buffer
//! is owned by exactly one partition worker and is plain synchronous state.

use std::collections::VecDeque;
use std::time::Instant;

use crate::Result;
use crate::config::BufferConfig;
use crate::error::Error;
use crate::record::{SinkRecord, TopicPartition};

pub(crate) struct PartitionBuffer {
    partition: TopicPartition,
    limits: BufferConfig,
    pending: VecDeque<SinkRecord>,
    byte_size: usize,
    /// Arrival of the oldest pending record; cleared on drain.
    oldest_at: Option<Instant>,
    flush_in_flight: bool,
}

impl PartitionBuffer {
    pub(crate) fn new(partition: TopicPartition, limits: BufferConfig) -> Self {
        Self {
            partition,
            limits,
            pending: VecDeque::new(),
            byte_size: 0,
            oldest_at: None,
            flush_in_flight: false,
        }
    }

    /// Stages a record. Fails when the hard byte ceiling would be breached;
    /// the caller must flush (or fail) instead of silently dropping.
    pub(crate) fn append(&mut self, record: SinkRecord) -> Result<()> {
        let incoming = record.byte_size();
        if self.byte_size + incoming > self.limits.bytes_ceiling {
            return Err(Error::CapacityExceeded(format!(
                "partition {}: appending {} bytes to {} buffered would breach the {} byte ceiling",
                self.partition, incoming, self.byte_size, self.limits.bytes_ceiling
            )));
        }
        self.byte_size += incoming;
        if self.pending.is_empty() {
            self.oldest_at = Some(Instant::now());
        }
        self.pending.push_back(record);
        Ok(())
    }

    /// Whether any flush threshold has been crossed. Evaluated after every
    /// append and on each timer tick.
    pub(crate) fn should_flush(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.pending.len() >= self.limits.max_records
            || self.byte_size >= self.limits.max_bytes
            || self
                .oldest_at
                .is_some_and(|at| at.elapsed() >= self.limits.max_age())
    }

    /// Hands back everything pending and marks a flush in flight. At most one
    /// flush may be in flight per buffer.
    pub(crate) fn drain(&mut self) -> Result<Vec<SinkRecord>> {
        if self.flush_in_flight {
            return Err(Error::FlushInProgress(format!(
                "partition {}: drain requested while a flush is in flight",
                self.partition
            )));
        }
        self.flush_in_flight = true;
        self.byte_size = 0;
        self.oldest_at = None;
        Ok(std::mem::take(&mut self.pending).into_iter().collect())
    }

    /// Clears the in-flight flag, successful flush or not.
    pub(crate) fn mark_flush_complete(&mut self) {
        self.flush_in_flight = false;
    }

    /// Puts records the flush could not place back at the head, ahead of
    /// anything that arrived meanwhile, so the next attempt sees the original
    /// offset order. Requeued records restart the age clock; retries are
    /// driven by the flush loop, not the timer.
    pub(crate) fn requeue(&mut self, records: Vec<SinkRecord>) {
        for record in records.into_iter().rev() {
            self.byte_size += record.byte_size();
            self.pending.push_front(record);
        }
        if !self.pending.is_empty() && self.oldest_at.is_none() {
            self.oldest_at = Some(Instant::now());
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn byte_size(&self) -> usize {
        self.byte_size
    }
}
