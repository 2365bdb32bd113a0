//! Safe-to-commit offset bookkeeping. Workers advance their partition after
//! confirmed successes; the host reads an owned snapshot from its commit
//! callback. Values are the next offset to resume consumption from, so a
//! crash after commit redelivers nothing that is already durable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Result;
use crate::error::Error;
use crate::record::TopicPartition;

/// Cheap to clone; all clones share the same offset map.
#[derive(Clone, Default)]
pub(crate) struct OffsetTracker {
    offsets: Arc<RwLock<HashMap<TopicPartition, i64>>>,
}

impl OffsetTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Moves the partition's safe-to-commit offset forward. Re-advancing to
    /// the same value is a no-op; moving backwards is a programming fault and
    /// fails immediately.
    pub(crate) fn advance(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        let mut offsets = self.offsets.write();
        match offsets.get(partition) {
            Some(&stored) if offset < stored => Err(Error::NonMonotonicOffset {
                partition: partition.to_string(),
                stored,
                attempted: offset,
            }),
            _ => {
                offsets.insert(partition.clone(), offset);
                Ok(())
            }
        }
    }

    /// The partition's current safe-to-commit offset, if any progress has
    /// been recorded.
    pub(crate) fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.read().get(partition).copied()
    }

    /// Owned copy of the whole map; later advances do not leak into it.
    pub(crate) fn snapshot(&self) -> HashMap<TopicPartition, i64> {
        self.offsets.read().clone()
    }

    /// Drops state for an unassigned partition so a later reassignment
    /// starts clean.
    pub(crate) fn forget(&self, partition: &TopicPartition) {
        self.offsets.write().remove(partition);
    }
}
