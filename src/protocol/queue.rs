//! Per-node priority queue of deferred requesters.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{NodeId, Timestamp};
use crate::utils::MaekawaError;

/// Deferred requests ordered by `(timestamp, requester)` ascending, at most
/// one entry per requester.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    /// Ordered set of pending `(timestamp, requester)` pairs.
    ordered: BTreeSet<(Timestamp, NodeId)>,

    /// Map from requester -> its queued timestamp, for duplicate detection.
    queued: HashMap<NodeId, Timestamp>,
}

impl RequestQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        RequestQueue {
            ordered: BTreeSet::new(),
            queued: HashMap::new(),
        }
    }

    /// Inserts a request keeping the total order. A second entry for an
    /// already-queued requester is rejected as a protocol anomaly and leaves
    /// the queue untouched.
    pub fn enqueue(
        &mut self,
        requester: NodeId,
        ts: Timestamp,
    ) -> Result<(), MaekawaError> {
        if let Some(&queued_ts) = self.queued.get(&requester) {
            return Err(MaekawaError::anomaly(format!(
                "duplicate REQUEST from {} ts {} (already queued at ts {})",
                requester, ts, queued_ts
            )));
        }
        self.queued.insert(requester, ts);
        self.ordered.insert((ts, requester));
        Ok(())
    }

    /// Removes and returns the highest-priority (smallest) request, or `None`
    /// if the queue is empty.
    pub fn pop_next(&mut self) -> Option<(Timestamp, NodeId)> {
        let head = self.ordered.pop_first()?;
        self.queued.remove(&head.1);
        Some(head)
    }

    /// Peeks the highest-priority request without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&(Timestamp, NodeId)> {
        self.ordered.first()
    }

    #[inline]
    pub fn contains(&self, requester: NodeId) -> bool {
        self.queued.contains_key(&requester)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }
}
