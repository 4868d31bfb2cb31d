//! Whole-system completion detection.

use crate::protocol::NodeId;
use crate::utils::{Bitmap, MaekawaError};

/// Tracks which nodes have finished their CS-entry quota, and how many
/// entries each of them completed.
#[derive(Debug, Clone)]
pub struct TerminationTracker {
    /// Set of nodes that reported completion.
    finished: Bitmap,

    /// Map from node ID -> completed cycles reported.
    cycles: Vec<u32>,
}

impl TerminationTracker {
    /// Creates a tracker for `population` nodes, none finished.
    pub fn new(population: u8) -> Self {
        TerminationTracker {
            finished: Bitmap::new(population, false),
            cycles: vec![0; population as usize],
        }
    }

    /// Records that `node` finished after `cycles` CS entries. Returns
    /// `Ok(true)` if this report completed the whole system. Reporting the
    /// same node twice is a protocol anomaly and changes nothing.
    pub fn report(
        &mut self,
        node: NodeId,
        cycles: u32,
    ) -> Result<bool, MaekawaError> {
        if node >= self.finished.size() {
            return Err(MaekawaError::anomaly(format!(
                "completion reported for unknown node {}",
                node
            )));
        }
        if self.finished.contains(node) {
            return Err(MaekawaError::anomaly(format!(
                "node {} reported completion twice",
                node
            )));
        }

        self.finished.set(node, true)?;
        self.cycles[node as usize] = cycles;
        Ok(self.all_done())
    }

    #[inline]
    pub fn is_done(&self, node: NodeId) -> bool {
        self.finished.contains(node)
    }

    /// True once every node has reported completion.
    #[inline]
    pub fn all_done(&self) -> bool {
        self.finished.count() == self.finished.size()
    }

    #[inline]
    pub fn finished_count(&self) -> u8 {
        self.finished.count()
    }

    /// Sum of CS entries over all nodes that reported so far.
    pub fn total_entries(&self) -> u64 {
        self.cycles.iter().map(|&c| c as u64).sum()
    }
}
