use std::collections::BTreeMap;

use crate::error::PipelineError;

/// Pending-results table with an emit cursor.
///
/// Items arrive in any order keyed by sequence number; `pop_ready` only ever
/// yields the item at the cursor, so the drain order is the sequence order.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: first,
            pending: BTreeMap::new(),
        }
    }

    /// Records an arrived item. Sequences already drained, or arriving twice,
    /// are rejected.
    pub fn insert(&mut self, seq: u64, item: T) -> Result<(), PipelineError> {
        if seq < self.next || self.pending.contains_key(&seq) {
            return Err(PipelineError::OrderingViolation {
                expected: self.next,
                received: seq,
            });
        }
        self.pending.insert(seq, item);
        Ok(())
    }

    /// Takes the item at the cursor, if it has arrived, and advances.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.pending.remove(&self.next)?;
        let seq = self.next;
        self.next += 1;
        Some((seq, item))
    }

    pub fn next_seq(&self) -> u64 {
        self.next
    }

    /// Number of arrived items waiting for an earlier sequence.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
