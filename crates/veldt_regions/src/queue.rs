//! # Local Task Queue
//!
//! Each region drains its cross-thread inbox into this queue once per
//! tick, then pops everything due up to the current tick boundary.
//! Ordering is stable: target tick first, arrival sequence second -
//! never priority-based, so tasks from one source for one destination
//! keep their relative order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::region::ReceiveObject;
use crate::task::Task;

/// An entry drained from the inbox or re-queued by topology changes.
pub(crate) enum QueueItem {
    /// A collaborator task.
    Task(Task),
    /// An object handoff from another region.
    Receive(ReceiveObject),
}

struct QueueEntry {
    due: u64,
    seq: u64,
    item: QueueItem,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so the BinaryHeap pops the smallest (due, seq) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Stable FIFO queue with optional scheduled-delay entries.
pub(crate) struct LocalQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Enqueues an item due at `due`. The arrival sequence is assigned
    /// here, so push order is the tiebreaker for equal due ticks.
    pub(crate) fn push(&mut self, item: QueueItem, due: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { due, seq, item });
    }

    /// Pops the next item due at or before `tick`, if any.
    pub(crate) fn pop_due(&mut self, tick: u64) -> Option<QueueItem> {
        if self.heap.peek().is_some_and(|e| e.due <= tick) {
            self.heap.pop().map(|e| e.item)
        } else {
            None
        }
    }

    /// Number of queued items.
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Removes every item in (due, seq) order, with the due tick each
    /// item was scheduled for. Used when a region's queue is moved
    /// during a merge, split or destroy.
    pub(crate) fn drain_with_due(&mut self) -> Vec<(u64, QueueItem)> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            out.push((entry.due, entry.item));
        }
        out
    }
}
