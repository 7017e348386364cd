//! Scheduled actions of the single-threaded core.
//!
//! The core never blocks; anything that must happen later is pushed
//! into this priority queue as a `TimeoutKind`, and fired by the
//! node's `prod()` once its deadline passes. Handles stay valid
//! until the timeout fires, so one-shot actions can be cancelled and
//! re-armed.

use binary_heap_plus::{BinaryHeap, MinComparator};

use crate::bft::collections::{self, HashSet};
use crate::bft::ledger::LedgerId;
use crate::bft::ordering::ViewNo;

/// The action a timeout fires.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    /// Propose a view change if the primary is still disconnected.
    ProposeViewChange(ViewNo),
    /// Check whether the view change to the given view completed.
    ViewChangeComplete(ViewNo),
    /// A catch-up round for a ledger ran dry.
    CatchupRound(LedgerId, u64),
    /// Re-run catch-up while a view change is waiting on it.
    CatchupDuringViewChange,
    /// Sweep the master performance monitor.
    PerformanceCheck,
    /// Rescan commits stashed out of order.
    OutOfOrderScan,
}

/// Identifies a scheduled timeout, for cancellation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct TimeoutHandle(u64);

#[derive(Clone, Eq, PartialEq)]
struct Entry {
    fire_at: u64,
    id: u64,
    kind: TimeoutKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at, self.id).cmp(&(other.fire_at, other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The queue of scheduled actions.
pub struct Timeouts {
    heap: BinaryHeap<Entry, MinComparator>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl Timeouts {
    /// Creates an empty timeout queue.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new_min(),
            cancelled: collections::hash_set(),
            next_id: 0,
        }
    }

    /// Schedules `kind` to fire `delay` milliseconds after `now`.
    pub fn schedule(&mut self, kind: TimeoutKind, delay: u64, now: u64) -> TimeoutHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Entry {
            fire_at: now + delay,
            id,
            kind,
        });
        TimeoutHandle(id)
    }

    /// Cancels a scheduled timeout. Cancelling an already fired
    /// handle has no effect.
    pub fn cancel(&mut self, handle: TimeoutHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Pops every timeout due at `now`, skipping cancelled entries.
    pub fn pop_due(&mut self, now: u64) -> Vec<TimeoutKind> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.fire_at > now {
                break;
            }
            // peeked entry is due, remove it
            let entry = match self.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            if !self.cancelled.remove(&entry.id) {
                due.push(entry.kind);
            }
        }
        due
    }

    /// Time of the next pending deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.fire_at)
    }

    /// Number of pending entries, including cancelled ones which
    /// have not been popped yet.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no timeouts are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}
