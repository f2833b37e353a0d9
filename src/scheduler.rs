// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer min-heap (spec §3 "Scheduler entry", §4.1 steps 1/3).
//!
//! Keyed by absolute wake timestamp; `cancel` is a linear scan-and-remove,
//! documented by spec §3 as "O(n) but infrequent" — not worth a fancier
//! structure for a single-threaded scheduler with a handful of live timers.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::error::TaskId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    wake_at: Instant,
    seq: u64,
    task: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earlier wake_at first; ties broken by insertion order (seq) so
        // same-tick timers stay FIFO (spec §5 "suspension order").
        (self.wake_at, self.seq).cmp(&(other.wake_at, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of timed wakeups, ordered by absolute deadline.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, wake_at: Instant, task: TaskId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { wake_at, seq, task }));
    }

    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.wake_at)
    }

    /// Pop every entry whose deadline has passed, in deadline order.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<TaskId> {
        let mut ready = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.wake_at > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            ready.push(entry.task);
        }
        ready
    }

    /// Remove all pending entries for `task` (used by cancel/deadline-fire).
    pub fn cancel(&mut self, task: TaskId) {
        if self.heap.iter().any(|Reverse(e)| e.task == task) {
            let remaining: Vec<_> = self
                .heap
                .drain()
                .filter(|Reverse(e)| e.task != task)
                .collect();
            self.heap.extend(remaining);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drains_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.push(base + Duration::from_millis(20), TaskId(2));
        heap.push(base + Duration::from_millis(10), TaskId(1));
        let ready = heap.drain_ready(base + Duration::from_millis(30));
        assert_eq!(ready, vec![TaskId(1), TaskId(2)]);
    }

    #[test]
    fn equal_deadlines_are_fifo() {
        let mut heap = TimerHeap::new();
        let at = Instant::now();
        heap.push(at, TaskId(1));
        heap.push(at, TaskId(2));
        heap.push(at, TaskId(3));
        assert_eq!(
            heap.drain_ready(at),
            vec![TaskId(1), TaskId(2), TaskId(3)]
        );
    }

    #[test]
    fn cancel_removes_only_target() {
        let mut heap = TimerHeap::new();
        let at = Instant::now();
        heap.push(at, TaskId(1));
        heap.push(at, TaskId(2));
        heap.cancel(TaskId(1));
        assert_eq!(heap.drain_ready(at), vec![TaskId(2)]);
    }

    #[test]
    fn nothing_ready_before_deadline() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.push(base + Duration::from_secs(10), TaskId(1));
        assert!(heap.drain_ready(base).is_empty());
        assert!(!heap.is_empty());
    }
}
