//! Check queue.
//!
//! Priority work queue of channel IDs with de-duplication across three
//! disjoint sets: queued, in-progress, and a bounded recently-completed set.
//! A channel ID lives in at most one of the three at any time; enqueueing is
//! rejected while the ID is in any of them. Lower priority values run sooner,
//! ties break FIFO.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

/// Default bound on the recently-completed set
pub const DEFAULT_COMPLETED_BOUND: usize = 1000;

#[derive(Debug, Clone)]
struct QueueEntry {
    channel_id: i64,
    priority: u32,
    seq: u64,
    enqueued_at: DateTime<Utc>,
}

// BinaryHeap is a max-heap; invert the ordering so the lowest
// (priority, seq) pair pops first.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

/// Queue counters for status snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<i64>,
    in_progress: HashSet<i64>,
    completed: HashSet<i64>,
    completed_order: VecDeque<i64>,
    next_seq: u64,
    total_enqueued: u64,
    total_completed: u64,
}

/// Thread-safe priority queue of channels awaiting a check
pub struct CheckQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_size: usize,
    completed_bound: usize,
}

impl CheckQueue {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self::with_completed_bound(max_size, DEFAULT_COMPLETED_BOUND)
    }

    #[must_use]
    pub fn with_completed_bound(max_size: usize, completed_bound: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            max_size,
            completed_bound,
        }
    }

    /// Enqueue a channel. Returns false when the ID is already queued,
    /// in progress or recently completed, or when the queue is full
    /// (queued + in-progress at `max_size`).
    pub fn add(&self, channel_id: i64, priority: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.queued.contains(&channel_id)
            || inner.in_progress.contains(&channel_id)
            || inner.completed.contains(&channel_id)
        {
            debug!(channel_id, "Channel already tracked, not queueing");
            return false;
        }
        if inner.queued.len() + inner.in_progress.len() >= self.max_size {
            debug!(channel_id, max_size = self.max_size, "Check queue full");
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueEntry {
            channel_id,
            priority,
            seq,
            enqueued_at: Utc::now(),
        });
        inner.queued.insert(channel_id);
        inner.total_enqueued += 1;
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Enqueue many channels; returns how many were actually added
    pub fn add_bulk(&self, channel_ids: &[i64], priority: u32) -> usize {
        channel_ids
            .iter()
            .filter(|&&id| self.add(id, priority))
            .count()
    }

    fn pop(&self) -> Option<i64> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.channel_id);
        inner.in_progress.insert(entry.channel_id);
        debug!(
            channel_id = entry.channel_id,
            priority = entry.priority,
            enqueued_at = %entry.enqueued_at,
            "Dequeued channel"
        );
        Some(entry.channel_id)
    }

    /// Pop the highest-priority channel, atomically moving it to the
    /// in-progress set. Blocks up to `timeout` when the queue is empty.
    pub async fn next(&self, timeout: Duration) -> Option<i64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(channel_id) = self.pop() {
                return Some(channel_id);
            }
            tokio::pin!(notified);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline passed; one final attempt in case of a late add
                return self.pop();
            }
        }
    }

    /// Non-blocking variant of [`Self::next`]
    pub fn try_next(&self) -> Option<i64> {
        self.pop()
    }

    /// Move a channel from in-progress to the bounded completed set
    pub fn mark_completed(&self, channel_id: i64) {
        let mut inner = self.inner.lock();
        if !inner.in_progress.remove(&channel_id) {
            return;
        }
        if inner.completed.insert(channel_id) {
            inner.completed_order.push_back(channel_id);
        }
        inner.total_completed += 1;
        while inner.completed_order.len() > self.completed_bound {
            if let Some(evicted) = inner.completed_order.pop_front() {
                inner.completed.remove(&evicted);
            }
        }
    }

    /// Forget a completed channel so it can be queued again.
    /// Returns false when the channel was not in the completed set.
    pub fn remove_from_completed(&self, channel_id: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed.remove(&channel_id) {
            inner.completed_order.retain(|&id| id != channel_id);
            true
        } else {
            false
        }
    }

    /// Empty all three sets and the queue
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.queued.clear();
        inner.in_progress.clear();
        inner.completed.clear();
        inner.completed_order.clear();
    }

    /// Channels currently being checked
    #[must_use]
    pub fn in_progress_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.lock().in_progress.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        QueueStatus {
            queued: inner.queued.len(),
            in_progress: inner.in_progress.len(),
            completed: inner.completed.len(),
            total_enqueued: inner.total_enqueued,
            total_completed: inner.total_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rejects_duplicates() {
        let queue = CheckQueue::new(100);
        assert!(queue.add(1, 10));
        assert!(!queue.add(1, 10));
        assert_eq!(queue.status().queued, 1);
    }

    #[test]
    fn test_add_bulk_counts_only_new() {
        let queue = CheckQueue::new(100);
        assert_eq!(queue.add_bulk(&[1, 2, 3], 10), 3);
        assert_eq!(queue.add_bulk(&[2, 3, 4], 10), 1);
        assert_eq!(queue.status().queued, 4);
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let queue = CheckQueue::new(100);
        queue.add(1, 20);
        queue.add(2, 0);
        queue.add(3, 20);
        queue.add(4, 10);

        assert_eq!(queue.try_next(), Some(2));
        assert_eq!(queue.try_next(), Some(4));
        // Same priority: FIFO
        assert_eq!(queue.try_next(), Some(1));
        assert_eq!(queue.try_next(), Some(3));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_disjoint_sets_through_lifecycle() {
        let queue = CheckQueue::new(100);
        queue.add(1, 10);
        assert_eq!(queue.status().queued, 1);

        let id = queue.try_next().unwrap();
        assert_eq!(id, 1);
        let status = queue.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.in_progress, 1);

        // In progress: cannot re-queue
        assert!(!queue.add(1, 10));

        queue.mark_completed(1);
        let status = queue.status();
        assert_eq!(status.in_progress, 0);
        assert_eq!(status.completed, 1);

        // Completed: still cannot re-queue
        assert!(!queue.add(1, 10));
    }

    #[test]
    fn test_requeue_after_remove_from_completed() {
        let queue = CheckQueue::new(100);
        queue.add(1, 10);
        queue.try_next();
        queue.mark_completed(1);

        assert!(queue.remove_from_completed(1));
        assert!(queue.add(1, 10));
        let status = queue.status();
        assert_eq!(status.queued, 1);
        assert_eq!(status.completed, 0);
    }

    #[test]
    fn test_remove_from_completed_unknown_channel() {
        let queue = CheckQueue::new(100);
        assert!(!queue.remove_from_completed(999));
    }

    #[test]
    fn test_max_size_rejects_and_leaves_existing() {
        let queue = CheckQueue::new(2);
        assert!(queue.add(1, 10));
        assert!(queue.add(2, 10));
        assert!(!queue.add(3, 10));
        assert_eq!(queue.status().queued, 2);

        // In-progress entries still count against the bound
        queue.try_next();
        assert!(!queue.add(3, 10));
    }

    #[test]
    fn test_completed_set_is_bounded() {
        let queue = CheckQueue::with_completed_bound(100, 3);
        for id in 1..=5 {
            queue.add(id, 10);
            queue.try_next();
            queue.mark_completed(id);
        }
        assert_eq!(queue.status().completed, 3);
        // Oldest evicted: channel 1 is re-queueable again
        assert!(queue.add(1, 10));
        // Newest still held
        assert!(!queue.add(5, 10));
    }

    #[test]
    fn test_clear_resets_everything() {
        let queue = CheckQueue::new(100);
        queue.add(1, 10);
        queue.add(2, 10);
        queue.try_next();
        queue.mark_completed(1);

        queue.clear();
        let status = queue.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.in_progress, 0);
        assert_eq!(status.completed, 0);
        assert!(queue.add(1, 10));
    }

    #[tokio::test]
    async fn test_next_blocks_until_add() {
        let queue = std::sync::Arc::new(CheckQueue::new(100));
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.next(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.add(7, 0);

        let got = handle.await.unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_next_times_out_when_empty() {
        let queue = CheckQueue::new(100);
        let got = queue.next(Duration::from_millis(50)).await;
        assert_eq!(got, None);
    }
}
