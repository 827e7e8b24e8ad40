//! FIFO priority queue with O(1) membership, ordered by arrival time then
//! insertion order (`spec.md` §4.7).
//!
//! A binary heap gives `PopItem` its ordering; a parallel `HashSet` gives
//! `IsPending` its O(1) membership check. One exclusive lock covers both, so
//! they can never disagree (`spec.md` §5: "the membership set and the heap
//! agree at every observable point").

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
struct QueuedItem<K> {
    key: K,
    arrival_time: DateTime<Utc>,
    sequence: u64,
}

impl<K: Eq> PartialEq for QueuedItem<K> {
    fn eq(&self, other: &Self) -> bool {
        self.arrival_time == other.arrival_time && self.sequence == other.sequence
    }
}

impl<K: Eq> Eq for QueuedItem<K> {}

impl<K: Eq> Ord for QueuedItem<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest arrival (and,
        // on a tie, the earliest insertion) sorts first.
        other
            .arrival_time
            .cmp(&self.arrival_time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<K: Eq> PartialOrd for QueuedItem<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State<K> {
    heap: BinaryHeap<QueuedItem<K>>,
    members: HashSet<K>,
    next_sequence: u64,
}

/// A FIFO queue of pending keys, ordered by arrival time with stable
/// tie-breaking by insertion order.
pub struct PriorityQueue<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for PriorityQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PriorityQueue<K>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                members: HashSet::new(),
                next_sequence: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds `key` with the given arrival time. No-op if `key` is already
    /// pending.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn add(&self, key: K, arrival_time: DateTime<Utc>) {
        let mut state = self.lock();
        if state.members.contains(&key) {
            return;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.members.insert(key.clone());
        state.heap.push(QueuedItem {
            key,
            arrival_time,
            sequence,
        });
    }

    /// Removes and returns the earliest-arrived pending key, or `None` if
    /// the queue is empty.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn pop_item(&self) -> Option<K> {
        let mut state = self.lock();
        let item = state.heap.pop()?;
        state.members.remove(&item.key);
        Some(item.key)
    }

    /// Whether `key` is currently pending.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().members.contains(key)
    }

    /// Removes `key` if pending. Returns whether it was present.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.lock();
        if !state.members.remove(key) {
            return false;
        }
        state.heap.retain(|item| &item.key != key);
        true
    }

    /// Returns pending keys in the order `pop_item` would yield them.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn pending_items(&self) -> Vec<K> {
        let state = self.lock();
        let mut items: Vec<&QueuedItem<K>> = state.heap.iter().collect();
        // `QueuedItem`'s `Ord` is reversed so `BinaryHeap` max-pops the
        // earliest arrival; an ascending `sort()` would therefore yield
        // latest-first. Sort by the reverse of `Ord` to match `pop_item`'s
        // earliest-first order.
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|item| item.key.clone()).collect()
    }

    /// Number of pending keys.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    /// Whether the queue currently holds no pending keys.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned by a prior panic.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
    }

    #[test]
    fn pop_item_yields_earliest_arrival_first() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        queue.add("b", at(5));
        queue.add("a", at(1));
        queue.add("c", at(10));

        assert_eq!(queue.pop_item(), Some("a"));
        assert_eq!(queue.pop_item(), Some("b"));
        assert_eq!(queue.pop_item(), Some("c"));
        assert_eq!(queue.pop_item(), None);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        queue.add("first", at(1));
        queue.add("second", at(1));
        queue.add("third", at(1));

        assert_eq!(queue.pop_item(), Some("first"));
        assert_eq!(queue.pop_item(), Some("second"));
        assert_eq!(queue.pop_item(), Some("third"));
    }

    #[test]
    fn adding_an_already_pending_key_is_a_no_op() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        queue.add("a", at(1));
        queue.add("a", at(99));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_item(), Some("a"));
        assert_eq!(queue.pop_item(), None);
    }

    #[test]
    fn is_pending_reflects_current_membership() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        assert!(!queue.is_pending(&"a"));
        queue.add("a", at(1));
        assert!(queue.is_pending(&"a"));
        queue.pop_item();
        assert!(!queue.is_pending(&"a"));
    }

    #[test]
    fn remove_drops_a_pending_key_from_heap_and_membership() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        queue.add("a", at(1));
        queue.add("b", at(2));

        assert!(queue.remove(&"a"));
        assert!(!queue.remove(&"a"));
        assert_eq!(queue.pending_items(), vec!["b"]);
    }

    #[test]
    fn pending_items_matches_pop_order_without_mutating_the_queue() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        queue.add("b", at(5));
        queue.add("a", at(1));

        assert_eq!(queue.pending_items(), vec!["a", "b"]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_item(), Some("a"));
    }

    #[test]
    fn len_and_is_empty_track_the_queue_size() {
        let queue: PriorityQueue<&str> = PriorityQueue::new();
        assert!(queue.is_empty());
        queue.add("a", at(1));
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }
}
