//! Time-ordered queue for scheduled session messages

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::time::TimeTag;

struct Entry<T> {
    time: TimeTag,
    /// Insertion order, keeps equal times first-in first-out
    order: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.order == other.order
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: BinaryHeap is a max-heap, the earliest time must come out first
    fn cmp(&self, other: &Self) -> Ordering {
        other.time.cmp(&self.time).then_with(|| other.order.cmp(&self.order))
    }
}

/// Bounded priority queue keyed by delivery time
pub struct Scheduler<T> {
    heap: BinaryHeap<Entry<T>>,
    capacity: usize,
    counter: u64,
}

impl<T> Scheduler<T> {
    pub fn new(capacity: usize) -> Self {
        Self { heap: BinaryHeap::new(), capacity: capacity.max(1), counter: 0 }
    }

    /// Queue `item` for `time`. Returns false if the queue is full.
    pub fn push(&mut self, time: TimeTag, item: T) -> bool {
        if self.heap.len() >= self.capacity {
            return false;
        }
        self.heap.push(Entry { time, order: self.counter, item });
        self.counter += 1;
        true
    }

    /// Next item whose time is not after `now`, with its time
    pub fn pop_due(&mut self, now: TimeTag) -> Option<(TimeTag, T)> {
        if self.heap.peek()?.time > now {
            return None;
        }
        self.heap.pop().map(|entry| (entry.time, entry.item))
    }

    pub fn next_time(&self) -> Option<TimeTag> {
        self.heap.peek().map(|entry| entry.time)
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: f64) -> TimeTag {
        TimeTag::from_seconds(seconds)
    }

    #[test]
    fn test_due_in_time_order() {
        let mut scheduler = Scheduler::new(16);
        scheduler.push(at(3.0), "c");
        scheduler.push(at(1.0), "a");
        scheduler.push(at(2.0), "b");
        assert_eq!(scheduler.next_time(), Some(at(1.0)));

        assert!(scheduler.pop_due(at(0.5)).is_none());
        assert_eq!(scheduler.pop_due(at(2.5)).map(|(_, m)| m), Some("a"));
        assert_eq!(scheduler.pop_due(at(2.5)).map(|(_, m)| m), Some("b"));
        assert!(scheduler.pop_due(at(2.5)).is_none());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_equal_times_keep_order() {
        let mut scheduler = Scheduler::new(16);
        for i in 0..5 {
            scheduler.push(at(1.0), i);
        }
        let order: Vec<i32> = std::iter::from_fn(|| scheduler.pop_due(at(1.0)).map(|(_, i)| i)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_bounded() {
        let mut scheduler = Scheduler::new(2);
        assert!(scheduler.push(at(1.0), 1));
        assert!(scheduler.push(at(2.0), 2));
        assert!(!scheduler.push(at(3.0), 3));
        scheduler.clear();
        assert!(scheduler.is_empty());
    }
}
