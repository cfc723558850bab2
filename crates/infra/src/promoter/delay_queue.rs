//! Min-heap of items keyed by due time.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

struct Entry<T> {
    due: DateTime<Utc>,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Items come out in due order; equal due times keep insertion order.
pub struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, due: DateTime<Utc>, item: T) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Entry { due, seq, item }));
    }

    /// Earliest due time, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Remove and return every item due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let mut due = Vec::new();
        while self.next_due().is_some_and(|at| at <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.item);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn pops_in_due_order_with_stable_ties() {
        let mut queue = DelayQueue::new();
        queue.push(base() + Duration::seconds(30), "c");
        queue.push(base() + Duration::seconds(10), "a");
        queue.push(base() + Duration::seconds(10), "b");

        assert_eq!(queue.next_due(), Some(base() + Duration::seconds(10)));
        assert!(queue.pop_due(base()).is_empty());
        assert_eq!(queue.pop_due(base() + Duration::seconds(10)), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(base() + Duration::minutes(5)), vec!["c"]);
        assert!(queue.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        /// Nothing is released early, and everything due is released.
        #[test]
        fn never_releases_before_due(
            offsets in prop::collection::vec(0i64..3_600, 1..64),
            steps in prop::collection::vec(1i64..600, 1..32),
        ) {
            let mut queue = DelayQueue::new();
            for (i, offset) in offsets.iter().enumerate() {
                queue.push(base() + Duration::seconds(*offset), (i, *offset));
            }

            let mut now = base();
            let mut released = 0;
            for step in steps {
                now += Duration::seconds(step);
                for (_, offset) in queue.pop_due(now) {
                    prop_assert!(base() + Duration::seconds(offset) <= now);
                    released += 1;
                }
                if let Some(next) = queue.next_due() {
                    prop_assert!(next > now);
                }
            }

            let rest = queue.pop_due(base() + Duration::hours(2));
            prop_assert_eq!(released + rest.len(), offsets.len());
        }
    }
}
