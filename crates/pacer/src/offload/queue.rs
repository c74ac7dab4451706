use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entity::prelude::Activity;

struct Entry {
    ts: i64,
    seq: u64,
    activity: Activity,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: the oldest timestamp (then the earliest insertion) compares greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ts.cmp(&self.ts).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Incoming activities ordered by timestamp, oldest first. Ties keep insertion order.
#[derive(Default)]
pub struct IncomingQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl IncomingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, activity: Activity) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            ts: activity.ts,
            seq,
            activity,
        });
    }

    pub fn extend(&mut self, activities: impl IntoIterator<Item = Activity>) {
        for activity in activities {
            self.push(activity);
        }
    }

    pub fn pop(&mut self) -> Option<Activity> {
        self.heap.pop().map(|e| e.activity)
    }

    pub fn pop_many(&mut self, max: usize) -> Vec<Activity> {
        std::iter::from_fn(|| self.pop()).take(max).collect()
    }

    /// Remove everything, oldest first.
    pub fn drain(&mut self) -> Vec<Activity> {
        let n = self.heap.len();
        self.pop_many(n)
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
    use crate::entity::prelude::ActivityKind;

    #[test]
    fn pops_oldest_first_with_stable_ties() {
        let mut queue = IncomingQueue::new();
        for (id, ts) in [(1, 30), (2, 10), (3, 20), (4, 10)] {
            queue.push(Activity::new(id, 1, ts, ActivityKind::Run, "r"));
        }
        let ids: Vec<i64> = queue.pop_many(3).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 4, 3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
