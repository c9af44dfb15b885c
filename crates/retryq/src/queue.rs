//! Stable binary heap for admission ordering.
//!
//! `std::collections::BinaryHeap` offers neither stable ordering nor targeted
//! removal, so the heap is hand-rolled over a `Vec` with explicit sifting.

use crate::descriptor::{Priority, RequestId};

/// Ordering key of one queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTicket {
    /// Id of the queued request.
    pub id: RequestId,
    /// Scheduling priority.
    pub priority: Priority,
    /// First-enqueue wall-clock millis.
    pub timestamp_ms: i64,
}

#[derive(Debug)]
struct Slot<T> {
    ticket: QueueTicket,
    seq: u64,
    payload: T,
}

impl<T> Slot<T> {
    /// Heap comparator: higher priority first, then earlier timestamp, then
    /// earlier insertion.
    fn precedes(&self, other: &Self) -> bool {
        if self.ticket.priority != other.ticket.priority {
            return self.ticket.priority > other.ticket.priority;
        }
        if self.ticket.timestamp_ms != other.ticket.timestamp_ms {
            return self.ticket.timestamp_ms < other.ticket.timestamp_ms;
        }
        self.seq < other.seq
    }
}

/// Binary heap with stable ordering and targeted removal.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: Vec<Slot<T>>,
    next_seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            next_seq: 0,
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Push an item. O(log n).
    pub fn push(&mut self, ticket: QueueTicket, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Slot {
            ticket,
            seq,
            payload,
        });
        self.sift_up(self.heap.len() - 1);
    }

    /// The highest-precedence ticket, if any. O(1).
    pub fn peek(&self) -> Option<&QueueTicket> {
        self.heap.first().map(|slot| &slot.ticket)
    }

    /// Remove and return the highest-precedence item. O(log n).
    pub fn pop(&mut self) -> Option<(QueueTicket, T)> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let slot = self.heap.pop().expect("heap is non-empty");
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some((slot.ticket, slot.payload))
    }

    /// Remove the item with `id`, restoring the heap around the vacated
    /// index. O(n) scan plus O(log n) repair.
    pub fn remove_by_id(&mut self, id: &RequestId) -> Option<(QueueTicket, T)> {
        let index = self.heap.iter().position(|slot| &slot.ticket.id == id)?;
        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        let slot = self.heap.pop().expect("heap is non-empty");
        if index < self.heap.len() {
            // The swapped-in element may violate in either direction.
            self.sift_up(index);
            self.sift_down(index);
        }
        Some((slot.ticket, slot.payload))
    }

    /// Drain every item, e.g. for mass cancellation. Order is unspecified.
    pub fn clear_all(&mut self) -> Vec<(QueueTicket, T)> {
        self.heap
            .drain(..)
            .map(|slot| (slot.ticket, slot.payload))
            .collect()
    }

    /// Tickets in admission order, for diagnostics. O(n log n).
    pub fn snapshot(&self) -> Vec<QueueTicket> {
        let mut indices: Vec<usize> = (0..self.heap.len()).collect();
        indices.sort_by(|&a, &b| {
            if self.heap[a].precedes(&self.heap[b]) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        indices
            .into_iter()
            .map(|i| self.heap[i].ticket.clone())
            .collect()
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].precedes(&self.heap[parent]) {
                self.heap.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut best = index;
            if left < len && self.heap[left].precedes(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].precedes(&self.heap[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.heap.swap(index, best);
            index = best;
        }
    }

    #[cfg(test)]
    fn is_valid_heap(&self) -> bool {
        (1..self.heap.len()).all(|i| !self.heap[i].precedes(&self.heap[(i - 1) / 2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ticket(id: &str, priority: Priority, timestamp_ms: i64) -> QueueTicket {
        QueueTicket {
            id: RequestId::new(id),
            priority,
            timestamp_ms,
        }
    }

    #[test]
    fn pops_by_priority_then_timestamp_then_insertion() {
        let mut queue = PriorityQueue::new();
        queue.push(ticket("low", Priority::Low, 100), ());
        queue.push(ticket("critical", Priority::Critical, 100), ());
        queue.push(ticket("medium", Priority::Medium, 100), ());
        queue.push(ticket("high", Priority::High, 100), ());

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|(t, _)| t.id.to_string())
            .collect();
        assert_eq!(order, ["critical", "high", "medium", "low"]);
    }

    #[test]
    fn timestamp_breaks_priority_ties() {
        let mut queue = PriorityQueue::new();
        // Inserted in reverse timestamp order.
        queue.push(ticket("c", Priority::Medium, 300), ());
        queue.push(ticket("b", Priority::Medium, 200), ());
        queue.push(ticket("a", Priority::Medium, 100), ());

        let snapshot: Vec<i64> = queue.snapshot().iter().map(|t| t.timestamp_ms).collect();
        assert_eq!(snapshot, [100, 200, 300]);
    }

    #[test]
    fn insertion_order_breaks_full_ties() {
        let mut queue = PriorityQueue::new();
        queue.push(ticket("first", Priority::Medium, 100), ());
        queue.push(ticket("second", Priority::Medium, 100), ());
        queue.push(ticket("third", Priority::Medium, 100), ());

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|(t, _)| t.id.to_string())
            .collect();
        assert_eq!(order, ["first", "second", "third"]);
    }

    #[test]
    fn remove_by_id_preserves_the_heap() {
        let mut queue = PriorityQueue::new();
        for i in 0..16 {
            let priority = match i % 4 {
                0 => Priority::Low,
                1 => Priority::Medium,
                2 => Priority::High,
                _ => Priority::Critical,
            };
            queue.push(ticket(&format!("r{i}"), priority, i), i);
        }

        let removed = queue.remove_by_id(&RequestId::new("r5"));
        assert!(removed.is_some());
        assert!(queue.is_valid_heap());
        assert_eq!(queue.len(), 15);
        assert!(queue.remove_by_id(&RequestId::new("missing")).is_none());
    }

    #[test]
    fn clear_all_drains_everything() {
        let mut queue = PriorityQueue::new();
        queue.push(ticket("a", Priority::Low, 1), ());
        queue.push(ticket("b", Priority::High, 2), ());
        let drained = queue.clear_all();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn pop_order_matches_the_comparator(
            entries in proptest::collection::vec((0u8..4, 0i64..1000), 0..64)
        ) {
            let mut queue = PriorityQueue::new();
            for (i, (p, ts)) in entries.iter().enumerate() {
                let priority = match p {
                    0 => Priority::Low,
                    1 => Priority::Medium,
                    2 => Priority::High,
                    _ => Priority::Critical,
                };
                queue.push(ticket(&format!("r{i}"), priority, *ts), i);
            }
            prop_assert!(queue.is_valid_heap());

            let mut popped: Vec<(Priority, i64, usize)> = Vec::new();
            while let Some((t, seq)) = queue.pop() {
                popped.push((t.priority, t.timestamp_ms, seq));
            }
            for pair in popped.windows(2) {
                let (pa, ta, sa) = pair[0];
                let (pb, tb, sb) = pair[1];
                prop_assert!(
                    pa > pb || (pa == pb && (ta < tb || (ta == tb && sa < sb)))
                );
            }
        }
    }
}
