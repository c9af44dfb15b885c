//! Bounded store of terminally failed requests awaiting manual replay.

use crate::descriptor::{RequestDescriptor, RequestId};

/// Ordered, bounded collection of failed request descriptors.
///
/// On overflow the most recently added entry is evicted to make room: older
/// failures carry more signal for replay, so the store keeps them.
#[derive(Debug)]
pub struct FailedStore {
    entries: Vec<RequestDescriptor>,
    max_size: usize,
}

impl FailedStore {
    /// Create a store bounded at `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size: max_size.max(1),
        }
    }

    /// Number of stored descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a failed descriptor, returning the entry evicted to make room,
    /// if the store was full.
    pub fn add(&mut self, descriptor: RequestDescriptor) -> Option<RequestDescriptor> {
        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop()
        } else {
            None
        };
        self.entries.push(descriptor);
        evicted
    }

    /// Remove the entry with `id`, if present.
    pub fn remove(&mut self, id: &RequestId) -> Option<RequestDescriptor> {
        let index = self.entries.iter().position(|entry| &entry.id == id)?;
        Some(self.entries.remove(index))
    }

    /// A copy of every stored descriptor, oldest first.
    pub fn get_all(&self) -> Vec<RequestDescriptor> {
        self.entries.clone()
    }

    /// Remove and return every stored descriptor, oldest first.
    pub fn drain_all(&mut self) -> Vec<RequestDescriptor> {
        std::mem::take(&mut self.entries)
    }

    /// Drop every stored descriptor.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Priority;
    use crate::transport::TransportRequest;
    use http::Method;

    fn descriptor(id: &str) -> RequestDescriptor {
        RequestDescriptor {
            id: RequestId::new(id),
            priority: Priority::Medium,
            timestamp_ms: 0,
            attempt: 0,
            max_attempts: None,
            mode: None,
            retryable_statuses: None,
            backoff: None,
            retrying: false,
            request: TransportRequest::new(Method::GET, "https://example.com"),
        }
    }

    #[test]
    fn add_remove_get_all_clear() {
        let mut store = FailedStore::new(10);
        store.add(descriptor("a"));
        store.add(descriptor("b"));
        assert_eq!(store.len(), 2);

        let removed = store.remove(&RequestId::new("a"));
        assert_eq!(removed.unwrap().id, RequestId::new("a"));
        assert!(store.remove(&RequestId::new("a")).is_none());

        let all = store.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn overflow_evicts_the_most_recently_added() {
        let mut store = FailedStore::new(3);
        assert!(store.add(descriptor("a")).is_none());
        assert!(store.add(descriptor("b")).is_none());
        assert!(store.add(descriptor("c")).is_none());

        let evicted = store.add(descriptor("d")).expect("store was full");
        assert_eq!(evicted.id, RequestId::new("c"));

        let ids: Vec<String> = store.get_all().iter().map(|d| d.id.to_string()).collect();
        assert_eq!(ids, ["a", "b", "d"]);
    }

    #[test]
    fn drain_returns_oldest_first() {
        let mut store = FailedStore::new(10);
        store.add(descriptor("a"));
        store.add(descriptor("b"));
        let drained = store.drain_all();
        assert_eq!(drained[0].id, RequestId::new("a"));
        assert_eq!(drained[1].id, RequestId::new("b"));
        assert!(store.is_empty());
    }
}
