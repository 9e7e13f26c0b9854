use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Heap entry: smallest key first, push order among equal keys.
#[derive(Debug)]
pub(crate) struct Prioritized<K, T> {
    pub key: K,
    pub seq: u64,
    pub item: T,
}

impl<K: Ord, T> PartialEq for Prioritized<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<K: Ord, T> Eq for Prioritized<K, T> {}

impl<K: Ord, T> PartialOrd for Prioritized<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Prioritized<K, T> {
    // BinaryHeap is a max-heap, so both comparisons are reversed.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Thread-safe min-heap keyed by `K` with FIFO tie-breaking.
pub struct PriorityQueue<K, T> {
    heap: Arc<Mutex<BinaryHeap<Prioritized<K, T>>>>,
    seq: Arc<AtomicU64>,
}

impl<K: Ord, T> PriorityQueue<K, T> {
    pub fn new() -> Self {
        Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, key: K, item: T) {
        let mut heap = self.heap.lock();
        // Stamped under the heap lock so sequence order matches insertion order.
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        heap.push(Prioritized { key, seq, item });
    }

    pub fn pop(&self) -> Option<T> {
        self.heap.lock().pop().map(|entry| entry.item)
    }

    pub fn pop_with_key(&self) -> Option<(K, T)> {
        self.heap.lock().pop().map(|entry| (entry.key, entry.item))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn clear(&self) {
        self.heap.lock().clear();
    }
}

impl<K: Ord + Clone, T> PriorityQueue<K, T> {
    pub fn peek_key(&self) -> Option<K> {
        self.heap.lock().peek().map(|entry| entry.key.clone())
    }
}

impl<K: Ord, T> Default for PriorityQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for PriorityQueue<K, T> {
    fn clone(&self) -> Self {
        Self {
            heap: Arc::clone(&self.heap),
            seq: Arc::clone(&self.seq),
        }
    }
}

impl<K, T> std::fmt::Debug for PriorityQueue<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::thread;

    #[test]
    fn test_priority_queue() {
        let queue = PriorityQueue::new();

        queue.push(3, "low");
        queue.push(0, "realtime");
        queue.push(2, "normal");

        assert_eq!(queue.peek_key(), Some(0));
        assert_eq!(queue.pop(), Some("realtime"));
        assert_eq!(queue.peek_key(), Some(2));
        assert_eq!(queue.pop(), Some("normal"));
        assert_eq!(queue.pop(), Some("low"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_fifo_among_equal_keys() {
        let queue = PriorityQueue::new();
        for i in 0..10 {
            queue.push(1, i);
        }
        queue.push(0, 100);

        assert_eq!(queue.len(), 11);
        assert_eq!(queue.pop(), Some(100));
        let rest: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(rest, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_sequences_pop_sorted_and_stable() {
        let mut rng = rand::thread_rng();
        let queue = PriorityQueue::new();
        let mut pushed = 0usize;

        for _ in 0..2000 {
            if rng.gen_bool(0.6) {
                queue.push(rng.gen_range(0..8u32), pushed);
                pushed += 1;
            } else {
                queue.pop();
            }
        }

        let mut last: Option<(u32, usize)> = None;
        while let Some((key, order)) = queue.pop_with_key() {
            if let Some((last_key, last_order)) = last {
                assert!(key >= last_key);
                if key == last_key {
                    assert!(order > last_order);
                }
            }
            last = Some((key, order));
        }
    }

    #[test]
    fn test_concurrent_push_pop() {
        let queue = PriorityQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(i % 7, t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        let mut count = 0;
        let mut last = 0;
        while let Some((key, _)) = queue.pop_with_key() {
            assert!(key >= last);
            last = key;
            count += 1;
        }
        assert_eq!(count, 1000);
        assert!(queue.is_empty());
    }
}
