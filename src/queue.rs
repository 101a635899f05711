//! Bounded drop-oldest FIFO queue, one per destination
//!
//! Ingress must never stall on a slow consumer: when the ring is full
//! the oldest entry is discarded and the enqueue succeeds. Operators
//! watch the drop counters instead. All operations take the single
//! internal mutex briefly and never across I/O.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity ring of owned metric lines.
pub struct Queue {
    inner: Mutex<VecDeque<Box<[u8]>>>,
    capacity: usize,
}

impl Queue {
    /// Allocates a queue with room for `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends `line`, dropping the oldest entry when full. Never fails.
    ///
    /// Returns `true` when an old entry had to be dropped to make room.
    pub fn enqueue(&self, line: Box<[u8]>) -> bool {
        let mut q = self.inner.lock().unwrap();
        let mut dropped = false;
        if q.len() == self.capacity {
            q.pop_front();
            dropped = true;
        }
        q.push_back(line);
        dropped
    }

    /// Removes and returns the oldest entry, if any.
    pub fn dequeue(&self) -> Option<Box<[u8]>> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pops up to `n` entries under a single lock acquisition.
    ///
    /// Batching the dequeue keeps lock contention with the enqueuing
    /// dispatchers low at high line rates.
    pub fn dequeue_vector(&self, n: usize) -> Vec<Box<[u8]>> {
        let mut q = self.inner.lock().unwrap();
        let take = n.min(q.len());
        q.drain(..take).collect()
    }

    /// Reinserts `line` at the head so it is dequeued next.
    ///
    /// Fails when the queue is full, handing the line back to the
    /// caller; used by senders to return the unwritten tail of a batch
    /// after a broken connection.
    pub fn putback(&self, line: Box<[u8]>) -> Result<(), Box<[u8]>> {
        let mut q = self.inner.lock().unwrap();
        if q.len() == self.capacity {
            return Err(line);
        }
        q.push_front(line);
        Ok(())
    }

    /// Approximate number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate number of free slots.
    pub fn free(&self) -> usize {
        self.capacity - self.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Exchanges the queued contents with `other`.
    ///
    /// Used by the reload path to hand in-flight lines from a retiring
    /// sender to its successor for the same destination. Both locks are
    /// taken; callers must ensure only one transplant runs at a time,
    /// which the reload coordinator does.
    pub fn swap(&self, other: &Queue) {
        let mut a = self.inner.lock().unwrap();
        let mut b = other.inner.lock().unwrap();
        std::mem::swap(&mut *a, &mut *b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Box<[u8]> {
        s.as_bytes().into()
    }

    #[test]
    fn enqueue_dequeue_is_fifo() {
        let q = Queue::new(4);
        q.enqueue(line("a"));
        q.enqueue(line("b"));
        assert_eq!(q.dequeue().as_deref(), Some(b"a".as_ref()));
        assert_eq!(q.dequeue().as_deref(), Some(b"b".as_ref()));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let q = Queue::new(2);
        assert!(!q.enqueue(line("a")));
        assert!(!q.enqueue(line("b")));
        assert!(q.enqueue(line("c")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue().as_deref(), Some(b"b".as_ref()));
        assert_eq!(q.dequeue().as_deref(), Some(b"c".as_ref()));
    }

    #[test]
    fn dequeue_vector_takes_at_most_n() {
        let q = Queue::new(8);
        for i in 0..5 {
            q.enqueue(line(&i.to_string()));
        }
        let batch = q.dequeue_vector(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(&*batch[0], b"0");
        assert_eq!(q.len(), 2);
        let rest = q.dequeue_vector(10);
        assert_eq!(rest.len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn putback_goes_to_head_and_respects_capacity() {
        let q = Queue::new(2);
        q.enqueue(line("b"));
        assert!(q.putback(line("a")).is_ok());
        assert_eq!(q.putback(line("x")), Err(line("x")));
        assert_eq!(q.dequeue().as_deref(), Some(b"a".as_ref()));
    }

    #[test]
    fn len_never_exceeds_capacity() {
        let q = Queue::new(3);
        for i in 0..50 {
            q.enqueue(line(&i.to_string()));
            assert!(q.len() <= q.capacity());
        }
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = Queue::new(4);
        let b = Queue::new(4);
        a.enqueue(line("old"));
        a.swap(&b);
        assert!(a.is_empty());
        assert_eq!(b.dequeue().as_deref(), Some(b"old".as_ref()));
    }
}
