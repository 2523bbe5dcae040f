//! Bounded command queue between ingestion sessions and execution workers.
//!
//! A fixed ring of slots guarded by the classic producer-consumer trio:
//! - `free`: counts empty slots, producers wait on it while the ring is full
//! - `filled`: counts occupied slots, consumers wait on it while it is empty
//! - `ring`: mutual exclusion over the head/tail indices
//!
//! A session blocked in `enqueue` stops reading from its socket, which is
//! how a traffic burst beyond the capacity turns into TCP backpressure.

use crate::sync::Semaphore;
use parking_lot::Mutex;

/// Ring storage and its cursors.
struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Next slot to fill.
    tail: usize,
    /// Next slot to drain.
    head: usize,
}

/// Fixed-capacity, blocking, multi-producer multi-consumer FIFO.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    free: Semaphore,
    filled: Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            ring: Mutex::new(Ring {
                slots,
                tail: 0,
                head: 0,
            }),
            free: Semaphore::new(capacity),
            filled: Semaphore::new(0),
            capacity,
        }
    }

    /// Append an item, blocking while the queue is full.
    pub fn enqueue(&self, item: T) {
        self.free.acquire();
        {
            let mut ring = self.ring.lock();
            let tail = ring.tail;
            ring.slots[tail] = Some(item);
            ring.tail = (tail + 1) % self.capacity;
        }
        self.filled.release();
    }

    /// Remove the oldest item, blocking while the queue is empty.
    pub fn dequeue(&self) -> T {
        self.filled.acquire();
        let item = {
            let mut ring = self.ring.lock();
            let head = ring.head;
            ring.head = (head + 1) % self.capacity;
            ring.slots[head].take()
        };
        self.free.release();

        // `filled` guarantees the slot at `head` was written before we got here.
        item.unwrap_or_else(|| unreachable!("filled permit without a queued item"))
    }

    /// Maximum number of items held at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items waiting to be dequeued.
    ///
    /// Only a snapshot; producers and consumers may change it immediately.
    pub fn len(&self) -> usize {
        self.filled.available()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
