use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::Mutex,
};

use tokio::sync::Semaphore;

/// An async bounded priority queue. Smallest item first.
///
/// - [`push`] blocks while the queue is full. This is the backpressure that
///   bounds how many rows the DB producer claims.
/// - [`pop`] blocks while the queue is empty.
/// - `len() <= capacity` holds at all times.
///
/// Two semaphores carry the synchronization: `free` holds one
/// permit per open slot, `items` one permit per queued item. Permits are
/// forgotten on one side and re-added on the other, so the heap mutex is
/// only ever held for a non-blocking push/pop.
///
/// Both [`push`] and [`pop`] are cancel safe: their only await point is the
/// semaphore acquire, and the permit is not consumed until it resolves.
///
/// [`push`]: PriorityQueue::push
/// [`pop`]: PriorityQueue::pop
pub struct PriorityQueue<T: Ord> {
    heap: Mutex<BinaryHeap<Reverse<T>>>,
    free: Semaphore,
    items: Semaphore,
}

impl<T: Ord> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::with_capacity(capacity)),
            free: Semaphore::new(capacity),
            items: Semaphore::new(0),
        }
    }

    /// Enqueue `item`, waiting for a free slot if the queue is full.
    pub async fn push(&self, item: T) {
        let permit = self
            .free
            .acquire()
            .await
            .expect("queue semaphores are never closed");
        permit.forget();
        self.heap.lock().unwrap().push(Reverse(item));
        self.items.add_permits(1);
    }

    /// Dequeue the smallest item, waiting if the queue is empty.
    pub async fn pop(&self) -> T {
        let permit = self
            .items
            .acquire()
            .await
            .expect("queue semaphores are never closed");
        permit.forget();
        let Reverse(item) = self
            .heap
            .lock()
            .unwrap()
            .pop()
            .expect("item permit implies a queued item");
        self.free.add_permits(1);
        item
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
