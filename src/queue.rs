//! Bounded FIFO queues for inter-process hand-off.
//!
//! Elements are opaque strings serialized by the handler runtime. A queue's
//! capacity is fixed at creation: `push` suspends while the queue is full,
//! `pop` while it is empty. Any number of producers and consumers may share
//! a queue; per-producer and per-consumer ordering is preserved.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

pub struct ByteQueue {
    items: Mutex<VecDeque<String>>,
    /// Permits for free slots; acquired by `push`, released by `pop`.
    space: Semaphore,
    /// Permits for queued elements; acquired by `pop`, released by `push`.
    ready: Semaphore,
}

impl ByteQueue {
    pub fn new(max_size: usize) -> Self {
        // A zero-capacity queue would wedge both ends; treat it as capacity 1.
        let capacity = max_size.max(1);
        ByteQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Append an element, waiting for a free slot if the queue is full.
    pub async fn push(&self, obj: String) {
        self.space
            .acquire()
            .await
            .expect("queue semaphore closed")
            .forget();
        self.items
            .lock()
            .expect("queue lock poisoned")
            .push_back(obj);
        self.ready.add_permits(1);
    }

    /// Remove the head element, waiting for one if the queue is empty.
    pub async fn pop(&self) -> String {
        self.ready
            .acquire()
            .await
            .expect("queue semaphore closed")
            .forget();
        let obj = self
            .items
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
            .expect("ready permit without a queued element");
        self.space.add_permits(1);
        obj
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
