use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// What happened to the queue on a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// The oldest item made room; `burst_start` is true for the first drop
    /// since the queue last ran empty
    DroppedOldest { burst_start: bool },
}

/// Bounded hand-off between a producer and one async consumer.
///
/// When full, the oldest item is discarded so the newest always gets in.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    overflowing: AtomicBool,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            overflowing: AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: T) -> Pushed {
        let outcome = {
            let mut items = self.items.lock();
            let outcome = if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Pushed::DroppedOldest {
                    burst_start: !self.overflowing.swap(true, Ordering::Relaxed),
                }
            } else {
                Pushed::Queued
            };
            items.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Take up to `max` items, oldest first
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let n = items.len().min(max);
        let batch: Vec<T> = items.drain(..n).collect();
        if items.is_empty() {
            self.overflowing.store(false, Ordering::Relaxed);
        }
        batch
    }

    /// Wait for the next push; returns at once if one happened since the last wait
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items discarded to make room since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
