//! Bounded multi-producer, multi-consumer queue
//!
//! Capacity is tracked with two semaphores: `slots` (free capacity) and
//! `ready` (items available). Waiting on either is cancel-safe, so pollers
//! can race a wait against a stop signal without losing items.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};

/// Bounded FIFO shared by producers and workers
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Semaphore,
    capacity: usize,
    sealed: AtomicBool,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    /// Largest capacity a queue can track
    pub const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

    /// Create a queue holding at most `capacity` items
    ///
    /// `capacity` is clamped to `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Self::MAX_CAPACITY);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue `item`, waiting up to `timeout` for a free slot
    ///
    /// A zero timeout never waits. On failure the item is handed back.
    pub async fn offer(&self, item: T, timeout: Duration) -> Result<(), T> {
        match acquire(&self.slots, timeout).await {
            Some(permit) => {
                permit.forget();
                self.items.lock().push_back(item);
                self.ready.add_permits(1);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Enqueue without waiting
    pub fn try_offer(&self, item: T) -> Result<(), T> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.items.lock().push_back(item);
                self.ready.add_permits(1);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Dequeue the oldest item, waiting up to `timeout` for one to arrive
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let permit = acquire(&self.ready, timeout).await?;
        permit.forget();
        self.take_one()
    }

    /// Dequeue without waiting
    pub fn try_poll(&self) -> Option<T> {
        match self.ready.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.take_one()
            }
            Err(_) => None,
        }
    }

    /// Remove up to `max` items currently available, oldest first
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.ready.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    match self.items.lock().pop_front() {
                        Some(item) => out.push(item),
                        None => break,
                    }
                }
                Err(TryAcquireError::NoPermits) => break,
                Err(TryAcquireError::Closed) => {
                    let mut items = self.items.lock();
                    let n = (max - out.len()).min(items.len());
                    out.extend(items.drain(..n));
                    break;
                }
            }
        }
        if !out.is_empty() && !self.is_sealed() {
            self.slots.add_permits(out.len());
        }
        out
    }

    /// Stop accepting offers; pending and future `offer` calls fail at once
    ///
    /// Items already queued can still be polled.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        self.slots.close();
    }

    /// Seal and stop handing out items; waiting pollers return `None`
    pub fn close(&self) {
        self.seal();
        self.closed.store(true, Ordering::SeqCst);
        self.ready.close();
    }

    /// Close the queue and discard whatever is left, returning the count
    pub fn close_and_clear(&self) -> usize {
        self.close();
        let mut items = self.items.lock();
        let discarded = items.len();
        items.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_one(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() && !self.is_sealed() {
            self.slots.add_permits(1);
        }
        item
    }
}

async fn acquire(semaphore: &Semaphore, timeout: Duration) -> Option<SemaphorePermit<'_>> {
    if timeout.is_zero() {
        return semaphore.try_acquire().ok();
    }
    match tokio::time::timeout(timeout, semaphore.acquire()).await {
        Ok(Ok(permit)) => Some(permit),
        _ => None,
    }
}
