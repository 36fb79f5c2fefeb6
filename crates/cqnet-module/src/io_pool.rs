//! `IoBufferPool`: bounded cache of reusable I/O operations.
//!
//! The free list is a lock-free `ArrayQueue` whose capacity is the
//! high-water mark: `acquire` never blocks (it allocates on a miss) and a
//! `release` that finds the list full destroys the operation instead.

use cqnet_core::op::{IoOperation, IO_BUFFER_SIZE};

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct IoBufferPool {
    free: ArrayQueue<Box<IoOperation>>,
    buffer_size: usize,
    /// Operations created by this pool and not yet destroyed.
    live: AtomicUsize,
}

impl IoBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self::with_buffer_size(capacity, IO_BUFFER_SIZE)
    }

    pub fn with_buffer_size(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            live: AtomicUsize::new(0),
        }
    }

    /// An idle operation, allocated if the free list is empty.
    pub fn acquire(&self) -> Box<IoOperation> {
        match self.free.pop() {
            Some(op) => op,
            None => {
                self.live.fetch_add(1, Ordering::Relaxed);
                IoOperation::with_capacity(self.buffer_size)
            }
        }
    }

    /// Reset `op` and keep it, or destroy it above the high-water mark.
    pub fn release(&self, mut op: Box<IoOperation>) {
        op.reset();
        if self.free.push(op).is_err() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl std::fmt::Debug for IoBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBufferPool")
            .field("capacity", &self.capacity())
            .field("idle", &self.idle())
            .field("live", &self.live())
            .finish()
    }
}
