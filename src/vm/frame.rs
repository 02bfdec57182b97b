//! Physical frame pool.
//!
//! A bounded allocator of 4-KiB frames standing in for the machine's user
//! page pool. A [`Frame`] is a cloneable handle: the page table, a shared
//! mmap kpage, and an in-flight write-back task may all hold the same frame.
//! When the last handle drops, the frame's slot returns to the pool.

use crate::PAGE_SIZE;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct PoolState {
    in_use: usize,
    capacity: usize,
}

/// A bounded pool of page frames.
pub struct FramePool {
    state: Arc<Mutex<PoolState>>,
}

impl FramePool {
    /// Create a pool of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        log::info!(
            "frame pool: {} frames ({} KiB)",
            capacity,
            capacity * PAGE_SIZE / 1024
        );
        Self {
            state: Arc::new(Mutex::new(PoolState {
                in_use: 0,
                capacity,
            })),
        }
    }

    /// Allocate a zero-filled frame, or `None` when the pool is exhausted.
    pub fn alloc_zeroed(&self) -> Option<Frame> {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_use == state.capacity {
                return None;
            }
            state.in_use += 1;
        }
        Some(Frame {
            inner: Arc::new(FrameInner {
                data: Mutex::new([0; PAGE_SIZE]),
                pool: Arc::downgrade(&self.state),
            }),
        })
    }

    /// Number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.state.lock().unwrap().in_use
    }

    /// Total number of frames.
    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }
}

struct FrameInner {
    data: Mutex<[u8; PAGE_SIZE]>,
    pool: Weak<Mutex<PoolState>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().unwrap().in_use -= 1;
        }
    }
}

/// A handle on one allocated page frame.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    /// Lock the frame contents for inspection or modification.
    pub fn contents(&self) -> MutexGuard<'_, [u8; PAGE_SIZE]> {
        self.inner.data.lock().unwrap()
    }

    /// Whether two handles refer to the same frame.
    pub fn same_as(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
