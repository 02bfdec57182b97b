//! Synchronization support.
//!
//! The scheduler and its wait queues belong to the surrounding operating
//! system; the core only needs one primitive the host does not provide out of
//! the box: a counting semaphore. It regulates concurrent access to a finite
//! set of resources by maintaining a count of available permits, and it
//! doubles as an event signal when initialized with zero permits.
//!
//! [`Semaphore::wait`] returns a [`Permit`] RAII guard that releases the
//! permit when dropped, so permits are returned on every exit path. Event
//! consumers that must not hand the permit back call [`Permit::forget`].

use std::sync::{Condvar, Mutex};

/// Counting semaphore.
///
/// A semaphore maintains a set of permits. A permit is acquired by
/// [`wait`] and released by dropping the returned [`Permit`] or by an
/// explicit [`signal`]. Unlike a mutex, more than one caller may hold a
/// permit at a time.
///
/// [`wait`]: Semaphore::wait
/// [`signal`]: Semaphore::signal
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a new semaphore initialized with `permits` available permits.
    ///
    /// A semaphore created with zero permits acts as an event: the first
    /// [`wait`] blocks until somebody calls [`signal`].
    ///
    /// [`wait`]: Semaphore::wait
    /// [`signal`]: Semaphore::signal
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// If no permits are available, this blocks the calling thread until
    /// another thread releases one. The returned [`Permit`] releases the
    /// permit when dropped.
    pub fn wait(&self) -> Permit<'_> {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
        Permit { sema: self }
    }

    /// Acquires a permit without blocking, if one is available.
    pub fn try_wait(&self) -> Option<Permit<'_>> {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(Permit { sema: self })
    }

    /// Releases a permit back to the semaphore.
    ///
    /// Increases the number of available permits by one and wakes one
    /// blocked waiter, if any. Normally invoked through [`Permit`]'s drop;
    /// call it directly to signal an event on a zero-initialized semaphore.
    pub fn signal(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        drop(permits);
        self.cond.notify_one();
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        *self.permits.lock().unwrap()
    }
}

/// An RAII guard for one acquired semaphore permit.
///
/// When this structure is dropped (falls out of scope), the semaphore is
/// signaled. This structure is created by the [`wait`] and [`try_wait`]
/// methods on [`Semaphore`].
///
/// [`wait`]: Semaphore::wait
/// [`try_wait`]: Semaphore::try_wait
pub struct Permit<'a> {
    sema: &'a Semaphore,
}

impl Permit<'_> {
    /// Consume the permit without releasing it.
    ///
    /// Used by event consumers: each signaled event is consumed exactly once
    /// and must not be re-posted when the guard goes out of scope.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}
