//! Queued Lock Implementation
//!
//! A queued lock is the kernel's blocking mutex for thread context at or
//! below dispatch level. Unlike spinlocks, a contended acquire parks the
//! caller on the lock's wait queue instead of burning the CPU for the
//! whole critical section.
//!
//! The lock is a thin wrapper around a wait queue primed into the
//! signaled-for-one state: the first acquire consumes that signal without
//! blocking, and every release signals for exactly one new owner. It is
//! not recursive; a thread acquiring a lock it already holds is a
//! programming error caught by a debug assertion.
//!
//! # Usage
//! ```
//! use kernel::ke::queued_lock::QueuedLock;
//!
//! let lock = QueuedLock::create();
//! lock.acquire();
//! // ... critical section ...
//! lock.release();
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::hal;
use crate::ob::wait_queue::{SignalOption, SignalState, WaitQueue, WAIT_TIME_INDEFINITE};
use crate::status::KResult;

/// Blocking mutual-exclusion lock
///
/// Dropping the last reference frees the lock; the caller must ensure no
/// thread can still be waiting on it at that point.
#[repr(C)]
pub struct QueuedLock {
    /// Underlying wait queue, signaled-for-one exactly when the lock
    /// is free
    queue: WaitQueue,
    /// Thread that currently holds the lock, 0 when free or unknown
    owner: AtomicUsize,
}

impl QueuedLock {
    /// Create a new lock, primed so the first acquire does not block
    pub fn new() -> Self {
        let lock = Self {
            queue: WaitQueue::new(),
            owner: AtomicUsize::new(0),
        };

        lock.queue.signal(SignalOption::SignalOne);
        lock
    }

    /// Create a new reference-counted lock
    pub fn create() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Acquire the lock, blocking until it is available
    pub fn acquire(&self) {
        let result = self.acquire_timed(WAIT_TIME_INDEFINITE);

        // An indefinite wait can only end in success.
        debug_assert!(result.is_ok());
    }

    /// Acquire the lock, giving up after `timeout_ms` milliseconds
    ///
    /// A timeout of 0 polls once; `WAIT_TIME_INDEFINITE` never times
    /// out. On timeout the lock state is untouched.
    pub fn acquire_timed(&self, timeout_ms: u32) -> KResult<()> {
        let thread = hal::current_thread_id();
        if thread != 0 {
            // Recursive acquisition would deadlock on the wait below.
            debug_assert_ne!(self.owner.load(Ordering::Relaxed), thread);
        }

        self.queue.wait(timeout_ms)?;
        self.owner.store(thread, Ordering::Relaxed);
        Ok(())
    }

    /// Release the lock, waking exactly one waiter
    pub fn release(&self) {
        debug_assert!(self.is_held());

        let thread = hal::current_thread_id();
        let owner = self.owner.swap(0, Ordering::Relaxed);
        if thread != 0 && owner != 0 {
            debug_assert_eq!(owner, thread);
        }

        // Signal for one so only a single new owner may proceed.
        self.queue.signal(SignalOption::SignalOne);
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns true if the lock was taken.
    pub fn try_acquire(&self) -> bool {
        self.acquire_timed(0).is_ok()
    }

    /// Check if the lock is currently held
    ///
    /// The lock is free exactly when its queue sits in the
    /// signaled-for-one state. Diagnostic only.
    pub fn is_held(&self) -> bool {
        self.queue.signal_state() != SignalState::SignaledForOne
    }
}

impl Default for QueuedLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use core::cell::UnsafeCell;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_first_acquire_does_not_block() {
        let lock = QueuedLock::new();
        assert!(!lock.is_held());

        lock.acquire();
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_try_acquire() {
        crate::hal::test_support::install();

        let lock = QueuedLock::create();
        assert!(lock.try_acquire());
        assert!(lock.is_held());

        let contender = Arc::clone(&lock);
        let taken = thread::spawn(move || contender.try_acquire())
            .join()
            .unwrap();
        assert!(!taken);

        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_acquire_timed_times_out() {
        crate::hal::test_support::install();

        let lock = QueuedLock::create();
        lock.acquire();

        let contender = Arc::clone(&lock);
        let result = thread::spawn(move || contender.acquire_timed(30))
            .join()
            .unwrap();
        assert_eq!(result, Err(Status::Timeout));

        // The timed-out waiter must not have corrupted the lock.
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_release_wakes_waiter() {
        crate::hal::test_support::install();

        let lock = QueuedLock::create();
        lock.acquire();

        let contender = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            contender.acquire();
            contender.release();
        });

        thread::sleep(Duration::from_millis(20));
        lock.release();
        waiter.join().unwrap();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_mutual_exclusion() {
        crate::hal::test_support::install();

        const THREADS: usize = 4;
        const ITERATIONS: usize = 5_000;

        struct Shared {
            lock: QueuedLock,
            counter: UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: QueuedLock::new(),
            counter: UnsafeCell::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    shared.lock.acquire();
                    unsafe { *shared.counter.get() += 1 };
                    shared.lock.release();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, THREADS * ITERATIONS);
    }
}
