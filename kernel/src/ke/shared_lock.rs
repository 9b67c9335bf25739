//! Shared-Exclusive Lock Implementation
//!
//! A reader/writer lock built from one atomic state word and one wait
//! queue. The state word is 0 when free, a count 1..EXCLUSIVE-1 while
//! that many readers hold it, and the EXCLUSIVE sentinel while a single
//! writer holds it.
//!
//! Writers get a starvation-avoidance policy: a writer publishes its
//! intent through the `exclusive_waiting` flag before competing for the
//! state word, and readers refuse to join while the flag is up. The last
//! reader out hands the lock to the waiting writer with a one-shot
//! signal.
//!
//! All blocked threads share a single binary event rather than a
//! counting semaphore. Every wake therefore means "re-check the state",
//! never "you now own the lock", and threads that clear the event must
//! re-issue any wake their clear may have raced with.
//!
//! # Usage
//! ```
//! use kernel::ke::shared_lock::SharedExclusiveLock;
//!
//! let lock = SharedExclusiveLock::create();
//! lock.acquire_shared();
//! assert!(lock.is_held_shared());
//! lock.release_shared();
//!
//! lock.acquire_exclusive();
//! assert!(lock.is_held_exclusive());
//! lock.release_exclusive();
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ob::wait_queue::{SignalOption, WaitQueue, WAIT_TIME_INDEFINITE};

/// State value meaning "held by one writer"
const EXCLUSIVE: u32 = u32::MAX;

/// Reader/writer lock with writer priority
///
/// Dropping the last reference frees the lock; the caller must ensure no
/// thread can still be waiting on it at that point.
#[repr(C)]
pub struct SharedExclusiveLock {
    /// 0 = free, 1..EXCLUSIVE-1 = reader count, EXCLUSIVE = one writer
    state: AtomicU32,
    /// A writer is attempting to acquire; new readers stand aside
    exclusive_waiting: AtomicBool,
    /// Event every blocked thread parks on
    event: WaitQueue,
}

impl SharedExclusiveLock {
    /// Create a new unheld lock
    pub fn new() -> Self {
        let lock = Self {
            state: AtomicU32::new(0),
            exclusive_waiting: AtomicBool::new(false),
            event: WaitQueue::new(),
        };

        lock.event.signal(SignalOption::SignalOne);
        lock
    }

    /// Create a new reference-counted lock
    pub fn create() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Acquire the lock shared, blocking while a writer holds it or is
    /// waiting for it
    pub fn acquire_shared(&self) {
        let mut have_waited = false;
        loop {
            let current = self.state.load(Ordering::SeqCst);
            let writer_waiting = self.exclusive_waiting.load(Ordering::SeqCst);
            if !writer_waiting && current < EXCLUSIVE - 1 {
                match self.state.compare_exchange(
                    current,
                    current + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        // A whole cohort of readers may be parked on the
                        // single event. The one that gets through
                        // re-broadcasts to release its siblings.
                        if have_waited {
                            self.event.signal(SignalOption::SignalAll);
                        }

                        return;
                    }
                    Err(_) => continue,
                }
            }

            // A writer is pending or the count is saturated. Clear the
            // event before parking, then re-check for a release that
            // raced the clear.
            self.event.signal(SignalOption::Unsignal);
            if self.state.load(Ordering::SeqCst) != current {
                // The clear may have eaten the wake that release
                // issued. Re-broadcast it; woken threads re-check the
                // state and park again if they must.
                self.event.signal(SignalOption::SignalAll);
                continue;
            }

            if current == 0 && self.exclusive_waiting.load(Ordering::SeqCst) {
                // Last-reader-to-writer handoff raced the clear above;
                // the one-shot wake may be gone. Re-issue it as a
                // broadcast so the parked writer cannot be stranded.
                self.event.signal(SignalOption::SignalAll);
            }

            let result = self.event.wait(WAIT_TIME_INDEFINITE);
            debug_assert!(result.is_ok());
            have_waited = true;
        }
    }

    /// Release a shared hold
    ///
    /// The last reader out wakes a waiting writer.
    pub fn release_shared(&self) {
        let previous = self.state.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(previous, 0);
        debug_assert_ne!(previous, EXCLUSIVE);

        if previous == 1 && self.exclusive_waiting.load(Ordering::SeqCst) {
            self.event.signal(SignalOption::SignalOne);
        }
    }

    /// Acquire the lock exclusive, blocking until every reader has left
    pub fn acquire_exclusive(&self) {
        loop {
            // Publish intent before competing for the state word so
            // arriving readers divert to the blocked path.
            self.exclusive_waiting.store(true, Ordering::SeqCst);
            let observed = match self.state.compare_exchange(
                0,
                EXCLUSIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => observed,
            };

            self.event.signal(SignalOption::Unsignal);
            if self.state.load(Ordering::SeqCst) < observed {
                // A release slipped in between the swap attempt and the
                // clear; try again before parking.
                continue;
            }

            let result = self.event.wait(WAIT_TIME_INDEFINITE);
            debug_assert!(result.is_ok());
        }
    }

    /// Release an exclusive hold, waking all blocked threads
    pub fn release_exclusive(&self) {
        debug_assert!(self.exclusive_waiting.load(Ordering::SeqCst));
        debug_assert_eq!(self.state.load(Ordering::SeqCst), EXCLUSIVE);

        self.exclusive_waiting.store(false, Ordering::SeqCst);
        self.state.store(0, Ordering::SeqCst);

        // Both blocked readers and blocked writers race to re-check the
        // state; a writer or a cohort of readers will win.
        self.event.signal(SignalOption::SignalAll);
    }

    /// Check if the lock is held in either mode. Diagnostic only.
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::SeqCst) != 0
    }

    /// Check if the lock is held by a writer. Diagnostic only.
    pub fn is_held_exclusive(&self) -> bool {
        self.state.load(Ordering::SeqCst) == EXCLUSIVE
    }

    /// Check if the lock is held by at least one reader. Diagnostic only.
    pub fn is_held_shared(&self) -> bool {
        let state = self.state.load(Ordering::SeqCst);
        state != 0 && state != EXCLUSIVE
    }
}

impl Default for SharedExclusiveLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_round_trip() {
        let lock = SharedExclusiveLock::new();
        assert!(!lock.is_held());

        lock.acquire_shared();
        lock.acquire_shared();
        assert!(lock.is_held_shared());
        assert!(!lock.is_held_exclusive());

        lock.release_shared();
        assert!(lock.is_held_shared());
        lock.release_shared();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_exclusive_round_trip() {
        let lock = SharedExclusiveLock::new();
        lock.acquire_exclusive();
        assert!(lock.is_held());
        assert!(lock.is_held_exclusive());
        assert!(!lock.is_held_shared());

        lock.release_exclusive();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_readers_share_concurrently() {
        const READERS: usize = 4;

        let lock = SharedExclusiveLock::create();
        let barrier = Arc::new(Barrier::new(READERS));
        let mut handles = Vec::new();
        for _ in 0..READERS {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                lock.acquire_shared();

                // Only satisfiable if all readers are inside at once.
                barrier.wait();
                lock.release_shared();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!lock.is_held());
    }

    #[test]
    fn test_writers_exclude_each_other_and_readers() {
        const WRITERS: usize = 2;
        const READERS: usize = 2;
        const ITERATIONS: usize = 2_000;

        struct Shared {
            lock: SharedExclusiveLock,
            counter: UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SharedExclusiveLock::new(),
            counter: UnsafeCell::new(0),
        });

        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    shared.lock.acquire_exclusive();
                    unsafe { *shared.counter.get() += 1 };
                    shared.lock.release_exclusive();
                }
            }));
        }

        for _ in 0..READERS {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    shared.lock.acquire_shared();
                    let first = unsafe { *shared.counter.get() };
                    let second = unsafe { *shared.counter.get() };
                    assert_eq!(first, second);
                    shared.lock.release_shared();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, WRITERS * ITERATIONS);
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let lock = SharedExclusiveLock::create();
        let writer_in = Arc::new(AtomicBool::new(false));

        lock.acquire_shared();

        let writer = {
            let lock = Arc::clone(&lock);
            let writer_in = Arc::clone(&writer_in);
            thread::spawn(move || {
                lock.acquire_exclusive();
                writer_in.store(true, Ordering::SeqCst);
                lock.release_exclusive();
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!writer_in.load(Ordering::SeqCst));

        lock.release_shared();
        writer.join().unwrap();
        assert!(writer_in.load(Ordering::SeqCst));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_pending_writer_blocks_new_readers() {
        let lock = SharedExclusiveLock::create();
        let sequence = Arc::new(AtomicUsize::new(0));

        lock.acquire_shared();

        let writer = {
            let lock = Arc::clone(&lock);
            let sequence = Arc::clone(&sequence);
            thread::spawn(move || {
                lock.acquire_exclusive();
                let order = sequence.fetch_add(1, Ordering::SeqCst);
                lock.release_exclusive();
                order
            })
        };

        // Give the writer time to publish its intent.
        thread::sleep(Duration::from_millis(30));

        let reader = {
            let lock = Arc::clone(&lock);
            let sequence = Arc::clone(&sequence);
            thread::spawn(move || {
                lock.acquire_shared();
                let order = sequence.fetch_add(1, Ordering::SeqCst);
                lock.release_shared();
                order
            })
        };

        thread::sleep(Duration::from_millis(30));
        lock.release_shared();

        let writer_order = writer.join().unwrap();
        let reader_order = reader.join().unwrap();
        assert!(writer_order < reader_order);
    }

    #[test]
    fn test_writer_not_starved_by_reader_churn() {
        const READERS: usize = 4;
        const WRITER_ROUNDS: usize = 25;

        let lock = SharedExclusiveLock::create();
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..READERS {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            readers.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    lock.acquire_shared();
                    std::hint::spin_loop();
                    lock.release_shared();
                }
            }));
        }

        for _ in 0..WRITER_ROUNDS {
            lock.acquire_exclusive();
            lock.release_exclusive();
        }

        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }

        assert!(!lock.is_held());
    }
}
