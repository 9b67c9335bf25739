//! Kernel Spinlock Implementation
//!
//! Spinlocks provide mutual exclusion for short critical sections.
//! They busy-wait (spin) until the lock becomes available and must
//! never be held across a blocking wait.
//!
//! The owner field is diagnostic bookkeeping only; correctness rests
//! entirely on the atomic held flag.
//!
//! # Usage
//! ```
//! use kernel::ke::spinlock::SpinLock;
//!
//! let lock = SpinLock::new(0u32);
//! {
//!     let mut guard = lock.lock();
//!     *guard += 1;
//! }
//! assert!(!lock.is_locked());
//! ```

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::hal;

/// A spinlock protecting a value of type T
#[repr(C)]
pub struct SpinLock<T> {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// Thread that currently holds the lock, 0 when free or unknown
    owner: AtomicUsize,
    /// Protected data
    data: UnsafeCell<T>,
}

// SpinLock is Sync if T is Send (data can be sent between threads)
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the spinlock, returning a guard that releases on drop
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let thread = hal::current_thread_id();
        if thread != 0 {
            // A thread spinning on a lock it already holds never exits
            // the loop. Catch that before spinning.
            debug_assert_ne!(self.owner.load(Ordering::Relaxed), thread);
        }

        // Spin until we acquire the lock
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin with a hint to reduce power consumption
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.owner.store(thread, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without blocking
    ///
    /// Returns Some(guard) if successful, None if lock is held
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(hal::current_thread_id(), Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Check if the lock is currently held
    ///
    /// Diagnostic only; the answer may be stale by the time it is read.
    #[inline]
    pub fn is_locked(&self) -> bool {
        // Read via an atomic or-with-zero so the peek is a single
        // read-modify-write on every target.
        self.locked.fetch_or(false, Ordering::Relaxed)
    }
}

/// RAII guard for spinlock
///
/// Releases the lock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Clear owner before the flag flips; after release another
        // thread may store its own identity immediately.
        self.lock.owner.store(0, Ordering::Relaxed);
        let was_held = self.lock.locked.swap(false, Ordering::Release);
        debug_assert!(was_held);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A raw spinlock without data protection
///
/// Use when you need to protect external data or need
/// more control over the critical section.
#[repr(C)]
pub struct RawSpinLock {
    locked: AtomicBool,
    owner: AtomicUsize,
}

impl RawSpinLock {
    /// Create a new unlocked spinlock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
        }
    }

    /// Reset an existing lock to the unlocked state
    ///
    /// Performed with an atomic exchange rather than a plain store so
    /// the reset is fully ordered before the lock's address is handed
    /// to other processors.
    #[inline]
    pub fn initialize(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.locked.swap(false, Ordering::AcqRel);
    }

    /// Acquire the lock
    #[inline]
    pub fn acquire(&self) {
        let thread = hal::current_thread_id();
        if thread != 0 {
            debug_assert_ne!(self.owner.load(Ordering::Relaxed), thread);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.owner.store(thread, Ordering::Relaxed);
    }

    /// Release the lock
    ///
    /// The exchange doubles as a release barrier for the critical
    /// section's writes.
    #[inline]
    pub fn release(&self) {
        self.owner.store(0, Ordering::Relaxed);
        let was_held = self.locked.swap(false, Ordering::Release);
        debug_assert!(was_held);
    }

    /// Try to acquire without blocking, returning whether the lock
    /// was taken
    #[inline]
    pub fn try_acquire(&self) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(hal::current_thread_id(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Check if the lock is currently held
    ///
    /// Diagnostic only; not valid for control-flow decisions under
    /// contention.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.locked.fetch_or(false, Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}
