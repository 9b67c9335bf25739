//! Object Wait Queue
//!
//! The wait queue is the signal/wait primitive every blocking lock in the
//! kernel is built on. Its entire state is one atomic word holding one of
//! four values:
//!
//! - **NotSignaled**: no signal pending, no thread has begun waiting.
//! - **NotSignaledWithWaiters**: no signal pending, at least one thread
//!   has gone (or is going) to sleep on the queue.
//! - **SignaledForOne**: exactly one waiter may consume the signal and
//!   proceed; consuming it returns the queue to NotSignaled.
//! - **Signaled**: all waiters may proceed; the state persists until
//!   explicitly unsignaled.
//!
//! Transitions happen only through compare-and-swap, so a signal can
//! never be lost between a waiter's check and its sleep: the waiter
//! first publishes itself by moving NotSignaled to
//! NotSignaledWithWaiters, and signalers always overwrite that marker
//! with a signaled value.
//!
//! # Usage
//! ```
//! use kernel::ob::wait_queue::{SignalOption, WaitQueue, WAIT_TIME_INDEFINITE};
//!
//! let queue = WaitQueue::new();
//! queue.signal(SignalOption::SignalAll);
//! assert!(queue.wait(WAIT_TIME_INDEFINITE).is_ok());
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal;
use crate::status::{KResult, Status};

/// Wait forever; a wait with this timeout can only end by a signal
pub const WAIT_TIME_INDEFINITE: u32 = u32::MAX;

const NOT_SIGNALED: u32 = 0;
const NOT_SIGNALED_WITH_WAITERS: u32 = 1;
const SIGNALED_FOR_ONE: u32 = 2;
const SIGNALED: u32 = 3;

/// Decoded signal state of a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// No signal pending, no waiters have registered
    NotSignaled,
    /// No signal pending, waiters are present
    NotSignaledWithWaiters,
    /// One waiter may consume the signal
    SignaledForOne,
    /// All waiters may proceed until the queue is unsignaled
    Signaled,
}

/// How to signal a wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOption {
    /// Release every current and future waiter until unsignaled
    SignalAll,
    /// Release exactly one waiter
    SignalOne,
    /// Clear a signaled state without releasing anyone
    Unsignal,
}

/// One-slot signal/wait primitive
#[repr(C)]
pub struct WaitQueue {
    /// Signal state word, one of the four state values
    state: AtomicU32,
}

impl WaitQueue {
    /// Create a new queue in the not-signaled state
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(NOT_SIGNALED),
        }
    }

    /// Read the current signal state
    ///
    /// Diagnostic only; the state may change the moment it is read.
    pub fn signal_state(&self) -> SignalState {
        match self.state.load(Ordering::Acquire) {
            NOT_SIGNALED_WITH_WAITERS => SignalState::NotSignaledWithWaiters,
            SIGNALED_FOR_ONE => SignalState::SignaledForOne,
            SIGNALED => SignalState::Signaled,
            _ => SignalState::NotSignaled,
        }
    }

    /// Attempt to consume a pending signal without blocking
    ///
    /// Returns true if the caller may proceed. On false the caller has
    /// been registered as a waiter (the state word carries the waiters
    /// marker) and must go on to block.
    fn wait_fast(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                SIGNALED => return true,
                SIGNALED_FOR_ONE => {
                    // Try to consume the one-shot signal.
                    match self.state.compare_exchange(
                        SIGNALED_FOR_ONE,
                        NOT_SIGNALED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return true,
                        Err(observed) => current = observed,
                    }
                }
                NOT_SIGNALED => {
                    // Publish ourselves as a waiter before sleeping so a
                    // signal issued after this point cannot be lost.
                    match self.state.compare_exchange(
                        NOT_SIGNALED,
                        NOT_SIGNALED_WITH_WAITERS,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(observed) => current = observed,
                    }
                }
                _ => return false,
            }
        }
    }

    /// Wait until the queue is signaled or the timeout expires
    ///
    /// `timeout_ms` of 0 polls once; `WAIT_TIME_INDEFINITE` never times
    /// out. A finite timeout needs a registered time counter; without
    /// one the wait degrades to indefinite.
    pub fn wait(&self, timeout_ms: u32) -> KResult<()> {
        if self.wait_fast() {
            return Ok(());
        }

        if timeout_ms == 0 {
            return Err(Status::Timeout);
        }

        let indefinite = timeout_ms == WAIT_TIME_INDEFINITE;
        let start = if indefinite { 0 } else { hal::time_counter_ms() };

        loop {
            if self.state.load(Ordering::Acquire) >= SIGNALED_FOR_ONE {
                if self.wait_fast() {
                    return Ok(());
                }

                continue;
            }

            core::hint::spin_loop();
            if !indefinite
                && hal::time_counter_ms().wrapping_sub(start) >= u64::from(timeout_ms)
            {
                // One last consume attempt so a signal that raced the
                // deadline still wins over the timeout.
                if self.wait_fast() {
                    return Ok(());
                }

                return Err(Status::Timeout);
            }
        }
    }

    /// Signal the queue
    ///
    /// `SignalAll` moves to the persistent signaled state and releases
    /// everyone. `SignalOne` releases exactly one waiter (or leaves a
    /// one-shot signal pending if nobody is waiting). `Unsignal` clears
    /// a signaled state; it never erases the waiters marker.
    pub fn signal(&self, option: SignalOption) {
        match option {
            SignalOption::SignalAll => {
                self.state.swap(SIGNALED, Ordering::AcqRel);
            }
            SignalOption::SignalOne => {
                let mut current = self.state.load(Ordering::Acquire);
                loop {
                    if current == SIGNALED || current == SIGNALED_FOR_ONE {
                        return;
                    }

                    match self.state.compare_exchange(
                        current,
                        SIGNALED_FOR_ONE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(observed) => current = observed,
                    }
                }
            }
            SignalOption::Unsignal => {
                let mut current = self.state.load(Ordering::Acquire);
                loop {
                    if current == NOT_SIGNALED || current == NOT_SIGNALED_WITH_WAITERS {
                        return;
                    }

                    match self.state.compare_exchange(
                        current,
                        NOT_SIGNALED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
