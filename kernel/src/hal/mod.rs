//! Hardware Abstraction Layer Hooks
//!
//! The kernel core needs two services from the surrounding platform: a
//! monotonic millisecond time counter (for timed waits) and the identity of
//! the running thread (for lock ownership diagnostics). Both are provided
//! as routines registered once at boot by the platform layer. Until a
//! routine is registered the corresponding query returns 0, which callers
//! treat as "unavailable": timed waits cannot measure time, and ownership
//! assertions are suppressed.
//!
//! # Usage
//! ```ignore
//! fn read_tick_count() -> u64 {
//!     // read the platform timer
//!     0
//! }
//!
//! hal::set_time_counter(read_tick_count);
//! let now = hal::time_counter_ms();
//! ```

use core::sync::atomic::{AtomicUsize, Ordering};

/// Routine returning a monotonic millisecond counter
pub type TimeCounterRoutine = fn() -> u64;

/// Routine returning a nonzero identifier for the calling thread
pub type ThreadIdRoutine = fn() -> usize;

/// Registered time counter routine, 0 when unregistered
static TIME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Registered thread identity routine, 0 when unregistered
static THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Register the platform time counter. Expected to be called once during
/// boot, before any timed waits are issued.
pub fn set_time_counter(routine: TimeCounterRoutine) {
    TIME_COUNTER.store(routine as usize, Ordering::Release);
}

/// Query the current monotonic time in milliseconds.
///
/// Returns 0 if no time counter has been registered.
pub fn time_counter_ms() -> u64 {
    let raw = TIME_COUNTER.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }

    // Nonzero values only ever come from set_time_counter, so the cast
    // back to a routine pointer is sound.
    let routine: TimeCounterRoutine = unsafe { core::mem::transmute(raw) };
    routine()
}

/// Register the platform thread identity source. The routine must never
/// return 0 for a real thread; 0 is reserved for "no source registered".
pub fn set_thread_id_source(routine: ThreadIdRoutine) {
    THREAD_ID.store(routine as usize, Ordering::Release);
}

/// Query the identity of the calling thread.
///
/// Returns 0 if no source has been registered. Ownership bookkeeping in
/// the lock primitives treats 0 as "unknown" and skips its assertions.
pub fn current_thread_id() -> usize {
    let raw = THREAD_ID.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }

    let routine: ThreadIdRoutine = unsafe { core::mem::transmute(raw) };
    routine()
}
