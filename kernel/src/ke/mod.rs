//! Kernel Executive (ke)
//!
//! Low-level synchronization primitives used throughout the kernel:
//!
//! - **Spinlocks**: Busy-wait locks for short critical sections
//! - **Queued Locks**: Blocking mutual exclusion built on wait queues
//! - **Shared-Exclusive Locks**: Reader/writer locks with writer priority
//!
//! Spinlocks stand alone; the blocking locks park their waiters on
//! [`crate::ob::wait_queue`] queues and learn about time and thread
//! identity through the routines registered with [`crate::hal`].

pub mod queued_lock;
pub mod shared_lock;
pub mod spinlock;

// Re-export key types
pub use queued_lock::QueuedLock;
pub use shared_lock::SharedExclusiveLock;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
