//! Object Manager (ob)
//!
//! Object lifetime and identity services:
//!
//! - **Wait Queues**: The signal/wait building block every blocking
//!   primitive parks its threads on
//! - **Handle Tables**: Translation from small integer handles to
//!   kernel object pointers, with per-handle flags
//!
//! # Key Structures
//!
//! - `WaitQueue`: Four-state signal object
//! - `HandleTable`: Growable slot table with free-slot reuse

pub mod handle_table;
pub mod wait_queue;

// Re-exports for convenience
pub use handle_table::{
    ConcurrencyMode, Handle, HandleFlags, HandleTable, INVALID_HANDLE_VALUE, MAX_HANDLES,
};
pub use wait_queue::{SignalOption, WaitQueue, WAIT_TIME_INDEFINITE};
