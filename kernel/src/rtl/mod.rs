//! Runtime Library (rtl)
//!
//! Common data structures used throughout the kernel:
//!
//! - **Red-Black Trees**: Index-linked self-balancing search trees,
//!   laid out in a flat arena so external tools can walk them

pub mod rbtree;

// Re-exports for convenience
pub use rbtree::{RbNode, RbTree};
