//! Memory Manager (mm)
//!
//! Address space bookkeeping:
//!
//! - **Memory Descriptor Lists**: Typed, non-overlapping range maps
//!   with coalescing, carving, and strategy-driven allocation
//!
//! # Key Structures
//!
//! - `MdList`: An address space map backed by a red-black tree
//! - `MemoryDescriptor`: One typed range of the space

pub mod mdl;

// Re-exports for convenience
pub use mdl::{AllocationStrategy, MdList, MemoryDescriptor, MemoryType};
