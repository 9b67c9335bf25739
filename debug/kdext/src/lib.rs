//! Kernel Debugger Extensions
//!
//! Host-side commands that reconstruct kernel data structures from a raw
//! view of target memory. The debugger front end supplies a
//! [`DebuggerContext`] that can read target memory, size target types,
//! and resolve member offsets from symbol information; the extensions
//! here never dereference target addresses directly, so they work the
//! same against a live target, a core dump, or a synthetic image.
//!
//! # Usage
//!
//! ```ignore
//! let mut context = attach_to_target()?;
//! kdext::mdl::extension_mdl(&mut context, list_address)?;
//! ```

use std::fmt;

pub mod mdl;
pub mod tree;

/// Failures surfaced while servicing an extension command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdError {
    /// A target memory read did not complete.
    ReadFailed,
    /// The symbol information does not describe the requested type.
    UnknownType,
    /// The type exists but has no member with the requested name.
    UnknownMember,
    /// A structure walk ran into links no intact target could contain.
    CorruptTree,
}

impl fmt::Display for KdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KdError::ReadFailed => "target memory read failed",
            KdError::UnknownType => "unknown type",
            KdError::UnknownMember => "unknown member",
            KdError::CorruptTree => "tree links are corrupt",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for KdError {}

/// Services the debugger front end provides to extension commands.
///
/// Addresses are always target virtual addresses. Implementations decide
/// how reads are satisfied (live session, crash dump, replay trace).
pub trait DebuggerContext {
    /// Reads `buffer.len()` bytes of target memory starting at `address`.
    fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), KdError>;

    /// Reads one instance of the named target type at `address`.
    ///
    /// The returned buffer's length is the target's size for that type,
    /// which callers use as the element stride when walking arrays.
    fn read_type(&mut self, address: u64, type_name: &str) -> Result<Vec<u8>, KdError>;

    /// Resolves the byte offset of `member` within the named target type.
    fn member_offset(&mut self, type_name: &str, member: &str) -> Result<u64, KdError>;

    /// Size of a target pointer in bytes.
    fn pointer_size(&self) -> u8;

    /// Writes formatted text to the debugger console.
    fn print(&mut self, output: fmt::Arguments);
}

/// Reads a little-endian `u32` from target memory.
pub fn read_u32(context: &mut dyn DebuggerContext, address: u64) -> Result<u32, KdError> {
    let mut buffer = [0u8; 4];
    context.read_memory(address, &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

/// Reads a little-endian `u64` from target memory.
pub fn read_u64(context: &mut dyn DebuggerContext, address: u64) -> Result<u64, KdError> {
    let mut buffer = [0u8; 8];
    context.read_memory(address, &mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

/// Reads a pointer-sized value from target memory, widened to 64 bits.
pub fn read_pointer(context: &mut dyn DebuggerContext, address: u64) -> Result<u64, KdError> {
    if context.pointer_size() == 4 {
        Ok(u64::from(read_u32(context, address)?))
    } else {
        read_u64(context, address)
    }
}
