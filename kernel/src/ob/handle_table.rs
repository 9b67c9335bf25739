//! Handle Table Implementation
//!
//! A handle table maps small integer handles to opaque pointers with a
//! per-entry flag word. Tables start small and grow by doubling; handle
//! numbers are stable across growth. Allocation is first-fit from a
//! lazily maintained free-slot hint, so freed low numbers are reclaimed
//! preferentially.
//!
//! The high bit of the flag word is reserved as the internal allocated
//! marker; callers see and set only the remaining bits.
//!
//! All operations serialize on an internal queued lock unless the table
//! was created for a caller that guarantees single-threaded access.
//!
//! # Usage
//! ```
//! use core::ffi::c_void;
//! use core::ptr::NonNull;
//! use kernel::ob::handle_table::{ConcurrencyMode, HandleTable, INVALID_HANDLE_VALUE};
//!
//! let table = HandleTable::create(ConcurrencyMode::AlwaysLock, None).unwrap();
//! let value = NonNull::new(0x1000 as *mut c_void).unwrap();
//! let mut handle = INVALID_HANDLE_VALUE;
//! table.create_handle(value, 0, &mut handle).unwrap();
//! assert_eq!(handle, 0);
//! assert_eq!(table.get_handle_value(handle, None), Some(value));
//! ```

use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr::NonNull;

use crate::ke::queued_lock::QueuedLock;
use crate::status::{KResult, Status};

/// Handle type (unsigned 32-bit)
pub type Handle = u32;

/// Invalid handle value
pub const INVALID_HANDLE_VALUE: Handle = 0xFFFF_FFFF;

/// Handle numbers must stay below this bound
pub const MAX_HANDLES: usize = 1 << 28;

/// Entry count of a freshly created table
const INITIAL_TABLE_SIZE: usize = 16;

/// Bit marking an entry as allocated, invisible to callers
const ALLOCATED_BIT: u32 = 1 << 31;

/// Mask of the caller-visible flag bits
const CALLER_FLAGS_MASK: u32 = !ALLOCATED_BIT;

bitflags! {
    /// Per-entry flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// Entry is in use
        const ALLOCATED = ALLOCATED_BIT;
        const _ = !0;
    }
}

/// Keep only the caller-visible bits of a raw flag word
fn caller_flags(raw: u32) -> HandleFlags {
    HandleFlags::from_bits_retain(raw & CALLER_FLAGS_MASK)
}

/// Callback invoked on every successful handle dereference
///
/// Runs with the table lock still held; it must not call back into any
/// table operation.
pub type HandleLookupCallback = fn(&HandleTable, Handle, NonNull<c_void>);

/// How the table synchronizes its operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Take the internal lock around every operation
    AlwaysLock,
    /// Skip the lock; the caller promises all access happens on a
    /// single thread
    CallerGuaranteesSingleThreaded,
}

/// One slot of the table
#[derive(Clone, Copy)]
struct HandleEntry {
    /// Flag word; zero exactly when the slot is free
    flags: HandleFlags,
    /// Stored value, present exactly when allocated
    value: Option<NonNull<c_void>>,
}

impl Default for HandleEntry {
    fn default() -> Self {
        Self {
            flags: HandleFlags::empty(),
            value: None,
        }
    }
}

/// Mutable table state, guarded by the lock
struct TableInner {
    /// Backing array, grows by doubling and never shrinks
    entries: Vec<HandleEntry>,
    /// Lower bound for the next allocation scan
    next_handle: usize,
    /// Highest slot that may be allocated; recomputed downward lazily
    max_handle: usize,
}

/// Growable handle table
#[repr(C)]
pub struct HandleTable {
    /// Serializes table operations in AlwaysLock mode
    lock: QueuedLock,
    /// Locking policy fixed at creation
    mode: ConcurrencyMode,
    /// Invoked on every successful get, never on iteration
    lookup: Option<HandleLookupCallback>,
    /// Entry array and scan bookkeeping
    inner: UnsafeCell<TableInner>,
}

// Safety: all access to inner goes through lock_table; in the unlocked
// mode the caller guarantees single-threaded use.
unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

/// Scope guard pairing lock_table with release
struct TableGuard<'a> {
    lock: Option<&'a QueuedLock>,
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.release();
        }
    }
}

impl HandleTable {
    /// Create a new table with the initial capacity
    ///
    /// Must be called from a context that may block (the allocation and
    /// the internal lock are not usable at elevated priority).
    pub fn create(
        mode: ConcurrencyMode,
        lookup: Option<HandleLookupCallback>,
    ) -> KResult<Self> {
        let mut entries = Vec::new();
        if entries.try_reserve_exact(INITIAL_TABLE_SIZE).is_err() {
            return Err(Status::InsufficientResources);
        }

        entries.resize_with(INITIAL_TABLE_SIZE, HandleEntry::default);
        Ok(Self {
            lock: QueuedLock::new(),
            mode,
            lookup,
            inner: UnsafeCell::new(TableInner {
                entries,
                next_handle: 0,
                max_handle: 0,
            }),
        })
    }

    /// Take the table lock according to the concurrency mode
    fn lock_table(&self) -> TableGuard<'_> {
        match self.mode {
            ConcurrencyMode::AlwaysLock => {
                self.lock.acquire();
                TableGuard {
                    lock: Some(&self.lock),
                }
            }
            ConcurrencyMode::CallerGuaranteesSingleThreaded => TableGuard { lock: None },
        }
    }

    /// Allocate a handle for `value`
    ///
    /// If `*handle` is `INVALID_HANDLE_VALUE` the scan starts at the
    /// free-slot hint; otherwise `*handle` is the minimum acceptable
    /// handle number and the scan starts there. The table grows as
    /// needed. On success the chosen number is written back through
    /// `handle`.
    pub fn create_handle(
        &self,
        value: NonNull<c_void>,
        flags: u32,
        handle: &mut Handle,
    ) -> KResult<()> {
        let _guard = self.lock_table();
        let inner = unsafe { &mut *self.inner.get() };

        let from_hint = *handle == INVALID_HANDLE_VALUE;
        let mut index = if from_hint {
            inner.next_handle
        } else {
            *handle as usize
        };

        loop {
            if index >= inner.entries.len() {
                Self::expand(inner, index)?;
            }

            if !inner.entries[index].flags.contains(HandleFlags::ALLOCATED) {
                break;
            }

            index += 1;
        }

        let entry = &mut inner.entries[index];
        entry.flags = HandleFlags::ALLOCATED | caller_flags(flags);
        entry.value = Some(value);

        if from_hint {
            inner.next_handle = index + 1;
        }

        if index > inner.max_handle {
            inner.max_handle = index;
        }

        *handle = index as Handle;
        Ok(())
    }

    /// Free a handle
    ///
    /// Out-of-range or already-free handles are silently ignored, so
    /// destroy is idempotent.
    pub fn destroy_handle(&self, handle: Handle) {
        let _guard = self.lock_table();
        let inner = unsafe { &mut *self.inner.get() };

        let index = handle as usize;
        if index >= inner.entries.len() {
            return;
        }

        let entry = &mut inner.entries[index];
        if !entry.flags.contains(HandleFlags::ALLOCATED) {
            return;
        }

        entry.flags = HandleFlags::empty();
        entry.value = None;

        // Lower the hint so low numbers get reclaimed first.
        if index < inner.next_handle {
            inner.next_handle = index;
        }
    }

    /// Store `value` at exactly `handle`, growing the table if needed
    ///
    /// Unlike create_handle the number is mandatory, so this doubles as
    /// "create at this exact number". Returns the previous value and
    /// caller-visible flags of the slot (None and 0 if it was free).
    pub fn replace_handle(
        &self,
        handle: Handle,
        value: NonNull<c_void>,
        flags: u32,
    ) -> KResult<(Option<NonNull<c_void>>, u32)> {
        debug_assert_ne!(handle, INVALID_HANDLE_VALUE);

        let _guard = self.lock_table();
        let inner = unsafe { &mut *self.inner.get() };

        let index = handle as usize;
        if index >= inner.entries.len() {
            Self::expand(inner, index)?;
        }

        let entry = &mut inner.entries[index];
        let old_value = entry.value.take();
        let old_flags = entry.flags.bits() & CALLER_FLAGS_MASK;
        entry.flags = HandleFlags::ALLOCATED | caller_flags(flags);
        entry.value = Some(value);

        if index > inner.max_handle {
            inner.max_handle = index;
        }

        Ok((old_value, old_flags))
    }

    /// Look up the value stored at `handle`
    ///
    /// Returns None for out-of-range or unallocated handles. On success
    /// the caller-visible flags are written through `flags` (when
    /// given) and the lookup callback, if one was registered, runs
    /// before the value is returned.
    pub fn get_handle_value(
        &self,
        handle: Handle,
        flags: Option<&mut u32>,
    ) -> Option<NonNull<c_void>> {
        let _guard = self.lock_table();

        let index = handle as usize;
        let value;
        {
            let inner = unsafe { &*self.inner.get() };
            if index >= inner.entries.len() {
                return None;
            }

            let entry = &inner.entries[index];
            if !entry.flags.contains(HandleFlags::ALLOCATED) {
                return None;
            }

            value = entry.value?;
            if let Some(flags) = flags {
                *flags = entry.flags.bits() & CALLER_FLAGS_MASK;
            }
        }

        // The callback runs with the lock still held; it must not call
        // back into the table.
        if let Some(lookup) = self.lookup {
            lookup(self, handle, value);
        }

        Some(value)
    }

    /// Read, and optionally overwrite, the caller-visible flags of
    /// `handle`
    ///
    /// `flags` receives the pre-call flag bits. With `set` the entry's
    /// caller-visible bits are replaced by the passed-in value; the
    /// internal allocated marker is preserved.
    pub fn get_set_handle_flags(
        &self,
        handle: Handle,
        set: bool,
        flags: &mut u32,
    ) -> KResult<()> {
        let _guard = self.lock_table();
        let inner = unsafe { &mut *self.inner.get() };

        let index = handle as usize;
        if index >= inner.entries.len() {
            return Err(Status::InvalidHandle);
        }

        let entry = &mut inner.entries[index];
        if !entry.flags.contains(HandleFlags::ALLOCATED) {
            return Err(Status::InvalidHandle);
        }

        let previous = entry.flags.bits() & CALLER_FLAGS_MASK;
        if set {
            entry.flags = HandleFlags::ALLOCATED | caller_flags(*flags);
        }

        *flags = previous;
        Ok(())
    }

    /// Find the highest allocated handle
    ///
    /// Scans backward from the cached watermark and caches the result,
    /// so repeated calls after many frees stay cheap. Returns None for
    /// an empty table.
    pub fn get_highest_handle(&self) -> Option<Handle> {
        let _guard = self.lock_table();
        let inner = unsafe { &mut *self.inner.get() };

        let mut index = inner.max_handle;
        debug_assert!(index < inner.entries.len());
        loop {
            if inner.entries[index].flags.contains(HandleFlags::ALLOCATED) {
                inner.max_handle = index;
                return Some(index as Handle);
            }

            if index == 0 {
                inner.max_handle = 0;
                return None;
            }

            index -= 1;
        }
    }

    /// Visit every allocated handle in ascending number order
    ///
    /// The lock is held for the whole iteration and the callback gets
    /// `(handle, caller_flags, value)`. The lookup callback is not
    /// invoked. The callback must not call back into the table; that
    /// would try to re-acquire the lock and deadlock.
    pub fn iterate<F>(&self, mut callback: F)
    where
        F: FnMut(Handle, u32, NonNull<c_void>),
    {
        let _guard = self.lock_table();
        let inner = unsafe { &*self.inner.get() };

        for index in 0..=inner.max_handle {
            let entry = &inner.entries[index];
            if !entry.flags.contains(HandleFlags::ALLOCATED) {
                continue;
            }

            if let Some(value) = entry.value {
                callback(
                    index as Handle,
                    entry.flags.bits() & CALLER_FLAGS_MASK,
                    value,
                );
            }
        }
    }

    /// Grow the array so `index` becomes addressable
    fn expand(inner: &mut TableInner, index: usize) -> KResult<()> {
        if index >= MAX_HANDLES {
            return Err(Status::TooManyHandles);
        }

        let mut new_capacity = inner.entries.len();
        while new_capacity <= index {
            let doubled = match new_capacity.checked_mul(2) {
                Some(doubled) => doubled,
                None => return Err(Status::TooManyHandles),
            };

            if doubled
                .checked_mul(core::mem::size_of::<HandleEntry>())
                .is_none()
            {
                return Err(Status::TooManyHandles);
            }

            if doubled <= new_capacity {
                return Err(Status::TooManyHandles);
            }

            new_capacity = doubled;
        }

        let additional = new_capacity - inner.entries.len();
        if inner.entries.try_reserve_exact(additional).is_err() {
            return Err(Status::InsufficientResources);
        }

        inner.entries.resize_with(new_capacity, HandleEntry::default);
        Ok(())
    }
}
