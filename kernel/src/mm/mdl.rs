//! Memory Descriptor Lists
//!
//! A memory descriptor list (MDL) describes a physical or virtual
//! address space as a set of non-overlapping ranges, each tagged with
//! a memory type. Descriptors live in a red-black tree keyed by base
//! address, so lookup, insertion, and neighbor queries all stay
//! logarithmic even for firmware maps with thousands of entries.
//!
//! Adding a range is an overwrite: whatever the new range covers is
//! carved out of the existing descriptors first (clipping, splitting,
//! or swallowing them as needed), then the new range is coalesced
//! with same-typed neighbors so the list stays minimal.
//!
//! Free descriptors are additionally threaded onto size-class bins,
//! letting the any-address allocation strategy find a suitably sized
//! block without walking the whole tree.
//!
//! # Usage
//! ```
//! use kernel::mm::mdl::{AllocationStrategy, MdList, MemoryDescriptor, MemoryType};
//!
//! let mut list = MdList::new();
//! list.add_descriptor(&MemoryDescriptor::new(0x1000, 0x9000, MemoryType::Free))
//!     .unwrap();
//!
//! let address = list
//!     .allocate(
//!         0x1000,
//!         0x1000,
//!         0,
//!         u64::MAX,
//!         MemoryType::NonPagedPool,
//!         AllocationStrategy::LowestAddress,
//!     )
//!     .unwrap();
//!
//! assert_eq!(address, 0x1000);
//! assert_eq!(list.free_space, 0x7000);
//! ```

use core::cmp::Ordering;
use core::fmt;

use crate::rtl::rbtree::{RbTree, NIL};
use crate::status::{KResult, Status};

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Each bin covers four times the page count of the previous one
const BITS_PER_BIN: u32 = 2;

/// Number of free-descriptor size bins
const BIN_COUNT: usize = 8;

/// Suggested descriptor count for [`MdList::reserve_descriptors`]
/// refills
pub const DESCRIPTOR_BATCH: usize = 0x20;

/// Classification of a described memory range
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryType {
    /// Not a valid type; the zero value of an uninitialized descriptor
    #[default]
    Invalid = 0,
    /// Memory that should never be used
    Reserved,
    /// Memory available for allocation
    Free,
    /// Firmware memory reclaimable after boot services exit
    FirmwareTemporary,
    /// Firmware memory that must stay mapped forever
    FirmwarePermanent,
    /// ACPI tables, reclaimable once parsed
    AcpiTables,
    /// ACPI nonvolatile storage
    AcpiNvStorage,
    /// Memory with detected errors
    Bad,
    /// Loader memory reclaimable once the kernel is running
    LoaderTemporary,
    /// Loader memory the kernel must preserve
    LoaderPermanent,
    /// Active page table pages
    PageTables,
    /// Boot page tables replaced after memory management starts
    BootPageTables,
    /// Memory manager bootstrap structures
    MmStructures,
    /// Non-paged pool allocations
    NonPagedPool,
    /// Paged pool allocations
    PagedPool,
    /// Memory-mapped hardware registers
    Hardware,
    /// Device I/O buffers
    IoBuffer,
}

impl MemoryType {
    /// Check whether ranges of this type can be handed out by the
    /// allocator
    pub fn is_free(self) -> bool {
        matches!(self, MemoryType::Free)
    }

    /// Get the human readable name of the type
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Invalid => "Unknown Memory Type",
            MemoryType::Reserved => "Reserved",
            MemoryType::Free => "Free Memory",
            MemoryType::FirmwareTemporary => "Firmware Temporary",
            MemoryType::FirmwarePermanent => "Firmware Permanent",
            MemoryType::AcpiTables => "ACPI Tables",
            MemoryType::AcpiNvStorage => "ACPI Nonvolatile Storage",
            MemoryType::Bad => "Bad Memory",
            MemoryType::LoaderTemporary => "Loader Temporary",
            MemoryType::LoaderPermanent => "Loader Permanent",
            MemoryType::PageTables => "Page Tables",
            MemoryType::BootPageTables => "Boot Page Tables",
            MemoryType::MmStructures => "MM Init Structures",
            MemoryType::NonPagedPool => "Non-paged Pool",
            MemoryType::PagedPool => "Paged Pool",
            MemoryType::Hardware => "Hardware",
            MemoryType::IoBuffer => "IO Buffer",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Placement policy for [`MdList::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Take the first fitting block found through the size bins
    AnyAddress,
    /// Take the lowest fitting address
    LowestAddress,
    /// Take the highest fitting address
    HighestAddress,
}

/// One described range of address space
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDescriptor {
    /// First address of the range
    pub base_address: u64,
    /// Length of the range in bytes
    pub size: u64,
    /// Classification of the range
    pub mem_type: MemoryType,
    /// Next descriptor in the free bin, NIL for none
    bin_next: u32,
    /// Previous descriptor in the free bin, NIL for none
    bin_prev: u32,
}

impl MemoryDescriptor {
    /// Describe the half-open range `[base_address, end_address)`
    pub fn new(base_address: u64, end_address: u64, mem_type: MemoryType) -> Self {
        debug_assert!(end_address >= base_address);
        Self {
            base_address,
            size: end_address - base_address,
            mem_type,
            bin_next: NIL,
            bin_prev: NIL,
        }
    }

    /// Get the first address beyond the range
    pub fn end_address(&self) -> u64 {
        self.base_address + self.size
    }
}

fn compare_descriptors(left: &MemoryDescriptor, right: &MemoryDescriptor) -> Ordering {
    left.base_address.cmp(&right.base_address)
}

/// Head and tail of one free-descriptor size class
#[derive(Debug, Clone, Copy, Default)]
struct MdlBin {
    head: u32,
    tail: u32,
}

/// Pick the size bin for a block of `size` bytes
fn bin_index(size: u64) -> usize {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    ((pages.ilog2() / BITS_PER_BIN) as usize).min(BIN_COUNT - 1)
}

/// Round `value` up to the next multiple of `alignment`, or None on
/// overflow
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    let sum = value.checked_add(alignment - 1)?;
    Some(sum / alignment * alignment)
}

/// Round `value` down to a multiple of `alignment`
fn align_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

/// Find an aligned region of `size` bytes inside `descriptor`,
/// clamped to `[min_address, max_address)`, searching from the bottom
/// or the top of the block
fn fit_in(
    descriptor: &MemoryDescriptor,
    size: u64,
    alignment: u64,
    min_address: u64,
    max_address: u64,
    from_top: bool,
) -> Option<u64> {
    let base = descriptor.base_address;
    let end = descriptor.end_address();
    if end <= min_address || base >= max_address {
        return None;
    }

    let start = base.max(min_address);
    let end = end.min(max_address);
    if from_top {
        let aligned = align_down(end.checked_sub(size)?, alignment);
        if aligned < start {
            return None;
        }

        Some(aligned)
    } else {
        let aligned = align_up(start, alignment)?;
        let allocation_end = aligned.checked_add(size)?;
        if allocation_end > end {
            return None;
        }

        Some(aligned)
    }
}

/// An address space map of typed, non-overlapping ranges
#[repr(C)]
pub struct MdList {
    /// Descriptor storage, keyed by base address. Public so the
    /// debugger extension can locate the arena; treat as read-only.
    pub tree: RbTree<MemoryDescriptor>,
    /// Free descriptors, threaded by size class
    free_bins: [MdlBin; BIN_COUNT],
    /// Number of descriptors in the list
    pub descriptor_count: u32,
    /// Total bytes described, free or not
    pub total_space: u64,
    /// Bytes described by free descriptors
    pub free_space: u64,
}

impl MdList {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            tree: RbTree::new(compare_descriptors),
            free_bins: [MdlBin::default(); BIN_COUNT],
            descriptor_count: 0,
            total_space: 0,
            free_space: 0,
        }
    }

    /// Grow descriptor storage so the next `count` insertions cannot
    /// fail for lack of memory
    pub fn reserve_descriptors(&mut self, count: usize) -> KResult<()> {
        self.tree.reserve(count)
    }

    /// Find the descriptor containing or closest below `address`
    fn find_descriptor(&self, address: u64) -> Option<u32> {
        let probe = MemoryDescriptor {
            base_address: address,
            ..MemoryDescriptor::default()
        };

        self.tree.search_closest(&probe, false)
    }

    /// Thread a free descriptor onto the tail of its size bin
    fn insert_into_bin(&mut self, slot: u32) {
        let size = self.tree.value(slot).size;
        let bin = bin_index(size);
        let tail = self.free_bins[bin].tail;
        {
            let descriptor = self.tree.value_mut(slot);
            descriptor.bin_prev = tail;
            descriptor.bin_next = NIL;
        }

        if tail != NIL {
            self.tree.value_mut(tail).bin_next = slot;
        } else {
            self.free_bins[bin].head = slot;
        }

        self.free_bins[bin].tail = slot;
    }

    /// Unthread a free descriptor from its size bin
    ///
    /// Must run before the descriptor's size changes, since the bin is
    /// recomputed from it.
    fn remove_from_bin(&mut self, slot: u32) {
        let (size, next, previous) = {
            let descriptor = self.tree.value(slot);
            (descriptor.size, descriptor.bin_next, descriptor.bin_prev)
        };

        let bin = bin_index(size);
        if previous != NIL {
            self.tree.value_mut(previous).bin_next = next;
        } else {
            debug_assert_eq!(self.free_bins[bin].head, slot);
            self.free_bins[bin].head = next;
        }

        if next != NIL {
            self.tree.value_mut(next).bin_prev = previous;
        } else {
            debug_assert_eq!(self.free_bins[bin].tail, slot);
            self.free_bins[bin].tail = previous;
        }

        let descriptor = self.tree.value_mut(slot);
        descriptor.bin_next = NIL;
        descriptor.bin_prev = NIL;
    }

    /// Drop a descriptor from the list, updating the aggregates
    fn remove_descriptor(&mut self, slot: u32) {
        let (size, is_free) = {
            let descriptor = self.tree.value(slot);
            (descriptor.size, descriptor.mem_type.is_free())
        };

        if is_free {
            self.remove_from_bin(slot);
            debug_assert!(self.free_space >= size);
            self.free_space -= size;
        }

        self.tree.remove(slot);
        debug_assert!(self.descriptor_count >= 1);
        self.descriptor_count -= 1;
        debug_assert!(self.total_space >= size);
        self.total_space -= size;
    }

    /// Carve every existing descriptor overlapping
    /// `[new_base, new_end)` out of the list
    ///
    /// Returns the surviving descriptor closest below the range, if
    /// any, as the candidate for left coalescing. When `keep_type`
    /// matches a descriptor fully containing the range, nothing needs
    /// carving at all; the second return value reports that case.
    fn carve_range(
        &mut self,
        new_base: u64,
        new_end: u64,
        keep_type: Option<MemoryType>,
    ) -> KResult<(Option<u32>, bool)> {
        let mut existing = None;
        let mut current = new_end - 1;
        while current.wrapping_add(1) >= new_base {
            let slot = match self.find_descriptor(current) {
                Some(slot) => slot,
                None => break,
            };

            let (existing_base, existing_size, existing_type) = {
                let descriptor = self.tree.value(slot);
                (
                    descriptor.base_address,
                    descriptor.size,
                    descriptor.mem_type,
                )
            };

            let existing_end = existing_base + existing_size;
            if existing_end <= new_base {
                // No overlap; remember it for coalescing.
                existing = Some(slot);
                break;
            }

            if existing_base >= new_base {
                if existing_end > new_end {
                    // Overhangs the end of the range; clip its front.
                    let reduction = new_end - existing_base;
                    if existing_type.is_free() {
                        self.remove_from_bin(slot);
                    }

                    {
                        let descriptor = self.tree.value_mut(slot);
                        descriptor.base_address = new_end;
                        descriptor.size -= reduction;
                    }

                    self.total_space -= reduction;
                    if existing_type.is_free() {
                        self.insert_into_bin(slot);
                        self.free_space -= reduction;
                    }
                } else {
                    // Wholly inside the range; swallow it.
                    self.remove_descriptor(slot);
                }
            } else if existing_end > new_end {
                // The range sits strictly inside this descriptor.
                if keep_type == Some(existing_type) {
                    return Ok((None, true));
                }

                // Split off the part beyond the range, then shrink the
                // descriptor down to the part before it.
                let tail = MemoryDescriptor::new(new_end, existing_end, existing_type);
                let tail_slot = self.tree.insert(tail)?;
                if existing_type.is_free() {
                    self.remove_from_bin(slot);
                }

                self.tree.value_mut(slot).size = new_base - existing_base;
                if existing_type.is_free() {
                    self.insert_into_bin(slot);
                }

                self.descriptor_count += 1;
                self.total_space -= new_end - new_base;
                if existing_type.is_free() {
                    self.insert_into_bin(tail_slot);
                    self.free_space -= new_end - new_base;
                }

                existing = Some(slot);
                break;
            } else {
                // Overhangs the start of the range; shrink its tail.
                let reduction = existing_end - new_base;
                if existing_type.is_free() {
                    self.remove_from_bin(slot);
                }

                self.tree.value_mut(slot).size = new_base - existing_base;
                self.total_space -= reduction;
                if existing_type.is_free() {
                    self.insert_into_bin(slot);
                    self.free_space -= reduction;
                }

                existing = Some(slot);
                break;
            }

            if existing_base == 0 {
                break;
            }

            current = existing_base - 1;
        }

        Ok((existing, false))
    }

    /// Add a range to the list, overwriting whatever it overlaps
    ///
    /// Existing descriptors the range covers are clipped, split, or
    /// removed first; the result is then merged with same-typed
    /// neighbors.
    pub fn add_descriptor(&mut self, descriptor: &MemoryDescriptor) -> KResult<()> {
        let new_base = descriptor.base_address;
        let new_size = descriptor.size;
        let new_type = descriptor.mem_type;
        let new_end = new_base + new_size;
        debug_assert!(new_end > new_base);
        let new_is_free = new_type.is_free();

        let (existing, already_described) = self.carve_range(new_base, new_end, Some(new_type))?;
        if already_described {
            return Ok(());
        }

        // Coalesce with the neighbor below, then the neighbor above.
        let mut added = false;
        let mut next = None;
        if let Some(existing_slot) = existing {
            next = self.tree.next_node(existing_slot, false);
            let (existing_end, existing_type) = {
                let left = self.tree.value(existing_slot);
                (left.end_address(), left.mem_type)
            };

            if existing_type == new_type && existing_end == new_base {
                if new_is_free {
                    self.remove_from_bin(existing_slot);
                }

                self.tree.value_mut(existing_slot).size += new_size;
                self.total_space += new_size;
                if new_is_free {
                    self.insert_into_bin(existing_slot);
                    self.free_space += new_size;
                }

                added = true;

                // The grown descriptor may now also touch the one
                // above it.
                if let Some(next_slot) = next {
                    let (next_base, next_size, next_type) = {
                        let right = self.tree.value(next_slot);
                        (right.base_address, right.size, right.mem_type)
                    };

                    if next_type == existing_type && new_end == next_base {
                        if new_is_free {
                            self.remove_from_bin(existing_slot);
                        }

                        self.tree.value_mut(existing_slot).size += next_size;
                        self.total_space += next_size;
                        if new_is_free {
                            self.insert_into_bin(existing_slot);
                            self.free_space += next_size;
                        }

                        self.remove_descriptor(next_slot);
                    }
                }
            }
        } else {
            next = self.find_descriptor(new_end);
        }

        if !added {
            if let Some(next_slot) = next {
                let (next_base, next_type) = {
                    let right = self.tree.value(next_slot);
                    (right.base_address, right.mem_type)
                };

                if next_type == new_type && new_end == next_base {
                    if new_is_free {
                        self.remove_from_bin(next_slot);
                    }

                    {
                        let right = self.tree.value_mut(next_slot);
                        right.base_address = new_base;
                        right.size += new_size;
                    }

                    self.total_space += new_size;
                    if new_is_free {
                        self.insert_into_bin(next_slot);
                        self.free_space += new_size;
                    }

                    added = true;
                }
            }
        }

        if !added {
            let mut fresh = *descriptor;
            fresh.bin_next = NIL;
            fresh.bin_prev = NIL;
            let slot = self.tree.insert(fresh)?;
            self.descriptor_count += 1;
            self.total_space += new_size;
            if new_is_free {
                self.insert_into_bin(slot);
                self.free_space += new_size;
            }
        }

        Ok(())
    }

    /// Remove the half-open range `[start, end)` from the list,
    /// leaving it undescribed
    pub fn remove_range(&mut self, start: u64, end: u64) -> KResult<()> {
        debug_assert!(end > start);
        self.carve_range(start, end, None)?;
        Ok(())
    }

    /// Find a descriptor overlapping the half-open range
    /// `[start, end)`
    pub fn lookup_descriptor(&self, start: u64, end: u64) -> Option<&MemoryDescriptor> {
        debug_assert!(end > start);
        let slot = self.find_descriptor(end.wrapping_sub(1))?;
        let descriptor = self.tree.value(slot);
        if descriptor.base_address < end && descriptor.end_address() > start {
            Some(descriptor)
        } else {
            None
        }
    }

    /// Check whether `[start, end)` lies entirely inside one free
    /// descriptor
    pub fn is_range_free(&self, start: u64, end: u64) -> bool {
        debug_assert!(end > start);
        let slot = match self.find_descriptor(end.wrapping_sub(1)) {
            Some(slot) => slot,
            None => return false,
        };

        let descriptor = self.tree.value(slot);
        descriptor.mem_type.is_free()
            && descriptor.base_address <= start
            && descriptor.end_address() >= end
    }

    /// Scan the size bins for any block fitting the request
    fn find_any(
        &self,
        size: u64,
        alignment: u64,
        min_address: u64,
        max_address: u64,
    ) -> Option<(u32, u64)> {
        let mut bin = bin_index(size);
        while bin < BIN_COUNT {
            let mut slot = self.free_bins[bin].head;
            while slot != NIL {
                let descriptor = self.tree.value(slot);
                if let Some(aligned) =
                    fit_in(descriptor, size, alignment, min_address, max_address, false)
                {
                    return Some((slot, aligned));
                }

                slot = descriptor.bin_next;
            }

            bin += 1;
        }

        None
    }

    /// Walk the descriptors from one end of the address space for the
    /// first fitting free block
    fn find_edge(
        &self,
        size: u64,
        alignment: u64,
        min_address: u64,
        max_address: u64,
        from_top: bool,
    ) -> Option<(u32, u64)> {
        let mut current = if from_top {
            self.tree.highest()
        } else {
            self.tree.lowest()
        };

        while let Some(slot) = current {
            let descriptor = self.tree.value(slot);
            if descriptor.mem_type.is_free() {
                if let Some(aligned) =
                    fit_in(descriptor, size, alignment, min_address, max_address, from_top)
                {
                    return Some((slot, aligned));
                }
            }

            current = self.tree.next_node(slot, from_top);
        }

        None
    }

    /// Allocate `size` bytes of free space and retype it
    ///
    /// The returned address is a multiple of `alignment` (0 counts as
    /// 1), and the whole allocation lies inside
    /// `[min_address, max_address)`. The allocated range is recorded
    /// as a descriptor of `mem_type`; leftover head and tail pieces of
    /// the chosen block stay free.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        min_address: u64,
        max_address: u64,
        mem_type: MemoryType,
        strategy: AllocationStrategy,
    ) -> KResult<u64> {
        debug_assert!(size > 0);
        let alignment = if alignment == 0 { 1 } else { alignment };
        let found = match strategy {
            AllocationStrategy::AnyAddress => {
                self.find_any(size, alignment, min_address, max_address)
            }
            AllocationStrategy::LowestAddress => {
                self.find_edge(size, alignment, min_address, max_address, false)
            }
            AllocationStrategy::HighestAddress => {
                self.find_edge(size, alignment, min_address, max_address, true)
            }
        };

        let (slot, aligned) = match found {
            Some(found) => found,
            None => return Err(Status::InsufficientResources),
        };

        let original = *self.tree.value(slot);
        let original_end = original.end_address();
        let allocation_end = aligned + size;
        self.remove_descriptor(slot);

        // Give back the cut-off head and tail of the block, then
        // describe the allocation itself. If any piece cannot be
        // added, put the original descriptor back; adding it re-covers
        // whatever pieces already made it in.
        if aligned != original.base_address {
            let head = MemoryDescriptor::new(original.base_address, aligned, original.mem_type);
            if let Err(status) = self.add_descriptor(&head) {
                let _ = self.add_descriptor(&original);
                return Err(status);
            }
        }

        if allocation_end != original_end {
            let tail = MemoryDescriptor::new(allocation_end, original_end, original.mem_type);
            if let Err(status) = self.add_descriptor(&tail) {
                let _ = self.add_descriptor(&original);
                return Err(status);
            }
        }

        let allocation = MemoryDescriptor::new(aligned, allocation_end, mem_type);
        if let Err(status) = self.add_descriptor(&allocation) {
            let _ = self.add_descriptor(&original);
            return Err(status);
        }

        Ok(aligned)
    }

    /// Visit every descriptor in ascending base address order
    pub fn iterate<F>(&self, callback: F)
    where
        F: FnMut(&MemoryDescriptor),
    {
        self.tree.iterate(callback);
    }

    /// Write the list out as a table, cross-checking the stored
    /// aggregates against the walked descriptors
    ///
    /// Inconsistencies produce WARNING lines but never fail the dump.
    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "\n       Start Address    End Address  Size   Type\n")?;
        write!(out, "{:-<59}\n", "")?;

        let mut status = Ok(());
        let mut walked_count: u32 = 0;
        let mut walked_total: u64 = 0;
        let mut walked_free: u64 = 0;
        let mut previous_end: u64 = 0;
        self.tree.iterate(|descriptor| {
            if status.is_err() {
                return;
            }

            let end = descriptor.base_address + descriptor.size;
            if descriptor.base_address < previous_end {
                status = write!(
                    out,
                    "WARNING: Descriptor {:x} Base {:x} < PreviousEnd {:x}.\n",
                    walked_count, descriptor.base_address, previous_end
                );

                if status.is_err() {
                    return;
                }
            }

            status = write!(
                out,
                "    {:13x}  {:13x}  {:8x}  {}\n",
                descriptor.base_address, end, descriptor.size, descriptor.mem_type
            );

            walked_count += 1;
            walked_total += descriptor.size;
            if descriptor.mem_type.is_free() {
                walked_free += descriptor.size;
            }

            previous_end = end;
        });

        status?;
        write!(out, "{:-<59}\n", "")?;
        write!(
            out,
            "Descriptor Count: {}  Free: 0x{:x}  Total: 0x{:x}\n\n",
            self.descriptor_count, walked_free, walked_total
        )?;

        if walked_count != self.descriptor_count {
            write!(
                out,
                "WARNING: The MDL claims there are {} descriptors, but {} were described here!\n",
                self.descriptor_count, walked_count
            )?;
        }

        if walked_total != self.total_space {
            write!(
                out,
                "WARNING: The MDL claims to have {:x} total space, but {:x} total space was calculated.\n",
                self.total_space, walked_total
            )?;
        }

        if walked_free != self.free_space {
            write!(
                out,
                "WARNING: The MDL claims to have {:x} free space, but {:x} total space was calculated.\n",
                self.free_space, walked_free
            )?;
        }

        Ok(())
    }
}

impl Default for MdList {
    fn default() -> Self {
        Self::new()
    }
}
