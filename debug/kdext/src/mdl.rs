//! `!mdl` Extension
//!
//! Reconstructs a memory descriptor list from target memory and prints it
//! in the same table format the kernel's own dump routine uses. The walk
//! follows the descriptor tree's arena indices rather than pointers, so it
//! needs only the arena base address and the per-element stride from the
//! target's symbol information.

use crate::tree::{NodeOffsets, RemoteTree};
use crate::{read_pointer, read_u32, read_u64, DebuggerContext, KdError};

/// Raw ordinal of the free memory type.
const FREE_TYPE: u32 = 2;

/// Upper bound on walked descriptors, in case the target tree is corrupt.
const WALK_LIMIT: u32 = 1 << 16;

/// Maps a raw memory type ordinal to its display name.
fn memory_type_name(value: u32) -> &'static str {
    match value {
        1 => "Reserved",
        2 => "Free Memory",
        3 => "Firmware Temporary",
        4 => "Firmware Permanent",
        5 => "ACPI Tables",
        6 => "ACPI Nonvolatile Storage",
        7 => "Bad Memory",
        8 => "Loader Temporary",
        9 => "Loader Permanent",
        10 => "Page Tables",
        11 => "Boot Page Tables",
        12 => "MM Init Structures",
        13 => "Non-paged Pool",
        14 => "Paged Pool",
        15 => "Hardware",
        16 => "IO Buffer",
        _ => "Unknown Memory Type",
    }
}

/// Byte offsets of the list and descriptor members, resolved once per run.
struct Offsets {
    list_tree: u64,
    list_descriptor_count: u64,
    list_total_space: u64,
    list_free_space: u64,
    tree_arena: u64,
    descriptor_tree_node: u64,
    descriptor_base: u64,
    descriptor_size: u64,
    descriptor_type: u64,
}

impl Offsets {
    fn resolve(context: &mut dyn DebuggerContext) -> Result<Offsets, KdError> {
        Ok(Offsets {
            list_tree: context.member_offset("MEMORY_DESCRIPTOR_LIST", "Tree")?,
            list_descriptor_count: context
                .member_offset("MEMORY_DESCRIPTOR_LIST", "DescriptorCount")?,
            list_total_space: context.member_offset("MEMORY_DESCRIPTOR_LIST", "TotalSpace")?,
            list_free_space: context.member_offset("MEMORY_DESCRIPTOR_LIST", "FreeSpace")?,
            tree_arena: context.member_offset("RB_TREE", "Arena")?,
            descriptor_tree_node: context.member_offset("MEMORY_DESCRIPTOR", "TreeNode")?,
            descriptor_base: context.member_offset("MEMORY_DESCRIPTOR", "BaseAddress")?,
            descriptor_size: context.member_offset("MEMORY_DESCRIPTOR", "Size")?,
            descriptor_type: context.member_offset("MEMORY_DESCRIPTOR", "Type")?,
        })
    }
}

fn walk_list(context: &mut dyn DebuggerContext, list_address: u64) -> Result<(), KdError> {
    let offsets = Offsets::resolve(context)?;
    let links = NodeOffsets::resolve(context)?;

    let descriptor_count = read_u32(context, list_address + offsets.list_descriptor_count)?;
    let total_space = read_u64(context, list_address + offsets.list_total_space)?;
    let free_space = read_u64(context, list_address + offsets.list_free_space)?;
    let arena = read_pointer(context, list_address + offsets.list_tree + offsets.tree_arena)?;

    // The arena stride is the target's size for one element, links included.
    let stride = context.read_type(arena, "MEMORY_DESCRIPTOR")?.len() as u64;

    log::debug!(
        "walking MDL at {:#x}: arena {:#x}, stride {:#x}, {} descriptors claimed",
        list_address,
        arena,
        stride,
        descriptor_count
    );

    context.print(format_args!(
        "\n       Start Address    End Address  Size   Type\n"
    ));
    context.print(format_args!("{:-<59}\n", ""));

    let tree = RemoteTree {
        arena,
        stride,
        node_offset: offsets.descriptor_tree_node,
        links,
    };

    let mut walked_count: u32 = 0;
    let mut walked_total: u64 = 0;
    let mut walked_free: u64 = 0;
    let mut previous_end: u64 = 0;

    let mut slot = tree.first(context)?;
    while let Some(current) = slot {
        // A corrupt tree could link in a cycle; bound the walk.
        if walked_count >= WALK_LIMIT {
            context.print(format_args!(
                "WARNING: Walk stopped after {} descriptors; the tree links may be corrupt.\n",
                walked_count
            ));
            break;
        }

        let element = tree.element_address(current);
        let base = read_u64(context, element + offsets.descriptor_base)?;
        let size = read_u64(context, element + offsets.descriptor_size)?;
        let mem_type = read_u32(context, element + offsets.descriptor_type)?;
        // Target values are untrusted; keep printing even if they wrap.
        let end = base.wrapping_add(size);

        log::debug!(
            "slot {}: base {:#x}, size {:#x}, type {}",
            current,
            base,
            size,
            mem_type
        );

        if base < previous_end {
            context.print(format_args!(
                "WARNING: Descriptor {:x} Base {:x} < PreviousEnd {:x}.\n",
                walked_count, base, previous_end
            ));
        }

        context.print(format_args!(
            "    {:13x}  {:13x}  {:8x}  {}\n",
            base,
            end,
            size,
            memory_type_name(mem_type)
        ));

        walked_count += 1;
        walked_total = walked_total.wrapping_add(size);
        if mem_type == FREE_TYPE {
            walked_free = walked_free.wrapping_add(size);
        }
        previous_end = end;

        slot = tree.next(context, current)?;
    }

    context.print(format_args!("{:-<59}\n", ""));
    context.print(format_args!(
        "Descriptor Count: {}  Free: 0x{:x}  Total: 0x{:x}\n\n",
        descriptor_count, walked_free, walked_total
    ));

    if walked_count != descriptor_count {
        context.print(format_args!(
            "WARNING: The MDL claims there are {} descriptors, but {} were described here!\n",
            descriptor_count, walked_count
        ));
    }

    if walked_total != total_space {
        context.print(format_args!(
            "WARNING: The MDL claims to have {:x} total space, but {:x} total space was calculated.\n",
            total_space, walked_total
        ));
    }

    if walked_free != free_space {
        context.print(format_args!(
            "WARNING: The MDL claims to have {:x} free space, but {:x} total space was calculated.\n",
            free_space, walked_free
        ));
    }

    Ok(())
}

/// `!mdl <address>`: dumps the memory descriptor list at `list_address`.
///
/// Walks the descriptor tree lowest to highest, printing one row per
/// descriptor and recomputing the aggregate counters as it goes. Stored
/// counters that disagree with the walk are reported as warnings after
/// the table rather than failing the dump.
pub fn extension_mdl(context: &mut dyn DebuggerContext, list_address: u64) -> Result<(), KdError> {
    if let Err(error) = walk_list(context, list_address) {
        context.print(format_args!(
            "Error: Could not read the MDL at {:#x}: {}.\n",
            list_address, error
        ));
        return Err(error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    const LIST_ADDRESS: u64 = 0x100;
    const ARENA_ADDRESS: u64 = 0x1000;
    const DESCRIPTOR_STRIDE: usize = 0x28;

    /// Debugger context backed by a flat byte image; addresses are indices.
    struct ImageContext {
        image: Vec<u8>,
        output: String,
        pointer_width: u8,
    }

    impl ImageContext {
        fn new(image: Vec<u8>) -> ImageContext {
            ImageContext {
                image,
                output: String::new(),
                pointer_width: 8,
            }
        }
    }

    impl DebuggerContext for ImageContext {
        fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), KdError> {
            let start = address as usize;
            let end = start.checked_add(buffer.len()).ok_or(KdError::ReadFailed)?;
            if end > self.image.len() {
                return Err(KdError::ReadFailed);
            }
            buffer.copy_from_slice(&self.image[start..end]);
            Ok(())
        }

        fn read_type(&mut self, address: u64, type_name: &str) -> Result<Vec<u8>, KdError> {
            let size = match type_name {
                "MEMORY_DESCRIPTOR" => DESCRIPTOR_STRIDE,
                _ => return Err(KdError::UnknownType),
            };
            let mut buffer = vec![0u8; size];
            self.read_memory(address, &mut buffer)?;
            Ok(buffer)
        }

        fn member_offset(&mut self, type_name: &str, member: &str) -> Result<u64, KdError> {
            let offset = match (type_name, member) {
                ("MEMORY_DESCRIPTOR_LIST", "Tree") => 0x10,
                ("MEMORY_DESCRIPTOR_LIST", "DescriptorCount") => 0x40,
                ("MEMORY_DESCRIPTOR_LIST", "TotalSpace") => 0x48,
                ("MEMORY_DESCRIPTOR_LIST", "FreeSpace") => 0x50,
                ("RB_TREE", "Arena") => 0x8,
                ("RB_TREE_NODE", "Parent") => 0x0,
                ("RB_TREE_NODE", "LeftChild") => 0x4,
                ("RB_TREE_NODE", "RightChild") => 0x8,
                ("MEMORY_DESCRIPTOR", "TreeNode") => 0x0,
                ("MEMORY_DESCRIPTOR", "BaseAddress") => 0x10,
                ("MEMORY_DESCRIPTOR", "Size") => 0x18,
                ("MEMORY_DESCRIPTOR", "Type") => 0x20,
                (_, _) => return Err(KdError::UnknownMember),
            };
            Ok(offset)
        }

        fn pointer_size(&self) -> u8 {
            self.pointer_width
        }

        fn print(&mut self, text: fmt::Arguments) {
            use fmt::Write;
            let _ = self.output.write_fmt(text);
        }
    }

    fn write_u32(image: &mut [u8], address: u64, value: u32) {
        let start = address as usize;
        image[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(image: &mut [u8], address: u64, value: u64) {
        let start = address as usize;
        image[start..start + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[allow(clippy::too_many_arguments)]
    fn write_element(
        image: &mut [u8],
        slot: u32,
        parent: u32,
        left: u32,
        right: u32,
        base: u64,
        size: u64,
        mem_type: u32,
    ) {
        let element = ARENA_ADDRESS + u64::from(slot) * DESCRIPTOR_STRIDE as u64;
        write_u32(image, element, parent);
        write_u32(image, element + 0x4, left);
        write_u32(image, element + 0x8, right);
        write_u64(image, element + 0x10, base);
        write_u64(image, element + 0x18, size);
        write_u32(image, element + 0x20, mem_type);
    }

    /// Two descriptors: free [0x1000, 0x2000) and reserved [0x4000, 0x6000).
    fn sample_image(descriptor_count: u32, total_space: u64, free_space: u64) -> Vec<u8> {
        let mut image = vec![0u8; 0x2000];

        write_u64(&mut image, LIST_ADDRESS + 0x10 + 0x8, ARENA_ADDRESS);
        write_u32(&mut image, LIST_ADDRESS + 0x40, descriptor_count);
        write_u64(&mut image, LIST_ADDRESS + 0x48, total_space);
        write_u64(&mut image, LIST_ADDRESS + 0x50, free_space);

        write_element(&mut image, 0, 0, 0, 0, 0, 0, 0);
        write_element(&mut image, 1, 0, 2, 0, 0, 0, 0);
        write_element(&mut image, 2, 1, 0, 3, 0x1000, 0x1000, 2);
        write_element(&mut image, 3, 2, 0, 0, 0x4000, 0x2000, 1);
        image
    }

    #[test]
    fn names_every_memory_type() {
        assert_eq!(memory_type_name(0), "Unknown Memory Type");
        assert_eq!(memory_type_name(2), "Free Memory");
        assert_eq!(memory_type_name(16), "IO Buffer");
        assert_eq!(memory_type_name(99), "Unknown Memory Type");
    }

    #[test]
    fn walks_a_consistent_list() {
        let mut context = ImageContext::new(sample_image(2, 0x3000, 0x1000));
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        let output = context.output;
        assert!(output.contains("Start Address"));
        assert!(output.contains("             1000           2000      1000  Free Memory"));
        assert!(output.contains("             4000           6000      2000  Reserved"));
        assert!(output.contains("Descriptor Count: 2  Free: 0x1000  Total: 0x3000"));
        assert!(!output.contains("WARNING"));
    }

    #[test]
    fn walks_an_empty_list() {
        let mut image = sample_image(0, 0, 0);
        write_element(&mut image, 1, 0, 0, 0, 0, 0, 0);

        let mut context = ImageContext::new(image);
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        assert!(context.output.contains("Descriptor Count: 0  Free: 0x0  Total: 0x0"));
        assert!(!context.output.contains("WARNING"));
    }

    #[test]
    fn flags_counter_mismatches() {
        let mut context = ImageContext::new(sample_image(7, 0x8888, 0x9999));
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        let output = context.output;
        assert!(output.contains("claims there are 7 descriptors, but 2 were described here!"));
        assert!(output.contains("claims to have 8888 total space, but 3000 total space was calculated."));
        assert!(output.contains("claims to have 9999 free space, but 1000 total space was calculated."));
        assert!(output.contains("Descriptor Count: 7  Free: 0x1000  Total: 0x3000"));
    }

    #[test]
    fn flags_overlapping_descriptors() {
        let mut image = sample_image(2, 0x2800, 0x1000);
        write_element(&mut image, 3, 2, 0, 0, 0x1800, 0x1800, 1);

        let mut context = ImageContext::new(image);
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        assert!(context
            .output
            .contains("WARNING: Descriptor 1 Base 1800 < PreviousEnd 2000."));
        assert!(context.output.contains("Descriptor Count: 2"));
    }

    #[test]
    fn stops_walking_cyclic_links() {
        let mut image = sample_image(2, 0x3000, 0x1000);
        // Point the last node's right child back at its own slot.
        let element = ARENA_ADDRESS + 3 * DESCRIPTOR_STRIDE as u64;
        write_u32(&mut image, element + 0x8, 3);

        let mut context = ImageContext::new(image);
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        assert!(context.output.contains("tree links may be corrupt"));
    }

    #[test]
    fn rejects_left_link_cycles() {
        let mut image = sample_image(2, 0x3000, 0x1000);
        // Top node's left child points back at itself.
        let element = ARENA_ADDRESS + 2 * DESCRIPTOR_STRIDE as u64;
        write_u32(&mut image, element + 0x4, 2);

        let mut context = ImageContext::new(image);
        let result = extension_mdl(&mut context, LIST_ADDRESS);

        assert_eq!(result, Err(KdError::CorruptTree));
        assert!(context.output.contains("tree links are corrupt"));
    }

    #[test]
    fn honors_the_target_pointer_size() {
        let mut image = sample_image(2, 0x3000, 0x1000);
        // High half garbage; a 4-byte read still finds the arena.
        write_u64(&mut image, LIST_ADDRESS + 0x18, 0xffff_ffff_0000_1000);

        let mut context = ImageContext::new(image);
        context.pointer_width = 4;
        extension_mdl(&mut context, LIST_ADDRESS).unwrap();

        assert!(context
            .output
            .contains("Descriptor Count: 2  Free: 0x1000  Total: 0x3000"));
    }

    #[test]
    fn reports_unreadable_targets() {
        let mut image = sample_image(2, 0x3000, 0x1000);
        // Point the arena outside the image so element reads fail.
        write_u64(&mut image, LIST_ADDRESS + 0x18, 0xdead_0000);

        let mut context = ImageContext::new(image);
        let result = extension_mdl(&mut context, LIST_ADDRESS);

        assert_eq!(result, Err(KdError::ReadFailed));
        assert!(context
            .output
            .contains("Error: Could not read the MDL at 0x100: target memory read failed."));
    }
}
