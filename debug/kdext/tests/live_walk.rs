//! Drives the `!mdl` extension against live kernel structures in this
//! process, with member offsets taken from the real type layouts.

use std::fmt;
use std::mem::{offset_of, size_of};

use kdext::{mdl, DebuggerContext, KdError};
use kernel::mm::{AllocationStrategy, MdList, MemoryDescriptor, MemoryType};
use kernel::rtl::{RbNode, RbTree};

/// Debugger context whose target is this process's own address space.
struct LiveContext {
    output: String,
}

impl LiveContext {
    fn new() -> LiveContext {
        LiveContext {
            output: String::new(),
        }
    }
}

impl DebuggerContext for LiveContext {
    fn read_memory(&mut self, address: u64, buffer: &mut [u8]) -> Result<(), KdError> {
        if address == 0 {
            return Err(KdError::ReadFailed);
        }
        // Addresses come from live objects owned by the running test.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    fn read_type(&mut self, address: u64, type_name: &str) -> Result<Vec<u8>, KdError> {
        let size = match type_name {
            "MEMORY_DESCRIPTOR" => size_of::<RbNode<MemoryDescriptor>>(),
            _ => return Err(KdError::UnknownType),
        };
        let mut buffer = vec![0u8; size];
        self.read_memory(address, &mut buffer)?;
        Ok(buffer)
    }

    fn member_offset(&mut self, type_name: &str, member: &str) -> Result<u64, KdError> {
        let node_value = offset_of!(RbNode<MemoryDescriptor>, value);
        let offset = match (type_name, member) {
            ("MEMORY_DESCRIPTOR_LIST", "Tree") => offset_of!(MdList, tree),
            ("MEMORY_DESCRIPTOR_LIST", "DescriptorCount") => offset_of!(MdList, descriptor_count),
            ("MEMORY_DESCRIPTOR_LIST", "TotalSpace") => offset_of!(MdList, total_space),
            ("MEMORY_DESCRIPTOR_LIST", "FreeSpace") => offset_of!(MdList, free_space),
            ("RB_TREE", "Arena") => offset_of!(RbTree<MemoryDescriptor>, arena),
            ("RB_TREE_NODE", "Parent") => offset_of!(RbNode<MemoryDescriptor>, parent),
            ("RB_TREE_NODE", "LeftChild") => offset_of!(RbNode<MemoryDescriptor>, left),
            ("RB_TREE_NODE", "RightChild") => offset_of!(RbNode<MemoryDescriptor>, right),
            ("MEMORY_DESCRIPTOR", "TreeNode") => 0,
            ("MEMORY_DESCRIPTOR", "BaseAddress") => {
                node_value + offset_of!(MemoryDescriptor, base_address)
            }
            ("MEMORY_DESCRIPTOR", "Size") => node_value + offset_of!(MemoryDescriptor, size),
            ("MEMORY_DESCRIPTOR", "Type") => node_value + offset_of!(MemoryDescriptor, mem_type),
            (_, _) => return Err(KdError::UnknownMember),
        };
        Ok(offset as u64)
    }

    fn pointer_size(&self) -> u8 {
        size_of::<usize>() as u8
    }

    fn print(&mut self, text: fmt::Arguments) {
        use fmt::Write;
        let _ = self.output.write_fmt(text);
    }
}

fn list_address(list: &MdList) -> u64 {
    list as *const MdList as u64
}

#[test]
fn walks_a_live_list() {
    let mut list = MdList::new();
    list.add_descriptor(&MemoryDescriptor::new(0x1000, 0x2000, MemoryType::Free))
        .unwrap();
    list.add_descriptor(&MemoryDescriptor::new(0x3000, 0x5000, MemoryType::Reserved))
        .unwrap();
    list.add_descriptor(&MemoryDescriptor::new(0x10000, 0x10500, MemoryType::Hardware))
        .unwrap();

    let mut context = LiveContext::new();
    mdl::extension_mdl(&mut context, list_address(&list)).unwrap();

    let output = context.output;
    assert!(output.contains("Free Memory"));
    assert!(output.contains("Reserved"));
    assert!(output.contains("Hardware"));
    assert!(output.contains("Descriptor Count: 3  Free: 0x1000  Total: 0x3500"));
    assert!(!output.contains("WARNING"));
}

#[test]
fn walks_an_empty_live_list() {
    let list = MdList::new();

    let mut context = LiveContext::new();
    mdl::extension_mdl(&mut context, list_address(&list)).unwrap();

    assert!(context
        .output
        .contains("Descriptor Count: 0  Free: 0x0  Total: 0x0"));
    assert!(!context.output.contains("WARNING"));
}

#[test]
fn reflects_live_allocations() {
    let mut list = MdList::new();
    list.add_descriptor(&MemoryDescriptor::new(0x1000, 0x9000, MemoryType::Free))
        .unwrap();
    let address = list
        .allocate(
            0x2000,
            0,
            0,
            u64::MAX,
            MemoryType::NonPagedPool,
            AllocationStrategy::LowestAddress,
        )
        .unwrap();
    assert_eq!(address, 0x1000);

    let mut context = LiveContext::new();
    mdl::extension_mdl(&mut context, list_address(&list)).unwrap();

    let output = context.output;
    assert!(output.contains("Non-paged Pool"));
    assert!(output.contains("Descriptor Count: 2  Free: 0x6000  Total: 0x8000"));
    assert!(!output.contains("WARNING"));
}
