//! Remote Tree Walk
//!
//! In-order iteration over an arena-backed red-black tree in target
//! memory. Extension commands that dump tree-held structures share this
//! walk; each supplies the arena base, the element stride, and the
//! offset of the link node inside an element, then reads its own payload
//! fields at the element addresses the walk yields.

use crate::{read_u32, DebuggerContext, KdError};

/// Slot of the null-node sentinel in a tree arena.
pub const NIL: u32 = 0;
/// Slot of the pseudo-root; its left child is the true top of the tree.
pub const ROOT: u32 = 1;

/// Deepest plausible tree; a balanced tree over 32-bit slots stays under this.
const MAX_TREE_HEIGHT: u32 = 64;

/// Byte offsets of the tree node link members.
pub struct NodeOffsets {
    pub parent: u64,
    pub left: u64,
    pub right: u64,
}

impl NodeOffsets {
    /// Resolves the link offsets from the target's symbol information.
    pub fn resolve(context: &mut dyn DebuggerContext) -> Result<NodeOffsets, KdError> {
        Ok(NodeOffsets {
            parent: context.member_offset("RB_TREE_NODE", "Parent")?,
            left: context.member_offset("RB_TREE_NODE", "LeftChild")?,
            right: context.member_offset("RB_TREE_NODE", "RightChild")?,
        })
    }
}

/// Position of one tree's arena in target memory.
pub struct RemoteTree {
    /// Address of slot 0.
    pub arena: u64,
    /// Size of one arena element, links and payload together.
    pub stride: u64,
    /// Offset of the link node within an element.
    pub node_offset: u64,
    /// Link member offsets within the node.
    pub links: NodeOffsets,
}

impl RemoteTree {
    /// Address of the element held in `slot`.
    pub fn element_address(&self, slot: u32) -> u64 {
        self.arena + u64::from(slot) * self.stride
    }

    fn node_address(&self, slot: u32) -> u64 {
        self.element_address(slot) + self.node_offset
    }

    fn parent(&self, context: &mut dyn DebuggerContext, slot: u32) -> Result<u32, KdError> {
        read_u32(context, self.node_address(slot) + self.links.parent)
    }

    fn left(&self, context: &mut dyn DebuggerContext, slot: u32) -> Result<u32, KdError> {
        read_u32(context, self.node_address(slot) + self.links.left)
    }

    fn right(&self, context: &mut dyn DebuggerContext, slot: u32) -> Result<u32, KdError> {
        read_u32(context, self.node_address(slot) + self.links.right)
    }

    fn leftmost(
        &self,
        context: &mut dyn DebuggerContext,
        mut slot: u32,
    ) -> Result<u32, KdError> {
        for _ in 0..MAX_TREE_HEIGHT {
            let left = self.left(context, slot)?;
            if left == NIL {
                return Ok(slot);
            }
            slot = left;
        }
        Err(KdError::CorruptTree)
    }

    /// Slot holding the lowest element, if the tree is non-empty.
    pub fn first(&self, context: &mut dyn DebuggerContext) -> Result<Option<u32>, KdError> {
        let top = self.left(context, ROOT)?;
        if top == NIL {
            return Ok(None);
        }
        self.leftmost(context, top).map(Some)
    }

    /// Slot holding the next element in ascending order.
    pub fn next(
        &self,
        context: &mut dyn DebuggerContext,
        slot: u32,
    ) -> Result<Option<u32>, KdError> {
        let right = self.right(context, slot)?;
        if right != NIL {
            return self.leftmost(context, right).map(Some);
        }

        let mut current = slot;
        for _ in 0..MAX_TREE_HEIGHT {
            let parent = self.parent(context, current)?;
            if parent == ROOT {
                return Ok(None);
            }
            if self.left(context, parent)? == current {
                return Ok(Some(parent));
            }
            current = parent;
        }
        Err(KdError::CorruptTree)
    }
}
