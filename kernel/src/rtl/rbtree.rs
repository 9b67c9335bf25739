//! Red-Black Tree Implementation
//!
//! A self-balancing binary search tree storing its nodes in one
//! contiguous arena and linking them by 32-bit slot index instead of
//! pointer. Two sentinel slots are reserved: slot 0 is the null node
//! (every leaf child and the empty marker) and slot 1 is the root
//! header, a node-shaped slot whose left child is the topmost real
//! node. Keeping the header node-shaped lets rotations treat the top
//! of the tree like any other position.
//!
//! The arena layout exists for more than compactness: an external
//! debugger can reproduce an in-order walk of the tree purely by
//! reading the arena base pointer and then computing slot addresses,
//! without chasing live pointers. The `arena` field mirrors the
//! current buffer address for exactly that purpose.
//!
//! Element slots are stable: a value never moves between slots while
//! it is in the tree, and removal splices nodes rather than copying
//! values. Freed slots are chained through their parent link and
//! reused by later inserts.
//!
//! # Usage
//! ```
//! use core::cmp::Ordering;
//! use kernel::rtl::rbtree::RbTree;
//!
//! fn compare(left: &u64, right: &u64) -> Ordering {
//!     left.cmp(right)
//! }
//!
//! let mut tree: RbTree<u64> = RbTree::new(compare);
//! tree.insert(30).unwrap();
//! tree.insert(10).unwrap();
//! tree.insert(20).unwrap();
//!
//! let mut keys = Vec::new();
//! tree.iterate(|key| keys.push(*key));
//! assert_eq!(keys, vec![10, 20, 30]);
//! ```

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::status::{KResult, Status};

/// Slot of the null-node sentinel
pub const NIL: u32 = 0;

/// Slot of the root header
pub const ROOT: u32 = 1;

/// One arena slot
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RbNode<T> {
    /// Parent slot; doubles as the free-chain link while the slot is
    /// unused
    pub parent: u32,
    /// Left child slot, NIL for none
    pub left: u32,
    /// Right child slot, NIL for none
    pub right: u32,
    /// Node color
    pub red: bool,
    /// Stored element
    pub value: T,
}

/// Comparison routine ordering two elements by key
pub type CompareRoutine<T> = fn(&T, &T) -> Ordering;

/// Arena-backed red-black tree
#[repr(C)]
pub struct RbTree<T> {
    /// Current arena base address, kept in sync with the backing
    /// buffer so external readers can locate slots
    pub arena: *const RbNode<T>,
    /// Backing storage; slots 0 and 1 are the sentinels
    nodes: Vec<RbNode<T>>,
    /// Head of the freed-slot chain, NIL when empty
    free_head: u32,
    /// Key order for descent and validation
    compare: CompareRoutine<T>,
}

// Safety: arena is a mirror of the owned Vec buffer, carrying no
// ownership of its own.
unsafe impl<T: Send> Send for RbTree<T> {}
unsafe impl<T: Sync> Sync for RbTree<T> {}

impl<T: Default> RbTree<T> {
    /// Create an empty tree ordered by `compare`
    pub fn new(compare: CompareRoutine<T>) -> Self {
        let mut nodes = Vec::with_capacity(2);

        // Slot 0: the null node, its own child in both directions.
        nodes.push(RbNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            red: false,
            value: T::default(),
        });

        // Slot 1: the root header; its left child is the tree top.
        nodes.push(RbNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            red: false,
            value: T::default(),
        });

        let mut tree = Self {
            arena: core::ptr::null(),
            nodes,
            free_head: NIL,
            compare,
        };

        tree.refresh_arena();
        tree
    }
}

impl<T> RbTree<T> {
    #[inline]
    fn node(&self, slot: u32) -> &RbNode<T> {
        &self.nodes[slot as usize]
    }

    #[inline]
    fn node_mut(&mut self, slot: u32) -> &mut RbNode<T> {
        &mut self.nodes[slot as usize]
    }

    /// Re-mirror the buffer address after any growth
    fn refresh_arena(&mut self) {
        self.arena = self.nodes.as_ptr();
    }

    /// Check whether the tree holds no elements
    pub fn is_empty(&self) -> bool {
        self.node(ROOT).left == NIL
    }

    /// Borrow the element in `slot`
    ///
    /// The slot must hold a live element; sentinel and out-of-range
    /// slots panic.
    pub fn value(&self, slot: u32) -> &T {
        debug_assert!(slot > ROOT);
        &self.node(slot).value
    }

    /// Mutably borrow the element in `slot`
    ///
    /// Changing the element's key without removing and reinserting it
    /// breaks the search order.
    pub fn value_mut(&mut self, slot: u32) -> &mut T {
        debug_assert!(slot > ROOT);
        &mut self.node_mut(slot).value
    }

    /// Borrow the element in `slot`, or None for sentinel or
    /// out-of-range slots
    pub fn get(&self, slot: u32) -> Option<&T> {
        if slot <= ROOT || slot as usize >= self.nodes.len() {
            return None;
        }

        Some(&self.node(slot).value)
    }

    /// Grow the arena so at least `additional` more inserts cannot fail
    /// for lack of memory
    pub fn reserve(&mut self, additional: usize) -> KResult<()> {
        if self.nodes.try_reserve(additional).is_err() {
            return Err(Status::InsufficientResources);
        }

        self.refresh_arena();
        Ok(())
    }

    /// Take a slot from the free chain or grow the arena by one
    fn allocate_slot(&mut self, value: T) -> KResult<u32> {
        if self.free_head != NIL {
            let slot = self.free_head;
            self.free_head = self.node(slot).parent;
            let node = self.node_mut(slot);
            node.parent = NIL;
            node.left = NIL;
            node.right = NIL;
            node.red = false;
            node.value = value;
            return Ok(slot);
        }

        if self.nodes.try_reserve(1).is_err() {
            return Err(Status::InsufficientResources);
        }

        let slot = self.nodes.len() as u32;
        self.nodes.push(RbNode {
            parent: NIL,
            left: NIL,
            right: NIL,
            red: false,
            value,
        });

        Ok(slot)
    }

    /// Chain a removed slot onto the free list
    fn free_slot(&mut self, slot: u32) {
        let head = self.free_head;
        let node = self.node_mut(slot);
        node.parent = head;
        node.left = NIL;
        node.right = NIL;
        node.red = false;
        self.free_head = slot;
    }

    /// Insert `value`, returning the slot it now lives in
    pub fn insert(&mut self, value: T) -> KResult<u32> {
        let slot = self.allocate_slot(value)?;
        self.perform_insert(slot);
        self.refresh_arena();
        Ok(slot)
    }

    /// Link a fresh slot into the tree and rebalance
    fn perform_insert(&mut self, slot: u32) {
        self.node_mut(slot).left = NIL;
        self.node_mut(slot).right = NIL;

        // Descend to the attachment point. Equal keys go right.
        let mut previous = ROOT;
        let mut current = self.node(ROOT).left;
        let mut last_result = Ordering::Greater;
        while current != NIL {
            previous = current;
            last_result = (self.compare)(&self.node(current).value, &self.node(slot).value);
            current = if last_result == Ordering::Greater {
                self.node(current).left
            } else {
                self.node(current).right
            };
        }

        self.node_mut(slot).parent = previous;
        if previous == ROOT || last_result == Ordering::Greater {
            self.node_mut(previous).left = slot;
        } else {
            self.node_mut(previous).right = slot;
        }

        // Rebalance: push the red violation upward until it dissolves.
        self.node_mut(slot).red = true;
        let mut node = slot;
        while self.node(self.node(node).parent).red {
            let parent = self.node(node).parent;
            let grandparent = self.node(parent).parent;
            if parent == self.node(grandparent).left {
                let uncle = self.node(grandparent).right;
                if self.node(uncle).red {
                    self.node_mut(parent).red = false;
                    self.node_mut(uncle).red = false;
                    self.node_mut(grandparent).red = true;
                    node = grandparent;
                } else {
                    if node == self.node(parent).right {
                        node = parent;
                        self.rotate_left(node);
                    }

                    let parent = self.node(node).parent;
                    let grandparent = self.node(parent).parent;
                    self.node_mut(parent).red = false;
                    self.node_mut(grandparent).red = true;
                    self.rotate_right(grandparent);
                }
            } else {
                let uncle = self.node(grandparent).left;
                if self.node(uncle).red {
                    self.node_mut(parent).red = false;
                    self.node_mut(uncle).red = false;
                    self.node_mut(grandparent).red = true;
                    node = grandparent;
                } else {
                    if node == self.node(parent).left {
                        node = parent;
                        self.rotate_right(node);
                    }

                    let parent = self.node(node).parent;
                    let grandparent = self.node(parent).parent;
                    self.node_mut(parent).red = false;
                    self.node_mut(grandparent).red = true;
                    self.rotate_left(grandparent);
                }
            }
        }

        let top = self.node(ROOT).left;
        self.node_mut(top).red = false;

        debug_assert!(!self.node(NIL).red);
        debug_assert!(!self.node(ROOT).red);
    }

    /// Remove the element in `slot` and recycle the slot
    ///
    /// Other elements keep their slots; removal splices tree links
    /// only.
    pub fn remove(&mut self, slot: u32) {
        debug_assert!(slot > ROOT && (slot as usize) < self.nodes.len());

        // A node with two children is replaced by its in-order
        // successor, which by construction has no left child.
        let node_to_remove = if self.node(slot).left == NIL || self.node(slot).right == NIL {
            slot
        } else {
            let mut successor = self.node(slot).right;
            while self.node(successor).left != NIL {
                successor = self.node(successor).left;
            }

            successor
        };

        // Splice node_to_remove out, lifting its lone child. The null
        // node's parent is deliberately written too; the fixup below
        // navigates through it.
        let child = if self.node(node_to_remove).left != NIL {
            self.node(node_to_remove).left
        } else {
            self.node(node_to_remove).right
        };

        let parent = self.node(node_to_remove).parent;
        self.node_mut(child).parent = parent;
        if self.node(parent).left == node_to_remove {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }

        if node_to_remove != slot {
            // Restore balance before moving the successor into place,
            // while the successor's old position is still reflected in
            // the child's links.
            if !self.node(node_to_remove).red {
                self.fix_after_removal(child);
            }

            // Move the successor node into the removed slot's position.
            let left = self.node(slot).left;
            let right = self.node(slot).right;
            let slot_parent = self.node(slot).parent;
            let red = self.node(slot).red;

            self.node_mut(node_to_remove).left = left;
            self.node_mut(node_to_remove).right = right;
            self.node_mut(node_to_remove).parent = slot_parent;
            self.node_mut(node_to_remove).red = red;
            self.node_mut(left).parent = node_to_remove;
            self.node_mut(right).parent = node_to_remove;

            if self.node(slot_parent).left == slot {
                self.node_mut(slot_parent).left = node_to_remove;
            } else {
                self.node_mut(slot_parent).right = node_to_remove;
            }
        } else if !self.node(slot).red {
            self.fix_after_removal(child);
        }

        self.free_slot(slot);

        debug_assert!(!self.node(NIL).red);
        debug_assert!(!self.node(ROOT).red);
    }

    /// Restore the black-height invariant after removing a black node
    fn fix_after_removal(&mut self, mut node: u32) {
        let root = self.node(ROOT).left;
        while !self.node(node).red && node != root {
            let parent = self.node(node).parent;
            if node == self.node(parent).left {
                let mut sibling = self.node(parent).right;
                if self.node(sibling).red {
                    self.node_mut(sibling).red = false;
                    self.node_mut(parent).red = true;
                    self.rotate_left(parent);
                    sibling = self.node(parent).right;
                }

                let sibling_left = self.node(sibling).left;
                let sibling_right = self.node(sibling).right;
                if !self.node(sibling_left).red && !self.node(sibling_right).red {
                    self.node_mut(sibling).red = true;
                    node = parent;
                } else {
                    if !self.node(sibling_right).red {
                        self.node_mut(sibling_left).red = false;
                        self.node_mut(sibling).red = true;
                        self.rotate_right(sibling);
                        sibling = self.node(parent).right;
                    }

                    self.node_mut(sibling).red = self.node(parent).red;
                    self.node_mut(parent).red = false;
                    let sibling_right = self.node(sibling).right;
                    self.node_mut(sibling_right).red = false;
                    self.rotate_left(parent);
                    node = root;
                }
            } else {
                let mut sibling = self.node(parent).left;
                if self.node(sibling).red {
                    self.node_mut(sibling).red = false;
                    self.node_mut(parent).red = true;
                    self.rotate_right(parent);
                    sibling = self.node(parent).left;
                }

                let sibling_left = self.node(sibling).left;
                let sibling_right = self.node(sibling).right;
                if !self.node(sibling_left).red && !self.node(sibling_right).red {
                    self.node_mut(sibling).red = true;
                    node = parent;
                } else {
                    if !self.node(sibling_left).red {
                        self.node_mut(sibling_right).red = false;
                        self.node_mut(sibling).red = true;
                        self.rotate_left(sibling);
                        sibling = self.node(parent).left;
                    }

                    self.node_mut(sibling).red = self.node(parent).red;
                    self.node_mut(parent).red = false;
                    let sibling_left = self.node(sibling).left;
                    self.node_mut(sibling_left).red = false;
                    self.rotate_right(parent);
                    node = root;
                }
            }
        }

        self.node_mut(node).red = false;
    }

    /// Rotate the subtree at `node` left, lifting its right child
    fn rotate_left(&mut self, node: u32) {
        let child = self.node(node).right;
        let grandchild = self.node(child).left;

        self.node_mut(node).right = grandchild;
        if grandchild != NIL {
            self.node_mut(grandchild).parent = node;
        }

        let parent = self.node(node).parent;
        self.node_mut(child).parent = parent;
        if self.node(parent).left == node {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }

        self.node_mut(child).left = node;
        self.node_mut(node).parent = child;
    }

    /// Rotate the subtree at `node` right, lifting its left child
    fn rotate_right(&mut self, node: u32) {
        let child = self.node(node).left;
        let grandchild = self.node(child).right;

        self.node_mut(node).left = grandchild;
        if grandchild != NIL {
            self.node_mut(grandchild).parent = node;
        }

        let parent = self.node(node).parent;
        self.node_mut(child).parent = parent;
        if self.node(parent).left == node {
            self.node_mut(parent).left = child;
        } else {
            self.node_mut(parent).right = child;
        }

        self.node_mut(child).right = node;
        self.node_mut(node).parent = child;
    }

    /// Find the slot whose element compares equal to `probe`
    pub fn search(&self, probe: &T) -> Option<u32> {
        let mut current = self.node(ROOT).left;
        while current != NIL {
            current = match (self.compare)(&self.node(current).value, probe) {
                Ordering::Equal => return Some(current),
                Ordering::Less => self.node(current).right,
                Ordering::Greater => self.node(current).left,
            };
        }

        None
    }

    /// Find the element nearest to `probe`
    ///
    /// With `greater` false, returns the element at or below `probe`;
    /// with `greater` true, the element at or above it. An exact match
    /// wins either way. Returns None when no element lies on the
    /// requested side.
    pub fn search_closest(&self, probe: &T, greater: bool) -> Option<u32> {
        let mut closest = None;
        let mut current = self.node(ROOT).left;
        while current != NIL {
            current = match (self.compare)(&self.node(current).value, probe) {
                Ordering::Equal => return Some(current),
                Ordering::Less => {
                    if !greater {
                        closest = Some(current);
                    }

                    self.node(current).right
                }
                Ordering::Greater => {
                    if greater {
                        closest = Some(current);
                    }

                    self.node(current).left
                }
            };
        }

        closest
    }

    /// Find the smallest-keyed element
    pub fn lowest(&self) -> Option<u32> {
        let mut current = self.node(ROOT).left;
        if current == NIL {
            return None;
        }

        while self.node(current).left != NIL {
            current = self.node(current).left;
        }

        Some(current)
    }

    /// Find the largest-keyed element
    pub fn highest(&self) -> Option<u32> {
        let mut current = self.node(ROOT).left;
        if current == NIL {
            return None;
        }

        while self.node(current).right != NIL {
            current = self.node(current).right;
        }

        Some(current)
    }

    /// Find the in-order neighbor of `slot`
    ///
    /// With `descending` false this is the next-higher element, with
    /// `descending` true the next-lower one. Returns None at the end
    /// of the walk.
    pub fn next_node(&self, slot: u32, descending: bool) -> Option<u32> {
        if descending {
            if self.node(slot).left != NIL {
                let mut current = self.node(slot).left;
                while self.node(current).right != NIL {
                    current = self.node(current).right;
                }

                return Some(current);
            }

            // Climb out of exhausted left subtrees.
            let mut current = slot;
            let mut parent = self.node(current).parent;
            loop {
                if parent == ROOT {
                    return None;
                }

                if self.node(parent).left != current {
                    return Some(parent);
                }

                current = parent;
                parent = self.node(current).parent;
            }
        }

        if self.node(slot).right != NIL {
            let mut current = self.node(slot).right;
            while self.node(current).left != NIL {
                current = self.node(current).left;
            }

            return Some(current);
        }

        let mut current = slot;
        let mut parent = self.node(current).parent;
        loop {
            if parent == ROOT {
                return None;
            }

            if self.node(parent).right != current {
                return Some(parent);
            }

            current = parent;
            parent = self.node(current).parent;
        }
    }

    /// Visit every element in ascending key order
    ///
    /// Non-recursive: the walk tracks where it came from to decide
    /// where to go next, using no extra storage.
    pub fn iterate<F>(&self, mut callback: F)
    where
        F: FnMut(&T),
    {
        let mut previous = ROOT;
        let mut node = self.node(ROOT).left;
        if node == NIL {
            return;
        }

        while node != ROOT {
            let mut next;
            if previous == self.node(node).parent {
                next = self.node(node).left;
            } else if previous == self.node(node).left {
                callback(&self.node(node).value);
                next = self.node(node).right;
                if next == self.node(node).left {
                    // Leaf: both children are the null node; go up.
                    next = self.node(node).parent;
                }
            } else {
                next = self.node(node).parent;
            }

            previous = node;
            if next == NIL {
                // Pretend to return from an empty subtree.
                previous = NIL;
            } else {
                node = next;
            }
        }
    }

    /// Audit the tree's structural invariants
    ///
    /// Checks child-parent back links, key order, the no-red-red rule,
    /// and equal black heights. Every violation is logged; returns
    /// false if any was found.
    pub fn validate(&self) -> bool {
        let mut valid = true;
        if self.node(NIL).red {
            log::error!("red-black tree: null node is red");
            valid = false;
        }

        if self.node(ROOT).red {
            log::error!("red-black tree: root header is red");
            valid = false;
        }

        let top = self.node(ROOT).left;
        if top == NIL {
            return valid;
        }

        if self.node(top).parent != ROOT {
            log::error!(
                "red-black tree: top node {} has parent {}, expected the root header",
                top,
                self.node(top).parent
            );

            valid = false;
        }

        let (subtree_valid, _) = self.validate_subtree(top);
        valid && subtree_valid
    }

    /// Recursively audit one subtree, returning its black height
    fn validate_subtree(&self, slot: u32) -> (bool, u32) {
        if slot == NIL {
            return (true, 1);
        }

        let node = self.node(slot);
        let mut valid = true;
        if node.red && self.node(node.parent).red {
            log::error!(
                "red-black tree: red node {} has red parent {}",
                slot,
                node.parent
            );

            valid = false;
        }

        if node.left != NIL {
            if self.node(node.left).parent != slot {
                log::error!(
                    "red-black tree: node {} left child {} does not link back",
                    slot,
                    node.left
                );

                valid = false;
            }

            if (self.compare)(&self.node(node.left).value, &node.value) == Ordering::Greater {
                log::error!("red-black tree: node {} orders before its left child", slot);
                valid = false;
            }
        }

        if node.right != NIL {
            if self.node(node.right).parent != slot {
                log::error!(
                    "red-black tree: node {} right child {} does not link back",
                    slot,
                    node.right
                );

                valid = false;
            }

            if (self.compare)(&self.node(node.right).value, &node.value) == Ordering::Less {
                log::error!("red-black tree: node {} orders after its right child", slot);
                valid = false;
            }
        }

        let (left_valid, left_height) = self.validate_subtree(node.left);
        let (right_valid, right_height) = self.validate_subtree(node.right);
        if left_height != right_height {
            log::error!(
                "red-black tree: black height mismatch at node {}: {} left, {} right",
                slot,
                left_height,
                right_height
            );

            valid = false;
        }

        let height = left_height + if node.red { 0 } else { 1 };
        (valid && left_valid && right_valid, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compare_u64(left: &u64, right: &u64) -> Ordering {
        left.cmp(right)
    }

    fn new_tree() -> RbTree<u64> {
        RbTree::new(compare_u64)
    }

    /// Tiny deterministic generator for shuffled key sequences.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    fn shuffled_keys(count: u64) -> Vec<u64> {
        let mut keys: Vec<u64> = (0..count).collect();
        let mut rng = Lcg(0x5eed);
        for i in (1..keys.len()).rev() {
            let j = (rng.next() as usize) % (i + 1);
            keys.swap(i, j);
        }

        keys
    }

    fn collect(tree: &RbTree<u64>) -> Vec<u64> {
        let mut keys = Vec::new();
        tree.iterate(|key| keys.push(*key));
        keys
    }

    #[test]
    fn test_empty_tree() {
        let tree = new_tree();
        assert!(tree.is_empty());
        assert_eq!(tree.lowest(), None);
        assert_eq!(tree.highest(), None);
        assert_eq!(tree.search(&7), None);
        assert_eq!(tree.search_closest(&7, false), None);
        assert_eq!(tree.search_closest(&7, true), None);
        assert!(collect(&tree).is_empty());
        assert!(tree.validate());
    }

    #[test]
    fn test_insert_and_search() {
        let mut tree = new_tree();
        for key in shuffled_keys(100) {
            tree.insert(key).unwrap();
        }

        assert!(tree.validate());
        for key in 0..100 {
            let slot = tree.search(&key).unwrap();
            assert_eq!(*tree.value(slot), key);
        }

        assert_eq!(tree.search(&100), None);
    }

    #[test]
    fn test_inorder_walk_is_sorted() {
        let mut tree = new_tree();
        for key in shuffled_keys(200) {
            tree.insert(key).unwrap();
        }

        let keys = collect(&tree);
        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_lowest_highest_and_neighbors() {
        let mut tree = new_tree();
        for key in shuffled_keys(64) {
            tree.insert(key).unwrap();
        }

        let mut slot = tree.lowest().unwrap();
        assert_eq!(*tree.value(slot), 0);

        let mut walked = vec![*tree.value(slot)];
        while let Some(next) = tree.next_node(slot, false) {
            walked.push(*tree.value(next));
            slot = next;
        }

        let expected: Vec<u64> = (0..64).collect();
        assert_eq!(walked, expected);

        let mut slot = tree.highest().unwrap();
        assert_eq!(*tree.value(slot), 63);

        let mut walked = vec![*tree.value(slot)];
        while let Some(next) = tree.next_node(slot, true) {
            walked.push(*tree.value(next));
            slot = next;
        }

        let expected: Vec<u64> = (0..64).rev().collect();
        assert_eq!(walked, expected);
    }

    #[test]
    fn test_search_closest() {
        let mut tree = new_tree();
        for key in [10u64, 20, 30] {
            tree.insert(key).unwrap();
        }

        let at_or_below = |probe: u64| tree.search_closest(&probe, false).map(|s| *tree.value(s));
        let at_or_above = |probe: u64| tree.search_closest(&probe, true).map(|s| *tree.value(s));

        assert_eq!(at_or_below(15), Some(10));
        assert_eq!(at_or_above(15), Some(20));
        assert_eq!(at_or_below(5), None);
        assert_eq!(at_or_above(5), Some(10));
        assert_eq!(at_or_below(35), Some(30));
        assert_eq!(at_or_above(35), None);
        assert_eq!(at_or_below(20), Some(20));
        assert_eq!(at_or_above(20), Some(20));
    }

    #[test]
    fn test_remove_preserves_invariants() {
        let mut tree = new_tree();
        for key in shuffled_keys(50) {
            tree.insert(key).unwrap();
        }

        // Remove the even keys one by one, auditing as we go.
        for key in (0..50u64).filter(|key| key % 2 == 0) {
            let slot = tree.search(&key).unwrap();
            tree.remove(slot);
            assert!(tree.validate(), "invariants broken after removing {key}");
        }

        let remaining = collect(&tree);
        let expected: Vec<u64> = (0..50).filter(|key| key % 2 == 1).collect();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn test_remove_all_then_reuse() {
        let mut tree = new_tree();
        let mut slots = Vec::new();
        for key in 0..10u64 {
            slots.push(tree.insert(key).unwrap());
        }

        for key in 0..10u64 {
            let slot = tree.search(&key).unwrap();
            tree.remove(slot);
        }

        assert!(tree.is_empty());
        assert!(tree.validate());

        // Freed slots come back in last-freed-first order.
        let reused = tree.insert(99).unwrap();
        assert!(slots.contains(&reused));
        assert_eq!(collect(&tree), vec![99]);
    }

    #[test]
    fn test_slots_are_stable_across_removals() {
        let mut tree = new_tree();
        let mut slots = Vec::new();
        for key in shuffled_keys(32) {
            slots.push((key, tree.insert(key).unwrap()));
        }

        // Remove a third of the keys; every survivor must still be
        // reachable through its original slot.
        for (key, _) in slots.iter().filter(|(key, _)| key % 3 == 0) {
            let slot = tree.search(key).unwrap();
            tree.remove(slot);
        }

        for (key, slot) in slots.iter().filter(|(key, _)| key % 3 != 0) {
            assert_eq!(tree.value(*slot), key);
            assert_eq!(tree.search(key), Some(*slot));
        }
    }

    #[test]
    fn test_validate_flags_bad_order() {
        let mut tree = new_tree();
        for key in [10u64, 20, 30, 40, 50] {
            tree.insert(key).unwrap();
        }

        assert!(tree.validate());

        // Rewriting a key in place breaks the search order.
        let slot = tree.search(&30).unwrap();
        *tree.value_mut(slot) = 999;
        assert!(!tree.validate());
    }

    #[test]
    fn test_mixed_insert_remove_stress() {
        let mut tree = new_tree();
        let mut rng = Lcg(0xfeed);
        let mut live: Vec<u64> = Vec::new();

        for round in 0..600 {
            if live.is_empty() || rng.next() % 3 != 0 {
                let key = rng.next() % 10_000;
                tree.insert(key).unwrap();
                live.push(key);
            } else {
                let index = (rng.next() as usize) % live.len();
                let key = live.swap_remove(index);
                let slot = tree.search(&key).unwrap();
                tree.remove(slot);
            }

            if round % 100 == 99 {
                assert!(tree.validate());
            }
        }

        live.sort_unstable();
        assert_eq!(collect(&tree), live);
        assert!(tree.validate());
    }
}
