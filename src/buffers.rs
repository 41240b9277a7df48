//! Double-buffered slot allocation.
//!
//! Tips own one slot each (their data never changes). Every other node owns
//! two slots and a selector bit choosing the active one. Recomputing a node
//! first flips it so the write lands in the inactive slot, leaving the
//! committed value readable and restorable.
//!
//! Slot layout: tip `i` → `i`; internal node `n` → `tips + 2 * (n - tips) + selector`.

use crate::tree::NodeId;

#[derive(Clone, Debug)]
pub struct SlotAllocator {
    node_count: usize,
    fixed_count: usize,
    selector: Vec<bool>,
    flipped: Vec<bool>,
    touched: Vec<NodeId>,
}

impl SlotAllocator {
    /// `fixed_count` leading nodes get a single slot; the rest are doubled.
    pub fn new(node_count: usize, fixed_count: usize) -> Self {
        let doubled = node_count.saturating_sub(fixed_count);
        Self {
            node_count,
            fixed_count: fixed_count.min(node_count),
            selector: vec![false; doubled],
            flipped: vec![false; doubled],
            touched: Vec::new(),
        }
    }

    /// Total number of slots a backing arena needs.
    pub fn buffer_count(&self) -> usize {
        self.fixed_count + 2 * self.selector.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Active slot index for `node`.
    #[inline]
    pub fn offset(&self, node: NodeId) -> usize {
        if node < self.fixed_count {
            return node;
        }
        let k = node - self.fixed_count;
        self.fixed_count + 2 * k + self.selector[k] as usize
    }

    /// Point `node` at its inactive slot before writing a new value.
    ///
    /// A node already flipped since the last checkpoint stays on its
    /// tentative slot, so repeated recomputation (including underflow
    /// retries) never overwrites the committed value.
    pub fn flip(&mut self, node: NodeId) {
        if node < self.fixed_count {
            return;
        }
        let k = node - self.fixed_count;
        if self.flipped[k] {
            return;
        }
        self.flipped[k] = true;
        self.selector[k] = !self.selector[k];
        self.touched.push(node);
    }

    /// True if `node` holds a tentative value not yet committed.
    pub fn is_tentative(&self, node: NodeId) -> bool {
        node >= self.fixed_count && self.flipped[node - self.fixed_count]
    }

    /// Number of nodes flipped since the last checkpoint.
    pub fn pending(&self) -> usize {
        self.touched.len()
    }

    /// Commit every flip since the last checkpoint. No data moves.
    pub fn store_state(&mut self) {
        for node in self.touched.drain(..) {
            self.flipped[node - self.fixed_count] = false;
        }
    }

    /// Revert every flip since the last checkpoint.
    pub fn restore_state(&mut self) {
        for node in self.touched.drain(..) {
            let k = node - self.fixed_count;
            self.flipped[k] = false;
            self.selector[k] = !self.selector[k];
        }
    }
}
