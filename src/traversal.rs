//! Dirty-state tracking and traversal planning.
//!
//! Every node carries a [`DirtyState`]. Marks close the invariant "a node
//! with a non-clean child is itself non-clean" up to the root at mark time,
//! so [`TraversalPlanner::build_plan`] is a single scan over the tree's
//! post-order rather than a fixpoint.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::tree::{NodeId, Tree};

bitflags! {
    /// Per-node recomputation flags. Empty means clean.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyState: u8 {
        /// The node's own combination of its children must be recomputed.
        const NODE   = 0b01;
        /// The transition factor on the edge above the node must be recomputed.
        const BRANCH = 0b10;
    }
}

impl DirtyState {
    pub const CLEAN: DirtyState = DirtyState::empty();

    #[inline]
    pub fn is_clean(self) -> bool {
        self.is_empty()
    }
}

/// One transition-factor recomputation. The edge is named by its lower node.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchOperation {
    pub branch: NodeId,
    pub length: f64,
}

/// One planned combination step, before slots are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedNode {
    pub node: NodeId,
    pub left_child: NodeId,
    pub right_child: NodeId,
}

/// Output of [`TraversalPlanner::build_plan`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraversalPlan {
    /// Independent of one another; any order is valid.
    pub branch_operations: Vec<BranchOperation>,
    /// Strict post-order: children precede parents.
    pub node_operations: Vec<PlannedNode>,
    pub root: NodeId,
}

impl TraversalPlan {
    pub fn is_empty(&self) -> bool {
        self.branch_operations.is_empty() && self.node_operations.is_empty()
    }
}

/// Dirty-state tracker and traversal planner for one tree instance.
#[derive(Clone, Debug)]
pub struct TraversalPlanner {
    states: Vec<DirtyState>,
}

impl TraversalPlanner {
    /// New planner with every node dirty: nothing has been computed yet.
    pub fn new(node_count: usize) -> Self {
        Self {
            states: vec![DirtyState::all(); node_count],
        }
    }

    #[inline]
    pub fn state(&self, node: NodeId) -> DirtyState {
        self.states[node]
    }

    pub fn is_clean(&self) -> bool {
        self.states.iter().all(|s| s.is_clean())
    }

    pub fn dirty_count(&self) -> usize {
        self.states.iter().filter(|s| !s.is_clean()).count()
    }

    /// Node's own value changed; its incoming edge did not.
    pub fn mark_node(&mut self, tree: &Tree, node: NodeId) {
        self.states[node] |= DirtyState::NODE;
        self.mark_ancestors(tree, node);
    }

    /// Only the edge above `node` changed (length or rate).
    pub fn mark_branch(&mut self, tree: &Tree, node: NodeId) {
        self.states[node] |= DirtyState::BRANCH;
        self.mark_ancestors(tree, node);
    }

    /// Node moved or changed height: its combination and both adjoining
    /// edges (above it, and above each child) change.
    pub fn mark_node_and_children(&mut self, tree: &Tree, node: NodeId) {
        self.states[node] |= DirtyState::all();
        for &child in tree.children(node) {
            self.states[child] |= DirtyState::BRANCH;
        }
        self.mark_ancestors(tree, node);
    }

    /// Whole subtree below and including `node`.
    pub fn mark_node_and_descendants(&mut self, tree: &Tree, node: NodeId) {
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            self.states[n] = DirtyState::all();
            stack.extend_from_slice(tree.children(n));
        }
        self.mark_ancestors(tree, node);
    }

    pub fn mark_all(&mut self) {
        self.states.fill(DirtyState::all());
    }

    /// Reset every node to clean without producing a plan.
    pub fn clear(&mut self) {
        self.states.fill(DirtyState::CLEAN);
    }

    fn mark_ancestors(&mut self, tree: &Tree, node: NodeId) {
        let mut current = tree.parent(node);
        while let Some(p) = current {
            if self.states[p].contains(DirtyState::NODE) {
                // everything above is already marked
                break;
            }
            self.states[p] |= DirtyState::NODE;
            current = tree.parent(p);
        }
    }

    /// Produce the minimal plan for the current dirty state and reset every
    /// node to clean. Call only once the plan will be evaluated.
    pub fn build_plan(&mut self, tree: &Tree) -> TraversalPlan {
        let root = tree.root();
        let mut plan = TraversalPlan {
            root,
            ..TraversalPlan::default()
        };

        for &node in tree.post_order() {
            let state = self.states[node];
            if state.contains(DirtyState::BRANCH) && node != root {
                plan.branch_operations.push(BranchOperation {
                    branch: node,
                    length: tree.branch_length(node),
                });
            }
            if state.contains(DirtyState::NODE) && !tree.is_tip(node) {
                let children = tree.children(node);
                plan.node_operations.push(PlannedNode {
                    node,
                    left_child: children[0],
                    right_child: children[1],
                });
            }
        }

        self.clear();
        plan
    }
}
