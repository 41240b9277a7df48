//! Contract between the engine and a numeric back end.
//!
//! The engine decides *which* buffers to recombine and *where* to write;
//! a [`LikelihoodDelegate`] does the arithmetic. Operations arrive with
//! concrete slot indices already resolved, so a delegate never needs to know
//! about dirty flags or selector bits.

use serde::{Deserialize, Serialize};

use crate::error::{Result, Underflow};
use crate::traversal::BranchOperation;
use crate::tree::{NodeId, Tree};

/// One combination step with resolved slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOperation {
    pub node: NodeId,
    pub left_child: NodeId,
    pub right_child: NodeId,
    pub left_slot: usize,
    pub right_slot: usize,
    pub output_slot: usize,
}

/// Everything a delegate needs for one evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Traversal {
    pub branch_operations: Vec<BranchOperation>,
    /// Strict post-order.
    pub node_operations: Vec<NodeOperation>,
    pub root: NodeId,
    pub root_slot: usize,
}

/// Numeric back end plugged into [`crate::likelihood::TreeDataLikelihood`].
pub trait LikelihoodDelegate {
    /// One-time check that the delegate's data matches `tree`
    /// (every tip has data, dimensions agree). Called by the engine at
    /// construction; errors here are structural and never retried.
    fn bind(&mut self, tree: &Tree) -> Result<()>;

    /// Recompute the listed branches, then the listed nodes in order, and
    /// reduce the root to a log-likelihood.
    fn evaluate(&mut self, traversal: &Traversal) -> std::result::Result<f64, Underflow>;

    /// Drop any cached state the delegate keeps on its own.
    fn force_full_recompute(&mut self);

    /// Commit delegate-private buffers (matrices, scale factors).
    fn checkpoint(&mut self);

    /// Revert delegate-private buffers to the last checkpoint.
    fn rollback(&mut self);
}

impl<D: LikelihoodDelegate + ?Sized> LikelihoodDelegate for Box<D> {
    fn bind(&mut self, tree: &Tree) -> Result<()> {
        (**self).bind(tree)
    }

    fn evaluate(&mut self, traversal: &Traversal) -> std::result::Result<f64, Underflow> {
        (**self).evaluate(traversal)
    }

    fn force_full_recompute(&mut self) {
        (**self).force_full_recompute()
    }

    fn checkpoint(&mut self) {
        (**self).checkpoint()
    }

    fn rollback(&mut self) {
        (**self).rollback()
    }
}
