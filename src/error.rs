//! Error taxonomy for the likelihood engine.
//!
//! Underflow is not in here: it is an expected outcome of a single
//! evaluation and is handled inside the retry loop. Everything in
//! [`LikelihoodError`] is fatal for the call that produced it.

use thiserror::Error;

use crate::tree::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LikelihoodError>;

/// Signal from a numeric delegate that the accumulated value lost
/// precision (zero, NaN or infinite log-likelihood).
#[derive(Clone, Debug, Default, PartialEq, Error)]
#[error("numerical underflow{}", at_node(.node))]
pub struct Underflow {
    /// Node where underflow was first detected, if the delegate knows it.
    pub node: Option<NodeId>,
}

impl Underflow {
    pub fn at(node: NodeId) -> Self {
        Self { node: Some(node) }
    }
}

fn at_node(node: &Option<NodeId>) -> String {
    match node {
        Some(n) => format!(" at node {}", n),
        None => String::new(),
    }
}

/// Fatal errors surfaced to callers of the engine.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LikelihoodError {
    /// Every attempt in the retry loop underflowed.
    #[error("likelihood underflowed on all {attempts} attempts; model is numerically unstable")]
    UnderflowCeilingExceeded { attempts: usize },

    /// `checkpoint` was called while recomputation was pending.
    #[error("checkpoint requested while the likelihood is not known")]
    CheckpointWhileUnknown,

    /// `rollback` was called with nothing to roll back to.
    #[error("rollback requested without a prior checkpoint")]
    RollbackWithoutCheckpoint,

    /// A change event arrived from a tree declared fixed.
    #[error("attempting to change a fixed tree")]
    FixedTreeMutated,

    /// An event or mutation referred to a node the tree does not have.
    #[error("unknown node {node} (tree has {node_count} nodes)")]
    UnknownNode { node: NodeId, node_count: usize },

    /// Any other caller-side misuse.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A tip in the tree has no data row.
    #[error("taxon '{taxon}' in tree is not found in the data")]
    MissingTaxon { taxon: String },

    /// The tree structure itself is unusable.
    #[error("invalid tree: {0}")]
    InvalidTree(String),

    /// Data dimensions disagree with the tree.
    #[error("data shape mismatch: {0}")]
    DataShape(String),
}

impl LikelihoodError {
    /// True for programmer errors, as opposed to configuration or numerical
    /// failures.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            LikelihoodError::CheckpointWhileUnknown
                | LikelihoodError::RollbackWithoutCheckpoint
                | LikelihoodError::FixedTreeMutated
                | LikelihoodError::UnknownNode { .. }
                | LikelihoodError::ContractViolation(_)
        )
    }

    /// True for mismatches between tree and data found at setup.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LikelihoodError::MissingTaxon { .. }
                | LikelihoodError::InvalidTree(_)
                | LikelihoodError::DataShape(_)
        )
    }
}
