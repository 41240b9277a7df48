//! Change notifications consumed by the engine.
//!
//! Every upstream change, whichever model it comes from, is one of these
//! shapes and goes through [`crate::likelihood::TreeDataLikelihood::handle_event`].

use serde::{Deserialize, Serialize};

use crate::tree::NodeId;

/// Which upstream collaborator raised the event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// The tree topology provider. Rejected when the tree is fixed.
    Tree,
    /// The branch-rate model supplying per-edge rates.
    RateModel,
    /// The numeric delegate's own model parameters.
    Delegate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A value-affecting parameter of one node changed.
    NodeParameterChanged(NodeId),
    /// A node was added to, removed from or moved along a branch, or its
    /// height changed: the node and both adjoining edges are affected.
    NodeStructureChanged(NodeId),
    /// Only the edge above the node changed.
    BranchChanged(NodeId),
    /// The node and its whole subtree changed.
    SubtreeChanged(NodeId),
    /// The whole tree was replaced.
    TreeReplaced,
    /// A global parameter changed; same effect as [`ChangeEvent::TreeReplaced`].
    GlobalChanged,
}

impl ChangeEvent {
    /// Node the event refers to, if it is local.
    pub fn node(&self) -> Option<NodeId> {
        match *self {
            ChangeEvent::NodeParameterChanged(n)
            | ChangeEvent::NodeStructureChanged(n)
            | ChangeEvent::BranchChanged(n)
            | ChangeEvent::SubtreeChanged(n) => Some(n),
            ChangeEvent::TreeReplaced | ChangeEvent::GlobalChanged => None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.node().is_none()
    }
}
