//! Incremental likelihood evaluation over a rooted binary tree.
//!
//! [`TreeDataLikelihood`] keeps a cached log-likelihood and, when parameters
//! change, recomputes only the nodes whose value depends on them. Every
//! node's partials live in two slots so a proposal can be written to the
//! alternate slot and thrown away on [`TreeDataLikelihood::rollback`]
//! without copying anything.
//!
//! The arithmetic lives behind [`LikelihoodDelegate`];
//! [`pruning::BinaryTraitDelegate`] is the gain/loss model for binary
//! presence/absence data.
//!
//! Python bindings are compiled with the `python` feature.

pub mod buffers;
pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod likelihood;
pub mod pruning;
pub mod report;
pub mod traversal;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use buffers::SlotAllocator;
pub use config::LikelihoodConfig;
pub use delegate::{LikelihoodDelegate, NodeOperation, Traversal};
pub use error::{LikelihoodError, Result, Underflow};
pub use events::{ChangeEvent, EventSource};
pub use likelihood::{CacheState, TreeDataLikelihood};
pub use pruning::{BinaryTraitDelegate, PruningConfig, RescalingScheme};
pub use report::LikelihoodReport;
pub use traversal::{BranchOperation, DirtyState, PlannedNode, TraversalPlan, TraversalPlanner};
pub use tree::{NodeId, NodeKind, Tree};
