//! Diagnostic counters for performance tuning.

use serde::{Deserialize, Serialize};

/// Cumulative counts since the engine was built. Rollback does not rewind
/// them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikelihoodReport {
    /// Recomputation passes (cache misses in `log_likelihood`).
    pub recomputations: u64,
    /// Evaluations that signalled underflow and were retried.
    pub underflow_retries: u64,
    /// Nodes flagged by local change events.
    pub single_node_marks: u64,
    /// Whole-tree invalidations (global events, underflow, `force_dirty`).
    pub full_tree_marks: u64,
    /// Node combinations handed to the delegate.
    pub node_operations: u64,
    /// Branch transition factors handed to the delegate.
    pub branch_operations: u64,
    /// Change events received.
    pub model_changes: u64,
    /// `force_dirty` calls.
    pub make_dirty_calls: u64,
    /// `log_likelihood` calls, cached or not.
    pub value_requests: u64,
}

impl std::fmt::Display for LikelihoodReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  total operations = {}", self.node_operations)?;
        writeln!(f, "  matrix updates = {}", self.branch_operations)?;
        writeln!(f, "  model changes = {}", self.model_changes)?;
        writeln!(f, "  make dirties = {}", self.make_dirty_calls)?;
        writeln!(f, "  calculate likelihoods = {}", self.recomputations)?;
        writeln!(f, "  get likelihoods = {}", self.value_requests)?;
        writeln!(f, "  underflow retries = {}", self.underflow_retries)?;
        writeln!(f, "  all rate updates = {}", self.full_tree_marks)?;
        write!(f, "  partial rate updates = {}", self.single_node_marks)
    }
}
