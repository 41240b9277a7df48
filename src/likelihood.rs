//! Likelihood orchestrator.
//!
//! Owns the cached log-likelihood and its validity, routes change events to
//! the planner, drives the delegate through the bounded underflow-retry loop
//! and exposes checkpoint / rollback to the sampler.
//!
//! Cache state machine: `Unknown -> Computing -> Known`. Any change event
//! moves back to `Unknown`; `rollback` returns straight to `Known` without
//! recomputation.

use tracing::{debug, error, info, warn};

use crate::buffers::SlotAllocator;
use crate::config::LikelihoodConfig;
use crate::delegate::{LikelihoodDelegate, NodeOperation, Traversal};
use crate::error::{LikelihoodError, Result};
use crate::events::{ChangeEvent, EventSource};
use crate::report::LikelihoodReport;
use crate::traversal::{TraversalPlan, TraversalPlanner};
use crate::tree::{NodeId, Tree};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheState {
    Unknown,
    Computing,
    Known,
}

/// Incrementally recomputed log-likelihood of data on a tree.
pub struct TreeDataLikelihood<D> {
    tree: Tree,
    delegate: D,
    planner: TraversalPlanner,
    slots: SlotAllocator,
    config: LikelihoodConfig,
    state: CacheState,
    log_likelihood: f64,
    stored_log_likelihood: Option<f64>,
    report: LikelihoodReport,
}

impl<D: LikelihoodDelegate> TreeDataLikelihood<D> {
    /// Bind `delegate` to `tree`. Structural mismatches between the two are
    /// reported here, once.
    pub fn new(tree: Tree, mut delegate: D, config: LikelihoodConfig) -> Result<Self> {
        delegate.bind(&tree)?;

        info!(
            nodes = tree.node_count(),
            tips = tree.tip_count(),
            fixed_tree = !tree.is_random(),
            max_underflow_attempts = config.max_underflow_attempts,
            "using TreeDataLikelihood"
        );

        let planner = TraversalPlanner::new(tree.node_count());
        let slots = SlotAllocator::new(tree.node_count(), tree.tip_count());

        Ok(Self {
            tree,
            delegate,
            planner,
            slots,
            config,
            state: CacheState::Unknown,
            log_likelihood: f64::NEG_INFINITY,
            stored_log_likelihood: None,
            report: LikelihoodReport::default(),
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_known(&self) -> bool {
        self.state == CacheState::Known
    }

    pub fn report(&self) -> &LikelihoodReport {
        &self.report
    }

    pub fn planner(&self) -> &TraversalPlanner {
        &self.planner
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    #[inline]
    fn count(&mut self, f: impl FnOnce(&mut LikelihoodReport)) {
        if self.config.count_operations {
            f(&mut self.report);
        }
    }

    /// Change a delegate parameter. The closure returns the event describing
    /// what it changed, which is routed like any other delegate event.
    pub fn update_delegate<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut D) -> ChangeEvent,
    {
        let event = f(&mut self.delegate);
        self.handle_event(EventSource::Delegate, event)
    }

    /// Like [`Self::update_delegate`] for changes the delegate may reject.
    /// On error no event is routed and the cached value stays as it was.
    pub fn try_update_delegate<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut D) -> Result<ChangeEvent>,
    {
        let event = f(&mut self.delegate)?;
        self.handle_event(EventSource::Delegate, event)
    }

    /// Route an upstream change to the planner and invalidate the cache.
    pub fn handle_event(&mut self, source: EventSource, event: ChangeEvent) -> Result<()> {
        if source == EventSource::Tree && !self.tree.is_random() {
            return Err(LikelihoodError::FixedTreeMutated);
        }
        if let Some(node) = event.node() {
            if !self.tree.contains(node) {
                return Err(LikelihoodError::UnknownNode {
                    node,
                    node_count: self.tree.node_count(),
                });
            }
        }

        match (source, event) {
            // per-edge rates: the edge above the node changes
            (EventSource::RateModel, ChangeEvent::NodeParameterChanged(node))
            | (_, ChangeEvent::BranchChanged(node)) => {
                self.planner.mark_branch(&self.tree, node);
                self.count(|r| r.single_node_marks += 1);
            }
            (_, ChangeEvent::NodeParameterChanged(node)) => {
                self.planner.mark_node(&self.tree, node);
                self.count(|r| r.single_node_marks += 1);
            }
            (_, ChangeEvent::NodeStructureChanged(node)) => {
                self.planner.mark_node_and_children(&self.tree, node);
                let marked = 1 + self.tree.children(node).len() as u64;
                self.count(|r| r.single_node_marks += marked);
            }
            (_, ChangeEvent::SubtreeChanged(node)) => {
                self.planner.mark_node_and_descendants(&self.tree, node);
                self.count(|r| r.single_node_marks += 1);
            }
            (_, ChangeEvent::TreeReplaced) | (_, ChangeEvent::GlobalChanged) => {
                self.mark_all();
            }
        }

        self.count(|r| r.model_changes += 1);
        self.state = CacheState::Unknown;
        Ok(())
    }

    fn mark_all(&mut self) {
        self.planner.mark_all();
        self.count(|r| r.full_tree_marks += 1);
        self.state = CacheState::Unknown;
    }

    /// Set the length of the branch above `node` and notify.
    pub fn set_branch_length(&mut self, node: NodeId, length: f64) -> Result<()> {
        if !self.tree.is_random() {
            return Err(LikelihoodError::FixedTreeMutated);
        }
        self.tree.set_branch_length(node, length)?;
        self.handle_event(EventSource::Tree, ChangeEvent::BranchChanged(node))
    }

    /// Exchange two subtrees (see [`Tree::exchange`]) and notify.
    pub fn exchange_subtrees(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        if !self.tree.is_random() {
            return Err(LikelihoodError::FixedTreeMutated);
        }
        self.tree.exchange(a, b)?;
        // Each moved subtree hangs under its new parent on a new branch.
        self.handle_event(EventSource::Tree, ChangeEvent::BranchChanged(a))?;
        self.handle_event(EventSource::Tree, ChangeEvent::BranchChanged(b))
    }

    /// Invalidate everything, including the delegate's own caches.
    pub fn force_dirty(&mut self) {
        self.count(|r| r.make_dirty_calls += 1);
        self.delegate.force_full_recompute();
        self.mark_all();
    }

    /// Current log-likelihood, recomputing only what changed.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.count(|r| r.value_requests += 1);

        if self.state == CacheState::Known {
            return Ok(self.log_likelihood);
        }

        self.count(|r| r.recomputations += 1);
        self.state = CacheState::Computing;

        match self.calculate() {
            Ok(value) => {
                self.log_likelihood = value;
                self.state = CacheState::Known;
                Ok(value)
            }
            Err(e) => {
                self.state = CacheState::Unknown;
                Err(e)
            }
        }
    }

    fn calculate(&mut self) -> Result<f64> {
        let attempts = self.config.max_underflow_attempts.max(1);

        for attempt in 1..=attempts {
            let plan = self.planner.build_plan(&self.tree);
            let traversal = self.resolve(plan);

            let branch_ops = traversal.branch_operations.len() as u64;
            let node_ops = traversal.node_operations.len() as u64;
            self.count(|r| {
                r.branch_operations += branch_ops;
                r.node_operations += node_ops;
            });
            debug!(attempt, branch_ops, node_ops, root = traversal.root, "evaluating traversal");

            match self.delegate.evaluate(&traversal) {
                Ok(value) => return Ok(value),
                Err(underflow) => {
                    // the delegate is expected to rescale; retry over the whole tree
                    warn!(attempt, %underflow, "likelihood underflow, forcing full recomputation");
                    self.count(|r| r.underflow_retries += 1);
                    self.mark_all();
                }
            }
        }

        error!(attempts, "likelihood underflow retry ceiling exceeded");
        Err(LikelihoodError::UnderflowCeilingExceeded { attempts })
    }

    /// Flip output slots and attach concrete slot indices to the plan.
    fn resolve(&mut self, plan: TraversalPlan) -> Traversal {
        let slots = &mut self.slots;
        let node_operations = plan
            .node_operations
            .iter()
            .map(|op| {
                slots.flip(op.node);
                NodeOperation {
                    node: op.node,
                    left_child: op.left_child,
                    right_child: op.right_child,
                    left_slot: slots.offset(op.left_child),
                    right_slot: slots.offset(op.right_child),
                    output_slot: slots.offset(op.node),
                }
            })
            .collect();

        Traversal {
            branch_operations: plan.branch_operations,
            node_operations,
            root: plan.root,
            root_slot: self.slots.offset(plan.root),
        }
    }

    /// Accept the current state. The value must be known.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.state != CacheState::Known {
            return Err(LikelihoodError::CheckpointWhileUnknown);
        }
        self.tree.store_state();
        self.slots.store_state();
        self.delegate.checkpoint();
        self.stored_log_likelihood = Some(self.log_likelihood);
        Ok(())
    }

    /// Reject everything since the last checkpoint. No recomputation.
    pub fn rollback(&mut self) -> Result<()> {
        let stored = self
            .stored_log_likelihood
            .ok_or(LikelihoodError::RollbackWithoutCheckpoint)?;
        self.tree.restore_state();
        self.slots.restore_state();
        self.delegate.rollback();
        self.planner.clear();
        self.log_likelihood = stored;
        self.state = CacheState::Known;
        Ok(())
    }
}

impl<D> std::fmt::Display for TreeDataLikelihood<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            CacheState::Known => writeln!(f, "TreeDataLikelihood({})", self.log_likelihood)?,
            _ => writeln!(f, "TreeDataLikelihood(unknown)")?,
        }
        write!(f, "{}", self.report)
    }
}
