//! Felsenstein pruning delegate for binary trait evolution.
//!
//! Computes the log-likelihood of observing tip states (presence/absence
//! patterns) given a tree and a two-state gain/loss model, one node
//! operation at a time, so it can be driven incrementally by
//! [`crate::likelihood::TreeDataLikelihood`].
//!
//! Engine-private buffers:
//! - transition matrices, one double-buffered pair per branch
//! - cumulative log scale factors, stored next to each partials slot
//!
//! Partials can be rescaled per node to survive trees deep enough to
//! underflow `f64`. With [`RescalingScheme::Dynamic`] rescaling stays off
//! until the first underflow and then stays on.

use std::collections::HashMap;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffers::SlotAllocator;
use crate::delegate::{LikelihoodDelegate, NodeOperation, Traversal};
use crate::error::{LikelihoodError, Result, Underflow};
use crate::traversal::BranchOperation;
use crate::tree::{NodeId, Tree};

/// 2×2 transition probability matrix [[P00, P01], [P10, P11]].
pub type TransitionMatrix = [[f64; 2]; 2];

/// When partials are rescaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescalingScheme {
    /// Never rescale; deep trees fail with underflow.
    Never,
    /// Rescale every node, always.
    Always,
    /// Start unscaled, switch to `Always` after the first underflow.
    Dynamic,
}

/// Configuration for [`BinaryTraitDelegate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Default: Dynamic
    pub rescaling: RescalingScheme,
    /// Branch updates per evaluation above which matrices are computed with
    /// rayon. Default: 256
    pub parallel_branch_threshold: usize,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            rescaling: RescalingScheme::Dynamic,
            parallel_branch_threshold: 256,
        }
    }
}

/// Compute transition probability matrix for binary evolution.
///
/// Uses analytical solution for 2×2 continuous-time Markov chain:
/// Q = [[-λ, λ], [μ, -μ]]
/// P(t) = exp(Qt)
///
/// # Arguments
/// * `gain_rate` - Rate of 0→1 transitions (λ)
/// * `loss_rate` - Rate of 1→0 transitions (μ)
/// * `t` - Branch length (time)
pub fn transition_matrix(gain_rate: f64, loss_rate: f64, t: f64) -> TransitionMatrix {
    let total = gain_rate + loss_rate;

    if total < 1e-10 {
        // No evolution - identity matrix
        return [[1.0, 0.0], [0.0, 1.0]];
    }

    let exp_term = (-total * t).exp();

    let p00 = (loss_rate + gain_rate * exp_term) / total;
    let p01 = (gain_rate - gain_rate * exp_term) / total;
    let p10 = (loss_rate - loss_rate * exp_term) / total;
    let p11 = (gain_rate + loss_rate * exp_term) / total;

    [[p00, p01], [p10, p11]]
}

/// Compute equilibrium frequencies for binary evolution.
///
/// At equilibrium: π₀ · λ = π₁ · μ (detailed balance)
/// And: π₀ + π₁ = 1
pub fn equilibrium_frequencies(gain_rate: f64, loss_rate: f64) -> [f64; 2] {
    let total = gain_rate + loss_rate;

    if total < 1e-10 {
        return [0.5, 0.5];
    }

    [loss_rate / total, gain_rate / total]
}

/// Collapse identical columns of a (taxa × sites) matrix into unique
/// patterns with multiplicities as weights. Pattern order follows first
/// occurrence.
pub fn compress_patterns(sites: ArrayView2<i8>) -> (Array2<i8>, Vec<f64>) {
    let mut index: HashMap<Vec<i8>, usize> = HashMap::new();
    let mut columns: Vec<Vec<i8>> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();

    for column in sites.axis_iter(Axis(1)) {
        let key = column.to_vec();
        match index.get(&key) {
            Some(&i) => weights[i] += 1.0,
            None => {
                index.insert(key.clone(), columns.len());
                columns.push(key);
                weights.push(1.0);
            }
        }
    }

    let n_taxa = sites.nrows();
    let patterns = Array2::from_shape_fn((n_taxa, columns.len()), |(t, p)| columns[p][t]);
    (patterns, weights)
}

/// Tip partials for one observed state: 0 absent, 1 present, anything else
/// unknown.
#[inline]
fn tip_partial(state: i8) -> [f64; 2] {
    match state {
        0 => [1.0, 0.0],
        1 => [0.0, 1.0],
        _ => [1.0, 1.0],
    }
}

/// Numeric delegate for the binary gain/loss model.
#[derive(Clone, Debug)]
pub struct BinaryTraitDelegate {
    config: PruningConfig,
    gain_rate: f64,
    loss_rate: f64,
    stored_rates: (f64, f64),
    frequencies: [f64; 2],
    taxa: Vec<String>,
    /// (taxa × patterns) observed states
    patterns: Array2<i8>,
    pattern_weights: Vec<f64>,
    /// per partials slot: (patterns × 2)
    partials: Vec<Array2<f64>>,
    /// per partials slot: cumulative log scale of the subtree, per pattern
    log_scale: Vec<Array1<f64>>,
    matrices: Vec<TransitionMatrix>,
    matrix_slots: SlotAllocator,
    use_scaling: bool,
    ever_underflowed: bool,
}

impl BinaryTraitDelegate {
    /// Build from a (taxa × sites) presence/absence matrix; identical sites
    /// are compressed into weighted patterns.
    pub fn new(
        taxa: Vec<String>,
        sites: ArrayView2<i8>,
        gain_rate: f64,
        loss_rate: f64,
        config: PruningConfig,
    ) -> Result<Self> {
        let (patterns, weights) = compress_patterns(sites);
        Self::with_patterns(taxa, patterns, weights, gain_rate, loss_rate, config)
    }

    /// Build from already-compressed patterns.
    pub fn with_patterns(
        taxa: Vec<String>,
        patterns: Array2<i8>,
        pattern_weights: Vec<f64>,
        gain_rate: f64,
        loss_rate: f64,
        config: PruningConfig,
    ) -> Result<Self> {
        if patterns.nrows() != taxa.len() {
            return Err(LikelihoodError::DataShape(format!(
                "{} data rows for {} taxa",
                patterns.nrows(),
                taxa.len()
            )));
        }
        if patterns.ncols() != pattern_weights.len() {
            return Err(LikelihoodError::DataShape(format!(
                "{} patterns but {} weights",
                patterns.ncols(),
                pattern_weights.len()
            )));
        }
        check_rates(gain_rate, loss_rate)?;

        let use_scaling = config.rescaling == RescalingScheme::Always;
        Ok(Self {
            config,
            gain_rate,
            loss_rate,
            stored_rates: (gain_rate, loss_rate),
            frequencies: equilibrium_frequencies(gain_rate, loss_rate),
            taxa,
            patterns,
            pattern_weights,
            partials: Vec::new(),
            log_scale: Vec::new(),
            matrices: Vec::new(),
            matrix_slots: SlotAllocator::new(0, 0),
            use_scaling,
            ever_underflowed: false,
        })
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_weights.len()
    }

    pub fn pattern_weights(&self) -> &[f64] {
        &self.pattern_weights
    }

    pub fn rates(&self) -> (f64, f64) {
        (self.gain_rate, self.loss_rate)
    }

    pub fn is_rescaling(&self) -> bool {
        self.use_scaling
    }

    pub fn ever_underflowed(&self) -> bool {
        self.ever_underflowed
    }

    /// Change gain/loss rates. Every branch matrix depends on them, so the
    /// caller must follow with a global change event (see
    /// [`crate::likelihood::TreeDataLikelihood::update_delegate`]).
    pub fn set_rates(&mut self, gain_rate: f64, loss_rate: f64) -> Result<()> {
        check_rates(gain_rate, loss_rate)?;
        self.gain_rate = gain_rate;
        self.loss_rate = loss_rate;
        self.frequencies = equilibrium_frequencies(gain_rate, loss_rate);
        Ok(())
    }

    fn update_matrices(&mut self, operations: &[BranchOperation]) {
        let (gain, loss) = (self.gain_rate, self.loss_rate);
        let computed: Vec<(NodeId, TransitionMatrix)> =
            if operations.len() >= self.config.parallel_branch_threshold {
                operations
                    .par_iter()
                    .map(|op| (op.branch, transition_matrix(gain, loss, op.length)))
                    .collect()
            } else {
                operations
                    .iter()
                    .map(|op| (op.branch, transition_matrix(gain, loss, op.length)))
                    .collect()
            };

        for (branch, matrix) in computed {
            self.matrix_slots.flip(branch);
            let slot = self.matrix_slots.offset(branch);
            self.matrices[slot] = matrix;
        }
    }

    fn update_partials(&mut self, op: &NodeOperation) {
        let p_left = self.matrices[self.matrix_slots.offset(op.left_child)];
        let p_right = self.matrices[self.matrix_slots.offset(op.right_child)];
        let left = &self.partials[op.left_slot];
        let right = &self.partials[op.right_slot];

        let n_patterns = self.pattern_weights.len();
        let mut out = Array2::<f64>::zeros((n_patterns, 2));
        for p in 0..n_patterns {
            // For each parent state, integrate over child states
            for state in 0..2 {
                let l = p_left[state][0] * left[[p, 0]] + p_left[state][1] * left[[p, 1]];
                let r = p_right[state][0] * right[[p, 0]] + p_right[state][1] * right[[p, 1]];
                out[[p, state]] = l * r;
            }
        }

        let mut scale = &self.log_scale[op.left_slot] + &self.log_scale[op.right_slot];
        if self.use_scaling {
            for (mut row, s) in out.axis_iter_mut(Axis(0)).zip(scale.iter_mut()) {
                let max = row[0].max(row[1]);
                if max > 0.0 {
                    row /= max;
                    *s += max.ln();
                }
            }
        }

        self.partials[op.output_slot] = out;
        self.log_scale[op.output_slot] = scale;
    }

    fn root_log_likelihood(&self, root_slot: usize) -> f64 {
        let root = &self.partials[root_slot];
        let scale = &self.log_scale[root_slot];
        let [pi0, pi1] = self.frequencies;

        self.pattern_weights
            .iter()
            .enumerate()
            .map(|(p, &w)| {
                let site = pi0 * root[[p, 0]] + pi1 * root[[p, 1]];
                w * (site.ln() + scale[p])
            })
            .sum()
    }
}

fn check_rates(gain_rate: f64, loss_rate: f64) -> Result<()> {
    if gain_rate.is_finite() && loss_rate.is_finite() && gain_rate >= 0.0 && loss_rate >= 0.0 {
        Ok(())
    } else {
        Err(LikelihoodError::ContractViolation(format!(
            "rates must be finite and non-negative (gain {}, loss {})",
            gain_rate, loss_rate
        )))
    }
}

impl LikelihoodDelegate for BinaryTraitDelegate {
    fn bind(&mut self, tree: &Tree) -> Result<()> {
        let slots = SlotAllocator::new(tree.node_count(), tree.tip_count());
        let n_patterns = self.pattern_weights.len();

        let rows: HashMap<&str, usize> = self
            .taxa
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        self.partials = vec![Array2::zeros((n_patterns, 2)); slots.buffer_count()];
        self.log_scale = vec![Array1::zeros(n_patterns); slots.buffer_count()];

        // Set tip conditionals based on observed data
        for tip in 0..tree.tip_count() {
            let name = tree.tip_name(tip).unwrap_or_default();
            let row = *rows.get(name).ok_or_else(|| LikelihoodError::MissingTaxon {
                taxon: name.to_string(),
            })?;
            let partials = &mut self.partials[slots.offset(tip)];
            for (p, &state) in self.patterns.row(row).iter().enumerate() {
                let [absent, present] = tip_partial(state);
                partials[[p, 0]] = absent;
                partials[[p, 1]] = present;
            }
        }

        self.matrix_slots = SlotAllocator::new(tree.node_count(), 0);
        self.matrices = vec![[[1.0, 0.0], [0.0, 1.0]]; self.matrix_slots.buffer_count()];

        info!(
            tips = tree.tip_count(),
            patterns = n_patterns,
            rescaling = ?self.config.rescaling,
            "binary trait delegate bound"
        );
        Ok(())
    }

    fn evaluate(&mut self, traversal: &Traversal) -> std::result::Result<f64, Underflow> {
        self.update_matrices(&traversal.branch_operations);
        for op in &traversal.node_operations {
            self.update_partials(op);
        }

        let log_l = self.root_log_likelihood(traversal.root_slot);
        if log_l.is_finite() {
            return Ok(log_l);
        }

        self.ever_underflowed = true;
        if self.config.rescaling == RescalingScheme::Dynamic && !self.use_scaling {
            warn!(root = traversal.root, "partials underflowed, switching on rescaling");
            self.use_scaling = true;
        }
        Err(Underflow::at(traversal.root))
    }

    /// No cache lives outside the slots the engine flips and rewrites, so
    /// there is nothing to drop. Frequencies are recomputed from the rates.
    fn force_full_recompute(&mut self) {
        self.frequencies = equilibrium_frequencies(self.gain_rate, self.loss_rate);
    }

    fn checkpoint(&mut self) {
        self.matrix_slots.store_state();
        self.stored_rates = (self.gain_rate, self.loss_rate);
    }

    fn rollback(&mut self) {
        self.matrix_slots.restore_state();
        let (gain, loss) = self.stored_rates;
        self.gain_rate = gain;
        self.loss_rate = loss;
        self.frequencies = equilibrium_frequencies(gain, loss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LikelihoodConfig;
    use crate::events::ChangeEvent;
    use crate::likelihood::TreeDataLikelihood;
    use ndarray::array;

    /// Whole-tree pruning for one site, for checking the incremental path.
    fn pruning_from_scratch(tree: &Tree, tip_data: &[i8], gain_rate: f64, loss_rate: f64) -> f64 {
        let mut conditionals = vec![[1.0; 2]; tree.node_count()];
        for (tip, &state) in tip_data.iter().enumerate() {
            conditionals[tip] = tip_partial(state);
        }
        for &node in tree.post_order() {
            if tree.is_tip(node) {
                continue;
            }
            for &child in tree.children(node) {
                let p = transition_matrix(gain_rate, loss_rate, tree.branch_length(child));
                let mut contrib = [0.0; 2];
                for parent_state in 0..2 {
                    for child_state in 0..2 {
                        contrib[parent_state] +=
                            p[parent_state][child_state] * conditionals[child][child_state];
                    }
                }
                for state in 0..2 {
                    conditionals[node][state] *= contrib[state];
                }
            }
        }
        let eq = equilibrium_frequencies(gain_rate, loss_rate);
        let root = conditionals[tree.root()];
        (eq[0] * root[0] + eq[1] * root[1]).ln()
    }

    fn taxa(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{}", i)).collect()
    }

    fn four_taxa() -> Tree {
        Tree::from_newick("((t0:0.2,t1:0.3):0.1,(t2:0.4,t3:0.5):0.2);", &taxa(4)).unwrap()
    }

    /// Caterpillar tree: tips 0..n, internal node n + k joins tip k + 1.
    fn caterpillar(n_tips: usize, branch: f64) -> Tree {
        let n_nodes = 2 * n_tips - 1;
        let mut parents = vec![-1i32; n_nodes];
        parents[0] = n_tips as i32;
        parents[1] = n_tips as i32;
        for k in 2..n_tips {
            parents[k] = (n_tips + k - 1) as i32;
        }
        for k in 0..n_tips - 2 {
            parents[n_tips + k] = (n_tips + k + 1) as i32;
        }
        let mut lengths = vec![branch; n_nodes];
        lengths[n_nodes - 1] = 0.0;
        Tree::from_structure(parents, lengths, n_tips).unwrap()
    }

    #[test]
    fn test_transition_matrix() {
        let p = transition_matrix(1.0, 1.0, 1.0);

        // Rows should sum to 1
        assert!((p[0][0] + p[0][1] - 1.0).abs() < 1e-10);
        assert!((p[1][0] + p[1][1] - 1.0).abs() < 1e-10);

        // All probabilities should be in [0, 1]
        for row in &p {
            for &x in row {
                assert!((0.0..=1.0).contains(&x));
            }
        }
    }

    #[test]
    fn test_equilibrium_frequencies() {
        let eq = equilibrium_frequencies(1.5, 2.0);

        assert!((eq[0] + eq[1] - 1.0).abs() < 1e-10);
        assert!(eq[0] > 0.0 && eq[1] > 0.0);
        // With higher loss rate, π₀ should be larger
        assert!(eq[0] > eq[1]);
    }

    #[test]
    fn test_compress_patterns() {
        let sites = array![[1i8, 0, 1, 1], [0, 0, 0, 1], [1, 1, 1, 1]];
        let (patterns, weights) = compress_patterns(sites.view());
        assert_eq!(patterns, array![[1i8, 0, 1], [0, 0, 1], [1, 1, 1]]);
        assert_eq!(weights, vec![2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_engine_matches_scratch_pruning() {
        let tree = four_taxa();
        let sites = array![[1i8, 0, 1], [1, 0, 0], [0, 1, 1], [0, 0, 1]];
        let delegate =
            BinaryTraitDelegate::new(taxa(4), sites.view(), 0.7, 1.3, PruningConfig::default())
                .unwrap();
        let mut lik = TreeDataLikelihood::new(tree.clone(), delegate, LikelihoodConfig::default())
            .unwrap();

        let expected: f64 = (0..3)
            .map(|s| {
                let column: Vec<i8> = sites.column(s).to_vec();
                pruning_from_scratch(&tree, &column, 0.7, 1.3)
            })
            .sum();
        let value = lik.log_likelihood().unwrap();
        assert!((value - expected).abs() < 1e-10, "{} vs {}", value, expected);
        assert!(value < 0.0);
    }

    #[test]
    fn test_incremental_change_matches_scratch() {
        let tree = four_taxa();
        let sites = array![[1i8, 0], [1, 0], [0, 1], [0, -1]];
        let delegate =
            BinaryTraitDelegate::new(taxa(4), sites.view(), 1.0, 1.0, PruningConfig::default())
                .unwrap();
        let mut lik = TreeDataLikelihood::new(tree, delegate, LikelihoodConfig::default()).unwrap();
        lik.log_likelihood().unwrap();
        lik.checkpoint().unwrap();

        lik.set_branch_length(2, 1.7).unwrap();
        let value = lik.log_likelihood().unwrap();
        let expected: f64 = (0..2)
            .map(|s| pruning_from_scratch(lik.tree(), &sites.column(s).to_vec(), 1.0, 1.0))
            .sum();
        assert!((value - expected).abs() < 1e-10);
    }

    #[test]
    fn test_rate_change_and_rollback() {
        let sites = array![[1i8], [1], [0], [0]];
        let delegate =
            BinaryTraitDelegate::new(taxa(4), sites.view(), 1.0, 1.0, PruningConfig::default())
                .unwrap();
        let mut lik =
            TreeDataLikelihood::new(four_taxa(), delegate, LikelihoodConfig::default()).unwrap();
        let before = lik.log_likelihood().unwrap();
        lik.checkpoint().unwrap();

        lik.update_delegate(|d| {
            d.set_rates(0.2, 3.0).unwrap();
            ChangeEvent::GlobalChanged
        })
        .unwrap();
        let after = lik.log_likelihood().unwrap();
        let expected = pruning_from_scratch(lik.tree(), &[1, 1, 0, 0], 0.2, 3.0);
        assert!((after - expected).abs() < 1e-10);

        lik.rollback().unwrap();
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), before.to_bits());
        assert_eq!(lik.delegate().rates(), (1.0, 1.0));

        // matrices were rolled back too: a local change sees the old rates
        lik.set_branch_length(0, 0.9).unwrap();
        let local = lik.log_likelihood().unwrap();
        let expected = pruning_from_scratch(lik.tree(), &[1, 1, 0, 0], 1.0, 1.0);
        assert!((local - expected).abs() < 1e-10);
    }

    #[test]
    fn test_rejected_rates_keep_cached_value() {
        let sites = array![[1i8], [1], [0], [0]];
        let delegate =
            BinaryTraitDelegate::new(taxa(4), sites.view(), 1.0, 1.0, PruningConfig::default())
                .unwrap();
        let mut lik =
            TreeDataLikelihood::new(four_taxa(), delegate, LikelihoodConfig::default()).unwrap();
        let value = lik.log_likelihood().unwrap();
        let changes = lik.report().model_changes;

        let result = lik.try_update_delegate(|d| {
            d.set_rates(-1.0, 1.0)?;
            Ok(ChangeEvent::GlobalChanged)
        });
        assert!(matches!(result, Err(LikelihoodError::ContractViolation(_))));
        assert!(lik.is_known());
        assert_eq!(lik.report().model_changes, changes);
        assert_eq!(lik.report().full_tree_marks, 0);
        assert_eq!(lik.delegate().rates(), (1.0, 1.0));
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), value.to_bits());
        assert_eq!(lik.report().recomputations, 1);

        lik.try_update_delegate(|d| {
            d.set_rates(0.5, 2.0)?;
            Ok(ChangeEvent::GlobalChanged)
        })
        .unwrap();
        assert!(!lik.is_known());
        let expected = pruning_from_scratch(lik.tree(), &[1, 1, 0, 0], 0.5, 2.0);
        assert!((lik.log_likelihood().unwrap() - expected).abs() < 1e-10);
    }

    #[test]
    fn test_force_dirty_recomputes_same_value() {
        let sites = array![[1i8, 0], [1, 1], [0, 1], [0, -1]];
        let delegate =
            BinaryTraitDelegate::new(taxa(4), sites.view(), 0.4, 1.1, PruningConfig::default())
                .unwrap();
        let mut lik =
            TreeDataLikelihood::new(four_taxa(), delegate, LikelihoodConfig::default()).unwrap();
        let value = lik.log_likelihood().unwrap();

        lik.force_dirty();
        assert!(!lik.is_known());
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), value.to_bits());
        assert_eq!(lik.report().node_operations, 6);
    }

    #[test]
    fn test_missing_taxon_fails_at_setup() {
        let sites = array![[1i8], [0], [1], [0]];
        let names = vec!["t0".to_string(), "t1".to_string(), "t2".to_string(), "x".to_string()];
        let delegate =
            BinaryTraitDelegate::new(names, sites.view(), 1.0, 1.0, PruningConfig::default())
                .unwrap();
        let err = TreeDataLikelihood::new(four_taxa(), delegate, LikelihoodConfig::default())
            .err()
            .unwrap();
        assert_eq!(err, LikelihoodError::MissingTaxon { taxon: "t3".to_string() });
        assert!(err.is_structural());
    }

    #[test]
    fn test_data_shape_checked() {
        let sites = array![[1i8], [0]];
        let result =
            BinaryTraitDelegate::new(taxa(3), sites.view(), 1.0, 1.0, PruningConfig::default());
        assert!(matches!(result, Err(LikelihoodError::DataShape(_))));
    }

    #[test]
    fn test_deep_tree_recovers_with_dynamic_rescaling() {
        // every tip present under a strong loss rate: each tip contributes
        // a factor well below one and the unscaled product underflows
        let n_tips = 1200;
        let tree = caterpillar(n_tips, 2.0);
        let sites = Array2::<i8>::ones((n_tips, 1));
        let delegate =
            BinaryTraitDelegate::new(taxa(n_tips), sites.view(), 0.1, 5.0, PruningConfig::default())
                .unwrap();
        let mut lik = TreeDataLikelihood::new(tree, delegate, LikelihoodConfig::default()).unwrap();

        let value = lik.log_likelihood().unwrap();
        assert!(value.is_finite());
        assert!(lik.delegate().is_rescaling());
        assert!(lik.delegate().ever_underflowed());
        assert_eq!(lik.report().underflow_retries, 1);

        // later local changes stay scaled and consistent
        lik.checkpoint().unwrap();
        lik.set_branch_length(0, 1.0).unwrap();
        let changed = lik.log_likelihood().unwrap();
        assert!(changed.is_finite());
        assert_eq!(lik.report().underflow_retries, 1);
        lik.rollback().unwrap();
        assert_eq!(lik.log_likelihood().unwrap().to_bits(), value.to_bits());
    }

    #[test]
    fn test_deep_tree_without_rescaling_hits_ceiling() {
        let n_tips = 1200;
        let tree = caterpillar(n_tips, 2.0);
        let sites = Array2::<i8>::ones((n_tips, 1));
        let config = PruningConfig {
            rescaling: RescalingScheme::Never,
            ..PruningConfig::default()
        };
        let delegate =
            BinaryTraitDelegate::new(taxa(n_tips), sites.view(), 0.1, 5.0, config).unwrap();
        let mut lik = TreeDataLikelihood::new(
            tree,
            delegate,
            LikelihoodConfig::default().with_max_underflow_attempts(3),
        )
        .unwrap();

        assert_eq!(
            lik.log_likelihood(),
            Err(LikelihoodError::UnderflowCeilingExceeded { attempts: 3 })
        );
    }

    #[test]
    fn test_always_rescaling_matches_unscaled() {
        let sites = array![[1i8, 0], [1, 1], [0, 1], [0, 0]];
        let unscaled = BinaryTraitDelegate::new(
            taxa(4),
            sites.view(),
            0.5,
            0.8,
            PruningConfig {
                rescaling: RescalingScheme::Never,
                ..PruningConfig::default()
            },
        )
        .unwrap();
        let scaled = BinaryTraitDelegate::new(
            taxa(4),
            sites.view(),
            0.5,
            0.8,
            PruningConfig {
                rescaling: RescalingScheme::Always,
                parallel_branch_threshold: 1,
            },
        )
        .unwrap();

        let mut a = TreeDataLikelihood::new(four_taxa(), unscaled, LikelihoodConfig::default())
            .unwrap();
        let mut b =
            TreeDataLikelihood::new(four_taxa(), scaled, LikelihoodConfig::default()).unwrap();
        let (la, lb) = (a.log_likelihood().unwrap(), b.log_likelihood().unwrap());
        assert!((la - lb).abs() < 1e-10);
    }
}
