use numpy::{PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyArithmeticError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::wrap_pyfunction;
use rayon::prelude::*;

use crate::config::LikelihoodConfig;
use crate::error::LikelihoodError;
use crate::events::ChangeEvent;
use crate::likelihood::TreeDataLikelihood;
use crate::pruning::{BinaryTraitDelegate, PruningConfig};
use crate::tree::Tree;

impl From<LikelihoodError> for PyErr {
    fn from(err: LikelihoodError) -> PyErr {
        match err {
            LikelihoodError::UnderflowCeilingExceeded { .. } => {
                PyArithmeticError::new_err(err.to_string())
            }
            e if e.is_structural() || e.is_contract_violation() => {
                PyValueError::new_err(e.to_string())
            }
            e => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

fn build_tree(
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    n_tips: usize,
) -> PyResult<Tree> {
    Ok(Tree::from_structure(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        n_tips,
    )?)
}

/// Incremental likelihood of a presence/absence matrix on one tree.
///
/// Tips are named "t0".."t{n_tips-1}" and match the rows of
/// `presence_matrix`.
#[pyclass]
struct TreeLikelihood {
    inner: TreeDataLikelihood<BinaryTraitDelegate>,
}

#[pymethods]
impl TreeLikelihood {
    #[new]
    #[pyo3(signature = (parent_indices, branch_lengths, presence_matrix, gain_rate, loss_rate, n_tips, max_underflow_attempts=100))]
    fn new(
        parent_indices: PyReadonlyArray1<i32>,
        branch_lengths: PyReadonlyArray1<f64>,
        presence_matrix: PyReadonlyArray2<i8>,
        gain_rate: f64,
        loss_rate: f64,
        n_tips: usize,
        max_underflow_attempts: usize,
    ) -> PyResult<Self> {
        let tree = build_tree(parent_indices, branch_lengths, n_tips)?;
        let delegate = BinaryTraitDelegate::new(
            tree.tip_names().to_vec(),
            presence_matrix.as_array(),
            gain_rate,
            loss_rate,
            PruningConfig::default(),
        )?;
        let config =
            LikelihoodConfig::default().with_max_underflow_attempts(max_underflow_attempts);
        Ok(Self {
            inner: TreeDataLikelihood::new(tree, delegate, config)?,
        })
    }

    fn log_likelihood(&mut self) -> PyResult<f64> {
        Ok(self.inner.log_likelihood()?)
    }

    fn set_branch_length(&mut self, node: usize, length: f64) -> PyResult<()> {
        Ok(self.inner.set_branch_length(node, length)?)
    }

    fn set_rates(&mut self, gain_rate: f64, loss_rate: f64) -> PyResult<()> {
        self.inner.try_update_delegate(|d| {
            d.set_rates(gain_rate, loss_rate)?;
            Ok(ChangeEvent::GlobalChanged)
        })?;
        Ok(())
    }

    fn exchange(&mut self, a: usize, b: usize) -> PyResult<()> {
        Ok(self.inner.exchange_subtrees(a, b)?)
    }

    fn store_state(&mut self) -> PyResult<()> {
        Ok(self.inner.checkpoint()?)
    }

    fn restore_state(&mut self) -> PyResult<()> {
        Ok(self.inner.rollback()?)
    }

    fn make_dirty(&mut self) {
        self.inner.force_dirty();
    }

    fn report(&self) -> String {
        self.inner.to_string()
    }

    /// Diagnostic counters as a dict.
    fn counters<'py>(&self, py: Python<'py>) -> PyResult<&'py PyDict> {
        let r = self.inner.report();
        let result = PyDict::new(py);
        result.set_item("recomputations", r.recomputations)?;
        result.set_item("underflow_retries", r.underflow_retries)?;
        result.set_item("single_node_marks", r.single_node_marks)?;
        result.set_item("full_tree_marks", r.full_tree_marks)?;
        result.set_item("node_operations", r.node_operations)?;
        result.set_item("branch_operations", r.branch_operations)?;
        result.set_item("model_changes", r.model_changes)?;
        result.set_item("make_dirty_calls", r.make_dirty_calls)?;
        result.set_item("value_requests", r.value_requests)?;
        Ok(result)
    }
}

/// One log-likelihood per column of `presence_matrix` (n_tips × n_families),
/// each family with its own entry of `gain_rates` / `loss_rates`.
///
/// Families are independent engines over clones of one tree and run on the
/// rayon pool. The first failing family aborts the call.
#[pyfunction]
fn compute_likelihoods_parallel<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    presence_matrix: PyReadonlyArray2<i8>,
    gain_rates: PyReadonlyArray1<f64>,
    loss_rates: PyReadonlyArray1<f64>,
    n_tips: usize,
) -> PyResult<&'py PyArray1<f64>> {
    let tree = build_tree(parent_indices, branch_lengths, n_tips)?;

    let presence = presence_matrix.as_array();
    let gains = gain_rates.as_array();
    let losses = loss_rates.as_array();
    let n_families = presence.shape()[1];

    let log_likelihoods: Vec<f64> = (0..n_families)
        .into_par_iter()
        .map(|family| {
            let column = presence.slice(ndarray::s![.., family..family + 1]);
            let delegate = BinaryTraitDelegate::new(
                tree.tip_names().to_vec(),
                column,
                gains[family],
                losses[family],
                PruningConfig::default(),
            )?;
            TreeDataLikelihood::new(tree.clone(), delegate, LikelihoodConfig::default())?
                .log_likelihood()
        })
        .collect::<Result<_, LikelihoodError>>()?;

    Ok(PyArray1::from_vec(py, log_likelihoods))
}

/// Python module definition
#[pymodule]
fn treelik(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<TreeLikelihood>()?;
    m.add_function(wrap_pyfunction!(compute_likelihoods_parallel, m)?)?;
    Ok(())
}
