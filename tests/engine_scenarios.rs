use ndarray::{array, Array2};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treelik::{
    BinaryTraitDelegate, CacheState, ChangeEvent, EventSource, LikelihoodConfig, LikelihoodError,
    PruningConfig, Tree, TreeDataLikelihood,
};

const NEWICK: &str = "((A:0.1,B:0.2):0.3,((C:0.4,D:0.5):0.6,E:0.7):0.8);";

fn taxa() -> Vec<String> {
    ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect()
}

fn sites() -> Array2<i8> {
    array![
        [1, 0, 1, 1, 0, 1],
        [1, 0, 0, 1, 0, 1],
        [0, 1, 1, 1, 1, 0],
        [0, 1, 1, 0, 1, -1],
        [1, 1, 0, 0, 1, 0],
    ]
}

fn engine(tree: Tree, gain: f64, loss: f64) -> TreeDataLikelihood<BinaryTraitDelegate> {
    let delegate =
        BinaryTraitDelegate::new(taxa(), sites().view(), gain, loss, PruningConfig::default())
            .unwrap();
    TreeDataLikelihood::new(tree, delegate, LikelihoodConfig::default()).unwrap()
}

fn fresh_value(tree: &Tree, gain: f64, loss: f64) -> f64 {
    engine(tree.clone(), gain, loss).log_likelihood().unwrap()
}

#[test]
fn single_branch_proposal_touches_one_path() {
    let tree = Tree::from_newick(NEWICK, &taxa()).unwrap();
    let mut lik = engine(tree, 0.8, 1.2);

    let initial = lik.log_likelihood().unwrap();
    assert_eq!(lik.report().node_operations, 4);
    assert_eq!(lik.report().branch_operations, 8);
    lik.checkpoint().unwrap();

    // branch above A: only (A,B) and the root recombine
    lik.set_branch_length(0, 0.35).unwrap();
    let proposed = lik.log_likelihood().unwrap();
    assert_eq!(lik.report().node_operations, 6);
    assert_eq!(lik.report().branch_operations, 9);
    assert!((proposed - fresh_value(lik.tree(), 0.8, 1.2)).abs() < 1e-10);

    lik.rollback().unwrap();
    assert_eq!(lik.state(), CacheState::Known);
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), initial.to_bits());
    assert_eq!(lik.report().recomputations, 2);
}

#[test]
fn random_walk_matches_fresh_engines() {
    let mut rng = StdRng::seed_from_u64(42);
    let tree = Tree::from_newick(NEWICK, &taxa()).unwrap();
    let mut lik = engine(tree, 1.0, 1.0);
    let mut rates = (1.0, 1.0);
    let mut current = lik.log_likelihood().unwrap();
    lik.checkpoint().unwrap();

    for step in 0..200 {
        let proposed_rates = match rng.gen_range(0..4) {
            0 | 1 => {
                let node = rng.gen_range(0..8);
                lik.set_branch_length(node, rng.gen_range(0.01..2.0)).unwrap();
                rates
            }
            2 => {
                // (A,B) against E, or B against (C,D)
                let (a, b) = if rng.gen_bool(0.5) { (5, 4) } else { (1, 6) };
                lik.exchange_subtrees(a, b).unwrap();
                rates
            }
            _ => {
                let new_rates = (rng.gen_range(0.1..3.0), rng.gen_range(0.1..3.0));
                lik.update_delegate(|d| {
                    d.set_rates(new_rates.0, new_rates.1).unwrap();
                    ChangeEvent::GlobalChanged
                })
                .unwrap();
                new_rates
            }
        };

        let value = lik.log_likelihood().unwrap();
        let expected = fresh_value(lik.tree(), proposed_rates.0, proposed_rates.1);
        assert!(
            (value - expected).abs() < 1e-9,
            "step {}: {} vs {}",
            step,
            value,
            expected
        );

        if rng.gen_bool(0.5) {
            lik.checkpoint().unwrap();
            current = value;
            rates = proposed_rates;
        } else {
            lik.rollback().unwrap();
            assert_eq!(lik.log_likelihood().unwrap().to_bits(), current.to_bits());
            assert_eq!(lik.delegate().rates(), rates);
        }
    }
}

#[test]
fn exchange_that_would_break_the_tree_is_rejected() {
    let tree = Tree::from_newick(NEWICK, &taxa()).unwrap();
    let mut lik = engine(tree, 1.0, 1.0);
    let value = lik.log_likelihood().unwrap();

    // siblings, and a node against its own ancestor
    assert!(lik.exchange_subtrees(0, 1).is_err());
    assert!(lik.exchange_subtrees(2, 7).is_err());
    assert_eq!(lik.state(), CacheState::Known);
    assert_eq!(lik.log_likelihood().unwrap().to_bits(), value.to_bits());
}

#[test]
fn fixed_tree_rejects_tree_events_only() {
    let tree = Tree::from_newick(NEWICK, &taxa()).unwrap().with_random(false);
    let mut lik = engine(tree, 1.0, 1.0);
    lik.log_likelihood().unwrap();

    assert_eq!(
        lik.handle_event(EventSource::Tree, ChangeEvent::NodeParameterChanged(5)),
        Err(LikelihoodError::FixedTreeMutated)
    );
    lik.handle_event(EventSource::RateModel, ChangeEvent::NodeParameterChanged(5))
        .unwrap();
    assert_eq!(lik.state(), CacheState::Unknown);
}

#[test]
fn missing_taxon_is_reported_at_construction() {
    let tree = Tree::from_newick("((A:1,B:1):1,(C:1,Z:1):1);", &[
        "A".to_string(),
        "B".to_string(),
        "C".to_string(),
        "Z".to_string(),
    ])
    .unwrap();
    let delegate = BinaryTraitDelegate::new(
        vec!["A".into(), "B".into(), "C".into(), "D".into()],
        array![[1i8], [0], [1], [0]].view(),
        1.0,
        1.0,
        PruningConfig::default(),
    )
    .unwrap();

    let err = TreeDataLikelihood::new(tree, delegate, LikelihoodConfig::default())
        .err()
        .unwrap();
    assert_eq!(err, LikelihoodError::MissingTaxon { taxon: "Z".into() });
}

proptest! {
    #[test]
    fn incremental_equals_fresh_after_any_branch_edits(
        edits in prop::collection::vec((0usize..8, 0.01f64..3.0), 1..12),
    ) {
        let tree = Tree::from_newick(NEWICK, &taxa()).unwrap();
        let mut lik = engine(tree, 0.6, 1.4);
        lik.log_likelihood().unwrap();
        lik.checkpoint().unwrap();

        for &(node, length) in &edits {
            lik.set_branch_length(node, length).unwrap();
        }
        let value = lik.log_likelihood().unwrap();
        prop_assert!((value - fresh_value(lik.tree(), 0.6, 1.4)).abs() < 1e-10);
    }

    #[test]
    fn rollback_restores_every_proposal(
        edits in prop::collection::vec((0usize..8, 0.01f64..3.0), 1..12),
        evaluate_between in any::<bool>(),
    ) {
        let tree = Tree::from_newick(NEWICK, &taxa()).unwrap();
        let mut lik = engine(tree, 1.0, 2.0);
        let committed = lik.log_likelihood().unwrap();
        lik.checkpoint().unwrap();

        for &(node, length) in &edits {
            lik.set_branch_length(node, length).unwrap();
            if evaluate_between {
                lik.log_likelihood().unwrap();
            }
        }
        lik.log_likelihood().unwrap();
        lik.rollback().unwrap();
        prop_assert_eq!(lik.log_likelihood().unwrap().to_bits(), committed.to_bits());

        // the restored buffers still feed later incremental updates correctly
        lik.set_branch_length(4, 0.25).unwrap();
        let value = lik.log_likelihood().unwrap();
        prop_assert!((value - fresh_value(lik.tree(), 1.0, 2.0)).abs() < 1e-10);
    }
}
