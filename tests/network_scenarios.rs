use ndarray::{Array2, arr2};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use circsplits::data::distance_matrix::DistanceMatrix;
use circsplits::ordering::{OrderingMethod, compute_order, is_valid_cycle};
use circsplits::weights::circular_ops::{
    CircularSplitOperator, calc_ax, npairs, packed_cycle_distances, pair_idx,
};
use circsplits::weights::nnls::{
    LeastSquaresProblem, NnlsSolver, Progress, SolveContext, StartingPoint,
};
use circsplits::weights::projected_gradient::ProjectedGradient;
use circsplits::weights::{NNLSParams, SolverStrategy, solve};
use circsplits::{CancelFlag, compute_circular_network, is_cancelled};

fn random_matrix(n: usize, seed: u64) -> DistanceMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut m = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let v = rng.gen_range(1.0..10.0);
            m[[i, j]] = v;
            m[[j, i]] = v;
        }
    }
    DistanceMatrix::new(m).unwrap()
}

fn adjacent(cycle: &[usize], a: usize, b: usize) -> bool {
    let n = cycle.len() - 1;
    let pos = |t: usize| cycle.iter().position(|&c| c == t).unwrap();
    let (pa, pb) = (pos(a), pos(b));
    let gap = pa.abs_diff(pb);
    gap == 1 || gap == n - 1
}

#[test]
fn two_cherries_give_one_internal_split() {
    let d = DistanceMatrix::new(arr2(&[
        [0.0, 2.0, 4.0, 4.0],
        [2.0, 0.0, 4.0, 4.0],
        [4.0, 4.0, 0.0, 2.0],
        [4.0, 4.0, 2.0, 0.0],
    ]))
    .unwrap();
    for ordering in [OrderingMethod::Agglomerative, OrderingMethod::Components] {
        let net = compute_circular_network(&d, ordering, &NNLSParams::default(), None).unwrap();
        assert!(adjacent(&net.cycle, 1, 2), "{:?}", net.cycle);
        assert!(adjacent(&net.cycle, 3, 4), "{:?}", net.cycle);
        assert_eq!(net.nsplits(), 5);

        let internal: Vec<_> = net.splits.iter().filter(|s| !s.is_trivial()).collect();
        assert_eq!(internal.len(), 1);
        assert!(internal[0].separates(1, 3));
        assert!(!internal[0].separates(1, 2));
        assert!((internal[0].weight() - 2.0).abs() < 1e-9);
        for s in net.splits.iter().filter(|s| s.is_trivial()) {
            assert!((s.weight() - 1.0).abs() < 1e-9, "{}", s);
        }
        assert!((net.fit - 100.0).abs() < 1e-9);
    }
}

#[test]
fn equidistant_taxa_give_a_star() {
    let c = 3.0;
    let n = 5;
    let d = DistanceMatrix::new(Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j { 0.0 } else { c }
    }))
    .unwrap();
    let net =
        compute_circular_network(&d, OrderingMethod::Agglomerative, &NNLSParams::default(), None)
            .unwrap();
    assert_eq!(net.nsplits(), n);
    for s in &net.splits {
        assert!(s.is_trivial());
        assert!((s.weight() - c / 2.0).abs() < 1e-9);
    }
}

#[test]
fn same_input_same_output() {
    let d = random_matrix(15, 3);
    for ordering in [OrderingMethod::Agglomerative, OrderingMethod::Components] {
        let a = compute_circular_network(&d, ordering, &NNLSParams::default(), None).unwrap();
        let b = compute_circular_network(&d, ordering, &NNLSParams::default(), None).unwrap();
        assert_eq!(a.cycle, b.cycle);
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.report.objective_trace, b.report.objective_trace);
    }
}

#[test]
fn orderings_are_permutations() {
    for (n, seed) in [(4usize, 1u64), (7, 2), (20, 3), (41, 4)] {
        let d = random_matrix(n, seed);
        for method in [OrderingMethod::Agglomerative, OrderingMethod::Components] {
            let cycle = compute_order(method, &d).unwrap();
            assert!(is_valid_cycle(&cycle, n), "{:?} {:?}", method, cycle);
        }
    }
}

fn assert_non_increasing(trace: &[f64], what: &str) {
    assert!(!trace.is_empty(), "{what}: empty trace");
    for w in trace.windows(2) {
        assert!(w[1] <= w[0] + 1e-12 * w[0].abs().max(1.0), "{what}: {:?}", w);
    }
}

#[test]
fn objective_traces_never_increase() {
    let d = random_matrix(12, 9);
    for strategy in SolverStrategy::all() {
        let params = NNLSParams {
            strategy,
            max_outer_iterations: 200_000,
            ..NNLSParams::default()
        };
        let net =
            compute_circular_network(&d, OrderingMethod::Agglomerative, &params, None).unwrap();
        assert_non_increasing(&net.report.objective_trace, strategy.as_str());
        assert!(net.weights.iter().all(|&x| x >= 0.0));
        assert!(net.report.converged, "{}", strategy.as_str());
    }
}

#[test]
fn strategies_agree_on_the_optimum() {
    let d = random_matrix(10, 21);
    let cycle = compute_order(OrderingMethod::Agglomerative, &d).unwrap();
    let objectives: Vec<f64> = SolverStrategy::all()
        .into_iter()
        .map(|strategy| {
            let params = NNLSParams {
                strategy,
                max_outer_iterations: 200_000,
                ..NNLSParams::default()
            };
            solve(&cycle, &d, &params, None).unwrap().1.objective
        })
        .collect();
    let best = objectives.iter().copied().fold(f64::INFINITY, f64::min);
    for f in &objectives {
        assert!((f - best).abs() <= 1e-3 * best.max(1.0), "{:?}", objectives);
    }
}

#[test]
fn strategies_without_golden_section_reach_the_same_optimum() {
    let d = random_matrix(12, 9);
    let cycle = compute_order(OrderingMethod::Agglomerative, &d).unwrap();
    for strategy in SolverStrategy::all() {
        let golden = NNLSParams {
            strategy,
            max_outer_iterations: 200_000,
            ..NNLSParams::default()
        };
        let plain = NNLSParams {
            golden_section: false,
            ..golden.clone()
        };
        let (_, with) = solve(&cycle, &d, &golden, None).unwrap();
        let (x, without) = solve(&cycle, &d, &plain, None).unwrap();

        assert!(without.converged, "{}", strategy.as_str());
        assert!(x.iter().all(|&v| v >= 0.0));
        assert_non_increasing(&without.objective_trace, strategy.as_str());
        let scale = with.objective.abs().max(1.0);
        assert!(
            (with.objective - without.objective).abs() <= 1e-3 * scale,
            "{}: {} vs {}",
            strategy.as_str(),
            with.objective,
            without.objective
        );
    }
}

#[test]
fn unaccelerated_gradient_from_zero() {
    let d = random_matrix(7, 31);
    let cycle = compute_order(OrderingMethod::Components, &d).unwrap();
    let packed = packed_cycle_distances(&cycle, |a, b| d.taxa(a, b));
    let op = CircularSplitOperator::new(d.n());
    let problem = LeastSquaresProblem::new(&op, &packed, 0.0);

    let reference = solve(&cycle, &d, &NNLSParams::default(), None).unwrap().1;
    let solver = ProjectedGradient { accelerated: false };
    for golden_section in [true, false] {
        let params = NNLSParams {
            golden_section,
            max_outer_iterations: 200_000,
            ..NNLSParams::default()
        };
        let mut x = vec![0.0; packed.len()];
        let report = solver
            .minimize(&problem, &mut x, &SolveContext::new(&params, None))
            .unwrap();
        let what = format!("golden_section = {golden_section}");
        assert_eq!(report.strategy, SolverStrategy::ProjectedGradient);
        assert!(report.converged, "{what}");
        assert!(x.iter().all(|&v| v >= 0.0));
        assert_non_increasing(&report.objective_trace, &what);
        let scale = reference.objective.abs().max(1.0);
        assert!(
            (report.objective - reference.objective).abs() <= 1e-3 * scale,
            "{what}: {} vs {}",
            report.objective,
            reference.objective
        );
    }
}

#[test]
fn tiny_inputs() {
    let one = DistanceMatrix::new(Array2::zeros((1, 1))).unwrap();
    let params = NNLSParams::default();
    let net =
        compute_circular_network(&one, OrderingMethod::Agglomerative, &params, None).unwrap();
    assert_eq!(net.cycle, vec![0, 1]);
    assert_eq!(net.nsplits(), 0);

    let three = DistanceMatrix::new(arr2(&[[0.0, 3.0, 4.0], [3.0, 0.0, 5.0], [4.0, 5.0, 0.0]]))
        .unwrap();
    let net =
        compute_circular_network(&three, OrderingMethod::Components, &params, None).unwrap();
    assert_eq!(net.cycle, vec![0, 1, 2, 3]);
    let mut weights: Vec<(Vec<usize>, f64)> =
        net.splits.iter().map(|s| (s.taxa(), s.weight())).collect();
    weights.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        weights,
        vec![(vec![1], 1.0), (vec![1, 2], 3.0), (vec![2], 2.0)]
    );
}

#[test]
fn circular_distances_round_trip_without_iterations() {
    let n = 9;
    let mut rng = StdRng::seed_from_u64(77);
    let truth: Vec<f64> = (0..npairs(n))
        .map(|_| if rng.gen_bool(0.5) { rng.gen_range(0.5..3.0) } else { 0.0 })
        .collect();
    let mut packed = vec![0.0; truth.len()];
    calc_ax(&truth, &mut packed, n);

    // Place cycle position p on taxon perm[p].
    let perm = [0usize, 4, 9, 1, 7, 2, 8, 3, 6, 5];
    let mut m = Array2::<f64>::zeros((n, n));
    for i in 1..=n {
        for j in (i + 1)..=n {
            let v = packed[pair_idx(i, j, n)];
            m[[perm[i] - 1, perm[j] - 1]] = v;
            m[[perm[j] - 1, perm[i] - 1]] = v;
        }
    }
    let d = DistanceMatrix::new(m).unwrap();
    let (x, report) = solve(&perm, &d, &NNLSParams::default(), None).unwrap();
    assert_eq!(report.outer_iterations, 0);
    assert_eq!(report.starting_point, StartingPoint::ClosedForm);
    for (a, b) in x.iter().zip(&truth) {
        assert!((a - b).abs() < 1e-9, "{a} vs {b}");
    }
}

#[test]
fn cancellation_stops_the_pipeline() {
    let d = random_matrix(25, 5);
    let flag = CancelFlag::new();
    flag.cancel();
    let err = compute_circular_network(
        &d,
        OrderingMethod::Agglomerative,
        &NNLSParams::default(),
        Some(&flag as &dyn Progress),
    )
    .unwrap_err();
    assert!(is_cancelled(&err));
}

#[test]
fn ridge_shrinks_weights() {
    let d = random_matrix(10, 13);
    let cycle = compute_order(OrderingMethod::Agglomerative, &d).unwrap();
    let plain = solve(&cycle, &d, &NNLSParams::default(), None).unwrap().0;
    let ridge = NNLSParams {
        regularization: Some(5.0),
        max_outer_iterations: 200_000,
        ..NNLSParams::default()
    };
    let (shrunk, report) = solve(&cycle, &d, &ridge, None).unwrap();
    assert!(report.converged);
    assert!(shrunk.iter().all(|&v| v >= 0.0));
    let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>();
    assert!(norm(&shrunk) <= norm(&plain) + 1e-9);
}
