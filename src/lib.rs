use std::{env, time::Instant};

use anyhow::{Context, Result, ensure};
use env_logger::Builder;
use log::{LevelFilter, debug, info};
use ndarray::Array2;
use serde::Serialize;

use crate::{
    cli::{NetworkArgs, ProgramArgs},
    data::distance_matrix::DistanceMatrix,
    ordering::{OrderingMethod, compute_order},
    splits::{asplit::ASplit, extractor::extract_splits},
    utils::compute_least_squares_fit,
    weights::{
        NNLSParams,
        nnls::{Progress, SolveReport, check_cancel},
        solve,
    },
};

pub mod cli;
pub mod data;
pub mod network;
pub mod ordering;
pub mod splits;
pub mod utils;
pub mod weights;

pub use weights::nnls::{CancelFlag, Cancelled, is_cancelled};

pub fn set_log_level(matches: &ProgramArgs, is_last: bool, program_name: &str, version: &str) {
    let mut log_level = LevelFilter::Info;
    let mut specified = false;
    if matches.verbose {
        specified = true;
        log_level = LevelFilter::Debug;
    }
    if matches.quiet {
        specified = true;
        log_level = LevelFilter::Error;
    }
    if specified || is_last {
        let mut builder = Builder::new();
        builder.filter_level(log_level);
        if let Ok(filters) = env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        if let Err(e) = builder.try_init() {
            eprintln!("Failed to set log level - has it been specified multiple times? ({e})");
        }
    }
    if is_last {
        info!("{} version {}", program_name, version);
    }
}

/// Everything produced for one distance matrix.
#[derive(Serialize, Clone, Debug)]
pub struct CircularSplitNetwork {
    /// `[0, t1, ..., tn]`
    pub cycle: Vec<usize>,
    /// Packed weights before the cutoff is applied.
    #[serde(skip)]
    pub weights: Vec<f64>,
    #[serde(skip)]
    pub splits: Vec<ASplit>,
    pub report: SolveReport,
    /// Least-squares fit in percent.
    pub fit: f64,
    pub timings: StageTimings,
}

/// Wall-clock seconds spent in each stage of [`compute_circular_network`].
#[derive(Serialize, Clone, Copy, Debug, Default)]
pub struct StageTimings {
    pub cycle_sec: f64,
    pub nnls_sec: f64,
    pub splits_sec: f64,
    pub fit_sec: f64,
}

impl CircularSplitNetwork {
    pub fn nsplits(&self) -> usize {
        self.splits.len()
    }

    pub fn ntax(&self) -> usize {
        self.cycle.len().saturating_sub(1)
    }
}

/// Ordering, constrained split weights and split extraction for `distances`.
pub fn compute_circular_network(
    distances: &DistanceMatrix,
    ordering: OrderingMethod,
    params: &NNLSParams,
    progress: Option<&dyn Progress>,
) -> Result<CircularSplitNetwork> {
    params.validate()?;
    let n = distances.n();
    ensure!(n >= 1, "distance matrix has no taxa");

    let mut timings = StageTimings::default();

    let t_cycle = Instant::now();
    let cycle = compute_order(ordering, distances)
        .with_context(|| format!("computing {} ordering", ordering.as_str()))?;
    timings.cycle_sec = t_cycle.elapsed().as_secs_f64();
    info!(
        "Computed {} ordering of {} taxa in {:.3}s",
        ordering.as_str(),
        n,
        timings.cycle_sec
    );
    debug!("Cycle (1-based): {:?}", &cycle[1..]);
    check_cancel(progress)?;

    let t_nnls = Instant::now();
    let (weights, report) =
        solve(&cycle, distances, params, progress).context("estimating split weights")?;
    timings.nnls_sec = t_nnls.elapsed().as_secs_f64();

    let t_splits = Instant::now();
    let splits = extract_splits(&cycle, &weights, params.cutoff);
    timings.splits_sec = t_splits.elapsed().as_secs_f64();
    info!(
        "Estimated {} splits (cutoff = {}) in {:.3}s",
        splits.len(),
        params.cutoff,
        timings.nnls_sec + timings.splits_sec
    );

    let t_fit = Instant::now();
    let fit = compute_least_squares_fit(distances, &splits);
    timings.fit_sec = t_fit.elapsed().as_secs_f64();
    info!("Least-squares fit: {:.4} % (computed in {:.3}s)", fit, timings.fit_sec);

    Ok(CircularSplitNetwork {
        cycle,
        weights,
        splits,
        report,
        fit,
        timings,
    })
}

/// In-memory entry point: a raw matrix and its labels instead of a file.
///
/// - `dist`: square distance matrix (n x n)
/// - `labels`: length n
/// - `args`: ordering and solver parameters; `input` and `output_prefix` are ignored
pub fn run_circsplits_from_memory(
    dist: Array2<f64>,
    labels: Vec<String>,
    args: NetworkArgs,
) -> Result<CircularSplitNetwork> {
    let t0 = Instant::now();
    ensure!(
        labels.len() == dist.nrows(),
        "label count ({}) does not match the number of taxa ({})",
        labels.len(),
        dist.nrows()
    );
    let distances = DistanceMatrix::new(dist).context("validating distance matrix")?;
    let network = compute_circular_network(&distances, args.ordering, &args.nnls_params, None)
        .context("computing circular split network")?;
    info!("Finished circular split network in {:?}", t0.elapsed());
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn from_memory_checks_labels() {
        let d = arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        let err = run_circsplits_from_memory(d, vec!["a".into()], NetworkArgs::default());
        assert!(err.is_err());
    }

    #[test]
    fn from_memory_two_taxa() {
        let d = arr2(&[[0.0, 2.5], [2.5, 0.0]]);
        let net =
            run_circsplits_from_memory(d, vec!["a".into(), "b".into()], NetworkArgs::default())
                .unwrap();
        assert_eq!(net.cycle, vec![0, 1, 2]);
        assert_eq!(net.nsplits(), 1);
        assert_eq!(net.splits[0].weight(), 2.5);
        assert!((net.fit - 100.0).abs() < 1e-9);
    }

    #[test]
    fn from_memory_rejects_negative_distance() {
        let d = arr2(&[[0.0, -1.0], [-1.0, 0.0]]);
        let labels = vec!["a".into(), "b".into()];
        let err = run_circsplits_from_memory(d, labels, NetworkArgs::default());
        assert!(err.is_err());
    }
}
