pub mod active_set;
pub mod block_pivot;
pub mod circular_ops;
pub mod golden_section;
pub mod incremental;
pub mod nnls;
pub mod projected_gradient;

use anyhow::{Context, Result, ensure};
use clap::{ArgAction, Args, ValueEnum};
use log::{debug, info};
use serde::Serialize;

use crate::data::distance_matrix::DistanceMatrix;
use crate::ordering::is_valid_cycle;
use crate::splits::asplit::ASplit;
use crate::splits::extractor::extract_splits;
use crate::weights::active_set::ActiveSet;
use crate::weights::block_pivot::BlockPivot;
use crate::weights::circular_ops::{CircularSplitOperator, npairs, packed_cycle_distances};
use crate::weights::incremental::incremental_fit;
use crate::weights::nnls::{
    LeastSquaresProblem, NnlsSolver, Progress, SolveContext, SolveReport, StartingPoint,
    Workspace, check_cancel, projected_gradient_sq, zero_negative_entries,
};
use crate::weights::projected_gradient::ProjectedGradient;

#[derive(ValueEnum, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SolverStrategy {
    #[default]
    #[clap(alias = "activeset")]
    ActiveSet,
    #[clap(alias = "blockpivot")]
    BlockPivot,
    #[clap(alias = "pg")]
    ProjectedGradient,
    #[clap(alias = "apg")]
    AcceleratedProjectedGradient,
}

impl SolverStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverStrategy::ActiveSet => "active-set",
            SolverStrategy::BlockPivot => "block-pivot",
            SolverStrategy::ProjectedGradient => "projected-gradient",
            SolverStrategy::AcceleratedProjectedGradient => "accelerated-projected-gradient",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active-set" | "active_set" | "activeset" | "ActiveSet" => SolverStrategy::ActiveSet,
            "block-pivot" | "block_pivot" | "blockpivot" | "BlockPivot" => {
                SolverStrategy::BlockPivot
            }
            "projected-gradient" | "projected_gradient" | "pg" => {
                SolverStrategy::ProjectedGradient
            }
            "accelerated-projected-gradient" | "accelerated_projected_gradient" | "apg" => {
                SolverStrategy::AcceleratedProjectedGradient
            }
            _ => SolverStrategy::default(),
        }
    }

    pub fn all() -> [SolverStrategy; 4] {
        [
            SolverStrategy::ActiveSet,
            SolverStrategy::BlockPivot,
            SolverStrategy::ProjectedGradient,
            SolverStrategy::AcceleratedProjectedGradient,
        ]
    }

    /// Solver instance configured from `params`.
    pub fn solver(&self, params: &NNLSParams) -> Box<dyn NnlsSolver> {
        match self {
            SolverStrategy::ActiveSet => Box::new(ActiveSet {
                rho: params.active_set_rho,
            }),
            SolverStrategy::BlockPivot => Box::new(BlockPivot {
                rho: params.active_set_rho,
                ..BlockPivot::default()
            }),
            SolverStrategy::ProjectedGradient => Box::new(ProjectedGradient::plain()),
            SolverStrategy::AcceleratedProjectedGradient => {
                Box::new(ProjectedGradient::accelerated())
            }
        }
    }
}

#[derive(Args, Serialize, Clone, Debug)]
pub struct NNLSParams {
    /// Relative KKT tolerance: stop once ‖projected gradient‖ < tolerance · ‖Aᵀd‖.
    #[arg(long, default_value = "1e-4")]
    pub tolerance: f64,
    /// Include only split weights > cutoff (trivial splits always included).
    #[arg(long, default_value = "1e-4")]
    pub cutoff: f64,
    /// Constrained least squares strategy.
    #[arg(long, value_enum, default_value = "active-set")]
    pub strategy: SolverStrategy,
    /// Hard iteration cap (outer loops).
    #[arg(long, default_value_t = 10_000)]
    pub max_outer_iterations: usize,
    /// CGNR iteration cap per face solve.
    #[arg(long, default_value_t = 5000)]
    pub max_inner_iterations: usize,
    /// Relative CGNR residual tolerance.
    #[arg(long, default_value = "1e-6")]
    pub cgnr_tolerance: f64,
    /// Fraction of offending (negative) coords to push into the active set per correction.
    #[arg(long, default_value = "0.4")]
    pub active_set_rho: f64,
    /// Ridge penalty λ added as ½λ‖x‖².
    #[arg(long)]
    pub regularization: Option<f64>,
    /// Seed the solver with the incremental insertion fit.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub warm_start: bool,
    /// Golden-section search along projected segments when a step fails.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub golden_section: bool,
    /// Smallest number of taxa for the rayon operators.
    #[arg(long, default_value_t = 128)]
    pub parallel_threshold: usize,
}

impl Default for NNLSParams {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            cutoff: 1e-4,
            strategy: SolverStrategy::ActiveSet,
            max_outer_iterations: 10_000,
            max_inner_iterations: 5000,
            cgnr_tolerance: 1e-6,
            active_set_rho: 0.4,
            regularization: None,
            warm_start: true,
            golden_section: true,
            parallel_threshold: 128,
        }
    }
}

impl NNLSParams {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.tolerance.is_finite() && self.tolerance > 0.0,
            "tolerance must be a positive number, got {}",
            self.tolerance
        );
        ensure!(
            self.cutoff.is_finite() && self.cutoff >= 0.0,
            "cutoff must be non-negative, got {}",
            self.cutoff
        );
        ensure!(
            self.cgnr_tolerance.is_finite() && self.cgnr_tolerance > 0.0,
            "cgnr tolerance must be a positive number, got {}",
            self.cgnr_tolerance
        );
        ensure!(
            (0.0..=1.0).contains(&self.active_set_rho),
            "active set rho must lie in [0, 1], got {}",
            self.active_set_rho
        );
        ensure!(self.max_inner_iterations > 0, "max inner iterations must be positive");
        if let Some(lambda) = self.regularization {
            ensure!(
                lambda.is_finite() && lambda >= 0.0,
                "regularization must be non-negative, got {}",
                lambda
            );
        }
        Ok(())
    }

    pub fn ridge(&self) -> f64 {
        self.regularization.unwrap_or(0.0)
    }
}

fn finished_report(
    strategy: SolverStrategy,
    problem: &LeastSquaresProblem,
    x: &[f64],
    tolerance: f64,
    starting_point: StartingPoint,
) -> SolveReport {
    let mut ws = Workspace::new(x.len());
    let mut report = SolveReport::new(strategy);
    report.accept(problem.objective(x, &mut ws.r));
    report.projected_gradient = projected_gradient_sq(problem, x, &mut ws);
    report.converged = report.projected_gradient <= problem.kkt_bound(tolerance);
    report.inverse_feasible = true;
    report.starting_point = starting_point;
    report
}

/// Non-negative split weights for `cycle` (packed, see [`circular_ops::pair_idx`]).
///
/// The closed-form inverse is returned as is when it is already feasible and
/// no ridge is requested. Otherwise the better of the incremental fit and
/// the zeroed inverse seeds the configured strategy.
pub fn solve(
    cycle: &[usize],
    distances: &DistanceMatrix,
    params: &NNLSParams,
    progress: Option<&dyn Progress>,
) -> Result<(Vec<f64>, SolveReport)> {
    params.validate()?;
    let n = distances.n();
    ensure!(
        is_valid_cycle(cycle, n),
        "cycle must be [0] followed by a permutation of 1..={}, got {:?}",
        n,
        cycle
    );
    check_cancel(progress)?;

    let d = packed_cycle_distances(cycle, |a, b| distances.taxa(a, b));
    let op = CircularSplitOperator::new(n).with_parallel(n >= params.parallel_threshold);
    let problem = LeastSquaresProblem::new(&op, &d, params.ridge());

    let mut x = vec![0.0; npairs(n)];
    if n < 3 {
        if n == 2 {
            x[0] = d[0];
        }
        let report = finished_report(
            params.strategy,
            &problem,
            &x,
            params.tolerance,
            StartingPoint::ClosedForm,
        );
        return Ok((x, report));
    }

    op.inverse(&d, &mut x);
    let min_inverse = x.iter().copied().fold(f64::INFINITY, f64::min);
    let inverse_feasible = min_inverse >= -params.tolerance;
    if inverse_feasible && params.ridge() == 0.0 {
        zero_negative_entries(&mut x, problem.is_parallel());
        debug!("Closed-form inverse is feasible (min {:.3e})", min_inverse);
        let report = finished_report(
            params.strategy,
            &problem,
            &x,
            params.tolerance,
            StartingPoint::ClosedForm,
        );
        info!(
            "Split weights from the closed-form inverse, objective {:.6e}",
            report.objective
        );
        return Ok((x, report));
    }

    zero_negative_entries(&mut x, problem.is_parallel());
    let mut r = vec![0.0; d.len()];
    let mut starting_point = StartingPoint::ClampedInverse;
    if params.warm_start {
        let f_inverse = problem.objective(&x, &mut r);
        let warm = incremental_fit(cycle, distances);
        let f_warm = problem.objective(&warm, &mut r);
        debug!(
            "Starting objective: clamped inverse {:.6e}, incremental fit {:.6e}",
            f_inverse, f_warm
        );
        if f_warm < f_inverse {
            x = warm;
            starting_point = StartingPoint::Incremental;
        }
    }

    let solver = params.strategy.solver(params);
    let ctx = SolveContext::new(params, progress);
    let mut report = solver
        .minimize(&problem, &mut x, &ctx)
        .with_context(|| format!("Running the {} solver", params.strategy.as_str()))?;
    report.inverse_feasible = inverse_feasible;
    report.starting_point = starting_point;
    info!(
        "{} solver finished after {} outer / {} inner iterations, objective {:.6e}",
        params.strategy.as_str(),
        report.outer_iterations,
        report.inner_iterations,
        report.objective
    );
    Ok((x, report))
}

/// Solve and keep the splits above `params.cutoff` (trivial splits always).
pub fn compute_asplits(
    cycle: &[usize],
    distances: &DistanceMatrix,
    params: &NNLSParams,
    progress: Option<&dyn Progress>,
) -> Result<(Vec<ASplit>, SolveReport)> {
    let (x, report) = solve(cycle, distances, params, progress)?;
    let splits = extract_splits(cycle, &x, params.cutoff);
    Ok((splits, report))
}
