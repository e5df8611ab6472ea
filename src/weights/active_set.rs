use anyhow::Result;
use log::{debug, warn};

use crate::weights::SolverStrategy;
use crate::weights::golden_section::projected_segment_search;
use crate::weights::nnls::{
    LeastSquaresProblem, NnlsSolver, SolveContext, SolveReport, Workspace, cgnr, check_cancel,
    feasible_move, get_active_entries, projected_gradient_sq, zero_negative_entries,
};

/// Classic active-set method: CGNR on the free face, ratio-test moves back
/// into the orthant, release the worst KKT violator once feasible.
#[derive(Clone, Copy, Debug)]
pub struct ActiveSet {
    /// Fraction of offending coordinates frozen per ratio test.
    pub rho: f64,
}

impl Default for ActiveSet {
    fn default() -> Self {
        Self { rho: 0.4 }
    }
}

/// Outcome of descending on the current face.
pub(crate) enum FaceResult {
    /// CGNR converged and its solution is feasible.
    Optimal,
    /// Outer iteration cap hit before reaching a feasible face optimum.
    CapReached,
}

/// State carried across face solves.
pub(crate) struct FaceSolver {
    pub active: Vec<bool>,
    pub ws: Workspace,
    xstar: Vec<f64>,
    x_prev: Vec<f64>,
    active_prev: Vec<bool>,
    candidate: Vec<f64>,
    offenders: Vec<(f64, usize)>,
    rho: f64,
}

impl FaceSolver {
    pub fn new(x: &[f64], rho: f64) -> Self {
        let len = x.len();
        let mut active = vec![false; len];
        get_active_entries(x, &mut active);
        Self {
            active,
            ws: Workspace::new(len),
            xstar: vec![0.0; len],
            x_prev: vec![0.0; len],
            active_prev: vec![false; len],
            candidate: vec![0.0; len],
            offenders: Vec::with_capacity(len),
            rho,
        }
    }

    /// Repeat CGNR + feasible move until the face optimum is feasible.
    ///
    /// Each CGNR solve counts as one outer iteration and appends one accepted
    /// objective value to `report`.
    pub fn descend(
        &mut self,
        problem: &LeastSquaresProblem,
        x: &mut [f64],
        f: &mut f64,
        ctx: &SolveContext,
        report: &mut SolveReport,
    ) -> Result<FaceResult> {
        let params = ctx.params;
        loop {
            if report.outer_iterations >= params.max_outer_iterations {
                return Ok(FaceResult::CapReached);
            }
            check_cancel(ctx.progress)?;

            self.x_prev.copy_from_slice(x);
            self.active_prev.copy_from_slice(&self.active);
            self.xstar.copy_from_slice(x);
            let iters = cgnr(
                problem,
                &mut self.xstar,
                &self.active,
                params.max_inner_iterations,
                params.cgnr_tolerance,
                &mut self.ws,
                ctx.progress,
            )?;
            report.outer_iterations += 1;
            report.inner_iterations += iters;

            let feasible = feasible_move(
                x,
                &self.xstar,
                &mut self.active,
                &mut self.offenders,
                self.rho,
            );
            let mut f_new = problem.objective(x, &mut self.ws.r);

            if !feasible {
                if f_new > *f {
                    // Freezing several offenders overshot; redo with only the first.
                    x.copy_from_slice(&self.x_prev);
                    self.active.copy_from_slice(&self.active_prev);
                    feasible_move(x, &self.xstar, &mut self.active, &mut self.offenders, 0.0);
                    f_new = problem.objective(x, &mut self.ws.r);
                }
                if params.golden_section {
                    let f_line = projected_segment_search(
                        problem,
                        &self.x_prev,
                        &self.xstar,
                        &mut self.candidate,
                        &mut self.ws,
                    );
                    if f_line < f_new {
                        x.copy_from_slice(&self.candidate);
                        for i in 0..x.len() {
                            self.active[i] =
                                x[i] <= 0.0 && (self.active_prev[i] || self.xstar[i] < 0.0);
                        }
                        f_new = f_line;
                    }
                }
            }

            *f = f_new;
            report.accept(*f);
            debug!(
                "outer {}: objective {:.6e}, cgnr steps {}, active {}",
                report.outer_iterations,
                *f,
                iters,
                self.active.iter().filter(|&&a| a).count()
            );

            if feasible && iters < params.max_inner_iterations {
                return Ok(FaceResult::Optimal);
            }
        }
    }
}

impl NnlsSolver for ActiveSet {
    fn strategy(&self) -> SolverStrategy {
        SolverStrategy::ActiveSet
    }

    fn minimize(
        &self,
        problem: &LeastSquaresProblem,
        x: &mut [f64],
        ctx: &SolveContext,
    ) -> Result<SolveReport> {
        let mut report = SolveReport::new(self.strategy());
        let kkt_bound = problem.kkt_bound(ctx.params.tolerance);
        zero_negative_entries(x, problem.is_parallel());

        let mut face = FaceSolver::new(x, self.rho);
        let mut f = problem.objective(x, &mut face.ws.r);
        report.accept(f);

        loop {
            if let FaceResult::CapReached = face.descend(problem, x, &mut f, ctx, &mut report)? {
                break;
            }

            let pg = projected_gradient_sq(problem, x, &mut face.ws);
            report.projected_gradient = pg;
            if pg < kkt_bound {
                report.converged = true;
                break;
            }

            // Release the most violated active constraint.
            let mut worst: Option<(usize, f64)> = None;
            for (i, (&a, &g)) in face.active.iter().zip(&face.ws.g).enumerate() {
                if a && g < worst.map_or(0.0, |w| w.1) {
                    worst = Some((i, g));
                }
            }
            if let Some((i, g)) = worst {
                debug!("releasing coordinate {} (gradient {:.3e})", i, g);
                face.active[i] = false;
            }
        }

        if !report.converged {
            report.projected_gradient = projected_gradient_sq(problem, x, &mut face.ws);
            report.converged = report.projected_gradient < kkt_bound;
        }
        if !report.converged {
            warn!(
                "Active-set solver stopped after {} outer iterations without meeting the KKT \
                 tolerance (projected gradient² {:.3e} > {:.3e})",
                report.outer_iterations, report.projected_gradient, kkt_bound
            );
        }
        Ok(report)
    }
}
