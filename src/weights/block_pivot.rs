use anyhow::Result;
use log::{debug, warn};

use crate::weights::SolverStrategy;
use crate::weights::active_set::{FaceResult, FaceSolver};
use crate::weights::nnls::{
    LeastSquaresProblem, NnlsSolver, SolveContext, SolveReport, projected_gradient_sq,
    zero_negative_entries,
};

/// Active-set variant that releases a whole block of KKT violators per round.
///
/// The block starts as every violator. When the violator count fails to
/// improve for `max_stall` rounds the block is halved, down to a single
/// coordinate, which rules out cycling between faces.
#[derive(Clone, Copy, Debug)]
pub struct BlockPivot {
    pub rho: f64,
    pub max_stall: usize,
}

impl Default for BlockPivot {
    fn default() -> Self {
        Self {
            rho: 0.4,
            max_stall: 3,
        }
    }
}

/// Bookkeeping for the release block size.
#[derive(Debug)]
struct PivotBudget {
    best_count: usize,
    stall: usize,
    batch: usize,
    max_stall: usize,
}

impl PivotBudget {
    fn new(max_stall: usize) -> Self {
        Self {
            best_count: usize::MAX,
            stall: 0,
            batch: usize::MAX,
            max_stall: max_stall.max(1),
        }
    }

    /// Number of violators to release this round.
    fn next_batch(&mut self, violators: usize) -> usize {
        if violators < self.best_count {
            self.best_count = violators;
            self.stall = 0;
        } else {
            self.stall += 1;
            if self.stall >= self.max_stall {
                self.batch = (self.batch.min(violators) / 2).max(1);
                self.stall = 0;
            }
        }
        self.batch.min(violators).max(1)
    }
}

impl NnlsSolver for BlockPivot {
    fn strategy(&self) -> SolverStrategy {
        SolverStrategy::BlockPivot
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
        let mut budget = PivotBudget::new(self.max_stall);
        let mut violators: Vec<(f64, usize)> = Vec::new();

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

            violators.clear();
            violators.extend(
                face.active
                    .iter()
                    .zip(&face.ws.g)
                    .enumerate()
                    .filter(|&(_, (&a, &g))| a && g < 0.0)
                    .map(|(i, (_, &g))| (g, i)),
            );
            if violators.is_empty() {
                continue;
            }
            violators.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let batch = budget.next_batch(violators.len());
            debug!(
                "releasing {} of {} violating coordinates",
                batch,
                violators.len()
            );
            for &(_, i) in &violators[..batch] {
                face.active[i] = false;
            }
        }

        if !report.converged {
            report.projected_gradient = projected_gradient_sq(problem, x, &mut face.ws);
            report.converged = report.projected_gradient < kkt_bound;
        }
        if !report.converged {
            warn!(
                "Block-pivot solver stopped after {} outer iterations without meeting the KKT \
                 tolerance (projected gradient² {:.3e} > {:.3e})",
                report.outer_iterations, report.projected_gradient, kkt_bound
            );
        }
        Ok(report)
    }
}
