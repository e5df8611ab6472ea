use anyhow::Result;
use log::{debug, warn};

use crate::weights::SolverStrategy;
use crate::weights::golden_section::{project_segment, projected_segment_search};
use crate::weights::nnls::{
    LeastSquaresProblem, NnlsSolver, SolveContext, SolveReport, Workspace, check_cancel,
    lipschitz_estimate, project_gradient, zero_negative_entries,
};
use crate::weights::circular_ops::dot;

/// Fixed-step projected gradient, optionally with Nesterov momentum.
///
/// The step is `1/L` with `L` from [`lipschitz_estimate`]. A step that fails
/// to lower the objective falls back to a golden-section search along the
/// projected segment (when enabled) and then doubles `L`. The accelerated
/// variant restarts its momentum whenever the objective goes up.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProjectedGradient {
    pub accelerated: bool,
}

impl ProjectedGradient {
    pub fn plain() -> Self {
        Self { accelerated: false }
    }

    pub fn accelerated() -> Self {
        Self { accelerated: true }
    }
}

/// Objective-increase slack that still counts as "no increase".
#[inline]
fn no_worse(candidate: f64, current: f64) -> bool {
    candidate <= current + 1e-15 * current.abs()
}

struct PgState {
    ws: Workspace,
    /// Extrapolated point; equals `x` without momentum.
    v: Vec<f64>,
    /// Start of the current gradient step.
    from: Vec<f64>,
    /// Gradient step target before projection.
    target: Vec<f64>,
    y: Vec<f64>,
    lipschitz: f64,
    theta: f64,
}

impl PgState {
    /// `y = max(from − g/L, 0)` with `g` the gradient at `from`.
    fn step(&mut self, problem: &LeastSquaresProblem) -> f64 {
        problem.gradient(&self.from, &mut self.ws.g, &mut self.ws.r);
        let inv_l = 1.0 / self.lipschitz;
        for ((t, &f), &g) in self.target.iter_mut().zip(&self.from).zip(&self.ws.g) {
            *t = f - inv_l * g;
        }
        project_segment(&self.from, &self.target, 1.0, &mut self.y);
        problem.objective(&self.y, &mut self.ws.r)
    }
}

impl NnlsSolver for ProjectedGradient {
    fn strategy(&self) -> SolverStrategy {
        if self.accelerated {
            SolverStrategy::AcceleratedProjectedGradient
        } else {
            SolverStrategy::ProjectedGradient
        }
    }

    fn minimize(
        &self,
        problem: &LeastSquaresProblem,
        x: &mut [f64],
        ctx: &SolveContext,
    ) -> Result<SolveReport> {
        let params = ctx.params;
        let mut report = SolveReport::new(self.strategy());
        let kkt_bound = problem.kkt_bound(params.tolerance);
        let len = x.len();
        zero_negative_entries(x, problem.is_parallel());

        let mut ws = Workspace::new(len);
        let lipschitz = lipschitz_estimate(problem, &mut ws);
        debug!("Lipschitz estimate {:.6e}", lipschitz);
        let mut st = PgState {
            ws,
            v: x.to_vec(),
            from: vec![0.0; len],
            target: vec![0.0; len],
            y: vec![0.0; len],
            lipschitz,
            theta: 1.0,
        };

        let mut f = problem.objective(x, &mut st.ws.r);
        report.accept(f);

        while report.outer_iterations < params.max_outer_iterations {
            check_cancel(ctx.progress)?;

            // Optimality at the current accepted iterate.
            problem.gradient(x, &mut st.ws.g, &mut st.ws.r);
            project_gradient(x, &mut st.ws.g);
            let pg = dot(&st.ws.g, &st.ws.g);
            report.projected_gradient = pg;
            if pg < kkt_bound {
                report.converged = true;
                break;
            }
            report.outer_iterations += 1;

            st.from
                .copy_from_slice(if self.accelerated { &st.v[..] } else { &x[..] });
            let mut f_y = st.step(problem);

            if self.accelerated && !no_worse(f_y, f) {
                // Momentum overshot: restart from the accepted iterate.
                st.theta = 1.0;
                st.v.copy_from_slice(x);
                st.from.copy_from_slice(x);
                f_y = st.step(problem);
            }

            if !no_worse(f_y, f) && params.golden_section {
                let PgState { ws, target, y, .. } = &mut st;
                f_y = projected_segment_search(problem, x, target, y, ws);
            }

            if !no_worse(f_y, f) {
                st.lipschitz *= 2.0;
                debug!(
                    "step rejected ({:.6e} > {:.6e}); L raised to {:.3e}",
                    f_y, f, st.lipschitz
                );
                if self.accelerated {
                    st.theta = 1.0;
                    st.v.copy_from_slice(x);
                }
                continue;
            }

            if self.accelerated {
                let theta_next = 0.5 * (1.0 + (1.0 + 4.0 * st.theta * st.theta).sqrt());
                let momentum = (st.theta - 1.0) / theta_next;
                for ((vi, &yi), &xi) in st.v.iter_mut().zip(&st.y).zip(x.iter()) {
                    *vi = yi + momentum * (yi - xi);
                }
                st.theta = theta_next;
            }
            x.copy_from_slice(&st.y);
            f = f_y;
            report.accept(f);
        }

        if !report.converged {
            problem.gradient(x, &mut st.ws.g, &mut st.ws.r);
            project_gradient(x, &mut st.ws.g);
            report.projected_gradient = dot(&st.ws.g, &st.ws.g);
            report.converged = report.projected_gradient < kkt_bound;
        }
        if !report.converged {
            warn!(
                "{} solver stopped after {} iterations without meeting the KKT tolerance \
                 (projected gradient² {:.3e} > {:.3e})",
                self.strategy().as_str(),
                report.outer_iterations,
                report.projected_gradient,
                kkt_bound
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::NNLSParams;
    use crate::weights::active_set::ActiveSet;
    use crate::weights::circular_ops::{CircularSplitOperator, calc_ax, npairs};

    fn noisy_problem(n: usize) -> Vec<f64> {
        let mut truth = vec![0.0; npairs(n)];
        for (k, v) in truth.iter_mut().enumerate() {
            if k % 4 == 0 {
                *v = 0.5 + (k % 3) as f64;
            }
        }
        let mut d = vec![0.0; npairs(n)];
        calc_ax(&truth, &mut d, n);
        for (k, v) in d.iter_mut().enumerate() {
            *v = (*v + 0.4 * (((k * 17) % 9) as f64 - 4.0)).max(0.0);
        }
        d
    }

    fn params() -> NNLSParams {
        NNLSParams {
            max_outer_iterations: 200_000,
            tolerance: 1e-4,
            ..NNLSParams::default()
        }
    }

    fn check(solver: ProjectedGradient) {
        let n = 7;
        let d = noisy_problem(n);
        let op = CircularSplitOperator::new(n);
        let problem = LeastSquaresProblem::new(&op, &d, 0.0);
        let params = params();
        let ctx = SolveContext::new(&params, None);

        let mut x_ref = vec![0.0; d.len()];
        let reference = ActiveSet::default().minimize(&problem, &mut x_ref, &ctx).unwrap();

        let mut x = vec![0.0; d.len()];
        let report = solver.minimize(&problem, &mut x, &ctx).unwrap();
        assert!(report.converged, "{:?}", report.strategy);
        assert!(x.iter().all(|&v| v >= 0.0));
        for w in report.objective_trace.windows(2) {
            assert!(w[1] <= w[0] + 1e-12 * w[0].abs().max(1.0), "{:?}", w);
        }
        let scale = reference.objective.abs().max(1.0);
        assert!(
            (report.objective - reference.objective).abs() < 1e-3 * scale,
            "{} vs {}",
            report.objective,
            reference.objective
        );
    }

    #[test]
    fn plain_converges_to_active_set_optimum() {
        check(ProjectedGradient::plain());
    }

    #[test]
    fn accelerated_converges_to_active_set_optimum() {
        check(ProjectedGradient::accelerated());
    }

    #[test]
    fn iteration_cap_returns_best_iterate() {
        let n = 12;
        let d = noisy_problem(n);
        let op = CircularSplitOperator::new(n);
        let problem = LeastSquaresProblem::new(&op, &d, 0.0);
        let params = NNLSParams {
            max_outer_iterations: 3,
            ..NNLSParams::default()
        };
        let mut x = vec![0.0; d.len()];
        let report = ProjectedGradient::plain()
            .minimize(&problem, &mut x, &SolveContext::new(&params, None))
            .unwrap();
        assert!(report.outer_iterations <= 3);
        assert!(!report.converged);
        assert_eq!(report.objective, *report.objective_trace.last().unwrap());
    }
}
