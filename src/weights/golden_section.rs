//! Golden-section search, plain and along projected segments.

use crate::weights::nnls::{LeastSquaresProblem, Workspace};

const INV_PHI: f64 = 0.618_033_988_749_894_9;
const SEARCH_TOL: f64 = 1e-6;
const MAX_STEPS: usize = 64;

/// Minimise `f` on `[lo, hi]` assuming it is unimodal there.
///
/// Both end points are evaluated too, so on a non-unimodal `f` the result is
/// never worse than either end. Returns `(t, f(t))`.
pub fn golden_section_search(
    mut f: impl FnMut(f64) -> f64,
    lo: f64,
    hi: f64,
    tol: f64,
    max_steps: usize,
) -> (f64, f64) {
    let (mut a, mut b) = (lo, hi);
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    let mut steps = 0;
    while (b - a).abs() > tol && steps < max_steps {
        if fc <= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = f(d);
        }
        steps += 1;
    }

    let mut best = if fc <= fd { (c, fc) } else { (d, fd) };
    for t in [lo, hi] {
        let ft = f(t);
        if ft < best.1 {
            best = (t, ft);
        }
    }
    best
}

/// `out = max(from + t (to − from), 0)`
pub(crate) fn project_segment(from: &[f64], to: &[f64], t: f64, out: &mut [f64]) {
    for ((o, &a), &b) in out.iter_mut().zip(from).zip(to) {
        *o = (a + t * (b - a)).max(0.0);
    }
}

/// Best feasible point on the projected segment from `from` to `to`.
///
/// Each trial point is clipped to the orthant before the objective is
/// evaluated. The winner is written to `out`; its objective is returned.
pub(crate) fn projected_segment_search(
    problem: &LeastSquaresProblem,
    from: &[f64],
    to: &[f64],
    out: &mut [f64],
    ws: &mut Workspace,
) -> f64 {
    let Workspace { r, trial, .. } = ws;
    let (t, _) = golden_section_search(
        |t| {
            project_segment(from, to, t, trial);
            problem.objective(trial, r)
        },
        0.0,
        1.0,
        SEARCH_TOL,
        MAX_STEPS,
    );
    project_segment(from, to, t, out);
    problem.objective(out, r)
}
