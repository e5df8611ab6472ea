//! Building blocks shared by the non-negative least squares strategies.
//!
//! Every strategy minimises
//!
//! ```text
//! f(x) = ½‖A x − d‖² + ½ λ ‖x‖²   subject to x ≥ 0
//! ```
//!
//! where `A` is only ever touched through [`SplitOperator`]. Optimality is
//! judged by the squared norm of the projected gradient against
//! `(tolerance · ‖Aᵀd‖)²`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;

use crate::weights::circular_ops::{SplitOperator, dot};
use crate::weights::{NNLSParams, SolverStrategy};

/// Cooperative cancellation hook polled between iterations.
pub trait Progress {
    fn check_for_cancel(&self) -> Result<()>;
}

/// Returned (inside `anyhow::Error`) when a [`Progress`] asks to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "split weight estimation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// True if `err` (or anything in its context chain) is [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Cancelled>())
}

/// Shareable cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Progress for CancelFlag {
    fn check_for_cancel(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Cancelled.into())
        } else {
            Ok(())
        }
    }
}

#[inline]
pub(crate) fn check_cancel(progress: Option<&dyn Progress>) -> Result<()> {
    match progress {
        Some(p) => p.check_for_cancel(),
        None => Ok(()),
    }
}

/// How the constrained iterations were seeded.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartingPoint {
    /// The closed-form inverse was feasible; no iterations ran.
    ClosedForm,
    /// Inverse with negative entries set to zero.
    ClampedInverse,
    /// Taxon-by-taxon insertion fit.
    Incremental,
    /// Caller supplied the starting vector.
    Given,
}

/// What happened during one solve.
#[derive(Serialize, Clone, Debug)]
pub struct SolveReport {
    pub strategy: SolverStrategy,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub converged: bool,
    pub objective: f64,
    /// Squared norm of the projected gradient at the returned point.
    pub projected_gradient: f64,
    /// Objective at every accepted iterate, starting point first.
    pub objective_trace: Vec<f64>,
    pub inverse_feasible: bool,
    pub starting_point: StartingPoint,
}

impl SolveReport {
    pub fn new(strategy: SolverStrategy) -> Self {
        Self {
            strategy,
            outer_iterations: 0,
            inner_iterations: 0,
            converged: false,
            objective: f64::NAN,
            projected_gradient: f64::NAN,
            objective_trace: Vec::new(),
            inverse_feasible: false,
            starting_point: StartingPoint::Given,
        }
    }

    /// Record an accepted iterate.
    pub(crate) fn accept(&mut self, objective: f64) {
        self.objective = objective;
        self.objective_trace.push(objective);
    }
}

/// A ridge-regularised least squares problem over one circular operator.
pub struct LeastSquaresProblem<'a> {
    op: &'a dyn SplitOperator,
    d: &'a [f64],
    ridge: f64,
    norm_atd: f64,
}

impl<'a> LeastSquaresProblem<'a> {
    pub fn new(op: &'a dyn SplitOperator, d: &'a [f64], ridge: f64) -> Self {
        debug_assert_eq!(d.len(), op.len());
        let mut atd = vec![0.0; d.len()];
        op.adjoint(d, &mut atd);
        let norm_atd = dot(&atd, &atd).sqrt();
        Self {
            op,
            d,
            ridge: ridge.max(0.0),
            norm_atd,
        }
    }

    pub fn operator(&self) -> &dyn SplitOperator {
        self.op
    }

    pub fn ntax(&self) -> usize {
        self.op.ntax()
    }

    pub fn len(&self) -> usize {
        self.d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.d.is_empty()
    }

    pub fn target(&self) -> &[f64] {
        self.d
    }

    pub fn ridge(&self) -> f64 {
        self.ridge
    }

    /// Whether vector updates should use rayon.
    pub fn is_parallel(&self) -> bool {
        self.op.is_parallel()
    }

    pub fn norm_atd(&self) -> f64 {
        self.norm_atd
    }

    /// Squared projected-gradient threshold for `tolerance`.
    pub fn kkt_bound(&self, tolerance: f64) -> f64 {
        (tolerance * self.norm_atd).powi(2)
    }

    /// `r = A x − d`
    pub fn residual(&self, x: &[f64], r: &mut [f64]) {
        self.op.apply(x, r);
        for (ri, &di) in r.iter_mut().zip(self.d) {
            *ri -= di;
        }
    }

    /// Objective at `x`; leaves `A x − d` in `r`.
    pub fn objective(&self, x: &[f64], r: &mut [f64]) -> f64 {
        self.residual(x, r);
        let mut f = 0.5 * dot(r, r);
        if self.ridge > 0.0 {
            f += 0.5 * self.ridge * dot(x, x);
        }
        f
    }

    /// Gradient `Aᵀ(Ax − d) + λx` into `g`; returns the objective.
    pub fn gradient(&self, x: &[f64], g: &mut [f64], r: &mut [f64]) -> f64 {
        let f = self.objective(x, r);
        self.op.adjoint(r, g);
        if self.ridge > 0.0 {
            for (gi, &xi) in g.iter_mut().zip(x) {
                *gi += self.ridge * xi;
            }
        }
        f
    }
}

/// Per-call settings handed to a strategy.
#[derive(Clone, Copy)]
pub struct SolveContext<'a> {
    pub params: &'a NNLSParams,
    pub progress: Option<&'a dyn Progress>,
}

impl<'a> SolveContext<'a> {
    pub fn new(params: &'a NNLSParams, progress: Option<&'a dyn Progress>) -> Self {
        Self { params, progress }
    }
}

/// A constrained minimisation strategy.
///
/// `x` holds a feasible start on entry and the best iterate on return,
/// whether or not the iteration cap was hit.
pub trait NnlsSolver: Send + Sync {
    fn strategy(&self) -> SolverStrategy;

    fn minimize(
        &self,
        problem: &LeastSquaresProblem,
        x: &mut [f64],
        ctx: &SolveContext,
    ) -> Result<SolveReport>;
}

/// Scratch vectors owned by a single solve.
pub(crate) struct Workspace {
    pub r: Vec<f64>,
    pub g: Vec<f64>,
    pub p: Vec<f64>,
    pub z: Vec<f64>,
    pub w: Vec<f64>,
    pub trial: Vec<f64>,
}

impl Workspace {
    pub fn new(len: usize) -> Self {
        Self {
            r: vec![0.0; len],
            g: vec![0.0; len],
            p: vec![0.0; len],
            z: vec![0.0; len],
            w: vec![0.0; len],
            trial: vec![0.0; len],
        }
    }
}

pub(crate) fn zero_negative_entries(x: &mut [f64], parallel: bool) {
    if parallel {
        x.par_iter_mut().for_each(|xi| {
            if *xi < 0.0 {
                *xi = 0.0;
            }
        });
    } else {
        for xi in x.iter_mut() {
            if *xi < 0.0 {
                *xi = 0.0;
            }
        }
    }
}

/// `y += alpha · x`
fn axpy(alpha: f64, x: &[f64], y: &mut [f64], parallel: bool) {
    if parallel {
        y.par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(yi, &xi)| *yi += alpha * xi);
    } else {
        for (yi, &xi) in y.iter_mut().zip(x) {
            *yi += alpha * xi;
        }
    }
}

pub(crate) fn get_active_entries(x: &[f64], active: &mut [bool]) {
    for (ai, &xi) in active.iter_mut().zip(x) {
        *ai = xi <= 0.0;
    }
}

/// Project `g` onto the feasible cone at `x` in place.
pub(crate) fn project_gradient(x: &[f64], g: &mut [f64]) {
    for (gi, &xi) in g.iter_mut().zip(x) {
        if xi <= 0.0 {
            *gi = gi.min(0.0);
        }
    }
}

/// `‖P ∇f(x)‖²`; leaves the projected gradient in `ws.g`.
pub(crate) fn projected_gradient_sq(
    problem: &LeastSquaresProblem,
    x: &[f64],
    ws: &mut Workspace,
) -> f64 {
    problem.gradient(x, &mut ws.g, &mut ws.r);
    project_gradient(x, &mut ws.g);
    dot(&ws.g, &ws.g)
}

/// `z = Aᵀ r − λ x`, zeroed on the active set. `r` is `d − A x` here.
fn masked_descent(
    problem: &LeastSquaresProblem,
    x: &[f64],
    r: &[f64],
    z: &mut [f64],
    active: &[bool],
) {
    problem.operator().adjoint(r, z);
    let ridge = problem.ridge();
    let mask = |(zi, (&a, &xi)): (&mut f64, (&bool, &f64))| {
        if a {
            *zi = 0.0;
        } else if ridge > 0.0 {
            *zi -= ridge * xi;
        }
    };
    if problem.is_parallel() {
        z.par_iter_mut()
            .zip(active.par_iter().zip(x.par_iter()))
            .for_each(mask);
    } else {
        z.iter_mut().zip(active.iter().zip(x)).for_each(mask);
    }
}

/// Conjugate gradients on the normal equations over the free coordinates.
///
/// Active coordinates are pinned to zero. Stops once `‖z‖ < tol·‖Aᵀd‖` or
/// after `max_iters` steps; returns the number of steps taken.
pub(crate) fn cgnr(
    problem: &LeastSquaresProblem,
    x: &mut [f64],
    active: &[bool],
    max_iters: usize,
    tol: f64,
    ws: &mut Workspace,
    progress: Option<&dyn Progress>,
) -> Result<usize> {
    let op = problem.operator();
    let ridge = problem.ridge();
    let ztz_stop = problem.kkt_bound(tol);
    let check_every = problem.ntax().max(1);
    let parallel = problem.is_parallel();
    let Workspace { r, p, z, w, .. } = ws;

    let pin = |(xi, &a): (&mut f64, &bool)| {
        if a || *xi < 0.0 {
            *xi = 0.0;
        }
    };
    if parallel {
        x.par_iter_mut().zip(active.par_iter()).for_each(pin);
    } else {
        x.iter_mut().zip(active).for_each(pin);
    }

    // r = d - A x
    op.apply(x, r);
    let flip = |(ri, &di): (&mut f64, &f64)| *ri = di - *ri;
    if parallel {
        r.par_iter_mut().zip(problem.target().par_iter()).for_each(flip);
    } else {
        r.iter_mut().zip(problem.target()).for_each(flip);
    }
    masked_descent(problem, x, r, z, active);
    p.copy_from_slice(z);

    let mut ztz = dot(z, z);
    let mut k = 0usize;
    while k < max_iters && ztz >= ztz_stop {
        op.apply(p, w);
        let mut denom = dot(w, w);
        if ridge > 0.0 {
            denom += ridge * dot(p, p);
        }
        let alpha = ztz / denom.max(1e-30);

        axpy(alpha, p, x, parallel);
        axpy(-alpha, w, r, parallel);

        masked_descent(problem, x, r, z, active);
        let ztz_new = dot(z, z);
        k += 1;
        if ztz_new < ztz_stop {
            break;
        }
        let beta = ztz_new / ztz;
        let turn = |(pi, &zi): (&mut f64, &f64)| *pi = zi + beta * *pi;
        if parallel {
            p.par_iter_mut().zip(z.par_iter()).for_each(turn);
        } else {
            p.iter_mut().zip(z.iter()).for_each(turn);
        }
        ztz = ztz_new;

        if k % check_every == 0 {
            check_cancel(progress)?;
        }
    }
    Ok(k)
}

/// Move `x` towards `xstar` without leaving the orthant.
///
/// If `xstar` is feasible it is copied into `x` and `true` is returned.
/// Otherwise `x` advances to the first boundary hit along the segment, the
/// coordinate that hit it becomes active together with the next
/// `ceil(rho · count) − 1` offenders by step length, and `false` is returned.
pub(crate) fn feasible_move(
    x: &mut [f64],
    xstar: &[f64],
    active: &mut [bool],
    offenders: &mut Vec<(f64, usize)>,
    rho: f64,
) -> bool {
    offenders.clear();
    for (i, (&xi, &xsi)) in x.iter().zip(xstar).enumerate() {
        if xsi < 0.0 {
            offenders.push((xi / (xi - xsi), i));
        }
    }
    if offenders.is_empty() {
        x.copy_from_slice(xstar);
        return true;
    }

    offenders.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let tmin = offenders[0].0;
    let count = offenders.len();
    let to_freeze = usize::max(1, ((count as f64) * rho).ceil() as usize).min(count);
    for &(_, i) in &offenders[..to_freeze] {
        active[i] = true;
    }

    for ((xi, &xsi), &a) in x.iter_mut().zip(xstar).zip(active.iter()) {
        *xi = if a { 0.0 } else { (1.0 - tmin) * *xi + tmin * xsi };
    }
    false
}

/// Upper estimate of the largest eigenvalue of `AᵀA + λI`.
///
/// Power iteration from the all-ones vector rather than a fitted formula in
/// `n`, so the estimate follows the actual operator (and the ridge). The
/// result carries a small safety factor so that `1/L` is a descent step;
/// callers still double `L` whenever a step fails.
pub(crate) fn lipschitz_estimate(problem: &LeastSquaresProblem, ws: &mut Workspace) -> f64 {
    const POWER_STEPS: usize = 30;
    const SAFETY: f64 = 1.05;

    let len = problem.len();
    if len == 0 {
        return 1.0;
    }
    let op = problem.operator();
    let Workspace { p, w, z, .. } = ws;

    p.iter_mut().for_each(|v| *v = 1.0 / (len as f64).sqrt());
    let mut lambda = 0.0;
    for _ in 0..POWER_STEPS {
        op.apply(p, w);
        op.adjoint(w, z);
        let norm = dot(z, z).sqrt();
        if norm <= f64::MIN_POSITIVE {
            break;
        }
        lambda = norm;
        for (pi, &zi) in p.iter_mut().zip(z.iter()) {
            *pi = zi / norm;
        }
    }
    (SAFETY * lambda + problem.ridge()).max(f64::MIN_POSITIVE)
}
