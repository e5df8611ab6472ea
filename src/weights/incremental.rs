//! Warm start by inserting taxa one at a time into a growing sub-cycle.
//!
//! Cycle positions `1..=n` are used throughout. A split is stored by its two
//! cut gaps: "before position p" and "before position q" give the packed pair
//! `(p, q)`, `p < q`, i.e. the arc `{p..q-1}`. When taxon `t` lands between
//! sub-cycle neighbours `a` and `b`, only the splits cutting the gap before
//! `b` change: each is divided between the side that gains `t` and the side
//! that does not, and `t` gets its own trivial split.

use std::collections::BTreeSet;

use log::trace;
use ndarray::Array2;

use crate::data::distance_matrix::DistanceMatrix;
use crate::weights::circular_ops::{npairs, packed_cycle_distances, pair_idx};
use crate::weights::golden_section::golden_section_search;

/// Taxa (1-based) in max-divergence order: largest row sum first, then
/// repeatedly the taxon farthest in total from those already chosen.
pub fn divergence_order(dist: &DistanceMatrix) -> Vec<usize> {
    let n = dist.n();
    let mut order = Vec::with_capacity(n);
    if n == 0 {
        return order;
    }
    let rows = dist.as_array();
    let mut chosen = vec![false; n];
    let mut seed = 0usize;
    let mut seed_sum = f64::NEG_INFINITY;
    for i in 0..n {
        let s = rows.row(i).sum();
        if s > seed_sum {
            seed_sum = s;
            seed = i;
        }
    }

    let mut to_chosen = vec![0.0; n];
    let mut last = seed;
    chosen[seed] = true;
    order.push(seed + 1);
    for _ in 1..n {
        let mut best: Option<(usize, f64)> = None;
        for i in 0..n {
            if chosen[i] {
                continue;
            }
            to_chosen[i] += dist.get(i, last);
            if best.map_or(true, |(_, b)| to_chosen[i] > b) {
                best = Some((i, to_chosen[i]));
            }
        }
        let Some((next, _)) = best else { break };
        chosen[next] = true;
        order.push(next + 1);
        last = next;
    }
    order
}

/// Incremental fit of packed weights for `cycle` (`[0, t1, ..., tn]`).
///
/// Always non-negative. Exact when `dist` is circular for `cycle`.
pub fn incremental_fit(cycle: &[usize], dist: &DistanceMatrix) -> Vec<f64> {
    let n = cycle.len().saturating_sub(1);
    let d = packed_cycle_distances(cycle, |a, b| dist.taxa(a, b));
    let mut position = vec![0usize; n + 1];
    for (p, &t) in cycle.iter().enumerate().skip(1) {
        position[t] = p;
    }
    let insertion: Vec<usize> = divergence_order(dist)
        .into_iter()
        .map(|t| position[t])
        .collect();
    incremental_fit_packed(&d, n, &insertion)
}

#[inline]
fn key(p: usize, q: usize, n: usize) -> usize {
    if p < q { pair_idx(p, q, n) } else { pair_idx(q, p, n) }
}

#[inline]
fn pdist(d: &[f64], a: usize, b: usize, n: usize) -> f64 {
    if a == b { 0.0 } else { d[key(a, b, n)] }
}

/// Per-insertion data in the notation of the module docs.
struct Insertion {
    /// Old weights of splits cutting the gap before `b`, `w[m]` for `m = 0..k-1`.
    w: Vec<f64>,
    /// Targets `e_j = d(t, u_j) − P_j`, `j = 0..k`.
    e: Vec<f64>,
}

impl Insertion {
    /// Fitted `e` values for a choice of `z` and `s` into `out`.
    fn predict(&self, z: &[f64], s: f64, out: &mut [f64]) {
        let mut acc = s + self.w.iter().zip(z).map(|(w, z)| w - z).sum::<f64>();
        out[0] = acc;
        for m in 0..self.w.len() {
            acc += 2.0 * z[m] - self.w[m];
            out[m + 1] = acc;
        }
    }

    fn error(&self, z: &[f64], s: f64, buf: &mut [f64]) -> f64 {
        self.predict(z, s, buf);
        self.e.iter().zip(buf.iter()).map(|(e, f)| (e - f).powi(2)).sum()
    }

    /// Exact solution of the square system (may violate the bounds).
    fn closed_form(&self) -> (Vec<f64>, f64) {
        let z: Vec<f64> = (0..self.w.len())
            .map(|m| 0.5 * (self.w[m] + self.e[m + 1] - self.e[m]))
            .collect();
        let s = self.e[0] - self.w.iter().zip(&z).map(|(w, z)| w - z).sum::<f64>();
        (z, s)
    }

    fn feasible(&self, z: &[f64], s: f64) -> bool {
        s >= 0.0 && z.iter().zip(&self.w).all(|(&z, &w)| (0.0..=w).contains(&z))
    }

    fn clamp(&self, z: &mut [f64], s: &mut f64) {
        for (zi, &wi) in z.iter_mut().zip(&self.w) {
            *zi = zi.clamp(0.0, wi);
        }
        *s = s.max(0.0);
    }

    /// Best trivial weight for fixed `z`.
    fn best_s(&self, z: &[f64], buf: &mut [f64]) -> f64 {
        self.predict(z, 0.0, buf);
        let k = self.e.len() as f64;
        let mean = self.e.iter().zip(buf.iter()).map(|(e, f)| e - f).sum::<f64>() / k;
        mean.max(0.0)
    }

    /// Bounded solution: closed form if feasible, otherwise the best point
    /// on the projected segment from the midpoint split to the closed form.
    fn solve(&self) -> (Vec<f64>, f64) {
        let (z_star, s_star) = self.closed_form();
        if self.feasible(&z_star, s_star) {
            return (z_star, s_star);
        }

        let mut buf = vec![0.0; self.e.len()];
        let z0: Vec<f64> = self.w.iter().map(|w| 0.5 * w).collect();
        let s0 = self.best_s(&z0, &mut buf);
        let mut z_t = z0.clone();

        let point_at = |t: f64, z_t: &mut Vec<f64>| -> f64 {
            for m in 0..z_t.len() {
                z_t[m] = z0[m] + t * (z_star[m] - z0[m]);
            }
            let mut s_t = s0 + t * (s_star - s0);
            self.clamp(z_t, &mut s_t);
            s_t
        };

        let (t, _) = golden_section_search(
            |t| {
                let s_t = point_at(t, &mut z_t);
                self.error(&z_t, s_t, &mut buf)
            },
            0.0,
            1.0,
            1e-8,
            80,
        );
        let mut z = z0.clone();
        point_at(t, &mut z);
        let s = self.best_s(&z, &mut buf);
        (z, s)
    }
}

/// Incremental fit on packed cycle distances, inserting positions in the
/// given order.
pub(crate) fn incremental_fit_packed(d: &[f64], n: usize, insertion: &[usize]) -> Vec<f64> {
    let mut x = vec![0.0; npairs(n)];
    if n < 2 {
        return x;
    }
    if n == 2 {
        x[0] = d[0].max(0.0);
        return x;
    }
    debug_assert_eq!(insertion.len(), n);

    let mut first = [insertion[0], insertion[1], insertion[2]];
    first.sort_unstable();
    let [a, b, c] = first;
    let (dab, dac, dbc) = (pdist(d, a, b, n), pdist(d, a, c, n), pdist(d, b, c, n));
    let sa = (0.5 * (dab + dac - dbc)).max(0.0);
    let sb = (0.5 * (dab + dbc - dac)).max(0.0);
    let sc = (0.5 * (dac + dbc - dab)).max(0.0);
    x[key(a, b, n)] = sa;
    x[key(b, c, n)] = sb;
    x[key(a, c, n)] = sc;

    // Fitted distances between inserted positions.
    let mut model = Array2::<f64>::zeros((n + 1, n + 1));
    for (p, q, v) in [(a, b, sa + sb), (a, c, sa + sc), (b, c, sb + sc)] {
        model[[p, q]] = v;
        model[[q, p]] = v;
    }
    let mut sub: BTreeSet<usize> = first.into_iter().collect();

    for &t in &insertion[3..] {
        let succ = sub
            .range(t + 1..)
            .next()
            .or_else(|| sub.iter().next())
            .copied()
            .unwrap_or(t);
        let pred = sub
            .range(..t)
            .next_back()
            .or_else(|| sub.iter().next_back())
            .copied()
            .unwrap_or(t);
        let u: Vec<usize> = sub.range(succ..).chain(sub.range(..succ)).copied().collect();
        let k = u.len();

        let w: Vec<f64> = (1..k).map(|m| x[key(succ, u[m], n)]).collect();
        // P_j = model(pred, u_j) − Σ_{m ≥ j} w_m
        let mut p_vals = vec![0.0; k];
        let mut tail = 0.0;
        for j in (0..k).rev() {
            if j < k - 1 {
                tail += w[j];
            }
            p_vals[j] = model[[pred, u[j]]] - tail;
        }
        let e: Vec<f64> = (0..k).map(|j| pdist(d, t, u[j], n) - p_vals[j]).collect();

        let ins = Insertion { w, e };
        let (z, s) = ins.solve();
        trace!("insert position {} between {} and {}: s = {:.4}", t, pred, succ, s);

        for m in 0..k - 1 {
            x[key(t, u[m + 1], n)] = z[m];
            x[key(succ, u[m + 1], n)] = ins.w[m] - z[m];
        }
        x[key(t, succ, n)] = s;

        let mut fitted = vec![0.0; k];
        ins.predict(&z, s, &mut fitted);
        for j in 0..k {
            let v = p_vals[j] + fitted[j];
            model[[t, u[j]]] = v;
            model[[u[j], t]] = v;
        }
        sub.insert(t);
    }
    x
}
