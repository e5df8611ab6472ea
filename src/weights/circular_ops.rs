//! Implicit linear operators for the circular split design matrix.
//!
//! Weights and distances are both stored as packed upper triangles over
//! cycle positions: entry `(i, j)`, `1 <= i < j <= n`, lives at
//! [`pair_idx`]. For weights, `(i, j)` is the split `{cycle[i..j-1]} | rest`;
//! for distances it is the pair of taxa at positions `i` and `j`.
//!
//! None of the operators materialises the design matrix. `A x` and `Aᵀ d`
//! are computed with width-by-width recurrences in O(n²); the exact inverse
//! for circular distances is a closed form per entry.

use rayon::prelude::*;

/// Number of packed pairs for `n` taxa.
#[inline]
pub fn npairs(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Packed index of `(i, j)`, rows laid out as (1,2..n), (2,3..n), ...
#[inline]
pub fn pair_idx(i: usize, j: usize, n: usize) -> usize {
    debug_assert!(1 <= i && i < j && j <= n);
    let offset = (i - 1) * n - (i - 1) * i / 2;
    offset + (j - i - 1)
}

/// Matrix-free access to the split-to-distance map of one cycle.
pub trait SplitOperator: Sync {
    /// Number of taxa.
    fn ntax(&self) -> usize;

    /// Length of weight and distance vectors.
    fn len(&self) -> usize {
        npairs(self.ntax())
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the operator (and the vector updates around it) use rayon.
    fn is_parallel(&self) -> bool {
        false
    }

    /// `y = A x`
    fn apply(&self, x: &[f64], y: &mut [f64]);

    /// `p = Aᵀ r`
    fn adjoint(&self, r: &[f64], p: &mut [f64]);
}

/// The circular split operator for `n` taxa.
#[derive(Clone, Copy, Debug)]
pub struct CircularSplitOperator {
    n: usize,
    parallel: bool,
}

impl CircularSplitOperator {
    pub fn new(n: usize) -> Self {
        Self { n, parallel: false }
    }

    /// Use the rayon variants when `parallel` is set and more than one
    /// worker is available.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel && rayon::current_num_threads() > 1;
        self
    }

    /// Closed-form unconstrained solution, exact when `d` is circular.
    pub fn inverse(&self, d: &[f64], x: &mut [f64]) {
        if self.parallel {
            par_calc_ainv_y(d, x, self.n)
        } else {
            calc_ainv_y(d, x, self.n)
        }
    }
}

impl SplitOperator for CircularSplitOperator {
    fn ntax(&self) -> usize {
        self.n
    }

    fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        if self.parallel {
            par_calc_ax(x, y, self.n)
        } else {
            calc_ax(x, y, self.n)
        }
    }

    fn adjoint(&self, r: &[f64], p: &mut [f64]) {
        if self.parallel {
            par_calc_atx(r, p, self.n)
        } else {
            calc_atx(r, p, self.n)
        }
    }
}

/* ===================== serial ===================== */

/// Distance between positions `i` and `i+1`: every split with exactly one
/// of them on its arc.
#[inline]
fn ax_adjacent(x: &[f64], i: usize, n: usize) -> f64 {
    let mut s = 0.0;
    for j in (i + 2)..=n {
        s += x[pair_idx(i + 1, j, n)];
    }
    for j in 1..=i {
        s += x[pair_idx(j, i + 1, n)];
    }
    s
}

/// `d(i, i+k)` from the width `k-1` values.
#[inline]
fn ax_widen(x: &[f64], y: &[f64], i: usize, k: usize, n: usize) -> f64 {
    let j = i + k;
    let inner = if k > 2 { y[pair_idx(i + 1, j - 1, n)] } else { 0.0 };
    y[pair_idx(i, j - 1, n)] + y[pair_idx(i + 1, j, n)] - inner - 2.0 * x[pair_idx(i + 1, j, n)]
}

/// Total distance from position `i` to every other position (the trivial split of `i`).
#[inline]
fn atx_trivial(d: &[f64], i: usize, n: usize) -> f64 {
    let mut s = 0.0;
    for j in 1..i {
        s += d[pair_idx(j, i, n)];
    }
    for j in (i + 1)..=n {
        s += d[pair_idx(i, j, n)];
    }
    s
}

#[inline]
fn atx_widen(d: &[f64], p: &[f64], i: usize, k: usize, n: usize) -> f64 {
    let j = i + k;
    let inner = if k > 2 { p[pair_idx(i + 1, j - 1, n)] } else { 0.0 };
    p[pair_idx(i, j - 1, n)] + p[pair_idx(i + 1, j, n)] - inner - 2.0 * d[pair_idx(i, j - 1, n)]
}

/// Distance between cycle positions `a` and `b`, where position 0 stands for `n`.
#[inline]
fn cyclic_dist(d: &[f64], a: usize, b: usize, n: usize) -> f64 {
    let a = if a == 0 { n } else { a };
    let b = if b == 0 { n } else { b };
    match a.cmp(&b) {
        std::cmp::Ordering::Less => d[pair_idx(a, b, n)],
        std::cmp::Ordering::Greater => d[pair_idx(b, a, n)],
        std::cmp::Ordering::Equal => 0.0,
    }
}

#[inline]
fn ainv_entry(d: &[f64], i: usize, j: usize, n: usize) -> f64 {
    0.5 * (cyclic_dist(d, i - 1, j - 1, n) + cyclic_dist(d, i, j, n)
        - cyclic_dist(d, i, j - 1, n)
        - cyclic_dist(d, i - 1, j, n))
}

/// `y = A x` for the circular split design matrix.
pub fn calc_ax(x: &[f64], y: &mut [f64], n: usize) {
    debug_assert_eq!(x.len(), npairs(n));
    debug_assert_eq!(y.len(), x.len());
    if n < 2 {
        return;
    }
    for i in 1..n {
        y[pair_idx(i, i + 1, n)] = ax_adjacent(x, i, n);
    }
    for k in 2..n {
        for i in 1..=(n - k) {
            y[pair_idx(i, i + k, n)] = ax_widen(x, y, i, k, n);
        }
    }
}

/// `p = Aᵀ d`: for each split, the summed distance over the pairs it separates.
pub fn calc_atx(d: &[f64], p: &mut [f64], n: usize) {
    debug_assert_eq!(d.len(), npairs(n));
    debug_assert_eq!(p.len(), d.len());
    if n < 2 {
        return;
    }
    for i in 1..n {
        p[pair_idx(i, i + 1, n)] = atx_trivial(d, i, n);
    }
    for k in 2..n {
        for i in 1..=(n - k) {
            p[pair_idx(i, i + k, n)] = atx_widen(d, p, i, k, n);
        }
    }
}

/// Closed-form inverse: the unique weights reproducing `d` if `d` is circular
/// for this cycle. On arbitrary `d` this is the unconstrained least-squares
/// solution (`A` is square and invertible) and may contain negative entries.
pub fn calc_ainv_y(d: &[f64], x: &mut [f64], n: usize) {
    debug_assert_eq!(d.len(), npairs(n));
    debug_assert_eq!(x.len(), d.len());
    if n < 2 {
        return;
    }
    if n == 2 {
        x[0] = d[0];
        return;
    }
    for i in 1..n {
        for j in (i + 1)..=n {
            x[pair_idx(i, j, n)] = ainv_entry(d, i, j, n);
        }
    }
}

/* ===================== parallel ===================== */

/// Split a packed vector into its `n - 1` rows.
fn rows_mut(v: &mut [f64], n: usize) -> Vec<&mut [f64]> {
    let mut rows = Vec::with_capacity(n.saturating_sub(1));
    let mut rest = v;
    for i in 1..n {
        let (row, tail) = std::mem::take(&mut rest).split_at_mut(n - i);
        rows.push(row);
        rest = tail;
    }
    rows
}

/// Parallel `A x`. Rows of one width are computed concurrently; widths are
/// processed in order because width `k` reads width `k-1` and `k-2`.
pub fn par_calc_ax(x: &[f64], y: &mut [f64], n: usize) {
    debug_assert_eq!(y.len(), x.len());
    if n < 2 {
        return;
    }
    rows_mut(y, n)
        .into_par_iter()
        .enumerate()
        .for_each(|(r, row)| row[0] = ax_adjacent(x, r + 1, n));
    let mut width = Vec::with_capacity(n);
    for k in 2..n {
        {
            let yr: &[f64] = y;
            (1..n - k + 1)
                .into_par_iter()
                .map(|i| ax_widen(x, yr, i, k, n))
                .collect_into_vec(&mut width);
        }
        for (i, v) in (1..=(n - k)).zip(width.iter()) {
            y[pair_idx(i, i + k, n)] = *v;
        }
    }
}

/// Parallel `Aᵀ d`, same barrier structure as [`par_calc_ax`].
pub fn par_calc_atx(d: &[f64], p: &mut [f64], n: usize) {
    debug_assert_eq!(p.len(), d.len());
    if n < 2 {
        return;
    }
    rows_mut(p, n)
        .into_par_iter()
        .enumerate()
        .for_each(|(r, row)| row[0] = atx_trivial(d, r + 1, n));
    let mut width = Vec::with_capacity(n);
    for k in 2..n {
        {
            let pr: &[f64] = p;
            (1..n - k + 1)
                .into_par_iter()
                .map(|i| atx_widen(d, pr, i, k, n))
                .collect_into_vec(&mut width);
        }
        for (i, v) in (1..=(n - k)).zip(width.iter()) {
            p[pair_idx(i, i + k, n)] = *v;
        }
    }
}

/// Parallel closed-form inverse; every entry is independent so rows are
/// written concurrently.
pub fn par_calc_ainv_y(d: &[f64], x: &mut [f64], n: usize) {
    if n <= 2 {
        calc_ainv_y(d, x, n);
        return;
    }
    rows_mut(x, n)
        .into_par_iter()
        .enumerate()
        .for_each(|(r, row)| {
            let i = r + 1;
            for (c, xij) in row.iter_mut().enumerate() {
                *xij = ainv_entry(d, i, i + 1 + c, n);
            }
        });
}

/* ===================== vector helpers ===================== */

/// Sum of squares over a packed vector, accumulated row by row.
pub fn sum_array_squared(x: &[f64], n: usize) -> f64 {
    assert_eq!(
        x.len(),
        npairs(n),
        "x must have length n*(n-1)/2 (got {}, expected {})",
        x.len(),
        npairs(n)
    );
    let mut total = 0.0f64;
    let mut index = 0usize;
    for i in 1..n {
        let mut s_i = 0.0f64;
        for _ in (i + 1)..=n {
            s_i += x[index] * x[index];
            index += 1;
        }
        total += s_i;
    }
    total
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(u, v)| u * v).sum()
}

/// Flatten distances into packed cycle order: entry `(i, j)` is the distance
/// between taxa `cycle[i]` and `cycle[j]`.
pub fn packed_cycle_distances(cycle: &[usize], dist: impl Fn(usize, usize) -> f64) -> Vec<f64> {
    let n = cycle.len() - 1;
    let mut d = Vec::with_capacity(npairs(n));
    for i in 1..=n {
        for j in (i + 1)..=n {
            d.push(dist(cycle[i], cycle[j]));
        }
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vec(len: usize, rng: &mut StdRng) -> Vec<f64> {
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn compare_float_array(arr1: &[f64], arr2: &[f64], eps: f64) {
        assert_eq!(arr1.len(), arr2.len());
        for (a, b) in arr1.iter().zip(arr2.iter()) {
            assert!((*a - *b).abs() < eps, "got {}, wanted {}", a, b);
        }
    }

    /// Brute force: sum the weights of every split separating the two positions.
    fn naive_ax(x: &[f64], n: usize) -> Vec<f64> {
        let mut y = vec![0.0; npairs(n)];
        for a in 1..=n {
            for b in (a + 1)..=n {
                let mut s = 0.0;
                for i in 1..=n {
                    for j in (i + 1)..=n {
                        let in_a = (i..j).contains(&a);
                        let in_b = (i..j).contains(&b);
                        if in_a != in_b {
                            s += x[pair_idx(i, j, n)];
                        }
                    }
                }
                y[pair_idx(a, b, n)] = s;
            }
        }
        y
    }

    #[test]
    fn pair_idx_is_dense() {
        let n = 7;
        let mut seen = vec![false; npairs(n)];
        for i in 1..=n {
            for j in (i + 1)..=n {
                let k = pair_idx(i, j, n);
                assert!(!seen[k]);
                seen[k] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn ax_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in 2..9 {
            let x = random_vec(npairs(n), &mut rng);
            let mut y = vec![0.0; x.len()];
            calc_ax(&x, &mut y, n);
            compare_float_array(&y, &naive_ax(&x, n), 1e-10);
        }
    }

    #[test]
    fn adjoint_property() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 2..14 {
            let m = npairs(n);
            let x = random_vec(m, &mut rng);
            let d = random_vec(m, &mut rng);
            let mut ax = vec![0.0; m];
            let mut atd = vec![0.0; m];
            calc_ax(&x, &mut ax, n);
            calc_atx(&d, &mut atd, n);
            let lhs = dot(&ax, &d);
            let rhs = dot(&x, &atd);
            assert!((lhs - rhs).abs() < 1e-9 * (1.0 + lhs.abs()), "n={n}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn inverse_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        for n in 2..12 {
            let m = npairs(n);
            let w: Vec<f64> = (0..m).map(|_| rng.gen_range(0.0..2.0)).collect();
            let mut d = vec![0.0; m];
            calc_ax(&w, &mut d, n);
            let mut x = vec![0.0; m];
            calc_ainv_y(&d, &mut x, n);
            compare_float_array(&x, &w, 1e-9);
        }
    }

    #[test]
    fn parallel_matches_serial() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        for n in [3usize, 4, 9, 23] {
            let m = npairs(n);
            let x = random_vec(m, &mut rng);
            let (mut s, mut p) = (vec![0.0; m], vec![0.0; m]);
            calc_ax(&x, &mut s, n);
            pool.install(|| par_calc_ax(&x, &mut p, n));
            compare_float_array(&s, &p, 1e-12);
            calc_atx(&x, &mut s, n);
            pool.install(|| par_calc_atx(&x, &mut p, n));
            compare_float_array(&s, &p, 1e-12);
            calc_ainv_y(&x, &mut s, n);
            pool.install(|| par_calc_ainv_y(&x, &mut p, n));
            compare_float_array(&s, &p, 1e-12);
        }
    }

    fn smoke_10_distances() -> (Vec<usize>, Vec<f64>) {
        let rows = [
            [0.0, 5.0, 12.0, 7.0, 3.0, 9.0, 11.0, 6.0, 4.0, 10.0],
            [5.0, 0.0, 8.0, 2.0, 14.0, 5.0, 13.0, 7.0, 12.0, 1.0],
            [12.0, 8.0, 0.0, 4.0, 9.0, 3.0, 8.0, 2.0, 5.0, 6.0],
            [7.0, 2.0, 4.0, 0.0, 11.0, 7.0, 10.0, 4.0, 6.0, 9.0],
            [3.0, 14.0, 9.0, 11.0, 0.0, 8.0, 1.0, 13.0, 2.0, 7.0],
            [9.0, 5.0, 3.0, 7.0, 8.0, 0.0, 12.0, 5.0, 3.0, 4.0],
            [11.0, 13.0, 8.0, 10.0, 1.0, 12.0, 0.0, 6.0, 2.0, 8.0],
            [6.0, 7.0, 2.0, 4.0, 13.0, 5.0, 6.0, 0.0, 9.0, 7.0],
            [4.0, 12.0, 5.0, 6.0, 2.0, 3.0, 2.0, 9.0, 0.0, 5.0],
            [10.0, 1.0, 6.0, 9.0, 7.0, 4.0, 8.0, 7.0, 5.0, 0.0],
        ];
        let cycle = vec![0, 1, 5, 7, 9, 3, 8, 4, 2, 10, 6];
        let d = packed_cycle_distances(&cycle, |a, b| rows[a - 1][b - 1]);
        (cycle, d)
    }

    #[test]
    fn atx_smoke_10() {
        let n = 10;
        let (_cycle, d) = smoke_10_distances();
        let mut atx = vec![0.0; npairs(n)];
        calc_atx(&d, &mut atx, n);
        let exp = vec![
            67.0, 129.0, 176.0, 208.0, 197.0, 184.0, 160.0, 105.0, 56.0, 68.0, 137.0, 177.0,
            190.0, 189.0, 179.0, 134.0, 105.0, 71.0, 115.0, 146.0, 171.0, 183.0, 166.0, 151.0,
            48.0, 95.0, 132.0, 164.0, 173.0, 174.0, 57.0, 112.0, 156.0, 189.0, 200.0, 59.0,
            111.0, 160.0, 183.0, 60.0, 123.0, 160.0, 67.0, 122.0, 57.0,
        ];
        compare_float_array(&atx, &exp, 1e-8);
        assert!((sum_array_squared(&atx, n).sqrt() - 959.9874999186187).abs() < 1e-9);
    }

    #[test]
    fn ainv_smoke_10() {
        let n = 10;
        let (_cycle, d) = smoke_10_distances();
        let mut x = vec![0.0; npairs(n)];
        calc_ainv_y(&d, &mut x, n);
        let exp = vec![
            2.0, 2.0, 1.0, 4.0, -4.0, -0.5, 0.0, 3.0, 1.5, -3.5, 4.0, -0.5, 5.0, -1.5, 2.5, -6.0,
            1.0, 0.5, -0.5, -3.0, 3.0, 0.0, 1.0, 1.5, -0.5, 3.0, -3.5, 1.5, -1.0, -3.0, -1.0, 2.5,
            -1.0, 2.5, -0.5, 1.0, -0.5, 1.0, 0.5, -0.5, 3.5, 0.0, -3.0, 3.0, 0.0,
        ];
        compare_float_array(&x, &exp, 1e-8);
        let min_val = x.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(min_val, -6.0);
    }

    #[test]
    fn operator_dispatch() {
        let op = CircularSplitOperator::new(6).with_parallel(false);
        assert_eq!(op.len(), 15);
        let x = vec![1.0; 15];
        let mut y = vec![0.0; 15];
        op.apply(&x, &mut y);
        // adjacent positions are separated by n - 1 splits
        assert_eq!(y[pair_idx(1, 2, 6)], 5.0);
    }
}
