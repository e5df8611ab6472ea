use ndarray::Array2;
use rayon::prelude::*;

use crate::data::distance_matrix::DistanceMatrix;
use crate::splits::asplit::ASplit;

/// Distances induced by `splits`: `S[i,j] = Σ weight` over splits separating
/// taxa `i+1` and `j+1`.
pub fn split_distances(n: usize, splits: &[ASplit]) -> Array2<f64> {
    splits
        .par_iter()
        .map(|s| {
            let mut m = Array2::<f64>::zeros((n, n));
            let w = s.weight();
            for a in s.side().ones().filter(|&t| t >= 1 && t <= n) {
                for b in s.other().ones().filter(|&t| t >= 1 && t <= n) {
                    m[[a - 1, b - 1]] += w;
                    m[[b - 1, a - 1]] += w;
                }
            }
            m
        })
        .reduce(
            || Array2::<f64>::zeros((n, n)),
            |mut acc, m| {
                acc.zip_mut_with(&m, |a, b| *a += *b);
                acc
            },
        )
}

/// Least-squares fit (%) of `splits` to `distances`:
/// `100 · (1 − Σ(s_ij − d_ij)² / Σ d_ij²)` over `i < j`.
///
/// Returns 0 when every distance is zero.
pub fn compute_least_squares_fit(distances: &DistanceMatrix, splits: &[ASplit]) -> f64 {
    let n = distances.n();
    if n < 2 {
        return 0.0;
    }
    let split_dist = split_distances(n, splits);
    let d = distances.as_array();

    let (sum_diff_sq, sum_d_sq) = (0..n - 1)
        .into_par_iter()
        .map(|i| {
            let mut diff_sum = 0.0;
            let mut d_sum = 0.0;
            for j in (i + 1)..n {
                let dij = d[[i, j]];
                let diff = split_dist[[i, j]] - dij;
                diff_sum += diff * diff;
                d_sum += dij * dij;
            }
            (diff_sum, d_sum)
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    if sum_d_sq > 0.0 {
        100.0 * (1.0 - sum_diff_sq / sum_d_sq)
    } else {
        0.0
    }
}
