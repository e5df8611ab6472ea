use anyhow::{Result, bail, ensure};
use ndarray::Array2;

/// Absolute tolerance used when checking symmetry and the zero diagonal.
pub const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// A validated pairwise distance matrix over `n` taxa.
///
/// Indices are 0-based; taxon `t` (1-based, as used by cycles and splits)
/// lives in row `t - 1`. The matrix is immutable once built: square,
/// finite, non-negative, symmetric and with a zero diagonal.
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceMatrix {
    values: Array2<f64>,
}

impl DistanceMatrix {
    /// Validate `values` and wrap them. Asymmetry, negative entries, a
    /// non-zero diagonal or non-finite values are rejected.
    pub fn new(values: Array2<f64>) -> Result<Self> {
        let n = values.nrows();
        ensure!(
            values.ncols() == n,
            "distance matrix must be square (got {}x{})",
            n,
            values.ncols()
        );
        for i in 0..n {
            let dii = values[[i, i]];
            ensure!(
                dii.abs() <= SYMMETRY_TOLERANCE,
                "distance matrix diagonal must be zero (d[{},{}] = {})",
                i + 1,
                i + 1,
                dii
            );
            for j in (i + 1)..n {
                let a = values[[i, j]];
                let b = values[[j, i]];
                if !a.is_finite() || !b.is_finite() {
                    bail!("distance between taxa {} and {} is not finite", i + 1, j + 1);
                }
                if a < 0.0 || b < 0.0 {
                    bail!(
                        "negative distance between taxa {} and {} ({})",
                        i + 1,
                        j + 1,
                        a.min(b)
                    );
                }
                let scale = a.abs().max(b.abs()).max(1.0);
                if (a - b).abs() > SYMMETRY_TOLERANCE * scale {
                    bail!(
                        "distance matrix is not symmetric: d[{},{}] = {} but d[{},{}] = {}",
                        i + 1,
                        j + 1,
                        a,
                        j + 1,
                        i + 1,
                        b
                    );
                }
            }
        }
        Ok(Self { values })
    }

    /// Average every asymmetric off-diagonal pair, zero the diagonal and then
    /// validate. Returns the matrix plus the number of pairs that were repaired.
    pub fn symmetrized(mut values: Array2<f64>) -> Result<(Self, usize)> {
        let n = values.nrows();
        ensure!(
            values.ncols() == n,
            "distance matrix must be square (got {}x{})",
            n,
            values.ncols()
        );
        let mut fixed = 0usize;
        for i in 0..n {
            values[[i, i]] = 0.0;
            for j in (i + 1)..n {
                let a = values[[i, j]];
                let b = values[[j, i]];
                if (a - b).abs() > 1e-12 {
                    let avg = 0.5 * (a + b);
                    values[[i, j]] = avg;
                    values[[j, i]] = avg;
                    fixed += 1;
                }
            }
        }
        Ok((Self::new(values)?, fixed))
    }

    /// Number of taxa.
    pub fn n(&self) -> usize {
        self.values.nrows()
    }

    /// Distance between 0-based rows `i` and `j`.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[[i, j]]
    }

    /// Distance between 1-based taxa `a` and `b`.
    #[inline]
    pub fn taxa(&self, a: usize, b: usize) -> f64 {
        self.values[[a - 1, b - 1]]
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.values
    }
}

impl TryFrom<Array2<f64>> for DistanceMatrix {
    type Error = anyhow::Error;

    fn try_from(values: Array2<f64>) -> Result<Self> {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn accepts_valid_matrix() {
        let d = DistanceMatrix::new(arr2(&[[0.0, 1.0, 2.0], [1.0, 0.0, 1.5], [2.0, 1.5, 0.0]]))
            .unwrap();
        assert_eq!(d.n(), 3);
        assert_eq!(d.taxa(1, 3), 2.0);
        assert_eq!(d.get(1, 2), 1.5);
    }

    #[test]
    fn rejects_non_square() {
        let err = DistanceMatrix::new(Array2::zeros((2, 3))).unwrap_err();
        assert!(err.to_string().contains("square"), "{err}");
    }

    #[test]
    fn rejects_negative_distance() {
        let err = DistanceMatrix::new(arr2(&[[0.0, -1.0], [-1.0, 0.0]])).unwrap_err();
        assert!(err.to_string().contains("negative"), "{err}");
    }

    #[test]
    fn rejects_asymmetry() {
        let err = DistanceMatrix::new(arr2(&[[0.0, 1.0], [1.2, 0.0]])).unwrap_err();
        assert!(err.to_string().contains("symmetric"), "{err}");
    }

    #[test]
    fn rejects_nonzero_diagonal() {
        let err = DistanceMatrix::new(arr2(&[[0.5, 1.0], [1.0, 0.0]])).unwrap_err();
        assert!(err.to_string().contains("diagonal"), "{err}");
    }

    #[test]
    fn rejects_nan() {
        let err = DistanceMatrix::new(arr2(&[[0.0, f64::NAN], [f64::NAN, 0.0]])).unwrap_err();
        assert!(err.to_string().contains("finite"), "{err}");
    }

    #[test]
    fn symmetrized_counts_repairs() {
        let (d, fixed) =
            DistanceMatrix::symmetrized(arr2(&[[0.3, 1.0, 2.0], [1.1, 0.0, 3.0], [2.0, 3.0, 0.0]]))
                .unwrap();
        assert_eq!(fixed, 1);
        assert!((d.get(0, 1) - 1.05).abs() < 1e-12);
        assert_eq!(d.get(0, 0), 0.0);
    }
}
