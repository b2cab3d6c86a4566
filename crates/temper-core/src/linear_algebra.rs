//! Dense linear algebra for symmetric positive-definite matrices.
//!
//! The engine only needs a handful of operations on small `d × d`
//! covariance matrices: Cholesky factorization, triangular products and
//! solves, in-place scaling of a cached factor, weighted outer-product
//! accumulation, and the Gaussian log-density evaluated from a factor.

use ndarray::{Array1, Array2, ArrayView1};

/// Lower-triangular Cholesky factor of a symmetric matrix.
///
/// Returns `None` when the matrix is not (numerically) positive definite,
/// e.g. the degenerate covariance of a collapsed sample set.
pub fn cholesky_lower(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    if n == 0 || matrix.ncols() != n {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Multiplies every entry of a lower factor by `factor`.
///
/// Scaling a cached factor `L` by `√η` is how the driver applies the
/// proposal multiplier without refactoring the covariance on every pilot
/// attempt.
pub fn scale_lower_in_place(l: &mut Array2<f64>, factor: f64) {
    l.mapv_inplace(|v| v * factor);
}

/// `L · z` for a lower-triangular `L`.
pub fn lower_times_vec(l: &Array2<f64>, z: &ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut out = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut acc = 0.0;
        for j in 0..=i {
            acc += l[[i, j]] * z[j];
        }
        out[i] = acc;
    }
    out
}

/// Solves `L · x = b` by forward substitution for a lower-triangular `L`.
///
/// # Panics
///
/// Panics on a zero diagonal entry; factors produced by
/// [`cholesky_lower`] always have strictly positive diagonals.
pub fn forward_substitute(l: &Array2<f64>, b: &ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();
    assert_eq!(b.len(), n, "rhs must match factor dimension");
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut acc = b[i];
        for j in 0..i {
            acc -= l[[i, j]] * x[j];
        }
        assert!(l[[i, i]] != 0.0, "zero pivot in triangular solve");
        x[i] = acc / l[[i, i]];
    }
    x
}

/// Accumulates `weight · diff · diffᵀ` into `acc` (symmetric update).
pub fn weighted_outer_accumulate(acc: &mut Array2<f64>, weight: f64, diff: &ArrayView1<f64>) {
    let n = diff.len();
    for i in 0..n {
        let wi = weight * diff[i];
        for j in 0..n {
            acc[[i, j]] += wi * diff[j];
        }
    }
}

/// Log-density of `N(center, L·Lᵀ)` at `x`, evaluated from the factor `L`.
pub fn ln_gaussian_from_factor(
    x: &ArrayView1<f64>,
    center: &ArrayView1<f64>,
    l: &Array2<f64>,
) -> f64 {
    let d = x.len();
    let diff = x - center;
    let z = forward_substitute(l, &diff.view());
    let ln_det_half: f64 = (0..d).map(|i| l[[i, i]].ln()).sum();
    -0.5 * d as f64 * (2.0 * std::f64::consts::PI).ln() - ln_det_half - 0.5 * z.dot(&z)
}
