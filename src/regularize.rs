//! Projection of noisy covariance estimates onto the positive semi-definite cone.
//!
//! Numerical optimizers return covariance matrices that may carry small negative
//! eigenvalues. [`regularize`] clips those eigenvalues to zero and rebuilds the
//! matrix from the original eigenvectors, which yields the nearest symmetric PSD
//! matrix in Frobenius norm.

use log::debug;
use ndarray::{Array2, Axis};

use crate::error::{Result, VdError};
use crate::linalg_backends::symmetric_eigen;

/// A regularized matrix together with the smallest eigenvalue seen before correction.
#[derive(Debug, Clone)]
pub struct Regularized {
    pub matrix: Array2<f64>,
    /// Minimum eigenvalue of the symmetrized input. Negative when clipping took place.
    pub min_eigenvalue: f64,
}

impl Regularized {
    /// True when the input already satisfied the eigenvalue floor.
    pub fn was_psd(&self) -> bool {
        self.min_eigenvalue >= 0.0
    }
}

/// Regularizes `matrix` to the nearest positive semi-definite matrix.
///
/// Equivalent to [`regularize_with_floor`] with a floor of zero.
pub fn regularize(matrix: &Array2<f64>) -> Result<Regularized> {
    regularize_with_floor(matrix, 0.0)
}

/// Regularizes `matrix` so that every eigenvalue is at least `floor`.
///
/// The input is symmetrized as `(M + Mᵀ) / 2` first. When the smallest eigenvalue
/// already meets the floor the symmetrized matrix is returned untouched, so applying
/// the function twice gives the same result as applying it once.
///
/// # Errors
/// Returns an error for non-square or non-finite input, a negative or non-finite
/// `floor`, or when the eigendecomposition fails.
pub fn regularize_with_floor(matrix: &Array2<f64>, floor: f64) -> Result<Regularized> {
    if !floor.is_finite() || floor < 0.0 {
        return Err(VdError::Config(format!(
            "eigenvalue floor must be a finite non-negative number, got {}",
            floor
        )));
    }
    let (nrows, ncols) = matrix.dim();
    if nrows != ncols {
        return Err(VdError::Dimension(format!(
            "cannot regularize a non-square {}x{} matrix",
            nrows, ncols
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(VdError::NonFinite("matrix to regularize".to_string()));
    }
    if nrows == 0 {
        return Ok(Regularized { matrix: matrix.clone(), min_eigenvalue: 0.0 });
    }

    let symmetric = symmetrize(matrix);
    let eig = symmetric_eigen(&symmetric)?;
    let min_eigenvalue = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);

    if min_eigenvalue >= floor {
        return Ok(Regularized { matrix: symmetric, min_eigenvalue });
    }

    debug!(
        "Clipping eigenvalues of {}x{} matrix below {:e}; minimum was {:e}.",
        nrows, ncols, floor, min_eigenvalue
    );
    let clipped = eig.eigenvalues.mapv(|ev| ev.max(floor));
    // U * diag(clipped) * U^T, scaling the columns of U in place of a diagonal product.
    let mut scaled = eig.eigenvectors.clone();
    for (mut column, &ev) in scaled.axis_iter_mut(Axis(1)).zip(clipped.iter()) {
        column *= ev;
    }
    let rebuilt = scaled.dot(&eig.eigenvectors.t());

    Ok(Regularized { matrix: symmetrize(&rebuilt), min_eigenvalue })
}

fn symmetrize(matrix: &Array2<f64>) -> Array2<f64> {
    (matrix + &matrix.t()) * 0.5
}
