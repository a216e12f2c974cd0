// src/linalg_backends.rs

use ndarray::{Array1, Array2};
use std::error::Error;
use std::marker::PhantomData;

use crate::error::{Result, VdError};

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Trait for symmetric eigendecomposition (similar to LAPACK's DSYEVD).
/// Implementers expect `matrix` to be symmetric and read only one triangle.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> std::result::Result<EighOutput<F>, Box<dyn Error + Send + Sync>>;
}

// --- ndarray-linalg (LAPACK) backend ---
use ndarray_linalg::{Eigh as NdLinalgEigh, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> std::result::Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
        if matrix.is_empty() {
            return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

// --- faer backend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, EighOutput};
    use ndarray::{Array1, Array2};
    use std::error::Error;

    fn to_dyn_error_faer(msg: String) -> Box<dyn Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    impl BackendEigh<f64> for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if nrows != ncols {
                return Err(to_dyn_error_faer("Matrix must be square for eigendecomposition.".to_string()));
            }
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            // faer views need contiguous memory; copy only when the input is strided.
            let contiguous = matrix.as_standard_layout();
            let slice = contiguous.as_slice().ok_or_else(|| {
                to_dyn_error_faer(format!("Failed to get slice from row-major matrix ({}x{})", nrows, ncols))
            })?;
            let view = faer::MatRef::from_row_major_slice(slice, nrows, ncols);
            let eig = view
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| to_dyn_error_faer(format!("Faer eigendecomposition failed: {:?}", e)))?;

            let s = eig.S().column_vector();
            let u = eig.U();
            let eigenvalues = Array1::from_shape_fn(nrows, |i| s[i]);
            let eigenvectors = Array2::from_shape_fn((nrows, ncols), |(i, j)| u[(i, j)]);
            Ok(EighOutput { eigenvalues, eigenvectors })
        }
    }
}

// --- Provider dispatch ---

/// Dispatches to the backend selected by compile-time feature flags.
impl BackendEigh<f64> for LinAlgBackendProvider<f64> {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> std::result::Result<EighOutput<f64>, Box<dyn Error + Send + Sync>> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.eigh_upper(matrix)
        }
    }
}

/// Eigendecomposition of a symmetric `f64` matrix through the selected backend,
/// with backend errors mapped into [`VdError::Linalg`].
pub fn symmetric_eigen(matrix: &Array2<f64>) -> Result<EighOutput<f64>> {
    if matrix.nrows() != matrix.ncols() {
        return Err(VdError::Dimension(format!(
            "eigendecomposition needs a square matrix, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    LinAlgBackendProvider::<f64>::new()
        .eigh_upper(matrix)
        .map_err(|e| VdError::Linalg(e.to_string()))
}
