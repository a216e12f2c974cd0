use std::path::PathBuf;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Options handed to a [`NullModelFitter`] for one fit.
#[derive(Clone, Debug)]
pub struct FitOptions {
    /// Whether the fit result should be cached on disk.
    pub cache: bool,
    /// Location of the cache file; only consulted when `cache` is set.
    pub cache_path: Option<PathBuf>,
    /// Number of optimizer starts to try before giving up on convergence.
    pub n_times: usize,
    /// Refit and overwrite an existing cache file instead of loading it.
    pub rewrite: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            cache: false,
            cache_path: None,
            n_times: 10,
            rewrite: true,
        }
    }
}

/// Outcome of fitting the null multi-trait mixed model
/// `vec(Y) ~ N(1 ⊗ mu, Cg ⊗ R + Cn ⊗ I)`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NullModelFit {
    pub converged: bool,
    /// Genetic trait covariance, shape `(P, P)`.
    pub cg: Array2<f64>,
    /// Noise trait covariance, shape `(P, P)`.
    pub cn: Array2<f64>,
    /// Restricted log-likelihood at the returned estimates.
    pub log_likelihood: f64,
    /// Iterations taken by the start that produced these estimates.
    pub iterations: usize,
    /// Number of optimizer starts used.
    pub starts: usize,
}

impl NullModelFit {
    pub fn num_traits(&self) -> usize {
        self.cg.nrows()
    }
}

/// Something that can fit the null model for a phenotype matrix given a relatedness matrix.
pub trait NullModelFitter {
    fn fit(
        &self,
        phenotypes: ArrayView2<'_, f64>,
        relatedness: ArrayView2<'_, f64>,
        options: &FitOptions,
    ) -> Result<NullModelFit>;
}

impl<T: NullModelFitter + ?Sized> NullModelFitter for &T {
    fn fit(
        &self,
        phenotypes: ArrayView2<'_, f64>,
        relatedness: ArrayView2<'_, f64>,
        options: &FitOptions,
    ) -> Result<NullModelFit> {
        (**self).fit(phenotypes, relatedness, options)
    }
}
