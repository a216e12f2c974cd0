use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array2;

use crate::cache::cache_file_path;
use crate::error::{Result, VdError};
use crate::input::VarianceDecompositionInput;
use crate::model::{FitOptions, NullModelFitter};
use crate::mtset::MtSetReml;
use crate::regularize::regularize;

/// Settings for [`vd_reml`].
#[derive(Clone, Debug)]
pub struct VdRemlConfig {
    /// Cache the null model fit in `output`.
    pub cache: bool,
    /// Directory with write permission for the cache file; required when `cache` is set.
    pub output: Option<PathBuf>,
    /// Number of optimizer starts handed to the fitter.
    pub iterations: usize,
    /// Log progress at `info` level instead of `debug`.
    pub verbose: bool,
}

impl Default for VdRemlConfig {
    fn default() -> Self {
        VdRemlConfig {
            cache: false,
            output: None,
            iterations: 10,
            verbose: true,
        }
    }
}

/// Genetic and noise covariance estimates with fit diagnostics.
#[derive(Debug, Clone)]
pub struct VarianceDecomposition {
    /// `[P x P]` genetic covariance, positive semi-definite.
    pub cg: Array2<f64>,
    /// `[P x P]` noise covariance, positive semi-definite.
    pub cn: Array2<f64>,
    /// Wall-clock seconds spent in the fitter.
    pub process_time: f64,
    /// Whether the fitter reported convergence. Estimates from a run that did not
    /// converge are still regularized and returned.
    pub converged: bool,
    /// Smallest eigenvalue of the fitted Cg before regularization.
    pub cg_min_eigenvalue: f64,
    /// Smallest eigenvalue of the fitted Cn before regularization.
    pub cn_min_eigenvalue: f64,
    pub log_likelihood: f64,
}

impl VarianceDecomposition {
    /// Splits the result into `(Cg, Cn, process_time)`.
    pub fn into_parts(self) -> (Array2<f64>, Array2<f64>, f64) {
        (self.cg, self.cn, self.process_time)
    }
}

fn progress(verbose: bool, message: &str) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

/// Decomposes the phenotypes of `data` into genetic and noise covariance with the
/// default [`MtSetReml`] fitter.
///
/// # Examples
///
/// ```no_run
/// use vd_reml::{vd_reml, InputData, VdRemlConfig};
/// # fn run(data: &InputData) -> vd_reml::Result<()> {
/// let result = vd_reml(data, &VdRemlConfig { verbose: false, ..Default::default() })?;
/// let (cg, cn, seconds) = result.into_parts();
/// # Ok(())
/// # }
/// ```
pub fn vd_reml<D>(data: &D, config: &VdRemlConfig) -> Result<VarianceDecomposition>
where
    D: VarianceDecompositionInput + ?Sized,
{
    vd_reml_with(&MtSetReml::default(), data, config)
}

/// Same as [`vd_reml`] with a caller-supplied null model fitter.
///
/// # Errors
/// Returns [`VdError::Config`] before calling the fitter when caching is enabled
/// without an output directory. Errors from the input container, the fitter and
/// the regularization are passed through.
pub fn vd_reml_with<F, D>(fitter: &F, data: &D, config: &VdRemlConfig) -> Result<VarianceDecomposition>
where
    F: NullModelFitter + ?Sized,
    D: VarianceDecompositionInput + ?Sized,
{
    progress(config.verbose, "Estimate covariance matrices based on standard REML");

    if config.cache && config.output.is_none() {
        return Err(VdError::Config(
            "output directory must be specified when caching is enabled".to_string(),
        ));
    }
    if !config.cache && config.output.is_some() {
        warn!("Caching is disabled, despite having supplied an output directory");
    }

    let phenotypes = data.phenotypes()?;
    let relatedness = data.relatedness()?;
    let (num_samples, num_traits) = phenotypes.dim();

    let cache_path = match (&config.output, config.cache) {
        (Some(dir), true) => Some(cache_file_path(dir, num_samples, num_traits)),
        _ => None,
    };

    let options = FitOptions {
        cache: config.cache,
        cache_path,
        n_times: config.iterations,
        rewrite: true,
    };

    let start = Instant::now();
    let fit = fitter.fit(phenotypes, relatedness, &options)?;
    let process_time = start.elapsed().as_secs_f64();

    if fit.converged {
        progress(config.verbose, "Variance decomposition via REML converged");
    } else {
        warn!("Variance decomposition via REML did not converge");
    }

    let cg = regularize(&fit.cg)?;
    let cn = regularize(&fit.cn)?;
    for (name, regularized) in [("Cg", &cg), ("Cn", &cn)] {
        if !regularized.was_psd() {
            progress(
                config.verbose,
                &format!("{} was not positive semi-definite; negative eigenvalues clipped to zero", name),
            );
        }
    }
    progress(
        config.verbose,
        &format!(
            "Minimum eigenvalue before regularization: Cg {:.6e}, Cn {:.6e}",
            cg.min_eigenvalue, cn.min_eigenvalue
        ),
    );

    Ok(VarianceDecomposition {
        cg: cg.matrix,
        cn: cn.matrix,
        process_time,
        converged: fit.converged,
        cg_min_eigenvalue: cg.min_eigenvalue,
        cn_min_eigenvalue: cn.min_eigenvalue,
        log_likelihood: fit.log_likelihood,
    })
}
