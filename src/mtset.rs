//! Null multi-trait mixed model fitted by EM-REML.
//!
//! The model is `vec(Y) ~ N(1 ⊗ mu, Cg ⊗ R + Cn ⊗ I)` for an `[N x P]` phenotype
//! matrix `Y` and an `[N x N]` relatedness matrix `R`. The per-trait intercept is
//! removed with error contrasts: a Householder reflection `H` maps `1/sqrt(N)` onto
//! `e_1`, and the trailing `N - 1` rows of `HY` are free of the mean. Rotating those
//! rows by the eigenvectors of the contrast-space relatedness leaves independent
//! rows `y_i ~ N(0, lambda_i Cg + Cn)`, on which the EM updates are cheap. Maximum
//! likelihood on the contrasts is REML on the original data.

use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::cache::{load_fit, save_fit};
use crate::error::{Result, VdError};
use crate::linalg_backends::symmetric_eigen;
use crate::model::{FitOptions, NullModelFit, NullModelFitter};
use crate::regularize::regularize_with_floor;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Parameters of the EM-REML optimizer.
#[derive(Clone, Debug)]
pub struct MtSetRemlConfig {
    /// Maximum accelerated EM cycles per start.
    pub max_iterations: usize,
    /// Relative change of `(Cg, Cn)` over one EM step, in Frobenius norm, below
    /// which a start counts as converged. The criterion does not depend on the
    /// units of the phenotypes.
    pub tolerance: f64,
    /// Seed for the random starting points after the first start.
    pub random_seed: u64,
    /// Lower bound on Cn eigenvalues during the iterations, relative to the mean
    /// phenotypic variance.
    pub noise_floor: f64,
}

impl Default for MtSetRemlConfig {
    fn default() -> Self {
        MtSetRemlConfig {
            max_iterations: 10_000,
            tolerance: 1e-7,
            random_seed: 2025,
            noise_floor: 1e-8,
        }
    }
}

/// EM-REML fitter for the null multi-trait model.
#[derive(Clone, Debug, Default)]
pub struct MtSetReml {
    config: MtSetRemlConfig,
}

/// Phenotypes and relatedness spectrum after projecting out the mean and rotating.
#[derive(Debug)]
struct ContrastSpace {
    /// Rotated contrasts, shape `(N - 1, P)`.
    rotated: Array2<f64>,
    /// Eigenvalues of the contrast-space relatedness, clipped at zero.
    eigenvalues: Array1<f64>,
    /// Rows whose eigenvalue carries genetic signal.
    num_informative: usize,
    informative_threshold: f64,
    /// Second moment of the contrasts, `rotated^T rotated / (N - 1)`.
    moment: Array2<f64>,
}

/// Basis that whitens Cn and diagonalizes the whitened Cg.
struct JointBasis {
    /// `Cn^{-1/2} V`; maps contrasts into the diagonal basis.
    whiten: Array2<f64>,
    /// `Cn^{1/2} V`; maps diagonal-basis moments back to trait space.
    unwhiten: Array2<f64>,
    /// Eigenvalues of `Cn^{-1/2} Cg Cn^{-1/2}`, clipped at zero.
    ratios: Array1<f64>,
    log_det_cn: f64,
}

#[derive(Debug)]
struct EmRun {
    cg: Array2<f64>,
    cn: Array2<f64>,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
    #[cfg(test)]
    trace: Vec<f64>,
}

struct Accumulator {
    cg: Array2<f64>,
    cn: Array2<f64>,
    quad_and_logdet: f64,
}

impl Accumulator {
    fn new(p: usize) -> Self {
        Accumulator {
            cg: Array2::zeros((p, p)),
            cn: Array2::zeros((p, p)),
            quad_and_logdet: 0.0,
        }
    }

    fn merge(mut self, other: Accumulator) -> Self {
        self.cg += &other.cg;
        self.cn += &other.cn;
        self.quad_and_logdet += other.quad_and_logdet;
        self
    }
}

impl MtSetReml {
    pub fn new(config: MtSetRemlConfig) -> Self {
        Self { config }
    }

    fn validate(&self, phenotypes: ArrayView2<'_, f64>, relatedness: ArrayView2<'_, f64>) -> Result<()> {
        let (n, p) = phenotypes.dim();
        if n < 2 {
            return Err(VdError::Dimension(format!("need at least 2 samples, got {}", n)));
        }
        if p == 0 {
            return Err(VdError::Dimension("phenotype matrix has no traits".to_string()));
        }
        if relatedness.dim() != (n, n) {
            return Err(VdError::Dimension(format!(
                "relatedness is {}x{} but phenotypes have {} samples",
                relatedness.nrows(),
                relatedness.ncols(),
                n
            )));
        }
        if phenotypes.iter().any(|v| !v.is_finite()) {
            return Err(VdError::NonFinite("phenotypes".to_string()));
        }
        if relatedness.iter().any(|v| !v.is_finite()) {
            return Err(VdError::NonFinite("relatedness".to_string()));
        }
        for (j, column) in phenotypes.axis_iter(Axis(1)).enumerate() {
            if column.iter().all(|&v| v == column[0]) {
                return Err(VdError::Degenerate(format!("trait {} is constant across samples", j)));
            }
        }
        if self.config.max_iterations == 0 {
            return Err(VdError::Config("max_iterations must be positive".to_string()));
        }
        if !(self.config.tolerance > 0.0) || !(self.config.noise_floor > 0.0) {
            return Err(VdError::Config(
                "tolerance and noise_floor must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// EM iterations with SQUAREM extrapolation. Each cycle takes two EM steps,
    /// extrapolates along them and keeps the extrapolated point only if its
    /// log-likelihood is at least that of the plain second step, so the sequence
    /// of log-likelihoods never decreases.
    fn run_em(&self, data: &ContrastSpace, mut cg: Array2<f64>, mut cn: Array2<f64>, floor: f64) -> Result<EmRun> {
        #[cfg(test)]
        let mut trace = Vec::new();

        for iteration in 0..self.config.max_iterations {
            let (log_likelihood, cg1, cn1) = em_step(data, &cg, &cn, floor)?;
            if !log_likelihood.is_finite() {
                return Err(VdError::Degenerate(format!(
                    "log-likelihood became non-finite at EM iteration {}",
                    iteration
                )));
            }
            #[cfg(test)]
            trace.push(log_likelihood);
            if iteration % 500 == 0 {
                trace!("EM iteration {}: log-likelihood {:.6}", iteration, log_likelihood);
            }

            if relative_change(&cg, &cn, &cg1, &cn1) <= self.config.tolerance {
                return Ok(EmRun {
                    cg,
                    cn,
                    log_likelihood,
                    iterations: iteration + 1,
                    converged: true,
                    #[cfg(test)]
                    trace,
                });
            }

            let (_, cg2, cn2) = em_step(data, &cg1, &cn1, floor)?;
            let (next_cg, next_cn) = extrapolate(data, [&cg, &cg1, &cg2], [&cn, &cn1, &cn2], floor)?;
            cg = next_cg;
            cn = next_cn;
        }

        let (log_likelihood, _, _) = em_step(data, &cg, &cn, floor)?;
        Ok(EmRun {
            cg,
            cn,
            log_likelihood,
            iterations: self.config.max_iterations,
            converged: false,
            #[cfg(test)]
            trace,
        })
    }

    fn fit_contrasts(&self, data: &ContrastSpace, n_times: usize) -> Result<NullModelFit> {
        let p = data.moment.nrows();
        let diag = data.moment.diag().to_owned();
        if diag.iter().any(|&v| !(v > 0.0)) {
            return Err(VdError::Degenerate(
                "at least one trait has zero variance".to_string(),
            ));
        }
        let floor = self.config.noise_floor * diag.mean().unwrap_or(1.0);
        let mean_eigenvalue = data.eigenvalues.mean().unwrap_or(1.0).max(f64::MIN_POSITIVE);

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_seed);
        let mut best: Option<EmRun> = None;
        let mut starts = 0;

        for start in 0..n_times.max(1) {
            starts = start + 1;
            let (cg0, cn0) = if start == 0 {
                (
                    &data.moment * (0.5 / mean_eigenvalue),
                    &data.moment * 0.5 + &(Array2::<f64>::eye(p) * floor),
                )
            } else {
                random_start(&diag, mean_eigenvalue, floor, &mut rng)
            };

            let run = self.run_em(data, cg0, cn0, floor)?;
            debug!(
                "Start {}: log-likelihood {:.6} after {} iterations (converged: {}).",
                starts, run.log_likelihood, run.iterations, run.converged
            );

            let converged = run.converged;
            let better = best
                .as_ref()
                .map_or(true, |b| run.log_likelihood > b.log_likelihood);
            if converged || better {
                best = Some(run);
            }
            if converged {
                break;
            }
        }

        let run = best.ok_or_else(|| VdError::Degenerate("no optimizer start completed".to_string()))?;
        if !run.converged {
            warn!("EM-REML did not converge within {} start(s).", starts);
        }
        Ok(NullModelFit {
            converged: run.converged,
            cg: run.cg,
            cn: run.cn,
            log_likelihood: run.log_likelihood,
            iterations: run.iterations,
            starts,
        })
    }
}

impl NullModelFitter for MtSetReml {
    fn fit(
        &self,
        phenotypes: ArrayView2<'_, f64>,
        relatedness: ArrayView2<'_, f64>,
        options: &FitOptions,
    ) -> Result<NullModelFit> {
        self.validate(phenotypes, relatedness)?;
        let (n, p) = phenotypes.dim();

        let cache_path = if options.cache { options.cache_path.as_deref() } else { None };
        if let Some(path) = cache_path {
            if !options.rewrite && path.exists() {
                info!("Loading cached null model from {:?}.", path);
                let fit = load_fit(path)?;
                if fit.num_traits() != p {
                    return Err(VdError::Cache(format!(
                        "cached fit in {:?} has {} traits, phenotypes have {}",
                        path,
                        fit.num_traits(),
                        p
                    )));
                }
                return Ok(fit);
            }
        } else if options.cache {
            warn!("Caching requested without a cache path; the fit will not be cached.");
        }

        info!("Fitting null model for {} samples and {} traits.", n, p);
        let contrasts = project_to_contrast_space(phenotypes, relatedness)?;
        debug!(
            "{} of {} contrasts carry genetic signal (eigenvalue > {:e}).",
            contrasts.num_informative,
            contrasts.eigenvalues.len(),
            contrasts.informative_threshold
        );
        let fit = self.fit_contrasts(&contrasts, options.n_times)?;

        if let Some(path) = cache_path {
            save_fit(&fit, path)?;
        }
        Ok(fit)
    }
}

fn outer(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    a.insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

fn scale_columns(matrix: &Array2<f64>, factors: &Array1<f64>) -> Array2<f64> {
    matrix * &factors.view().insert_axis(Axis(0))
}

fn symmetrize(matrix: Array2<f64>) -> Array2<f64> {
    (&matrix + &matrix.t()) * 0.5
}

fn squared_norm(matrix: &Array2<f64>) -> f64 {
    matrix.iter().map(|v| v * v).sum()
}

/// `||(Cg', Cn') - (Cg, Cn)|| / ||(Cg, Cn)||` in Frobenius norm.
fn relative_change(cg: &Array2<f64>, cn: &Array2<f64>, next_cg: &Array2<f64>, next_cn: &Array2<f64>) -> f64 {
    let diff = squared_norm(&(next_cg - cg)) + squared_norm(&(next_cn - cn));
    let size = squared_norm(cg) + squared_norm(cn);
    (diff / size.max(f64::MIN_POSITIVE)).sqrt()
}

const MAX_BACKTRACKS: usize = 10;

/// SQUAREM step (scheme S3) from `theta_0` through two EM updates `theta_1`,
/// `theta_2`. The extrapolated point is projected back onto the admissible set
/// (Cg and Cn eigenvalues at least `floor`) and stabilized with one EM step.
/// The step length is halved towards the plain EM step while the extrapolated
/// log-likelihood falls below that of `theta_2`.
fn extrapolate(
    data: &ContrastSpace,
    cg: [&Array2<f64>; 3],
    cn: [&Array2<f64>; 3],
    floor: f64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (baseline, em_cg, em_cn) = em_step(data, cg[2], cn[2], floor)?;

    let r_cg = cg[1] - cg[0];
    let r_cn = cn[1] - cn[0];
    let v_cg = &(cg[2] - cg[1]) - &r_cg;
    let v_cn = &(cn[2] - cn[1]) - &r_cn;
    let r_norm = (squared_norm(&r_cg) + squared_norm(&r_cn)).sqrt();
    let v_norm = (squared_norm(&v_cg) + squared_norm(&v_cn)).sqrt();
    let mut alpha = -r_norm / v_norm;
    if !alpha.is_finite() || alpha >= -1.0 {
        return Ok((em_cg, em_cn));
    }

    for _ in 0..MAX_BACKTRACKS {
        // theta_0 - 2 alpha r + alpha^2 v
        let cand_cg = cg[0] - &(&r_cg * (2.0 * alpha)) + &(&v_cg * (alpha * alpha));
        let cand_cn = cn[0] - &(&r_cn * (2.0 * alpha)) + &(&v_cn * (alpha * alpha));
        if cand_cg.iter().chain(cand_cn.iter()).all(|v| v.is_finite()) {
            let cand_cg = regularize_with_floor(&cand_cg, floor)?.matrix;
            let cand_cn = regularize_with_floor(&cand_cn, floor)?.matrix;
            let (log_likelihood, next_cg, next_cn) = em_step(data, &cand_cg, &cand_cn, floor)?;
            if log_likelihood.is_finite() && log_likelihood >= baseline {
                return Ok((next_cg, next_cn));
            }
        }
        alpha = (alpha - 1.0) / 2.0;
    }
    Ok((em_cg, em_cn))
}

/// Removes the per-trait mean with a Householder reflection and rotates the
/// remaining contrasts onto the eigenbasis of the projected relatedness.
fn project_to_contrast_space(
    phenotypes: ArrayView2<'_, f64>,
    relatedness: ArrayView2<'_, f64>,
) -> Result<ContrastSpace> {
    let n = phenotypes.nrows();
    let inv_sqrt_n = 1.0 / (n as f64).sqrt();

    // v = 1/sqrt(N) - e_1, normalized; H = I - 2 w w^T sends 1/sqrt(N) to e_1.
    let mut w = Array1::from_elem(n, inv_sqrt_n);
    w[0] -= 1.0;
    let norm = w.dot(&w).sqrt();
    w /= norm;

    let wt_y = phenotypes.t().dot(&w);
    let reflected_y = &phenotypes - &(outer(w.view(), wt_y.view()) * 2.0);

    let r_w = relatedness.dot(&w);
    let w_r_w = w.dot(&r_w);
    let reflected_r = &relatedness
        - &(outer(w.view(), r_w.view()) * 2.0)
        - &(outer(r_w.view(), w.view()) * 2.0)
        + &(outer(w.view(), w.view()) * (4.0 * w_r_w));

    let contrast_r = symmetrize(reflected_r.slice(s![1.., 1..]).to_owned());
    let eig = symmetric_eigen(&contrast_r)?;
    let eigenvalues = eig.eigenvalues.mapv(|ev| ev.max(0.0));
    let max_eigenvalue = eigenvalues.iter().cloned().fold(0.0, f64::max);
    if !(max_eigenvalue > 0.0) {
        return Err(VdError::Degenerate(
            "relatedness has no positive eigenvalue once the mean is removed".to_string(),
        ));
    }
    let informative_threshold = 1e-10 * max_eigenvalue;
    let num_informative = eigenvalues.iter().filter(|&&ev| ev > informative_threshold).count();

    let rotated = eig.eigenvectors.t().dot(&reflected_y.slice(s![1.., ..]));
    let moment = rotated.t().dot(&rotated) / (n - 1) as f64;

    Ok(ContrastSpace {
        rotated,
        eigenvalues,
        num_informative,
        informative_threshold,
        moment,
    })
}

impl JointBasis {
    fn new(cg: &Array2<f64>, cn: &Array2<f64>, floor: f64) -> Result<Self> {
        let cn_eig = symmetric_eigen(cn)?;
        let cn_values = cn_eig.eigenvalues.mapv(|ev| ev.max(floor));
        let log_det_cn = cn_values.iter().map(|ev| ev.ln()).sum::<f64>();
        let q = &cn_eig.eigenvectors;
        let cn_half = scale_columns(q, &cn_values.mapv(f64::sqrt)).dot(&q.t());
        let cn_inv_half = scale_columns(q, &cn_values.mapv(|ev| 1.0 / ev.sqrt())).dot(&q.t());

        let whitened_cg = symmetrize(cn_inv_half.dot(cg).dot(&cn_inv_half));
        let cg_eig = symmetric_eigen(&whitened_cg)?;
        let ratios = cg_eig.eigenvalues.mapv(|ev| ev.max(0.0));

        Ok(JointBasis {
            whiten: cn_inv_half.dot(&cg_eig.eigenvectors),
            unwhiten: cn_half.dot(&cg_eig.eigenvectors),
            ratios,
            log_det_cn,
        })
    }
}

/// One EM iteration. Returns the restricted log-likelihood at `(cg, cn)` and the
/// updated estimates.
fn em_step(
    data: &ContrastSpace,
    cg: &Array2<f64>,
    cn: &Array2<f64>,
    floor: f64,
) -> Result<(f64, Array2<f64>, Array2<f64>)> {
    let basis = JointBasis::new(cg, cn, floor)?;
    let z = data.rotated.dot(&basis.whiten);
    let (m, p) = z.dim();
    let ratios = &basis.ratios;
    let threshold = data.informative_threshold;

    let acc = (0..m)
        .into_par_iter()
        .fold(
            || Accumulator::new(p),
            |mut acc, i| {
                let s = data.eigenvalues[i];
                let row = z.row(i);
                let denom: Vec<f64> = ratios.iter().map(|&d| s * d + 1.0).collect();
                let residual: Vec<f64> = row.iter().zip(&denom).map(|(&zk, &dk)| zk / dk).collect();
                for k in 0..p {
                    acc.quad_and_logdet += denom[k].ln() + row[k] * row[k] / denom[k];
                    for l in 0..p {
                        acc.cn[[k, l]] += residual[k] * residual[l];
                    }
                    acc.cn[[k, k]] += s * ratios[k] / denom[k];
                }
                if s > threshold {
                    // posterior mean of the genetic effect divided by s
                    let shrunk: Vec<f64> = (0..p).map(|k| ratios[k] / denom[k] * row[k]).collect();
                    for k in 0..p {
                        for l in 0..p {
                            acc.cg[[k, l]] += s * shrunk[k] * shrunk[l];
                        }
                        acc.cg[[k, k]] += ratios[k] / denom[k];
                    }
                }
                acc
            },
        )
        .reduce(|| Accumulator::new(p), Accumulator::merge);

    let m_f = m as f64;
    let log_likelihood = -0.5 * (m_f * p as f64 * LN_2PI + m_f * basis.log_det_cn + acc.quad_and_logdet);

    let a = &basis.unwhiten;
    let next_cg = symmetrize(a.dot(&(acc.cg / data.num_informative as f64)).dot(&a.t()));
    let next_cn = symmetrize(a.dot(&(acc.cn / m_f)).dot(&a.t()));
    Ok((log_likelihood, next_cg, next_cn))
}

/// Random starting point: a Wishart-like draw scaled to the trait variances and
/// split between the two components by a random heritability.
fn random_start(
    trait_variances: &Array1<f64>,
    mean_eigenvalue: f64,
    floor: f64,
    rng: &mut ChaCha8Rng,
) -> (Array2<f64>, Array2<f64>) {
    let p = trait_variances.len();
    let sd = trait_variances.mapv(f64::sqrt);
    let draw = |rng: &mut ChaCha8Rng| {
        let b = Array2::from_shape_fn((p, p), |_| -> f64 { StandardNormal.sample(&mut *rng) });
        let shape = b.dot(&b.t()) / p as f64;
        let scaled = shape * &sd.view().insert_axis(Axis(0));
        scaled * &sd.view().insert_axis(Axis(1))
    };
    let heritability: f64 = rng.gen_range(0.1..0.9);
    let cg = draw(rng) * (heritability / mean_eigenvalue);
    let cn = draw(rng) * (1.0 - heritability) + &(Array2::<f64>::eye(p) * floor);
    (cg, cn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand_distr::Normal;
    use tempfile::tempdir;

    fn sqrt_psd(m: &Array2<f64>) -> Array2<f64> {
        let eig = symmetric_eigen(m).unwrap();
        scale_columns(&eig.eigenvectors, &eig.eigenvalues.mapv(|v| v.max(0.0).sqrt())).dot(&eig.eigenvectors.t())
    }

    /// Families of `family_size` full siblings: relatedness 1 on the diagonal and
    /// 0.5 within a family. Returns (phenotypes, relatedness).
    fn simulate_families(
        n_families: usize,
        family_size: usize,
        cg: &Array2<f64>,
        cn: &Array2<f64>,
        seed: u64,
    ) -> (Array2<f64>, Array2<f64>) {
        let n = n_families * family_size;
        let p = cg.nrows();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let lg = sqrt_psd(cg);
        let ln = sqrt_psd(cn);
        let mut std_normal = |rows: usize| Array2::from_shape_fn((rows, p), |_| normal.sample(&mut rng));

        let family = std_normal(n_families).dot(&lg) * 0.5f64.sqrt();
        let individual = std_normal(n).dot(&lg) * 0.5f64.sqrt();
        let noise = std_normal(n).dot(&ln);

        let mut y = individual + noise;
        let mut k = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            let fi = i / family_size;
            let mut row = y.row_mut(i);
            row += &family.row(fi);
            row += 3.0; // intercept
            for j in 0..n {
                if i == j {
                    k[[i, j]] = 1.0;
                } else if j / family_size == fi {
                    k[[i, j]] = 0.5;
                }
            }
        }
        (y, k)
    }

    #[test]
    fn contrasts_are_free_of_the_mean() {
        let y = array![[1.0, 2.0], [3.0, 5.0], [2.0, -1.0], [0.5, 0.0]];
        let shifted = &y + 100.0;
        let k = Array2::<f64>::eye(4);
        let a = project_to_contrast_space(y.view(), k.view()).unwrap();
        let b = project_to_contrast_space(shifted.view(), k.view()).unwrap();
        assert_eq!(a.rotated.dim(), (3, 2));
        for (x, z) in a.moment.iter().zip(b.moment.iter()) {
            assert_abs_diff_eq!(x, z, epsilon = 1e-8);
        }
        // identity relatedness keeps unit eigenvalues in contrast space
        for ev in a.eigenvalues.iter() {
            assert_abs_diff_eq!(*ev, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn recovers_simulated_components() {
        let cg = array![[1.0, 0.5], [0.5, 1.0]];
        let cn = array![[1.0, -0.2], [-0.2, 0.8]];
        let (y, k) = simulate_families(200, 10, &cg, &cn, 7);
        let fit = MtSetReml::default()
            .fit(y.view(), k.view(), &FitOptions::default())
            .unwrap();
        assert!(fit.converged);
        assert_eq!(fit.starts, 1);
        for (est, truth) in fit.cg.iter().zip(cg.iter()) {
            assert_abs_diff_eq!(*est, *truth, epsilon = 0.4);
        }
        for (est, truth) in fit.cn.iter().zip(cn.iter()) {
            assert_abs_diff_eq!(*est, *truth, epsilon = 0.4);
        }
    }

    #[test]
    fn log_likelihood_never_decreases() {
        let cg = array![[0.6, 0.1, 0.0], [0.1, 0.4, 0.2], [0.0, 0.2, 0.9]];
        let cn = array![[0.5, 0.0, 0.1], [0.0, 0.7, 0.0], [0.1, 0.0, 0.3]];
        let (y, k) = simulate_families(30, 5, &cg, &cn, 99);
        let data = project_to_contrast_space(y.view(), k.view()).unwrap();
        let p = data.moment.nrows();
        let floor = 1e-8;
        let fitter = MtSetReml::new(MtSetRemlConfig { max_iterations: 300, ..Default::default() });
        let run = fitter
            .run_em(&data, Array2::eye(p) * 0.1, Array2::eye(p) * 2.0, floor)
            .unwrap();
        for pair in run.trace.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-8 * (1.0 + pair[0].abs()), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn convergence_does_not_depend_on_phenotype_units() {
        let cg = array![[0.8, 0.3], [0.3, 0.5]];
        let cn = array![[0.6, 0.1], [0.1, 0.9]];
        let (y, k) = simulate_families(40, 5, &cg, &cn, 17);
        let scale = 1024.0;
        let scaled = &y * scale;

        let fitter = MtSetReml::default();
        let options = FitOptions { n_times: 1, ..Default::default() };
        let base = fitter.fit(y.view(), k.view(), &options).unwrap();
        let big = fitter.fit(scaled.view(), k.view(), &options).unwrap();

        assert!(base.converged);
        assert_eq!(base.converged, big.converged);
        let size = base.cg.iter().chain(base.cn.iter()).fold(0.0f64, |m, v| m.max(v.abs()));
        for (a, b) in base.cg.iter().zip(big.cg.iter()) {
            assert_abs_diff_eq!(*a, *b / (scale * scale), epsilon = 1e-4 * size);
        }
        for (a, b) in base.cn.iter().zip(big.cn.iter()) {
            assert_abs_diff_eq!(*a, *b / (scale * scale), epsilon = 1e-4 * size);
        }
    }

    #[test]
    fn relative_change_is_scale_free() {
        let cg = array![[1.0, 0.2], [0.2, 0.5]];
        let cn = array![[0.7, 0.0], [0.0, 0.4]];
        let next_cg = array![[1.1, 0.2], [0.2, 0.5]];
        let a = relative_change(&cg, &cn, &next_cg, &cn);
        let b = relative_change(&(&cg * 1e6), &(&cn * 1e6), &(&next_cg * 1e6), &(&cn * 1e6));
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        assert_eq!(relative_change(&cg, &cn, &cg, &cn), 0.0);
    }

    #[test]
    fn degenerate_inputs_are_reported() {
        let fitter = MtSetReml::default();
        let y = array![[1.0], [2.0], [0.5]];
        let zero_k = Array2::<f64>::zeros((3, 3));
        assert!(matches!(
            fitter.fit(y.view(), zero_k.view(), &FitOptions::default()),
            Err(VdError::Degenerate(_))
        ));

        let constant = Array2::<f64>::from_elem((3, 1), 4.0);
        assert!(matches!(
            fitter.fit(constant.view(), Array2::<f64>::eye(3).view(), &FitOptions::default()),
            Err(VdError::Degenerate(_))
        ));

        let single = array![[1.0]];
        assert!(matches!(
            fitter.fit(single.view(), Array2::<f64>::eye(1).view(), &FitOptions::default()),
            Err(VdError::Dimension(_))
        ));

        let mismatched = Array2::<f64>::eye(4);
        assert!(matches!(
            fitter.fit(y.view(), mismatched.view(), &FitOptions::default()),
            Err(VdError::Dimension(_))
        ));
    }

    #[test]
    fn existing_cache_is_reused_unless_rewrite_is_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cached.h5");
        let cached = NullModelFit {
            converged: true,
            cg: array![[42.0]],
            cn: array![[7.0]],
            log_likelihood: -1.0,
            iterations: 3,
            starts: 1,
        };
        save_fit(&cached, &path).unwrap();

        let (y, k) = simulate_families(10, 4, &array![[1.0]], &array![[1.0]], 5);
        let fitter = MtSetReml::default();
        let reuse = FitOptions {
            cache: true,
            cache_path: Some(path.clone()),
            n_times: 2,
            rewrite: false,
        };
        let loaded = fitter.fit(y.view(), k.view(), &reuse).unwrap();
        assert_eq!(loaded.cg, array![[42.0]]);

        let refit = FitOptions { rewrite: true, ..reuse };
        let fresh = fitter.fit(y.view(), k.view(), &refit).unwrap();
        assert!(fresh.cg[[0, 0]] < 42.0);
        let overwritten = load_fit(&path).unwrap();
        assert_eq!(overwritten.cg, fresh.cg);
    }

    #[test]
    fn random_starts_are_reproducible() {
        let diag = array![1.0, 2.0];
        let mut a = ChaCha8Rng::seed_from_u64(1);
        let mut b = ChaCha8Rng::seed_from_u64(1);
        let (cg_a, cn_a) = random_start(&diag, 1.0, 1e-8, &mut a);
        let (cg_b, cn_b) = random_start(&diag, 1.0, 1e-8, &mut b);
        assert_eq!(cg_a, cg_b);
        assert_eq!(cn_a, cn_b);
        assert!(symmetric_eigen(&cn_a).unwrap().eigenvalues[0] > 0.0);
    }
}
