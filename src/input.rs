use std::collections::{HashMap, HashSet};

use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{Result, VdError};

/// Read access to the two matrices a variance decomposition needs.
///
/// Implementors promise that row `i` of the phenotypes and row/column `i` of the
/// relatedness matrix refer to the same sample.
pub trait VarianceDecompositionInput {
    /// Phenotype matrix, shape `(num_samples, num_traits)`.
    fn phenotypes(&self) -> Result<ArrayView2<'_, f64>>;

    /// Relatedness (kinship) matrix, shape `(num_samples, num_samples)`.
    fn relatedness(&self) -> Result<ArrayView2<'_, f64>>;
}

#[derive(Debug, Clone)]
struct Phenotypes {
    values: Array2<f64>,
    trait_ids: Vec<String>,
    sample_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct Relatedness {
    values: Array2<f64>,
    sample_ids: Vec<String>,
}

/// Container for sample-ID annotated phenotypes and relatedness estimates.
///
/// # Examples
///
/// ```no_run
/// use ndarray::Array2;
/// use vd_reml::InputData;
///
/// let mut data = InputData::new();
/// data.add_phenotypes(
///     Array2::zeros((2, 1)),
///     vec!["PID1".to_string()],
///     vec!["SID1".to_string(), "SID2".to_string()],
/// ).unwrap();
/// data.add_relatedness(Array2::eye(2), vec!["SID2".to_string(), "SID1".to_string()]).unwrap();
/// data.align_samples().unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct InputData {
    phenotypes: Option<Phenotypes>,
    relatedness: Option<Relatedness>,
}

impl InputData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an `[N x P]` phenotype matrix with its trait and sample identifiers.
    ///
    /// # Errors
    /// Fails when the identifier counts do not match the matrix shape, when sample
    /// identifiers repeat, or when the matrix contains non-finite values.
    pub fn add_phenotypes(
        &mut self,
        phenotypes: Array2<f64>,
        trait_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<&mut Self> {
        let (n_samples, n_traits) = phenotypes.dim();
        if sample_ids.len() != n_samples {
            return Err(VdError::Dimension(format!(
                "phenotypes have {} rows but {} sample IDs were given",
                n_samples,
                sample_ids.len()
            )));
        }
        if trait_ids.len() != n_traits {
            return Err(VdError::Dimension(format!(
                "phenotypes have {} columns but {} trait IDs were given",
                n_traits,
                trait_ids.len()
            )));
        }
        ensure_unique(&sample_ids, "phenotype sample IDs")?;
        if phenotypes.iter().any(|v| !v.is_finite()) {
            return Err(VdError::NonFinite("phenotypes".to_string()));
        }
        debug!("Added phenotypes for {} samples and {} traits.", n_samples, n_traits);
        self.phenotypes = Some(Phenotypes { values: phenotypes, trait_ids, sample_ids });
        Ok(self)
    }

    /// Adds an `[N x N]` relatedness matrix with its sample identifiers.
    ///
    /// # Errors
    /// Fails for a non-square or asymmetric matrix, mismatched identifiers,
    /// repeated identifiers, or non-finite values.
    pub fn add_relatedness(&mut self, relatedness: Array2<f64>, sample_ids: Vec<String>) -> Result<&mut Self> {
        let (nrows, ncols) = relatedness.dim();
        if nrows != ncols {
            return Err(VdError::Dimension(format!(
                "relatedness must be square, got {}x{}",
                nrows, ncols
            )));
        }
        if sample_ids.len() != nrows {
            return Err(VdError::Dimension(format!(
                "relatedness has {} rows but {} sample IDs were given",
                nrows,
                sample_ids.len()
            )));
        }
        ensure_unique(&sample_ids, "relatedness sample IDs")?;
        if relatedness.iter().any(|v| !v.is_finite()) {
            return Err(VdError::NonFinite("relatedness".to_string()));
        }
        let scale = relatedness.iter().fold(0.0f64, |acc, v| acc.max(v.abs())).max(1.0);
        let asymmetry = relatedness
            .indexed_iter()
            .fold(0.0f64, |acc, ((i, j), v)| acc.max((v - relatedness[[j, i]]).abs()));
        if asymmetry > 1e-8 * scale {
            return Err(VdError::Dimension(format!(
                "relatedness is not symmetric (max |K - K^T| = {:e})",
                asymmetry
            )));
        }
        debug!("Added relatedness for {} samples.", nrows);
        self.relatedness = Some(Relatedness { values: relatedness, sample_ids });
        Ok(self)
    }

    /// Restricts phenotypes and relatedness to the samples present in both, in
    /// phenotype order, so that rows line up across the two matrices.
    ///
    /// # Errors
    /// Fails when either source is missing or the sources share no samples.
    pub fn align_samples(&mut self) -> Result<&mut Self> {
        let pheno = self
            .phenotypes
            .as_ref()
            .ok_or_else(|| VdError::Config("phenotypes have not been added".to_string()))?;
        let rel = self
            .relatedness
            .as_ref()
            .ok_or_else(|| VdError::Config("relatedness has not been added".to_string()))?;

        let rel_index: HashMap<&str, usize> = rel
            .sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let (pheno_rows, rel_rows): (Vec<usize>, Vec<usize>) = pheno
            .sample_ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| rel_index.get(id.as_str()).map(|&j| (i, j)))
            .unzip();

        if pheno_rows.is_empty() {
            return Err(VdError::Dimension(
                "phenotypes and relatedness have no samples in common".to_string(),
            ));
        }

        let sample_ids: Vec<String> = pheno_rows.iter().map(|&i| pheno.sample_ids[i].clone()).collect();
        let pheno_values = pheno.values.select(Axis(0), &pheno_rows);
        let rel_values = rel.values.select(Axis(0), &rel_rows).select(Axis(1), &rel_rows);

        info!(
            "Aligned samples: {} shared ({} phenotyped, {} with relatedness).",
            sample_ids.len(),
            pheno.sample_ids.len(),
            rel.sample_ids.len()
        );

        let trait_ids = pheno.trait_ids.clone();
        self.phenotypes = Some(Phenotypes {
            values: pheno_values,
            trait_ids,
            sample_ids: sample_ids.clone(),
        });
        self.relatedness = Some(Relatedness { values: rel_values, sample_ids });
        Ok(self)
    }

    pub fn trait_ids(&self) -> Option<&[String]> {
        self.phenotypes.as_ref().map(|p| p.trait_ids.as_slice())
    }

    pub fn phenotype_sample_ids(&self) -> Option<&[String]> {
        self.phenotypes.as_ref().map(|p| p.sample_ids.as_slice())
    }

    pub fn relatedness_sample_ids(&self) -> Option<&[String]> {
        self.relatedness.as_ref().map(|r| r.sample_ids.as_slice())
    }
}

impl VarianceDecompositionInput for InputData {
    fn phenotypes(&self) -> Result<ArrayView2<'_, f64>> {
        self.phenotypes
            .as_ref()
            .map(|p| p.values.view())
            .ok_or_else(|| VdError::Config("phenotypes have not been added".to_string()))
    }

    fn relatedness(&self) -> Result<ArrayView2<'_, f64>> {
        self.relatedness
            .as_ref()
            .map(|r| r.values.view())
            .ok_or_else(|| VdError::Config("relatedness has not been added".to_string()))
    }
}

fn ensure_unique(ids: &[String], what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(VdError::Dimension(format!("duplicate entry '{}' in {}", id, what)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn shape_mismatches_are_rejected() {
        let mut data = InputData::new();
        let err = data.add_phenotypes(Array2::zeros((3, 2)), ids("PID", 2), ids("SID", 4));
        assert!(matches!(err, Err(VdError::Dimension(_))));

        let err = data.add_phenotypes(Array2::zeros((3, 2)), ids("PID", 1), ids("SID", 3));
        assert!(matches!(err, Err(VdError::Dimension(_))));

        let err = data.add_relatedness(Array2::zeros((3, 2)), ids("SID", 3));
        assert!(matches!(err, Err(VdError::Dimension(_))));

        let err = data.add_relatedness(array![[1.0, 0.5], [0.1, 1.0]], ids("SID", 2));
        assert!(matches!(err, Err(VdError::Dimension(_))));
    }

    #[test]
    fn duplicate_sample_ids_are_rejected() {
        let mut data = InputData::new();
        let dup = vec!["SID1".to_string(), "SID1".to_string()];
        let err = data.add_relatedness(Array2::eye(2), dup);
        assert!(matches!(err, Err(VdError::Dimension(_))));
    }

    #[test]
    fn missing_sources_surface_as_config_errors() {
        let data = InputData::new();
        assert!(matches!(data.phenotypes(), Err(VdError::Config(_))));
        assert!(matches!(data.relatedness(), Err(VdError::Config(_))));
    }

    #[test]
    fn align_samples_reorders_relatedness_to_phenotype_order() {
        let mut data = InputData::new();
        data.add_phenotypes(
            array![[1.0], [2.0], [3.0]],
            ids("PID", 1),
            vec!["A".into(), "B".into(), "C".into()],
        )
        .unwrap();
        // relatedness lists C, X, A; B has no relatedness, X no phenotype
        data.add_relatedness(
            array![[1.0, 0.2, 0.3], [0.2, 1.0, 0.4], [0.3, 0.4, 2.0]],
            vec!["C".into(), "X".into(), "A".into()],
        )
        .unwrap();
        data.align_samples().unwrap();

        assert_eq!(data.phenotype_sample_ids().unwrap(), &["A".to_string(), "C".to_string()]);
        assert_eq!(data.relatedness_sample_ids().unwrap(), &["A".to_string(), "C".to_string()]);
        assert_eq!(data.phenotypes().unwrap(), array![[1.0], [3.0]]);
        assert_eq!(data.relatedness().unwrap(), array![[2.0, 0.3], [0.3, 1.0]]);
    }

    #[test]
    fn align_samples_without_overlap_fails() {
        let mut data = InputData::new();
        data.add_phenotypes(array![[1.0]], ids("PID", 1), vec!["A".into()]).unwrap();
        data.add_relatedness(array![[1.0]], vec!["B".into()]).unwrap();
        assert!(matches!(data.align_samples(), Err(VdError::Dimension(_))));
    }
}
