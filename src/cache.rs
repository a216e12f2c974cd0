//! On-disk persistence of null-model fits.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Result, VdError};
use crate::model::NullModelFit;

/// File name of the cache for a phenotype matrix with `num_samples` rows and
/// `num_traits` columns. Identically shaped data map to the same name.
pub fn cache_file_name(num_samples: usize, num_traits: usize) -> String {
    format!("mtSetresults_nrsamples{}s_nrtraits{}s.h5", num_samples, num_traits)
}

/// Full cache path inside `output_dir`.
pub fn cache_file_path<P: AsRef<Path>>(output_dir: P, num_samples: usize, num_traits: usize) -> PathBuf {
    output_dir.as_ref().join(cache_file_name(num_samples, num_traits))
}

/// Writes `fit` to `path` with bincode, creating the parent directory when needed.
pub fn save_fit<P: AsRef<Path>>(fit: &NullModelFit, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serde::encode_into_std_write(fit, &mut writer, bincode::config::standard())
        .map_err(|e| VdError::Cache(format!("failed to serialize fit to {:?}: {}", path, e)))?;
    debug!("Cached null model fit at {:?}.", path);
    Ok(())
}

/// Reads a fit previously written by [`save_fit`] and checks that its covariance
/// matrices are square and of equal size.
pub fn load_fit<P: AsRef<Path>>(path: P) -> Result<NullModelFit> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let fit: NullModelFit = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
        .map_err(|e| VdError::Cache(format!("failed to deserialize fit from {:?}: {}", path, e)))?;

    let (gr, gc) = fit.cg.dim();
    let (nr, nc) = fit.cn.dim();
    if gr != gc || nr != nc || gr != nr {
        return Err(VdError::Cache(format!(
            "cached fit in {:?} has inconsistent shapes: Cg {}x{}, Cn {}x{}",
            path, gr, gc, nr, nc
        )));
    }
    debug!("Loaded cached null model fit from {:?}.", path);
    Ok(fit)
}
