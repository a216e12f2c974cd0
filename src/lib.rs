// Multi-trait variance decomposition via REML

#![doc = include_str!("../README.md")]

pub mod cache;
pub mod error;
pub mod input;
pub mod linalg_backends;
pub mod model;
pub mod mtset;
pub mod regularize;
pub mod vd;

pub use error::{Result, VdError};
pub use input::{InputData, VarianceDecompositionInput};
pub use model::{FitOptions, NullModelFit, NullModelFitter};
pub use mtset::{MtSetReml, MtSetRemlConfig};
pub use regularize::{regularize, regularize_with_floor, Regularized};
pub use vd::{vd_reml, vd_reml_with, VarianceDecomposition, VdRemlConfig};
