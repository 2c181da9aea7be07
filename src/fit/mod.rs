//! Batched cosine fitting and the single-funnel dipole model.

pub mod cosine;
pub mod funnel;

pub use cosine::{ColumnFit, CosineFit, fit_columns};
pub use funnel::FunnelFit;
