//! Kramers–Kronig transform and causality validation.
//!
//! - `operator`: discrete principal-value kernels on arbitrary grids
//! - `validate`: reconstruction, residuals and causality reports

pub mod operator;
pub mod validate;

pub use operator::*;
pub use validate::*;
