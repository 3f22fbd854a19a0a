//! Mathematical utilities: least squares, grids, peaks and statistics.

pub mod grid;
pub mod ols;
pub mod peaks;
pub mod stats;

pub use grid::*;
pub use ols::*;
pub use peaks::*;
pub use stats::*;
