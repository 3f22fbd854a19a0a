//! Post-fit diagnostics and model ranking.
//!
//! - `statistics`: goodness of fit, residual-structure tests, parameter
//!   correlation and confidence intervals for completed sessions
//! - `autosuggest`: heuristic ranking of model families for a raw series

pub mod autosuggest;
pub mod statistics;

pub use autosuggest::*;
pub use statistics::*;
