//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - the measured input series (`FrequencySeries`)
//! - model identifiers and concrete configurations (`ModelKind`, `ModelConfig`)
//! - derived fit outputs (`FitStatistics`, `ResidualDiagnostics`)

pub mod types;

pub use types::*;
