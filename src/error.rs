//! Engine error taxonomy.
//!
//! Validation errors (`InvalidGrid`, `InsufficientData`, `InvalidConfig`,
//! `DegenerateFit`) are returned before any optimizer work starts. Errors that
//! happen while a session is running are recorded on the session itself and
//! only surface here when a caller asks for them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One problem found while validating a model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Offending parameter name, if the problem is tied to one.
    pub parameter: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            parameter: None,
            message: message.into(),
        }
    }

    pub fn for_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parameter: Some(parameter.into()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parameter {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid frequency grid: {0}")]
    InvalidGrid(String),

    #[error("insufficient data: need at least {needed} points, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("invalid model configuration: {}", join_violations(.0))]
    InvalidConfig(Vec<Violation>),

    #[error("degenerate fit: {points} data values for {free_parameters} free parameters")]
    DegenerateFit {
        points: usize,
        free_parameters: usize,
    },

    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("deadline exceeded after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Fieldless error kind, suitable for persisting next to a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidGrid,
    InsufficientData,
    InvalidConfig,
    DegenerateFit,
    NumericalFailure,
    Timeout,
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidGrid(_) => ErrorKind::InvalidGrid,
            EngineError::InsufficientData { .. } => ErrorKind::InsufficientData,
            EngineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            EngineError::DegenerateFit { .. } => ErrorKind::DegenerateFit,
            EngineError::NumericalFailure(_) => ErrorKind::NumericalFailure,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Short hint shown to users next to the error kind.
    pub fn remediation(&self) -> &'static str {
        self.kind().remediation()
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig(vec![Violation::new(message)])
    }
}

impl ErrorKind {
    pub fn remediation(self) -> &'static str {
        match self {
            ErrorKind::InvalidGrid => {
                "sort and deduplicate frequencies; all frequencies must be positive and finite"
            }
            ErrorKind::InsufficientData => "supply more frequency points",
            ErrorKind::InvalidConfig => "check parameter bounds, tie groups and model constraints",
            ErrorKind::DegenerateFit => "reduce pole count or fix some parameters",
            ErrorKind::NumericalFailure => {
                "tighten bounds, change initial values or switch to a robust loss"
            }
            ErrorKind::Timeout => "raise the deadline or lower max_iterations",
            ErrorKind::Cancelled => "re-run the fit",
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_every_violation() {
        let err = EngineError::InvalidConfig(vec![
            Violation::for_parameter("alpha", "must lie in (0, 1]"),
            Violation::new("tie group 'g' mixes transforms"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("alpha: must lie in (0, 1]"));
        assert!(msg.contains("tie group 'g' mixes transforms"));
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn degenerate_fit_suggests_fewer_poles() {
        let err = EngineError::DegenerateFit {
            points: 4,
            free_parameters: 5,
        };
        assert!(err.remediation().contains("reduce pole count"));
    }
}
