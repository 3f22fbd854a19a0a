//! Fitting sessions: one optimizer run and its outcome.
//!
//! Lifecycle: `Pending → Running → {Completed | Failed | Cancelled}`. The
//! transition methods are crate-private and refuse to leave a terminal state,
//! so a finished session handed to callers is effectively immutable. Failed
//! and cancelled sessions never carry fitted parameters or curves.

use serde::{Deserialize, Serialize};

use crate::domain::{ModelConfig, ModelKind};
use crate::error::{EngineError, ErrorKind, Result};
use crate::fit::options::SolverOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ConvergenceReason {
    /// Projected gradient norm below tolerance.
    Gradient,
    /// Step (or achievable step) below tolerance.
    StepSize,
    /// Relative cost reduction below tolerance.
    CostReduction,
    /// `max_iterations` reached; the session still completes.
    IterationLimit,
    Timeout { elapsed_ms: u64 },
    Cancelled,
    NumericalFailure(String),
}

impl ConvergenceReason {
    /// A recognized convergence criterion was met.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            ConvergenceReason::Gradient
                | ConvergenceReason::StepSize
                | ConvergenceReason::CostReduction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedParameter {
    pub name: String,
    pub value: f64,
    /// `None` when the covariance could not be estimated reliably.
    pub std_error: Option<f64>,
    pub lower: f64,
    pub upper: f64,
    pub vary: bool,
    pub tie_group: Option<String>,
}

/// One row of the fitted curve, ready for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPoint {
    pub frequency_hz: f64,
    pub real_fit: f64,
    pub imag_fit: f64,
    pub dk_fit: f64,
    pub tan_delta_fit: f64,
    pub residual_real: f64,
    pub residual_imag: f64,
}

/// Everything a completed run produces.
#[derive(Debug, Clone)]
pub(crate) struct SessionOutcome {
    pub reason: ConvergenceReason,
    pub fitted: ModelConfig,
    pub parameters: Vec<FittedParameter>,
    pub covariance: Option<Vec<Vec<f64>>>,
    pub curve: Vec<FittedPoint>,
    pub weighted_residuals: Vec<f64>,
    pub weights: Vec<f64>,
    pub iterations: usize,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittingSession {
    model: ModelKind,
    config: ModelConfig,
    options: SolverOptions,
    frequency_hz: Vec<f64>,
    n_free: usize,
    start_seed: Option<usize>,
    group_id: Option<String>,

    status: SessionStatus,
    reason: Option<ConvergenceReason>,
    error_kind: Option<ErrorKind>,
    fitted: Option<ModelConfig>,
    parameters: Vec<FittedParameter>,
    /// Slot-by-slot covariance of the external parameters (zero rows for fixed ones).
    covariance: Option<Vec<Vec<f64>>>,
    curve: Vec<FittedPoint>,
    /// Stacked `[real..., imag...]` residuals after frequency/component weighting.
    weighted_residuals: Vec<f64>,
    /// Stacked weights matching `weighted_residuals`.
    weights: Vec<f64>,
    iterations: usize,
    runtime_ms: u64,
    cost: f64,
}

impl FittingSession {
    pub(crate) fn pending(
        config: ModelConfig,
        options: SolverOptions,
        frequency_hz: Vec<f64>,
        n_free: usize,
    ) -> Self {
        Self {
            model: config.model,
            config,
            options,
            frequency_hz,
            n_free,
            start_seed: None,
            group_id: None,
            status: SessionStatus::Pending,
            reason: None,
            error_kind: None,
            fitted: None,
            parameters: Vec::new(),
            covariance: None,
            curve: Vec::new(),
            weighted_residuals: Vec::new(),
            weights: Vec::new(),
            iterations: 0,
            runtime_ms: 0,
            cost: f64::NAN,
        }
    }

    pub(crate) fn tag(&mut self, group_id: Option<String>, start_seed: Option<usize>) {
        self.group_id = group_id;
        self.start_seed = start_seed;
    }

    pub(crate) fn start(&mut self) {
        if self.status == SessionStatus::Pending {
            self.status = SessionStatus::Running;
        }
    }

    pub(crate) fn complete(&mut self, outcome: SessionOutcome, runtime_ms: u64) {
        if self.status != SessionStatus::Running {
            return;
        }
        self.status = SessionStatus::Completed;
        self.reason = Some(outcome.reason);
        self.fitted = Some(outcome.fitted);
        self.parameters = outcome.parameters;
        self.covariance = outcome.covariance;
        self.curve = outcome.curve;
        self.weighted_residuals = outcome.weighted_residuals;
        self.weights = outcome.weights;
        self.iterations = outcome.iterations;
        self.cost = outcome.cost;
        self.runtime_ms = runtime_ms;
    }

    pub(crate) fn fail(&mut self, reason: ConvergenceReason, iterations: usize, runtime_ms: u64) {
        if self.status != SessionStatus::Running {
            return;
        }
        self.error_kind = Some(match reason {
            ConvergenceReason::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::NumericalFailure,
        });
        self.status = SessionStatus::Failed;
        self.reason = Some(reason);
        self.iterations = iterations;
        self.runtime_ms = runtime_ms;
    }

    pub(crate) fn cancel(&mut self, iterations: usize, runtime_ms: u64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Cancelled;
        self.reason = Some(ConvergenceReason::Cancelled);
        self.error_kind = Some(ErrorKind::Cancelled);
        self.iterations = iterations;
        self.runtime_ms = runtime_ms;
    }

    pub fn model(&self) -> ModelKind {
        self.model
    }

    /// Configuration the run started from (after initial-guess seeding).
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn convergence_reason(&self) -> Option<&ConvergenceReason> {
        self.reason.as_ref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Completed with a recognized convergence criterion.
    pub fn success(&self) -> bool {
        self.status == SessionStatus::Completed
            && self.reason.as_ref().is_some_and(|r| r.is_converged())
    }

    /// Fitted configuration (completed sessions only).
    pub fn fitted_config(&self) -> Option<&ModelConfig> {
        self.fitted.as_ref()
    }

    pub fn parameters(&self) -> &[FittedParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&FittedParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn covariance(&self) -> Option<&Vec<Vec<f64>>> {
        self.covariance.as_ref()
    }

    pub fn curve(&self) -> &[FittedPoint] {
        &self.curve
    }

    pub fn frequency_hz(&self) -> &[f64] {
        &self.frequency_hz
    }

    /// Unweighted residuals stacked as `[real..., imag...]`.
    pub fn residuals(&self) -> Vec<f64> {
        self.curve
            .iter()
            .map(|p| p.residual_real)
            .chain(self.curve.iter().map(|p| p.residual_imag))
            .collect()
    }

    pub fn weighted_residuals(&self) -> &[f64] {
        &self.weighted_residuals
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn runtime_ms(&self) -> u64 {
        self.runtime_ms
    }

    /// Final robust cost `½ s² Σ ρ`.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Number of residual values (two per frequency point).
    pub fn n_values(&self) -> usize {
        2 * self.frequency_hz.len()
    }

    pub fn n_free(&self) -> usize {
        self.n_free
    }

    pub fn start_seed(&self) -> Option<usize> {
        self.start_seed
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// The session itself if it completed, otherwise the error that ended it.
    pub fn require_completed(&self) -> Result<&Self> {
        match self.status {
            SessionStatus::Completed => Ok(self),
            SessionStatus::Cancelled => Err(EngineError::Cancelled),
            SessionStatus::Failed => Err(match &self.reason {
                Some(ConvergenceReason::Timeout { elapsed_ms }) => EngineError::Timeout {
                    elapsed_ms: *elapsed_ms,
                },
                Some(ConvergenceReason::NumericalFailure(msg)) => {
                    EngineError::NumericalFailure(msg.clone())
                }
                _ => EngineError::NumericalFailure("session failed".to_string()),
            }),
            SessionStatus::Pending | SessionStatus::Running => Err(EngineError::NumericalFailure(
                "session has not finished".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::default_config;

    fn pending() -> FittingSession {
        let cfg = default_config(ModelKind::Debye, 1).unwrap();
        FittingSession::pending(cfg, SolverOptions::default(), vec![1.0, 2.0, 3.0], 3)
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut s = pending();
        s.start();
        s.cancel(0, 1);
        s.fail(ConvergenceReason::NumericalFailure("late".into()), 4, 2);
        assert_eq!(s.status(), SessionStatus::Cancelled);
        assert_eq!(s.convergence_reason(), Some(&ConvergenceReason::Cancelled));
        assert!(s.parameters().is_empty());
        assert!(matches!(s.require_completed(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn timeout_maps_to_timeout_error() {
        let mut s = pending();
        s.start();
        s.fail(ConvergenceReason::Timeout { elapsed_ms: 12 }, 3, 12);
        assert_eq!(s.status(), SessionStatus::Failed);
        assert_eq!(s.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(
            s.require_completed().unwrap_err(),
            EngineError::Timeout { elapsed_ms: 12 }
        );
    }

    #[test]
    fn reason_serializes_with_tag() {
        let json = serde_json::to_string(&ConvergenceReason::NumericalFailure("nan".into())).unwrap();
        assert_eq!(json, r#"{"reason":"numerical_failure","detail":"nan"}"#);
        let json = serde_json::to_string(&ConvergenceReason::Gradient).unwrap();
        assert_eq!(json, r#"{"reason":"gradient"}"#);
    }
}
