//! Solver options.
//!
//! Everything here is plain data with `Default` and serde support, so the
//! application layer can load it from a config file. The cancellation token
//! is runtime-only and never serialized.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Violation;
use crate::fit::loss::LossKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Damped Gauss–Newton with adaptive damping.
    #[default]
    LevenbergMarquardt,
    /// Undamped Gauss–Newton steps with step halving.
    GaussNewton,
}

/// Per-frequency weighting of residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyWeighting {
    #[default]
    Uniform,
    /// Proportional to local log-frequency spacing (inverse sampling density),
    /// normalised to mean 1.
    LogSpacing,
    /// `1/|ε*|` of the measured point (relative error), normalised to mean 1.
    Magnitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weighting {
    pub frequency: FrequencyWeighting,
    pub real_weight: f64,
    pub imag_weight: f64,
}

impl Default for Weighting {
    fn default() -> Self {
        Self {
            frequency: FrequencyWeighting::Uniform,
            real_weight: 1.0,
            imag_weight: 1.0,
        }
    }
}

/// Where multistart runs begin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPlan {
    /// Start 0 is the unperturbed initial guess; starts `1..count` perturb it
    /// with Gaussian noise in internal (transformed) units.
    Random { count: usize, seed: u64 },
    /// Caller-supplied full parameter vectors in layout order.
    Explicit(Vec<Vec<f64>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultistartOptions {
    /// Tag shared by every sibling session.
    pub group_id: String,
    pub seeds: SeedPlan,
    /// Worker threads; `None` uses the machine's parallelism.
    pub concurrency: Option<usize>,
}

impl Default for MultistartOptions {
    fn default() -> Self {
        Self {
            group_id: "multistart".to_string(),
            seeds: SeedPlan::Random { count: 5, seed: 0 },
            concurrency: None,
        }
    }
}

/// Cooperative cancellation flag shared between a caller and running sessions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub algorithm: Algorithm,
    pub loss: LossKind,
    pub loss_scale: f64,
    pub max_iterations: usize,
    /// Shared gradient / step / cost tolerance.
    pub tolerance: f64,
    pub weighting: Weighting,
    pub multistart: Option<MultistartOptions>,
    /// Wall-clock budget per session.
    pub timeout_ms: Option<u64>,
    #[serde(skip)]
    pub cancel: Option<CancelToken>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::LevenbergMarquardt,
            loss: LossKind::Linear,
            loss_scale: 1.0,
            max_iterations: 200,
            tolerance: 1e-8,
            weighting: Weighting::default(),
            multistart: None,
            timeout_ms: None,
            cancel: None,
        }
    }
}

impl SolverOptions {
    /// Check option values; an empty list means they are usable.
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        if !(self.loss_scale.is_finite() && self.loss_scale > 0.0) {
            out.push(Violation::for_parameter("loss_scale", "must be positive and finite"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            out.push(Violation::for_parameter("tolerance", "must be positive and finite"));
        }
        if self.max_iterations == 0 {
            out.push(Violation::for_parameter("max_iterations", "must be at least 1"));
        }
        let w = &self.weighting;
        let weights_ok = [w.real_weight, w.imag_weight]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0);
        if !weights_ok || w.real_weight + w.imag_weight <= 0.0 {
            out.push(Violation::for_parameter(
                "weighting",
                "component weights must be non-negative and not both zero",
            ));
        }
        if let Some(ms) = &self.multistart {
            match &ms.seeds {
                SeedPlan::Random { count, .. } if *count == 0 => {
                    out.push(Violation::for_parameter("multistart", "seed count must be at least 1"));
                }
                SeedPlan::Explicit(seeds) if seeds.is_empty() => {
                    out.push(Violation::for_parameter("multistart", "no explicit seeds supplied"));
                }
                _ => {}
            }
            if ms.concurrency == Some(0) {
                out.push(Violation::for_parameter("multistart", "concurrency must be at least 1"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SolverOptions::default().validate().is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts: SolverOptions =
            serde_json::from_str(r#"{"loss":"soft_l1","loss_scale":0.05,"weighting":{"frequency":"log_spacing"}}"#)
                .unwrap();
        assert_eq!(opts.loss, LossKind::SoftL1);
        assert_eq!(opts.max_iterations, 200);
        assert_eq!(opts.weighting.frequency, FrequencyWeighting::LogSpacing);
        assert_eq!(opts.weighting.imag_weight, 1.0);
        assert!(opts.cancel.is_none());
    }

    #[test]
    fn bad_values_are_reported() {
        let opts = SolverOptions {
            loss_scale: 0.0,
            max_iterations: 0,
            multistart: Some(MultistartOptions {
                seeds: SeedPlan::Random { count: 0, seed: 1 },
                ..MultistartOptions::default()
            }),
            ..SolverOptions::default()
        };
        assert_eq!(opts.validate().len(), 3);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }
}
