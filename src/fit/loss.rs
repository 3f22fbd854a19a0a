//! Robust loss functions.
//!
//! Conventions follow the usual robust least-squares formulation: for a
//! residual `r` and scale `s`, let `z = (r/s)²`; the cost is
//! `C = ½ s² Σ ρ(z)`. With this scaling `huber` gives `r²` inside the scale and
//! `2s|r| − s²` outside, and `linear` is plain least squares.
//!
//! The solver handles a robust loss by iteratively reweighting: residuals and
//! Jacobian rows are multiplied by `√ρ′(z)` before each step.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Linear,
    Huber,
    SoftL1,
    Cauchy,
    Arctan,
}

impl LossKind {
    /// `(ρ(z), ρ′(z))` for `z ≥ 0`.
    pub fn rho(self, z: f64) -> (f64, f64) {
        match self {
            LossKind::Linear => (z, 1.0),
            LossKind::Huber => {
                if z <= 1.0 {
                    (z, 1.0)
                } else {
                    let s = z.sqrt();
                    (2.0 * s - 1.0, 1.0 / s)
                }
            }
            LossKind::SoftL1 => {
                let t = (1.0 + z).sqrt();
                (2.0 * (t - 1.0), 1.0 / t)
            }
            LossKind::Cauchy => ((1.0 + z).ln(), 1.0 / (1.0 + z)),
            LossKind::Arctan => (z.atan(), 1.0 / (1.0 + z * z)),
        }
    }

    /// `½ s² Σ ρ((r/s)²)`.
    pub fn cost(self, residuals: &[f64], scale: f64) -> f64 {
        let s2 = scale * scale;
        0.5 * s2 * residuals.iter().map(|r| self.rho(r * r / s2).0).sum::<f64>()
    }

    /// Row weights `√ρ′(z)` for iteratively reweighted steps.
    pub fn irls_weights(self, residuals: &[f64], scale: f64) -> Vec<f64> {
        let s2 = scale * scale;
        residuals
            .iter()
            .map(|r| self.rho(r * r / s2).1.sqrt())
            .collect()
    }
}
