//! Discrete Kramers–Kronig operator on an arbitrary increasing grid.
//!
//! For angular frequencies `ω[0..N)` the operator stores:
//!
//! - trapezoidal quadrature weights `dw` (one-sided at the ends, centred inside)
//! - the kernel `H[i][j] = (2/π)·ω_j·dw_j / (ω_j² − ω_i²)` with a zero diagonal
//! - the row sums `c_i = Σ_{j≠i} H[i][j]·ω_i/ω_j` used by the subtracted
//!   principal-value mode
//!
//! Loss is positive (`ε* = ε′ − iε″`), so
//!
//! ```text
//! ε′(ω) − ε∞ =  (2/π)  PV ∫ x ε″(x) / (x² − ω²) dx
//! ε″(ω)      = −(2ω/π) PV ∫ (ε′(x) − ε∞) / (x² − ω²) dx
//! ```
//!
//! The zero-diagonal rule drops the singular self term. The subtracted rule
//! uses `PV ∫ dx / (x² − ω²) = 0` to subtract the value at the singular point
//! first, which removes most of the edge error on finite bands.

use std::f64::consts::FRAC_2_PI;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Treatment of the principal-value singularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalValue {
    /// Drop the diagonal term.
    #[default]
    ZeroDiagonal,
    /// Subtract the integrand's value at the singular point before summing.
    Subtracted,
}

#[derive(Debug, Clone)]
pub struct KkOperator {
    omega: Vec<f64>,
    weights: Vec<f64>,
    kernel: DMatrix<f64>,
    correction: Vec<f64>,
}

impl KkOperator {
    /// Build the operator for angular frequencies `omega` (rad/s).
    pub fn new(omega: &[f64]) -> Result<Self> {
        let n = omega.len();
        if n < 3 {
            return Err(EngineError::InsufficientData { needed: 3, got: n });
        }
        if omega.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(EngineError::InvalidGrid(
                "angular frequencies must be positive and finite".to_string(),
            ));
        }
        if omega.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EngineError::InvalidGrid(
                "angular frequencies must be strictly increasing".to_string(),
            ));
        }

        let weights = quadrature_weights(omega);
        let kernel = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                0.0
            } else {
                let (wi, wj) = (omega[i], omega[j]);
                FRAC_2_PI * wj * weights[j] / (wj * wj - wi * wi)
            }
        });
        let correction = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i)
                    .map(|j| kernel[(i, j)] * omega[i] / omega[j])
                    .sum()
            })
            .collect();

        Ok(Self {
            omega: omega.to_vec(),
            weights,
            kernel,
            correction,
        })
    }

    pub fn len(&self) -> usize {
        self.omega.len()
    }

    pub fn is_empty(&self) -> bool {
        self.omega.is_empty()
    }

    pub fn omega(&self) -> &[f64] {
        &self.omega
    }

    pub fn quadrature_weights(&self) -> &[f64] {
        &self.weights
    }

    /// Zero-diagonal kernel `H`.
    pub fn kernel(&self) -> &DMatrix<f64> {
        &self.kernel
    }

    /// Reconstruct `ε′` from the loss: `offset + H·ε″` (plus the subtraction
    /// term in [`PrincipalValue::Subtracted`] mode).
    pub fn real_from_imag(&self, imag: &[f64], offset: f64, pv: PrincipalValue) -> Result<Vec<f64>> {
        self.check_len(imag)?;
        let f = DVector::from_column_slice(imag);
        let hf = &self.kernel * &f;
        Ok((0..self.len())
            .map(|i| match pv {
                PrincipalValue::ZeroDiagonal => offset + hf[i],
                PrincipalValue::Subtracted => offset + hf[i] - imag[i] * self.correction[i],
            })
            .collect())
    }

    /// Reconstruct the loss `ε″` from `ε′` with high-frequency limit `eps_inf`.
    ///
    /// In subtracted mode `eps_inf` cancels out of the sum.
    pub fn imag_from_real(&self, real: &[f64], eps_inf: f64, pv: PrincipalValue) -> Result<Vec<f64>> {
        self.check_len(real)?;
        let n = self.len();
        let mut out = vec![0.0; n];
        for (i, o) in out.iter_mut().enumerate() {
            let wi = self.omega[i];
            let mut acc = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                // G_ij = −(ω_i/ω_j)·H_ij
                let g = -(wi / self.omega[j]) * self.kernel[(i, j)];
                acc += match pv {
                    PrincipalValue::ZeroDiagonal => g * (real[j] - eps_inf),
                    PrincipalValue::Subtracted => g * (real[j] - real[i]),
                };
            }
            *o = acc;
        }
        Ok(out)
    }

    /// Singly-subtractive KK: reconstruct `ε′` relative to a trusted value at
    /// `anchor`, using
    /// `H'[i][j] = (2/π)(ω_i² − ω_a²)ω_j dw_j / ((ω_j² − ω_i²)(ω_j² − ω_a²))`
    /// with `j ∉ {i, a}`.
    pub fn real_from_imag_anchored(&self, imag: &[f64], anchor: usize, anchor_value: f64) -> Result<Vec<f64>> {
        self.check_len(imag)?;
        let n = self.len();
        if anchor >= n {
            return Err(EngineError::InvalidGrid(format!(
                "anchor index {anchor} out of range for {n} points"
            )));
        }
        let wa2 = self.omega[anchor].powi(2);
        Ok((0..n)
            .map(|i| {
                let wi2 = self.omega[i].powi(2);
                let sum: f64 = (0..n)
                    .filter(|&j| j != i && j != anchor)
                    .map(|j| {
                        let wj = self.omega[j];
                        let wj2 = wj * wj;
                        FRAC_2_PI * (wi2 - wa2) * wj * self.weights[j] / ((wj2 - wi2) * (wj2 - wa2))
                            * imag[j]
                    })
                    .sum();
                anchor_value + sum
            })
            .collect())
    }

    fn check_len(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(EngineError::InvalidGrid(format!(
                "operator built for {} points, got {}",
                self.len(),
                values.len()
            )));
        }
        Ok(())
    }
}

/// Trapezoidal weights on a non-uniform grid.
fn quadrature_weights(omega: &[f64]) -> Vec<f64> {
    let n = omega.len();
    (0..n)
        .map(|i| {
            if i == 0 {
                omega[1] - omega[0]
            } else if i == n - 1 {
                omega[n - 1] - omega[n - 2]
            } else {
                0.5 * (omega[i + 1] - omega[i - 1])
            }
        })
        .collect()
}
