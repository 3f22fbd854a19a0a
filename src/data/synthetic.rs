//! Synthetic permittivity series from a model configuration.
//!
//! Used by tests and by callers that want a known-truth series for
//! validating a pipeline. Noise is seeded, so the same inputs always produce
//! the same series.

use std::f64::consts::PI;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{FrequencySeries, ModelConfig};
use crate::error::{EngineError, Result};
use crate::math::log_space;
use crate::models::evaluate_config;

/// Evaluate `config` on `frequency_hz` and add independent Gaussian noise
/// (standard deviation `noise_sigma`) to both `ε′` and `ε″`.
pub fn synthesize(
    config: &ModelConfig,
    frequency_hz: &[f64],
    noise_sigma: f64,
    seed: u64,
) -> Result<FrequencySeries> {
    if !(noise_sigma.is_finite() && noise_sigma >= 0.0) {
        return Err(EngineError::invalid_config(format!(
            "noise sigma must be finite and non-negative, got {noise_sigma}"
        )));
    }
    let omega: Vec<f64> = frequency_hz.iter().map(|f| 2.0 * PI * f).collect();
    let eps = evaluate_config(config, &omega)?;

    let mut real: Vec<f64> = eps.iter().map(|e| e.re).collect();
    let mut imag: Vec<f64> = eps.iter().map(|e| -e.im).collect();

    if noise_sigma > 0.0 {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, noise_sigma)
            .map_err(|e| EngineError::invalid_config(format!("noise distribution error: {e}")))?;
        for (re, im) in real.iter_mut().zip(imag.iter_mut()) {
            *re += normal.sample(&mut rng);
            *im += normal.sample(&mut rng);
        }
    }

    FrequencySeries::new(frequency_hz.to_vec(), real, imag)
}

/// Frequencies in Hz whose angular frequencies are log-spaced over
/// `[omega_min, omega_max]` rad/s.
pub fn angular_log_grid(omega_min: f64, omega_max: f64, steps: usize) -> Result<Vec<f64>> {
    Ok(log_space(omega_min, omega_max, steps)?
        .into_iter()
        .map(|w| w / (2.0 * PI))
        .collect())
}
