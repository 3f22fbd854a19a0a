//! Frequency grid helpers.

use crate::error::{EngineError, Result};

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(EngineError::InvalidGrid(format!(
            "invalid range: min={min}, max={max} (must be finite, >0, and max>min)"
        )));
    }
    if steps < 2 {
        return Err(EngineError::InsufficientData {
            needed: 2,
            got: steps,
        });
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    // Pin the endpoints exactly; exp(ln(x)) can drift by an ulp.
    out[0] = min;
    out[steps - 1] = max;
    Ok(out)
}

/// Spacing of each point in `ln(x)`: half the distance to its neighbours
/// (one-sided at the ends).
pub fn log_spacing(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n < 2 {
        return vec![1.0; n];
    }
    let lx: Vec<f64> = x.iter().map(|v| v.ln()).collect();
    (0..n)
        .map(|i| {
            if i == 0 {
                lx[1] - lx[0]
            } else if i == n - 1 {
                lx[n - 1] - lx[n - 2]
            } else {
                0.5 * (lx[i + 1] - lx[i - 1])
            }
        })
        .collect()
}
