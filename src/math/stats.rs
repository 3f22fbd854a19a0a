//! Descriptive statistics and the distribution helpers used by diagnostics.
//!
//! Normal-distribution helpers go through `statrs` special functions
//! (`erfc`, `erfc_inv`), which never fail; the Student-t quantile goes through
//! `statrs::distribution::StudentsT` and returns `None` for invalid degrees of
//! freedom.

use std::f64::consts::SQRT_2;

use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::{erfc, erfc_inv};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut v = values.to_vec();
    median_mut(&mut v)
}

/// Median of `values`, sorting them in place.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Quantile with linear interpolation between order statistics (`q` in [0, 1]).
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (v.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(v[lo] + (v[hi] - v[lo]) * frac)
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal quantile (inverse CDF), `p` in (0, 1).
pub fn normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// Student-t quantile with `df` degrees of freedom.
pub fn student_t_quantile(p: f64, df: f64) -> Option<f64> {
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let q = dist.inverse_cdf(p);
    q.is_finite().then_some(q)
}

/// Durbin–Watson statistic; `2.0` means no first-order autocorrelation.
pub fn durbin_watson(e: &[f64]) -> f64 {
    let ss: f64 = e.iter().map(|v| v * v).sum();
    if ss <= 0.0 {
        return 2.0;
    }
    let diff: f64 = e.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    diff / ss
}

/// Lag-1 sample autocorrelation.
pub fn lag1_autocorrelation(e: &[f64]) -> f64 {
    let Some(m) = mean(e) else {
        return 0.0;
    };
    let den: f64 = e.iter().map(|v| (v - m).powi(2)).sum();
    if den <= 0.0 {
        return 0.0;
    }
    let num: f64 = e.windows(2).map(|w| (w[1] - m) * (w[0] - m)).sum();
    num / den
}

/// Two-sided Wald–Wolfowitz runs test on the signs of `e` (zeros ignored).
///
/// Returns the p-value under the hypothesis that signs occur in random order.
/// A sequence with only one sign present is maximally non-random (`0.0`).
pub fn runs_test_p_value(e: &[f64]) -> f64 {
    let signs: Vec<bool> = e.iter().filter(|v| **v != 0.0).map(|v| *v > 0.0).collect();
    let n1 = signs.iter().filter(|s| **s).count() as f64;
    let n2 = signs.len() as f64 - n1;
    if signs.len() < 2 {
        return 1.0;
    }
    if n1 == 0.0 || n2 == 0.0 {
        return 0.0;
    }
    let runs = 1 + signs.windows(2).filter(|w| w[0] != w[1]).count();
    let n = n1 + n2;
    let mu = 2.0 * n1 * n2 / n + 1.0;
    let var = 2.0 * n1 * n2 * (2.0 * n1 * n2 - n) / (n * n * (n - 1.0));
    if var <= 0.0 {
        return 1.0;
    }
    let z = (runs as f64 - mu) / var.sqrt();
    erfc(z.abs() / SQRT_2)
}

/// Shapiro–Francia normality test: Q–Q correlation `W'` and its p-value
/// (Royston's log-normal approximation). Needs at least 5 values with
/// non-zero spread.
pub fn shapiro_francia(values: &[f64]) -> Option<(f64, f64)> {
    let n = values.len();
    if n < 5 {
        return None;
    }
    let mut x = values.to_vec();
    x.sort_by(|a, b| a.total_cmp(b));
    let nf = n as f64;
    let m: Vec<f64> = (0..n)
        .map(|i| normal_quantile((i as f64 + 1.0 - 0.375) / (nf + 0.25)))
        .collect();
    let xbar = mean(&x)?;
    let sxx: f64 = x.iter().map(|v| (v - xbar).powi(2)).sum();
    let smm: f64 = m.iter().map(|v| v * v).sum();
    if sxx <= 0.0 || smm <= 0.0 {
        return None;
    }
    let smx: f64 = m.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
    let w = (smx * smx / (smm * sxx)).min(1.0);
    if w >= 1.0 {
        return Some((w, 1.0));
    }
    let u = nf.ln();
    let v = u.ln();
    let mu = -1.2725 + 1.0521 * (v - u);
    let sigma = 1.0308 - 0.26758 * (v + 2.0 / u);
    let z = ((1.0 - w).ln() - mu) / sigma;
    Some((w, 1.0 - normal_cdf(z)))
}
