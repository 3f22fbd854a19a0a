//! KK validation of measured series and fitted model curves.
//!
//! `kk_transform` is the raw reconstruction (counterpart + residuals).
//! `validate_series` wraps it with the derived report fields: relative
//! errors, a pass/fail causality verdict, and a few grid diagnostics.
//!
//! Both functions treat their input the same way whether it was measured or
//! produced by a model.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{FrequencySeries, ModelConfig};
use crate::error::{EngineError, Result, Violation};
use crate::kk::operator::{KkOperator, PrincipalValue};
use crate::math::{find_peaks, linear_fit, mean, median, quantile};
use crate::models::{evaluate, ParameterLayout, ParameterRole, slots, VACUUM_PERMITTIVITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KkDirection {
    /// Reconstruct `ε′` from `ε″`.
    #[default]
    RealFromImag,
    /// Reconstruct `ε″` from `ε′`.
    ImagFromReal,
}

/// How `ε∞` is estimated when the caller does not supply it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpsInfMethod {
    /// Mean of `ε′` over the high-frequency tail.
    #[default]
    Mean,
    /// Intercept of a straight-line fit of `ε′` against `1/f²` over the tail.
    Fit,
}

/// Quadrature variant that produced a [`KkResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KkMethod {
    ZeroDiagonal,
    Subtracted,
    Sskk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalityStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KkOptions {
    pub direction: KkDirection,
    pub principal_value: PrincipalValue,
    /// Use the singly-subtractive transform (real-part reconstruction only).
    pub sskk: bool,
    /// SSKK anchor; defaults to the median index `N / 2`.
    pub anchor_index: Option<usize>,
    /// Known `ε∞`; estimated from the tail when absent.
    pub eps_inf: Option<f64>,
    pub eps_inf_method: EpsInfMethod,
    /// Fraction of points (highest frequencies) forming the tail.
    pub tail_fraction: f64,
    pub min_tail_points: usize,
    /// Mean relative error below which a series passes.
    pub causality_threshold: f64,
    /// DC conductivity (S/m) removed from `ε″` before transforming.
    pub conductivity: Option<f64>,
}

impl Default for KkOptions {
    fn default() -> Self {
        Self {
            direction: KkDirection::RealFromImag,
            principal_value: PrincipalValue::ZeroDiagonal,
            sskk: false,
            anchor_index: None,
            eps_inf: None,
            eps_inf_method: EpsInfMethod::Mean,
            tail_fraction: 0.1,
            min_tail_points: 3,
            causality_threshold: 0.05,
            conductivity: None,
        }
    }
}

impl KkOptions {
    /// Settings used for post-fit checks of a model curve: SSKK at the median
    /// anchor, which needs no `ε∞`.
    pub fn model_check() -> Self {
        Self {
            sskk: true,
            ..Self::default()
        }
    }

    /// Check option values; an empty list means they are usable.
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        if !(self.tail_fraction > 0.0 && self.tail_fraction <= 1.0) {
            out.push(Violation::for_parameter("tail_fraction", "must lie in (0, 1]"));
        }
        if self.min_tail_points == 0 {
            out.push(Violation::for_parameter("min_tail_points", "must be at least 1"));
        }
        if !(self.causality_threshold.is_finite() && self.causality_threshold > 0.0) {
            out.push(Violation::for_parameter("causality_threshold", "must be positive and finite"));
        }
        if self.eps_inf.is_some_and(|v| !v.is_finite()) {
            out.push(Violation::for_parameter("eps_inf", "must be finite"));
        }
        if self.conductivity.is_some_and(|v| !(v.is_finite() && v >= 0.0)) {
            out.push(Violation::for_parameter("conductivity", "must be finite and non-negative"));
        }
        if self.sskk && self.direction == KkDirection::ImagFromReal {
            out.push(Violation::for_parameter(
                "sskk",
                "subtractive anchoring applies to real-part reconstruction only",
            ));
        }
        out
    }
}

/// Anchor used by the subtractive variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KkAnchor {
    pub index: usize,
    pub frequency_hz: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KkResult {
    pub direction: KkDirection,
    pub method: KkMethod,
    pub frequency_hz: Vec<f64>,
    /// The component being checked (after conductivity removal for `ε″`).
    pub measured: Vec<f64>,
    pub reconstructed: Vec<f64>,
    /// `measured − reconstructed`.
    pub residuals: Vec<f64>,
    pub rmse: f64,
    pub max_abs_residual: f64,
    pub anchor: Option<KkAnchor>,
    pub eps_inf: f64,
    pub eps_inf_estimated: bool,
}

/// KK report for a measured series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KkValidation {
    pub result: KkResult,
    pub mean_relative_error: f64,
    pub median_relative_error: f64,
    pub p90_relative_error: f64,
    pub status: CausalityStatus,
    pub num_peaks: usize,
    pub is_uniform_grid: bool,
}

/// Reconstruct one component of `series` from the other.
pub fn kk_transform(series: &FrequencySeries, opts: &KkOptions) -> Result<KkResult> {
    let violations = opts.validate();
    if !violations.is_empty() {
        return Err(EngineError::InvalidConfig(violations));
    }
    let omega = series.angular_frequencies();
    let op = KkOperator::new(&omega)?;
    let n = series.len();
    let real = series.real_part();

    let mut imag = series.imag_part().to_vec();
    if let Some(sigma) = opts.conductivity {
        for (v, w) in imag.iter_mut().zip(&omega) {
            *v -= sigma / (VACUUM_PERMITTIVITY * w);
        }
    }

    let (eps_inf, eps_inf_estimated) = match opts.eps_inf {
        Some(v) => (v, false),
        None => (estimate_eps_inf(series, opts), true),
    };

    let (measured, reconstructed, method, anchor) = match opts.direction {
        KkDirection::RealFromImag if opts.sskk => {
            let a = opts.anchor_index.unwrap_or(n / 2);
            if a >= n {
                return Err(EngineError::InvalidGrid(format!(
                    "SSKK anchor index {a} out of range for {n} points"
                )));
            }
            let recon = op.real_from_imag_anchored(&imag, a, real[a])?;
            let anchor = KkAnchor {
                index: a,
                frequency_hz: series.frequency_hz()[a],
                value: real[a],
            };
            (real.to_vec(), recon, KkMethod::Sskk, Some(anchor))
        }
        KkDirection::RealFromImag => {
            let recon = op.real_from_imag(&imag, eps_inf, opts.principal_value)?;
            (real.to_vec(), recon, method_for(opts.principal_value), None)
        }
        KkDirection::ImagFromReal => {
            let recon = op.imag_from_real(real, eps_inf, opts.principal_value)?;
            (imag, recon, method_for(opts.principal_value), None)
        }
    };

    let residuals: Vec<f64> = measured
        .iter()
        .zip(&reconstructed)
        .map(|(m, r)| m - r)
        .collect();
    let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / n as f64).sqrt();
    let max_abs_residual = residuals.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
    if !rmse.is_finite() {
        return Err(EngineError::NumericalFailure(
            "KK reconstruction produced non-finite values".to_string(),
        ));
    }
    debug!("kk transform: {n} points, method {method:?}, rmse {rmse:.4e}");

    Ok(KkResult {
        direction: opts.direction,
        method,
        frequency_hz: series.frequency_hz().to_vec(),
        measured,
        reconstructed,
        residuals,
        rmse,
        max_abs_residual,
        anchor,
        eps_inf,
        eps_inf_estimated,
    })
}

fn method_for(pv: PrincipalValue) -> KkMethod {
    match pv {
        PrincipalValue::ZeroDiagonal => KkMethod::ZeroDiagonal,
        PrincipalValue::Subtracted => KkMethod::Subtracted,
    }
}

/// Estimate `ε∞` from the high-frequency tail of `ε′`.
pub fn estimate_eps_inf(series: &FrequencySeries, opts: &KkOptions) -> f64 {
    let n = series.len();
    let k = ((n as f64 * opts.tail_fraction).ceil() as usize)
        .max(opts.min_tail_points)
        .clamp(1, n.max(1));
    let real = &series.real_part()[n - k..];
    let tail_mean = mean(real).unwrap_or(0.0);

    match opts.eps_inf_method {
        EpsInfMethod::Mean => tail_mean,
        EpsInfMethod::Fit => {
            if k < 3 {
                warn!("eps_inf fit needs 3 tail points, got {k}; using tail mean");
                return tail_mean;
            }
            // Normalise 1/f² so the regression is well scaled.
            let x: Vec<f64> = series.frequency_hz()[n - k..]
                .iter()
                .map(|f| 1.0 / (f * f))
                .collect();
            let x_max = x.iter().cloned().fold(0.0_f64, f64::max);
            let x: Vec<f64> = x.iter().map(|v| v / x_max).collect();
            match linear_fit(&x, real) {
                Some((intercept, _)) if intercept.is_finite() => intercept,
                _ => {
                    warn!("eps_inf tail fit failed; using tail mean");
                    tail_mean
                }
            }
        }
    }
}

/// Full KK report for a series.
pub fn validate_series(series: &FrequencySeries, opts: &KkOptions) -> Result<KkValidation> {
    let result = kk_transform(series, opts)?;

    let abs_measured: Vec<f64> = result.measured.iter().map(|v| v.abs()).collect();
    let floor = (1e-6 * median(&abs_measured).unwrap_or(0.0)).max(1e-12);
    let rel: Vec<f64> = result
        .residuals
        .iter()
        .zip(&abs_measured)
        .map(|(r, m)| r.abs() / (m + floor))
        .collect();
    let mean_relative_error = mean(&rel).unwrap_or(0.0);
    let median_relative_error = median(&rel).unwrap_or(0.0);
    let p90_relative_error = quantile(&rel, 0.9).unwrap_or(0.0);

    let status = if mean_relative_error < opts.causality_threshold {
        CausalityStatus::Pass
    } else {
        CausalityStatus::Fail
    };

    Ok(KkValidation {
        result,
        mean_relative_error,
        median_relative_error,
        p90_relative_error,
        status,
        num_peaks: count_loss_peaks(series),
        is_uniform_grid: series.is_uniform_grid(),
    })
}

/// Number of loss-tangent maxima above 10 % of the largest value.
fn count_loss_peaks(series: &FrequencySeries) -> usize {
    let x: Vec<f64> = series.frequency_hz().iter().map(|f| f.log10()).collect();
    let tan_delta: Vec<f64> = series
        .loss_tangent()
        .into_iter()
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect();
    let max = tan_delta.iter().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return 0;
    }
    find_peaks(&x, &tan_delta, 0.1 * max).len()
}

/// KK-check a model's own curve on `frequency_hz`.
///
/// The model's DC conductivity is removed before transforming, and `ε∞` is
/// taken from the model when `opts` does not fix it.
pub fn validate_model_curve(
    config: &ModelConfig,
    frequency_hz: &[f64],
    opts: &KkOptions,
) -> Result<KkResult> {
    let layout = ParameterLayout::for_config(config);
    let mut values = config.values();
    if let Some(i) = layout.conductivity_index() {
        values[i] = 0.0;
    }
    let omega: Vec<f64> = frequency_hz
        .iter()
        .map(|f| 2.0 * std::f64::consts::PI * f)
        .collect();
    let eps = evaluate(config.model, &omega, &values, &layout)?;
    if eps.iter().any(|e| !e.re.is_finite() || !e.im.is_finite()) {
        return Err(EngineError::NumericalFailure(
            "model evaluation produced non-finite permittivity".to_string(),
        ));
    }
    let series = FrequencySeries::new(
        frequency_hz.to_vec(),
        eps.iter().map(|e| e.re).collect(),
        eps.iter().map(|e| -e.im).collect(),
    )?;

    let mut opts = opts.clone();
    opts.conductivity = None;
    if opts.eps_inf.is_none() {
        let offset = slots(config.model, config.num_terms, config.include_conductivity)
            .iter()
            .position(|s| s.spec.role == ParameterRole::Offset);
        opts.eps_inf = offset.map(|i| values[i]);
    }
    kk_transform(&series, &opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthesize;
    use crate::domain::ModelKind;
    use crate::math::log_space;
    use crate::models::{default_config, enable_conductivity};

    fn debye_series(f_min: f64, f_max: f64, n: usize) -> FrequencySeries {
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_value("eps_inf", 3.0).unwrap();
        cfg.set_value("delta_eps", 10.0).unwrap();
        cfg.set_value("tau", 1e-6).unwrap();
        let f = log_space(f_min, f_max, n).unwrap();
        synthesize(&cfg, &f, 0.0, 0).unwrap()
    }

    #[test]
    fn causal_debye_series_passes() {
        let two_pi = 2.0 * std::f64::consts::PI;
        let series = debye_series(1e5 / two_pi, 1e10 / two_pi, 200);
        let report = validate_series(&series, &KkOptions::default()).unwrap();
        assert_eq!(report.status, CausalityStatus::Pass);
        assert!(report.result.rmse < 0.1);
        assert!(report.result.eps_inf_estimated);
        assert!((report.result.eps_inf - 3.0).abs() < 0.01);
        assert_eq!(report.num_peaks, 1);
        assert!(!report.is_uniform_grid);
    }

    #[test]
    fn sskk_defaults_to_median_anchor() {
        let series = debye_series(1e4, 1e9, 101);
        let opts = KkOptions {
            sskk: true,
            ..KkOptions::default()
        };
        let result = kk_transform(&series, &opts).unwrap();
        let anchor = result.anchor.unwrap();
        assert_eq!(anchor.index, 50);
        assert_eq!(result.method, KkMethod::Sskk);
        assert_eq!(result.residuals[50], 0.0);
    }

    #[test]
    fn out_of_range_anchor_is_an_error() {
        let series = debye_series(1e4, 1e9, 20);
        let opts = KkOptions {
            sskk: true,
            anchor_index: Some(20),
            ..KkOptions::default()
        };
        assert!(matches!(kk_transform(&series, &opts), Err(EngineError::InvalidGrid(_))));
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let series = FrequencySeries::new(vec![1.0, 2.0], vec![3.0; 2], vec![0.1; 2]).unwrap();
        assert!(matches!(
            kk_transform(&series, &KkOptions::default()),
            Err(EngineError::InsufficientData { .. })
        ));
    }

    #[test]
    fn tail_fit_estimate_matches_mean_on_flat_tail() {
        let series = debye_series(1e2, 1e12, 60);
        let fit = KkOptions {
            eps_inf_method: EpsInfMethod::Fit,
            ..KkOptions::default()
        };
        let e = estimate_eps_inf(&series, &fit);
        assert!((e - 3.0).abs() < 1e-3);
    }

    #[test]
    fn model_curve_check_ignores_conductivity() {
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_value("delta_eps", 10.0).unwrap();
        enable_conductivity(&mut cfg);
        cfg.set_value("sigma_dc", 1e-4).unwrap();
        let two_pi = 2.0 * std::f64::consts::PI;
        let f = log_space(1e5 / two_pi, 1e10 / two_pi, 200).unwrap();
        let result = validate_model_curve(&cfg, &f, &KkOptions::model_check()).unwrap();
        assert!(result.rmse < 0.1);
    }

    #[test]
    fn bad_options_are_rejected_before_transforming() {
        let series = debye_series(1e4, 1e9, 20);
        let opts = KkOptions {
            direction: KkDirection::ImagFromReal,
            sskk: true,
            tail_fraction: 0.0,
            ..KkOptions::default()
        };
        assert_eq!(opts.validate().len(), 2);
        assert!(matches!(kk_transform(&series, &opts), Err(EngineError::InvalidConfig(ref v)) if v.len() == 2));
        assert!(KkOptions::default().validate().is_empty());
        assert!(KkOptions::model_check().validate().is_empty());
    }
}
