//! Goodness-of-fit statistics and residual-structure tests.
//!
//! Conventions:
//! - `N` is the number of residual values (two per frequency point), `k` the
//!   number of free parameters
//! - RMSE uses the raw (unweighted) residuals; chi-squared uses the weighted
//!   residuals the solver minimized
//! - `AIC = N·ln(RMSE²) + 2k`, `BIC = N·ln(RMSE²) + k·ln N` (Gaussian
//!   approximation, meaningful for comparing fits of the same series)
//! - residual tests run on the weighted residual sequence in stacking order

use serde::{Deserialize, Serialize};

use crate::domain::{FitStatistics, ResidualDiagnostics};
use crate::error::{EngineError, Result};
use crate::fit::FittingSession;
use crate::kk::{KkOptions, validate_model_curve};
use crate::math::{durbin_watson, lag1_autocorrelation, mean, runs_test_p_value, shapiro_francia, student_t_quantile};

/// Floor on `RMSE²` so an exact fit still has finite information criteria.
const MIN_MSE: f64 = 1e-30;

/// Fewest residuals the residual tests accept.
const MIN_DIAGNOSTIC_POINTS: usize = 5;

/// `(AIC, BIC)` for `n` residual values with the given RMSE and `k` free parameters.
pub fn information_criteria(n: usize, rmse: f64, k: usize) -> (f64, f64) {
    let nf = n as f64;
    let kf = k as f64;
    let log_mse = (rmse * rmse).max(MIN_MSE).ln();
    (nf * log_mse + 2.0 * kf, nf * log_mse + kf * nf.ln())
}

fn degrees_of_freedom(session: &FittingSession) -> Result<usize> {
    let n = session.n_values();
    let k = session.n_free();
    if n <= k {
        return Err(EngineError::DegenerateFit {
            points: n,
            free_parameters: k,
        });
    }
    Ok(n - k)
}

/// Goodness-of-fit statistics for a completed session.
pub fn compute_statistics(session: &FittingSession) -> Result<FitStatistics> {
    let session = session.require_completed()?;
    let dof = degrees_of_freedom(session)?;
    let n = session.n_values();
    let k = session.n_free();

    let residuals = session.residuals();
    let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
    let rmse = (ss_res / n as f64).sqrt();
    let chi_squared: f64 = session.weighted_residuals().iter().map(|r| r * r).sum();

    // Total sum of squares per component, each about its own mean.
    let curve = session.curve();
    let measured_real: Vec<f64> = curve.iter().map(|p| p.real_fit + p.residual_real).collect();
    let measured_imag: Vec<f64> = curve.iter().map(|p| p.imag_fit + p.residual_imag).collect();
    let ss_tot = sum_sq_dev(&measured_real) + sum_sq_dev(&measured_imag);
    let r_squared = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };
    let adjusted_r_squared = if n > k + 1 {
        1.0 - (1.0 - r_squared) * (n as f64 - 1.0) / (n - k - 1) as f64
    } else {
        r_squared
    };

    let (aic, bic) = information_criteria(n, rmse, k);
    let kk_rmse = session
        .fitted_config()
        .and_then(|cfg| validate_model_curve(cfg, session.frequency_hz(), &KkOptions::model_check()).ok())
        .map(|r| r.rmse);

    Ok(FitStatistics {
        rmse,
        chi_squared,
        reduced_chi_squared: chi_squared / dof as f64,
        r_squared,
        adjusted_r_squared,
        aic,
        bic,
        degrees_of_freedom: dof,
        n_values: n,
        n_free: k,
        max_abs_residual: residuals.iter().map(|r| r.abs()).fold(0.0, f64::max),
        mean_abs_residual: mean(&residuals.iter().map(|r| r.abs()).collect::<Vec<_>>()).unwrap_or(0.0),
        kk_rmse,
    })
}

fn sum_sq_dev(values: &[f64]) -> f64 {
    let Some(m) = mean(values) else {
        return 0.0;
    };
    values.iter().map(|v| (v - m).powi(2)).sum()
}

/// Durbin–Watson, runs test, Q–Q normality and lag-1 autocorrelation of the
/// weighted residuals.
pub fn compute_residual_diagnostics(session: &FittingSession) -> Result<ResidualDiagnostics> {
    let session = session.require_completed()?;
    let e = session.weighted_residuals();
    if e.len() < MIN_DIAGNOSTIC_POINTS {
        return Err(EngineError::InsufficientData {
            needed: MIN_DIAGNOSTIC_POINTS,
            got: e.len(),
        });
    }
    // Zero spread (exact fit) carries no evidence against normality.
    let (qq_correlation, qq_normality_p_value) = shapiro_francia(e).unwrap_or((1.0, 1.0));
    Ok(ResidualDiagnostics {
        durbin_watson: durbin_watson(e),
        runs_p_value: runs_test_p_value(e),
        qq_normality_p_value,
        qq_correlation,
        lag1_autocorrelation: lag1_autocorrelation(e),
        n: e.len(),
    })
}

/// Correlation matrix of the fitted parameters, slot by slot.
///
/// Fixed parameters have zero variance; their rows are zero apart from a unit
/// diagonal.
pub fn parameter_correlation(session: &FittingSession) -> Result<Vec<Vec<f64>>> {
    let session = session.require_completed()?;
    let cov = session.covariance().ok_or_else(|| {
        EngineError::NumericalFailure("covariance is unavailable for this session".to_string())
    })?;
    let n = cov.len();
    Ok((0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    if i == j {
                        return 1.0;
                    }
                    let d = (cov[i][i] * cov[j][j]).sqrt();
                    if d > 0.0 { (cov[i][j] / d).clamp(-1.0, 1.0) } else { 0.0 }
                })
                .collect()
        })
        .collect())
}

/// Two-sided Student-t interval for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub name: String,
    pub value: f64,
    pub std_error: Option<f64>,
    /// `None` when the standard error is unavailable.
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Per-parameter intervals at confidence `level` (e.g. 0.95), with `N − k`
/// degrees of freedom.
pub fn confidence_intervals(session: &FittingSession, level: f64) -> Result<Vec<ConfidenceInterval>> {
    if !(level > 0.0 && level < 1.0) {
        return Err(EngineError::invalid_config(format!(
            "confidence level must lie in (0, 1), got {level}"
        )));
    }
    let session = session.require_completed()?;
    let dof = degrees_of_freedom(session)?;
    let t = student_t_quantile(0.5 + level / 2.0, dof as f64).ok_or_else(|| {
        EngineError::NumericalFailure(format!("no Student-t quantile for {dof} degrees of freedom"))
    })?;

    Ok(session
        .parameters()
        .iter()
        .map(|p| ConfidenceInterval {
            name: p.name.clone(),
            value: p.value,
            std_error: p.std_error,
            lower: p.std_error.map(|se| p.value - t * se),
            upper: p.std_error.map(|se| p.value + t * se),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{angular_log_grid, synthesize};
    use crate::domain::{ModelConfig, ModelKind};
    use crate::fit::{CancelToken, SolverOptions, fit};
    use crate::models::default_config;

    fn debye_truth() -> ModelConfig {
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_value("eps_inf", 3.0).unwrap();
        cfg.set_value("delta_eps", 10.0).unwrap();
        cfg.set_value("tau", 1e-6).unwrap();
        cfg
    }

    fn noisy_debye_session() -> FittingSession {
        let series = synthesize(&debye_truth(), &angular_log_grid(1e3, 1e9, 100).unwrap(), 0.01, 21).unwrap();
        fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &SolverOptions::default()).unwrap()
    }

    #[test]
    fn statistics_of_a_noisy_fit() {
        let stats = compute_statistics(&noisy_debye_session()).unwrap();
        assert_eq!(stats.n_values, 200);
        assert_eq!(stats.n_free, 3);
        assert_eq!(stats.degrees_of_freedom, 197);
        assert!(stats.rmse > 0.007 && stats.rmse < 0.013, "rmse = {}", stats.rmse);
        assert!((stats.chi_squared / 197.0 - stats.reduced_chi_squared).abs() < 1e-15);
        assert!(stats.r_squared > 0.999);
        assert!(stats.adjusted_r_squared <= stats.r_squared);
        assert!(stats.bic > stats.aic);
        assert!(stats.kk_rmse.is_some_and(|v| v.is_finite()));
    }

    #[test]
    fn information_criteria_penalize_extra_parameters() {
        let (aic3, bic3) = information_criteria(100, 0.01, 3);
        let (aic4, bic4) = information_criteria(100, 0.01, 4);
        assert!(aic3 < aic4);
        assert!(bic3 < bic4);
        assert!((bic4 - bic3 - 100f64.ln()).abs() < 1e-12);
        // An exact fit stays finite.
        assert!(information_criteria(10, 0.0, 2).0.is_finite());
    }

    #[test]
    fn cancelled_session_has_no_statistics() {
        let series = synthesize(&debye_truth(), &angular_log_grid(1e3, 1e9, 20).unwrap(), 0.0, 0).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let options = SolverOptions {
            cancel: Some(token),
            ..SolverOptions::default()
        };
        let session = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &options).unwrap();
        assert_eq!(compute_statistics(&session).unwrap_err(), EngineError::Cancelled);
        assert_eq!(compute_residual_diagnostics(&session).unwrap_err(), EngineError::Cancelled);
    }

    #[test]
    fn white_residuals_look_random() {
        let diag = compute_residual_diagnostics(&noisy_debye_session()).unwrap();
        assert_eq!(diag.n, 200);
        assert!(diag.durbin_watson > 1.4 && diag.durbin_watson < 2.6);
        assert!(diag.lag1_autocorrelation.abs() < 0.3);
        assert!(diag.qq_correlation > 0.95);
    }

    #[test]
    fn missing_broadening_leaves_structured_residuals() {
        let mut truth = default_config(ModelKind::ColeCole, 1).unwrap();
        truth.set_value("eps_inf", 3.0).unwrap();
        truth.set_value("delta_eps", 10.0).unwrap();
        truth.set_value("tau", 1e-6).unwrap();
        truth.set_value("alpha", 0.6).unwrap();
        let series = synthesize(&truth, &angular_log_grid(1e2, 1e10, 100).unwrap(), 0.001, 4).unwrap();
        let session = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &SolverOptions::default()).unwrap();

        let diag = compute_residual_diagnostics(&session).unwrap();
        assert!(diag.durbin_watson < 0.5, "dw = {}", diag.durbin_watson);
        assert!(diag.runs_p_value < 0.01);
        assert!(diag.lag1_autocorrelation > 0.7);
    }

    #[test]
    fn correlation_matrix_is_a_correlation_matrix() {
        let corr = parameter_correlation(&noisy_debye_session()).unwrap();
        assert_eq!(corr.len(), 3);
        for i in 0..3 {
            assert_eq!(corr[i][i], 1.0);
            for j in 0..3 {
                assert!((corr[i][j] - corr[j][i]).abs() < 1e-12);
                assert!(corr[i][j].abs() <= 1.0);
            }
        }
    }

    #[test]
    fn wider_level_gives_wider_intervals() {
        let session = noisy_debye_session();
        let narrow = confidence_intervals(&session, 0.68).unwrap();
        let wide = confidence_intervals(&session, 0.99).unwrap();
        for (a, b) in narrow.iter().zip(&wide) {
            let (al, au) = (a.lower.unwrap(), a.upper.unwrap());
            let (bl, bu) = (b.lower.unwrap(), b.upper.unwrap());
            assert!(al <= a.value && a.value <= au);
            assert!(bl < al && bu > au);
        }
        assert!(matches!(
            confidence_intervals(&session, 1.5),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
