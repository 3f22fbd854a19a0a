//! Single-session fitting.
//!
//! Given:
//! - a measured series `ε′_i`, `ε″_i` at angular frequencies `ω_i`
//! - a model configuration (values, bounds, transforms, ties)
//! - solver options (algorithm, robust loss, weighting, budget)
//!
//! we minimize the robust cost of the stacked, weighted residual vector
//!
//! ```text
//! r = [ w_i (ε′_i − Re ε*(ω_i)) ,  w_{n+i} (ε″_i + Im ε*(ω_i)) ]
//! ```
//!
//! over the packed internal variables and report:
//! - fitted values with standard errors (delta method through the transforms)
//! - the external-space covariance matrix when `JᵀJ` is well conditioned
//! - the fitted curve and raw residuals per point
//!
//! Validation failures are returned as errors before a session exists.
//! Anything that goes wrong once the optimizer is running is recorded on the
//! session instead.

use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::DMatrix;

use crate::domain::{FrequencySeries, ModelConfig};
use crate::error::{EngineError, Result};
use crate::fit::init::initial_guess;
use crate::fit::options::{FrequencyWeighting, SolverOptions, Weighting};
use crate::fit::session::{
    ConvergenceReason, FittedParameter, FittedPoint, FittingSession, SessionOutcome,
};
use crate::fit::solver::{SolverOutcome, SolverSettings, SolverStop, jacobian, minimize};
use crate::fit::transform::ParameterPacker;
use crate::math::log_spacing;
use crate::models::{ParameterLayout, canonical_permutation, evaluate, validate_config};

/// Singular-value ratio below which standard errors are not reported.
const ILL_CONDITIONED: f64 = 1e-10;

/// A validated fitting problem, ready to be run from one or more starting points.
#[derive(Debug, Clone)]
pub struct FitJob {
    config: ModelConfig,
    options: SolverOptions,
    layout: ParameterLayout,
    packer: ParameterPacker,
    frequency_hz: Vec<f64>,
    omega: Vec<f64>,
    real: Vec<f64>,
    imag: Vec<f64>,
    /// Stacked `[real..., imag...]` residual weights.
    weights: Vec<f64>,
}

impl FitJob {
    /// Validate inputs and seed the initial guess.
    ///
    /// Fails with `InvalidConfig` for bad configurations or options and with
    /// `DegenerateFit` when there are not more residual values than free
    /// parameters.
    pub fn new(series: &FrequencySeries, config: &ModelConfig, options: &SolverOptions) -> Result<Self> {
        let violations = validate_config(config);
        if !violations.is_empty() {
            return Err(EngineError::InvalidConfig(violations));
        }
        let violations = options.validate();
        if !violations.is_empty() {
            return Err(EngineError::InvalidConfig(violations));
        }

        let points = 2 * series.len();
        let free_parameters = config.free_parameter_count();
        if points <= free_parameters {
            return Err(EngineError::DegenerateFit {
                points,
                free_parameters,
            });
        }

        let seeded = initial_guess(series, config);
        let packer = ParameterPacker::new(&seeded)?;
        let weights = residual_weights(series, &options.weighting);

        Ok(Self {
            layout: ParameterLayout::for_config(&seeded),
            config: seeded,
            options: options.clone(),
            packer,
            frequency_hz: series.frequency_hz().to_vec(),
            omega: series.angular_frequencies(),
            real: series.real_part().to_vec(),
            imag: series.imag_part().to_vec(),
            weights,
        })
    }

    /// Configuration after initial-guess seeding.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub(crate) fn packer(&self) -> &ParameterPacker {
        &self.packer
    }

    /// Internal starting point of the seeded configuration.
    pub(crate) fn initial_point(&self) -> Vec<f64> {
        self.packer.pack(&self.config.values())
    }

    /// Run one session from the seeded initial guess.
    pub fn run(&self) -> FittingSession {
        self.run_from(self.initial_point(), None, None)
    }

    /// Run one session from internal point `z0`, tagged for multistart.
    pub(crate) fn run_from(
        &self,
        mut z0: Vec<f64>,
        start_seed: Option<usize>,
        group_id: Option<String>,
    ) -> FittingSession {
        let mut session = FittingSession::pending(
            self.config.clone(),
            self.options.clone(),
            self.frequency_hz.clone(),
            self.packer.len(),
        );
        session.tag(group_id, start_seed);
        session.start();
        debug!(
            "session started: {} with {} free parameters on {} points (seed {:?})",
            self.config.model,
            self.packer.len(),
            self.omega.len(),
            start_seed
        );

        self.packer.clamp(&mut z0);
        let started = Instant::now();
        let settings = SolverSettings {
            algorithm: self.options.algorithm,
            loss: self.options.loss,
            loss_scale: self.options.loss_scale,
            max_iterations: self.options.max_iterations,
            tolerance: self.options.tolerance,
            deadline: self.options.timeout_ms.map(|ms| started + Duration::from_millis(ms)),
            cancel: self.options.cancel.clone(),
        };
        let stop = minimize(
            |z: &[f64]| self.residuals(z),
            &z0,
            &self.packer.lower_bounds(),
            &self.packer.upper_bounds(),
            &settings,
        );
        let runtime_ms = started.elapsed().as_millis() as u64;

        match stop {
            SolverStop::Finished(out) => {
                let iterations = out.iterations;
                match self.outcome(out) {
                    Ok(outcome) => session.complete(outcome, runtime_ms),
                    Err(e) => session.fail(
                        ConvergenceReason::NumericalFailure(e.to_string()),
                        iterations,
                        runtime_ms,
                    ),
                }
            }
            SolverStop::Cancelled { iterations } => session.cancel(iterations, runtime_ms),
            SolverStop::Timeout {
                iterations,
                elapsed_ms,
            } => session.fail(ConvergenceReason::Timeout { elapsed_ms }, iterations, runtime_ms),
            SolverStop::Failed {
                iterations,
                message,
            } => session.fail(ConvergenceReason::NumericalFailure(message), iterations, runtime_ms),
        }
        debug!(
            "session finished: {:?} ({:?}) after {} iterations in {} ms",
            session.status(),
            session.convergence_reason(),
            session.iterations(),
            session.runtime_ms()
        );
        session
    }

    /// Weighted residuals at internal point `z`; `None` if anything is non-finite.
    fn residuals(&self, z: &[f64]) -> Option<Vec<f64>> {
        let values = self.packer.unpack(z);
        let eps = evaluate(self.config.model, &self.omega, &values, &self.layout).ok()?;
        let n = self.omega.len();
        let mut r = vec![0.0; 2 * n];
        for (i, e) in eps.iter().enumerate() {
            r[i] = self.weights[i] * (self.real[i] - e.re);
            r[n + i] = self.weights[n + i] * (self.imag[i] + e.im);
        }
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn outcome(&self, out: SolverOutcome) -> Result<SessionOutcome> {
        let mut values = self.packer.unpack(&out.z);
        let mut covariance = self.covariance(&out.z, &out.residuals);

        let mut fitted = self.config.clone();
        for (p, v) in fitted.parameters.iter_mut().zip(&values) {
            p.value = *v;
        }
        if let Some(perm) = canonical_permutation(&fitted) {
            values = perm.iter().map(|&old| values[old]).collect();
            for (p, v) in fitted.parameters.iter_mut().zip(&values) {
                p.value = *v;
            }
            if let Some(cov) = covariance.as_mut() {
                *cov = perm
                    .iter()
                    .map(|&a| perm.iter().map(|&b| cov[a][b]).collect())
                    .collect();
            }
        }

        let parameters = fitted
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| FittedParameter {
                name: p.name.clone(),
                value: p.value,
                std_error: if p.vary {
                    covariance.as_ref().map(|c| c[i][i].max(0.0).sqrt())
                } else {
                    Some(0.0)
                },
                lower: p.lower,
                upper: p.upper,
                vary: p.vary,
                tie_group: p.tie_group.clone(),
            })
            .collect();

        let eps = evaluate(fitted.model, &self.omega, &values, &self.layout)?;
        let curve = eps
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let (re, im) = (e.re, -e.im);
                FittedPoint {
                    frequency_hz: self.frequency_hz[i],
                    real_fit: re,
                    imag_fit: im,
                    dk_fit: re,
                    tan_delta_fit: im / re,
                    residual_real: self.real[i] - re,
                    residual_imag: self.imag[i] - im,
                }
            })
            .collect();

        Ok(SessionOutcome {
            reason: out.reason,
            fitted,
            parameters,
            covariance,
            curve,
            weighted_residuals: out.residuals,
            weights: self.weights.clone(),
            iterations: out.iterations,
            cost: out.cost,
        })
    }

    /// Slot-by-slot covariance of the external parameters.
    ///
    /// `cov_z = s² (JᵀJ)⁻¹` in internal space, with `s² = Σr² / (m − k)`,
    /// mapped through `d(value)/dz` of each variable. Fixed slots get zero rows.
    fn covariance(&self, z: &[f64], residuals: &[f64]) -> Option<Vec<Vec<f64>>> {
        let k = self.packer.len();
        let slots = self.packer.slot_count();
        let mut cov = vec![vec![0.0; slots]; slots];
        if k == 0 {
            return Some(cov);
        }
        let m = residuals.len();
        let jac = jacobian(
            &|z: &[f64]| self.residuals(z),
            z,
            residuals,
            &self.packer.upper_bounds(),
        )?;
        let svd = jac.svd(false, true);
        let v_t = svd.v_t?;
        let s = &svd.singular_values;
        let s_max = s.iter().cloned().fold(0.0, f64::max);
        let s_min = s.iter().cloned().fold(f64::INFINITY, f64::min);
        if !(s_max > 0.0) || s_min / s_max < ILL_CONDITIONED {
            warn!(
                "{} fit: Jacobian is ill-conditioned (σmin/σmax = {:.2e}); standard errors omitted",
                self.config.model,
                if s_max > 0.0 { s_min / s_max } else { 0.0 }
            );
            return None;
        }

        let variance = residuals.iter().map(|r| r * r).sum::<f64>() / (m - k) as f64;
        let cov_z = DMatrix::from_fn(k, k, |a, b| {
            (0..k).map(|i| v_t[(i, a)] * v_t[(i, b)] / (s[i] * s[i])).sum::<f64>() * variance
        });

        let derivative: Vec<f64> = (0..k).map(|v| self.packer.external_derivative(v, z[v])).collect();
        let mut slot_variable = vec![None; slots];
        for v in 0..k {
            for &slot in self.packer.slots(v) {
                slot_variable[slot] = Some(v);
            }
        }
        for (a, va) in slot_variable.iter().enumerate() {
            for (b, vb) in slot_variable.iter().enumerate() {
                if let (Some(va), Some(vb)) = (va, vb) {
                    cov[a][b] = derivative[*va] * derivative[*vb] * cov_z[(*va, *vb)];
                }
            }
        }
        cov.iter()
            .all(|row| row.iter().all(|v| v.is_finite()))
            .then_some(cov)
    }
}

/// Stacked `[real..., imag...]` residual weights.
fn residual_weights(series: &FrequencySeries, weighting: &Weighting) -> Vec<f64> {
    let n = series.len();
    let per_point: Vec<f64> = match weighting.frequency {
        FrequencyWeighting::Uniform => vec![1.0; n],
        FrequencyWeighting::LogSpacing => normalise(log_spacing(series.frequency_hz())),
        FrequencyWeighting::Magnitude => normalise(
            series
                .real_part()
                .iter()
                .zip(series.imag_part())
                .map(|(re, im)| 1.0 / re.hypot(*im).max(f64::MIN_POSITIVE))
                .collect(),
        ),
    };
    per_point
        .iter()
        .map(|w| w * weighting.real_weight)
        .chain(per_point.iter().map(|w| w * weighting.imag_weight))
        .collect()
}

/// Scale to mean 1 (left alone if the mean is not positive).
fn normalise(mut w: Vec<f64>) -> Vec<f64> {
    let mean = w.iter().sum::<f64>() / w.len().max(1) as f64;
    if mean > 0.0 && mean.is_finite() {
        for v in w.iter_mut() {
            *v /= mean;
        }
    }
    w
}

/// Fit `config` to `series` in a single session.
///
/// Multistart settings in `options` are ignored here; see
/// [`crate::fit::fit_multistart`].
pub fn fit(series: &FrequencySeries, config: &ModelConfig, options: &SolverOptions) -> Result<FittingSession> {
    Ok(FitJob::new(series, config, options)?.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{angular_log_grid, synthesize};
    use crate::domain::ModelKind;
    use crate::fit::options::CancelToken;
    use crate::fit::session::SessionStatus;
    use crate::models::default_config;
    use approx::assert_relative_eq;

    fn truth(kind: ModelKind, terms: usize, values: &[(&str, f64)]) -> ModelConfig {
        let mut cfg = default_config(kind, terms).unwrap();
        for (name, v) in values {
            cfg.set_value(name, *v).unwrap();
        }
        cfg
    }

    fn tight() -> SolverOptions {
        SolverOptions {
            tolerance: 1e-12,
            max_iterations: 500,
            ..SolverOptions::default()
        }
    }

    fn value(session: &FittingSession, name: &str) -> f64 {
        session.parameter(name).unwrap().value
    }

    #[test]
    fn recovers_noiseless_debye() {
        let t = truth(ModelKind::Debye, 1, &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6)]);
        let series = synthesize(&t, &angular_log_grid(1e3, 1e9, 60).unwrap(), 0.0, 0).unwrap();
        let session = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &tight()).unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.success());
        assert_relative_eq!(value(&session, "eps_inf"), 3.0, max_relative = 1e-6);
        assert_relative_eq!(value(&session, "delta_eps"), 10.0, max_relative = 1e-6);
        assert_relative_eq!(value(&session, "tau"), 1e-6, max_relative = 1e-6);
        assert_eq!(session.curve().len(), 60);
        assert!(session.residuals().iter().all(|r| r.abs() < 1e-6));
    }

    #[test]
    fn recovers_noiseless_havriliak_negami() {
        let t = truth(
            ModelKind::HavriliakNegami,
            1,
            &[("eps_inf", 2.0), ("eps_s", 12.0), ("tau", 1e-5), ("alpha", 0.8), ("beta", 0.6)],
        );
        let series = synthesize(&t, &angular_log_grid(1e1, 1e10, 90).unwrap(), 0.0, 0).unwrap();
        let session = fit(
            &series,
            &default_config(ModelKind::HavriliakNegami, 1).unwrap(),
            &tight(),
        )
        .unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_relative_eq!(value(&session, "eps_s"), 12.0, max_relative = 1e-3);
        assert_relative_eq!(value(&session, "tau"), 1e-5, max_relative = 1e-3);
        assert_relative_eq!(value(&session, "alpha"), 0.8, max_relative = 1e-3);
        assert_relative_eq!(value(&session, "beta"), 0.6, max_relative = 1e-3);
    }

    #[test]
    fn multi_term_result_is_in_ascending_tau_order() {
        let t = truth(
            ModelKind::MultiDebye,
            2,
            &[("eps_inf", 3.0), ("delta_eps_1", 10.0), ("tau_1", 1e-6), ("delta_eps_2", 5.0), ("tau_2", 1e-3)],
        );
        let series = synthesize(&t, &angular_log_grid(1e1, 1e9, 81).unwrap(), 0.0, 0).unwrap();
        let session = fit(&series, &default_config(ModelKind::MultiDebye, 2).unwrap(), &tight()).unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(value(&session, "tau_1") < value(&session, "tau_2"));
        assert_relative_eq!(value(&session, "tau_1"), 1e-6, max_relative = 1e-4);
        assert_relative_eq!(value(&session, "delta_eps_1"), 10.0, max_relative = 1e-4);
        assert_relative_eq!(value(&session, "tau_2"), 1e-3, max_relative = 1e-4);
        assert_relative_eq!(value(&session, "delta_eps_2"), 5.0, max_relative = 1e-4);
    }

    #[test]
    fn fitted_values_never_leave_their_bounds() {
        let t = truth(ModelKind::Debye, 1, &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6)]);
        let series = synthesize(&t, &angular_log_grid(1e3, 1e9, 40).unwrap(), 0.0, 0).unwrap();
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_bounds("delta_eps", 0.0, 8.0).unwrap();
        cfg.set_bounds("tau", 1e-9, 5e-7).unwrap();
        cfg.set_value("tau", 1e-7).unwrap();
        let session = fit(&series, &cfg, &SolverOptions::default()).unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        for p in session.parameters() {
            assert!(p.value >= p.lower && p.value <= p.upper, "{} = {}", p.name, p.value);
        }
        assert!(value(&session, "tau") <= 5e-7);
    }

    #[test]
    fn tied_parameters_come_back_identical() {
        let t = truth(
            ModelKind::MultiDebye,
            2,
            &[("eps_inf", 3.0), ("delta_eps_1", 4.0), ("tau_1", 1e-6), ("delta_eps_2", 4.0), ("tau_2", 1e-4)],
        );
        let series = synthesize(&t, &angular_log_grid(1e2, 1e9, 60).unwrap(), 0.0, 0).unwrap();
        let mut cfg = default_config(ModelKind::MultiDebye, 2).unwrap();
        cfg.tie("strength", &["delta_eps_1", "delta_eps_2"]).unwrap();
        let session = fit(&series, &cfg, &tight()).unwrap();

        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(value(&session, "delta_eps_1"), value(&session, "delta_eps_2"));
        assert_relative_eq!(value(&session, "delta_eps_1"), 4.0, max_relative = 1e-4);
        assert_eq!(session.n_free(), 4);
    }

    #[test]
    fn fixed_parameter_keeps_its_value() {
        let t = truth(ModelKind::Debye, 1, &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6)]);
        let series = synthesize(&t, &angular_log_grid(1e3, 1e9, 40).unwrap(), 0.01, 3).unwrap();
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.fix("eps_inf", 3.0).unwrap();
        let session = fit(&series, &cfg, &SolverOptions::default()).unwrap();

        let p = session.parameter("eps_inf").unwrap();
        assert_eq!(p.value, 3.0);
        assert_eq!(p.std_error, Some(0.0));
        let tau = session.parameter("tau").unwrap();
        assert!(tau.std_error.is_some_and(|s| s > 0.0 && s < 1e-7));
        let cov = session.covariance().unwrap();
        assert_eq!(cov.len(), 3);
        assert_eq!(cov[0][0], 0.0);
    }

    #[test]
    fn pre_cancelled_session_has_no_results() {
        let t = truth(ModelKind::Debye, 1, &[("tau", 1e-6)]);
        let series = synthesize(&t, &angular_log_grid(1e3, 1e9, 30).unwrap(), 0.0, 0).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let options = SolverOptions {
            cancel: Some(token),
            ..SolverOptions::default()
        };
        let session = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &options).unwrap();

        assert_eq!(session.status(), SessionStatus::Cancelled);
        assert!(session.parameters().is_empty());
        assert!(session.fitted_config().is_none());
        assert!(session.curve().is_empty());
        assert_eq!(session.iterations(), 0);
    }

    #[test]
    fn expired_deadline_fails_with_timeout() {
        let t = truth(ModelKind::Debye, 1, &[("tau", 1e-6)]);
        let series = synthesize(&t, &angular_log_grid(1e3, 1e9, 30).unwrap(), 0.0, 0).unwrap();
        let options = SolverOptions {
            timeout_ms: Some(0),
            ..SolverOptions::default()
        };
        let session = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &options).unwrap();

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(matches!(
            session.convergence_reason(),
            Some(ConvergenceReason::Timeout { .. })
        ));
        assert!(session.parameters().is_empty());
    }

    #[test]
    fn too_many_free_parameters_is_degenerate() {
        let series = FrequencySeries::new(vec![1e3], vec![4.0], vec![0.5]).unwrap();
        let err = fit(&series, &default_config(ModelKind::Debye, 1).unwrap(), &SolverOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::DegenerateFit {
                points: 2,
                free_parameters: 3
            }
        );
    }

    #[test]
    fn invalid_configuration_is_rejected_before_running() {
        let series = FrequencySeries::new(vec![1e3, 1e4, 1e5], vec![4.0; 3], vec![0.5; 3]).unwrap();
        let mut cfg = default_config(ModelKind::ColeCole, 1).unwrap();
        cfg.set_value("alpha", 1.5).unwrap();
        let err = fit(&series, &cfg, &SolverOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn log_spacing_weights_have_unit_mean() {
        let series = FrequencySeries::new(vec![1.0, 10.0, 1000.0, 1e4], vec![4.0; 4], vec![1.0; 4]).unwrap();
        let weighting = Weighting {
            frequency: FrequencyWeighting::LogSpacing,
            real_weight: 1.0,
            imag_weight: 2.0,
        };
        let w = residual_weights(&series, &weighting);
        assert_eq!(w.len(), 8);
        let mean_real = w[..4].iter().sum::<f64>() / 4.0;
        assert_relative_eq!(mean_real, 1.0, epsilon = 1e-12);
        assert_relative_eq!(w[5], 2.0 * w[1], epsilon = 1e-12);
        // The isolated middle points carry more weight than the dense ends.
        assert!(w[1] > w[0]);
    }
}
