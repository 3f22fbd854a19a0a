//! Bounded nonlinear least squares.
//!
//! Minimizes `C(z) = ½ s² Σ ρ((r_i(z)/s)²)` over a box `lower ≤ z ≤ upper`:
//!
//! - forward-difference Jacobian (backward when the forward step would leave the box)
//! - robust losses through row reweighting by `√ρ′`
//! - Levenberg–Marquardt with Nielsen's damping update, or Gauss–Newton with
//!   step halving
//! - every trial point is projected onto the box
//!
//! Cancellation and the wall-clock deadline are checked once per iteration,
//! before any work for that iteration starts.

use std::time::Instant;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::fit::loss::LossKind;
use crate::fit::options::{Algorithm, CancelToken};
use crate::fit::session::ConvergenceReason;
use crate::math::{solve_damped, solve_least_squares};

/// Damping beyond which no acceptable step exists at machine precision.
const MAX_DAMPING: f64 = 1e16;
const MIN_DAMPING: f64 = 1e-15;
/// Maximum number of halvings per Gauss–Newton step.
const MAX_HALVINGS: usize = 30;

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub algorithm: Algorithm,
    pub loss: LossKind,
    pub loss_scale: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub z: Vec<f64>,
    pub residuals: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub reason: ConvergenceReason,
}

/// How a solve ended. Only `Finished` carries a usable point.
#[derive(Debug, Clone)]
pub enum SolverStop {
    Finished(SolverOutcome),
    Cancelled { iterations: usize },
    Timeout { iterations: usize, elapsed_ms: u64 },
    Failed { iterations: usize, message: String },
}

/// Forward-difference Jacobian of `f` at `z`, given `r = f(z)`.
pub fn jacobian<F>(f: &F, z: &[f64], r: &[f64], upper: &[f64]) -> Option<DMatrix<f64>>
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    let m = r.len();
    let mut jac = DMatrix::<f64>::zeros(m, z.len());
    let mut probe = z.to_vec();
    for k in 0..z.len() {
        let mut h = 1.49e-8 * z[k].abs().max(1.0);
        if z[k] + h > upper[k] {
            h = -h;
        }
        probe[k] = z[k] + h;
        let shifted = f(&probe)?;
        probe[k] = z[k];
        for i in 0..m {
            jac[(i, k)] = (shifted[i] - r[i]) / h;
        }
    }
    jac.iter().all(|v| v.is_finite()).then_some(jac)
}

fn project(z: &mut [f64], lower: &[f64], upper: &[f64]) {
    for ((v, lo), hi) in z.iter_mut().zip(lower).zip(upper) {
        *v = v.clamp(*lo, *hi);
    }
}

/// Gradient with components pointing out of the box at active bounds removed.
fn projected_gradient_norm(g: &DVector<f64>, z: &[f64], lower: &[f64], upper: &[f64]) -> f64 {
    g.iter()
        .enumerate()
        .map(|(k, gk)| {
            let at_lower = z[k] <= lower[k] && *gk > 0.0;
            let at_upper = z[k] >= upper[k] && *gk < 0.0;
            if at_lower || at_upper { 0.0 } else { gk.abs() }
        })
        .fold(0.0, f64::max)
}

/// Run the solver from `z0`.
pub fn minimize<F>(f: F, z0: &[f64], lower: &[f64], upper: &[f64], settings: &SolverSettings) -> SolverStop
where
    F: Fn(&[f64]) -> Option<Vec<f64>>,
{
    let started = Instant::now();
    let loss = settings.loss;
    let scale = settings.loss_scale;
    let tol = settings.tolerance;

    let mut z = z0.to_vec();
    project(&mut z, lower, upper);
    let Some(mut r) = f(&z) else {
        return SolverStop::Failed {
            iterations: 0,
            message: "non-finite residuals at the initial point".to_string(),
        };
    };
    let mut cost = loss.cost(&r, scale);
    let mut lambda: Option<f64> = None;
    let mut nu = 2.0;

    for iteration in 0..settings.max_iterations {
        if settings.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return SolverStop::Cancelled { iterations: iteration };
        }
        if settings.deadline.is_some_and(|d| Instant::now() >= d) {
            return SolverStop::Timeout {
                iterations: iteration,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }

        let finished = |reason: ConvergenceReason, z: Vec<f64>, r: Vec<f64>, cost: f64, iterations| {
            debug!("solver stopped after {iterations} iterations: {reason:?}, cost {cost:.6e}");
            SolverStop::Finished(SolverOutcome {
                z,
                residuals: r,
                cost,
                iterations,
                reason,
            })
        };

        if cost == 0.0 {
            return finished(ConvergenceReason::Gradient, z, r, cost, iteration);
        }

        let Some(jac) = jacobian(&f, &z, &r, upper) else {
            return SolverStop::Failed {
                iterations: iteration,
                message: "non-finite Jacobian".to_string(),
            };
        };

        // Robust loss as row weights.
        let w = loss.irls_weights(&r, scale);
        let rw = DVector::from_iterator(r.len(), r.iter().zip(&w).map(|(ri, wi)| ri * wi));
        let mut jw = jac;
        for (i, wi) in w.iter().enumerate() {
            jw.row_mut(i).scale_mut(*wi);
        }
        let g = jw.transpose() * &rw;
        if projected_gradient_norm(&g, &z, lower, upper) < tol {
            return finished(ConvergenceReason::Gradient, z, r, cost, iteration);
        }
        let diag: Vec<f64> = jw.column_iter().map(|c| c.norm_squared()).collect();

        let accepted = match settings.algorithm {
            Algorithm::LevenbergMarquardt => {
                let lam = lambda.get_or_insert_with(|| {
                    (1e-3 * diag.iter().cloned().fold(0.0, f64::max)).max(MIN_DAMPING)
                });
                let mut found = None;
                while *lam <= MAX_DAMPING {
                    let trial = solve_damped(&jw, &rw, *lam, &diag).and_then(|delta| {
                        let mut z_new: Vec<f64> = z.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
                        project(&mut z_new, lower, upper);
                        let r_new = f(&z_new)?;
                        Some((z_new, r_new))
                    });
                    if let Some((z_new, r_new)) = trial {
                        let step = DVector::from_iterator(z.len(), z_new.iter().zip(&z).map(|(a, b)| a - b));
                        let cost_new = loss.cost(&r_new, scale);
                        let jstep = &jw * &step;
                        let predicted = -(g.dot(&step) + 0.5 * jstep.norm_squared());
                        let actual = cost - cost_new;
                        if actual > 0.0 && predicted > 0.0 {
                            let rho = actual / predicted;
                            *lam = (*lam * (1.0 - (2.0 * rho - 1.0).powi(3)).max(1.0 / 3.0))
                                .max(MIN_DAMPING);
                            nu = 2.0;
                            found = Some((z_new, r_new, cost_new, step.norm()));
                            break;
                        }
                    }
                    *lam *= nu;
                    nu *= 2.0;
                }
                found
            }
            Algorithm::GaussNewton => {
                let Some(delta) = solve_least_squares(&jw, &(-&rw)) else {
                    return SolverStop::Failed {
                        iterations: iteration,
                        message: "singular Jacobian".to_string(),
                    };
                };
                let mut t = 1.0;
                let mut found = None;
                for _ in 0..MAX_HALVINGS {
                    let mut z_new: Vec<f64> = z.iter().zip(delta.iter()).map(|(a, d)| a + t * d).collect();
                    project(&mut z_new, lower, upper);
                    if let Some(r_new) = f(&z_new) {
                        let cost_new = loss.cost(&r_new, scale);
                        if cost_new < cost {
                            let norm = z_new
                                .iter()
                                .zip(&z)
                                .map(|(a, b)| (a - b).powi(2))
                                .sum::<f64>()
                                .sqrt();
                            found = Some((z_new, r_new, cost_new, norm));
                            break;
                        }
                    }
                    t *= 0.5;
                }
                found
            }
        };

        let Some((z_new, r_new, cost_new, step_norm)) = accepted else {
            // No decrease is achievable from here.
            return finished(ConvergenceReason::StepSize, z, r, cost, iteration + 1);
        };

        let reduction = cost - cost_new;
        z = z_new;
        r = r_new;
        cost = cost_new;

        if reduction < tol * cost {
            return finished(ConvergenceReason::CostReduction, z, r, cost, iteration + 1);
        }
        let z_norm = z.iter().map(|v| v * v).sum::<f64>().sqrt();
        if step_norm < tol * (tol + z_norm) {
            return finished(ConvergenceReason::StepSize, z, r, cost, iteration + 1);
        }
    }

    debug!("solver hit the iteration limit ({}), cost {cost:.6e}", settings.max_iterations);
    SolverStop::Finished(SolverOutcome {
        z,
        residuals: r,
        cost,
        iterations: settings.max_iterations,
        reason: ConvergenceReason::IterationLimit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(algorithm: Algorithm) -> SolverSettings {
        SolverSettings {
            algorithm,
            loss: LossKind::Linear,
            loss_scale: 1.0,
            max_iterations: 200,
            tolerance: 1e-10,
            deadline: None,
            cancel: None,
        }
    }

    // y = a · exp(−b x)
    fn exp_residuals(z: &[f64]) -> Option<Vec<f64>> {
        let xs = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0];
        Some(xs.iter().map(|x| z[0] * (-z[1] * x).exp() - 2.0 * (-0.7 * x).exp()).collect())
    }

    #[test]
    fn levenberg_marquardt_recovers_exponential() {
        let stop = minimize(exp_residuals, &[1.0, 0.1], &[-10.0, -10.0], &[10.0, 10.0], &settings(Algorithm::LevenbergMarquardt));
        let SolverStop::Finished(out) = stop else { panic!("solver did not finish") };
        assert!(out.reason.is_converged());
        assert!((out.z[0] - 2.0).abs() < 1e-6);
        assert!((out.z[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn gauss_newton_recovers_exponential() {
        let stop = minimize(exp_residuals, &[1.5, 0.5], &[-10.0, -10.0], &[10.0, 10.0], &settings(Algorithm::GaussNewton));
        let SolverStop::Finished(out) = stop else { panic!("solver did not finish") };
        assert!((out.z[0] - 2.0).abs() < 1e-6);
        assert!((out.z[1] - 0.7).abs() < 1e-6);
    }

    #[test]
    fn solution_is_projected_onto_bounds() {
        let stop = minimize(exp_residuals, &[1.0, 0.1], &[-10.0, -10.0], &[1.5, 10.0], &settings(Algorithm::LevenbergMarquardt));
        let SolverStop::Finished(out) = stop else { panic!("solver did not finish") };
        assert!(out.z[0] <= 1.5);
        assert!((out.z[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn cancellation_is_seen_before_the_first_iteration() {
        let token = CancelToken::new();
        token.cancel();
        let s = SolverSettings {
            cancel: Some(token),
            ..settings(Algorithm::LevenbergMarquardt)
        };
        let stop = minimize(exp_residuals, &[1.0, 0.1], &[-10.0, -10.0], &[10.0, 10.0], &s);
        assert!(matches!(stop, SolverStop::Cancelled { iterations: 0 }));
    }

    #[test]
    fn nan_at_start_is_a_failure() {
        let stop = minimize(|_z: &[f64]| None, &[1.0], &[0.0], &[2.0], &settings(Algorithm::LevenbergMarquardt));
        assert!(matches!(stop, SolverStop::Failed { iterations: 0, .. }));
    }
}
