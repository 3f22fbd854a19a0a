//! Multistart fitting.
//!
//! One validated [`FitJob`] is run from several starting points:
//!
//! - `SeedPlan::Random`: start 0 is the seeded initial guess; start `i` adds
//!   Gaussian noise (per-variable width from the packer) drawn from
//!   `StdRng::seed_from_u64(seed + i)`, then projects onto the bounds
//! - `SeedPlan::Explicit`: caller-supplied full parameter vectors
//!
//! Starts run independently on a dedicated rayon pool and come back in start
//! order, each tagged with the group id and its start index. A failed start
//! never affects its siblings. Picking the best run is left to the caller
//! (see [`crate::fit::select_best_by_aic`]).

use log::{debug, warn};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use rayon::prelude::*;

use crate::domain::{FrequencySeries, ModelConfig};
use crate::error::{EngineError, Result, Violation};
use crate::fit::fitter::FitJob;
use crate::fit::options::{MultistartOptions, SeedPlan, SolverOptions};
use crate::fit::session::{FittingSession, SessionStatus};

/// Run one session per start and return them in start order.
///
/// Uses `options.multistart`, or the default plan (5 random starts) when it
/// is unset. Validation errors are returned before any session runs.
pub fn fit_multistart(
    series: &FrequencySeries,
    config: &ModelConfig,
    options: &SolverOptions,
) -> Result<Vec<FittingSession>> {
    let job = FitJob::new(series, config, options)?;
    let plan = options.multistart.clone().unwrap_or_default();
    let starts = start_points(&job, &plan.seeds)?;
    run_starts(&job, starts, &plan)
}

fn run_starts(job: &FitJob, starts: Vec<Vec<f64>>, plan: &MultistartOptions) -> Result<Vec<FittingSession>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(plan.concurrency.unwrap_or(0))
        .build()
        .map_err(|e| EngineError::NumericalFailure(format!("failed to build worker pool: {e}")))?;

    debug!(
        "multistart '{}': {} starts of {}",
        plan.group_id,
        starts.len(),
        job.config().model
    );
    let sessions: Vec<FittingSession> = pool.install(|| {
        starts
            .into_par_iter()
            .enumerate()
            .map(|(i, z0)| job.run_from(z0, Some(i), Some(plan.group_id.clone())))
            .collect()
    });

    for s in sessions.iter().filter(|s| s.status() == SessionStatus::Failed) {
        warn!(
            "multistart '{}': start {:?} failed ({:?})",
            plan.group_id,
            s.start_seed(),
            s.convergence_reason()
        );
    }
    Ok(sessions)
}

/// Internal starting points for a seed plan.
fn start_points(job: &FitJob, plan: &SeedPlan) -> Result<Vec<Vec<f64>>> {
    let packer = job.packer();
    match plan {
        SeedPlan::Random { count, seed } => {
            let base = job.initial_point();
            let mut out = Vec::with_capacity(*count);
            for i in 0..*count {
                let mut z = base.clone();
                if i > 0 {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                    for (k, zk) in z.iter_mut().enumerate() {
                        let width = packer.perturbation_width(k);
                        let normal = Normal::new(0.0, width).map_err(|e| {
                            EngineError::InvalidConfig(vec![Violation::new(format!(
                                "perturbation width {width} for variable {k}: {e}"
                            ))])
                        })?;
                        *zk += normal.sample(&mut rng);
                    }
                    packer.clamp(&mut z);
                }
                out.push(z);
            }
            Ok(out)
        }
        SeedPlan::Explicit(seeds) => {
            let mut violations = Vec::new();
            let mut out = Vec::with_capacity(seeds.len());
            for (i, values) in seeds.iter().enumerate() {
                if values.len() != packer.slot_count() {
                    violations.push(Violation::new(format!(
                        "seed {i} has {} values, expected {}",
                        values.len(),
                        packer.slot_count()
                    )));
                    continue;
                }
                let z = packer.pack(values);
                if z.iter().any(|v| !v.is_finite()) {
                    violations.push(Violation::new(format!(
                        "seed {i} has values outside the parameter transforms' domain"
                    )));
                    continue;
                }
                out.push(z);
            }
            if !violations.is_empty() {
                return Err(EngineError::InvalidConfig(violations));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{angular_log_grid, synthesize};
    use crate::domain::ModelKind;
    use crate::fit::options::CancelToken;
    use crate::models::default_config;

    fn debye_series() -> FrequencySeries {
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_value("eps_inf", 3.0).unwrap();
        cfg.set_value("delta_eps", 10.0).unwrap();
        cfg.set_value("tau", 1e-6).unwrap();
        synthesize(&cfg, &angular_log_grid(1e3, 1e9, 40).unwrap(), 0.02, 11).unwrap()
    }

    fn options(seeds: SeedPlan) -> SolverOptions {
        SolverOptions {
            multistart: Some(MultistartOptions {
                group_id: "g1".to_string(),
                seeds,
                concurrency: Some(2),
            }),
            ..SolverOptions::default()
        }
    }

    #[test]
    fn siblings_are_tagged_and_ordered() {
        let cfg = default_config(ModelKind::Debye, 1).unwrap();
        let sessions = fit_multistart(
            &debye_series(),
            &cfg,
            &options(SeedPlan::Random { count: 4, seed: 7 }),
        )
        .unwrap();

        assert_eq!(sessions.len(), 4);
        for (i, s) in sessions.iter().enumerate() {
            assert_eq!(s.group_id(), Some("g1"));
            assert_eq!(s.start_seed(), Some(i));
            assert_eq!(s.status(), SessionStatus::Completed);
        }
    }

    #[test]
    fn random_starts_are_reproducible() {
        let cfg = default_config(ModelKind::ColeCole, 1).unwrap();
        let opts = options(SeedPlan::Random { count: 3, seed: 99 });
        let job = FitJob::new(&debye_series(), &cfg, &opts).unwrap();
        let plan = SeedPlan::Random { count: 3, seed: 99 };
        let a = start_points(&job, &plan).unwrap();
        let b = start_points(&job, &plan).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], job.initial_point());
        assert_ne!(a[1], a[0]);
        assert_ne!(a[1], a[2]);
    }

    #[test]
    fn perturbed_starts_respect_bounds() {
        let mut cfg = default_config(ModelKind::Debye, 1).unwrap();
        cfg.set_bounds("tau", 5e-7, 2e-6).unwrap();
        let opts = options(SeedPlan::Random { count: 20, seed: 1 });
        let job = FitJob::new(&debye_series(), &cfg, &opts).unwrap();
        let lower = job.packer().lower_bounds();
        let upper = job.packer().upper_bounds();
        for z in start_points(&job, &SeedPlan::Random { count: 20, seed: 1 }).unwrap() {
            for ((v, lo), hi) in z.iter().zip(&lower).zip(&upper) {
                assert!(v >= lo && v <= hi);
            }
        }
    }

    #[test]
    fn explicit_seeds_must_match_the_layout() {
        let cfg = default_config(ModelKind::Debye, 1).unwrap();
        let err = fit_multistart(
            &debye_series(),
            &cfg,
            &options(SeedPlan::Explicit(vec![vec![3.0, 10.0, 1e-6], vec![3.0, 10.0]])),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(ref v) if v.len() == 1));
    }

    #[test]
    fn explicit_seeds_run_one_session_each() {
        let cfg = default_config(ModelKind::Debye, 1).unwrap();
        let sessions = fit_multistart(
            &debye_series(),
            &cfg,
            &options(SeedPlan::Explicit(vec![vec![3.0, 10.0, 1e-6], vec![4.0, 5.0, 1e-5]])),
        )
        .unwrap();
        assert_eq!(sessions.len(), 2);
        for s in &sessions {
            assert_eq!(s.status(), SessionStatus::Completed);
            assert!((s.parameter("tau").unwrap().value / 1e-6 - 1.0).abs() < 0.05);
        }
    }

    #[test]
    fn cancellation_reaches_every_sibling() {
        let token = CancelToken::new();
        token.cancel();
        let opts = SolverOptions {
            cancel: Some(token),
            ..options(SeedPlan::Random { count: 3, seed: 0 })
        };
        let cfg = default_config(ModelKind::Debye, 1).unwrap();
        let sessions = fit_multistart(&debye_series(), &cfg, &opts).unwrap();
        assert!(sessions.iter().all(|s| s.status() == SessionStatus::Cancelled));
    }
}
