//! Heuristic model ranking.
//!
//! `autosuggest` ranks candidate model families for a series without running
//! a full fit:
//!
//! 1. KK check of the raw series (ε∞ estimated from the tail)
//! 2. loss-peak features: count, dominant-peak width and symmetry, and the
//!    low-frequency slope of `log ε″` (conductivity shows up as slope ≈ −1)
//! 3. one coarse fit per candidate family, in parallel, with a small
//!    iteration budget and loose tolerance
//! 4. a weighted score per family:
//!
//! ```text
//! score = w_info · exp(−ΔBIC / 2) + w_shape · shape + w_kk · kk_agreement
//! ```
//!
//! where `ΔBIC` is relative to the best coarse fit, `shape` rates how well the
//! family's loss-peak shape matches the features, and `kk_agreement` compares
//! the fitted curve's own KK residual with the raw series'.
//!
//! The ranking is an aid for choosing what to fit; the chosen model still has
//! to be fitted and checked properly.

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::diagnostics::statistics::compute_statistics;
use crate::domain::{FitStatistics, FrequencySeries, ModelKind};
use crate::error::{EngineError, Result, Violation};
use crate::fit::{SolverOptions, fit};
use crate::kk::{CausalityStatus, KkOptions, validate_series};
use crate::math::{find_peaks, linear_fit};
use crate::models::{default_config, enable_conductivity};

/// FWHM of a single Debye loss peak, in decades of frequency.
pub const DEBYE_FWHM_DECADES: f64 = 1.144;

/// Peaks wider than this multiple of the Debye width count as broadened.
const BROAD_FACTOR: f64 = 1.3;

/// Peaks with a half-width ratio below this count as asymmetric.
const SYMMETRY_THRESHOLD: f64 = 0.8;

/// Share of the lowest frequencies used for the conductivity slope.
const LOW_FREQUENCY_SHARE: f64 = 0.2;

const MIN_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosuggestConfig {
    /// Weight of the information-criterion term.
    pub w_info: f64,
    /// Weight of the peak-shape term.
    pub w_shape: f64,
    /// Weight of the KK-agreement term.
    pub w_kk: f64,
    pub coarse_iterations: usize,
    pub coarse_tolerance: f64,
    /// Minimum peak height and prominence, as a share of the largest `ε″`.
    pub peak_noise_floor: f64,
    /// Low-frequency `d log ε″ / d log f` below which conductivity is assumed.
    pub conductivity_slope: f64,
    pub concurrency: Option<usize>,
    pub top_n: usize,
    pub candidates: Vec<ModelKind>,
    pub kk: KkOptions,
}

impl Default for AutosuggestConfig {
    fn default() -> Self {
        Self {
            w_info: 0.5,
            w_shape: 0.3,
            w_kk: 0.2,
            coarse_iterations: 20,
            coarse_tolerance: 1e-4,
            peak_noise_floor: 0.05,
            conductivity_slope: -0.8,
            concurrency: None,
            top_n: 3,
            candidates: vec![
                ModelKind::Debye,
                ModelKind::ColeCole,
                ModelKind::ColeDavidson,
                ModelKind::HavriliakNegami,
                ModelKind::MultiDebye,
                ModelKind::DjordjevicSarkar,
            ],
            kk: KkOptions::default(),
        }
    }
}

impl AutosuggestConfig {
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = Vec::new();
        let weights = [self.w_info, self.w_shape, self.w_kk];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            out.push(Violation::for_parameter(
                "weights",
                "score weights must be non-negative and not all zero",
            ));
        }
        if self.coarse_iterations == 0 {
            out.push(Violation::for_parameter("coarse_iterations", "must be at least 1"));
        }
        if !(self.coarse_tolerance.is_finite() && self.coarse_tolerance > 0.0) {
            out.push(Violation::for_parameter("coarse_tolerance", "must be positive and finite"));
        }
        if !(0.0..1.0).contains(&self.peak_noise_floor) {
            out.push(Violation::for_parameter("peak_noise_floor", "must lie in [0, 1)"));
        }
        if self.top_n == 0 {
            out.push(Violation::for_parameter("top_n", "must be at least 1"));
        }
        if self.candidates.is_empty() {
            out.push(Violation::for_parameter("candidates", "no candidate models"));
        }
        if self.concurrency == Some(0) {
            out.push(Violation::for_parameter("concurrency", "must be at least 1"));
        }
        out.extend(self.kk.validate());
        out
    }
}

/// Features extracted from the raw series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesFeatures {
    pub kk_rmse: Option<f64>,
    pub kk_mean_relative_error: Option<f64>,
    pub kk_status: Option<CausalityStatus>,
    pub peak_count: usize,
    pub peak_frequencies_hz: Vec<f64>,
    /// Half-width ratio of the tallest peak (1 = symmetric).
    pub peak_symmetry: Option<f64>,
    /// FWHM of the tallest peak in decades.
    pub peak_width_decades: Option<f64>,
    pub low_frequency_slope: Option<f64>,
    pub conductivity_detected: bool,
}

impl SeriesFeatures {
    fn is_broad(&self) -> bool {
        self.peak_width_decades
            .is_some_and(|w| w > BROAD_FACTOR * DEBYE_FWHM_DECADES)
    }

    fn is_asymmetric(&self) -> bool {
        self.peak_symmetry.is_some_and(|s| s < SYMMETRY_THRESHOLD)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub info: f64,
    pub shape: f64,
    pub kk: f64,
    pub delta_bic: f64,
    pub aic: f64,
    pub bic: f64,
    pub rmse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub model: ModelKind,
    pub num_terms: usize,
    pub include_conductivity: bool,
    pub score: f64,
    /// Share of the summed scores of every evaluated candidate.
    pub confidence: f64,
    pub rationale: Vec<String>,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutosuggestReport {
    /// Best `top_n` candidates, highest score first.
    pub suggestions: Vec<Suggestion>,
    pub features: SeriesFeatures,
    /// Number of candidates that produced a coarse fit.
    pub evaluated: usize,
    /// Candidates that could not be fitted, and why.
    pub skipped: Vec<(ModelKind, String)>,
}

/// Rank the default candidate families for `series`.
pub fn autosuggest(series: &FrequencySeries) -> Result<AutosuggestReport> {
    autosuggest_with(series, &AutosuggestConfig::default())
}

/// Rank candidate families with explicit settings.
pub fn autosuggest_with(series: &FrequencySeries, config: &AutosuggestConfig) -> Result<AutosuggestReport> {
    let violations = config.validate();
    if !violations.is_empty() {
        return Err(EngineError::InvalidConfig(violations));
    }
    if series.len() < MIN_POINTS {
        return Err(EngineError::InsufficientData {
            needed: MIN_POINTS,
            got: series.len(),
        });
    }

    let features = extract_features(series, config);
    debug!(
        "autosuggest features: {} peak(s), width {:?}, symmetry {:?}, conductivity {}",
        features.peak_count, features.peak_width_decades, features.peak_symmetry, features.conductivity_detected
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.concurrency.unwrap_or(0))
        .build()
        .map_err(|e| EngineError::NumericalFailure(format!("failed to build worker pool: {e}")))?;
    let coarse: Vec<(ModelKind, Result<Coarse>)> = pool.install(|| {
        config
            .candidates
            .par_iter()
            .map(|kind| (*kind, coarse_fit(series, *kind, &features, config)))
            .collect()
    });

    let mut fitted = Vec::new();
    let mut skipped = Vec::new();
    for (kind, result) in coarse {
        match result {
            Ok(c) => fitted.push(c),
            Err(e) => {
                warn!("autosuggest: {kind} skipped: {e}");
                skipped.push((kind, e.to_string()));
            }
        }
    }
    if fitted.is_empty() {
        return Err(EngineError::NumericalFailure(
            "no candidate model produced a coarse fit".to_string(),
        ));
    }

    let best_bic = fitted
        .iter()
        .map(|c| c.statistics.bic)
        .fold(f64::INFINITY, f64::min);
    let mut ranked: Vec<Suggestion> = fitted
        .iter()
        .map(|c| score(c, best_bic, &features, config))
        .collect();
    let total: f64 = ranked.iter().map(|s| s.score.max(0.0)).sum();
    for s in ranked.iter_mut() {
        s.confidence = if total > 0.0 { s.score.max(0.0) / total } else { 0.0 };
    }
    // Stable sort keeps candidate order on ties.
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let evaluated = ranked.len();
    ranked.truncate(config.top_n);

    Ok(AutosuggestReport {
        suggestions: ranked,
        features,
        evaluated,
        skipped,
    })
}

fn extract_features(series: &FrequencySeries, config: &AutosuggestConfig) -> SeriesFeatures {
    let kk = match validate_series(series, &config.kk) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("autosuggest: KK check of the raw series failed: {e}");
            None
        }
    };

    let x: Vec<f64> = series.frequency_hz().iter().map(|f| f.log10()).collect();
    let imag = series.imag_part();
    let max = imag.iter().cloned().fold(0.0_f64, f64::max);
    let floor = config.peak_noise_floor * max;
    let peaks: Vec<_> = find_peaks(&x, imag, floor)
        .into_iter()
        .filter(|p| p.prominence >= floor)
        .collect();
    let tallest = peaks.iter().max_by(|a, b| a.height.total_cmp(&b.height));

    let low_frequency_slope = low_frequency_slope(&x, imag);
    SeriesFeatures {
        kk_rmse: kk.as_ref().map(|v| v.result.rmse),
        kk_mean_relative_error: kk.as_ref().map(|v| v.mean_relative_error),
        kk_status: kk.as_ref().map(|v| v.status),
        peak_count: peaks.len(),
        peak_frequencies_hz: peaks.iter().map(|p| series.frequency_hz()[p.index]).collect(),
        peak_symmetry: tallest.and_then(|p| p.symmetry),
        peak_width_decades: tallest.and_then(|p| p.width),
        low_frequency_slope,
        conductivity_detected: low_frequency_slope.is_some_and(|s| s < config.conductivity_slope),
    }
}

/// Slope of `log10 ε″` against `log10 f` over the lowest frequencies.
fn low_frequency_slope(log_f: &[f64], imag: &[f64]) -> Option<f64> {
    let count = ((log_f.len() as f64 * LOW_FREQUENCY_SHARE).ceil() as usize).max(MIN_POINTS);
    let (xs, ys): (Vec<f64>, Vec<f64>) = log_f
        .iter()
        .zip(imag)
        .take(count)
        .filter(|(_, v)| **v > 0.0)
        .map(|(x, v)| (*x, v.log10()))
        .unzip();
    if xs.len() < MIN_POINTS {
        return None;
    }
    linear_fit(&xs, &ys).map(|(_, slope)| slope)
}

#[derive(Debug, Clone)]
struct Coarse {
    model: ModelKind,
    num_terms: usize,
    include_conductivity: bool,
    statistics: FitStatistics,
}

fn coarse_fit(
    series: &FrequencySeries,
    kind: ModelKind,
    features: &SeriesFeatures,
    config: &AutosuggestConfig,
) -> Result<Coarse> {
    let def = kind.definition();
    let num_terms = if def.supports_multi_term && kind != ModelKind::Debye {
        features.peak_count.clamp(def.min_terms, def.max_terms)
    } else {
        def.default_terms
    };
    let mut model_config = default_config(kind, num_terms)?;
    if features.conductivity_detected {
        enable_conductivity(&mut model_config);
    }
    let options = SolverOptions {
        max_iterations: config.coarse_iterations,
        tolerance: config.coarse_tolerance,
        ..SolverOptions::default()
    };
    let session = fit(series, &model_config, &options)?;
    let statistics = compute_statistics(&session)?;
    Ok(Coarse {
        model: kind,
        num_terms,
        include_conductivity: features.conductivity_detected,
        statistics,
    })
}

/// How well a family's loss-peak shape matches the features, in `[0, 1]`.
fn shape_score(kind: ModelKind, features: &SeriesFeatures) -> (f64, &'static str) {
    let multi = features.peak_count >= 2;
    let none = features.peak_count == 0;
    let broad = features.is_broad();
    let asym = features.is_asymmetric();
    match kind {
        ModelKind::Debye if multi => (0.2, "single pole cannot produce several loss peaks"),
        ModelKind::Debye if none => (0.3, "no resolved loss peak"),
        ModelKind::Debye if broad || asym => (0.3, "loss peak is broader or more skewed than a Debye pole"),
        ModelKind::Debye => (1.0, "narrow symmetric loss peak matches a Debye pole"),
        ModelKind::MultiDebye if multi => (1.0, "several resolved loss peaks"),
        ModelKind::MultiDebye if broad => (0.5, "broad peak may be several overlapping poles"),
        ModelKind::MultiDebye => (0.3, "only one resolved loss peak"),
        ModelKind::DebyeLorentz if multi => (0.6, "several loss features"),
        ModelKind::DebyeLorentz => (0.4, "no resonance signature"),
        _ if multi => (0.3, "single-relaxation family cannot produce several peaks"),
        ModelKind::DjordjevicSarkar if none => (1.0, "flat wideband loss without a resolved peak"),
        ModelKind::DjordjevicSarkar if broad => (0.6, "very broad loss"),
        ModelKind::DjordjevicSarkar => (0.3, "resolved peak argues against flat wideband loss"),
        _ if none => (0.5, "no resolved loss peak"),
        ModelKind::ColeCole if broad && !asym => (1.0, "broad symmetric loss peak"),
        ModelKind::ColeCole if asym => (0.4, "loss peak is skewed"),
        ModelKind::ColeCole => (0.6, "symmetric loss peak"),
        ModelKind::ColeDavidson if asym => (1.0, "skewed loss peak"),
        ModelKind::ColeDavidson => (0.4, "loss peak is not skewed"),
        ModelKind::HavriliakNegami if asym && broad => (1.0, "broad skewed loss peak"),
        ModelKind::HavriliakNegami if asym || broad => (0.7, "broadened or skewed loss peak"),
        ModelKind::HavriliakNegami => (0.5, "general shape not required"),
    }
}

/// Agreement between the fitted curve's KK residual and the raw series',
/// in `(0, 1]`; neutral 0.5 when either is unavailable.
fn kk_agreement(model_kk: Option<f64>, raw_kk: Option<f64>, rmse: f64) -> f64 {
    match (model_kk, raw_kk) {
        (Some(m), Some(r)) => {
            let scale = r.max(rmse).max(1e-9);
            1.0 / (1.0 + (m - r).abs() / scale)
        }
        _ => 0.5,
    }
}

fn score(c: &Coarse, best_bic: f64, features: &SeriesFeatures, config: &AutosuggestConfig) -> Suggestion {
    let delta_bic = c.statistics.bic - best_bic;
    let info = (-delta_bic / 2.0).exp();
    let (shape, shape_reason) = shape_score(c.model, features);
    let kk = kk_agreement(c.statistics.kk_rmse, features.kk_rmse, c.statistics.rmse);
    let total = config.w_info * info + config.w_shape * shape + config.w_kk * kk;

    let mut rationale = vec![
        if delta_bic <= 0.0 {
            format!("best coarse BIC (RMSE {:.3e})", c.statistics.rmse)
        } else {
            format!("ΔBIC {delta_bic:.1} behind the best coarse fit")
        },
        shape_reason.to_string(),
        format!("KK agreement {kk:.2}"),
    ];
    if c.num_terms > 1 {
        rationale.push(format!("{} terms from {} resolved peaks", c.num_terms, features.peak_count));
    }
    if c.include_conductivity {
        rationale.push("low-frequency loss slope indicates DC conductivity".to_string());
    }

    Suggestion {
        model: c.model,
        num_terms: c.num_terms,
        include_conductivity: c.include_conductivity,
        score: total,
        confidence: 0.0,
        rationale,
        breakdown: ScoreBreakdown {
            info,
            shape,
            kk,
            delta_bic,
            aic: c.statistics.aic,
            bic: c.statistics.bic,
            rmse: c.statistics.rmse,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{angular_log_grid, synthesize};
    use crate::domain::ModelConfig;

    fn config_of(kind: ModelKind, terms: usize, values: &[(&str, f64)]) -> ModelConfig {
        let mut cfg = default_config(kind, terms).unwrap();
        for (name, v) in values {
            cfg.set_value(name, *v).unwrap();
        }
        cfg
    }

    #[test]
    fn broad_symmetric_peak_ranks_cole_cole_first() {
        let truth = config_of(
            ModelKind::ColeCole,
            1,
            &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6), ("alpha", 0.6)],
        );
        let series = synthesize(&truth, &angular_log_grid(1e2, 1e10, 100).unwrap(), 0.01, 3).unwrap();
        let report = autosuggest(&series).unwrap();

        assert_eq!(report.features.peak_count, 1);
        assert!(report.features.peak_width_decades.unwrap() > 2.0);
        assert!(report.features.peak_symmetry.unwrap() > 0.9);
        assert_eq!(report.suggestions.len(), 3);
        assert_eq!(report.suggestions[0].model, ModelKind::ColeCole);
        assert!(!report.suggestions[0].rationale.is_empty());
        for w in report.suggestions.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[test]
    fn two_peaks_suggest_two_debye_terms() {
        let truth = config_of(
            ModelKind::MultiDebye,
            2,
            &[("eps_inf", 3.0), ("delta_eps_1", 10.0), ("tau_1", 1e-6), ("delta_eps_2", 5.0), ("tau_2", 1e-3)],
        );
        let series = synthesize(&truth, &angular_log_grid(1e1, 1e9, 100).unwrap(), 0.01, 9).unwrap();
        let report = autosuggest(&series).unwrap();

        assert_eq!(report.features.peak_count, 2);
        let top = &report.suggestions[0];
        assert_eq!(top.model, ModelKind::MultiDebye);
        assert_eq!(top.num_terms, 2);
    }

    #[test]
    fn conductivity_tail_is_detected() {
        let mut truth = config_of(ModelKind::Debye, 1, &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6)]);
        enable_conductivity(&mut truth);
        truth.set_value("sigma_dc", 1e-6).unwrap();
        let series = synthesize(&truth, &angular_log_grid(1e2, 1e9, 80).unwrap(), 0.0, 0).unwrap();
        let report = autosuggest(&series).unwrap();

        assert!(report.features.conductivity_detected);
        assert!(report.features.low_frequency_slope.unwrap() < -0.9);
        assert!(report.suggestions.iter().all(|s| s.include_conductivity));
    }

    #[test]
    fn confidences_are_shares_of_the_total() {
        let truth = config_of(ModelKind::Debye, 1, &[("eps_inf", 3.0), ("delta_eps", 10.0), ("tau", 1e-6)]);
        let series = synthesize(&truth, &angular_log_grid(1e3, 1e9, 60).unwrap(), 0.01, 1).unwrap();
        let config = AutosuggestConfig {
            top_n: 10,
            concurrency: Some(2),
            ..AutosuggestConfig::default()
        };
        let report = autosuggest_with(&series, &config).unwrap();
        assert_eq!(report.evaluated + report.skipped.len(), config.candidates.len());
        let total: f64 = report.suggestions.iter().map(|s| s.confidence).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(report.features.kk_rmse.is_some());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let series = FrequencySeries::new(vec![1.0, 2.0, 3.0], vec![3.0; 3], vec![0.1; 3]).unwrap();
        let config = AutosuggestConfig {
            w_info: 0.0,
            w_shape: 0.0,
            w_kk: 0.0,
            top_n: 0,
            ..AutosuggestConfig::default()
        };
        let err = autosuggest_with(&series, &config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(ref v) if v.len() == 2));
    }

    #[test]
    fn short_series_is_insufficient() {
        let series = FrequencySeries::new(vec![1.0, 2.0], vec![3.0; 2], vec![0.1; 2]).unwrap();
        assert_eq!(
            autosuggest(&series).unwrap_err(),
            EngineError::InsufficientData { needed: 3, got: 2 }
        );
    }

    #[test]
    fn settings_load_from_partial_json() {
        let config: AutosuggestConfig = serde_json::from_str(r#"{"w_kk":0.0,"candidates":["debye","cole-cole"]}"#).unwrap();
        assert_eq!(config.w_kk, 0.0);
        assert_eq!(config.top_n, 3);
        assert_eq!(config.candidates, vec![ModelKind::Debye, ModelKind::ColeCole]);
    }
}
