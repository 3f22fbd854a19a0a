//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - passed in from the application layer (series, model configs)
//! - used in-memory during fitting
//! - handed back for persistence/export without depending on engine internals
//!
//! Sign convention: complex permittivity is `ε* = ε′ − iε″`. A
//! [`FrequencySeries`] stores the loss `ε″` as a positive number, so a model's
//! predicted loss is `−Im(ε*)`.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Measured (or model-evaluated) permittivity versus frequency.
///
/// Invariants, checked on construction: equal-length columns, at least one
/// point, all values finite, frequencies positive and strictly increasing.
/// The series is immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SeriesColumns", into = "SeriesColumns")]
pub struct FrequencySeries {
    frequency_hz: Vec<f64>,
    real_part: Vec<f64>,
    imag_part: Vec<f64>,
}

/// Raw column form used for (de)serialization; validated into a series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesColumns {
    pub frequency_hz: Vec<f64>,
    pub real_part: Vec<f64>,
    pub imag_part: Vec<f64>,
}

impl FrequencySeries {
    pub fn new(frequency_hz: Vec<f64>, real_part: Vec<f64>, imag_part: Vec<f64>) -> Result<Self> {
        if frequency_hz.len() != real_part.len() || frequency_hz.len() != imag_part.len() {
            return Err(EngineError::InvalidGrid(format!(
                "column lengths differ: {} frequencies, {} real, {} imaginary",
                frequency_hz.len(),
                real_part.len(),
                imag_part.len()
            )));
        }
        if frequency_hz.is_empty() {
            return Err(EngineError::InsufficientData { needed: 1, got: 0 });
        }
        if let Some(i) = frequency_hz.iter().position(|f| !f.is_finite() || *f <= 0.0) {
            return Err(EngineError::InvalidGrid(format!(
                "frequency at index {i} is not a positive finite number ({})",
                frequency_hz[i]
            )));
        }
        if let Some(i) = frequency_hz.windows(2).position(|w| w[1] <= w[0]) {
            return Err(EngineError::InvalidGrid(format!(
                "frequencies must be strictly increasing (index {} -> {})",
                i,
                i + 1
            )));
        }
        let bad_value = real_part
            .iter()
            .chain(imag_part.iter())
            .any(|v| !v.is_finite());
        if bad_value {
            return Err(EngineError::InvalidGrid(
                "permittivity values contain NaN or infinity".to_string(),
            ));
        }
        Ok(Self {
            frequency_hz,
            real_part,
            imag_part,
        })
    }

    /// Build a series from dielectric constant (Dk) and dissipation factor
    /// (Df = tanδ), using `ε″ = Dk · Df`.
    pub fn from_loss_tangent(frequency_hz: Vec<f64>, dk: Vec<f64>, df: Vec<f64>) -> Result<Self> {
        if dk.len() != df.len() {
            return Err(EngineError::InvalidGrid(format!(
                "Dk has {} values but Df has {}",
                dk.len(),
                df.len()
            )));
        }
        let imag = dk.iter().zip(df.iter()).map(|(k, d)| k * d).collect();
        Self::new(frequency_hz, dk, imag)
    }

    pub fn len(&self) -> usize {
        self.frequency_hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequency_hz.is_empty()
    }

    pub fn frequency_hz(&self) -> &[f64] {
        &self.frequency_hz
    }

    /// `ε′` column.
    pub fn real_part(&self) -> &[f64] {
        &self.real_part
    }

    /// `ε″` column (positive loss).
    pub fn imag_part(&self) -> &[f64] {
        &self.imag_part
    }

    /// `ω = 2πf` in rad/s.
    pub fn angular_frequencies(&self) -> Vec<f64> {
        self.frequency_hz.iter().map(|f| 2.0 * PI * f).collect()
    }

    /// `tanδ = ε″ / ε′` (NaN where `ε′ = 0`).
    pub fn loss_tangent(&self) -> Vec<f64> {
        self.real_part
            .iter()
            .zip(self.imag_part.iter())
            .map(|(re, im)| if *re == 0.0 { f64::NAN } else { im / re })
            .collect()
    }

    /// Whether frequencies are linearly (uniformly) spaced.
    pub fn is_uniform_grid(&self) -> bool {
        if self.frequency_hz.len() < 3 {
            return true;
        }
        let first = self.frequency_hz[1] - self.frequency_hz[0];
        self.frequency_hz
            .windows(2)
            .all(|w| ((w[1] - w[0]) - first).abs() <= 1e-8 + 1e-5 * first.abs())
    }
}

impl TryFrom<SeriesColumns> for FrequencySeries {
    type Error = EngineError;

    fn try_from(value: SeriesColumns) -> Result<Self> {
        Self::new(value.frequency_hz, value.real_part, value.imag_part)
    }
}

impl From<FrequencySeries> for SeriesColumns {
    fn from(value: FrequencySeries) -> Self {
        Self {
            frequency_hz: value.frequency_hz,
            real_part: value.real_part,
            imag_part: value.imag_part,
        }
    }
}

/// Model family identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Debye,
    ColeCole,
    ColeDavidson,
    HavriliakNegami,
    MultiDebye,
    DjordjevicSarkar,
    DebyeLorentz,
}

impl ModelKind {
    pub const ALL: [ModelKind; 7] = [
        ModelKind::Debye,
        ModelKind::ColeCole,
        ModelKind::ColeDavidson,
        ModelKind::HavriliakNegami,
        ModelKind::MultiDebye,
        ModelKind::DjordjevicSarkar,
        ModelKind::DebyeLorentz,
    ];

    /// Stable identifier used by the application layer.
    pub fn code(self) -> &'static str {
        match self {
            ModelKind::Debye => "debye",
            ModelKind::ColeCole => "cole-cole",
            ModelKind::ColeDavidson => "cole-davidson",
            ModelKind::HavriliakNegami => "havriliak-negami",
            ModelKind::MultiDebye => "multi-debye",
            ModelKind::DjordjevicSarkar => "djordjevic-sarkar",
            ModelKind::DebyeLorentz => "debye-lorentz",
        }
    }

    /// Human-readable label.
    pub fn display_name(self) -> &'static str {
        match self {
            ModelKind::Debye => "Debye",
            ModelKind::ColeCole => "Cole-Cole",
            ModelKind::ColeDavidson => "Cole-Davidson",
            ModelKind::HavriliakNegami => "Havriliak-Negami",
            ModelKind::MultiDebye => "Multi-Debye",
            ModelKind::DjordjevicSarkar => "Djordjevic-Sarkar",
            ModelKind::DebyeLorentz => "Debye-Lorentz",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Mapping between a parameter and the optimizer's internal variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Internal variable is the value itself.
    Linear,
    /// Internal variable is `ln(value)`; requires `value > 0`.
    Log,
}

/// One concrete parameter of a [`ModelConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    pub transform: Transform,
    /// Members of the same group are optimized as one shared variable.
    #[serde(default)]
    pub tie_group: Option<String>,
    /// Fixed parameters keep their value and do not count as free.
    #[serde(default = "default_true")]
    pub vary: bool,
    /// Perturbation width (internal units) for multistart seeds.
    #[serde(default)]
    pub scale_hint: Option<f64>,
    /// When set, the fitter replaces `value` with a data-driven initial guess.
    #[serde(default)]
    pub auto_initial: bool,
}

fn default_true() -> bool {
    true
}

/// Concrete instantiation of a model family, consumed by the fitting engine.
///
/// Parameter layout: parameters shared across terms first, then the per-term
/// block repeated `num_terms` times, then `sigma_dc` when conductivity is
/// included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: ModelKind,
    pub num_terms: usize,
    #[serde(default)]
    pub include_conductivity: bool,
    pub parameters: Vec<ParameterValue>,
}

impl ModelConfig {
    /// Current parameter values in layout order.
    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ParameterValue> {
        self.parameters.iter_mut().find(|p| p.name == name)
    }

    /// Set an explicit initial value (disables the data-driven guess for it).
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        let p = self.parameter_mut(name).ok_or_else(|| unknown_parameter(name))?;
        p.value = value;
        p.auto_initial = false;
        Ok(())
    }

    pub fn set_bounds(&mut self, name: &str, lower: f64, upper: f64) -> Result<()> {
        let p = self.parameter_mut(name).ok_or_else(|| unknown_parameter(name))?;
        p.lower = lower;
        p.upper = upper;
        Ok(())
    }

    /// Hold a parameter at `value` during the fit.
    pub fn fix(&mut self, name: &str, value: f64) -> Result<()> {
        let p = self.parameter_mut(name).ok_or_else(|| unknown_parameter(name))?;
        p.value = value;
        p.vary = false;
        p.auto_initial = false;
        Ok(())
    }

    /// Put the named parameters in one tie group.
    ///
    /// Members must already agree on value, bounds and transform; use
    /// [`crate::models::validate_config`] to check.
    pub fn tie(&mut self, group: &str, names: &[&str]) -> Result<()> {
        for name in names {
            let p = self.parameter_mut(name).ok_or_else(|| unknown_parameter(name))?;
            p.tie_group = Some(group.to_string());
        }
        Ok(())
    }

    /// Number of optimizer variables (tie groups count once, fixed parameters not at all).
    pub fn free_parameter_count(&self) -> usize {
        let mut groups: Vec<&str> = Vec::new();
        let mut count = 0;
        for p in self.parameters.iter().filter(|p| p.vary) {
            match p.tie_group.as_deref() {
                Some(g) if groups.contains(&g) => {}
                Some(g) => {
                    groups.push(g);
                    count += 1;
                }
                None => count += 1,
            }
        }
        count
    }
}

fn unknown_parameter(name: &str) -> EngineError {
    EngineError::invalid_config(format!("unknown parameter '{name}'"))
}

/// Goodness-of-fit statistics for a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitStatistics {
    /// RMSE over the combined (unweighted) real and imaginary residuals.
    pub rmse: f64,
    /// Sum of squared weighted residuals.
    pub chi_squared: f64,
    pub reduced_chi_squared: f64,
    pub r_squared: f64,
    pub adjusted_r_squared: f64,
    pub aic: f64,
    pub bic: f64,
    pub degrees_of_freedom: usize,
    /// Number of residual values (two per frequency point).
    pub n_values: usize,
    pub n_free: usize,
    pub max_abs_residual: f64,
    pub mean_abs_residual: f64,
    /// KK-consistency RMSE of the fitted model curve (None if the grid is too short).
    pub kk_rmse: Option<f64>,
}

/// Residual-structure tests for a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualDiagnostics {
    pub durbin_watson: f64,
    /// Two-sided Wald–Wolfowitz runs-test p-value on residual signs.
    pub runs_p_value: f64,
    /// Shapiro–Francia (Q–Q correlation) normality p-value.
    pub qq_normality_p_value: f64,
    pub qq_correlation: f64,
    pub lag1_autocorrelation: f64,
    pub n: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_rejects_non_monotonic_frequencies() {
        let err = FrequencySeries::new(vec![1.0, 3.0, 2.0], vec![1.0; 3], vec![0.1; 3]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrid(_)));
    }

    #[test]
    fn series_rejects_non_positive_and_nan() {
        let err = FrequencySeries::new(vec![0.0, 1.0], vec![1.0; 2], vec![0.1; 2]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrid(_)));

        let err = FrequencySeries::new(vec![1.0, 2.0], vec![1.0, f64::NAN], vec![0.1; 2]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidGrid(_)));
    }

    #[test]
    fn loss_tangent_constructor_multiplies_dk_df() {
        let s = FrequencySeries::from_loss_tangent(vec![1e9, 2e9], vec![4.0, 3.0], vec![0.01, 0.02]).unwrap();
        assert!((s.imag_part()[0] - 0.04).abs() < 1e-15);
        assert!((s.loss_tangent()[1] - 0.02).abs() < 1e-15);
    }

    #[test]
    fn deserialization_enforces_invariants() {
        let bad = r#"{"frequency_hz":[2.0,1.0],"real_part":[1.0,1.0],"imag_part":[0.0,0.0]}"#;
        assert!(serde_json::from_str::<FrequencySeries>(bad).is_err());

        let good = r#"{"frequency_hz":[1.0,2.0],"real_part":[1.0,1.0],"imag_part":[0.0,0.0]}"#;
        let s: FrequencySeries = serde_json::from_str(good).unwrap();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn uniform_grid_detection() {
        let s = FrequencySeries::new(vec![1.0, 2.0, 3.0, 4.0], vec![1.0; 4], vec![0.0; 4]).unwrap();
        assert!(s.is_uniform_grid());
        let s = FrequencySeries::new(vec![1.0, 10.0, 100.0], vec![1.0; 3], vec![0.0; 3]).unwrap();
        assert!(!s.is_uniform_grid());
    }

    #[test]
    fn model_codes_round_trip() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_code(kind.code()), Some(kind));
        }
    }
}
