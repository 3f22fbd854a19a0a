//! Engine-wide settings bundle.
//!
//! The application layer usually keeps one JSON (or TOML) document with the
//! solver, KK and autosuggest settings. Missing sections and fields fall back
//! to their defaults.

use serde::{Deserialize, Serialize};

use crate::diagnostics::AutosuggestConfig;
use crate::error::{EngineError, Result, Violation};
use crate::fit::SolverOptions;
use crate::kk::KkOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub solver: SolverOptions,
    pub kk: KkOptions,
    pub autosuggest: AutosuggestConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| EngineError::InvalidConfig(vec![Violation::new(format!("config parse error: {e}"))]))?;
        let violations = config.validate();
        if !violations.is_empty() {
            return Err(EngineError::InvalidConfig(violations));
        }
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::NumericalFailure(format!("config serialization error: {e}")))
    }

    /// Every problem across all sections.
    pub fn validate(&self) -> Vec<Violation> {
        let mut out = self.solver.validate();
        out.extend(self.kk.validate());
        out.extend(self.autosuggest.validate());
        out
    }
}
