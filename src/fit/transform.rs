//! Mapping between model parameters and the optimizer's internal variables.
//!
//! - every free parameter (or tie group) becomes one internal variable
//! - `Transform::Log` parameters are optimized as `ln(value)`
//! - fixed parameters keep their configured value and never enter the optimizer
//! - bounds are carried over into internal space, so projecting onto them
//!   keeps every unpacked value inside `[lower, upper]`

use crate::domain::{ModelConfig, Transform};
use crate::error::{EngineError, Result, Violation};

#[derive(Debug, Clone)]
struct Variable {
    /// Parameter slots sharing this variable (more than one for a tie group).
    slots: Vec<usize>,
    transform: Transform,
    lower: f64,
    upper: f64,
    scale_hint: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ParameterPacker {
    base: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    variables: Vec<Variable>,
}

fn to_internal(transform: Transform, value: f64) -> f64 {
    match transform {
        Transform::Linear => value,
        Transform::Log => value.ln(),
    }
}

fn to_external(transform: Transform, z: f64) -> f64 {
    match transform {
        Transform::Linear => z,
        Transform::Log => z.exp(),
    }
}

impl ParameterPacker {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let mut variables: Vec<Variable> = Vec::new();
        let mut group_index: Vec<(&str, usize)> = Vec::new();
        let mut violations = Vec::new();

        for (slot, p) in config.parameters.iter().enumerate() {
            if p.transform == Transform::Log && (p.value <= 0.0 || p.lower <= 0.0) {
                violations.push(Violation::for_parameter(
                    p.name.clone(),
                    "log transform requires positive value and lower bound",
                ));
                continue;
            }
            if !p.vary {
                continue;
            }
            if let Some(group) = p.tie_group.as_deref() {
                if let Some((_, k)) = group_index.iter().find(|(g, _)| *g == group) {
                    variables[*k].slots.push(slot);
                    continue;
                }
                group_index.push((group, variables.len()));
            }
            variables.push(Variable {
                slots: vec![slot],
                transform: p.transform,
                lower: to_internal(p.transform, p.lower),
                upper: to_internal(p.transform, p.upper),
                scale_hint: p.scale_hint,
            });
        }
        if !violations.is_empty() {
            return Err(EngineError::InvalidConfig(violations));
        }

        Ok(Self {
            base: config.values(),
            lower: config.parameters.iter().map(|p| p.lower).collect(),
            upper: config.parameters.iter().map(|p| p.upper).collect(),
            variables,
        })
    }

    /// Number of internal (free) variables.
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Number of parameter slots (external vector length).
    pub fn slot_count(&self) -> usize {
        self.base.len()
    }

    /// Internal vector for a full external parameter vector.
    pub fn pack(&self, external: &[f64]) -> Vec<f64> {
        self.variables
            .iter()
            .map(|v| to_internal(v.transform, external[v.slots[0]]))
            .collect()
    }

    /// Full external parameter vector for an internal vector. Values are
    /// clamped to their bounds so round-off in `exp` never leaves them.
    pub fn unpack(&self, internal: &[f64]) -> Vec<f64> {
        let mut out = self.base.clone();
        for (v, z) in self.variables.iter().zip(internal) {
            let value = to_external(v.transform, *z);
            for &s in &v.slots {
                out[s] = value.clamp(self.lower[s], self.upper[s]);
            }
        }
        out
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.variables.iter().map(|v| v.lower).collect()
    }

    pub fn upper_bounds(&self) -> Vec<f64> {
        self.variables.iter().map(|v| v.upper).collect()
    }

    /// Project an internal vector onto the bounds.
    pub fn clamp(&self, internal: &mut [f64]) {
        for (z, v) in internal.iter_mut().zip(&self.variables) {
            *z = z.clamp(v.lower, v.upper);
        }
    }

    /// Slots controlled by variable `k`.
    pub fn slots(&self, k: usize) -> &[usize] {
        &self.variables[k].slots
    }

    /// `d(value)/dz` for variable `k` at internal value `z`.
    pub fn external_derivative(&self, k: usize, z: f64) -> f64 {
        match self.variables[k].transform {
            Transform::Linear => 1.0,
            Transform::Log => z.exp(),
        }
    }

    /// Standard deviation (internal units) of multistart perturbations:
    /// the parameter's `scale_hint`, else 0.5 in log space, else 10 % of the
    /// packed value (floored at a millionth of the bound range).
    pub fn perturbation_width(&self, k: usize) -> f64 {
        let v = &self.variables[k];
        v.scale_hint.unwrap_or(match v.transform {
            Transform::Log => 0.5,
            Transform::Linear => {
                let value = self.base[v.slots[0]].abs();
                0.1 * value.max(1e-6 * (v.upper - v.lower))
            }
        })
    }
}
