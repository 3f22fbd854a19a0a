//! Model evaluation and configuration checks.
//!
//! The fitter relies on a handful of primitive operations:
//! - map a flat parameter vector onto shared/per-term slots (`ParameterLayout`)
//! - evaluate complex permittivity `ε*(ω)` for a parameter vector (`evaluate`)
//! - build and validate concrete configurations (`default_config`, `validate_config`)
//! - put multi-term results into a canonical order after fitting
//!   (`canonical_permutation`)
//!
//! Evaluation follows `ε* = ε′ − iε″` (time dependence `e^{iωt}`): every
//! relaxation term has a negative imaginary part, i.e. positive loss.

use std::f64::consts::FRAC_PI_2;

use num_complex::Complex64;

use crate::domain::{ModelConfig, ModelKind, ParameterValue, Transform};
use crate::error::{EngineError, Result, Violation};
use crate::models::registry::{
    ModelDefinition, ParameterRole, ParameterSpec, SIGMA_DC, VACUUM_PERMITTIVITY,
};

/// Position of each parameter block inside a flat parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub shared: usize,
    pub per_term: usize,
    pub num_terms: usize,
    pub conductivity: bool,
}

impl ParameterLayout {
    pub fn new(kind: ModelKind, num_terms: usize, conductivity: bool) -> Self {
        let def = kind.definition();
        Self {
            shared: def.shared.len(),
            per_term: def.per_term.len(),
            num_terms,
            conductivity,
        }
    }

    pub fn for_config(config: &ModelConfig) -> Self {
        Self::new(config.model, config.num_terms, config.include_conductivity)
    }

    /// Total number of parameter slots.
    pub fn len(&self) -> usize {
        self.shared + self.per_term * self.num_terms + usize::from(self.conductivity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first slot of term `t`.
    pub fn term_offset(&self, t: usize) -> usize {
        self.shared + t * self.per_term
    }

    pub fn conductivity_index(&self) -> Option<usize> {
        self.conductivity.then(|| self.len() - 1)
    }
}

/// Schema entry for one concrete slot of a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub name: String,
    pub spec: &'static ParameterSpec,
    /// Term index for per-term parameters.
    pub term: Option<usize>,
}

/// Expand the registry schema into named slots in layout order.
pub fn slots(kind: ModelKind, num_terms: usize, conductivity: bool) -> Vec<Slot> {
    let def = kind.definition();
    let mut out = Vec::with_capacity(ParameterLayout::new(kind, num_terms, conductivity).len());
    for spec in def.shared {
        out.push(Slot {
            name: spec.name.to_string(),
            spec,
            term: None,
        });
    }
    for t in 0..num_terms {
        for spec in def.per_term {
            let name = if num_terms > 1 {
                format!("{}_{}", spec.name, t + 1)
            } else {
                spec.name.to_string()
            };
            out.push(Slot {
                name,
                spec,
                term: Some(t),
            });
        }
    }
    if conductivity {
        out.push(Slot {
            name: SIGMA_DC.name.to_string(),
            spec: &SIGMA_DC,
            term: None,
        });
    }
    out
}

/// Evaluate complex permittivity at each angular frequency.
pub fn evaluate(
    kind: ModelKind,
    omegas: &[f64],
    params: &[f64],
    layout: &ParameterLayout,
) -> Result<Vec<Complex64>> {
    let def = kind.definition();
    if !def.accepts_terms(layout.num_terms) {
        return Err(EngineError::invalid_config(format!(
            "{} accepts {}..={} terms, got {}",
            def.name(),
            def.min_terms,
            def.max_terms,
            layout.num_terms
        )));
    }
    if params.len() != layout.len() {
        return Err(EngineError::invalid_config(format!(
            "{} with {} term(s) expects {} parameters, got {}",
            def.name(),
            layout.num_terms,
            layout.len(),
            params.len()
        )));
    }
    Ok(omegas
        .iter()
        .map(|&w| point_response(kind, w, params, layout))
        .collect())
}

/// Evaluate a configuration at its current parameter values.
pub fn evaluate_config(config: &ModelConfig, omegas: &[f64]) -> Result<Vec<Complex64>> {
    evaluate(
        config.model,
        omegas,
        &config.values(),
        &ParameterLayout::for_config(config),
    )
}

fn point_response(kind: ModelKind, omega: f64, params: &[f64], layout: &ParameterLayout) -> Complex64 {
    let eps_inf = params[0];
    let mut eps = Complex64::new(eps_inf, 0.0);
    for t in 0..layout.num_terms {
        let start = layout.term_offset(t);
        eps += term_response(kind, omega, eps_inf, &params[start..start + layout.per_term]);
    }
    if let Some(i) = layout.conductivity_index() {
        eps += Complex64::new(0.0, -params[i] / (VACUUM_PERMITTIVITY * omega));
    }
    eps
}

/// `(iωτ)^a` on the principal branch.
fn fractional_power(omega_tau: f64, a: f64) -> Complex64 {
    Complex64::from_polar(omega_tau.powf(a), a * FRAC_PI_2)
}

fn term_response(kind: ModelKind, omega: f64, eps_inf: f64, term: &[f64]) -> Complex64 {
    let one = Complex64::new(1.0, 0.0);
    match kind {
        ModelKind::Debye | ModelKind::MultiDebye => {
            let (d, tau) = (term[0], term[1]);
            d / Complex64::new(1.0, omega * tau)
        }
        ModelKind::ColeCole => {
            let (d, tau, alpha) = (term[0], term[1], term[2]);
            d / (one + fractional_power(omega * tau, alpha))
        }
        ModelKind::ColeDavidson => {
            let (d, tau, beta) = (term[0], term[1], term[2]);
            d / Complex64::new(1.0, omega * tau).powf(beta)
        }
        ModelKind::HavriliakNegami => {
            let (eps_s, tau, alpha, beta) = (term[0], term[1], term[2], term[3]);
            (eps_s - eps_inf) / (one + fractional_power(omega * tau, alpha)).powf(beta)
        }
        ModelKind::DjordjevicSarkar => {
            let (d, w1, w2) = (term[0], term[1], term[2]);
            let span = (w2 / w1).ln();
            if span.abs() < 1e-12 {
                // Coincident corners collapse to a single Debye pole at w1.
                return d * w1 / Complex64::new(w1, omega);
            }
            let ratio = Complex64::new(w2, omega) / Complex64::new(w1, omega);
            d / span * ratio.ln()
        }
        ModelKind::DebyeLorentz => {
            let (d, tau, dl, w0, gamma) = (term[0], term[1], term[2], term[3], term[4]);
            let debye = d / Complex64::new(1.0, omega * tau);
            let lorentz = dl * w0 * w0 / Complex64::new(w0 * w0 - omega * omega, gamma * omega);
            debye + lorentz
        }
    }
}

fn value_from_spec(name: String, spec: &ParameterSpec, value: f64) -> ParameterValue {
    ParameterValue {
        name,
        value,
        lower: spec.lower,
        upper: spec.upper,
        transform: spec.transform,
        tie_group: None,
        vary: true,
        scale_hint: None,
        auto_initial: spec.role != ParameterRole::Shape,
    }
}

/// Build a configuration with registry defaults.
///
/// Values are placeholders: data-dependent parameters are flagged
/// `auto_initial` and re-seeded from the series when a fit starts. Time
/// constants of multi-term models are spread one decade apart so the terms
/// are distinguishable.
pub fn default_config(kind: ModelKind, num_terms: usize) -> Result<ModelConfig> {
    let def = kind.definition();
    if !def.accepts_terms(num_terms) {
        return Err(EngineError::InvalidConfig(vec![Violation::new(format!(
            "{} accepts {}..={} terms, got {}",
            def.name(),
            def.min_terms,
            def.max_terms,
            num_terms
        ))]));
    }
    let centre = (num_terms as f64 - 1.0) / 2.0;
    let parameters = slots(kind, num_terms, false)
        .into_iter()
        .map(|slot| {
            let mut value = slot.spec.default;
            if slot.spec.role == ParameterRole::TimeConstant {
                let t = slot.term.unwrap_or(0) as f64;
                value = (value * 10f64.powf(t - centre)).clamp(slot.spec.lower, slot.spec.upper);
            }
            value_from_spec(slot.name, slot.spec, value)
        })
        .collect();
    Ok(ModelConfig {
        model: kind,
        num_terms,
        include_conductivity: false,
        parameters,
    })
}

/// Registry defaults for the model's own term count.
pub fn default_config_for(def: &ModelDefinition) -> Result<ModelConfig> {
    default_config(def.kind, def.default_terms)
}

/// Append the DC-conductivity parameter if it is not already present.
pub fn enable_conductivity(config: &mut ModelConfig) {
    if config.include_conductivity {
        return;
    }
    config.include_conductivity = true;
    config
        .parameters
        .push(value_from_spec(SIGMA_DC.name.to_string(), &SIGMA_DC, SIGMA_DC.default));
}

/// Check a configuration; an empty list means it is valid.
pub fn validate_config(config: &ModelConfig) -> Vec<Violation> {
    let def = config.model.definition();
    let mut out = Vec::new();

    if !def.accepts_terms(config.num_terms) {
        out.push(Violation::new(format!(
            "{} accepts {}..={} terms, got {}",
            def.name(),
            def.min_terms,
            def.max_terms,
            config.num_terms
        )));
        return out;
    }

    let expected = slots(config.model, config.num_terms, config.include_conductivity);
    if expected.len() != config.parameters.len() {
        out.push(Violation::new(format!(
            "expected {} parameters for {} with {} term(s), got {}",
            expected.len(),
            def.name(),
            config.num_terms,
            config.parameters.len()
        )));
        return out;
    }

    for (slot, p) in expected.iter().zip(config.parameters.iter()) {
        if slot.name != p.name {
            out.push(Violation::for_parameter(
                p.name.clone(),
                format!("expected parameter '{}' at this position", slot.name),
            ));
        }
        check_bounds(p, &mut out);
        check_role(slot.spec.role, p, &mut out);
    }

    check_ties(config, &mut out);
    check_model_constraints(config, &expected, &mut out);
    out
}

fn check_bounds(p: &ParameterValue, out: &mut Vec<Violation>) {
    if !(p.value.is_finite() && p.lower.is_finite() && p.upper.is_finite()) {
        out.push(Violation::for_parameter(p.name.clone(), "value and bounds must be finite"));
        return;
    }
    if p.lower > p.upper {
        out.push(Violation::for_parameter(
            p.name.clone(),
            format!("lower bound {} exceeds upper bound {}", p.lower, p.upper),
        ));
    }
    if p.value < p.lower || p.value > p.upper {
        out.push(Violation::for_parameter(
            p.name.clone(),
            format!("value {} outside [{}, {}]", p.value, p.lower, p.upper),
        ));
    }
    if p.transform == Transform::Log && p.lower <= 0.0 {
        out.push(Violation::for_parameter(
            p.name.clone(),
            "log transform requires a strictly positive lower bound",
        ));
    }
}

fn check_role(role: ParameterRole, p: &ParameterValue, out: &mut Vec<Violation>) {
    let v = p.value;
    let bad = match role {
        ParameterRole::Shape => !(v > 0.0 && v <= 1.0) || p.lower <= 0.0 || p.upper > 1.0,
        ParameterRole::Strength | ParameterRole::Conductivity => v < 0.0 || p.lower < 0.0,
        ParameterRole::TimeConstant
        | ParameterRole::Resonance
        | ParameterRole::Damping
        | ParameterRole::LowerCorner
        | ParameterRole::UpperCorner => v <= 0.0 || p.lower <= 0.0,
        ParameterRole::Offset | ParameterRole::Static => v <= 0.0,
    };
    if bad {
        let msg = match role {
            ParameterRole::Shape => "shape exponent and its bounds must lie in (0, 1]",
            ParameterRole::Strength => "relaxation strength must be non-negative",
            ParameterRole::Conductivity => "conductivity must be non-negative",
            ParameterRole::Offset | ParameterRole::Static => "permittivity must be positive",
            _ => "rates and time constants must be positive",
        };
        out.push(Violation::for_parameter(p.name.clone(), msg));
    }
}

fn check_ties(config: &ModelConfig, out: &mut Vec<Violation>) {
    let mut groups: Vec<(&str, Vec<&ParameterValue>)> = Vec::new();
    for p in &config.parameters {
        if let Some(g) = p.tie_group.as_deref() {
            match groups.iter_mut().find(|(name, _)| *name == g) {
                Some((_, members)) => members.push(p),
                None => groups.push((g, vec![p])),
            }
        }
    }
    for (group, members) in groups {
        if members.len() < 2 {
            out.push(Violation::new(format!(
                "tie group '{group}' has a single member"
            )));
            continue;
        }
        let first = members[0];
        let consistent = members.iter().all(|m| {
            m.value == first.value
                && m.lower == first.lower
                && m.upper == first.upper
                && m.transform == first.transform
                && m.vary == first.vary
        });
        if !consistent {
            out.push(Violation::new(format!(
                "tie group '{group}' members must share value, bounds, transform and vary flag"
            )));
        }
    }
}

fn check_model_constraints(config: &ModelConfig, slots: &[Slot], out: &mut Vec<Violation>) {
    let find = |role: ParameterRole, term: Option<usize>| {
        slots
            .iter()
            .position(|s| s.spec.role == role && s.term == term)
            .map(|i| &config.parameters[i])
    };
    match config.model {
        ModelKind::HavriliakNegami => {
            if let (Some(inf), Some(st)) = (
                find(ParameterRole::Offset, None),
                find(ParameterRole::Static, Some(0)),
            ) {
                if st.value < inf.value {
                    out.push(Violation::for_parameter(
                        st.name.clone(),
                        "static permittivity must not be below eps_inf",
                    ));
                }
            }
        }
        ModelKind::DjordjevicSarkar => {
            if let (Some(w1), Some(w2)) = (
                find(ParameterRole::LowerCorner, Some(0)),
                find(ParameterRole::UpperCorner, Some(0)),
            ) {
                if w1.value >= w2.value {
                    out.push(Violation::for_parameter(
                        w1.name.clone(),
                        "lower corner frequency must be below the upper corner",
                    ));
                }
            }
        }
        _ => {}
    }
}

/// Permutation that puts a fitted configuration into canonical order.
///
/// Multi-term models are sorted by ascending time constant; the
/// Djordjević–Sarkar corners are ordered `ω₁ < ω₂`. `perm[i]` is the old index
/// of the slot that lands at index `i`. Returns `None` when the order is already
/// canonical or the slots cannot be exchanged (different bounds, transforms,
/// vary flags, tie groups, or equal keys).
pub fn canonical_permutation(config: &ModelConfig) -> Option<Vec<usize>> {
    let layout = ParameterLayout::for_config(config);
    if config.parameters.len() != layout.len() {
        return None;
    }
    let params = &config.parameters;
    let exchangeable = |a: &ParameterValue, b: &ParameterValue| {
        a.lower == b.lower
            && a.upper == b.upper
            && a.transform == b.transform
            && a.vary == b.vary
            && a.tie_group.is_none()
            && b.tie_group.is_none()
    };
    let mut perm: Vec<usize> = (0..layout.len()).collect();

    match config.model {
        ModelKind::DjordjevicSarkar => {
            let (i1, i2) = (layout.term_offset(0) + 1, layout.term_offset(0) + 2);
            if params[i1].value > params[i2].value && exchangeable(&params[i1], &params[i2]) {
                perm.swap(i1, i2);
                return Some(perm);
            }
            None
        }
        ModelKind::Debye | ModelKind::MultiDebye | ModelKind::DebyeLorentz
            if layout.num_terms > 1 =>
        {
            let def = config.model.definition();
            let tau_pos = def
                .per_term
                .iter()
                .position(|s| s.role == ParameterRole::TimeConstant)?;
            for k in 0..layout.per_term {
                let first = &params[layout.term_offset(0) + k];
                let ok = (0..layout.num_terms)
                    .all(|t| exchangeable(first, &params[layout.term_offset(t) + k]));
                if !ok {
                    return None;
                }
            }
            let tau = |t: usize| params[layout.term_offset(t) + tau_pos].value;
            let mut order: Vec<usize> = (0..layout.num_terms).collect();
            order.sort_by(|a, b| tau(*a).total_cmp(&tau(*b)));
            if order.windows(2).any(|w| tau(w[0]) == tau(w[1])) {
                return None;
            }
            if order.iter().enumerate().all(|(i, t)| i == *t) {
                return None;
            }
            for (new_t, old_t) in order.into_iter().enumerate() {
                for k in 0..layout.per_term {
                    perm[layout.term_offset(new_t) + k] = layout.term_offset(old_t) + k;
                }
            }
            Some(perm)
        }
        _ => None,
    }
}
