//! Static model registry.
//!
//! Every supported family is described by a [`ModelDefinition`]: its parameter
//! schema split into a block shared by all terms and a block repeated once per
//! term, plus term-count limits. The table is a `static` and is never mutated,
//! so concurrent sessions can read it freely.

use serde::{Deserialize, Serialize};

use crate::domain::{ModelKind, Transform};

/// What a parameter means physically. Drives the initial-guess policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRole {
    /// High-frequency permittivity `ε∞`.
    Offset,
    /// Static permittivity `εs`.
    Static,
    /// Relaxation or oscillator strength `Δε`.
    Strength,
    TimeConstant,
    /// Broadening exponent (α, β).
    Shape,
    LowerCorner,
    UpperCorner,
    Resonance,
    Damping,
    Conductivity,
}

/// Schema entry for one parameter of a model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub unit: &'static str,
    pub default: f64,
    pub lower: f64,
    pub upper: f64,
    pub transform: Transform,
    pub shared_across_terms: bool,
    pub role: ParameterRole,
}

/// One model family.
#[derive(Debug, Clone, Copy)]
pub struct ModelDefinition {
    pub kind: ModelKind,
    pub description: &'static str,
    /// Parameters appearing once regardless of term count.
    pub shared: &'static [ParameterSpec],
    /// Parameters repeated for every term.
    pub per_term: &'static [ParameterSpec],
    pub supports_multi_term: bool,
    pub min_terms: usize,
    pub max_terms: usize,
    pub default_terms: usize,
}

impl ModelDefinition {
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.display_name()
    }

    /// Schema in layout order (shared block, then one term block).
    pub fn parameters(&self) -> impl Iterator<Item = &'static ParameterSpec> {
        self.shared.iter().chain(self.per_term.iter())
    }

    /// Number of parameter slots for `num_terms` terms, excluding conductivity.
    pub fn parameter_count(&self, num_terms: usize) -> usize {
        self.shared.len() + self.per_term.len() * num_terms
    }

    pub fn accepts_terms(&self, num_terms: usize) -> bool {
        (self.min_terms..=self.max_terms).contains(&num_terms)
    }
}

/// Vacuum permittivity in F/m.
pub const VACUUM_PERMITTIVITY: f64 = 8.854_187_812_8e-12;

/// Appended last when a configuration includes DC conductivity.
pub const SIGMA_DC: ParameterSpec = ParameterSpec {
    name: "sigma_dc",
    unit: "S/m",
    default: 1e-9,
    lower: 1e-18,
    upper: 1e3,
    transform: Transform::Log,
    shared_across_terms: true,
    role: ParameterRole::Conductivity,
};

const EPS_INF: ParameterSpec = ParameterSpec {
    name: "eps_inf",
    unit: "",
    default: 3.0,
    lower: 1.0,
    upper: 1e3,
    transform: Transform::Linear,
    shared_across_terms: true,
    role: ParameterRole::Offset,
};

const DELTA_EPS: ParameterSpec = ParameterSpec {
    name: "delta_eps",
    unit: "",
    default: 1.0,
    lower: 0.0,
    upper: 1e5,
    transform: Transform::Linear,
    shared_across_terms: false,
    role: ParameterRole::Strength,
};

const TAU: ParameterSpec = ParameterSpec {
    name: "tau",
    unit: "s",
    default: 1e-6,
    lower: 1e-15,
    upper: 1e3,
    transform: Transform::Log,
    shared_across_terms: false,
    role: ParameterRole::TimeConstant,
};

const ALPHA: ParameterSpec = ParameterSpec {
    name: "alpha",
    unit: "",
    default: 0.9,
    lower: 0.01,
    upper: 1.0,
    transform: Transform::Linear,
    shared_across_terms: false,
    role: ParameterRole::Shape,
};

const BETA: ParameterSpec = ParameterSpec {
    name: "beta",
    ..ALPHA
};

const EPS_S: ParameterSpec = ParameterSpec {
    name: "eps_s",
    unit: "",
    default: 4.0,
    lower: 1.0,
    upper: 1e5,
    transform: Transform::Linear,
    shared_across_terms: false,
    role: ParameterRole::Static,
};

const OMEGA_1: ParameterSpec = ParameterSpec {
    name: "omega_1",
    unit: "rad/s",
    default: 1e3,
    lower: 1e-3,
    upper: 1e18,
    transform: Transform::Log,
    shared_across_terms: false,
    role: ParameterRole::LowerCorner,
};

const OMEGA_2: ParameterSpec = ParameterSpec {
    name: "omega_2",
    default: 1e12,
    role: ParameterRole::UpperCorner,
    ..OMEGA_1
};

const DELTA_EPS_L: ParameterSpec = ParameterSpec {
    name: "delta_eps_l",
    ..DELTA_EPS
};

const OMEGA_0: ParameterSpec = ParameterSpec {
    name: "omega_0",
    default: 1e9,
    role: ParameterRole::Resonance,
    ..OMEGA_1
};

const GAMMA: ParameterSpec = ParameterSpec {
    name: "gamma",
    default: 1e8,
    role: ParameterRole::Damping,
    ..OMEGA_1
};

static REGISTRY: [ModelDefinition; 7] = [
    ModelDefinition {
        kind: ModelKind::Debye,
        description: "eps_inf + sum of delta_eps / (1 + i w tau)",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, TAU],
        supports_multi_term: true,
        min_terms: 1,
        max_terms: 8,
        default_terms: 1,
    },
    ModelDefinition {
        kind: ModelKind::ColeCole,
        description: "eps_inf + delta_eps / (1 + (i w tau)^alpha)",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, TAU, ALPHA],
        supports_multi_term: false,
        min_terms: 1,
        max_terms: 1,
        default_terms: 1,
    },
    ModelDefinition {
        kind: ModelKind::ColeDavidson,
        description: "eps_inf + delta_eps / (1 + i w tau)^beta",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, TAU, BETA],
        supports_multi_term: false,
        min_terms: 1,
        max_terms: 1,
        default_terms: 1,
    },
    ModelDefinition {
        kind: ModelKind::HavriliakNegami,
        description: "eps_inf + (eps_s - eps_inf) / (1 + (i w tau)^alpha)^beta",
        shared: &[EPS_INF],
        per_term: &[EPS_S, TAU, ALPHA, BETA],
        supports_multi_term: false,
        min_terms: 1,
        max_terms: 1,
        default_terms: 1,
    },
    ModelDefinition {
        kind: ModelKind::MultiDebye,
        description: "eps_inf + sum over N >= 2 Debye poles",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, TAU],
        supports_multi_term: true,
        min_terms: 2,
        max_terms: 8,
        default_terms: 2,
    },
    ModelDefinition {
        kind: ModelKind::DjordjevicSarkar,
        description: "eps_inf + delta_eps / ln(w2/w1) * ln((w2 + i w) / (w1 + i w))",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, OMEGA_1, OMEGA_2],
        supports_multi_term: false,
        min_terms: 1,
        max_terms: 1,
        default_terms: 1,
    },
    ModelDefinition {
        kind: ModelKind::DebyeLorentz,
        description: "eps_inf + sum of Debye poles and damped Lorentz oscillators",
        shared: &[EPS_INF],
        per_term: &[DELTA_EPS, TAU, DELTA_EPS_L, OMEGA_0, GAMMA],
        supports_multi_term: true,
        min_terms: 1,
        max_terms: 4,
        default_terms: 1,
    },
];

/// All registered families, in [`ModelKind::ALL`] order.
pub fn all() -> &'static [ModelDefinition] {
    &REGISTRY
}

/// Look a family up by its stable code (e.g. `"cole-cole"`).
pub fn lookup(code: &str) -> Option<&'static ModelDefinition> {
    REGISTRY.iter().find(|d| d.code() == code)
}

impl ModelKind {
    pub fn definition(self) -> &'static ModelDefinition {
        match self {
            ModelKind::Debye => &REGISTRY[0],
            ModelKind::ColeCole => &REGISTRY[1],
            ModelKind::ColeDavidson => &REGISTRY[2],
            ModelKind::HavriliakNegami => &REGISTRY[3],
            ModelKind::MultiDebye => &REGISTRY[4],
            ModelKind::DjordjevicSarkar => &REGISTRY[5],
            ModelKind::DebyeLorentz => &REGISTRY[6],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_order_matches_kind_list() {
        for (def, kind) in all().iter().zip(ModelKind::ALL) {
            assert_eq!(def.kind, kind);
            assert_eq!(kind.definition().kind, kind);
        }
    }

    #[test]
    fn lookup_by_code() {
        let def = lookup("havriliak-negami").unwrap();
        assert_eq!(def.kind, ModelKind::HavriliakNegami);
        assert!(lookup("lorentz-only").is_none());
    }

    #[test]
    fn schema_defaults_lie_within_bounds() {
        for def in all() {
            for spec in def.parameters().chain(std::iter::once(&SIGMA_DC)) {
                assert!(spec.lower <= spec.default && spec.default <= spec.upper, "{}", spec.name);
                if spec.transform == Transform::Log {
                    assert!(spec.lower > 0.0, "{}", spec.name);
                }
            }
        }
    }

    #[test]
    fn only_debye_variants_are_multi_term() {
        let multi: Vec<_> = all()
            .iter()
            .filter(|d| d.supports_multi_term)
            .map(|d| d.kind)
            .collect();
        assert_eq!(
            multi,
            vec![ModelKind::Debye, ModelKind::MultiDebye, ModelKind::DebyeLorentz]
        );
    }
}
