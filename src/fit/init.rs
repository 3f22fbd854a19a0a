//! Data-driven initial guesses.
//!
//! Only parameters flagged `auto_initial` (and free to vary) are touched; the
//! rules are keyed on each parameter's role:
//!
//! - time constants: `1/ω_peak`, where `ω_peak` is the angular frequency of
//!   maximum loss; with several terms, one per resolved loss peak (or spread one
//!   decade apart around `ω_peak` when fewer peaks are resolved)
//! - strengths: twice the peak loss, shared evenly among strength slots
//! - `ε∞`: `ε′` at the highest frequency; `εs`: `ε∞` plus twice the peak loss
//! - corner frequencies: one decade outside the measured band
//! - resonance and damping: `ω_peak`
//! - conductivity: half of `ε₀·ω·ε″` at the lowest frequency
//!
//! Shape exponents keep their configured value. Every seeded value is clamped
//! to its bounds, and tie groups take the first member's seed. The result
//! depends only on the series and the configuration.

use log::warn;

use crate::domain::{FrequencySeries, ModelConfig, Transform};
use crate::math::find_peaks;
use crate::models::{ParameterRole, VACUUM_PERMITTIVITY, slots};

/// Share of the peak loss a secondary maximum must reach (in height and
/// prominence) to count as a peak.
const PEAK_FLOOR: f64 = 0.05;

/// Copy of `config` with every `auto_initial` parameter seeded from `series`.
pub fn initial_guess(series: &FrequencySeries, config: &ModelConfig) -> ModelConfig {
    let mut out = config.clone();
    let omega = series.angular_frequencies();
    let real = series.real_part();
    let imag = series.imag_part();
    let n = omega.len();
    if n == 0 {
        return out;
    }

    let (peak_idx, peak) = imag
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
    if n > 2 && (peak_idx == 0 || peak_idx == n - 1) {
        warn!("loss maximum at the band edge; time-constant seeds may be poor");
    }
    let peak = peak.max(0.0);
    let omega_peak = omega[peak_idx];
    let eps_inf = real[n - 1];

    let layout = slots(config.model, config.num_terms, config.include_conductivity);
    let strength_slots = layout
        .iter()
        .filter(|s| s.spec.role == ParameterRole::Strength)
        .count()
        .max(1);
    let taus = time_constants(series, &omega, omega_peak, config.num_terms);

    for (slot, p) in layout.iter().zip(out.parameters.iter_mut()) {
        if !(p.auto_initial && p.vary) {
            continue;
        }
        let term = slot.term.unwrap_or(0);
        let seed = match slot.spec.role {
            ParameterRole::Offset => Some(eps_inf),
            ParameterRole::Static => Some(eps_inf + 2.0 * peak),
            ParameterRole::Strength => Some(2.0 * peak / strength_slots as f64),
            ParameterRole::TimeConstant => Some(taus[term.min(taus.len() - 1)]),
            ParameterRole::Resonance | ParameterRole::Damping => Some(omega_peak),
            ParameterRole::LowerCorner => Some(omega[0] / 10.0),
            ParameterRole::UpperCorner => Some(omega[n - 1] * 10.0),
            ParameterRole::Conductivity => Some(0.5 * VACUUM_PERMITTIVITY * omega[0] * imag[0].max(0.0)),
            ParameterRole::Shape => None,
        };
        if let Some(v) = seed.filter(|v| v.is_finite()) {
            let lower = if p.transform == Transform::Log {
                p.lower.max(f64::MIN_POSITIVE)
            } else {
                p.lower
            };
            p.value = v.clamp(lower, p.upper);
        }
    }

    align_tie_groups(&mut out);
    out
}

/// One time constant per term, in ascending order.
fn time_constants(series: &FrequencySeries, omega: &[f64], omega_peak: f64, terms: usize) -> Vec<f64> {
    let terms = terms.max(1);
    if terms > 1 {
        let x: Vec<f64> = omega.iter().map(|w| w.log10()).collect();
        let max = series.imag_part().iter().cloned().fold(0.0_f64, f64::max);
        let mut peaks: Vec<_> = find_peaks(&x, series.imag_part(), PEAK_FLOOR * max)
            .into_iter()
            .filter(|p| p.prominence >= PEAK_FLOOR * max)
            .collect();
        if peaks.len() >= terms {
            peaks.sort_by(|a, b| b.height.total_cmp(&a.height));
            let mut taus: Vec<f64> = peaks[..terms].iter().map(|p| 1.0 / omega[p.index]).collect();
            taus.sort_by(|a, b| a.total_cmp(b));
            return taus;
        }
    }
    let centre = (terms as f64 - 1.0) / 2.0;
    (0..terms)
        .map(|t| 10f64.powf(t as f64 - centre) / omega_peak)
        .collect()
}

fn align_tie_groups(config: &mut ModelConfig) {
    let mut seen: Vec<(String, f64)> = Vec::new();
    for p in config.parameters.iter_mut() {
        let Some(group) = p.tie_group.clone() else {
            continue;
        };
        match seen.iter().find(|(g, _)| *g == group) {
            Some((_, v)) => p.value = *v,
            None => seen.push((group, p.value)),
        }
    }
}
