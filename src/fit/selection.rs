//! Choosing among completed sessions.
//!
//! Sessions are scored once (statistics cached next to the session) and then
//! compared with pure functions:
//!
//! - `select_best_by_aic`: lowest AIC, ties broken by input order; the
//!   multistart pick
//! - `select_by_bic`: lowest BIC, but if a model with fewer free parameters is
//!   within ΔBIC ≤ 2 of the best, prefer the simpler model
//!
//! Sessions that did not complete (or cannot be scored) are skipped with a
//! reason rather than failing the whole selection.

use crate::domain::FitStatistics;
use crate::diagnostics::compute_statistics;
use crate::fit::session::FittingSession;

/// BIC difference below which the simpler model is preferred.
const BIC_TOLERANCE: f64 = 2.0;

/// A session together with its statistics.
#[derive(Debug, Clone)]
pub struct ScoredSession {
    pub session: FittingSession,
    pub statistics: FitStatistics,
}

/// Score every completed session.
///
/// Returns the scored sessions in input order plus `(index, reason)` for each
/// session that was skipped.
pub fn score_sessions(sessions: Vec<FittingSession>) -> (Vec<ScoredSession>, Vec<(usize, String)>) {
    let mut scored = Vec::new();
    let mut skipped = Vec::new();
    for (i, session) in sessions.into_iter().enumerate() {
        match compute_statistics(&session) {
            Ok(statistics) => scored.push(ScoredSession {
                session,
                statistics,
            }),
            Err(e) => skipped.push((i, e.to_string())),
        }
    }
    (scored, skipped)
}

/// Lowest-AIC session; the first one wins ties.
pub fn select_best_by_aic(scored: &[ScoredSession]) -> Option<&ScoredSession> {
    let mut best: Option<&ScoredSession> = None;
    for s in scored.iter().filter(|s| s.statistics.aic.is_finite()) {
        if best.is_none_or(|b| s.statistics.aic < b.statistics.aic) {
            best = Some(s);
        }
    }
    best
}

/// Lowest-BIC session, preferring fewer free parameters within ΔBIC ≤ 2.
pub fn select_by_bic(scored: &[ScoredSession]) -> Option<&ScoredSession> {
    let finite: Vec<&ScoredSession> = scored.iter().filter(|s| s.statistics.bic.is_finite()).collect();
    let mut best = *finite.first()?;
    for s in &finite[1..] {
        if s.statistics.bic < best.statistics.bic {
            best = *s;
        }
    }
    let best_bic = best.statistics.bic;

    // Walk from simplest to most complex and take the first close-enough fit.
    let mut by_complexity = finite.clone();
    by_complexity.sort_by_key(|s| s.statistics.n_free);
    by_complexity
        .into_iter()
        .find(|s| s.statistics.bic <= best_bic + BIC_TOLERANCE)
        .or(Some(best))
}
