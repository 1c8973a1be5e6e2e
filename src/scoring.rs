//! Recency, importance and composite ranking scores.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default recency half-life.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 7.0;

/// Importance assigned when a turn carries no signals.
pub const DEFAULT_IMPORTANCE: f64 = 0.2;

/// Importance assigned to signals not in [`signal_weight`]'s table.
pub const UNKNOWN_SIGNAL_WEIGHT: f64 = 0.3;

/// Weight of a named importance signal.
pub fn signal_weight(signal: &str) -> f64 {
    match signal {
        "user_correction" => 0.9,
        "user_preference" => 0.85,
        "decision" => 0.8,
        "error_correction" => 0.8,
        "commitment" => 0.75,
        "repeated_topic" => 0.6,
        "technical_detail" => 0.5,
        "general" => DEFAULT_IMPORTANCE,
        _ => UNKNOWN_SIGNAL_WEIGHT,
    }
}

/// Ranking profile for composite scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    #[default]
    Balanced,
    Recency,
    Importance,
}

impl RankingStrategy {
    /// Parse a strategy name, falling back to `Balanced` for unknown names.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "recency" => Self::Recency,
            "importance" => Self::Importance,
            _ => Self::Balanced,
        }
    }

    /// `(semantic, recency, importance)` weights.
    pub fn weights(&self) -> (f64, f64, f64) {
        match self {
            Self::Balanced => (0.4, 0.3, 0.3),
            Self::Recency => (0.3, 0.5, 0.2),
            Self::Importance => (0.3, 0.2, 0.5),
        }
    }
}

impl FromStr for RankingStrategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl std::fmt::Display for RankingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::Recency => write!(f, "recency"),
            Self::Importance => write!(f, "importance"),
        }
    }
}

/// Exponential decay by age: 1.0 now, 0.5 after one half-life.
///
/// Timestamps in the future are treated as age zero.
pub fn compute_recency_score_at(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let age_days = ((now - created_at).num_milliseconds() as f64 / 86_400_000.0).max(0.0);
    if half_life_days <= 0.0 {
        return if age_days == 0.0 { 1.0 } else { 0.0 };
    }
    (-std::f64::consts::LN_2 * age_days / half_life_days).exp()
}

/// Recency relative to the current time.
pub fn compute_recency_score(created_at: DateTime<Utc>, half_life_days: f64) -> f64 {
    compute_recency_score_at(created_at, Utc::now(), half_life_days)
}

/// Importance of a new record: the strongest signal, capped at 1.0.
pub fn compute_importance_score<S: AsRef<str>>(signals: &[S]) -> f64 {
    signals
        .iter()
        .map(|s| signal_weight(s.as_ref()))
        .fold(None, |best: Option<f64>, w| Some(best.map_or(w, |b| b.max(w))))
        .unwrap_or(DEFAULT_IMPORTANCE)
        .min(1.0)
}

/// Weighted blend of similarity, recency and importance.
pub fn compute_composite_score(
    semantic_similarity: f64,
    recency: f64,
    importance: f64,
    strategy: RankingStrategy,
) -> f64 {
    let (w_sem, w_rec, w_imp) = strategy.weights();
    w_sem * semantic_similarity + w_rec * recency + w_imp * importance
}

/// Clamp an importance value into `[0, 1]`.
pub fn clamp_importance(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
