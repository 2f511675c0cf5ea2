//! Recall Scoring
//!
//! A pure function from `(entry, similarity, now)` to a score with a full
//! breakdown, so evaluation harnesses can diff scoring decisions without
//! touching I/O. All weights and half-lives live in [`ScoringConfig`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::{EntryType, StoredEntry};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Scoring weights and half-lives
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Weight of raw cosine similarity
    pub similarity_weight: f64,
    /// Weight of normalized importance
    pub importance_weight: f64,
    /// Weight of exponential freshness
    pub freshness_weight: f64,
    /// Weight of memory strength
    pub strength_weight: f64,
    /// Freshness half-life in days
    pub freshness_half_life_days: f64,
    /// Additive freshness boost for important entries
    pub importance_freshness_boost: f64,
    /// Importance at or above which the freshness boost applies
    pub freshness_boost_min_importance: i64,
    /// Log calibration constant: recall_count = 10 lands near 0.85
    pub strength_log_k: f64,
    /// Spacing-factor range low end
    pub spacing_min: f64,
    /// Spacing-factor range high end
    pub spacing_max: f64,
    /// Median recall gap (days) mapping to the top of the spacing range
    pub spacing_gap_cap_days: f64,
    /// Todo staleness half-life in days
    pub todo_half_life_days: f64,
    /// Todo decay floor
    pub todo_floor: f64,
    /// Todo decay floor for important todos
    pub todo_floor_important: f64,
    /// Importance at or above which the higher todo floor applies
    pub todo_importance_floor: i64,
    /// Scores within this distance count as tied (recent-section ordering)
    pub dead_band: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.5,
            importance_weight: 0.25,
            freshness_weight: 0.25,
            strength_weight: 0.25,
            freshness_half_life_days: 30.0,
            importance_freshness_boost: 0.05,
            freshness_boost_min_importance: 6,
            strength_log_k: 16.0,
            spacing_min: 1.0,
            spacing_max: 1.3,
            spacing_gap_cap_days: 30.0,
            todo_half_life_days: 7.0,
            todo_floor: 0.10,
            todo_floor_important: 0.40,
            todo_importance_floor: 8,
            dead_band: 0.05,
        }
    }
}

// ============================================================================
// BREAKDOWN
// ============================================================================

/// Per-factor breakdown alongside the total
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdown {
    /// Raw cosine (0 when the query had no text)
    pub similarity: f64,
    /// importance / 10
    pub importance: f64,
    /// exp(-age / half-life), plus the importance boost
    pub freshness: f64,
    /// clamp(log-calibrated recall base * spacing factor, 0, 1)
    pub memory_strength: f64,
    /// Todo decay multiplier (1.0 for non-todos)
    pub todo_staleness: f64,
    /// Weighted total
    pub total: f64,
}

// ============================================================================
// SCORING
// ============================================================================

/// Score one candidate
pub fn score(
    entry: &StoredEntry,
    similarity: f64,
    now: DateTime<Utc>,
    config: &ScoringConfig,
) -> ScoreBreakdown {
    let age_days = entry.age_days(now);

    let importance = entry.importance as f64 / 10.0;

    let mut freshness = (-age_days / config.freshness_half_life_days).exp();
    if entry.importance >= config.freshness_boost_min_importance {
        freshness = (freshness + config.importance_freshness_boost).min(1.0);
    }

    let memory_strength = memory_strength(entry, now, config);

    let todo_staleness = if entry.entry_type == EntryType::Todo {
        let floor = if entry.importance >= config.todo_importance_floor {
            config.todo_floor_important
        } else {
            config.todo_floor
        };
        0.5_f64
            .powf(age_days / config.todo_half_life_days)
            .max(floor)
    } else {
        1.0
    };

    let weighted = config.similarity_weight * similarity
        + config.importance_weight * importance
        + config.freshness_weight * freshness
        + config.strength_weight * memory_strength;

    ScoreBreakdown {
        similarity,
        importance,
        freshness,
        memory_strength,
        todo_staleness,
        total: weighted * todo_staleness,
    }
}

/// Memory strength: log-calibrated recall count times the spacing factor
pub fn memory_strength(entry: &StoredEntry, now: DateTime<Utc>, config: &ScoringConfig) -> f64 {
    if entry.recall_count == 0 {
        return 0.0;
    }

    let base =
        ((1.0 + entry.recall_count as f64).ln() / (1.0 + config.strength_log_k).ln()).min(1.0);

    let intervals = if entry.recall_intervals.is_empty() {
        imputed_intervals(entry, now)
    } else {
        entry.recall_intervals.clone()
    };

    (base * spacing_factor(&intervals, config)).clamp(0.0, 1.0)
}

/// Spacing factor from inter-recall gaps: proven long gaps push the factor
/// toward the top of the range
fn spacing_factor(intervals: &[i64], config: &ScoringConfig) -> f64 {
    if intervals.len() < 2 {
        return config.spacing_min;
    }

    let mut gaps: Vec<f64> = intervals
        .windows(2)
        .map(|w| ((w[1] - w[0]).max(0)) as f64 / 86_400.0)
        .collect();
    gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let median = if gaps.len() % 2 == 1 {
        gaps[gaps.len() / 2]
    } else {
        (gaps[gaps.len() / 2 - 1] + gaps[gaps.len() / 2]) / 2.0
    };

    let clipped = median.clamp(0.0, config.spacing_gap_cap_days);
    config.spacing_min
        + (config.spacing_max - config.spacing_min) * (clipped / config.spacing_gap_cap_days)
}

/// Impute interval stamps for rows written before interval tracking:
/// `recall_count` stamps spread between `created_at` and
/// `last_recalled_at`, the last one landing exactly on `last_recalled_at`
/// (including `recall_count = 1`).
fn imputed_intervals(entry: &StoredEntry, now: DateTime<Utc>) -> Vec<i64> {
    let count = entry.recall_count.max(0) as usize;
    if count == 0 {
        return Vec::new();
    }

    let last = entry
        .last_recalled_at
        .unwrap_or(now)
        .timestamp();
    if count == 1 {
        return vec![last];
    }

    let first = entry.created_at.timestamp().min(last);
    let span = (last - first).max(0);
    let step = span / (count as i64 - 1).max(1);
    (0..count as i64)
        .map(|i| {
            if i == count as i64 - 1 {
                last
            } else {
                first + i * step
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
