//! Session-Start Categorization & Budget Allocation
//!
//! Session-start recall returns curated categories:
//! - `core`: expiry = core, listed first, never budget-constrained
//! - `active`: open todos (not session-only)
//! - `preferences`: preferences and decisions
//! - `recent`: everything else
//!
//! With a token budget B, active and preferences each get floor(0.3 B) and
//! recent the remainder; each section fills greedily in score order by
//! estimated token cost, and leftover budget becomes an overflow pool
//! consumed by the highest-scored remaining candidates across sections.

use crate::memory::{EntryType, Expiry, StoredEntry};

use super::RecallResult;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Session-start knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Candidate pool size for session-start recall
    pub candidate_limit: usize,
    /// Recency window for permanent entries (days)
    pub permanent_window_days: i64,
    /// Recency window for temporary entries (days)
    pub temporary_window_days: i64,
    /// Budget share of the active-todos section
    pub active_quota: f64,
    /// Budget share of the preferences section
    pub preferences_quota: f64,
    /// Tokens-per-word estimate
    pub token_cost_factor: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 500,
            permanent_window_days: 30,
            temporary_window_days: 7,
            active_quota: 0.3,
            preferences_quota: 0.3,
            token_cost_factor: 1.3,
        }
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Categorized session-start candidates, each section score-ordered
#[derive(Debug, Default)]
pub struct SessionSections {
    /// expiry = core
    pub core: Vec<RecallResult>,
    /// Open todos
    pub active: Vec<RecallResult>,
    /// Preferences and decisions
    pub preferences: Vec<RecallResult>,
    /// Everything else
    pub recent: Vec<RecallResult>,
}

/// Estimated token cost: 1.3 x word count over type + subject + content +
/// lifecycle flags + tags
pub fn estimate_tokens(entry: &StoredEntry, factor: f64) -> usize {
    let mut words = 1; // type label
    words += entry.subject.split_whitespace().count();
    words += entry.content.split_whitespace().count();
    words += entry.tags.len();
    words += 1; // expiry flag
    if entry.entry_type == EntryType::Todo {
        words += 1;
    }
    ((words as f64) * factor).ceil() as usize
}

/// Partition scored candidates into session sections
///
/// The recent section applies the dead-band tie-break: candidates whose
/// scores differ by less than `dead_band` order by `updated_at` descending.
pub fn categorize(results: Vec<RecallResult>, dead_band: f64) -> SessionSections {
    let mut sections = SessionSections::default();

    for result in results {
        let entry = &result.entry;
        if entry.expiry == Expiry::Core {
            sections.core.push(result);
        } else if entry.entry_type == EntryType::Todo && entry.expiry != Expiry::SessionOnly {
            sections.active.push(result);
        } else if matches!(
            entry.entry_type,
            EntryType::Preference | EntryType::Decision
        ) {
            sections.preferences.push(result);
        } else {
            sections.recent.push(result);
        }
    }

    let by_score = |a: &RecallResult, b: &RecallResult| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    };
    sections.core.sort_by(by_score);
    sections.active.sort_by(by_score);
    sections.preferences.sort_by(by_score);

    sections.recent.sort_by(|a, b| {
        if (a.score - b.score).abs() < dead_band {
            b.entry.updated_at.cmp(&a.entry.updated_at)
        } else {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    });

    sections
}

/// Apply the token budget; returns the final ordered result list
/// (core first, then the budgeted sections, then overflow picks)
pub fn allocate_budget(
    sections: SessionSections,
    budget: Option<usize>,
    config: &SessionConfig,
) -> Vec<RecallResult> {
    let SessionSections {
        core,
        active,
        preferences,
        recent,
    } = sections;

    let Some(budget) = budget else {
        // No budget: sections concatenate in section order
        let mut out = core;
        out.extend(active);
        out.extend(preferences);
        out.extend(recent);
        return out;
    };

    let active_budget = (config.active_quota * budget as f64).floor() as usize;
    let preferences_budget = (config.preferences_quota * budget as f64).floor() as usize;
    let recent_budget = budget.saturating_sub(active_budget + preferences_budget);

    let mut leftover = 0usize;
    let mut overflow_pool: Vec<RecallResult> = Vec::new();

    let mut fill = |candidates: Vec<RecallResult>, section_budget: usize| -> Vec<RecallResult> {
        let mut remaining = section_budget;
        let mut chosen = Vec::new();
        for candidate in candidates {
            let cost = estimate_tokens(&candidate.entry, config.token_cost_factor);
            if cost <= remaining {
                remaining -= cost;
                chosen.push(candidate);
            } else {
                overflow_pool.push(candidate);
            }
        }
        leftover += remaining;
        chosen
    };

    let mut picked_active = fill(active, active_budget);
    let mut picked_preferences = fill(preferences, preferences_budget);
    let mut picked_recent = fill(recent, recent_budget);

    // Leftover budget spills to the highest-scored remaining candidates,
    // regardless of section
    overflow_pool.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut overflow_picks = Vec::new();
    for candidate in overflow_pool {
        let cost = estimate_tokens(&candidate.entry, config.token_cost_factor);
        if cost <= leftover {
            leftover -= cost;
            overflow_picks.push(candidate);
        }
    }

    let mut out = core;
    out.append(&mut picked_active);
    out.append(&mut picked_preferences);
    out.append(&mut picked_recent);
    out.extend(overflow_picks);
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Scope;
    use crate::recall::scoring::ScoreBreakdown;
    use chrono::{Duration, Utc};

    fn result(
        id: &str,
        entry_type: EntryType,
        expiry: Expiry,
        score: f64,
        content_words: usize,
    ) -> RecallResult {
        let now = Utc::now();
        let entry = StoredEntry {
            id: id.into(),
            entry_type,
            subject: "subject words".into(),
            content: vec!["word"; content_words].join(" "),
            canonical_key: None,
            subject_key: None,
            importance: 7,
            expiry,
            scope: Scope::Private,
            platform: None,
            project: None,
            tags: vec![],
            source_file: None,
            source_context: None,
            content_hash: id.into(),
            created_at: now,
            updated_at: now,
            last_recalled_at: None,
            recall_count: 0,
            confirmations: 0,
            contradictions: 0,
            recall_intervals: vec![],
            superseded_by: None,
            retired: false,
            retired_at: None,
            retired_reason: None,
            suppressed_contexts: vec![],
            has_embedding: true,
        };
        RecallResult {
            score,
            scores: ScoreBreakdown {
                total: score,
                ..Default::default()
            },
            entry,
        }
    }

    #[test]
    fn test_categorization() {
        let results = vec![
            result("core1", EntryType::Fact, Expiry::Core, 0.9, 5),
            result("todo1", EntryType::Todo, Expiry::Permanent, 0.8, 5),
            result("todo-session", EntryType::Todo, Expiry::SessionOnly, 0.8, 5),
            result("pref1", EntryType::Preference, Expiry::Permanent, 0.7, 5),
            result("dec1", EntryType::Decision, Expiry::Permanent, 0.6, 5),
            result("fact1", EntryType::Fact, Expiry::Permanent, 0.5, 5),
        ];
        let sections = categorize(results, 0.05);
        assert_eq!(sections.core.len(), 1);
        assert_eq!(sections.active.len(), 1);
        assert_eq!(sections.preferences.len(), 2);
        // Session-only todo falls to recent, alongside the plain fact
        assert_eq!(sections.recent.len(), 2);
    }

    #[test]
    fn test_dead_band_ordering_in_recent() {
        let now = Utc::now();
        let mut older = result("older", EntryType::Fact, Expiry::Permanent, 0.52, 5);
        older.entry.updated_at = now - Duration::days(5);
        let newer = result("newer", EntryType::Fact, Expiry::Permanent, 0.50, 5);

        // Scores within the dead band: newer updated_at wins
        let sections = categorize(vec![older.clone(), newer.clone()], 0.05);
        assert_eq!(sections.recent[0].entry.id, "newer");

        // Outside the dead band score wins
        let mut much_better = older;
        much_better.score = 0.70;
        let sections = categorize(vec![newer, much_better], 0.05);
        assert_eq!(sections.recent[0].entry.id, "older");
    }

    #[test]
    fn test_token_estimate() {
        let r = result("e", EntryType::Fact, Expiry::Permanent, 0.5, 10);
        // 1 type + 2 subject + 10 content + 0 tags + 1 expiry = 14 words
        assert_eq!(estimate_tokens(&r.entry, 1.3), (14.0_f64 * 1.3).ceil() as usize);
    }

    #[test]
    fn test_budget_quotas_and_bound() {
        // Entries cost ~17-20 tokens each
        let results = vec![
            result("c1", EntryType::Fact, Expiry::Core, 0.99, 10),
            result("t1", EntryType::Todo, Expiry::Permanent, 0.9, 10),
            result("t2", EntryType::Todo, Expiry::Permanent, 0.8, 10),
            result("t3", EntryType::Todo, Expiry::Permanent, 0.7, 10),
            result("p1", EntryType::Preference, Expiry::Permanent, 0.85, 10),
            result("p2", EntryType::Decision, Expiry::Permanent, 0.65, 10),
            result("f1", EntryType::Fact, Expiry::Permanent, 0.6, 10),
            result("f2", EntryType::Fact, Expiry::Permanent, 0.55, 10),
        ];
        let config = SessionConfig::default();
        let budget = 100;
        let picked = allocate_budget(categorize(results, 0.05), Some(budget), &config);

        // Core is always present and outside the budget
        assert_eq!(picked[0].entry.id, "c1");

        // Budget bound: everything except core fits in the budget
        let non_core_cost: usize = picked
            .iter()
            .filter(|r| r.entry.expiry != Expiry::Core)
            .map(|r| estimate_tokens(&r.entry, config.token_cost_factor))
            .sum();
        assert!(non_core_cost <= budget, "cost {non_core_cost} > budget {budget}");

        // Sections: 30 tokens per quota fits one ~20-token entry each, and
        // the overflow pool consumes the leftovers
        let ids: Vec<&str> = picked.iter().map(|r| r.entry.id.as_str()).collect();
        assert!(ids.contains(&"t1"));
        assert!(ids.contains(&"p1"));
    }

    #[test]
    fn test_overflow_spills_by_score() {
        // Tiny active/preferences sections leave budget on the table;
        // the spill goes to the best-scored leftover
        let results = vec![
            result("t1", EntryType::Todo, Expiry::Permanent, 0.9, 2),
            result("f1", EntryType::Fact, Expiry::Permanent, 0.85, 8),
            result("f2", EntryType::Fact, Expiry::Permanent, 0.4, 8),
            result("f3", EntryType::Fact, Expiry::Permanent, 0.8, 8),
        ];
        let config = SessionConfig::default();
        let picked = allocate_budget(categorize(results, 0.05), Some(60), &config);
        let ids: Vec<&str> = picked.iter().map(|r| r.entry.id.as_str()).collect();

        assert!(ids.contains(&"t1"));
        // recent budget = 60 - 18 - 18 = 24: fits one ~15-token fact, the
        // rest compete for the overflow by score
        assert!(ids.contains(&"f1"));
        assert!(ids.contains(&"f3"));
    }

    #[test]
    fn test_no_budget_returns_all() {
        let results = vec![
            result("c1", EntryType::Fact, Expiry::Core, 0.9, 5),
            result("f1", EntryType::Fact, Expiry::Permanent, 0.5, 5),
        ];
        let picked = allocate_budget(categorize(results, 0.05), None, &SessionConfig::default());
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].entry.id, "c1");
    }
}
