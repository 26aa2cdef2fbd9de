//! RLM (relevant local memory): per-agent token-bounded context.
//!
//! An agent loads only its domain's files plus whatever a story asks
//! for, kept under a token budget by an LRU cache. The scoper ranks
//! files by import distance; the spawner delegates subtasks to
//! depth-limited child agents.

pub mod cache;
pub mod context;
pub mod scoper;
pub mod subagent;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// Rate and budget limits, loaded from `config/rlm.json`.
///
/// A missing file yields the defaults: 60 requests/minute, 100k
/// tokens/minute, $50/day, alerts at 80%.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmLimits {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_percent: f64,
    #[serde(default)]
    pub moderation_enabled: bool,
}

fn default_requests_per_minute() -> u32 {
    60
}
fn default_tokens_per_minute() -> u64 {
    100_000
}
fn default_daily_budget_usd() -> f64 {
    50.0
}
fn default_alert_threshold() -> f64 {
    80.0
}

impl Default for RlmLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            daily_budget_usd: default_daily_budget_usd(),
            alert_threshold_percent: default_alert_threshold(),
            moderation_enabled: false,
        }
    }
}

impl RlmLimits {
    /// Load from `config/rlm.json`; absent file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid {}", path.display()))
    }
}

/// Per-story token usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoryUsage {
    pub story_id: String,
    pub tokens_used: i64,
}

/// Tracks baseline (full codebase) versus actual (domain-scoped) token
/// usage to verify the context-reduction target.
#[derive(Debug, Default)]
pub struct TokenTracker {
    baseline_tokens: i64,
    actual_tokens: i64,
    per_story: HashMap<String, StoryUsage>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the full-codebase baseline.
    pub fn set_baseline(&mut self, full_codebase_tokens: i64) {
        self.baseline_tokens = full_codebase_tokens;
    }

    /// Record actual domain-scoped usage, optionally per story.
    pub fn record_actual(&mut self, tokens_used: i64, story_id: Option<&str>) {
        self.actual_tokens = tokens_used;
        if let Some(story_id) = story_id {
            let usage = self
                .per_story
                .entry(story_id.to_owned())
                .or_insert_with(|| StoryUsage {
                    story_id: story_id.to_owned(),
                    tokens_used: 0,
                });
            usage.tokens_used = tokens_used;
        }
    }

    /// Percentage reduction from baseline to actual.
    pub fn reduction_percent(&self) -> f64 {
        if self.baseline_tokens <= 0 {
            return 0.0;
        }
        let reduction = self.baseline_tokens - self.actual_tokens;
        (reduction as f64 / self.baseline_tokens as f64) * 100.0
    }

    /// Whether the >50% reduction target is met.
    pub fn meets_target(&self) -> bool {
        self.reduction_percent() > 50.0
    }

    pub fn per_story(&self) -> &HashMap<String, StoryUsage> {
        &self.per_story
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_default_values() {
        let limits = RlmLimits::default();
        assert_eq!(limits.requests_per_minute, 60);
        assert_eq!(limits.tokens_per_minute, 100_000);
        assert_eq!(limits.daily_budget_usd, 50.0);
        assert_eq!(limits.alert_threshold_percent, 80.0);
    }

    #[test]
    fn limits_missing_file_means_defaults() {
        let limits = RlmLimits::load(Path::new("/nonexistent/rlm.json")).unwrap();
        assert_eq!(limits.requests_per_minute, 60);
    }

    #[test]
    fn limits_partial_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rlm.json");
        std::fs::write(&path, r#"{"requests_per_minute": 10}"#).unwrap();

        let limits = RlmLimits::load(&path).unwrap();
        assert_eq!(limits.requests_per_minute, 10);
        assert_eq!(limits.tokens_per_minute, 100_000);
    }

    #[test]
    fn tracker_measures_reduction() {
        let mut tracker = TokenTracker::new();
        tracker.set_baseline(200_000);
        tracker.record_actual(80_000, Some("AUTH-001"));

        assert!((tracker.reduction_percent() - 60.0).abs() < 1e-9);
        assert!(tracker.meets_target());
        assert_eq!(tracker.per_story()["AUTH-001"].tokens_used, 80_000);
    }

    #[test]
    fn tracker_below_target() {
        let mut tracker = TokenTracker::new();
        tracker.set_baseline(100_000);
        tracker.record_actual(60_000, None);
        assert!(!tracker.meets_target());
    }

    #[test]
    fn tracker_zero_baseline() {
        let tracker = TokenTracker::new();
        assert_eq!(tracker.reduction_percent(), 0.0);
    }
}
