//! Token and cost budget tracking.
//!
//! Per-story counters with threshold alerts: NORMAL below 75%,
//! WARNING from 75%, CRITICAL from 90%, EXCEEDED from 100%. In
//! hard-limit mode an exceeded budget is not allowed to continue and
//! drives the emergency-stop path.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default per-story token limit.
pub const DEFAULT_TOKEN_LIMIT: i64 = 100_000;

/// Alert thresholds in percent.
pub const WARNING_THRESHOLD: f64 = 75.0;
pub const CRITICAL_THRESHOLD: f64 = 90.0;
pub const EXCEEDED_THRESHOLD: f64 = 100.0;

/// Budget alert levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Exceeded => "EXCEEDED",
        };
        f.write_str(s)
    }
}

impl AlertLevel {
    /// Level for a percentage of budget used.
    pub fn for_percent(percent: f64) -> Self {
        if percent >= EXCEEDED_THRESHOLD {
            Self::Exceeded
        } else if percent >= CRITICAL_THRESHOLD {
            Self::Critical
        } else if percent >= WARNING_THRESHOLD {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub level: AlertLevel,
    pub percent_used: f64,
}

/// Per-story budget counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub tokens_used: i64,
    pub token_limit: i64,
    pub cost_used_usd: f64,
    pub cost_limit_usd: f64,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            tokens_used: 0,
            token_limit: DEFAULT_TOKEN_LIMIT,
            cost_used_usd: 0.0,
            cost_limit_usd: 2.0,
        }
    }
}

/// Estimate token count for text, roughly four characters per token.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() / 4) as i64
}

/// Per-model USD rates per million tokens (input, output).
pub fn model_rates(model: &str) -> (f64, f64) {
    match model {
        "haiku" => (0.80, 4.00),
        "opus" => (15.00, 75.00),
        // Sonnet is the workhorse default.
        _ => (3.00, 15.00),
    }
}

/// Estimate the cost of a call in USD.
pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let (input_rate, output_rate) = model_rates(model);
    (input_tokens as f64 / 1_000_000.0) * input_rate
        + (output_tokens as f64 / 1_000_000.0) * output_rate
}

/// Check token usage against a limit.
pub fn check_budget(tokens_used: i64, token_limit: i64, hard_limit: bool) -> BudgetCheck {
    let percent_used = if token_limit <= 0 {
        100.0
    } else {
        (tokens_used as f64 / token_limit as f64) * 100.0
    };
    let level = AlertLevel::for_percent(percent_used);
    BudgetCheck {
        allowed: !(hard_limit && level == AlertLevel::Exceeded),
        level,
        percent_used,
    }
}

/// Tracks one story's budget.
pub struct BudgetTracker {
    state: BudgetState,
    hard_limit: bool,
}

impl BudgetTracker {
    pub fn new(state: BudgetState, hard_limit: bool) -> Self {
        Self { state, hard_limit }
    }

    pub fn state(&self) -> &BudgetState {
        &self.state
    }

    /// Record usage and return the resulting check.
    pub fn record(&mut self, tokens: i64, cost_usd: f64) -> BudgetCheck {
        self.state.tokens_used += tokens;
        self.state.cost_used_usd += cost_usd;
        let check = self.check();
        match check.level {
            AlertLevel::Normal => {}
            level => {
                tracing::warn!(
                    tokens_used = self.state.tokens_used,
                    token_limit = self.state.token_limit,
                    level = %level,
                    "budget alert"
                );
            }
        }
        check
    }

    /// Check the current token usage.
    pub fn check(&self) -> BudgetCheck {
        check_budget(self.state.tokens_used, self.state.token_limit, self.hard_limit)
    }

    /// Check the current cost usage against the cost cap.
    pub fn check_cost(&self) -> BudgetCheck {
        let percent_used = if self.state.cost_limit_usd <= 0.0 {
            100.0
        } else {
            (self.state.cost_used_usd / self.state.cost_limit_usd) * 100.0
        };
        let level = AlertLevel::for_percent(percent_used);
        BudgetCheck {
            allowed: !(self.hard_limit && level == AlertLevel::Exceeded),
            level,
            percent_used,
        }
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(BudgetState::default(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_level_boundaries() {
        assert_eq!(AlertLevel::for_percent(0.0), AlertLevel::Normal);
        assert_eq!(AlertLevel::for_percent(74.9), AlertLevel::Normal);
        assert_eq!(AlertLevel::for_percent(75.0), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_percent(89.9), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_percent(90.0), AlertLevel::Critical);
        assert_eq!(AlertLevel::for_percent(99.9), AlertLevel::Critical);
        assert_eq!(AlertLevel::for_percent(100.0), AlertLevel::Exceeded);
        assert_eq!(AlertLevel::for_percent(150.0), AlertLevel::Exceeded);
    }

    #[test]
    fn exact_threshold_checks() {
        assert_eq!(check_budget(75_000, 100_000, true).level, AlertLevel::Warning);
        assert_eq!(check_budget(90_000, 100_000, true).level, AlertLevel::Critical);
        assert_eq!(check_budget(100_000, 100_000, true).level, AlertLevel::Exceeded);
    }

    #[test]
    fn hard_limit_blocks_exceeded() {
        let check = check_budget(120_000, 100_000, true);
        assert_eq!(check.level, AlertLevel::Exceeded);
        assert!(!check.allowed);
    }

    #[test]
    fn soft_limit_allows_exceeded() {
        let check = check_budget(120_000, 100_000, false);
        assert_eq!(check.level, AlertLevel::Exceeded);
        assert!(check.allowed);
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn sonnet_cost_rates() {
        // 1M input + 1M output at 3/15 per million.
        let cost = estimate_cost("sonnet", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_accumulates() {
        let mut tracker = BudgetTracker::new(
            BudgetState {
                token_limit: 1000,
                ..Default::default()
            },
            true,
        );

        let check = tracker.record(500, 0.01);
        assert_eq!(check.level, AlertLevel::Normal);
        assert!(check.allowed);

        let check = tracker.record(300, 0.01);
        assert_eq!(check.level, AlertLevel::Warning);

        let check = tracker.record(300, 0.01);
        assert_eq!(check.level, AlertLevel::Exceeded);
        assert!(!check.allowed);
    }

    #[test]
    fn zero_limit_is_exceeded() {
        let check = check_budget(1, 0, true);
        assert_eq!(check.level, AlertLevel::Exceeded);
        assert!(!check.allowed);
    }
}
