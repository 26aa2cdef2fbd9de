//! Constitutional safety checking.
//!
//! A rule engine that scores arbitrary text (code, shell commands,
//! diffs) against pattern tables. Always-dangerous and destructive
//! patterns block everywhere; some patterns are only dangerous in
//! client-side code, so the checker first decides whether the content
//! is server-side (by file path or content markers). Warnings reduce
//! the score without blocking.
//!
//! Score formula: `clamp(1 - 0.3 * critical - 0.05 * warn, 0, 1)`.
//! Content is safe iff the score reaches the block threshold
//! (default 0.85).

use regex::{Regex, RegexBuilder};
use serde::Serialize;

/// Score below which the retry router escalates straight to a human.
pub const SAFETY_ESCALATION_THRESHOLD: f64 = 0.3;

/// Default score threshold for the safe/blocked decision.
pub const DEFAULT_BLOCK_THRESHOLD: f64 = 0.85;

/// Confidence below which uncertainty escalation triggers.
pub const CONFIDENCE_THRESHOLD: f64 = 0.6;

/// What the checker recommends doing with the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Allow,
    Warn,
    Block,
}

/// Result of a safety check.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyResult {
    pub safe: bool,
    pub score: f64,
    /// Tagged violations, e.g. "P001: Destructive: rm -rf /".
    pub violations: Vec<String>,
    pub recommendation: Recommendation,
    pub is_server_side: bool,
    pub critical_count: usize,
    pub warning_count: usize,
}

/// Inputs to the uncertainty-escalation decision (principle P006).
#[derive(Debug, Clone, Default)]
pub struct UncertaintySignals {
    pub confidence_score: Option<f64>,
    pub requirements: String,
    pub options: Vec<String>,
    pub selected: Option<String>,
}

/// Keywords that mark requirements as ambiguous.
const AMBIGUOUS_KEYWORDS: [&str; 18] = [
    "maybe",
    "perhaps",
    "possibly",
    "might",
    "some kind of",
    "something like",
    "not sure",
    "tbd",
    "todo",
    "unclear",
    "ambiguous",
    "could be",
    "either",
    "or maybe",
    "not certain",
    "probably",
    "i think",
    "potentially",
];

/// A compiled rule: pattern, principle tag, human description.
struct SafetyRule {
    pattern: Regex,
    principle: &'static str,
    message: &'static str,
}

fn rule(pattern: &str, principle: &'static str, message: &'static str) -> SafetyRule {
    // Pattern tables are compile-time constants; a non-compiling
    // pattern is a programmer error, caught by the pattern tests.
    SafetyRule {
        pattern: RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("static safety pattern must compile"),
        principle,
        message,
    }
}

/// Always dangerous, in every context.
fn always_dangerous() -> Vec<SafetyRule> {
    vec![
        rule(r"rm\s+-rf\s+/(\s|$)", "P001", "Destructive: rm -rf /"),
        rule(r"DROP\s+TABLE", "P001", "Destructive: DROP TABLE"),
        rule(r"DROP\s+DATABASE", "P001", "Destructive: DROP DATABASE"),
        rule(
            r"git\s+push\s+--force\s+origin\s+main",
            "P001",
            "Destructive: force push to main",
        ),
        rule(r"\.\./\.\./etc/passwd", "P003", "Path traversal: /etc/passwd"),
        rule(r"eval\s*\([^)]*\$", "P004", "Code injection: eval with variable"),
    ]
}

/// Destructive commands aimed at system paths.
fn destructive_commands() -> Vec<SafetyRule> {
    vec![
        rule(
            r"rm\s+-rf\s+/",
            "P001",
            "Destructive: rm -rf on absolute path",
        ),
        rule(
            r"rm\s+-rf\s+/(var|etc|usr|home|boot|bin|sbin|lib|root)",
            "P001",
            "Destructive: rm -rf on system path",
        ),
        rule(
            r"dd\s+if=.*\s+of=/dev/(sd|hd|nvme)",
            "P001",
            "Destructive: raw write to block device",
        ),
        rule(r"mkfs\.\w+", "P001", "Destructive: filesystem format"),
        rule(
            r"chmod\s+-R\s+777\s+/(\s|$)",
            "P001",
            "Destructive: chmod -R 777 /",
        ),
        rule(r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:", "P001", "Destructive: fork bomb"),
    ]
}

/// Dangerous only in client-side code.
fn fe_dangerous() -> Vec<SafetyRule> {
    vec![rule(
        r#"private_key\s*=\s*["']"#,
        "P002",
        "Secret exposure: private_key in client",
    )]
}

/// Reduce the score without blocking.
fn warn_patterns() -> Vec<SafetyRule> {
    vec![
        rule(r"console\.log\(", "P007", "Debug: console.log"),
        rule(r"debugger;?", "P007", "Debug: debugger statement"),
        rule(r"TODO:", "P007", "Code quality: TODO"),
        rule(r"FIXME:", "P007", "Code quality: FIXME"),
        rule(r"HACK:", "P007", "Code quality: HACK"),
    ]
}

/// File path patterns that mark a file as server-side.
const SERVER_SIDE_FILE_PATTERNS: [&str; 13] = [
    r"app/api/.*\.tsx?$",
    r"app/api/.*\.jsx?$",
    r"pages/api/.*\.tsx?$",
    r"pages/api/.*\.jsx?$",
    r"(^|/)server/.*\.tsx?$",
    r"(^|/)server/.*\.jsx?$",
    r"lib/server/.*\.tsx?$",
    r"(^|/)scripts/.*\.tsx?$",
    r"(^|/)scripts/.*\.jsx?$",
    r"\.server\.ts$",
    r"\.server\.js$",
    r"(^|/)route\.ts$",
    r"(^|/)route\.js$",
];

/// Content markers that indicate server-side code.
const SERVER_SIDE_CONTENT_PATTERNS: [&str; 5] = [
    r"NextResponse",
    r"NextRequest",
    r"@aws-sdk",
    r"createClient\([^)]*service_role",
    r"export\s+(async\s+)?function\s+(GET|POST|PUT|DELETE|PATCH)",
];

/// Check if a file path indicates server-side code.
pub fn is_server_side_file(file_path: Option<&str>) -> bool {
    let Some(file_path) = file_path else {
        return false;
    };
    let normalized = file_path.replace('\\', "/");
    SERVER_SIDE_FILE_PATTERNS.iter().any(|p| {
        Regex::new(p)
            .expect("static server-side pattern must compile")
            .is_match(&normalized)
    })
}

/// Check if content indicates server-side code.
pub fn is_server_side_content(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }
    SERVER_SIDE_CONTENT_PATTERNS.iter().any(|p| {
        RegexBuilder::new(p)
            .case_insensitive(true)
            .build()
            .expect("static server-side pattern must compile")
            .is_match(content)
    })
}

/// Determine whether uncertainty escalation (P006) should trigger.
///
/// Triggers on: confidence below threshold, ambiguous keywords in the
/// requirements, or multiple options listed with none selected.
pub fn should_escalate_uncertainty(signals: &UncertaintySignals) -> bool {
    if signals.confidence_score.unwrap_or(1.0) < CONFIDENCE_THRESHOLD {
        return true;
    }

    let requirements = signals.requirements.to_lowercase();
    if AMBIGUOUS_KEYWORDS.iter().any(|kw| requirements.contains(kw)) {
        return true;
    }

    signals.options.len() > 1 && signals.selected.is_none()
}

/// The unified safety checker.
pub struct SafetyChecker {
    domain: String,
    block_threshold: f64,
    always_dangerous: Vec<SafetyRule>,
    destructive: Vec<SafetyRule>,
    fe_dangerous: Vec<SafetyRule>,
    warn: Vec<SafetyRule>,
    client_env: Regex,
    vite_env: Regex,
    sudo: Regex,
}

impl SafetyChecker {
    /// A checker for an agent domain with the default block threshold.
    pub fn new(domain: impl Into<String>) -> Self {
        Self::with_threshold(domain, DEFAULT_BLOCK_THRESHOLD)
    }

    /// A checker with an explicit block threshold.
    pub fn with_threshold(domain: impl Into<String>, block_threshold: f64) -> Self {
        Self {
            domain: domain.into().to_lowercase(),
            block_threshold,
            always_dangerous: always_dangerous(),
            destructive: destructive_commands(),
            fe_dangerous: fe_dangerous(),
            warn: warn_patterns(),
            client_env: Regex::new(r"process\.env\.([A-Z0-9_]+)")
                .expect("static pattern must compile"),
            vite_env: Regex::new(r"import\.meta\.env\.([A-Z0-9_]+)")
                .expect("static pattern must compile"),
            sudo: Regex::new(r"(^|\s)sudo\s").expect("static pattern must compile"),
        }
    }

    /// Check content, optionally in the context of a file path.
    pub fn check(&self, content: &str, file_path: Option<&str>) -> SafetyResult {
        if content.is_empty() {
            return SafetyResult {
                safe: true,
                score: 1.0,
                violations: Vec::new(),
                recommendation: Recommendation::Allow,
                is_server_side: false,
                critical_count: 0,
                warning_count: 0,
            };
        }

        let is_server = is_server_side_file(file_path) || is_server_side_content(content);

        let mut violations = Vec::new();
        let mut destructive_hit = false;

        for rule in &self.always_dangerous {
            if rule.pattern.is_match(content) {
                violations.push(format!("{}: {}", rule.principle, rule.message));
                if rule.principle == "P001" {
                    destructive_hit = true;
                }
            }
        }

        for rule in &self.destructive {
            if rule.pattern.is_match(content) {
                violations.push(format!("{}: {}", rule.principle, rule.message));
                destructive_hit = true;
            }
        }

        // Privilege escalation on top of a destructive command docks
        // the score further.
        if destructive_hit && self.sudo.is_match(content) {
            violations.push("P001: sudo escalation on destructive command".to_owned());
        }

        // Client-side only rules. The BE domain works server-side by
        // definition.
        if self.domain != "be" && !is_server {
            for rule in &self.fe_dangerous {
                if rule.pattern.is_match(content) {
                    violations.push(format!("{}: {}", rule.principle, rule.message));
                }
            }

            for capture in self.client_env.captures_iter(content) {
                let name = &capture[1];
                if !name.starts_with("NEXT_PUBLIC_") {
                    violations.push(format!(
                        "P002: Secret exposure: process.env.{name} in client code"
                    ));
                }
            }
            for capture in self.vite_env.captures_iter(content) {
                let name = &capture[1];
                if !name.starts_with("VITE_") {
                    violations.push(format!(
                        "P002: Secret exposure: import.meta.env.{name} in client code"
                    ));
                }
            }
        }

        let mut warnings = Vec::new();
        for rule in &self.warn {
            if rule.pattern.is_match(content) {
                warnings.push(format!("{}: {}", rule.principle, rule.message));
            }
        }

        let critical_count = violations.len();
        let warning_count = warnings.len();

        let score = (1.0 - 0.3 * critical_count as f64 - 0.05 * warning_count as f64)
            .clamp(0.0, 1.0);
        let safe = score >= self.block_threshold;

        let recommendation = if critical_count > 0 {
            Recommendation::Block
        } else if warning_count > 0 {
            Recommendation::Warn
        } else {
            Recommendation::Allow
        };

        violations.extend(warnings);

        SafetyResult {
            safe,
            score,
            violations,
            recommendation,
            is_server_side: is_server,
            critical_count,
            warning_count,
        }
    }
}

impl Default for SafetyChecker {
    fn default() -> Self {
        Self::new("fe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> SafetyChecker {
        SafetyChecker::new("fe")
    }

    #[test]
    fn empty_content_is_safe() {
        let result = checker().check("", None);
        assert!(result.safe);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.recommendation, Recommendation::Allow);
    }

    #[test]
    fn plain_code_is_safe() {
        let result = checker().check("const x = add(1, 2);", Some("src/math.ts"));
        assert!(result.safe);
        assert_eq!(result.recommendation, Recommendation::Allow);
    }

    #[test]
    fn sudo_rm_rf_root_is_blocked_below_escalation_threshold() {
        let result = checker().check("sudo rm -rf /", None);
        assert!(!result.safe);
        assert!(result.score < SAFETY_ESCALATION_THRESHOLD);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert!(result.violations.iter().any(|v| v.contains("P001")));
        assert!(
            result
                .violations
                .iter()
                .any(|v| v.to_lowercase().contains("destructive"))
        );
    }

    #[test]
    fn rm_rf_node_modules_is_safe() {
        let result = checker().check("rm -rf node_modules", None);
        assert!(result.score >= 0.5);
        assert!(result.safe);
    }

    #[test]
    fn rm_rf_system_path_is_blocked() {
        let result = checker().check("rm -rf /var/www", None);
        assert!(!result.safe);
        assert_eq!(result.recommendation, Recommendation::Block);
    }

    #[test]
    fn drop_table_is_blocked() {
        let result = checker().check("drop table users;", None);
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.contains("DROP TABLE")));
    }

    #[test]
    fn force_push_to_main_is_blocked() {
        let result = checker().check("git push --force origin main", None);
        assert!(!result.safe);
    }

    #[test]
    fn path_traversal_is_blocked() {
        let result = checker().check("cat ../../etc/passwd", None);
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.contains("P003")));
    }

    #[test]
    fn eval_with_variable_is_blocked() {
        let result = checker().check("eval(userInput + $param)", None);
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.contains("P004")));
    }

    #[test]
    fn fork_bomb_is_blocked() {
        let result = checker().check(":(){ :|: & };:", None);
        assert!(!result.safe);
    }

    #[test]
    fn warnings_reduce_score_but_allow() {
        let result = checker().check("console.log(value);\n// TODO: tidy\n", None);
        assert!(result.safe, "score {} should stay safe", result.score);
        assert_eq!(result.recommendation, Recommendation::Warn);
        assert_eq!(result.warning_count, 2);
        assert!((result.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn private_key_in_client_is_blocked() {
        let result = checker().check(
            r#"const private_key = "sk-123";"#,
            Some("app/components/Pay.tsx"),
        );
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.contains("P002")));
    }

    #[test]
    fn private_key_in_api_route_is_allowed() {
        let result = checker().check(
            r#"const private_key = "sk-123";"#,
            Some("app/api/payments/route.ts"),
        );
        assert!(result.safe);
        assert!(result.is_server_side);
    }

    #[test]
    fn server_markers_in_content_count_as_server_side() {
        let content = r#"import { NextResponse } from "next/server";
const private_key = "sk-123";"#;
        let result = checker().check(content, None);
        assert!(result.is_server_side);
        assert!(result.safe);
    }

    #[test]
    fn public_env_vars_allowed_in_client() {
        let result = checker().check(
            "const url = process.env.NEXT_PUBLIC_API_URL;",
            Some("app/components/Nav.tsx"),
        );
        assert!(result.safe);

        let vite = checker().check(
            "const url = import.meta.env.VITE_API_URL;",
            Some("src/components/Nav.tsx"),
        );
        assert!(vite.safe);
    }

    #[test]
    fn secret_env_vars_blocked_in_client() {
        let result = checker().check(
            "const key = process.env.STRIPE_SECRET_KEY;",
            Some("app/components/Pay.tsx"),
        );
        assert!(!result.safe);
        assert!(
            result
                .violations
                .iter()
                .any(|v| v.contains("STRIPE_SECRET_KEY"))
        );
    }

    #[test]
    fn secret_env_vars_allowed_server_side() {
        let result = checker().check(
            "const key = process.env.STRIPE_SECRET_KEY;",
            Some("app/api/pay/route.ts"),
        );
        assert!(result.safe);
    }

    #[test]
    fn be_domain_skips_client_rules() {
        let be = SafetyChecker::new("be");
        let result = be.check("const key = process.env.DATABASE_URL;", None);
        assert!(result.safe);
    }

    #[test]
    fn server_side_file_detection() {
        assert!(is_server_side_file(Some("app/api/users/route.ts")));
        assert!(is_server_side_file(Some("pages/api/auth.ts")));
        assert!(is_server_side_file(Some("lib/server/db.ts")));
        assert!(is_server_side_file(Some("scripts/deploy.ts")));
        assert!(is_server_side_file(Some("utils/data.server.ts")));
        assert!(!is_server_side_file(Some("app/components/Nav.tsx")));
        assert!(!is_server_side_file(None));
    }

    #[test]
    fn uncertainty_low_confidence_escalates() {
        let signals = UncertaintySignals {
            confidence_score: Some(0.5),
            ..Default::default()
        };
        assert!(should_escalate_uncertainty(&signals));
    }

    #[test]
    fn uncertainty_ambiguous_keywords_escalate() {
        let signals = UncertaintySignals {
            requirements: "Maybe add some kind of cache here, TBD".to_owned(),
            ..Default::default()
        };
        assert!(should_escalate_uncertainty(&signals));
    }

    #[test]
    fn uncertainty_unselected_options_escalate() {
        let signals = UncertaintySignals {
            requirements: "Implement the cache layer".to_owned(),
            options: vec!["redis".to_owned(), "memcached".to_owned()],
            selected: None,
            ..Default::default()
        };
        assert!(should_escalate_uncertainty(&signals));
    }

    #[test]
    fn uncertainty_clear_requirements_do_not_escalate() {
        let signals = UncertaintySignals {
            confidence_score: Some(0.9),
            requirements: "Implement the login endpoint".to_owned(),
            options: vec!["redis".to_owned(), "memcached".to_owned()],
            selected: Some("redis".to_owned()),
        };
        assert!(!should_escalate_uncertainty(&signals));
    }
}
