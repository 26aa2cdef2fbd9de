//! Domain boundary enforcement.
//!
//! Each domain owns a set of glob patterns (with `**` support) loaded
//! from `wave-config.json`. Ownership is total: a file maps to exactly
//! one owning domain or is unowned, and unowned files are denied by
//! default. The `shared` domain is accessible to every agent. All
//! denials and override uses are recorded for audit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

/// The domain accessible to all agents.
pub const SHARED_DOMAIN_ID: &str = "shared";

/// One domain's ownership rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_patterns: Vec<String>,
}

/// The `wave-config.json` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub domains: Vec<DomainRule>,
}

impl DomainConfig {
    /// Load from a `wave-config.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read domain config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid domain config {}", path.display()))
    }
}

/// Result of a file access check.
#[derive(Debug, Clone, Serialize)]
pub struct AccessCheck {
    pub allowed: bool,
    /// The requesting agent's domain.
    pub domain: String,
    pub file_path: String,
    /// Domain that owns the file, when one matched.
    pub owner_domain: Option<String>,
    pub reason: String,
    /// True when access was granted through a temporary override.
    #[serde(rename = "override")]
    pub override_used: bool,
}

/// Audit record of a denied access.
#[derive(Debug, Clone, Serialize)]
pub struct AccessViolation {
    pub agent_domain: String,
    pub file_path: String,
    pub owner_domain: String,
    pub timestamp: DateTime<Utc>,
}

/// Audit record of an override being exercised.
#[derive(Debug, Clone, Serialize)]
pub struct OverrideUse {
    pub agent_domain: String,
    pub target_domain: String,
    pub file_path: String,
    pub timestamp: DateTime<Utc>,
}

/// A time-bounded cross-domain grant.
#[derive(Debug, Clone)]
struct OverrideGrant {
    agent_domain: String,
    target_domain: String,
    expires_at: Instant,
}

/// Compiled patterns for one domain.
struct CompiledRule {
    rule: DomainRule,
    patterns: Vec<Pattern>,
}

/// Validates agent file access against domain ownership rules.
///
/// Shared across worker threads; the audit logs and override table use
/// interior mutability so checks take `&self`.
pub struct BoundaryEnforcer {
    /// Rules in config order; `shared` is consulted first regardless.
    rules: Vec<CompiledRule>,
    by_id: HashMap<String, usize>,
    violations: Mutex<Vec<AccessViolation>>,
    override_log: Mutex<Vec<OverrideUse>>,
    overrides: Mutex<Vec<OverrideGrant>>,
}

/// `*` must not cross directory separators; `**` is the only way to
/// span levels.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl BoundaryEnforcer {
    /// Build an enforcer from a parsed config.
    ///
    /// Invalid glob patterns fail loudly here rather than silently
    /// never matching.
    pub fn from_config(config: &DomainConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.domains.len());
        let mut by_id = HashMap::new();

        for rule in &config.domains {
            let patterns = rule
                .file_patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).with_context(|| {
                        format!("invalid file pattern {:?} in domain {:?}", p, rule.id)
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            by_id.insert(rule.id.clone(), rules.len());
            rules.push(CompiledRule {
                rule: rule.clone(),
                patterns,
            });
        }

        Ok(Self {
            rules,
            by_id,
            violations: Mutex::new(Vec::new()),
            override_log: Mutex::new(Vec::new()),
            overrides: Mutex::new(Vec::new()),
        })
    }

    /// Load an enforcer straight from `wave-config.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_config(&DomainConfig::from_file(path)?)
    }

    /// The configured domain ids.
    pub fn domain_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.id.as_str()).collect()
    }

    /// Check whether an agent may touch a file.
    ///
    /// Rules, in order: unknown agent domains are denied; the file's
    /// owner is computed (`shared` checked first, then config order);
    /// unowned files are denied; `shared` and the agent's own domain
    /// are allowed; an active override allows with an audit entry;
    /// anything else is denied and recorded as a violation.
    pub fn check_access(&self, agent_domain: &str, file_path: &str) -> AccessCheck {
        let owner = self.find_owner(file_path);

        if !self.by_id.contains_key(agent_domain) {
            self.record_violation(
                agent_domain,
                file_path,
                owner.as_deref().unwrap_or("unknown"),
            );
            return AccessCheck {
                allowed: false,
                domain: agent_domain.to_owned(),
                file_path: file_path.to_owned(),
                owner_domain: owner,
                reason: format!("Unknown agent domain: {agent_domain}"),
                override_used: false,
            };
        }

        let Some(owner) = owner else {
            self.record_violation(agent_domain, file_path, "unowned");
            return AccessCheck {
                allowed: false,
                domain: agent_domain.to_owned(),
                file_path: file_path.to_owned(),
                owner_domain: None,
                reason: format!("File '{file_path}' is not in any defined domain"),
                override_used: false,
            };
        };

        if owner == SHARED_DOMAIN_ID || owner == agent_domain {
            return AccessCheck {
                allowed: true,
                domain: agent_domain.to_owned(),
                file_path: file_path.to_owned(),
                owner_domain: Some(owner),
                reason: String::new(),
                override_used: false,
            };
        }

        if self.has_active_override(agent_domain, &owner) {
            self.log_override_use(agent_domain, &owner, file_path);
            return AccessCheck {
                allowed: true,
                domain: agent_domain.to_owned(),
                file_path: file_path.to_owned(),
                owner_domain: Some(owner),
                reason: String::new(),
                override_used: true,
            };
        }

        self.record_violation(agent_domain, file_path, &owner);
        tracing::warn!(
            agent_domain = agent_domain,
            file_path = file_path,
            owner = %owner,
            "domain boundary violation"
        );
        AccessCheck {
            allowed: false,
            domain: agent_domain.to_owned(),
            file_path: file_path.to_owned(),
            owner_domain: Some(owner.clone()),
            reason: format!(
                "Agent '{agent_domain}' cannot modify '{file_path}' — owned by domain '{owner}'"
            ),
            override_used: false,
        }
    }

    /// Grant temporary cross-domain access.
    pub fn grant_override(&self, agent_domain: &str, target_domain: &str, duration: Duration) {
        let mut overrides = self.overrides.lock().unwrap_or_else(|e| e.into_inner());
        overrides.push(OverrideGrant {
            agent_domain: agent_domain.to_owned(),
            target_domain: target_domain.to_owned(),
            expires_at: Instant::now() + duration,
        });
        tracing::info!(
            agent_domain = agent_domain,
            target_domain = target_domain,
            duration_secs = duration.as_secs(),
            "override granted"
        );
    }

    /// Revoke a previously granted override.
    pub fn revoke_override(&self, agent_domain: &str, target_domain: &str) {
        let mut overrides = self.overrides.lock().unwrap_or_else(|e| e.into_inner());
        overrides
            .retain(|o| !(o.agent_domain == agent_domain && o.target_domain == target_domain));
    }

    /// Recorded violations, oldest first.
    pub fn violations(&self) -> Vec<AccessViolation> {
        self.violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded override uses, oldest first.
    pub fn override_log(&self) -> Vec<OverrideUse> {
        self.override_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Which domain owns a file path, or `None` when unowned.
    ///
    /// `shared` takes priority, then the first matching non-shared
    /// domain in config order.
    pub fn find_owner(&self, file_path: &str) -> Option<String> {
        if let Some(&index) = self.by_id.get(SHARED_DOMAIN_ID) {
            if self.matches(&self.rules[index], file_path) {
                return Some(SHARED_DOMAIN_ID.to_owned());
            }
        }

        for compiled in &self.rules {
            if compiled.rule.id == SHARED_DOMAIN_ID {
                continue;
            }
            if self.matches(compiled, file_path) {
                return Some(compiled.rule.id.clone());
            }
        }
        None
    }

    fn matches(&self, compiled: &CompiledRule, file_path: &str) -> bool {
        compiled
            .patterns
            .iter()
            .any(|p| p.matches_with(file_path, GLOB_OPTIONS))
    }

    fn has_active_override(&self, agent_domain: &str, target_domain: &str) -> bool {
        let now = Instant::now();
        let overrides = self.overrides.lock().unwrap_or_else(|e| e.into_inner());
        overrides.iter().any(|o| {
            o.agent_domain == agent_domain
                && o.target_domain == target_domain
                && o.expires_at > now
        })
    }

    fn record_violation(&self, agent_domain: &str, file_path: &str, owner: &str) {
        let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
        violations.push(AccessViolation {
            agent_domain: agent_domain.to_owned(),
            file_path: file_path.to_owned(),
            owner_domain: owner.to_owned(),
            timestamp: Utc::now(),
        });
    }

    fn log_override_use(&self, agent_domain: &str, target_domain: &str, file_path: &str) {
        let mut log = self.override_log.lock().unwrap_or_else(|e| e.into_inner());
        log.push(OverrideUse {
            agent_domain: agent_domain.to_owned(),
            target_domain: target_domain.to_owned(),
            file_path: file_path.to_owned(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DomainConfig {
        serde_json::from_value(serde_json::json!({
            "domains": [
                {
                    "id": "shared",
                    "name": "Shared",
                    "file_patterns": ["src/lib/**/*", "src/types.ts"]
                },
                {
                    "id": "auth",
                    "name": "Authentication",
                    "file_patterns": ["src/auth/**/*", "src/middleware/auth*.ts"]
                },
                {
                    "id": "booking",
                    "name": "Booking",
                    "file_patterns": ["src/booking/**/*"]
                }
            ]
        }))
        .expect("config should parse")
    }

    fn enforcer() -> BoundaryEnforcer {
        BoundaryEnforcer::from_config(&test_config()).expect("enforcer should build")
    }

    #[test]
    fn own_domain_is_allowed() {
        let enforcer = enforcer();
        let check = enforcer.check_access("auth", "src/auth/login.ts");
        assert!(check.allowed);
        assert_eq!(check.owner_domain.as_deref(), Some("auth"));
        assert!(!check.override_used);
    }

    #[test]
    fn deep_nesting_matches_double_star() {
        let enforcer = enforcer();
        let check = enforcer.check_access("auth", "src/auth/providers/oauth/google.ts");
        assert!(check.allowed);
    }

    #[test]
    fn shared_domain_is_allowed_for_everyone() {
        let enforcer = enforcer();
        assert!(enforcer.check_access("auth", "src/lib/utils.ts").allowed);
        assert!(enforcer.check_access("booking", "src/lib/utils.ts").allowed);
        assert!(enforcer.check_access("auth", "src/types.ts").allowed);
    }

    #[test]
    fn cross_domain_is_denied_with_reason_and_violation() {
        let enforcer = enforcer();
        let check = enforcer.check_access("auth", "src/booking/flights.ts");

        assert!(!check.allowed);
        assert_eq!(check.owner_domain.as_deref(), Some("booking"));
        assert_eq!(
            check.reason,
            "Agent 'auth' cannot modify 'src/booking/flights.ts' — owned by domain 'booking'"
        );

        let violations = enforcer.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].agent_domain, "auth");
        assert_eq!(violations[0].owner_domain, "booking");
    }

    #[test]
    fn unknown_agent_domain_is_denied() {
        let enforcer = enforcer();
        let check = enforcer.check_access("payments", "src/auth/login.ts");
        assert!(!check.allowed);
        assert!(check.reason.contains("Unknown agent domain"));
    }

    #[test]
    fn unowned_file_is_denied() {
        let enforcer = enforcer();
        let check = enforcer.check_access("auth", "README.md");
        assert!(!check.allowed);
        assert!(check.owner_domain.is_none());
        assert!(check.reason.contains("not in any defined domain"));
    }

    #[test]
    fn override_grants_temporary_access() {
        let enforcer = enforcer();
        enforcer.grant_override("auth", "booking", Duration::from_secs(300));

        let check = enforcer.check_access("auth", "src/booking/flights.ts");
        assert!(check.allowed);
        assert!(check.override_used);

        let log = enforcer.override_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].target_domain, "booking");
    }

    #[test]
    fn revoked_override_denies_again() {
        let enforcer = enforcer();
        enforcer.grant_override("auth", "booking", Duration::from_secs(300));
        enforcer.revoke_override("auth", "booking");

        let check = enforcer.check_access("auth", "src/booking/flights.ts");
        assert!(!check.allowed);
    }

    #[test]
    fn expired_override_denies() {
        let enforcer = enforcer();
        enforcer.grant_override("auth", "booking", Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));

        let check = enforcer.check_access("auth", "src/booking/flights.ts");
        assert!(!check.allowed);
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let enforcer = enforcer();
        // src/middleware/auth*.ts owns authGuard.ts but not nested paths.
        assert!(
            enforcer
                .check_access("auth", "src/middleware/authGuard.ts")
                .allowed
        );
        let nested = enforcer.check_access("auth", "src/middleware/deep/authGuard.ts");
        assert!(!nested.allowed);
        assert!(nested.owner_domain.is_none());
    }

    #[test]
    fn invalid_pattern_fails_at_load() {
        let config: DomainConfig = serde_json::from_value(serde_json::json!({
            "domains": [{"id": "bad", "file_patterns": ["src/[invalid"]}]
        }))
        .unwrap();
        assert!(BoundaryEnforcer::from_config(&config).is_err());
    }
}
