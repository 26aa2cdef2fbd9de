//! Pre-flight lock tool.
//!
//! Validates the launch configuration (domain config present and
//! well-formed, environment variables sane), freezes a fingerprint of
//! it into `.wave/preflight.lock`, and later verifies the running
//! config still matches the frozen one. Every lock write appends to an
//! audit trail inside the lock file.

use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use wave_core::boundary::{BoundaryEnforcer, DomainConfig, SHARED_DOMAIN_ID};

use crate::config::CliConfig;

/// Which pre-flight operations to run.
#[derive(Debug, Clone, Copy)]
pub struct PreflightAction {
    pub validate: bool,
    pub lock: bool,
    pub check: bool,
    pub report: bool,
    pub audit: bool,
}

/// One frozen configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    config_sha256: String,
    domain_count: usize,
    locked_at: DateTime<Utc>,
}

/// The `.wave/preflight.lock` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PreflightLock {
    current: Option<LockEntry>,
    history: Vec<LockEntry>,
}

const LOCK_FILE: &str = "preflight.lock";

pub async fn run(config: &CliConfig, action: PreflightAction) -> Result<()> {
    if !(action.validate || action.lock || action.check || action.report || action.audit) {
        bail!("preflight requires at least one of --validate, --lock, --check, --report, --audit");
    }

    if action.validate {
        validate(config)?;
    }
    if action.lock {
        write_lock(config)?;
    }
    if action.check {
        check(config)?;
    }
    if action.report {
        report(config)?;
    }
    if action.audit {
        audit(config)?;
    }
    Ok(())
}

/// Validate the domain config and environment.
fn validate(config: &CliConfig) -> Result<()> {
    if !config.has_domain_config() {
        bail!(
            "domain config not found at {}",
            config.domain_config_path.display()
        );
    }

    let domain_config = DomainConfig::from_file(&config.domain_config_path)?;
    if domain_config.domains.is_empty() {
        bail!("domain config defines no domains");
    }

    // Compiling patterns catches malformed globs.
    let enforcer = BoundaryEnforcer::from_config(&domain_config)?;
    let ids = enforcer.domain_ids();
    if !ids.contains(&SHARED_DOMAIN_ID) {
        tracing::warn!("no shared domain configured; all cross-domain access will be denied");
    }

    let mut out = std::io::stdout();
    writeln!(out, "preflight validate: OK ({} domains)", ids.len())?;
    Ok(())
}

fn fingerprint(config: &CliConfig) -> Result<(String, usize)> {
    let raw = std::fs::read(&config.domain_config_path).with_context(|| {
        format!(
            "failed to read domain config {}",
            config.domain_config_path.display()
        )
    })?;
    let digest = hex::encode(Sha256::digest(&raw));

    let domain_config = DomainConfig::from_file(&config.domain_config_path)?;
    Ok((digest, domain_config.domains.len()))
}

fn read_lock(config: &CliConfig) -> Result<PreflightLock> {
    let path = config.lock_path(LOCK_FILE);
    if !path.exists() {
        return Ok(PreflightLock::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid lock file {}", path.display()))
}

fn save_lock(config: &CliConfig, lock: &PreflightLock) -> Result<()> {
    config.ensure_lock_dir()?;
    let path = config.lock_path(LOCK_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(lock)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Freeze the current config fingerprint.
fn write_lock(config: &CliConfig) -> Result<()> {
    let (config_sha256, domain_count) = fingerprint(config)?;
    let entry = LockEntry {
        config_sha256: config_sha256.clone(),
        domain_count,
        locked_at: Utc::now(),
    };

    let mut lock = read_lock(config)?;
    if let Some(previous) = lock.current.take() {
        lock.history.push(previous);
    }
    lock.current = Some(entry);
    save_lock(config, &lock)?;

    let mut out = std::io::stdout();
    writeln!(out, "preflight lock: {}", &config_sha256[..12])?;
    Ok(())
}

/// Verify the running config matches the frozen fingerprint.
fn check(config: &CliConfig) -> Result<()> {
    let lock = read_lock(config)?;
    let Some(current) = lock.current else {
        bail!("no preflight lock found; run with --lock first");
    };

    let (config_sha256, _) = fingerprint(config)?;
    if config_sha256 != current.config_sha256 {
        bail!(
            "config drift detected: locked {} but current is {}",
            &current.config_sha256[..12],
            &config_sha256[..12]
        );
    }

    let mut out = std::io::stdout();
    writeln!(out, "preflight check: OK (locked at {})", current.locked_at)?;
    Ok(())
}

/// Print a human-readable pre-flight report.
fn report(config: &CliConfig) -> Result<()> {
    let domain_config = DomainConfig::from_file(&config.domain_config_path)?;
    let lock = read_lock(config)?;

    let mut out = std::io::stdout();
    writeln!(out, "Pre-flight report")?;
    writeln!(out, "  config: {}", config.domain_config_path.display())?;
    writeln!(out, "  domains: {}", domain_config.domains.len())?;
    for domain in &domain_config.domains {
        writeln!(
            out,
            "    {} ({} patterns)",
            domain.id,
            domain.file_patterns.len()
        )?;
    }
    match &lock.current {
        Some(entry) => writeln!(
            out,
            "  locked: {} at {}",
            &entry.config_sha256[..12],
            entry.locked_at
        )?,
        None => writeln!(out, "  locked: no")?,
    }
    Ok(())
}

/// Print the lock history.
fn audit(config: &CliConfig) -> Result<()> {
    let lock = read_lock(config)?;
    let mut out = std::io::stdout();
    writeln!(out, "Pre-flight lock audit")?;
    for entry in &lock.history {
        writeln!(
            out,
            "  {} at {} ({} domains)",
            &entry.config_sha256[..12],
            entry.locked_at,
            entry.domain_count
        )?;
    }
    match &lock.current {
        Some(entry) => writeln!(
            out,
            "  {} at {} ({} domains)  <- current",
            &entry.config_sha256[..12],
            entry.locked_at,
            entry.domain_count
        )?,
        None => writeln!(out, "  (no current lock)")?,
    }
    Ok(())
}
