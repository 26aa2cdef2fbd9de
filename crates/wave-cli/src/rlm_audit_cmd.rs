//! RLM context auditor.
//!
//! Walks the project, computes each domain's scoped context size, and
//! reports it against the full-codebase baseline and the configured
//! limits. With `--interval` the audit re-runs on a timer.

use std::io::Write;
use std::time::Duration;

use anyhow::{Result, bail};

use wave_core::boundary::DomainConfig;
use wave_core::budget::estimate_tokens;
use wave_core::rlm::RlmLimits;
use wave_core::rlm::context::ContextManager;
use wave_core::rlm::scoper::DomainScoper;

use crate::config::CliConfig;

pub async fn run(config: &CliConfig, project: &str, interval: Option<u64>) -> Result<()> {
    if !config.has_domain_config() {
        bail!(
            "domain config not found at {}",
            config.domain_config_path.display()
        );
    }
    let domain_config = DomainConfig::from_file(&config.domain_config_path)?;
    let limits = RlmLimits::load(&config.rlm_config_path)?;

    match interval {
        None => audit_once(project, &domain_config, &limits),
        Some(seconds) => {
            let period = Duration::from_secs(seconds.max(1));
            loop {
                audit_once(project, &domain_config, &limits)?;
                tokio::time::sleep(period).await;
            }
        }
    }
}

fn audit_once(project: &str, domain_config: &DomainConfig, limits: &RlmLimits) -> Result<()> {
    let baseline = full_codebase_tokens(project);
    let mut scoper = DomainScoper::new(project, domain_config.clone());

    let mut out = std::io::stdout();
    writeln!(out, "RLM audit for {project}")?;
    writeln!(out, "  baseline: {baseline} tokens (full codebase)")?;
    writeln!(
        out,
        "  limits: {} tok/min, {} req/min, ${:.0}/day",
        limits.tokens_per_minute, limits.requests_per_minute, limits.daily_budget_usd
    )?;

    for domain in &domain_config.domains {
        let mut manager = ContextManager::new(&domain.id, domain_config, project, i64::MAX);
        manager.load_domain_context();

        let scope = scoper.compute_scope(&domain.id);
        let reduction = if baseline > 0 {
            100.0 - (manager.total_tokens() as f64 / baseline as f64) * 100.0
        } else {
            0.0
        };

        writeln!(
            out,
            "  {}: {} pinned files, {} tokens ({:.0}% reduction), {} files in scope",
            domain.id,
            manager.pinned_count(),
            manager.total_tokens(),
            reduction,
            scope.len()
        )?;
    }

    let shared = scoper.find_shared_files();
    writeln!(out, "  shared files: {}", shared.len())?;
    Ok(())
}

fn full_codebase_tokens(project: &str) -> i64 {
    wave_core::rlm::context::walk_files(std::path::Path::new(project))
        .iter()
        .filter_map(|rel| {
            std::fs::read_to_string(std::path::Path::new(project).join(rel)).ok()
        })
        .map(|content| estimate_tokens(&content))
        .sum()
}
