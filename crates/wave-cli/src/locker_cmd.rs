//! Workflow locker.
//!
//! A small file-based guard over the gate launch sequence: the lock
//! records which gate the workflow is allowed to be at, `--advance`
//! moves it exactly one gate forward (validated against the schedule),
//! and `--reset` requires `--confirm`. Every transition is appended to
//! the lock's history.

use std::io::Write;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wave_core::gate::GateSchedule;

use crate::config::CliConfig;

/// Which locker operations to run.
#[derive(Debug, Clone, Copy)]
pub struct LockerAction {
    pub lock: bool,
    pub check: bool,
    pub advance: bool,
    pub reset: bool,
    pub confirm: bool,
    pub history: bool,
}

/// One recorded lock transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockTransition {
    from_gate: Option<usize>,
    to_gate: usize,
    at: DateTime<Utc>,
}

/// The `.wave/workflow.lock` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowLock {
    schedule: GateSchedule,
    current_gate: usize,
    history: Vec<LockTransition>,
}

const LOCK_FILE: &str = "workflow.lock";

pub fn run(config: &CliConfig, action: LockerAction) -> Result<()> {
    if !(action.lock || action.check || action.advance || action.reset || action.history) {
        bail!("locker requires one of --lock, --check, --advance, --reset, --history");
    }

    if action.lock {
        create_lock(config)?;
    }
    if action.advance {
        advance(config)?;
    }
    if action.reset {
        reset(config, action.confirm)?;
    }
    if action.check {
        check(config)?;
    }
    if action.history {
        history(config)?;
    }
    Ok(())
}

fn read_lock(config: &CliConfig) -> Result<Option<WorkflowLock>> {
    let path = config.lock_path(LOCK_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let lock = serde_json::from_str(&raw)
        .with_context(|| format!("invalid lock file {}", path.display()))?;
    Ok(Some(lock))
}

fn save_lock(config: &CliConfig, lock: &WorkflowLock) -> Result<()> {
    config.ensure_lock_dir()?;
    let path = config.lock_path(LOCK_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(lock)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn create_lock(config: &CliConfig) -> Result<()> {
    if read_lock(config)?.is_some() {
        bail!("workflow lock already exists; use --reset --confirm to start over");
    }

    let lock = WorkflowLock {
        schedule: GateSchedule::Standard,
        current_gate: 0,
        history: vec![LockTransition {
            from_gate: None,
            to_gate: 0,
            at: Utc::now(),
        }],
    };
    save_lock(config, &lock)?;

    let mut out = std::io::stdout();
    writeln!(out, "workflow locked at gate-0")?;
    Ok(())
}

fn advance(config: &CliConfig) -> Result<()> {
    let Some(mut lock) = read_lock(config)? else {
        bail!("no workflow lock found; run with --lock first");
    };

    let from = lock.current_gate;
    let to = from + 1;

    // The locker enforces the same single-step rule the engine does.
    let from_gate = lock
        .schedule
        .at(from)
        .with_context(|| format!("locked gate index {from} out of schedule"))?;
    let Some(to_gate) = lock.schedule.at(to) else {
        bail!("workflow is at the final gate ({from_gate}); nothing to advance to");
    };
    lock.schedule
        .validate_transition(from_gate, to_gate)
        .context("invalid gate advance")?;

    lock.current_gate = to;
    lock.history.push(LockTransition {
        from_gate: Some(from),
        to_gate: to,
        at: Utc::now(),
    });
    save_lock(config, &lock)?;

    let mut out = std::io::stdout();
    writeln!(out, "advanced: gate-{from} -> gate-{to} ({to_gate})")?;
    Ok(())
}

fn reset(config: &CliConfig, confirm: bool) -> Result<()> {
    if !confirm {
        bail!("--reset is destructive; pass --confirm to proceed");
    }
    let path = config.lock_path(LOCK_FILE);
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    let mut out = std::io::stdout();
    writeln!(out, "workflow lock reset")?;
    Ok(())
}

fn check(config: &CliConfig) -> Result<()> {
    let Some(lock) = read_lock(config)? else {
        bail!("no workflow lock found; run with --lock first");
    };
    let gate = lock
        .schedule
        .at(lock.current_gate)
        .with_context(|| format!("locked gate index {} out of schedule", lock.current_gate))?;

    let mut out = std::io::stdout();
    writeln!(out, "locked at gate-{} ({gate})", lock.current_gate)?;
    Ok(())
}

fn history(config: &CliConfig) -> Result<()> {
    let Some(lock) = read_lock(config)? else {
        bail!("no workflow lock found; run with --lock first");
    };

    let mut out = std::io::stdout();
    writeln!(out, "workflow lock history")?;
    for transition in &lock.history {
        match transition.from_gate {
            Some(from) => writeln!(
                out,
                "  gate-{from} -> gate-{} at {}",
                transition.to_gate, transition.at
            )?,
            None => writeln!(out, "  locked at gate-{} at {}", transition.to_gate, transition.at)?,
        }
    }
    Ok(())
}
