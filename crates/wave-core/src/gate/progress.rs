//! Per-session gate progress tracking.
//!
//! A lightweight audit artefact kept alongside the execution engine's
//! persisted state: which gates have passed, when, and by whom.
//! Replaying a history through [`GateProgress::mark_passed`] reproduces
//! the same passed set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Gate, GateSchedule};

/// Record of one gate transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateTransition {
    pub gate: usize,
    pub gate_name: String,
    pub passed_at: DateTime<Utc>,
    pub passed_by: Option<String>,
}

/// Gate progress for one session or story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateProgress {
    schedule: GateSchedule,
    passed_gates: HashSet<Gate>,
    current_gate: Option<usize>,
    history: Vec<GateTransition>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

/// Summary statistics over a [`GateProgress`].
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub passed_count: usize,
    pub total_gates: usize,
    pub completion_percent: f64,
    pub current_gate: Option<usize>,
    pub is_complete: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GateProgress {
    /// Fresh progress over a schedule.
    pub fn new(schedule: GateSchedule) -> Self {
        Self {
            schedule,
            passed_gates: HashSet::new(),
            current_gate: None,
            history: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn schedule(&self) -> GateSchedule {
        self.schedule
    }

    pub fn passed_gates(&self) -> &HashSet<Gate> {
        &self.passed_gates
    }

    pub fn current_gate(&self) -> Option<usize> {
        self.current_gate
    }

    pub fn history(&self) -> &[GateTransition] {
        &self.history
    }

    /// Mark a gate as passed, appending a transition record.
    ///
    /// Marking the final gate stamps `completed_at`. Re-marking an
    /// already-passed gate appends to history but does not duplicate
    /// the passed set.
    pub fn mark_passed(&mut self, gate: Gate, passed_by: Option<&str>) {
        let now = Utc::now();
        let index = self.schedule.index_of(gate).unwrap_or(0);

        self.history.push(GateTransition {
            gate: index,
            gate_name: gate.name().to_owned(),
            passed_at: now,
            passed_by: passed_by.map(str::to_owned),
        });

        self.passed_gates.insert(gate);
        self.current_gate = Some(index);

        if index == self.schedule.len() - 1 {
            self.completed_at = Some(now);
        }
    }

    /// Summary for status displays.
    pub fn summary(&self) -> ProgressSummary {
        let passed_count = self.passed_gates.len();
        let total_gates = self.schedule.len();
        ProgressSummary {
            passed_count,
            total_gates,
            completion_percent: (passed_count as f64 / total_gates as f64) * 100.0,
            current_gate: self.current_gate,
            is_complete: self.completed_at.is_some(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Rebuild progress by replaying a transition history.
    pub fn replay(schedule: GateSchedule, history: &[GateTransition]) -> Self {
        let mut progress = Self::new(schedule);
        for transition in history {
            if let Some(gate) = schedule.at(transition.gate) {
                progress.mark_passed(gate, transition.passed_by.as_deref());
            }
        }
        progress
    }

    /// Reset to fresh state.
    pub fn reset(&mut self) {
        *self = Self::new(self.schedule);
    }
}
