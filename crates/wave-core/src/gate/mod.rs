//! The gate launch sequence.
//!
//! A story moves through an ordered sequence of gates from design
//! validation to deployment. Gate n requires every earlier gate in the
//! schedule; transitions are strictly one step forward. Two orderings
//! exist behind [`GateSchedule`]: the standard ten-gate sequence and a
//! TDD-aware twelve-gate sequence that adds a tests-red gate before
//! development and a refactor gate after it. A deployment picks one
//! schedule and the engine enforces it consistently.

pub mod progress;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named gate in the launch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Design foundation verified: mockups, PRD, folder structure.
    DesignValidated,
    /// Story assigned to a development agent.
    StoryAssigned,
    /// Execution plan reviewed and approved.
    PlanApproved,
    /// Failing tests written first (TDD schedule only).
    TestsRed,
    /// Development work has begun.
    DevStarted,
    /// Development work is complete.
    DevComplete,
    /// Code cleaned up under green tests (TDD schedule only).
    Refactor,
    /// All QA tests have passed.
    QaPassed,
    /// Constitutional safety checkpoint cleared.
    SafetyCleared,
    /// Code review approved by reviewers.
    ReviewApproved,
    /// Code merged to the integration branch.
    Merged,
    /// Deployed to production.
    Deployed,
}

impl Gate {
    /// Human-readable name, e.g. "Design Validated".
    pub fn display_name(self) -> &'static str {
        match self {
            Self::DesignValidated => "Design Validated",
            Self::StoryAssigned => "Story Assigned",
            Self::PlanApproved => "Plan Approved",
            Self::TestsRed => "Tests Red",
            Self::DevStarted => "Dev Started",
            Self::DevComplete => "Dev Complete",
            Self::Refactor => "Refactor",
            Self::QaPassed => "QA Passed",
            Self::SafetyCleared => "Safety Cleared",
            Self::ReviewApproved => "Review Approved",
            Self::Merged => "Merged",
            Self::Deployed => "Deployed",
        }
    }

    /// Stable upper-snake identifier, e.g. "DESIGN_VALIDATED".
    pub fn name(self) -> &'static str {
        match self {
            Self::DesignValidated => "DESIGN_VALIDATED",
            Self::StoryAssigned => "STORY_ASSIGNED",
            Self::PlanApproved => "PLAN_APPROVED",
            Self::TestsRed => "TESTS_RED",
            Self::DevStarted => "DEV_STARTED",
            Self::DevComplete => "DEV_COMPLETE",
            Self::Refactor => "REFACTOR",
            Self::QaPassed => "QA_PASSED",
            Self::SafetyCleared => "SAFETY_CLEARED",
            Self::ReviewApproved => "REVIEW_APPROVED",
            Self::Merged => "MERGED",
            Self::Deployed => "DEPLOYED",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which gate ordering a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSchedule {
    /// The canonical ten-gate sequence (indices 0..9).
    #[default]
    Standard,
    /// TDD-aware twelve-gate sequence: TestsRed after PlanApproved,
    /// Refactor after DevComplete.
    Tdd,
}

const STANDARD_GATES: [Gate; 10] = [
    Gate::DesignValidated,
    Gate::StoryAssigned,
    Gate::PlanApproved,
    Gate::DevStarted,
    Gate::DevComplete,
    Gate::QaPassed,
    Gate::SafetyCleared,
    Gate::ReviewApproved,
    Gate::Merged,
    Gate::Deployed,
];

const TDD_GATES: [Gate; 12] = [
    Gate::DesignValidated,
    Gate::StoryAssigned,
    Gate::PlanApproved,
    Gate::TestsRed,
    Gate::DevStarted,
    Gate::DevComplete,
    Gate::Refactor,
    Gate::QaPassed,
    Gate::SafetyCleared,
    Gate::ReviewApproved,
    Gate::Merged,
    Gate::Deployed,
];

impl GateSchedule {
    /// The gates of this schedule in order.
    pub fn gates(self) -> &'static [Gate] {
        match self {
            Self::Standard => &STANDARD_GATES,
            Self::Tdd => &TDD_GATES,
        }
    }

    /// Number of gates in the schedule.
    pub fn len(self) -> usize {
        self.gates().len()
    }

    /// Whether the schedule is empty (never; kept for API symmetry).
    pub fn is_empty(self) -> bool {
        false
    }

    /// Index of a gate within this schedule, or `None` when the gate is
    /// not part of it (TestsRed/Refactor under Standard).
    pub fn index_of(self, gate: Gate) -> Option<usize> {
        self.gates().iter().position(|g| *g == gate)
    }

    /// The gate at an index.
    pub fn at(self, index: usize) -> Option<Gate> {
        self.gates().get(index).copied()
    }

    /// The checkpoint tag for an index, e.g. `gate-3`.
    pub fn tag(self, index: usize) -> String {
        format!("gate-{index}")
    }

    /// Parse a `gate-N` tag back to an index, validated against the
    /// schedule length.
    pub fn parse_tag(self, tag: &str) -> Option<usize> {
        let index: usize = tag.strip_prefix("gate-")?.parse().ok()?;
        (index < self.len()).then_some(index)
    }

    /// The index of the gate whose passing completes a story.
    ///
    /// Passing the penultimate gate (Merged) completes the story and
    /// leaves `current_gate` at the final index; deployment is observed
    /// by the pipeline, not executed by the engine.
    pub fn terminal_index(self) -> usize {
        self.len() - 2
    }

    /// Can `gate` be passed given the set of already-passed gates?
    ///
    /// True iff every earlier gate in the schedule has been passed.
    pub fn can_pass(self, gate: Gate, passed: &HashSet<Gate>) -> bool {
        let Some(index) = self.index_of(gate) else {
            return false;
        };
        self.gates()[..index].iter().all(|g| passed.contains(g))
    }

    /// The next gate to pass, or `None` when all gates are passed.
    pub fn next_gate(self, passed: &HashSet<Gate>) -> Option<Gate> {
        self.gates().iter().find(|g| !passed.contains(*g)).copied()
    }

    /// Gates that must still be passed before `gate` is reachable.
    pub fn missing_prerequisites(self, gate: Gate, passed: &HashSet<Gate>) -> Vec<Gate> {
        let Some(index) = self.index_of(gate) else {
            return Vec::new();
        };
        self.gates()[..index]
            .iter()
            .filter(|g| !passed.contains(*g))
            .copied()
            .collect()
    }

    /// Validate a transition between gates.
    ///
    /// Only a single forward step (index n to n+1) is accepted: no
    /// skipping, no backward moves.
    pub fn validate_transition(self, from: Gate, to: Gate) -> Result<(), GateTransitionError> {
        let from_index = self
            .index_of(from)
            .ok_or(GateTransitionError::NotInSchedule(from))?;
        let to_index = self
            .index_of(to)
            .ok_or(GateTransitionError::NotInSchedule(to))?;

        if to_index < from_index {
            return Err(GateTransitionError::Backward { from, to });
        }
        if to_index != from_index + 1 {
            return Err(GateTransitionError::Skip { from, to });
        }
        Ok(())
    }
}

/// Errors from validating a gate transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateTransitionError {
    #[error("gate {0} is not part of this schedule")]
    NotInSchedule(Gate),

    #[error("cannot move backward from {from} to {to}")]
    Backward { from: Gate, to: Gate },

    #[error("cannot skip from {from} to {to}; gates must be passed sequentially")]
    Skip { from: Gate, to: Gate },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passed_through(schedule: GateSchedule, count: usize) -> HashSet<Gate> {
        schedule.gates()[..count].iter().copied().collect()
    }

    #[test]
    fn standard_has_ten_gates_tdd_twelve() {
        assert_eq!(GateSchedule::Standard.len(), 10);
        assert_eq!(GateSchedule::Tdd.len(), 12);
    }

    #[test]
    fn standard_excludes_tdd_gates() {
        assert!(GateSchedule::Standard.index_of(Gate::TestsRed).is_none());
        assert!(GateSchedule::Standard.index_of(Gate::Refactor).is_none());
        assert_eq!(GateSchedule::Tdd.index_of(Gate::TestsRed), Some(3));
        assert_eq!(GateSchedule::Tdd.index_of(Gate::Refactor), Some(6));
    }

    #[test]
    fn first_gate_is_always_passable() {
        let empty = HashSet::new();
        assert!(GateSchedule::Standard.can_pass(Gate::DesignValidated, &empty));
        assert!(GateSchedule::Tdd.can_pass(Gate::DesignValidated, &empty));
    }

    #[test]
    fn gate_requires_all_prerequisites() {
        let schedule = GateSchedule::Standard;
        let passed = passed_through(schedule, 5);

        assert!(schedule.can_pass(Gate::QaPassed, &passed));
        assert!(!schedule.can_pass(Gate::SafetyCleared, &passed));
        assert!(!schedule.can_pass(Gate::Deployed, &passed));
    }

    #[test]
    fn missing_prerequisite_blocks_later_gate() {
        let schedule = GateSchedule::Standard;
        let mut passed = passed_through(schedule, 5);
        passed.remove(&Gate::PlanApproved);

        assert!(!schedule.can_pass(Gate::QaPassed, &passed));
        let missing = schedule.missing_prerequisites(Gate::QaPassed, &passed);
        assert_eq!(missing, vec![Gate::PlanApproved]);
    }

    #[test]
    fn next_gate_walks_the_schedule() {
        let schedule = GateSchedule::Standard;
        assert_eq!(
            schedule.next_gate(&HashSet::new()),
            Some(Gate::DesignValidated)
        );
        assert_eq!(
            schedule.next_gate(&passed_through(schedule, 3)),
            Some(Gate::DevStarted)
        );
        assert_eq!(schedule.next_gate(&passed_through(schedule, 10)), None);
    }

    #[test]
    fn transition_accepts_only_single_forward_step() {
        let schedule = GateSchedule::Standard;

        assert!(schedule
            .validate_transition(Gate::DesignValidated, Gate::StoryAssigned)
            .is_ok());

        let skip = schedule.validate_transition(Gate::DesignValidated, Gate::PlanApproved);
        assert!(matches!(skip, Err(GateTransitionError::Skip { .. })));

        let backward = schedule.validate_transition(Gate::QaPassed, Gate::DevComplete);
        assert!(matches!(backward, Err(GateTransitionError::Backward { .. })));
    }

    #[test]
    fn tdd_transition_goes_through_tests_red() {
        let schedule = GateSchedule::Tdd;
        // Standard's PlanApproved -> DevStarted is a skip under TDD.
        let result = schedule.validate_transition(Gate::PlanApproved, Gate::DevStarted);
        assert!(matches!(result, Err(GateTransitionError::Skip { .. })));
        assert!(schedule
            .validate_transition(Gate::PlanApproved, Gate::TestsRed)
            .is_ok());
    }

    #[test]
    fn tags_roundtrip_within_schedule() {
        let schedule = GateSchedule::Standard;
        assert_eq!(schedule.tag(3), "gate-3");
        assert_eq!(schedule.parse_tag("gate-3"), Some(3));
        assert_eq!(schedule.parse_tag("gate-10"), None);
        assert_eq!(schedule.parse_tag("gate-x"), None);
        assert_eq!(GateSchedule::Tdd.parse_tag("gate-11"), Some(11));
    }

    #[test]
    fn terminal_index_is_merged() {
        assert_eq!(
            GateSchedule::Standard.at(GateSchedule::Standard.terminal_index()),
            Some(Gate::Merged)
        );
        assert_eq!(
            GateSchedule::Tdd.at(GateSchedule::Tdd.terminal_index()),
            Some(Gate::Merged)
        );
    }
}
