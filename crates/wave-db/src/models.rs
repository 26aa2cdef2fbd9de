use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a session -- one PRD-to-merge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses are never left except by an explicit reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a story execution within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Review,
    Complete,
    Failed,
    Cancelled,
}

impl StoryStatus {
    /// Terminal statuses. `failed` is recoverable, so it is not terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for StoryStatus {
    type Err = StoryStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoryStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StoryStatus`] string.
#[derive(Debug, Clone)]
pub struct StoryStatusParseError(pub String);

impl fmt::Display for StoryStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid story status: {:?}", self.0)
    }
}

impl std::error::Error for StoryStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of checkpoint recorded at a state transition or gate boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Gate,
    StoryStart,
    StoryComplete,
    AgentHandoff,
    Error,
    Manual,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gate => "gate",
            Self::StoryStart => "story_start",
            Self::StoryComplete => "story_complete",
            Self::AgentHandoff => "agent_handoff",
            Self::Error => "error",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointType {
    type Err = CheckpointTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gate" => Ok(Self::Gate),
            "story_start" => Ok(Self::StoryStart),
            "story_complete" => Ok(Self::StoryComplete),
            "agent_handoff" => Ok(Self::AgentHandoff),
            "error" => Ok(Self::Error),
            "manual" => Ok(Self::Manual),
            other => Err(CheckpointTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointType`] string.
#[derive(Debug, Clone)]
pub struct CheckpointTypeParseError(pub String);

impl fmt::Display for CheckpointTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint type: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointTypeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A session -- one run of the pipeline covering a wave of stories.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub project_name: String,
    pub wave_number: i32,
    pub status: SessionStatus,
    pub budget_usd: f64,
    pub actual_cost_usd: f64,
    pub token_count: i64,
    pub story_count: i32,
    pub stories_completed: i32,
    pub stories_failed: i32,
    pub meta_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A story execution -- one story driven through the gate sequence.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoryExecution {
    pub id: Uuid,
    pub session_id: Uuid,
    pub story_id: String,
    pub title: String,
    pub domain: String,
    pub agent: String,
    pub priority: i32,
    pub story_points: i32,
    pub status: StoryStatus,
    pub current_gate: i32,
    pub retry_count: i32,
    pub acceptance_criteria_passed: i32,
    pub acceptance_criteria_total: i32,
    pub files_created: serde_json::Value,
    pub files_modified: serde_json::Value,
    pub branch_name: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub tests_passing: Option<bool>,
    pub coverage_achieved: Option<f32>,
    pub error_message: Option<String>,
    pub meta_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A checkpoint -- a durable snapshot of workflow state.
///
/// `seq` is a server-assigned monotonic sequence number. "Latest" is
/// always defined by `seq`, never by comparing `created_at` values,
/// so two checkpoints written within the same clock tick still have a
/// total order.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub seq: i64,
    pub session_id: Uuid,
    pub parent_checkpoint_id: Option<Uuid>,
    pub checkpoint_type: CheckpointType,
    pub checkpoint_name: String,
    pub state: serde_json::Value,
    pub story_id: Option<String>,
    pub gate: Option<String>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_display_roundtrip() {
        let variants = [
            SessionStatus::Pending,
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SessionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn session_status_invalid() {
        let result = "bogus".parse::<SessionStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn session_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::InProgress.is_terminal());
    }

    #[test]
    fn story_status_display_roundtrip() {
        let variants = [
            StoryStatus::Pending,
            StoryStatus::InProgress,
            StoryStatus::Review,
            StoryStatus::Complete,
            StoryStatus::Failed,
            StoryStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StoryStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn story_status_invalid() {
        let result = "nope".parse::<StoryStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn story_failed_is_not_terminal() {
        // failed stories are recoverable
        assert!(!StoryStatus::Failed.is_terminal());
        assert!(StoryStatus::Complete.is_terminal());
        assert!(StoryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn checkpoint_type_display_roundtrip() {
        let variants = [
            CheckpointType::Gate,
            CheckpointType::StoryStart,
            CheckpointType::StoryComplete,
            CheckpointType::AgentHandoff,
            CheckpointType::Error,
            CheckpointType::Manual,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: CheckpointType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn checkpoint_type_invalid() {
        let result = "snapshot".parse::<CheckpointType>();
        assert!(result.is_err());
    }
}
