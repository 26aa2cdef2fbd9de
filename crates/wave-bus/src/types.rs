//! Message types for the signal bus.
//!
//! Redis streams only hold flat string maps, so [`WaveMessage`]
//! serializes complex fields (the payload) to JSON and optional fields
//! to present-or-absent entries. The round trip through
//! [`WaveMessage::to_stream_fields`] / [`WaveMessage::from_stream_fields`]
//! preserves every field, including the optional ones.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types carried on the signal bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StoryStarted,
    GateEntered,
    GatePassed,
    GateFailed,
    AgentError,
    AgentHandoff,
    EmergencyStop,
    HealthCheck,
    WorkflowStarted,
    WorkflowComplete,
    WorkflowFailed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StoryStarted => "story_started",
            Self::GateEntered => "gate_entered",
            Self::GatePassed => "gate_passed",
            Self::GateFailed => "gate_failed",
            Self::AgentError => "agent_error",
            Self::AgentHandoff => "agent_handoff",
            Self::EmergencyStop => "emergency_stop",
            Self::HealthCheck => "health_check",
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowComplete => "workflow_complete",
            Self::WorkflowFailed => "workflow_failed",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "story_started" => Ok(Self::StoryStarted),
            "gate_entered" => Ok(Self::GateEntered),
            "gate_passed" => Ok(Self::GatePassed),
            "gate_failed" => Ok(Self::GateFailed),
            "agent_error" => Ok(Self::AgentError),
            "agent_handoff" => Ok(Self::AgentHandoff),
            "emergency_stop" => Ok(Self::EmergencyStop),
            "health_check" => Ok(Self::HealthCheck),
            "workflow_started" => Ok(Self::WorkflowStarted),
            "workflow_complete" => Ok(Self::WorkflowComplete),
            "workflow_failed" => Ok(Self::WorkflowFailed),
            other => Err(MessageParseError::UnknownEventType(other.to_owned())),
        }
    }
}

/// Delivery priority of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for MessagePriority {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(MessageParseError::UnknownPriority(other.to_owned())),
        }
    }
}

/// Errors from deserializing a stream entry back into a [`WaveMessage`].
#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("unknown message priority: {0:?}")]
    UnknownPriority(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid payload JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A message on the signal bus.
///
/// Every message is namespaced by project: subscribers in project A
/// never see project B traffic (the channel name carries the project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveMessage {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub source: String,
    pub project: String,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub session_id: Option<String>,
    pub story_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl WaveMessage {
    /// Build a message with the current timestamp and default priority.
    pub fn new(
        event_type: EventType,
        payload: serde_json::Value,
        source: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            payload,
            source: source.into(),
            project: project.into(),
            timestamp: Utc::now(),
            priority: MessagePriority::default(),
            session_id: None,
            story_id: None,
            correlation_id: None,
        }
    }

    /// Serialize to the flat string map stored in a stream entry.
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("event_type".to_owned(), self.event_type.to_string()),
            ("payload".to_owned(), self.payload.to_string()),
            ("source".to_owned(), self.source.clone()),
            ("project".to_owned(), self.project.clone()),
            ("timestamp".to_owned(), self.timestamp.to_rfc3339()),
            ("priority".to_owned(), self.priority.to_string()),
        ];
        if let Some(ref v) = self.session_id {
            fields.push(("session_id".to_owned(), v.clone()));
        }
        if let Some(ref v) = self.story_id {
            fields.push(("story_id".to_owned(), v.clone()));
        }
        if let Some(ref v) = self.correlation_id {
            fields.push(("correlation_id".to_owned(), v.clone()));
        }
        fields
    }

    /// Deserialize from the flat string map of a stream entry.
    pub fn from_stream_fields(
        fields: &HashMap<String, String>,
    ) -> Result<Self, MessageParseError> {
        let required = |name: &'static str| {
            fields
                .get(name)
                .ok_or(MessageParseError::MissingField(name))
        };

        let timestamp_raw = required("timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_raw)
            .map_err(|_| MessageParseError::InvalidTimestamp(timestamp_raw.clone()))?
            .with_timezone(&Utc);

        Ok(Self {
            event_type: required("event_type")?.parse()?,
            payload: serde_json::from_str(required("payload")?)?,
            source: required("source")?.clone(),
            project: required("project")?.clone(),
            timestamp,
            priority: required("priority")?.parse()?,
            session_id: fields.get("session_id").cloned(),
            story_id: fields.get("story_id").cloned(),
            correlation_id: fields.get("correlation_id").cloned(),
        })
    }
}

/// A stream entry as read by a subscriber: the Redis stream id plus the
/// deserialized message.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream_id: String,
    pub channel: String,
    pub message: WaveMessage,
}
