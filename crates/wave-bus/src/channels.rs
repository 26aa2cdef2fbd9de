//! Channel naming and namespacing.
//!
//! All bus channels are colon-delimited ASCII and namespaced by project
//! so that subscribers in one project never see another project's
//! traffic.

use std::collections::HashMap;

use thiserror::Error;

/// The QA completion channel watched by the merge watcher.
pub const QA_RESULTS_CHANNEL: &str = "wave:results:qa";

/// The channel merge outcomes are published to.
pub const MERGE_EVENTS_CHANNEL: &str = "wave:events:merge";

/// Errors from constructing a [`ChannelManager`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("project name must not be empty")]
    EmptyProject,
}

/// Builds namespaced channel names for one project.
///
/// Project names are lowercased so that "ProjectA" and "projecta" share
/// a namespace.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    project: String,
}

impl ChannelManager {
    /// Create a channel manager for a project.
    pub fn new(project: impl Into<String>) -> Result<Self, ChannelError> {
        let project = project.into().to_lowercase();
        if project.is_empty() {
            return Err(ChannelError::EmptyProject);
        }
        Ok(Self { project })
    }

    /// The (lowercased) project this manager namespaces.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// General event bus: `wave:signals:{project}`.
    pub fn signals(&self) -> String {
        format!("wave:signals:{}", self.project)
    }

    /// Direct-to-agent channel: `wave:agent:{project}:{agent_id}`.
    pub fn agent(&self, agent_id: &str) -> String {
        format!("wave:agent:{}:{agent_id}", self.project)
    }

    /// Gate-specific channel: `wave:gate:{project}:{gate_name}`.
    pub fn gate(&self, gate_name: &str) -> String {
        format!("wave:gate:{}:{gate_name}", self.project)
    }

    /// Dead-letter channel for failed handlers:
    /// `wave:dead_letter:{project}`.
    pub fn dead_letter(&self) -> String {
        format!("wave:dead_letter:{}", self.project)
    }

    /// Parse a channel name back into its components.
    ///
    /// Returns a map with `prefix`, `type`, and whatever trailing parts
    /// the channel type carries (`project`, `agent`, `gate`).
    pub fn parse_channel(channel: &str) -> HashMap<&'static str, String> {
        let mut parts = channel.split(':');
        let mut parsed = HashMap::new();

        if let Some(prefix) = parts.next() {
            parsed.insert("prefix", prefix.to_owned());
        }
        if let Some(kind) = parts.next() {
            parsed.insert("type", kind.to_owned());
        }
        if let Some(project) = parts.next() {
            parsed.insert("project", project.to_owned());
        }
        if let Some(rest) = parts.next() {
            parsed.insert("target", rest.to_owned());
        }

        parsed
    }
}

/// Queue key for a domain work queue: `wave:tasks:{domain}`.
pub fn task_queue_key(domain: &str) -> String {
    format!("wave:tasks:{domain}")
}

/// Hash key for a task's metadata: `wave:task:{task_id}`.
pub fn task_key(task_id: &str) -> String {
    format!("wave:task:{task_id}")
}

/// Key for a task's result: `wave:result:{task_id}`.
pub fn result_key(task_id: &str) -> String {
    format!("wave:result:{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_channel_includes_lowercased_project() {
        let cm = ChannelManager::new("ProjectA").unwrap();
        assert_eq!(cm.signals(), "wave:signals:projecta");
    }

    #[test]
    fn different_projects_different_channels() {
        let a = ChannelManager::new("projectA").unwrap();
        let b = ChannelManager::new("projectB").unwrap();
        assert_ne!(a.signals(), b.signals());
    }

    #[test]
    fn agent_channel_includes_agent_id() {
        let cm = ChannelManager::new("myproject").unwrap();
        assert_eq!(cm.agent("be-dev-1"), "wave:agent:myproject:be-dev-1");
    }

    #[test]
    fn gate_channel_includes_gate_name() {
        let cm = ChannelManager::new("myproject").unwrap();
        assert_eq!(cm.gate("gate-3"), "wave:gate:myproject:gate-3");
    }

    #[test]
    fn dead_letter_channel() {
        let cm = ChannelManager::new("myproject").unwrap();
        assert_eq!(cm.dead_letter(), "wave:dead_letter:myproject");
    }

    #[test]
    fn empty_project_is_rejected() {
        assert!(ChannelManager::new("").is_err());
    }

    #[test]
    fn parse_channel_components() {
        let parsed = ChannelManager::parse_channel("wave:signals:myproject");
        assert_eq!(parsed["prefix"], "wave");
        assert_eq!(parsed["type"], "signals");
        assert_eq!(parsed["project"], "myproject");
    }

    #[test]
    fn queue_keys() {
        assert_eq!(task_queue_key("be"), "wave:tasks:be");
        assert_eq!(task_key("t-1"), "wave:task:t-1");
        assert_eq!(result_key("t-1"), "wave:result:t-1");
    }
}
