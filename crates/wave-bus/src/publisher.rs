//! Stream publisher for the signal bus.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::channels::ChannelManager;
use crate::types::{EventType, MessagePriority, WaveMessage};

/// Publishes [`WaveMessage`]s onto project-namespaced streams.
///
/// A component that needs to emit signals holds a `Publisher` plus its
/// own identity (`source`); there is no publisher base class to inherit
/// from.
pub struct Publisher {
    conn: ConnectionManager,
    channels: ChannelManager,
    source: String,
    publish_count: AtomicU64,
}

impl Publisher {
    /// Create a publisher for a project, stamping every message with
    /// `source` as the originating agent.
    pub fn new(
        conn: ConnectionManager,
        channels: ChannelManager,
        source: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            channels,
            source: source.into(),
            publish_count: AtomicU64::new(0),
        }
    }

    /// Number of messages published so far.
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    /// The project this publisher is namespaced to.
    pub fn project(&self) -> &str {
        self.channels.project()
    }

    /// Publish an event to the project's general signal stream.
    ///
    /// Returns the assigned stream id.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        session_id: Option<String>,
        story_id: Option<String>,
        priority: Option<MessagePriority>,
        correlation_id: Option<String>,
    ) -> Result<String> {
        let mut message = WaveMessage::new(
            event_type,
            payload,
            self.source.clone(),
            self.channels.project(),
        );
        message.session_id = session_id;
        message.story_id = story_id;
        message.correlation_id = correlation_id;
        if let Some(priority) = priority {
            message.priority = priority;
        }

        self.publish_message(&self.channels.signals(), &message).await
    }

    /// Publish a pre-built batch of messages to the signal stream.
    ///
    /// Returns the stream ids in publication order.
    pub async fn publish_batch(&self, messages: &[WaveMessage]) -> Result<Vec<String>> {
        let channel = self.channels.signals();
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish_message(&channel, message).await?);
        }
        Ok(ids)
    }

    /// Publish directly to an agent's channel.
    pub async fn publish_to_agent(
        &self,
        agent_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<String> {
        let message = WaveMessage::new(
            event_type,
            payload,
            self.source.clone(),
            self.channels.project(),
        );
        self.publish_message(&self.channels.agent(agent_id), &message)
            .await
    }

    /// Publish to a gate-specific channel (e.g. `gate-3`).
    pub async fn publish_gate_event(
        &self,
        gate_name: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<String> {
        let message = WaveMessage::new(
            event_type,
            payload,
            self.source.clone(),
            self.channels.project(),
        );
        self.publish_message(&self.channels.gate(gate_name), &message)
            .await
    }

    /// Append a message to an arbitrary stream.
    pub async fn publish_message(&self, channel: &str, message: &WaveMessage) -> Result<String> {
        let fields = message.to_stream_fields();
        let mut conn = self.conn.clone();
        let stream_id: String = conn
            .xadd(channel, "*", &fields)
            .await
            .with_context(|| format!("failed to publish to {channel}"))?;

        self.publish_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            channel = channel,
            event = %message.event_type,
            stream_id = %stream_id,
            "published signal"
        );
        Ok(stream_id)
    }
}
