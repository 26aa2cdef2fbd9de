//! Consumer-group subscriber for the signal bus.
//!
//! Reads stream entries through a consumer group so multiple instances
//! of the same worker can share load without duplicate delivery.
//! Entries stay pending until acknowledged; a handler error copies the
//! entry to the project's dead-letter channel before acknowledging it.

use std::collections::HashSet;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelManager;
use crate::types::{StreamEntry, WaveMessage};

/// A consumer-group subscriber over one or more project streams.
pub struct Subscriber {
    conn: ConnectionManager,
    channels: ChannelManager,
    group: String,
    consumer: String,
    block_ms: u64,
    /// Streams this subscriber reads. Defaults to the project signal
    /// stream; extend with [`Subscriber::subscribe_channel`].
    streams: Vec<String>,
    /// Streams whose consumer group has been created.
    ensured: HashSet<String>,
}

impl Subscriber {
    /// Create a subscriber on the project's signal stream.
    pub fn new(
        conn: ConnectionManager,
        channels: ChannelManager,
        group: impl Into<String>,
        consumer: impl Into<String>,
        block_ms: u64,
    ) -> Self {
        let signals = channels.signals();
        Self {
            conn,
            channels,
            group: group.into(),
            consumer: consumer.into(),
            block_ms,
            streams: vec![signals],
            ensured: HashSet::new(),
        }
    }

    /// Also read from an additional channel (agent or gate stream).
    pub fn subscribe_channel(&mut self, channel: String) {
        if !self.streams.contains(&channel) {
            self.streams.push(channel);
        }
    }

    /// Ensure the consumer group exists on every subscribed stream.
    ///
    /// `MKSTREAM` creates the stream if absent; an already-existing
    /// group (BUSYGROUP) is not an error.
    async fn ensure_groups(&mut self) -> Result<()> {
        let streams: Vec<String> = self
            .streams
            .iter()
            .filter(|s| !self.ensured.contains(*s))
            .cloned()
            .collect();

        for stream in streams {
            let mut conn = self.conn.clone();
            let created: redis::RedisResult<()> = conn
                .xgroup_create_mkstream(&stream, &self.group, "$")
                .await;
            match created {
                Ok(()) => {}
                Err(e) if e.to_string().contains("BUSYGROUP") => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create consumer group on {stream}")
                    });
                }
            }
            self.ensured.insert(stream);
        }
        Ok(())
    }

    /// Read new entries for this consumer.
    ///
    /// `block` overrides the configured block timeout in milliseconds
    /// (0 means do not block). Malformed entries are acknowledged and
    /// skipped so one bad message cannot wedge the group.
    pub async fn read(&mut self, block: Option<u64>, count: usize) -> Result<Vec<StreamEntry>> {
        self.ensure_groups().await?;

        let block_ms = block.unwrap_or(self.block_ms);
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(usize::try_from(block_ms).unwrap_or(usize::MAX))
            .count(count);

        let keys: Vec<&str> = self.streams.iter().map(String::as_str).collect();
        let ids: Vec<&str> = keys.iter().map(|_| ">").collect();

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&keys, &ids, &opts)
            .await
            .context("failed to read from stream")?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            let channel = stream_key.key;
            for id in stream_key.ids {
                let fields: std::collections::HashMap<String, String> = id
                    .map
                    .iter()
                    .filter_map(|(k, v)| {
                        redis::from_redis_value::<String>(v)
                            .ok()
                            .map(|s| (k.clone(), s))
                    })
                    .collect();

                match WaveMessage::from_stream_fields(&fields) {
                    Ok(message) => entries.push(StreamEntry {
                        stream_id: id.id.clone(),
                        channel: channel.clone(),
                        message,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            stream_id = %id.id,
                            channel = %channel,
                            error = %e,
                            "dropping malformed stream entry"
                        );
                        self.ack(&channel, &id.id).await?;
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Acknowledge an entry so it leaves the pending list.
    pub async fn ack(&self, channel: &str, stream_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(channel, &self.group, &[stream_id])
            .await
            .with_context(|| format!("failed to ack {stream_id} on {channel}"))?;
        Ok(())
    }

    /// Copy a failed entry to the dead-letter channel with an error tag.
    async fn dead_letter(&self, entry: &StreamEntry, error: &str) -> Result<()> {
        let mut fields = entry.message.to_stream_fields();
        fields.push(("error".to_owned(), error.to_owned()));
        fields.push(("original_channel".to_owned(), entry.channel.clone()));
        fields.push(("original_stream_id".to_owned(), entry.stream_id.clone()));

        let channel = self.channels.dead_letter();
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(&channel, "*", &fields)
            .await
            .with_context(|| format!("failed to dead-letter to {channel}"))?;
        Ok(())
    }

    /// Drive a handler loop until cancelled.
    ///
    /// Successful handling acknowledges the entry. A handler error
    /// copies the entry to the dead-letter channel (tagged with the
    /// error) and then acknowledges, so poison messages do not
    /// redeliver forever.
    pub async fn listen<F>(&mut self, mut handler: F, cancel: CancellationToken) -> Result<()>
    where
        F: FnMut(&StreamEntry) -> Result<()>,
    {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(group = %self.group, consumer = %self.consumer, "subscriber stopping");
                return Ok(());
            }

            let entries = tokio::select! {
                result = self.read(None, 16) => result?,
                () = cancel.cancelled() => return Ok(()),
            };

            for entry in &entries {
                match handler(entry) {
                    Ok(()) => {
                        self.ack(&entry.channel, &entry.stream_id).await?;
                    }
                    Err(e) => {
                        tracing::warn!(
                            stream_id = %entry.stream_id,
                            event = %entry.message.event_type,
                            error = %e,
                            "handler failed, dead-lettering entry"
                        );
                        self.dead_letter(entry, &e.to_string()).await?;
                        self.ack(&entry.channel, &entry.stream_id).await?;
                    }
                }
            }
        }
    }
}
