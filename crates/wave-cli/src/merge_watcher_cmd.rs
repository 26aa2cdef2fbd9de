//! Merge watcher.
//!
//! Subscribes to QA completion events on `wave:results:qa` and, when a
//! story's QA passes, merges its domain branch into the run's
//! integration branch, publishing the outcome to `wave:events:merge`.
//! `--dry-run` logs the merge that would happen without executing it.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use wave_bus::channels::{MERGE_EVENTS_CHANNEL, QA_RESULTS_CHANNEL, ChannelManager};
use wave_bus::client;
use wave_bus::publisher::Publisher;
use wave_bus::subscriber::Subscriber;
use wave_bus::types::{EventType, StreamEntry, WaveMessage};
use wave_core::worktree::DomainWorktreeManager;

use crate::config::CliConfig;

pub async fn run(config: &CliConfig, dry_run: bool, redis_url: Option<&str>) -> Result<()> {
    let url = redis_url.unwrap_or(&config.redis_url);
    let conn = client::connect(url).await?;

    tracing::info!(
        channel = QA_RESULTS_CHANNEL,
        dry_run = dry_run,
        "merge watcher starting"
    );

    let channels = ChannelManager::new("merge-watcher")
        .context("channel manager construction should not fail")?;
    let mut subscriber = Subscriber::new(
        conn.clone(),
        channels.clone(),
        "merge-watcher",
        "watcher-1",
        5_000,
    );
    subscriber.subscribe_channel(QA_RESULTS_CHANNEL.to_owned());

    let publisher = Publisher::new(conn, channels, "merge-watcher");

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    // The handler is synchronous inside the listen loop; merge outcomes
    // are published from a queue drained after each batch.
    let mut pending: Vec<WaveMessage> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            tracing::info!("merge watcher stopping");
            return Ok(());
        }

        let entries = tokio::select! {
            entries = subscriber.read(Some(5_000), 16) => entries?,
            () = cancel.cancelled() => return Ok(()),
        };

        for entry in &entries {
            if let Some(message) = handle_qa_event(entry, dry_run) {
                pending.push(message);
            }
            subscriber.ack(&entry.channel, &entry.stream_id).await?;
        }

        for message in pending.drain(..) {
            publisher
                .publish_message(MERGE_EVENTS_CHANNEL, &message)
                .await?;
        }
    }
}

/// Decide whether a QA event triggers a merge, and run it.
///
/// Returns the merge-outcome message to publish, or `None` when the
/// event does not trigger anything.
fn handle_qa_event(entry: &StreamEntry, dry_run: bool) -> Option<WaveMessage> {
    let message = &entry.message;
    let qa_passed = message
        .payload
        .get("qa_passed")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if !qa_passed {
        return None;
    }

    let story_id = message.story_id.as_deref().unwrap_or("unknown");
    let run_id = message.payload.get("run_id").and_then(serde_json::Value::as_str)?;
    let domain = message.payload.get("domain").and_then(serde_json::Value::as_str)?;
    let repo_path = message
        .payload
        .get("project_path")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(".");

    let branch = DomainWorktreeManager::domain_branch(run_id, domain);
    tracing::info!(
        story_id = story_id,
        branch = %branch,
        dry_run = dry_run,
        "QA passed, merge triggered"
    );

    let outcome = if dry_run {
        serde_json::json!({
            "story_id": story_id,
            "branch": branch,
            "dry_run": true,
            "success": true,
        })
    } else {
        match execute_merge(repo_path, run_id, domain) {
            Ok((success, has_conflicts, detail)) => serde_json::json!({
                "story_id": story_id,
                "branch": branch,
                "dry_run": false,
                "success": success,
                "has_conflicts": has_conflicts,
                "detail": detail,
            }),
            Err(e) => serde_json::json!({
                "story_id": story_id,
                "branch": branch,
                "dry_run": false,
                "success": false,
                "error": e.to_string(),
            }),
        }
    };

    let mut out = WaveMessage::new(
        EventType::WorkflowComplete,
        outcome,
        "merge-watcher",
        "merge-watcher",
    );
    out.story_id = Some(story_id.to_owned());
    Some(out)
}

/// Merge one domain branch into the run's integration branch.
fn execute_merge(repo_path: &str, run_id: &str, domain: &str) -> Result<(bool, bool, String)> {
    let manager = DomainWorktreeManager::new(repo_path, None)?;
    manager.create_integration_branch(run_id)?;
    let outcome = manager.merge_all_domains(run_id, &[domain.to_owned()])?;
    Ok((outcome.success, outcome.has_conflicts, outcome.message))
}
