//! Integration tests for the signal bus: publishing, consumer groups,
//! project isolation, and the dead-letter path.

use anyhow::anyhow;
use uuid::Uuid;

use wave_bus::channels::ChannelManager;
use wave_bus::client;
use wave_bus::publisher::Publisher;
use wave_bus::subscriber::Subscriber;
use wave_bus::types::{EventType, MessagePriority};

/// Unique project per test so streams never collide across tests or
/// runs against a shared Redis.
fn project(tag: &str) -> String {
    format!("{tag}-{}", Uuid::new_v4().simple())
}

async fn conn() -> redis::aio::ConnectionManager {
    let url = wave_test_utils::redis_url().await;
    client::connect(url).await.expect("redis should connect")
}

fn publisher(conn: &redis::aio::ConnectionManager, project: &str, source: &str) -> Publisher {
    Publisher::new(
        conn.clone(),
        ChannelManager::new(project).unwrap(),
        source,
    )
}

fn subscriber(
    conn: &redis::aio::ConnectionManager,
    project: &str,
    group: &str,
    consumer: &str,
) -> Subscriber {
    Subscriber::new(
        conn.clone(),
        ChannelManager::new(project).unwrap(),
        group,
        consumer,
        100,
    )
}

#[tokio::test]
async fn published_message_reaches_subscriber() {
    let conn = conn().await;
    let project = project("pub");

    // Create the group before publishing so "$" does not skip the entry.
    let mut sub = subscriber(&conn, &project, "g", "c1");
    let _ = sub.read(Some(0), 16).await.unwrap();

    let publisher = publisher(&conn, &project, "test-agent");
    let stream_id = publisher
        .publish(
            EventType::StoryStarted,
            serde_json::json!({"story_id": "TEST-001"}),
            Some("session-123".to_owned()),
            Some("TEST-001".to_owned()),
            Some(MessagePriority::High),
            None,
        )
        .await
        .unwrap();
    assert!(!stream_id.is_empty());
    assert_eq!(publisher.publish_count(), 1);

    let entries = sub.read(Some(500), 16).await.unwrap();
    assert_eq!(entries.len(), 1);

    let message = &entries[0].message;
    assert_eq!(message.event_type, EventType::StoryStarted);
    assert_eq!(message.payload["story_id"], "TEST-001");
    assert_eq!(message.source, "test-agent");
    assert_eq!(message.priority, MessagePriority::High);
    assert_eq!(message.session_id.as_deref(), Some("session-123"));

    sub.ack(&entries[0].channel, &entries[0].stream_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn projects_are_isolated() {
    let conn = conn().await;
    let project_a = project("iso-a");
    let project_b = project("iso-b");

    let mut sub_a = subscriber(&conn, &project_a, "g", "c1");
    let mut sub_b = subscriber(&conn, &project_b, "g", "c1");
    let _ = sub_a.read(Some(0), 16).await.unwrap();
    let _ = sub_b.read(Some(0), 16).await.unwrap();

    publisher(&conn, &project_a, "agent-a")
        .publish(
            EventType::StoryStarted,
            serde_json::json!({"test": "a"}),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    publisher(&conn, &project_b, "agent-b")
        .publish(
            EventType::StoryStarted,
            serde_json::json!({"test": "b"}),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let entries_a = sub_a.read(Some(500), 16).await.unwrap();
    let entries_b = sub_b.read(Some(500), 16).await.unwrap();

    assert_eq!(entries_a.len(), 1);
    assert_eq!(entries_a[0].message.payload["test"], "a");
    assert_eq!(entries_b.len(), 1);
    assert_eq!(entries_b[0].message.payload["test"], "b");
}

#[tokio::test]
async fn consumer_group_shares_load_without_duplicates() {
    let conn = conn().await;
    let project = project("group");

    let mut sub_1 = subscriber(&conn, &project, "workers", "c1");
    let mut sub_2 = subscriber(&conn, &project, "workers", "c2");
    let _ = sub_1.read(Some(0), 16).await.unwrap();

    let publisher = publisher(&conn, &project, "agent");
    for i in 0..6 {
        publisher
            .publish(
                EventType::GatePassed,
                serde_json::json!({"index": i}),
                None,
                None,
                None,
                None,
            )
            .await
            .unwrap();
    }

    let entries_1 = sub_1.read(Some(500), 3).await.unwrap();
    let entries_2 = sub_2.read(Some(500), 16).await.unwrap();

    // Between the two consumers every message is seen exactly once.
    let mut indices: Vec<i64> = entries_1
        .iter()
        .chain(entries_2.iter())
        .map(|e| e.message.payload["index"].as_i64().unwrap())
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn batch_publish_preserves_order() {
    let conn = conn().await;
    let project = project("batch");

    let mut sub = subscriber(&conn, &project, "g", "c1");
    let _ = sub.read(Some(0), 16).await.unwrap();

    let publisher = publisher(&conn, &project, "agent");
    let messages: Vec<_> = (0..5)
        .map(|i| {
            wave_bus::types::WaveMessage::new(
                EventType::GateEntered,
                serde_json::json!({"index": i}),
                "agent",
                &project,
            )
        })
        .collect();
    let ids = publisher.publish_batch(&messages).await.unwrap();
    assert_eq!(ids.len(), 5);

    let entries = sub.read(Some(500), 16).await.unwrap();
    let indices: Vec<i64> = entries
        .iter()
        .map(|e| e.message.payload["index"].as_i64().unwrap())
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn agent_and_gate_channels_deliver() {
    let conn = conn().await;
    let project = project("direct");
    let channels = ChannelManager::new(&project).unwrap();

    let mut sub = subscriber(&conn, &project, "g", "c1");
    sub.subscribe_channel(channels.agent("be-dev-1"));
    sub.subscribe_channel(channels.gate("gate-3"));
    let _ = sub.read(Some(0), 16).await.unwrap();

    let publisher = publisher(&conn, &project, "orchestrator");
    publisher
        .publish_to_agent(
            "be-dev-1",
            EventType::AgentHandoff,
            serde_json::json!({"task": "review"}),
        )
        .await
        .unwrap();
    publisher
        .publish_gate_event(
            "gate-3",
            EventType::GatePassed,
            serde_json::json!({"tests": "all passing"}),
        )
        .await
        .unwrap();

    let entries = sub.read(Some(500), 16).await.unwrap();
    assert_eq!(entries.len(), 2);

    let channels_seen: Vec<&str> = entries.iter().map(|e| e.channel.as_str()).collect();
    assert!(channels_seen.iter().any(|c| c.contains(":agent:")));
    assert!(channels_seen.iter().any(|c| c.contains(":gate:")));
}

#[tokio::test]
async fn failed_handler_copies_to_dead_letter() {
    let conn = conn().await;
    let project = project("dlq");
    let channels = ChannelManager::new(&project).unwrap();

    let mut sub = subscriber(&conn, &project, "g", "c1");
    let _ = sub.read(Some(0), 16).await.unwrap();

    // Subscribe a second consumer group to the dead-letter channel
    // before anything is dead-lettered.
    let mut dlq_sub = subscriber(&conn, &project, "dlq-readers", "c1");
    dlq_sub.subscribe_channel(channels.dead_letter());
    let _ = dlq_sub.read(Some(0), 16).await.unwrap();

    publisher(&conn, &project, "agent")
        .publish(
            EventType::AgentError,
            serde_json::json!({"boom": true}),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_after = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        cancel_after.cancel();
    });
    sub.listen(|_entry| Err(anyhow!("handler exploded")), cancel)
        .await
        .unwrap();

    let dead = dlq_sub.read(Some(500), 16).await.unwrap();
    let dlq_entries: Vec<_> = dead
        .iter()
        .filter(|e| e.channel.contains("dead_letter"))
        .collect();
    assert_eq!(dlq_entries.len(), 1);
    assert_eq!(dlq_entries[0].message.event_type, EventType::AgentError);
}
