//! Integration tests for crash recovery: resume from last checkpoint,
//! resume from a specific gate, restart, skip, idempotency, and the
//! five-second single-story contract.

use std::time::Instant;

use uuid::Uuid;

use wave_core::engine::{
    ExecutionContext, GateOutcome, GateOutcomeStatus, StoryEngine,
};
use wave_core::gate::GateSchedule;
use wave_core::recovery::{RecoveryManager, RecoveryStrategy};
use wave_db::models::{CheckpointType, StoryStatus};
use wave_db::queries::sessions::{self, NewSession};
use wave_db::queries::stories;
use wave_test_utils::{create_test_db, drop_test_db};

async fn seed_session(pool: &sqlx::PgPool) -> Uuid {
    let session = sessions::insert_session(
        pool,
        &NewSession {
            project_name: "recovery-tests".to_owned(),
            wave_number: 1,
            story_count: Some(10),
            ..Default::default()
        },
    )
    .await
    .expect("session insert should succeed");
    session.id
}

fn context(session_id: Uuid, story_id: &str) -> ExecutionContext {
    ExecutionContext {
        session_id,
        story_id: story_id.to_owned(),
        title: format!("Story {story_id}"),
        domain: "auth".to_owned(),
        agent: "auth-dev".to_owned(),
        priority: 5,
        story_points: 3,
        acceptance_criteria_total: 4,
    }
}

fn passed(gate: usize) -> GateOutcome {
    GateOutcome {
        gate,
        status: GateOutcomeStatus::Passed,
        acceptance_criteria_passed: 4,
        acceptance_criteria_total: 4,
        error: None,
    }
}

/// Start a story, pass gates 0..=3, then crash it.
async fn crashed_story(
    engine: &StoryEngine,
    session_id: Uuid,
    story_id: &str,
) -> Uuid {
    let execution_id = engine
        .start_execution(&context(session_id, story_id))
        .await
        .expect("start should succeed");
    for gate in 0..=3 {
        engine
            .execute_gate(execution_id, &passed(gate))
            .await
            .expect("gate should pass");
    }
    engine
        .fail_execution(execution_id, "simulated crash")
        .await
        .expect("fail should succeed");
    execution_id
}

#[tokio::test]
async fn resume_from_last_restores_in_progress_within_five_seconds() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = crashed_story(&engine, session_id, "CRASH-001").await;

    let before = stories::get_story(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(before.status, StoryStatus::Failed);
    assert!(before.failed_at.is_some());

    let start = Instant::now();
    let result = recovery
        .recover_story(session_id, "CRASH-001", RecoveryStrategy::ResumeFromLast, None)
        .await
        .expect("recovery should succeed");
    assert!(
        start.elapsed().as_secs() < 5,
        "single-story recovery must finish within five seconds"
    );

    assert_eq!(result.status, "resumed");

    let after = stories::get_story(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(after.status, StoryStatus::InProgress);
    assert!(after.failed_at.is_none());
    // The gate position survives the crash: still waiting on gate 4.
    assert_eq!(after.current_gate, 4);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn trailing_error_checkpoint_is_not_resumable() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    crashed_story(&engine, session_id, "CRASH-002").await;

    let points = recovery
        .find_recovery_points(session_id, Some("CRASH-002"))
        .await
        .unwrap();

    // story_start + 4 gates + error = 6 points, in seq order.
    assert_eq!(points.len(), 6);
    assert!(points.windows(2).all(|w| w[0].seq < w[1].seq));

    let last = points.last().unwrap();
    assert_eq!(last.checkpoint_type, CheckpointType::Error);
    assert!(!last.can_resume);

    // The last resumable point is the gate-3 checkpoint.
    let last_resumable = points.iter().rev().find(|p| p.can_resume).unwrap();
    assert_eq!(last_resumable.checkpoint_type, CheckpointType::Gate);
    assert_eq!(last_resumable.gate.as_deref(), Some("gate-3"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = crashed_story(&engine, session_id, "IDEM-001").await;

    recovery
        .recover_story(session_id, "IDEM-001", RecoveryStrategy::ResumeFromLast, None)
        .await
        .unwrap();
    let first = stories::get_story(&pool, execution_id).await.unwrap().unwrap();

    recovery
        .recover_story(session_id, "IDEM-001", RecoveryStrategy::ResumeFromLast, None)
        .await
        .unwrap();
    let second = stories::get_story(&pool, execution_id).await.unwrap().unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.current_gate, second.current_gate);
    assert_eq!(first.retry_count, second.retry_count);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_from_gate_repositions_current_gate() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = crashed_story(&engine, session_id, "GATE-001").await;

    let result = recovery
        .recover_story(
            session_id,
            "GATE-001",
            RecoveryStrategy::ResumeFromGate,
            Some(2),
        )
        .await
        .unwrap();
    assert_eq!(result.target_gate.as_deref(), Some("gate-2"));

    let story = stories::get_story(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(story.status, StoryStatus::InProgress);
    assert_eq!(story.current_gate, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_from_unreached_gate_fails() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    crashed_story(&engine, session_id, "GATE-002").await;

    // Gate 7 was never reached.
    let result = recovery
        .recover_story(
            session_id,
            "GATE-002",
            RecoveryStrategy::ResumeFromGate,
            Some(7),
        )
        .await;
    let error = result.expect_err("unreached gate should fail");
    assert!(error.to_string().contains("No checkpoint found"));

    // target_gate is required.
    let missing = recovery
        .recover_story(session_id, "GATE-002", RecoveryStrategy::ResumeFromGate, None)
        .await;
    assert!(missing.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn restart_resets_everything() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = crashed_story(&engine, session_id, "RESTART-001").await;

    let result = recovery
        .recover_story(session_id, "RESTART-001", RecoveryStrategy::Restart, None)
        .await
        .unwrap();
    assert_eq!(result.status, "restarted");

    let story = stories::get_story(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(story.status, StoryStatus::Pending);
    assert_eq!(story.current_gate, 0);
    assert_eq!(story.retry_count, 0);
    assert_eq!(story.acceptance_criteria_passed, 0);
    assert!(story.started_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn skip_cancels_the_story() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = crashed_story(&engine, session_id, "SKIP-001").await;

    let result = recovery
        .recover_story(session_id, "SKIP-001", RecoveryStrategy::Skip, None)
        .await
        .unwrap();
    assert_eq!(result.status, "skipped");

    let story = stories::get_story(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(story.status, StoryStatus::Cancelled);

    // Cancelled is terminal: no further recovery.
    assert!(
        !recovery.can_recover(session_id, "SKIP-001").await.unwrap()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn can_recover_rules() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    let execution_id = engine
        .start_execution(&context(session_id, "CAN-001"))
        .await
        .unwrap();
    assert!(recovery.can_recover(session_id, "CAN-001").await.unwrap());
    assert!(!recovery.can_recover(session_id, "GHOST-001").await.unwrap());

    for gate in 0..=8 {
        engine.execute_gate(execution_id, &passed(gate)).await.unwrap();
    }
    // Complete is terminal.
    assert!(!recovery.can_recover(session_id, "CAN-001").await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_session_sweeps_recoverable_stories() {
    let (pool, db_name) = create_test_db().await;
    let session_id = seed_session(&pool).await;
    let engine = StoryEngine::new(pool.clone(), GateSchedule::Standard);
    let recovery = RecoveryManager::new(pool.clone(), GateSchedule::Standard);

    crashed_story(&engine, session_id, "SWEEP-001").await;
    crashed_story(&engine, session_id, "SWEEP-002").await;

    // A completed story is left alone.
    let done = engine
        .start_execution(&context(session_id, "SWEEP-003"))
        .await
        .unwrap();
    for gate in 0..=8 {
        engine.execute_gate(done, &passed(gate)).await.unwrap();
    }

    let summary = recovery
        .recover_session(session_id, RecoveryStrategy::ResumeFromLast)
        .await
        .unwrap();

    assert_eq!(summary.total_stories, 3);
    assert_eq!(summary.recovered.len(), 2);
    assert!(summary.failed.is_empty());
    assert!(summary.recovered.contains(&"SWEEP-001".to_owned()));

    let status = recovery.get_recovery_status(session_id).await.unwrap();
    assert_eq!(status.total_stories, 3);
    assert_eq!(status.by_status["complete"], 1);
    assert_eq!(status.by_status["in_progress"], 2);
    assert_eq!(status.recoverable.len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}
