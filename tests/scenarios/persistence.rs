//! Test: Persistence - write-through saves and restore

use crate::helpers::*;
use forgeline::core::{ImagePayload, Stage, StepStatus};
use forgeline::persistence::{InMemorySessionStore, SessionStore};
use std::sync::Arc;

/// Nothing persisted yet: restore reports false and keeps the fresh session
#[tokio::test]
async fn test_restore_without_session() {
    let generator = MockGenerator::new();
    let (engine, _store) = test_engine(&generator);

    assert!(!engine.restore().await.unwrap());
    assert_eq!(engine.snapshot().current_step_id, 0);
}

/// A finished run restores into a new engine unchanged
#[tokio::test]
async fn test_restore_round_trip() {
    let generator = MockGenerator::new();
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, fast_config());

    run_to_completion(&engine).await;
    engine.flush().await;
    let original = engine.snapshot();

    // Image bytes are kept out of the session record
    let record = store.load().await.unwrap().unwrap();
    assert!(matches!(
        record.context.artifacts.images["home.png"].payload,
        ImagePayload::Stored { .. }
    ));

    let restored_engine = engine_with(&generator, &store, fast_config());
    assert!(restored_engine.restore().await.unwrap());
    let restored = restored_engine.snapshot();

    assert_eq!(restored.steps, original.steps);
    assert_eq!(restored.current_step_id, original.current_step_id);
    assert_eq!(restored.logs, original.logs);
    assert_eq!(restored.context, original.context);
    assert_eq!(
        restored.context.artifacts.images["home.png"].payload.bytes(),
        Some(&[0x89, b'P', b'N', b'G'][..])
    );
    assert!(!restored.busy);
}

/// A session saved at the human gate can be resumed after a restart
#[tokio::test]
async fn test_restore_at_gate_then_submit() {
    let generator = MockGenerator::new();
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, fast_config());

    engine.start(RAW_INPUT).await.unwrap();
    engine.flush().await;
    drop(engine);

    let resumed = engine_with(&generator, &store, fast_config());
    assert!(resumed.restore().await.unwrap());
    let session = resumed.snapshot();
    assert!(!session.busy, "Busy is never restored");
    assert_eq!(session.current_step_id, 2);
    assert_step_status(&session, Stage::HumanInput, StepStatus::Running);

    resumed.submit_human_input(registration()).await.unwrap();
    assert!(resumed.snapshot().is_finished());
    assert_eq!(MockGenerator::count(&generator.text_calls), 4);
}

/// Every mutation is written through; the last save matches the aggregate
#[tokio::test]
async fn test_saves_follow_mutations() {
    let generator = MockGenerator::new();
    let (engine, store) = test_engine(&generator);

    engine.start(RAW_INPUT).await.unwrap();
    engine.flush().await;

    let mut saved = store.load().await.unwrap().unwrap();
    store.hydrate(&mut saved).await.unwrap();
    let mut live = engine.snapshot();
    live.busy = false;
    assert_eq!(saved, live);
}

/// Reset clears the store without writing a new session
#[tokio::test]
async fn test_reset_clears_store() {
    let generator = MockGenerator::new();
    let (engine, store) = test_engine(&generator);

    run_to_completion(&engine).await;
    engine.reset();
    engine.flush().await;

    assert!(store.load().await.unwrap().is_none());
    assert!(!engine.restore().await.unwrap());
    assert_eq!(engine.snapshot().current_step_id, 0);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_restore_round_trip() {
    use forgeline::execution::PipelineEngine;
    use forgeline::persistence::SqliteSessionStore;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("session.db");
    let generator = MockGenerator::new();

    let original = {
        let store = Arc::new(SqliteSessionStore::open(&path).await.unwrap());
        let engine = PipelineEngine::new(generator.clone(), store, fast_config());
        run_to_completion(&engine).await;
        engine.flush().await;
        engine.snapshot()
    };

    let store = Arc::new(SqliteSessionStore::open(&path).await.unwrap());
    let engine = PipelineEngine::new(generator.clone(), store, fast_config());
    assert!(engine.restore().await.unwrap());

    let restored = engine.snapshot();
    assert_eq!(restored.steps, original.steps);
    assert_eq!(restored.logs, original.logs);
    assert_eq!(restored.context, original.context);
}
