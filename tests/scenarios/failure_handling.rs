//! Test: Failure handling - retries, fail-fast stages and resumption

use crate::helpers::*;
use forgeline::core::{PipelineStatus, RetryPolicy, Severity, Stage, StepStatus};
use forgeline::execution::stages::{EXPAND_REQUIREMENTS, EXTRACT_FACT_MODEL, RENDER_VISUALS};
use forgeline::execution::EngineError;
use forgeline::persistence::InMemorySessionStore;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Visual rendering fails on every attempt: 1 + 3 retries, then the run stops
#[tokio::test]
async fn test_visuals_exhaust_retries() {
    let generator = MockGenerator::new();
    generator.fail_images(usize::MAX);
    let mut config = fast_config();
    config.retry.visuals = RetryPolicy::new(3, 0);
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, config);

    engine.start(RAW_INPUT).await.unwrap();
    let err = engine.submit_human_input(registration()).await.unwrap_err();

    match &err {
        EngineError::Stage { stage, source } => {
            assert_eq!(*stage, Stage::Visuals);
            assert_eq!(source.task, RENDER_VISUALS);
            assert_eq!(source.attempts, 4);
            assert!(source.completed.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(MockGenerator::count(&generator.image_calls), 4);

    let session = engine.snapshot();
    assert_step_status(&session, Stage::Visuals, StepStatus::Error);
    assert_step_status(&session, Stage::Documents, StepStatus::Idle);
    assert_eq!(session.current_step_id, 3);
    assert!(!session.busy);
    assert!(session.is_stopped());
    assert_eq!(session.status(), PipelineStatus::Stopped);
    assert!(session.step(3).unwrap().metrics.is_none());

    let retries: Vec<_> = session
        .logs
        .iter()
        .filter(|e| e.severity == Severity::Warning && e.message.contains("Retrying"))
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(retries.len(), 3);
    assert!(retries[2].contains("attempt 3/3"));
    assert!(session
        .logs
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.starts_with("Visual")));

    // No later stage was reached
    assert_eq!(MockGenerator::count(&generator.source_calls), 0);
    assert_eq!(MockGenerator::count(&generator.audit_calls), 0);
}

/// Backoff before attempt n is `backoff * n`
#[tokio::test(start_paused = true)]
async fn test_visuals_backoff_is_linear() {
    let generator = MockGenerator::new();
    generator.fail_images(3);
    let mut config = fast_config();
    config.retry.visuals = RetryPolicy::new(3, 100);
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, config);

    engine.start(RAW_INPUT).await.unwrap();

    let started = Instant::now();
    engine.submit_human_input(registration()).await.unwrap();
    let waited = started.elapsed();

    // 100 + 200 + 300
    assert!(waited >= Duration::from_millis(600), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(650), "waited {:?}", waited);
    // Three failures on the first page, then one call per page
    assert_eq!(MockGenerator::count(&generator.image_calls), 5);
    let session = engine.snapshot();
    assert!(session.is_finished());

    // The recorded stage time covers the backoff and fits in the wall clock
    let metrics = session.step(Stage::Visuals.id()).unwrap().metrics.unwrap();
    assert!(metrics.duration_ms >= 600, "recorded {}ms", metrics.duration_ms);
    assert!(Duration::from_millis(metrics.duration_ms) <= waited);
}

/// Retrying a failed stage continues with the stages after it
#[tokio::test]
async fn test_retry_after_visual_failure_completes_pipeline() {
    let generator = MockGenerator::new();
    generator.fail_images(usize::MAX);
    let (engine, _store) = test_engine(&generator);

    engine.start(RAW_INPUT).await.unwrap();
    assert!(engine.submit_human_input(registration()).await.is_err());

    generator.fail_images(0);
    engine.retry().await.unwrap();

    let session = engine.snapshot();
    for stage in Stage::ALL {
        assert_step_status(&session, stage, StepStatus::Success);
    }
    assert!(session.is_finished());
    assert!(!session.busy);
    assert!(session.step(3).unwrap().completed_units.is_empty());
}

/// Stage-grained retry re-runs every unit of the failed stage
#[tokio::test]
async fn test_stage_grained_retry_reruns_all_units() {
    let generator = MockGenerator::new();
    generator.fail_facts(usize::MAX);
    let mut config = fast_config();
    config.retry.analysis = RetryPolicy::new(0, 0);
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, config);

    let err = engine.start(RAW_INPUT).await.unwrap_err();
    assert!(matches!(err, EngineError::Stage { stage: Stage::Analysis, .. }));

    let session = engine.snapshot();
    assert_step_status(&session, Stage::Analysis, StepStatus::Error);
    assert_eq!(session.step(1).unwrap().completed_units, vec![EXPAND_REQUIREMENTS]);
    assert!(session.context.requirements.is_some(), "Partial progress is kept");
    assert!(!session.busy);

    generator.fail_facts(0);
    engine.retry().await.unwrap();

    assert_eq!(MockGenerator::count(&generator.text_calls), 2);
    let session = engine.snapshot();
    assert_step_status(&session, Stage::Analysis, StepStatus::Success);
    assert_eq!(session.current_step_id, 2);
    assert!(session.busy);
}

/// Unit-grained retry skips units that completed in the failed run
#[tokio::test]
async fn test_unit_grained_retry_skips_completed_units() {
    let generator = MockGenerator::new();
    generator.fail_facts(usize::MAX);
    let mut config = unit_grained(fast_config());
    config.retry.analysis = RetryPolicy::new(0, 0);
    let store = Arc::new(InMemorySessionStore::new());
    let engine = engine_with(&generator, &store, config);

    assert!(engine.start(RAW_INPUT).await.is_err());
    generator.fail_facts(1);

    // One more failure: the skip list still holds the expansion unit
    let err = engine.retry().await.unwrap_err();
    match err {
        EngineError::Stage { source, .. } => {
            assert_eq!(source.task, EXTRACT_FACT_MODEL);
            assert!(source.completed.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        engine.snapshot().step(1).unwrap().completed_units,
        vec![EXPAND_REQUIREMENTS]
    );

    engine.retry().await.unwrap();

    assert_eq!(MockGenerator::count(&generator.text_calls), 1);
    assert_eq!(MockGenerator::count(&generator.fact_calls), 3);
    let session = engine.snapshot();
    assert_step_status(&session, Stage::Analysis, StepStatus::Success);
    assert!(session.step(1).unwrap().completed_units.is_empty());
}

/// An audit generator failure is an error, unlike a non-passing report
#[tokio::test]
async fn test_audit_failure_marks_error() {
    let generator = MockGenerator::new();
    generator.fail_audits(usize::MAX);
    let (engine, _store) = test_engine(&generator);

    engine.start(RAW_INPUT).await.unwrap();
    let err = engine.submit_human_input(registration()).await.unwrap_err();
    assert!(matches!(err, EngineError::Stage { stage: Stage::Audit, .. }));

    let session = engine.snapshot();
    assert_step_status(&session, Stage::Source, StepStatus::Success);
    assert_step_status(&session, Stage::Audit, StepStatus::Error);
    assert_eq!(session.current_step_id, 6);
    assert!(!session.is_finished());
    assert!(session.is_stopped());
    assert!(session.context.artifacts.audit_history.is_empty());
}
