//! Test: Pipeline flow - analysis, the human gate and the remaining stages

use crate::helpers::*;
use forgeline::core::{Attachment, PipelineStatus, Severity, Stage, StepStatus};
use std::sync::{Arc, Mutex};

/// Start runs analysis and suspends at the human-input gate
#[tokio::test]
async fn test_start_runs_analysis_and_waits_for_input() {
    let generator = MockGenerator::new();
    let (engine, _store) = test_engine(&generator);

    engine.start(RAW_INPUT).await.unwrap();
    let session = engine.snapshot();

    assert_step_status(&session, Stage::Analysis, StepStatus::Success);
    assert_step_status(&session, Stage::HumanInput, StepStatus::Running);
    assert_eq!(session.current_step_id, 2);
    assert!(session.busy, "The gate keeps the pipeline busy");
    assert_eq!(session.status(), PipelineStatus::AwaitingInput);

    let ctx = &session.context;
    assert_eq!(ctx.raw_input, RAW_INPUT);
    assert!(ctx.requirements.is_some());
    assert_eq!(ctx.fact_model.as_ref().unwrap().software_name, "Clinic Scheduler");
    assert_eq!(ctx.pages.len(), 2);

    assert_eq!(MockGenerator::count(&generator.text_calls), 1);
    assert_eq!(MockGenerator::count(&generator.fact_calls), 1);
    assert_eq!(MockGenerator::count(&generator.page_calls), 1);
    assert_eq!(MockGenerator::count(&generator.image_calls), 0);

    let metrics = session.step(1).unwrap().metrics.unwrap();
    assert!(metrics.tokens > 0);
    for stage in [Stage::Visuals, Stage::Documents, Stage::Source, Stage::Audit] {
        assert_step_status(&session, stage, StepStatus::Idle);
    }
}

/// Submitting registration details runs stages 3 to 6 to completion
#[tokio::test]
async fn test_submit_runs_to_completion() {
    let generator = MockGenerator::new();
    let (engine, _store) = test_engine(&generator);

    run_to_completion(&engine).await;
    let session = engine.snapshot();

    for stage in Stage::ALL {
        assert_step_status(&session, stage, StepStatus::Success);
    }
    assert_eq!(session.current_step_id, 6);
    assert!(!session.busy);
    assert!(session.is_finished());
    assert!(!session.is_stopped());
    assert_eq!(session.status(), PipelineStatus::Finished);
    assert_eq!(session.progress(), 1.0);

    let artifacts = &session.context.artifacts;
    assert_eq!(artifacts.images.len(), 2);
    assert!(artifacts.images["home.png"].payload.bytes().is_some());
    assert_eq!(
        artifacts.documents.keys().cloned().collect::<Vec<_>>(),
        vec!["design.md", "requirements.md", "user-manual.md"]
    );
    assert_eq!(artifacts.source_tree.len(), 2);
    assert_eq!(session.context.source_line_count(), 3);
    assert_eq!(artifacts.audit_history.len(), 1);
    assert_eq!(session.context.registration, Some(registration()));

    for stage in [Stage::Analysis, Stage::Visuals, Stage::Documents, Stage::Source, Stage::Audit] {
        let metrics = session.step(stage.id()).unwrap().metrics;
        assert!(metrics.is_some(), "{} should record metrics", stage);
        assert_eq!(metrics.unwrap().tokens, stage.estimated_tokens());
    }
    assert!(session.step(2).unwrap().metrics.is_none());

    assert_eq!(MockGenerator::count(&generator.image_calls), 2);
    assert_eq!(MockGenerator::count(&generator.audit_calls), 1);
    // requirements + three documents
    assert_eq!(MockGenerator::count(&generator.text_calls), 4);
    assert!(log_messages(&session).contains(&"Pipeline finished".to_string()));
}

/// A non-passing audit finishes the pipeline with a warning
#[tokio::test]
async fn test_audit_rejection_is_a_warning() {
    let generator = MockGenerator::new();
    generator.audit_rejects();
    let (engine, _store) = test_engine(&generator);

    run_to_completion(&engine).await;
    let session = engine.snapshot();

    assert_step_status(&session, Stage::Audit, StepStatus::Warn);
    assert!(session.is_finished(), "Warn counts as passed");
    assert!(!session.busy);

    let report = session.context.latest_audit().unwrap();
    assert!(!report.passed);
    assert_eq!(report.issues.len(), 1);
}

/// Unit log entries are attributed to the unit's role and reach both the
/// presentation listener and the aggregate, in the same order
#[tokio::test]
async fn test_log_entries_are_attributed_and_recorded() {
    let generator = MockGenerator::new();
    let (engine, _store) = test_engine(&generator);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = engine.log_stream().subscribe(move |entry| sink.lock().unwrap().push(entry.id));

    run_to_completion(&engine).await;
    let session = engine.snapshot();

    let recorded: Vec<_> = session.logs.iter().map(|e| e.id).collect();
    assert_eq!(*seen.lock().unwrap(), recorded);

    for pair in session.logs.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    let roles: Vec<&str> = session
        .logs
        .iter()
        .filter(|e| e.severity == Severity::System)
        .filter_map(|e| e.role.as_deref())
        .collect();
    let expected = [
        "Product Analyst",
        "Domain Modeler",
        "UX Designer",
        "Visual Designer",
        "Technical Writer",
        "Software Engineer",
        "Compliance Auditor",
    ];
    for role in expected {
        assert!(roles.contains(&role), "missing start log for {}", role);
    }

    let attachments: Vec<&Attachment> = session
        .logs
        .iter()
        .filter_map(|e| e.attachment.as_ref())
        .collect();
    assert_eq!(attachments.len(), 2);
    assert!(attachments.contains(&&Attachment::Image {
        file_name: "home.png".to_string()
    }));
}

/// Snapshots are owned copies: changing one never touches the engine
#[tokio::test]
async fn test_snapshots_are_isolated() {
    let generator = MockGenerator::new();
    let (engine, _store) = test_engine(&generator);
    let recorder = SnapshotRecorder::attach(&engine);

    engine.start(RAW_INPUT).await.unwrap();

    let mut copy = engine.snapshot();
    copy.current_step_id = 6;
    copy.context.raw_input.clear();
    copy.set_status(Stage::Audit, StepStatus::Error);
    copy.busy = false;

    let live = engine.snapshot();
    assert_eq!(live.current_step_id, 2);
    assert_eq!(live.context.raw_input, RAW_INPUT);
    assert_step_status(&live, Stage::Audit, StepStatus::Idle);
    assert!(live.busy);

    // Every mutation was published, the last one matching the live state
    assert!(recorder.len() > 1);
    let last = recorder.snapshots.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last, live);
}
