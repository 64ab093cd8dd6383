//! Test utility functions for forgeline

use async_trait::async_trait;
use chrono::NaiveDate;
use forgeline::core::{
    EngineConfig, PipelineSession, RegistrationInfo, ResumeMode, RetryPolicy, Stage, StepStatus,
};
use forgeline::execution::{PipelineEngine, Subscription};
use forgeline::generator::{AspectRatio, ContentGenerator, GenerationError, QualityTier};
use forgeline::persistence::InMemorySessionStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted content generator with call-count spies
///
/// Structured requests are answered by looking at the first required field
/// of the schema. Each `fail_*` counter makes that many calls of the kind
/// fail before succeeding (`usize::MAX` fails forever).
#[derive(Default)]
pub struct MockGenerator {
    pub text_calls: AtomicUsize,
    pub fact_calls: AtomicUsize,
    pub page_calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub source_calls: AtomicUsize,
    pub audit_calls: AtomicUsize,

    fail_facts: AtomicUsize,
    fail_images: AtomicUsize,
    fail_audits: AtomicUsize,
    audit_fails_verdict: AtomicBool,
}

impl MockGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_facts(&self, times: usize) {
        self.fail_facts.store(times, Ordering::SeqCst);
    }

    pub fn fail_images(&self, times: usize) {
        self.fail_images.store(times, Ordering::SeqCst);
    }

    pub fn fail_audits(&self, times: usize) {
        self.fail_audits.store(times, Ordering::SeqCst);
    }

    /// Make the audit report come back as not passed
    pub fn audit_rejects(&self) {
        self.audit_fails_verdict.store(true, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Consume one pending failure, if any
    fn should_fail(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl ContentGenerator for MockGenerator {
    async fn generate_text(
        &self,
        prompt: &str,
        _tier: QualityTier,
    ) -> Result<String, GenerationError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("# Generated\n\n{} characters of prompt", prompt.len()))
    }

    async fn generate_structured(
        &self,
        _prompt: &str,
        schema: &Value,
        _tier: QualityTier,
    ) -> Result<Value, GenerationError> {
        let key = schema["required"][0].as_str().unwrap_or_default();
        match key {
            "software_name" => {
                self.fact_calls.fetch_add(1, Ordering::SeqCst);
                if Self::should_fail(&self.fail_facts) {
                    return Err(GenerationError::Unavailable("model overloaded".into()));
                }
                Ok(json!({
                    "software_name": "Clinic Scheduler",
                    "short_name": "Scheduler",
                    "version": "1.2.0",
                    "summary": "Appointment booking for small clinics",
                    "modules": [
                        { "name": "Calendar", "description": "Book and move appointments" },
                        { "name": "Patients", "description": "Patient records" }
                    ],
                    "tech_stack": ["Rust", "SQLite"]
                }))
            }
            "pages" => {
                self.page_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "pages": [
                        {
                            "id": "home",
                            "title": "Home",
                            "purpose": "Daily overview",
                            "elements": ["calendar"]
                        },
                        { "id": "patients", "title": "Patients", "purpose": "Search patients" }
                    ]
                }))
            }
            "files" => {
                self.source_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({
                    "files": [
                        {
                            "path": "src/main.rs",
                            "language": "rust",
                            "content": "fn main() {\n}\n"
                        },
                        {
                            "path": "src/calendar.rs",
                            "language": "rust",
                            "content": "pub struct Calendar;\n"
                        }
                    ]
                }))
            }
            "passed" => {
                self.audit_calls.fetch_add(1, Ordering::SeqCst);
                if Self::should_fail(&self.fail_audits) {
                    return Err(GenerationError::Unavailable("auditor offline".into()));
                }
                let passed = !self.audit_fails_verdict.load(Ordering::SeqCst);
                let issues = if passed {
                    json!([])
                } else {
                    json!([{
                        "severity": "major",
                        "message": "Version differs in user manual",
                        "artifact": "user-manual.md"
                    }])
                };
                Ok(json!({ "passed": passed, "score": 72, "issues": issues }))
            }
            other => Err(GenerationError::Invalid(format!("unexpected schema: {}", other))),
        }
    }

    async fn generate_image(
        &self,
        _prompt: &str,
        _aspect_ratio: AspectRatio,
    ) -> Result<Option<Vec<u8>>, GenerationError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if Self::should_fail(&self.fail_images) {
            return Err(GenerationError::RateLimited("429 Too Many Requests".into()));
        }
        Ok(Some(vec![0x89, b'P', b'N', b'G']))
    }
}

/// Default config with every backoff set to zero
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    for policy in [
        &mut config.retry.analysis,
        &mut config.retry.visuals,
        &mut config.retry.documents,
        &mut config.retry.source,
        &mut config.retry.audit,
    ] {
        *policy = RetryPolicy::new(policy.max_retries, 0);
    }
    config
}

pub fn unit_grained(mut config: EngineConfig) -> EngineConfig {
    config.resume_mode = ResumeMode::Unit;
    config
}

pub fn engine_with(
    generator: &Arc<MockGenerator>,
    store: &Arc<InMemorySessionStore>,
    config: EngineConfig,
) -> PipelineEngine {
    PipelineEngine::new(generator.clone(), store.clone(), config)
}

/// Engine over a fresh in-memory store and the fast config
pub fn test_engine(generator: &Arc<MockGenerator>) -> (PipelineEngine, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    (engine_with(generator, &store, fast_config()), store)
}

pub fn registration() -> RegistrationInfo {
    RegistrationInfo {
        owner: "Northwind Health Ltd.".to_string(),
        completion_date: NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(),
        dev_hardware: "x86_64 workstation, 32 GB RAM".to_string(),
        dev_os: "Debian 12".to_string(),
        dev_tools: "rustc 1.82, VS Code".to_string(),
        runtime_environment: "Linux server".to_string(),
        language: "Rust".to_string(),
    }
}

pub const RAW_INPUT: &str =
    "A scheduler for small clinics: book appointments, keep patient records.";

/// Collects every published snapshot
pub struct SnapshotRecorder {
    pub snapshots: Arc<Mutex<Vec<PipelineSession>>>,
    _subscription: Subscription,
}

impl SnapshotRecorder {
    pub fn attach(engine: &PipelineEngine) -> Self {
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let subscription =
            engine.subscribe(move |session| sink.lock().unwrap().push(session.clone()));
        Self {
            snapshots,
            _subscription: subscription,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

pub fn status_of(session: &PipelineSession, stage: Stage) -> StepStatus {
    session.step(stage.id()).unwrap().status
}

pub fn assert_step_status(session: &PipelineSession, stage: Stage, expected: StepStatus) {
    assert_eq!(
        status_of(session, stage),
        expected,
        "Step {} should be {:?}",
        stage,
        expected
    );
}

/// Run analysis and the remaining stages to completion
pub async fn run_to_completion(engine: &PipelineEngine) {
    engine.start(RAW_INPUT).await.expect("analysis should succeed");
    engine
        .submit_human_input(registration())
        .await
        .expect("remaining stages should succeed");
}

pub fn log_messages(session: &PipelineSession) -> Vec<String> {
    session.logs.iter().map(|e| e.message.clone()).collect()
}
