//! Main pipeline engine - the six-stage state machine behind the action surface

use crate::{
    core::{
        EngineConfig, LogEntry, PipelineContext, PipelineSession, RegistrationInfo, ResumeMode,
        Severity, Stage, StepMetrics, StepStatus,
    },
    execution::{
        log_stream::{EventHub, LogStream, Subscription},
        runner::{SequenceError, TaskRunner},
        stages,
    },
    generator::ContentGenerator,
    persistence::{SessionStore, SessionWriter},
};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Errors returned from engine actions
#[derive(Debug, Error)]
pub enum EngineError {
    /// A stage aborted because one of its units exhausted its retries
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: SequenceError,
    },

    /// The action is not valid for the current step
    #[error("Cannot {action} while the current step is {current}")]
    InvalidAction { action: &'static str, current: u8 },
}

struct EngineState {
    session: PipelineSession,
    /// Bumped by every action that launches or invalidates a run
    generation: u64,
}

struct Shared {
    state: Mutex<EngineState>,
    logs: LogStream,
    snapshots: Arc<EventHub<PipelineSession>>,
    store: Arc<dyn SessionStore>,
    writer: SessionWriter,
    generator: Arc<dyn ContentGenerator>,
    config: EngineConfig,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation; when it returns `Some`, queue a save and publish a
    /// snapshot. `None` leaves nothing observable behind.
    fn transition<R>(&self, f: impl FnOnce(&mut EngineState) -> Option<R>) -> Option<R> {
        let (result, snapshot) = {
            let mut state = self.lock();
            let result = f(&mut *state)?;
            let snapshot = state.session.clone();
            // Queued under the lock so saves land in mutation order
            self.writer.save(snapshot.clone());
            (result, snapshot)
        };
        self.snapshots.publish(&snapshot);
        Some(result)
    }

    /// Mutate the session only if `generation` is still the live one
    fn apply<R>(&self, generation: u64, f: impl FnOnce(&mut PipelineSession) -> R) -> Option<R> {
        self.transition(|state| {
            if state.generation == generation {
                Some(f(&mut state.session))
            } else {
                debug!("Discarding result of superseded run {}", generation);
                None
            }
        })
    }

    /// Swap in a whole new session without saving it
    fn replace(&self, session: PipelineSession) {
        let snapshot = {
            let mut state = self.lock();
            state.generation += 1;
            state.session = session;
            state.session.clone()
        };
        self.snapshots.publish(&snapshot);
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// The run may start another stage
    fn is_live(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.session.busy
    }

    fn log(&self, message: impl Into<String>, severity: Severity) {
        self.logs.emit(message, severity, None, None);
    }

    /// Log on behalf of a run; dropped once the run is superseded
    fn log_for(&self, generation: u64, message: impl Into<String>, severity: Severity) {
        if self.generation() == generation {
            self.log(message, severity);
        }
    }
}

/// Pipeline engine
///
/// Owns the session aggregate, its log stream and the persistence writer.
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct PipelineEngine {
    shared: Arc<Shared>,
}

impl PipelineEngine {
    /// Create an engine with a fresh session. Must be called from within a
    /// tokio runtime (persistence runs on a background task).
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                session: PipelineSession::new(),
                generation: 0,
            }),
            logs: LogStream::new(),
            snapshots: Arc::new(EventHub::new()),
            writer: SessionWriter::spawn(store.clone()),
            store,
            generator,
            config,
        });

        // Every entry on the stream lands in the aggregate's log
        let weak = Arc::downgrade(&shared);
        let _feed = shared.logs.subscribe(move |entry: &LogEntry| {
            if let Some(shared) = weak.upgrade() {
                shared.transition(|state| {
                    state.session.logs.push(entry.clone());
                    Some(())
                });
            }
        });

        Self { shared }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The engine's log stream, for presentation listeners
    pub fn log_stream(&self) -> LogStream {
        self.shared.logs.clone()
    }

    /// Owned copy of the current aggregate
    pub fn snapshot(&self) -> PipelineSession {
        self.shared.lock().session.clone()
    }

    /// Receive a snapshot after every mutation
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PipelineSession) + Send + Sync + 'static,
    {
        self.shared.snapshots.subscribe(listener)
    }

    /// Wait until every queued save has been applied
    pub async fn flush(&self) {
        self.shared.writer.flush().await;
    }

    /// Begin a new run from raw requirements; a no-op while busy
    pub async fn start(&self, raw_input: impl Into<String>) -> Result<(), EngineError> {
        let raw_input = raw_input.into();
        let launched = self.shared.transition(|state| {
            if state.session.busy {
                return None;
            }
            state.generation += 1;

            let session = &mut state.session;
            session.busy = true;
            session.context = PipelineContext::new(raw_input);
            for step in &mut session.steps {
                step.clear();
            }
            session.current_step_id = Stage::Analysis.id();
            Some(state.generation)
        });

        let Some(generation) = launched else {
            debug!("Start ignored: a run is already in progress");
            return Ok(());
        };

        info!("Starting pipeline run {}", generation);
        self.shared.log("Pipeline started", Severity::System);
        self.run_analysis(generation, &[]).await
    }

    /// Complete the human-input gate and run the remaining stages
    pub async fn submit_human_input(&self, info: RegistrationInfo) -> Result<(), EngineError> {
        let mut current = 0;
        let launched = self.shared.transition(|state| {
            current = state.session.current_step_id;
            if current != Stage::HumanInput.id() {
                return None;
            }
            state.generation += 1;

            let session = &mut state.session;
            session.context.registration = Some(info);
            session.set_status(Stage::HumanInput, StepStatus::Success);
            session.current_step_id = Stage::Visuals.id();
            session.busy = true;
            Some(state.generation)
        });

        let Some(generation) = launched else {
            return Err(EngineError::InvalidAction {
                action: "submit human input",
                current,
            });
        };

        self.shared
            .log("Registration details received", Severity::Info);
        self.run_from(generation, Stage::Visuals, Vec::new()).await
    }

    /// Clear the busy flag; in-flight work finishes but nothing new starts
    pub fn stop(&self) {
        let stopped = self.shared.transition(|state| {
            if !state.session.busy {
                return None;
            }
            state.session.busy = false;
            Some(())
        });

        if stopped.is_some() {
            self.shared.log("Pipeline stopped", Severity::Warning);
        }
    }

    /// Re-run the current step; a no-op while busy
    pub async fn retry(&self) -> Result<(), EngineError> {
        let unit_grained = self.shared.config.resume_mode == ResumeMode::Unit;
        let mut current = 0;
        let mut busy = false;

        let launched = self.shared.transition(|state| {
            current = state.session.current_step_id;
            busy = state.session.busy;
            if busy {
                return None;
            }
            let stage = state.session.current_stage()?;
            state.generation += 1;

            let session = &mut state.session;
            let skip = match session.step(stage.id()) {
                Some(step) if unit_grained => step.completed_units.clone(),
                _ => Vec::new(),
            };
            if stage == Stage::HumanInput {
                session.set_status(Stage::HumanInput, StepStatus::Running);
            }
            session.busy = true;
            Some((state.generation, stage, skip))
        });

        let Some((generation, stage, skip)) = launched else {
            if busy {
                debug!("Retry ignored: a run is already in progress");
                return Ok(());
            }
            return Err(EngineError::InvalidAction {
                action: "retry",
                current,
            });
        };

        self.shared
            .log(format!("Retrying {}", stage.name()), Severity::System);

        match stage {
            Stage::Analysis => self.run_analysis(generation, &skip).await,
            Stage::HumanInput => {
                self.shared
                    .log("Awaiting registration details", Severity::System);
                Ok(())
            }
            _ => self.run_from(generation, stage, skip).await,
        }
    }

    /// Mark the audit step passed without running it
    pub fn skip(&self) -> Result<(), EngineError> {
        let mut current = 0;
        let skipped = self.shared.transition(|state| {
            current = state.session.current_step_id;
            if current != Stage::Audit.id() {
                return None;
            }
            state.generation += 1;
            state.session.set_status(Stage::Audit, StepStatus::Success);
            state.session.busy = false;
            Some(())
        });

        if skipped.is_none() {
            return Err(EngineError::InvalidAction {
                action: "skip",
                current,
            });
        }

        self.shared.log("Audit skipped", Severity::Warning);
        Ok(())
    }

    /// Discard the durable session and start over with a fresh aggregate
    pub fn reset(&self) {
        self.shared.writer.clear();
        self.shared.replace(PipelineSession::new());
        info!("Pipeline session reset");
    }

    /// Replace the aggregate with the durable session, if one exists
    pub async fn restore(&self) -> anyhow::Result<bool> {
        self.shared.writer.flush().await;

        let Some(mut session) = self.shared.store.load().await? else {
            debug!("No persisted session to restore");
            return Ok(false);
        };
        self.shared.store.hydrate(&mut session).await?;
        session.busy = false;

        info!(
            "Restored session at step {} with {} log entries",
            session.current_step_id,
            session.logs.len()
        );
        self.shared.replace(session);
        Ok(true)
    }

    /// Run analysis and, on success, arm the human-input gate
    async fn run_analysis(&self, generation: u64, skip: &[String]) -> Result<(), EngineError> {
        if self.run_stage(generation, Stage::Analysis, skip).await? {
            self.shared
                .log_for(generation, "Awaiting registration details", Severity::System);
        }
        Ok(())
    }

    /// Run `first` and every later stage while the run stays live
    async fn run_from(
        &self,
        generation: u64,
        first: Stage,
        mut skip: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut stage = first;
        loop {
            if !self.shared.is_live(generation) {
                info!("Run {} halted before {}", generation, stage);
                return Ok(());
            }
            if !self.run_stage(generation, stage, &skip).await? {
                return Ok(());
            }
            skip.clear();

            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }

        if self.shared.apply(generation, |session| session.busy = false).is_some() {
            self.shared
                .log_for(generation, "Pipeline finished", Severity::Success);
        }
        Ok(())
    }

    /// Execute one stage against a copy of the context and write the result
    /// back. Returns `false` if the run was superseded meanwhile.
    async fn run_stage(
        &self,
        generation: u64,
        stage: Stage,
        skip: &[String],
    ) -> Result<bool, EngineError> {
        let Some(mut ctx) = self.shared.apply(generation, |session| {
            session.current_step_id = stage.id();
            session.set_status(stage, StepStatus::Running);
            session.context.clone()
        }) else {
            return Ok(false);
        };

        self.shared
            .log_for(generation, format!("Running {}", stage.name()), Severity::Info);

        let units = stages::compose(stage, &self.shared.generator, &self.shared.config);
        let started = Instant::now();
        let result = self
            .runner_for(generation)
            .run_sequence_skipping(units, &mut ctx, skip)
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                let status = match stage {
                    Stage::Audit => match ctx.latest_audit() {
                        Some(report) if report.passed => StepStatus::Success,
                        _ => StepStatus::Warn,
                    },
                    _ => StepStatus::Success,
                };

                let applied = self.shared.apply(generation, move |session| {
                    session.context = ctx;
                    if let Some(step) = session.step_mut(stage.id()) {
                        step.status = status;
                        step.metrics = Some(StepMetrics {
                            duration_ms,
                            tokens: stage.estimated_tokens(),
                        });
                        step.completed_units.clear();
                    }
                    if let Some(next) = stage.next() {
                        session.current_step_id = next.id();
                        if next == Stage::HumanInput {
                            session.set_status(next, StepStatus::Running);
                        }
                    }
                });
                if applied.is_none() {
                    return Ok(false);
                }

                if status == StepStatus::Warn {
                    self.shared.log_for(
                        generation,
                        format!("{} completed with findings", stage.name()),
                        Severity::Warning,
                    );
                } else {
                    self.shared.log_for(
                        generation,
                        format!("{} completed", stage.name()),
                        Severity::Success,
                    );
                }
                Ok(true)
            }
            Err(source) => {
                let mut completed = skip.to_vec();
                completed.extend(source.completed.iter().cloned());

                let applied = self.shared.apply(generation, move |session| {
                    session.context = ctx;
                    session.busy = false;
                    if let Some(step) = session.step_mut(stage.id()) {
                        step.status = StepStatus::Error;
                        step.completed_units = completed;
                    }
                });
                if applied.is_some() {
                    self.shared.log_for(
                        generation,
                        format!("{} failed: {}", stage.name(), source),
                        Severity::Error,
                    );
                } else {
                    warn!("Superseded run {} failed at {}: {}", generation, stage, source);
                }
                Err(EngineError::Stage { stage, source })
            }
        }
    }

    /// A runner whose log entries reach the engine only while `generation`
    /// is live
    fn runner_for(&self, generation: u64) -> TaskRunner {
        let stream = self.shared.logs.fork();
        let weak = Arc::downgrade(&self.shared);
        let _relay = stream.subscribe(move |entry: &LogEntry| {
            if let Some(shared) = weak.upgrade() {
                if shared.generation() == generation {
                    shared.logs.relay(entry);
                }
            }
        });
        TaskRunner::new(stream)
    }
}
