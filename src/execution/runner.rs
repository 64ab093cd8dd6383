//! Task runner - executes work units in order with retry and backoff

use crate::core::{Attachment, PipelineContext, RetryPolicy, Severity};
use crate::execution::log_stream::LogStream;
use crate::generator::GenerationError;
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Error raised by a single work unit attempt
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("{0}")]
    Failed(String),
}

/// A sequence aborted because one unit exhausted its retries
#[derive(Debug, Error)]
#[error("{task} failed after {attempts} attempt(s): {source}")]
pub struct SequenceError {
    /// Name of the failing unit
    pub task: String,

    pub attempts: usize,

    /// Units that completed before the failure, in order
    pub completed: Vec<String>,

    #[source]
    pub source: TaskError,
}

/// Logging callback handed to work units
///
/// Units report progress through this interface only; attribution to the
/// unit's role is added by the runner.
pub trait TaskLogger: Send + Sync {
    fn log(&self, message: &str, severity: Severity);

    fn log_with_attachment(&self, message: &str, severity: Severity, attachment: Attachment);
}

/// The body of a work unit
#[async_trait]
pub trait UnitJob: Send + Sync {
    async fn run(&self, ctx: &mut PipelineContext, log: &dyn TaskLogger) -> Result<(), TaskError>;
}

/// A named, role-attributed unit of execution
pub struct WorkUnit {
    pub name: String,
    pub role: String,
    pub retry: Option<RetryPolicy>,
    job: Box<dyn UnitJob>,
}

impl WorkUnit {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        job: impl UnitJob + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            retry: None,
            job: Box::new(job),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Routes a unit's log calls to the stream under its role
struct UnitLogger<'a> {
    stream: &'a LogStream,
    role: &'a str,
}

impl TaskLogger for UnitLogger<'_> {
    fn log(&self, message: &str, severity: Severity) {
        self.stream.emit(message, severity, Some(self.role), None);
    }

    fn log_with_attachment(&self, message: &str, severity: Severity, attachment: Attachment) {
        self.stream
            .emit(message, severity, Some(self.role), Some(attachment));
    }
}

/// Runs work units strictly in sequence against one context
#[derive(Clone)]
pub struct TaskRunner {
    stream: LogStream,
}

impl TaskRunner {
    pub fn new(stream: LogStream) -> Self {
        Self { stream }
    }

    /// Run every unit in order; the first unit to exhaust its retries
    /// aborts the sequence
    pub async fn run_sequence(
        &self,
        units: Vec<WorkUnit>,
        ctx: &mut PipelineContext,
    ) -> Result<(), SequenceError> {
        self.run_sequence_skipping(units, ctx, &[]).await
    }

    /// Like [`run_sequence`](Self::run_sequence), omitting units whose
    /// names appear in `skip`
    pub async fn run_sequence_skipping(
        &self,
        units: Vec<WorkUnit>,
        ctx: &mut PipelineContext,
        skip: &[String],
    ) -> Result<(), SequenceError> {
        let mut completed = Vec::new();

        for unit in units {
            if skip.contains(&unit.name) {
                debug!("Skipping already completed unit: {}", unit.name);
                continue;
            }

            self.stream.emit(
                format!("Starting {} ({})", unit.name, unit.role),
                Severity::System,
                Some(&unit.role),
                None,
            );

            let started = Instant::now();
            match self.run_unit(&unit, ctx).await {
                Ok(()) => {
                    self.stream.emit(
                        format!(
                            "{} completed in {}",
                            unit.name,
                            format_elapsed(started.elapsed())
                        ),
                        Severity::Success,
                        Some(&unit.role),
                        None,
                    );
                    completed.push(unit.name);
                }
                Err((attempts, source)) => {
                    self.stream.emit(
                        format!("{} failed: {}", unit.name, source),
                        Severity::Error,
                        Some(&unit.role),
                        None,
                    );
                    return Err(SequenceError {
                        task: unit.name,
                        attempts,
                        completed,
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Attempt a unit until it succeeds or its retries run out; on failure
    /// returns the number of attempts made with the last error
    async fn run_unit(
        &self,
        unit: &WorkUnit,
        ctx: &mut PipelineContext,
    ) -> Result<(), (usize, TaskError)> {
        let policy = unit.retry.unwrap_or_default();
        let logger = UnitLogger {
            stream: &self.stream,
            role: &unit.role,
        };

        let mut attempt = 0;
        loop {
            match unit.job.run(ctx, &logger).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.max_retries => {
                    attempt += 1;
                    logger.log(
                        &format!(
                            "{} failed: {}. Retrying (attempt {}/{})",
                            unit.name, e, attempt, policy.max_retries
                        ),
                        Severity::Warning,
                    );
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                }
                Err(e) => return Err((attempt + 1, e)),
            }
        }
    }
}

fn format_elapsed(elapsed: std::time::Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
