//! Pipeline aggregate - the durable session state

use crate::core::{
    context::PipelineContext,
    log::LogEntry,
    step::{default_steps, Stage, Step, StepStatus},
};
use serde::{Deserialize, Serialize};

/// Coarse status of the whole pipeline, derived from the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Nothing has run yet
    Pending,
    /// A stage is executing
    Running,
    /// Analysis finished; waiting for registration details
    AwaitingInput,
    /// Not busy and not finished: a retry is possible
    Stopped,
    /// The audit step passed (Success or Warn)
    Finished,
}

/// The full state of one pipeline run: the unit of persistence and restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSession {
    pub steps: Vec<Step>,

    pub context: PipelineContext,

    /// Id of the current step; 0 before the first start
    pub current_step_id: u8,

    /// Append-only execution log
    pub logs: Vec<LogEntry>,

    /// Single-flight guard (not persisted)
    #[serde(skip)]
    pub busy: bool,
}

impl PipelineSession {
    /// Create the construction-time aggregate
    pub fn new() -> Self {
        Self {
            steps: default_steps(),
            context: PipelineContext::default(),
            current_step_id: 0,
            logs: Vec::new(),
            busy: false,
        }
    }

    /// Get a step by id
    pub fn step(&self, id: u8) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Get a mutable step by id
    pub fn step_mut(&mut self, id: u8) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn current_stage(&self) -> Option<Stage> {
        Stage::from_id(self.current_step_id)
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.step(self.current_step_id)
    }

    /// Set the status of a step, ignoring unknown ids
    pub fn set_status(&mut self, stage: Stage, status: StepStatus) {
        if let Some(step) = self.step_mut(stage.id()) {
            step.status = status;
        }
    }

    /// The terminal step passed
    pub fn is_finished(&self) -> bool {
        self.step(Stage::Audit.id())
            .is_some_and(|s| s.status.is_passed())
    }

    /// Not busy, not finished, started, and the active step did not succeed
    pub fn is_stopped(&self) -> bool {
        !self.busy
            && !self.is_finished()
            && self.current_step_id > 0
            && self
                .current_step()
                .is_some_and(|s| s.status != StepStatus::Success)
    }

    pub fn status(&self) -> PipelineStatus {
        if self.is_finished() {
            PipelineStatus::Finished
        } else if self.current_step_id == 0 {
            PipelineStatus::Pending
        } else if self.busy && self.current_stage() == Some(Stage::HumanInput) {
            PipelineStatus::AwaitingInput
        } else if self.busy {
            PipelineStatus::Running
        } else {
            PipelineStatus::Stopped
        }
    }

    /// Fraction of steps that passed (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let passed = self.steps.iter().filter(|s| s.status.is_passed()).count();
        passed as f64 / self.steps.len() as f64
    }
}

impl Default for PipelineSession {
    fn default() -> Self {
        Self::new()
    }
}
