//! Step domain model

use serde::{Deserialize, Serialize};

/// Status of a single pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step has not started
    Idle,
    /// Step is executing (or, for the human-input step, waiting for input)
    Running,
    /// Step completed successfully
    Success,
    /// Step completed with unresolved non-fatal issues
    Warn,
    /// Step failed after exhausting its retries
    Error,
    /// Step is being re-worked by a self-correction loop
    Fixing,
}

impl StepStatus {
    /// Success and Warn both count as passed for progression
    pub fn is_passed(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Warn)
    }

    /// Check if the step is currently doing work
    pub fn is_active(&self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::Fixing)
    }
}

/// The six fixed pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Analysis = 1,
    HumanInput = 2,
    Visuals = 3,
    Documents = 4,
    Source = 5,
    Audit = 6,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Analysis,
        Stage::HumanInput,
        Stage::Visuals,
        Stage::Documents,
        Stage::Source,
        Stage::Audit,
    ];

    /// Numeric step id (1..=6)
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.id() == id)
    }

    /// The stage that follows this one, if any
    pub fn next(self) -> Option<Stage> {
        Stage::from_id(self.id() + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Analysis => "Requirements Analysis",
            Stage::HumanInput => "Registration Details",
            Stage::Visuals => "Visual Rendering",
            Stage::Documents => "Document Generation",
            Stage::Source => "Source Generation",
            Stage::Audit => "Consistency Audit",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::Analysis => "Expand the raw input, derive the fact model and plan the pages",
            Stage::HumanInput => "Collect applicant and environment details from a human",
            Stage::Visuals => "Render one image per planned page",
            Stage::Documents => "Write the textual deliverables",
            Stage::Source => "Produce a synthetic source tree",
            Stage::Audit => "Cross-check every artifact against the fact model",
        }
    }

    /// Coarse resource-usage estimate recorded when the stage succeeds.
    /// Not a measurement.
    pub fn estimated_tokens(self) -> u64 {
        match self {
            Stage::Analysis => 6_000,
            Stage::HumanInput => 0,
            Stage::Visuals => 1_500,
            Stage::Documents => 12_000,
            Stage::Source => 9_000,
            Stage::Audit => 4_000,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}. {}", self.id(), self.name())
    }
}

/// Metrics recorded for a successfully completed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Wall-clock duration of the stage in milliseconds
    pub duration_ms: u64,

    /// Estimated resource usage
    pub tokens: u64,
}

/// A single step of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Fixed ordinal, 1..=6
    pub id: u8,

    /// Display name
    pub name: String,

    pub description: String,

    pub status: StepStatus,

    /// Metrics from the last successful run
    #[serde(default)]
    pub metrics: Option<StepMetrics>,

    /// Work units that completed during the latest failed run of this step
    #[serde(default)]
    pub completed_units: Vec<String>,
}

impl Step {
    /// Create an idle step for a stage
    pub fn new(stage: Stage) -> Self {
        Self {
            id: stage.id(),
            name: stage.name().to_string(),
            description: stage.description().to_string(),
            status: StepStatus::Idle,
            metrics: None,
            completed_units: Vec::new(),
        }
    }

    /// Put the step back into its construction-time state
    pub fn clear(&mut self) {
        self.status = StepStatus::Idle;
        self.metrics = None;
        self.completed_units.clear();
    }
}

/// All six steps, idle
pub fn default_steps() -> Vec<Step> {
    Stage::ALL.iter().map(|stage| Step::new(*stage)).collect()
}
