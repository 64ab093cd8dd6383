//! Engine configuration from YAML

use crate::core::step::Stage;
use crate::generator::{AspectRatio, QualityTier};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry policy for a work unit
///
/// Backoff is linear: the wait before retry attempt `n` is `backoff_ms * n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    #[serde(default)]
    pub max_retries: usize,

    /// Base backoff interval in milliseconds
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
        }
    }

    /// Wait before retry attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

/// How `retry()` resumes a failed stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Re-run every work unit of the stage
    #[default]
    Stage,
    /// Skip work units that already completed in the failed run
    Unit,
}

/// Retry policies per stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub analysis: RetryPolicy,
    pub visuals: RetryPolicy,
    pub documents: RetryPolicy,
    pub source: RetryPolicy,
    pub audit: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            analysis: RetryPolicy::new(1, 1_000),
            // Image generation fails far more often than text generation
            visuals: RetryPolicy::new(3, 500),
            documents: RetryPolicy::new(1, 1_000),
            source: RetryPolicy::new(1, 1_000),
            audit: RetryPolicy::default(),
        }
    }
}

impl RetrySettings {
    /// Policy for the work units of a stage
    pub fn for_stage(&self, stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Analysis => self.analysis,
            Stage::HumanInput => RetryPolicy::default(),
            Stage::Visuals => self.visuals,
            Stage::Documents => self.documents,
            Stage::Source => self.source,
            Stage::Audit => self.audit,
        }
    }
}

/// Quality tier used for each text-producing stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    pub analysis: QualityTier,
    pub documents: QualityTier,
    pub source: QualityTier,
    pub audit: QualityTier,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            analysis: QualityTier::Pro,
            documents: QualityTier::Pro,
            source: QualityTier::Fast,
            audit: QualityTier::Pro,
        }
    }
}

/// External generator command settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Executable to invoke
    pub command: String,

    /// Arguments placed before the per-call arguments
    pub args: Vec<String>,

    /// Timeout for a single call in seconds
    pub timeout_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            command: "forgeline-gen".to_string(),
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub resume_mode: ResumeMode,

    pub retry: RetrySettings,

    pub quality: QualitySettings,

    /// Aspect ratio for rendered page images
    pub image_aspect_ratio: AspectRatio,

    /// Document deliverables, by filename
    pub documents: Vec<String>,

    pub generator: GeneratorSettings,

    /// SQLite session database (defaults to the local data directory)
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resume_mode: ResumeMode::default(),
            retry: RetrySettings::default(),
            quality: QualitySettings::default(),
            image_aspect_ratio: AspectRatio::Landscape,
            documents: vec![
                "requirements.md".to_string(),
                "design.md".to_string(),
                "user-manual.md".to_string(),
            ],
            generator: GeneratorSettings::default(),
            database_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.documents.is_empty() {
            anyhow::bail!("At least one document deliverable is required");
        }

        let mut seen = std::collections::HashSet::new();
        for name in &self.documents {
            if name.trim().is_empty() {
                anyhow::bail!("Document names must not be empty");
            }
            if name.contains('/') || name.contains('\\') {
                anyhow::bail!("Document name '{}' must be a plain filename", name);
            }
            if !seen.insert(name) {
                anyhow::bail!("Duplicate document name: {}", name);
            }
        }

        if self.generator.command.trim().is_empty() {
            anyhow::bail!("generator.command must not be empty");
        }
        if self.generator.timeout_secs == 0 {
            anyhow::bail!("generator.timeout_secs must be greater than zero");
        }

        Ok(())
    }

    /// Database path, falling back to the platform data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("forgeline")
                .join("session.db")
        })
    }
}
