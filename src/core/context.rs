//! Pipeline context - the working set shared by every work unit

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Execution context for a pipeline run
///
/// Work units receive `&mut` access and update it in place. Fields stay
/// empty until the stage that produces them has run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// The raw text the run was started with
    pub raw_input: String,

    /// Expanded requirements derived from the raw input
    #[serde(default)]
    pub requirements: Option<String>,

    /// Structured fact model
    #[serde(default)]
    pub fact_model: Option<FactModel>,

    /// Page/screen specifications derived from the fact model
    #[serde(default)]
    pub pages: Vec<PageSpec>,

    /// Human-supplied registration and environment details
    #[serde(default)]
    pub registration: Option<RegistrationInfo>,

    #[serde(default)]
    pub artifacts: Artifacts,
}

/// Structured facts about the software being described
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactModel {
    pub software_name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    pub version: String,
    pub summary: String,
    #[serde(default)]
    pub modules: Vec<FeatureModule>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureModule {
    pub name: String,
    pub description: String,
}

/// One page or screen of the described software
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    pub id: String,
    pub title: String,
    pub purpose: String,
    #[serde(default)]
    pub elements: Vec<String>,
}

/// Details only a human can provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Applicant / copyright owner
    pub owner: String,
    pub completion_date: NaiveDate,
    pub dev_hardware: String,
    pub dev_os: String,
    pub dev_tools: String,
    pub runtime_environment: String,
    pub language: String,
}

/// Everything produced after the analysis stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Generated documents (filename -> markdown content)
    #[serde(default)]
    pub documents: BTreeMap<String, String>,

    #[serde(default)]
    pub source_tree: Vec<SourceFile>,

    /// Rendered images keyed by filename
    #[serde(default)]
    pub images: BTreeMap<String, GeneratedImage>,

    /// Audit reports, oldest first
    #[serde(default)]
    pub audit_history: Vec<AuditReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub language: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub file_name: String,
    pub page_id: String,
    pub mime_type: String,
    pub payload: ImagePayload,
}

/// Image bytes, either held directly or stored by reference in a
/// persistence backend
///
/// Inline bytes are shared, so cloning a session never copies an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImagePayload {
    Inline { bytes: Arc<[u8]> },
    Stored { key: String },
}

impl ImagePayload {
    pub fn inline(bytes: impl Into<Arc<[u8]>>) -> Self {
        ImagePayload::Inline {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ImagePayload::Inline { bytes } => Some(&bytes[..]),
            ImagePayload::Stored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub severity: IssueSeverity,
    pub message: String,
    /// Artifact the issue refers to, if any
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Findings as returned by the content generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFindings {
    pub passed: bool,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub issues: Vec<AuditIssue>,
}

/// A stamped audit report in the history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub passed: bool,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    pub fn from_findings(findings: AuditFindings) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            passed: findings.passed,
            score: findings.score,
            issues: findings.issues,
        }
    }
}

impl PipelineContext {
    /// Create a fresh context seeded with raw input
    pub fn new(raw_input: impl Into<String>) -> Self {
        Self {
            raw_input: raw_input.into(),
            ..Default::default()
        }
    }

    /// The most recently appended audit report
    pub fn latest_audit(&self) -> Option<&AuditReport> {
        self.artifacts.audit_history.last()
    }

    /// Store a rendered image, replacing any previous render of the same file
    pub fn add_image(&mut self, image: GeneratedImage) {
        self.artifacts.images.insert(image.file_name.clone(), image);
    }

    /// Total number of lines across the generated source tree
    pub fn source_line_count(&self) -> usize {
        self.artifacts
            .source_tree
            .iter()
            .map(|f| f.content.lines().count())
            .sum()
    }
}
