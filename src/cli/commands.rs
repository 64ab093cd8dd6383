//! CLI command definitions

use crate::core::{PipelineSession, PipelineStatus, RegistrationInfo};
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Start a new run
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the raw requirements text
    #[arg(short, long)]
    pub input: PathBuf,

    /// Registration details (YAML); when given, the run continues past the
    /// human-input step without stopping
    #[arg(short, long)]
    pub registration: Option<PathBuf>,
}

/// Complete the human-input step
#[derive(Debug, Args, Clone)]
pub struct SubmitCommand {
    /// Registration details (YAML)
    #[arg(short, long)]
    pub registration: PathBuf,
}

/// Show session state
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the execution log
#[derive(Debug, Args, Clone)]
pub struct LogsCommand {
    /// Number of most recent entries to show
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Read registration details from a YAML file
pub fn load_registration(path: &Path) -> Result<RegistrationInfo> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_registration(&content)
        .with_context(|| format!("Invalid registration details in {}", path.display()))
}

/// Whether `run --registration` may carry on past the human-input step.
/// A stopped run (Ctrl-C during analysis) stays stopped.
pub fn ready_for_registration(session: &PipelineSession) -> bool {
    session.status() == PipelineStatus::AwaitingInput
}

pub fn parse_registration(yaml: &str) -> Result<RegistrationInfo> {
    let info: RegistrationInfo = serde_yaml::from_str(yaml)?;
    if info.owner.trim().is_empty() {
        anyhow::bail!("owner must not be empty");
    }
    Ok(info)
}
