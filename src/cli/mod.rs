//! Command-line interface

pub mod commands;
pub mod output;
pub mod terminal_output;

use clap::{Parser, Subcommand};
use commands::{LogsCommand, RunCommand, StatusCommand, SubmitCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Turn raw requirements into a complete artifact bundle
#[derive(Debug, Parser, Clone)]
#[command(name = "forgeline")]
#[command(author = "forgeline contributors")]
#[command(version = "0.1.0")]
#[command(about = "A resumable pipeline for software artifact bundles", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep the session in memory only
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start a new run from a requirements file
    Run(RunCommand),

    /// Provide registration details and run the remaining stages
    Submit(SubmitCommand),

    /// Re-run the current step
    Retry,

    /// Mark the audit step as passed without running it
    Skip,

    /// Show the state of the persisted session
    Status(StatusCommand),

    /// Show the execution log
    Logs(LogsCommand),

    /// Discard the persisted session
    Reset,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
