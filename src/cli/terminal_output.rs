//! Live terminal view of a running pipeline
//!
//! `TerminalOutput` is attached to the engine's log stream and snapshot
//! feed. Log entries are printed above a progress bar that tracks passed
//! steps; a header is printed whenever the current step changes.

use crate::cli::output::{create_progress_bar, format_log_entry};
use crate::core::{LogEntry, PipelineSession, Stage};
use console::style;
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicU8, Ordering};

pub struct TerminalOutput {
    progress: ProgressBar,
    current_step: AtomicU8,
}

impl TerminalOutput {
    pub fn new() -> Self {
        Self::with_progress(create_progress_bar(Stage::ALL.len()))
    }

    /// Use a caller-provided bar (a hidden one in tests)
    pub fn with_progress(progress: ProgressBar) -> Self {
        Self {
            progress,
            current_step: AtomicU8::new(0),
        }
    }

    pub fn on_log(&self, entry: &LogEntry) {
        self.progress.println(format_log_entry(entry));
    }

    pub fn on_snapshot(&self, session: &PipelineSession) {
        let passed = session.steps.iter().filter(|s| s.status.is_passed()).count();
        self.progress.set_position(passed as u64);

        let previous = self
            .current_step
            .swap(session.current_step_id, Ordering::SeqCst);
        if previous != session.current_step_id {
            if let Some(stage) = session.current_stage() {
                self.progress.println(step_header(stage));
                self.progress.set_message(stage.name().to_string());
            }
        }
    }

    /// Remove the bar, leaving printed lines in place
    pub fn finish(&self) {
        self.progress.finish_and_clear();
    }
}

impl Default for TerminalOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Format: `[N/6] Stage name` followed by a separator
pub fn step_header(stage: Stage) -> String {
    format!(
        "\n[{}/{}] {}\n{}",
        style(stage.id()).cyan(),
        style(Stage::ALL.len()).dim(),
        style(stage.name()).bold(),
        separator()
    )
}

/// A horizontal rule spanning the terminal width
pub fn separator() -> String {
    // Get terminal width, default to 80 if unavailable
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80);
    style("─".repeat(width)).dim().to_string()
}
