//! CLI output formatting

use crate::core::{LogEntry, PipelineStatus, Severity, Step, StepStatus};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static PICTURE: Emoji<'_, '_> = Emoji("🖼  ", "# ");

/// Create a progress bar over the pipeline steps
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a step status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Idle => style("IDLE").dim().to_string(),
        StepStatus::Running => style("RUNNING").yellow().to_string(),
        StepStatus::Success => style("SUCCESS").green().to_string(),
        StepStatus::Warn => style("WARN").yellow().to_string(),
        StepStatus::Error => style("ERROR").red().to_string(),
        StepStatus::Fixing => style("FIXING").blue().to_string(),
    }
}

/// Format the pipeline status for display
pub fn format_status(status: PipelineStatus) -> String {
    match status {
        PipelineStatus::Pending => style("PENDING").dim().to_string(),
        PipelineStatus::Running => style("RUNNING").yellow().to_string(),
        PipelineStatus::AwaitingInput => style("AWAITING INPUT").blue().to_string(),
        PipelineStatus::Stopped => style("STOPPED").red().to_string(),
        PipelineStatus::Finished => style("FINISHED").green().to_string(),
    }
}

/// One line per step: marker, id, name, status and metrics
pub fn format_step(step: &Step, current_step_id: u8) -> String {
    let icon = match step.status {
        StepStatus::Success => CHECK,
        StepStatus::Error => CROSS,
        StepStatus::Warn => WARN,
        status if status.is_active() => SPINNER,
        _ => INFO,
    };
    let marker = if step.id == current_step_id { ">" } else { " " };

    let mut line = format!(
        "{} {}{}. {} - {}",
        marker,
        icon,
        step.id,
        style(&step.name).bold(),
        format_step_status(step.status)
    );
    if let Some(metrics) = step.metrics {
        line.push_str(&format!(
            " {}",
            style(format!(
                "({}, ~{} tokens)",
                format_duration(Duration::from_millis(metrics.duration_ms)),
                metrics.tokens
            ))
            .dim()
        ));
    }
    if !step.completed_units.is_empty() {
        line.push_str(&format!(
            " {}",
            style(format!("[done: {}]", step.completed_units.join(", "))).dim()
        ));
    }
    line
}

/// Format a log entry for display
pub fn format_log_entry(entry: &LogEntry) -> String {
    let icon = match entry.severity {
        Severity::Info => INFO,
        Severity::Success => CHECK,
        Severity::Warning => WARN,
        Severity::Error => CROSS,
        Severity::System => ROCKET,
    };
    let message = match entry.severity {
        Severity::Success => style(&entry.message).green().to_string(),
        Severity::Warning => style(&entry.message).yellow().to_string(),
        Severity::Error => style(&entry.message).red().to_string(),
        Severity::System => style(&entry.message).dim().to_string(),
        Severity::Info => entry.message.clone(),
    };

    let mut line = format!(
        "{} {}{}",
        style(entry.timestamp.format("%H:%M:%S")).dim(),
        icon,
        message
    );
    if let Some(role) = &entry.role {
        line = format!("{} {}", line, style(format!("[{}]", role)).cyan());
    }
    if let Some(crate::core::Attachment::Image { file_name }) = &entry.attachment {
        line = format!("{}\n    {}{}", line, PICTURE, style(file_name).underlined());
    }
    line
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let secs = duration.as_secs();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
