use anyhow::{Context, Result};
use forgeline::cli::commands::{
    load_registration, ready_for_registration, LogsCommand, RunCommand, StatusCommand,
    SubmitCommand,
};
use forgeline::cli::output::*;
use forgeline::cli::terminal_output::{separator, TerminalOutput};
use forgeline::cli::{Cli, Command};
use forgeline::core::{EngineConfig, PipelineStatus, Severity, Stage};
use forgeline::execution::{EngineError, PipelineEngine};
use forgeline::generator::{CommandGenerator, ContentGenerator};
use forgeline::persistence::{InMemorySessionStore, SessionStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let store = open_store(&cli, &config).await?;
    let generator: Arc<dyn ContentGenerator> =
        Arc::new(CommandGenerator::from_settings(&config.generator));
    let engine = PipelineEngine::new(generator, store.clone(), config);
    engine.restore().await.context("Failed to restore session")?;

    let result = match &cli.command {
        Command::Run(cmd) => run_pipeline(&engine, cmd).await,
        Command::Submit(cmd) => submit(&engine, cmd).await,
        Command::Retry => drive(&engine, engine.retry()).await,
        Command::Skip => engine.skip().map_err(Into::into),
        Command::Status(cmd) => show_status(&engine, store.as_ref(), cmd).await,
        Command::Logs(cmd) => show_logs(&engine, cmd),
        Command::Reset => {
            engine.reset();
            println!("{} Session discarded", INFO);
            Ok(())
        }
    };

    engine.flush().await;

    if let Err(e) = result {
        println!("\n{} {}", CROSS, style(format!("{:#}", e)).red());
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_store(cli: &Cli, config: &EngineConfig) -> Result<Arc<dyn SessionStore>> {
    if cli.ephemeral {
        return Ok(Arc::new(InMemorySessionStore::new()));
    }
    let path = config.database_path();
    let store = forgeline::persistence::SqliteSessionStore::open(&path)
        .await
        .with_context(|| format!("Failed to open session database {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_cli: &Cli, _config: &EngineConfig) -> Result<Arc<dyn SessionStore>> {
    Ok(Arc::new(InMemorySessionStore::new()))
}

/// Run an engine action with live output; Ctrl-C stops the pipeline after
/// the in-flight stage
async fn drive<F>(engine: &PipelineEngine, action: F) -> Result<()>
where
    F: Future<Output = Result<(), EngineError>>,
{
    let output = Arc::new(TerminalOutput::new());
    let logs = {
        let output = output.clone();
        engine.log_stream().subscribe(move |entry| output.on_log(entry))
    };
    let snapshots = {
        let output = output.clone();
        engine.subscribe(move |session| output.on_snapshot(session))
    };

    tokio::pin!(action);
    let result = tokio::select! {
        result = &mut action => result,
        _ = tokio::signal::ctrl_c() => {
            engine.log_stream().emit(
                "Interrupted; finishing the current stage",
                Severity::Warning,
                None,
                None,
            );
            engine.stop();
            action.await
        }
    };

    logs.unsubscribe();
    snapshots.unsubscribe();
    output.finish();

    result?;
    print_outcome(engine);
    Ok(())
}

async fn run_pipeline(engine: &PipelineEngine, cmd: &RunCommand) -> Result<()> {
    let input = std::fs::read_to_string(&cmd.input)
        .with_context(|| format!("Failed to read {}", cmd.input.display()))?;
    let registration = cmd
        .registration
        .as_deref()
        .map(load_registration)
        .transpose()?;

    println!(
        "{} Starting run from {}",
        ROCKET,
        style(cmd.input.display()).bold()
    );
    drive(engine, engine.start(input)).await?;

    if let Some(info) = registration {
        if ready_for_registration(&engine.snapshot()) {
            drive(engine, engine.submit_human_input(info)).await?;
        }
    }
    Ok(())
}

async fn submit(engine: &PipelineEngine, cmd: &SubmitCommand) -> Result<()> {
    let info = load_registration(&cmd.registration)?;
    drive(engine, engine.submit_human_input(info)).await
}

fn print_outcome(engine: &PipelineEngine) {
    let session = engine.snapshot();
    match session.status() {
        PipelineStatus::Finished => println!(
            "\n{} Pipeline {}",
            CHECK,
            style("finished").green()
        ),
        PipelineStatus::AwaitingInput | PipelineStatus::Stopped
            if session.current_stage() == Some(Stage::HumanInput) =>
        {
            println!(
                "\n{} Analysis complete. Provide registration details with {}",
                INFO,
                style("forgeline submit --registration <FILE>").cyan()
            )
        }
        PipelineStatus::Stopped => println!(
            "\n{} Pipeline stopped at step {}. Resume with {}",
            WARN,
            session.current_step_id,
            style("forgeline retry").cyan()
        ),
        status => println!("\n{} Pipeline is {}", INFO, format_status(status)),
    }
}

async fn show_status(
    engine: &PipelineEngine,
    store: &dyn SessionStore,
    cmd: &StatusCommand,
) -> Result<()> {
    let session = engine.snapshot();
    let saved_at = store.updated_at().await?;

    if cmd.json {
        let data = serde_json::json!({
            "status": session.status(),
            "current_step": session.current_step_id,
            "progress": session.progress(),
            "steps": session.steps,
            "documents": session.context.artifacts.documents.keys().collect::<Vec<_>>(),
            "images": session.context.artifacts.images.keys().collect::<Vec<_>>(),
            "source_files": session.context.artifacts.source_tree.len(),
            "audits": session.context.artifacts.audit_history.len(),
            "saved_at": saved_at,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!(
        "{} Pipeline {} ({})",
        INFO,
        format_status(session.status()),
        style(format!("{:.0}%", session.progress() * 100.0)).cyan()
    );
    println!("{}", separator());
    for step in &session.steps {
        println!("{}", format_step(step, session.current_step_id));
    }

    let artifacts = &session.context.artifacts;
    if session.current_step_id > 0 {
        println!("{}", separator());
        if let Some(model) = &session.context.fact_model {
            println!(
                "  Software: {} {}",
                style(&model.software_name).bold(),
                style(&model.version).dim()
            );
        }
        println!(
            "  Artifacts: {} page(s), {} image(s), {} document(s), {} source file(s) ({} lines)",
            session.context.pages.len(),
            artifacts.images.len(),
            artifacts.documents.len(),
            artifacts.source_tree.len(),
            session.context.source_line_count()
        );
        if let Some(report) = session.context.latest_audit() {
            let verdict = if report.passed {
                style("passed").green()
            } else {
                style("not passed").yellow()
            };
            println!(
                "  Latest audit: {} with {} issue(s), {}",
                verdict,
                report.issues.len(),
                style(report.created_at.to_rfc3339()).dim()
            );
        }
    }

    let total_ms: u64 = session
        .steps
        .iter()
        .filter_map(|s| s.metrics)
        .map(|m| m.duration_ms)
        .sum();
    if total_ms > 0 {
        println!(
            "  Total stage time: {}",
            style(format_duration(Duration::from_millis(total_ms))).dim()
        );
    }
    if let Some(at) = saved_at {
        println!("  Last saved: {}", style(at.to_rfc3339()).dim());
    }

    Ok(())
}

fn show_logs(engine: &PipelineEngine, cmd: &LogsCommand) -> Result<()> {
    let session = engine.snapshot();
    let skip = session.logs.len().saturating_sub(cmd.limit);
    let entries = &session.logs[skip..];

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{} No log entries", INFO);
        return Ok(());
    }

    println!(
        "{} Showing {} of {} log entries",
        INFO,
        entries.len(),
        session.logs.len()
    );
    for entry in entries {
        println!("{}", format_log_entry(entry));
    }
    Ok(())
}
