use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;

use millrun::cli::{Cli, Commands, PaidCommands};
use millrun::collab::offline::offline_collaborators;
use millrun::config::Config;
use millrun::coordinator::{Coordinator, RunOptions, RunOutcome};
use millrun::domain::{AnalysisMode, ArtifactRef, ItemStatus, RunState, Stage};
use millrun::store::{ItemStore, StageLedger};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("millrun")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("millrun.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let data_dir = &config.storage.data_dir;
    let items = Arc::new(Mutex::new(
        ItemStore::open_at(&data_dir.join("items")).context("Failed to open item store")?,
    ));
    let ledger = Arc::new(Mutex::new(
        StageLedger::open_at(&data_dir.join("ledger")).context("Failed to open stage ledger")?,
    ));
    let collabs = offline_collaborators(data_dir, config.pipeline.offline_score_prior);
    Ok(Coordinator::new(items, ledger, collabs, config.clone()))
}

fn resolve_date(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| chrono::Local::now().date_naive())
}

fn parse_stage(name: &str) -> Result<Stage> {
    match Stage::parse(name) {
        Some(stage) => Ok(stage),
        None => bail!("invalid stage '{}', expected ingest | select | generate | audit", name),
    }
}

async fn handle_run(
    stage: &str,
    date: Option<NaiveDate>,
    force: bool,
    theme: Option<String>,
    topic: Option<String>,
    mode: Option<String>,
    paid: bool,
    config: &Config,
) -> Result<()> {
    let stage = parse_stage(stage)?;
    let run_date = resolve_date(date);
    let mode = match mode.as_deref() {
        Some(m) => match AnalysisMode::parse(m) {
            Some(mode) => mode,
            None => bail!("invalid mode '{}', expected lite | full", m),
        },
        None => AnalysisMode::Lite,
    };

    let coordinator = build_coordinator(config)?;
    let opts = RunOptions {
        force_rerun: force,
        theme,
        topic,
        mode,
        paid,
        hour: None,
    };

    info!("Running {}/{}", run_date, stage);
    let outcome = coordinator.run(stage, run_date, opts).await?;

    match outcome {
        RunOutcome::Succeeded {
            attempt_id,
            artifact_refs,
        } => {
            println!(
                "{} {}/{} attempt {}",
                "Succeeded:".green(),
                run_date,
                stage,
                attempt_id
            );
            for r in artifact_refs {
                println!("  {}", r);
            }
        }
        RunOutcome::Failed { attempt_id, cause } => {
            println!("{} {}/{} attempt {}: {}", "Failed:".red(), run_date, stage, attempt_id, cause);
        }
        RunOutcome::Busy { attempt_id } => {
            println!(
                "{} {}/{} attempt {} is already running",
                "Busy:".yellow(),
                run_date,
                stage,
                attempt_id
            );
        }
    }
    Ok(())
}

async fn handle_audit(date: Option<NaiveDate>, config: &Config) -> Result<()> {
    let run_date = resolve_date(date);
    let coordinator = build_coordinator(config)?;

    let findings = coordinator.audit(run_date).await?;
    if findings.is_empty() {
        println!("{} {} is consistent", "Clean:".green(), run_date);
    } else {
        println!("{} {} findings for {}", "Drift:".yellow(), findings.len(), run_date);
        for f in findings {
            println!("  [{}] {}: {}", f.kind.as_str(), f.stage, f.detail);
        }
    }
    Ok(())
}

fn handle_status(date: Option<NaiveDate>, config: &Config) -> Result<()> {
    let run_date = resolve_date(date);
    let data_dir = &config.storage.data_dir;
    let ledger = StageLedger::open_at(&data_dir.join("ledger")).context("Failed to open stage ledger")?;

    println!("{} {}", "Status for".cyan(), run_date);
    for stage in [Stage::Ingest, Stage::Select, Stage::Generate, Stage::Audit] {
        match ledger.latest_attempt(run_date, stage)? {
            Some(rec) => {
                let state = match rec.state {
                    RunState::Succeeded => rec.state.as_str().green(),
                    RunState::Failed => rec.state.as_str().red(),
                    RunState::Running => rec.state.as_str().yellow(),
                    RunState::Pending => rec.state.as_str().normal(),
                };
                let cause = rec.cause.as_deref().unwrap_or("");
                println!("  {:9} attempt {} {} {}", stage.to_string(), rec.attempt_id, state, cause);
            }
            None => println!("  {:9} -", stage.to_string()),
        }
    }

    if let Some(delivery) = ledger.get_delivery(run_date)? {
        let state = if delivery.state == RunState::Pending {
            "pending acknowledgment".yellow()
        } else {
            "acknowledged".green()
        };
        println!("  delivery  {} ({})", state, delivery.document_ref);
    }

    let audits = ledger.audits_for_date(run_date)?;
    if let Some(latest) = audits.last() {
        println!("  audits    {} recorded, latest has {} findings", audits.len(), latest.findings.len());
    }

    let items = ItemStore::open_at(&data_dir.join("items")).context("Failed to open item store")?;
    println!(
        "  items     {} tracked, {} admitted, {} rejected",
        items.count()?,
        items.count_by_status(ItemStatus::Admitted)?,
        items.count_by_status(ItemStatus::Rejected)?,
    );

    Ok(())
}

fn handle_ack(date: Option<NaiveDate>, reference: &str, config: &Config) -> Result<()> {
    let run_date = resolve_date(date);
    let coordinator = build_coordinator(config)?;

    coordinator
        .acknowledge_delivery(run_date, ArtifactRef::new(reference))
        .context("Failed to acknowledge delivery")?;
    println!("{} delivery for {} acknowledged ({})", "Done:".green(), run_date, reference);
    Ok(())
}

fn handle_cancel(stage: &str, date: Option<NaiveDate>, config: &Config) -> Result<()> {
    let stage = parse_stage(stage)?;
    let run_date = resolve_date(date);
    let coordinator = build_coordinator(config)?;

    match coordinator.cancel(run_date, stage)? {
        Some(rec) => println!("{} {}/{} attempt {}", "Cancelled:".red(), run_date, stage, rec.attempt_id),
        None => println!("{} nothing running for {}/{}", "No-op:".yellow(), run_date, stage),
    }
    Ok(())
}

fn handle_paid(command: &PaidCommands, config: &Config) -> Result<()> {
    let coordinator = build_coordinator(config)?;
    match command {
        PaidCommands::Enqueue { topic, priority } => {
            if coordinator.enqueue_paid(topic, priority)? {
                println!("{} '{}' ({})", "Queued:".green(), topic, priority);
            } else {
                println!("{} '{}' is already queued", "No-op:".yellow(), topic);
            }
        }
    }
    Ok(())
}

async fn run_application(cli: Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match cli.command {
        Commands::Run {
            stage,
            date,
            force,
            theme,
            topic,
            mode,
            paid,
        } => handle_run(&stage, date, force, theme, topic, mode, paid, config).await,
        Commands::Audit { date } => handle_audit(date, config).await,
        Commands::Status { date } => handle_status(date, config),
        Commands::Ack { date, reference } => handle_ack(date, &reference, config),
        Commands::Cancel { stage, date } => handle_cancel(&stage, date, config),
        Commands::Paid { command } => handle_paid(&command, config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(cli, &config).await.context("Application failed")?;

    Ok(())
}
