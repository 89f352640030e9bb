//! Command-line interface for reelforge.
//!
//! Provides commands for running manifests, checking run status, listing
//! and watching runs, and validating manifests before use.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{Manifest, Orchestrator, ProjectSpec};
use crate::domain::RunStatus;

/// reelforge - Manifest-driven media production orchestrator
#[derive(Parser, Debug)]
#[command(name = "reelforge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a manifest
    Run {
        /// Path to the manifest YAML file
        manifest: PathBuf,

        /// Project identifier (defaults to the run's correlation id)
        #[arg(short, long)]
        project: Option<String>,

        /// Project metadata as key=value (repeatable)
        #[arg(short, long)]
        meta: Vec<String>,
    },

    /// Check the status of a run
    Status {
        /// Correlation ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Stream progress events for a run until it finishes
    Watch {
        /// Correlation ID (UUID)
        run_id: String,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Validate a manifest without running it
    Validate {
        /// Path to the manifest YAML file
        manifest: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                manifest,
                project,
                meta,
            } => run_manifest(&manifest, project, meta).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Watch {
                run_id,
                interval_ms,
            } => watch_run(&run_id, interval_ms).await,
            Commands::Validate { manifest } => validate_manifest(&manifest).await,
            Commands::Config => show_config(),
        }
    }
}

/// Run a manifest to its terminal state
async fn run_manifest(
    manifest_path: &PathBuf,
    project: Option<String>,
    meta: Vec<String>,
) -> Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;

    let mut spec = ProjectSpec {
        id: project,
        metadata: Default::default(),
    };
    for entry in meta {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid metadata entry '{}', expected key=value", entry))?;
        spec.metadata.insert(key.to_string(), value.to_string());
    }

    // Ctrl-C cancels the run rather than killing the process mid-write
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[Cancelling run...]");
            signal_token.cancel();
        }
    });

    let orchestrator = Orchestrator::new();
    let run = orchestrator.run_manifest(&manifest, spec, cancel).await?;

    let report = run.report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    match &run.status {
        RunStatus::Completed => {
            eprintln!("\n[Run {} completed]", run.correlation_id);
            Ok(())
        }
        RunStatus::Failed { error } => {
            eprintln!("\n[Run {} failed: {}]", run.correlation_id, error);
            std::process::exit(1);
        }
        other => {
            eprintln!("\n[Run {} in state: {:?}]", run.correlation_id, other);
            Ok(())
        }
    }
}

/// Show the folded status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let orchestrator = Orchestrator::new();
    let run = orchestrator.get_run_status(run_id).await?;

    println!("Run ID: {}", run.correlation_id);
    println!("Project: {}", run.project_id);
    println!("Status: {:?}", run.status);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nStep results:");
    for (step, result) in &run.steps {
        match &result.error {
            Some(error) => println!("  {}: {:?} ({})", step, result.status, error),
            None => println!("  {}: {:?}", step, result.status),
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = Orchestrator::new();
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<12}", "CORRELATION ID", "PROJECT", "STATUS");
    println!("{}", "-".repeat(76));

    for run in runs {
        let status = match &run.status {
            RunStatus::Started => "started".to_string(),
            RunStatus::Running => "running".to_string(),
            RunStatus::Completed => "completed".to_string(),
            RunStatus::Failed { .. } => "failed".to_string(),
        };
        println!(
            "{:<38} {:<24} {:<12}",
            run.correlation_id, run.project_id, status
        );
    }

    Ok(())
}

/// Poll a run's progress log and print events as they land
async fn watch_run(run_id_str: &str, interval_ms: u64) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let orchestrator = Orchestrator::new();
    let log = orchestrator.open_log(run_id).await?;
    let mut printed = 0usize;

    loop {
        let events = log.read_all().await?;
        for event in &events[printed.min(events.len())..] {
            let step = event.step_name.as_deref().unwrap_or("-");
            println!(
                "{} {:<12} {:<16} {}",
                event.timestamp.format("%H:%M:%S"),
                format!("{:?}", event.status).to_lowercase(),
                step,
                event.detail
            );
        }
        printed = events.len();

        if let Some(run) = log.read_snapshot().await? {
            if !run.is_running() {
                return Ok(());
            }
        }

        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

/// Validate a manifest and report authoring errors
async fn validate_manifest(manifest_path: &PathBuf) -> Result<()> {
    let manifest = Manifest::from_file(manifest_path)?;
    manifest.validate()?;

    println!(
        "Manifest '{}' is valid ({} steps)",
        manifest.name,
        manifest.steps.len()
    );
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let config = crate::config::config()?;

    println!("Home: {}", config.home.display());
    println!("Runs: {}", crate::config::runs_dir()?.display());
    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none found)"),
    }
    if !config.agents.is_empty() {
        println!("\nAgent endpoints:");
        for (agent, endpoint) in &config.agents {
            println!("  {}: {}", agent, endpoint);
        }
    }

    Ok(())
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}
