//! Command definitions and the wiring from CLI flags to a running pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use planpipe::batch::{BatchJob, BatchProgress, BatchReport};
use planpipe::config::{load_config, Config};
use planpipe::external::{Extractors, JsonFileSink};
use planpipe::pipeline::{BroadcastSink, EventSink, FanoutSink, PipelineEvent, TracingSink};
use planpipe::telemetry::LogFormat;
use planpipe::{BatchController, NormalizationEngine, PipelineConfig, RuleSet};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Process building-plan PDFs into canonical records.
#[derive(Parser, Debug)]
#[command(name = "planpipe", version, about, long_about = None)]
pub struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true, env = "PLANPIPE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a PDF file or a directory of PDFs through the pipeline.
    Run {
        /// A PDF file or a directory containing PDFs.
        path: PathBuf,

        /// Configuration file. Defaults to <config dir>/planpipe/config.json
        /// when present.
        #[arg(short, long, env = "PLANPIPE_CONFIG")]
        config: Option<PathBuf>,

        /// Rule file (YAML or JSON); replaces the configured rules.
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Number of worker threads.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stream pipeline events to stdout as JSON lines. The batch report
        /// follows as the last line.
        #[arg(long)]
        events: bool,
    },

    /// Validate a rule file and report what it contains.
    CheckRules {
        /// Rule file (YAML or JSON).
        file: PathBuf,
    },
}

pub fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            path,
            config,
            rules,
            workers,
            events,
        } => run_batch(&path, config, rules, workers, events),
        Command::CheckRules { file } => check_rules(&file),
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("planpipe").join("config.json"))
        .filter(|path| path.is_file())
}

fn load_settings(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path.or_else(default_config_path) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config(&path)
                .with_context(|| format!("Failed to load configuration '{}'", path.display()))
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

fn check_rules(file: &Path) -> Result<ExitCode> {
    let rules = RuleSet::load(file)
        .with_context(|| format!("Invalid rule file '{}'", file.display()))?;
    let engine = NormalizationEngine::new(&rules, true)?;

    println!(
        "{}: {} normalization rule(s), {} validation rule(s)",
        file.display(),
        engine.rule_count(),
        engine.validation_count()
    );
    Ok(ExitCode::SUCCESS)
}

fn run_batch(
    path: &Path,
    config_path: Option<PathBuf>,
    rules_path: Option<PathBuf>,
    workers: Option<usize>,
    stream_events: bool,
) -> Result<ExitCode> {
    let config = load_settings(config_path)?;
    let mut pipeline = PipelineConfig::from_config(&config)?;
    if let Some(workers) = workers {
        pipeline.worker_count = workers.max(1);
    }
    if let Some(rules_path) = rules_path {
        let rules = RuleSet::load(&rules_path)
            .with_context(|| format!("Invalid rule file '{}'", rules_path.display()))?;
        pipeline.rule_set = Arc::new(rules);
    }
    if pipeline.rule_set.rules.is_empty() {
        warn!("No normalization rules configured; records will be empty");
    }

    let sink = Arc::new(JsonFileSink::new(&pipeline.output_directory));

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
    let printer = if stream_events {
        let broadcast = BroadcastSink::default();
        let printer = spawn_event_printer(broadcast.subscribe())?;
        sinks.push(Arc::new(broadcast));
        Some(printer)
    } else {
        None
    };
    let events: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

    let controller = BatchController::from_config(&pipeline, Extractors::default(), sink, events)?;

    info!(
        "Processing {} with {} worker(s), records go to {}",
        path.display(),
        pipeline.worker_count,
        pipeline.output_directory.display()
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let batch = controller
        .submit(path)
        .with_context(|| format!("Failed to submit '{}'", path.display()))?;
    watch_batch(&controller, &batch, &interrupted)?;

    let report = batch.report();
    let halted = controller.coordinator().halted();
    controller.shutdown();
    if let Some(printer) = printer {
        let _ = printer.join();
    }

    println!("{}", render_report(&report, stream_events)?);
    print_summary(&report);

    if let Some(reason) = &halted {
        tracing::error!("Intake was halted: {}", reason);
    }
    if halted.is_some() || report.has_rejections() || !report.abandoned.is_empty() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Waits for the batch, printing progress to stderr and cancelling on Ctrl-C.
fn watch_batch(
    controller: &BatchController,
    batch: &BatchJob,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut cancelled = false;
    let mut last: Option<BatchProgress> = None;

    loop {
        let complete =
            controller.wait_for(batch, POLL_INTERVAL, Some(Instant::now() + PROGRESS_INTERVAL));

        let progress = batch.progress();
        if last != Some(progress) {
            eprintln!(
                "[{}] {}/{} done ({} stored, {} failed), {} running, {} queued",
                batch.id(),
                progress.succeeded + progress.failed,
                progress.total,
                progress.succeeded,
                progress.failed,
                progress.in_progress,
                progress.queued
            );
            last = Some(progress);
        }
        if complete {
            return Ok(());
        }

        if interrupted.load(Ordering::SeqCst) && !cancelled {
            cancelled = true;
            let count = controller.cancel_batch(batch.id())?;
            warn!("Interrupted, cancelling {} document(s)", count);
        }
    }
}

fn spawn_event_printer(
    mut receiver: broadcast::Receiver<PipelineEvent>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("planpipe-events".to_string())
        .spawn(move || loop {
            match receiver.blocking_recv() {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event stream lagged, {} event(s) dropped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        })
        .context("Failed to start event printer")
}

/// Pretty JSON, or a single line when stdout carries the event stream.
fn render_report(report: &BatchReport, stream_events: bool) -> Result<String> {
    let rendered = if stream_events {
        serde_json::to_string(report)?
    } else {
        serde_json::to_string_pretty(report)?
    };
    Ok(rendered)
}

fn print_summary(report: &BatchReport) {
    let progress = &report.progress;
    eprintln!(
        "{} document(s): {} stored, {} rejected, {} abandoned, {} duplicate(s)",
        progress.total,
        progress.succeeded,
        report.rejections.len(),
        report.abandoned.len(),
        report.duplicates.len()
    );
    for rejection in &report.rejections {
        eprintln!(
            "  rejected {} at {} ({}{}): {}",
            rejection.source_path.display(),
            rejection.stage,
            rejection.kind,
            if rejection.escalated { ", retries exhausted" } else { "" },
            rejection.message
        );
    }
}
