mod checkpoint;
mod config;
mod error;
mod executor;
mod registry;
mod report;
mod scheduler;
mod trace;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::executor::TestRunner;
use crate::registry::ProjectRegistry;
use crate::scheduler::Scheduler;
use crate::trace::TraceStore;

#[derive(Parser)]
#[command(name = "mutrace")]
#[command(version)]
#[command(about = "Trace-guided mutation test scheduler for instrumented builds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate mutants against the passing test suite
    Run {
        /// Only perform pre-flight checks and print scope counts
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-aggregate the final report from existing checkpoints
    Report,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => run(&config, dry_run).await?,
        Commands::Report => report_only(&config)?,
    }

    Ok(())
}

/// Load the inputs, reconcile the two registries, and build the scheduler.
/// Every failure here is a configuration error: the run aborts before any
/// test executes.
fn build_scheduler(config: &Config) -> anyhow::Result<Scheduler> {
    let registry = ProjectRegistry::load(&config.paths.registry)
        .context("Failed to load mutation registry")?;
    let tracer_registry = ProjectRegistry::load(&config.paths.tracer_registry)
        .context("Failed to load tracer-build registry")?;
    registry
        .reconcile(&tracer_registry)
        .context("Mutation registry and tracer-build registry disagree")?;
    tracing::info!(
        "Registries reconciled: {} mutant(s) across {} file(s)",
        registry.mutant_count(),
        registry.file_count()
    );

    let traces = TraceStore::load(&config.paths.traces_dir)?;
    let runner = TestRunner::from_config(&config.runner);
    let checkpoints = CheckpointStore::new(&config.paths.checkpoint_dir);

    Ok(Scheduler::new(
        registry,
        traces,
        runner,
        checkpoints,
        config.limits.clone(),
    )?)
}

async fn run(config: &Config, dry_run: bool) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;

    let scope = scheduler.scope();
    tracing::info!(
        "Scope: {} mutant(s) total, {} covered, {} uncovered, {} unresolved; {} traced test(s)",
        scope.total_mutants,
        scope.covered,
        scope.uncovered,
        scope.unresolved,
        scope.traced_tests
    );

    if dry_run {
        tracing::info!("Dry run: no tests executed, no checkpoints written");
        return Ok(());
    }

    let tests = trace::load_passing_tests(&config.paths.passing_tests)
        .context("Failed to load passing-tests list")?;
    tracing::info!(
        "Scheduling {} test(s) across {} worker(s)",
        tests.len(),
        config.limits.workers
    );

    let scheduler = Arc::new(scheduler);
    Arc::clone(&scheduler).run(tests).await?;

    let report = scheduler.aggregate()?;
    report::write_report(&report, &config.paths.report)?;
    tracing::info!(
        "Report written to {}: {} killed, {} timeout, {} survived, {} skipped, {} uncovered (score {:.1}%)",
        config.paths.report.display(),
        report.counts.killed,
        report.counts.timeout,
        report.counts.survived,
        report.counts.skipped,
        report.counts.uncovered,
        report.mutation_score * 100.0
    );
    if !report.unreliable_tests.is_empty() {
        tracing::warn!(
            "{} test(s) had unreliable baselines this run: {:?}",
            report.unreliable_tests.len(),
            report.unreliable_tests
        );
    }
    Ok(())
}

fn report_only(config: &Config) -> anyhow::Result<()> {
    // Construction already folds persisted kill records back in, so
    // aggregation alone reproduces the run's verdicts.
    let scheduler = build_scheduler(config)?;
    let report = scheduler.aggregate()?;
    report::write_report(&report, &config.paths.report)?;
    tracing::info!(
        "Report rebuilt from checkpoints at {} ({} mutant(s))",
        config.paths.report.display(),
        report.total_mutants
    );
    Ok(())
}
