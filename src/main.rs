//! CLI Entry Point for labscan
//!
//! Provides command-line interface for:
//! - Running an experiment plan against the configured devices
//! - Validating instrument and plan files without touching hardware
//! - Listing the registered drivers
//!
//! # Usage
//!
//! Run a plan (instrument files default to the plan's `init` block):
//! ```bash
//! labscan run --plan demos/plans/laser_scan.yml --output results/laser_scan.jsonl
//! ```
//!
//! Validate:
//! ```bash
//! labscan validate --plan demos/plans/laser_scan.yml --devices demos/lab/devices.yml
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use labscan::config::{load_experiment, LoadedExperiment, Overrides, Settings};
use labscan::experiment::{
    ExperimentPlan, JsonLinesSink, MemorySink, ResultSink, RunEngine, RunOutcome,
};
use labscan::hardware::{register_mock_factories, DeviceGraph, DriverResolver};
use labscan::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labscan")]
#[command(about = "Declarative laboratory experiments", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./labscan.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ExperimentFiles {
    /// Experiment plan
    #[arg(long)]
    plan: PathBuf,

    /// Devices file; repeat to merge several (later definitions win)
    #[arg(long)]
    devices: Vec<PathBuf>,

    /// Sensors file
    #[arg(long)]
    sensors: Option<PathBuf>,

    /// Actuators file
    #[arg(long)]
    actuators: Option<PathBuf>,
}

impl ExperimentFiles {
    fn overrides(&self) -> Overrides {
        Overrides {
            devices: self.devices.clone(),
            sensors: self.sensors.clone(),
            actuators: self.actuators.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment plan
    Run {
        #[command(flatten)]
        files: ExperimentFiles,

        /// Write scan records here as JSON Lines
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load and validate instrument and plan files without running anything
    Validate {
        #[command(flatten)]
        files: ExperimentFiles,
    },

    /// List registered driver specs
    Drivers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load settings")?;
    settings.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let mut resolver = DriverResolver::new();
    register_mock_factories(&mut resolver)?;

    match cli.command {
        Commands::Run { files, output } => run(&resolver, &settings, &files, output).await,
        Commands::Validate { files } => validate(&resolver, &settings, &files).await,
        Commands::Drivers => {
            for spec in resolver.specs() {
                let factory = resolver.resolve(spec)?;
                let capabilities: Vec<String> =
                    factory.capabilities().iter().map(ToString::to_string).collect();
                println!("{spec:<16} {:<24} [{}]", factory.name(), capabilities.join(", "));
            }
            Ok(())
        }
    }
}

async fn load(resolver: &DriverResolver, files: &ExperimentFiles) -> Result<(LoadedExperiment, DeviceGraph)> {
    println!("📜 Loading plan: {}", files.plan.display());
    let experiment = load_experiment(&files.plan, &files.overrides())?;

    println!("🔧 Building device graph ({} device specs)...", experiment.devices.len());
    let graph = DeviceGraph::load(
        resolver,
        experiment.devices.clone(),
        &experiment.sensors,
        &experiment.actuators,
    )
    .await
    .context("Failed to build device graph")?;
    Ok((experiment, graph))
}

async fn validate(resolver: &DriverResolver, settings: &Settings, files: &ExperimentFiles) -> Result<()> {
    let (experiment, graph) = load(resolver, files).await?;
    let plan = ExperimentPlan::resolve(&experiment.plan, &graph, settings.settle())
        .context("Plan validation failed")?;

    println!("✅ Configuration valid");
    println!("   Devices:    {}", graph.len());
    println!("   Properties: {}", graph.registry().len());
    for scan in &plan.scans {
        println!(
            "   Scan '{}': {} → {} set-points × {} pass(es), {} detector(s)",
            scan.name,
            scan.target,
            scan.range.len(),
            scan.repeat,
            scan.detectors.len()
        );
    }
    println!("   Finish blocks: {}", plan.finish.len());
    Ok(())
}

async fn run(
    resolver: &DriverResolver,
    settings: &Settings,
    files: &ExperimentFiles,
    output: Option<PathBuf>,
) -> Result<()> {
    let (experiment, graph) = load(resolver, files).await?;
    let engine = RunEngine::from_settings(Arc::new(graph), settings);

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping at the next set-point");
            stop.stop();
        }
    });

    let output = output.or_else(|| {
        settings.output_dir.as_ref().map(|dir| {
            let name = if experiment.plan.name.is_empty() {
                "run"
            } else {
                experiment.plan.name.as_str()
            };
            dir.join(format!("{name}_{}.jsonl", chrono::Utc::now().format("%Y%m%dT%H%M%S")))
        })
    });
    let mut sink: Box<dyn ResultSink> = match &output {
        Some(path) => {
            info!(path = %path.display(), "Writing records");
            Box::new(JsonLinesSink::create(path).await?)
        }
        None => Box::new(MemorySink::new()),
    };

    println!("▶️  Running plan '{}'...", experiment.plan.name);
    let report = engine.run(&experiment.plan, sink.as_mut()).await?;

    println!();
    match report.outcome {
        RunOutcome::CompletedClean => println!("✅ Run completed"),
        RunOutcome::CompletedWithErrors => println!("⚠️  Run completed with errors"),
        RunOutcome::Aborted => println!("❌ Run aborted"),
    }
    println!("   Run ID:  {}", report.run_id);
    println!(
        "   Records: {} ({} failed)",
        report.records_emitted, report.failed_records
    );
    if report.stopped_early {
        println!("   Stopped early on request");
    }
    if let Some(path) = &output {
        println!("   Output:  {}", path.display());
    }
    for (phase, failures) in [
        ("init", &report.init_failures),
        ("scan", &report.scan_failures),
        ("finish", &report.finish_failures),
    ] {
        for failure in failures {
            println!("   [{phase}] {failure}");
        }
    }

    match (report.outcome, report.abort_reason) {
        (RunOutcome::Aborted, Some(reason)) => anyhow::bail!("Run aborted: {reason}"),
        (RunOutcome::Aborted, None) => anyhow::bail!("Run aborted"),
        _ => Ok(()),
    }
}
