//! Recast CLI
//!
//! The `recast` command drives the translation pipeline over a compilation
//! database.
//!
//! ## Commands
//!
//! - `targets`: list the targets found in the compilation database
//! - `run`: run every stage, repair included
//! - `test`: run through the test stage only
//! - `expand-corpus`: grow the vector corpus by fuzzing the originals
//! - `status`: report persisted state without running anything
//! - `clean`: drop work directories and stamps (vectors are kept)
//! - `export-tests`: render a target's vectors as a Rust test file

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recast_core::telemetry::level_for_verbosity;
use recast_core::testvec::render_rust_tests;
use recast_core::{PipelineConfig, RecastError, Target, VectorStore, WorkDir};
use recast_pipeline::{load_targets, BuiltinStage, Orchestrator, RunReport, Services};
use tracing::info;

const DEFAULT_CONFIG: &str = "recast.toml";

#[derive(Parser)]
#[command(name = "recast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Translate a C codebase target by target and check it against the original", long_about = None)]
struct Cli {
    /// Pipeline configuration (default: ./recast.toml when present)
    #[arg(short, long, global = true, env = "RECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of targets processed at once
    #[arg(short = 'j', long, global = true, env = "RECAST_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List targets with their kind, units and exported symbols
    Targets,

    /// Run the full pipeline, repair included
    Run {
        /// Restrict to these targets (repeatable)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Re-run stages whose last run failed even if nothing changed
        #[arg(long)]
        retry_failed: bool,
    },

    /// Translate, build and test without repairing
    Test {
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Fuzz the original executables and add the discovered vectors
    ExpandCorpus {
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Report the persisted state of every target
    Status {
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Remove work directories and stamps; test vectors are never touched
    Clean {
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Render a target's vectors as an assert_cmd test file
    ExportTests {
        /// Target whose corpus is exported
        #[arg(short, long)]
        target: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    recast_core::init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let config = load_config(cli.config.as_deref(), cli.concurrency)?;
    match cli.command {
        Commands::Targets => cmd_targets(&config).await,
        Commands::Run {
            targets,
            retry_failed,
        } => cmd_run(config, &targets, BuiltinStage::Repair, retry_failed).await,
        Commands::Test { targets } => cmd_run(config, &targets, BuiltinStage::Test, false).await,
        Commands::ExpandCorpus { targets } => {
            if !config.fuzz.enabled {
                bail!("fuzzing is disabled; set `fuzz.enabled = true` in the configuration");
            }
            cmd_run(config, &targets, BuiltinStage::ExpandCorpus, false).await
        }
        Commands::Status { targets } => cmd_status(config, &targets).await,
        Commands::Clean { targets } => cmd_clean(config, &targets).await,
        Commands::ExportTests { target, out } => cmd_export_tests(&config, &target, out.as_deref()).await,
    }
}

/// The configuration file, if any, with command-line overrides applied.
fn load_config(path: Option<&Path>, concurrency: Option<usize>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("load config {:?}", path))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            PipelineConfig::load(Path::new(DEFAULT_CONFIG)).context("load recast.toml")?
        }
        None => PipelineConfig::default(),
    };
    if let Some(n) = concurrency {
        config.concurrency = n;
    }
    config.validate()?;
    Ok(config)
}

/// All targets, or the named ones in the order given.
async fn select_targets(config: &PipelineConfig, names: &[String]) -> Result<Vec<Target>> {
    let all = load_targets(config).await?;
    if names.is_empty() {
        return Ok(all);
    }
    names
        .iter()
        .map(|name| {
            all.iter()
                .find(|t| &t.name == name)
                .cloned()
                .ok_or_else(|| RecastError::UnknownTarget(name.clone()).into())
        })
        .collect()
}

async fn cmd_targets(config: &PipelineConfig) -> Result<()> {
    let targets = load_targets(config).await?;
    if targets.is_empty() {
        println!("No targets found in {:?}", config.compile_commands);
        return Ok(());
    }
    for t in &targets {
        println!(
            "{:<24} {:<4} units: {:<3} symbols: {:<4} {}",
            t.name,
            t.kind,
            t.units.len(),
            t.exported_symbols.len(),
            t.original
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

async fn cmd_run(config: PipelineConfig, names: &[String], last: BuiltinStage, retry_failed: bool) -> Result<()> {
    let targets = select_targets(&config, names).await?;
    let services = Services::from_config(&config);
    if services.translator.is_none() {
        bail!("no translator configured; set `translator` in the configuration");
    }

    let work_root = config.work_root.clone();
    let orchestrator = Orchestrator::new(config, services).with_retry_failed(retry_failed);
    let report = orchestrator.run(targets, last).await;
    report.write(&work_root)?;
    print_report(&report);
    info!(report = %work_root.join("report.json").display(), "report written");
    Ok(())
}

async fn cmd_status(config: PipelineConfig, names: &[String]) -> Result<()> {
    let targets = select_targets(&config, names).await?;
    let work_root = config.work_root.clone();
    let report = Orchestrator::new(config, Services::default()).status(&targets);
    report.write(&work_root)?;
    print_report(&report);
    Ok(())
}

async fn cmd_clean(config: PipelineConfig, names: &[String]) -> Result<()> {
    let targets = select_targets(&config, names).await?;
    let orchestrator = Orchestrator::new(config, Services::default());
    orchestrator.forget(&targets)?;
    for target in &targets {
        let workdir = WorkDir::for_target(&orchestrator.config().work_root, target);
        if workdir.root().exists() {
            std::fs::remove_dir_all(workdir.root())
                .with_context(|| format!("remove {:?}", workdir.root()))?;
        }
        println!("Cleaned {}", target.name);
    }
    Ok(())
}

async fn cmd_export_tests(config: &PipelineConfig, name: &str, out: Option<&Path>) -> Result<()> {
    let targets = select_targets(config, &[name.to_string()]).await?;
    let Some(target) = targets.first() else {
        bail!("unknown target: {name}");
    };
    let vectors = VectorStore::open(config.vectors_for(&target.name))?.load_all()?;
    let rendered = render_rust_tests(&target.crate_name(), &vectors);
    match out {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("write {:?}", path))?;
            println!("Exported {} vectors to {:?}", vectors.len(), path);
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for t in &report.targets {
        println!(
            "{:<9} {:<24} tests {}/{}  repairs {}",
            t.status.as_str(),
            t.target,
            t.passed,
            t.total,
            t.repair_attempts
        );
        if let Some(error) = &t.error {
            println!("          error: {error}");
        }
    }
    let c = &report.counts;
    println!(
        "\n{} complete, {} partial, {} failed, {} missing",
        c.complete, c.partial, c.failed, c.missing
    );
}
