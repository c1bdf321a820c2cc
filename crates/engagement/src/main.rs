//! Engagement pipeline CLI.
//!
//! `engagement run` syncs survey responses, codes them and builds analysis
//! datasets. Each stage can also be run on its own and re-run safely.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engagement::adapters::{CsvExportSink, FileCodingTool, JsonSurveySource, PrefixedUuidResolver};
use engagement::output;
use engagement::{Collaborators, LoadedConfig, Pipeline};
use engagement_analysis::ExportSink;
use engagement_config::{ConfigError, PipelineConfig};
use engagement_logging::{init_logging, LogConfig};
use engagement_protocol::defaults::CANCELLED_BY_USER_MESSAGE;
use engagement_protocol::CancellationToken;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_PARTICIPANT_PREFIX: &str = "avf-participant-uuid-";

#[derive(Parser, Debug)]
#[command(name = "engagement", about = "Sync, code and analyse engagement survey responses")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = "ENGAGEMENT_CONFIG", default_value = "pipeline.toml")]
    config: PathBuf,

    /// Mirror debug logging to stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Write log files here instead of the pipeline home
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Print stage reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load code schemes and validate the configuration
    Validate,

    /// Sync survey responses into the engagement store
    Sync {
        /// Survey platform export (JSON, responses keyed by flow name)
        #[arg(long)]
        responses: PathBuf,

        /// Prefix for de-identified participant uuids
        #[arg(long, default_value = DEFAULT_PARTICIPANT_PREFIX)]
        participant_prefix: String,
    },

    /// Apply manual labels, auto-code and push messages needing review
    Code {
        /// Coding tool directory (one sub-directory per coding dataset)
        #[arg(long)]
        coding_dir: PathBuf,
    },

    /// Build analysis datasets
    Analyse {
        /// Export CSV files into this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Sync, code and analyse in one go
    Run {
        #[arg(long)]
        responses: PathBuf,

        #[arg(long)]
        coding_dir: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_PARTICIPANT_PREFIX)]
        participant_prefix: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = PipelineConfig::load(&cli.config);
    let app_name = config
        .as_ref()
        .map(|c| c.pipeline_name.clone())
        .unwrap_or_else(|_| "engagement".to_string());
    match init_logging(LogConfig {
        app_name: &app_name,
        verbose: cli.verbose,
        log_dir: cli.log_dir.clone(),
    }) {
        Ok(path) => debug!(log = %path.display(), "Logging initialised"),
        Err(err) => eprintln!("Warning: {:#}", err),
    }

    let result = config
        .map_err(anyhow::Error::from)
        .and_then(|config| {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start tokio runtime")?;
            runtime.block_on(run_command(cli, config))
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ConfigError>() {
                Some(config_err) if !config_err.issues().is_empty() => {
                    eprintln!("Invalid pipeline configuration:");
                    eprintln!("{}", output::issues_table(config_err.issues()));
                }
                _ => eprintln!("Error: {:?}", err),
            }
            ExitCode::from(1)
        }
    }
}

async fn run_command(cli: Cli, config: PipelineConfig) -> Result<()> {
    let loaded = LoadedConfig::validate(config)?;

    match cli.command {
        Commands::Validate => {
            let config = &loaded.config;
            println!(
                "{}: OK ({} code schemes, {} flows, {} coding datasets, {} analysis datasets)",
                config.pipeline_name(),
                loaded.registry.len(),
                config.flow_names().len(),
                config.coding_datasets().len(),
                config.analysis_datasets().len()
            );
            Ok(())
        }
        Commands::Sync {
            responses,
            participant_prefix,
        } => {
            let source = Arc::new(JsonSurveySource::load(&responses)?);
            let resolver = Arc::new(PrefixedUuidResolver::new(participant_prefix));
            let pipeline = Pipeline::open(loaded).await?;
            let cancel = cancel_on_ctrl_c();
            let report = pipeline.sync(source, resolver, &cancel).await?;
            print_report(cli.json, &report, output::print_sync_report)
        }
        Commands::Code { coding_dir } => {
            let tool = Arc::new(FileCodingTool::new(coding_dir));
            let pipeline = Pipeline::open(loaded).await?;
            let cancel = cancel_on_ctrl_c();
            let report = pipeline.code(tool, &cancel).await?;
            print_report(cli.json, &report, output::print_coding_report)
        }
        Commands::Analyse { output: dir } => {
            let sink = dir.map(CsvExportSink::new);
            let pipeline = Pipeline::open(loaded).await?;
            let cancel = cancel_on_ctrl_c();
            let built = pipeline
                .analyse(sink.as_ref().map(|s| s as &dyn ExportSink), &cancel)
                .await?;
            print_report(cli.json, &built.report, output::print_analysis_report)
        }
        Commands::Run {
            responses,
            coding_dir,
            output: dir,
            participant_prefix,
        } => {
            let sink = dir.map(CsvExportSink::new);
            let collaborators = Collaborators {
                source: Arc::new(JsonSurveySource::load(&responses)?),
                resolver: Arc::new(PrefixedUuidResolver::new(participant_prefix)),
                coding_tool: Arc::new(FileCodingTool::new(coding_dir)),
                sink: sink.as_ref().map(|s| s as &dyn ExportSink),
            };
            let pipeline = Pipeline::open(loaded).await?;
            let cancel = cancel_on_ctrl_c();
            let report = pipeline.run(collaborators, &cancel).await?;

            if cli.json {
                let body = serde_json::json!({
                    "run_id": report.run_id,
                    "sync": report.sync,
                    "coding": report.coding,
                    "analysis": report.analysis.report,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                output::print_sync_report(&report.sync);
                output::print_coding_report(&report.coding);
                output::print_analysis_report(&report.analysis.report);
            }
            Ok(())
        }
    }
}

fn print_report<T: Serialize>(json: bool, report: &T, print: fn(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print(report);
    }
    Ok(())
}

/// Token cancelled on the first Ctrl-C. Stages stop between messages.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("{}; stopping after the current message", CANCELLED_BY_USER_MESSAGE);
            handle.cancel();
        }
    });
    cancel
}
