mod config;

pub use config::{CommitFlowConfig, DEFAULT_TRACE_RETENTION, Settings};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::engine::types::RunOptions;
use crate::governor::{Governor, GovernorInput};
use crate::pipeline::fs_adapters::FsAdapters;
use crate::pipeline::publish::WebhookPublisher;
use crate::pipeline::snapshot::SnapshotSource;
use crate::pipeline::{Pipeline, PublishMode};
use crate::storage::json_store::JsonTraceStore;
use crate::storage::lock::{DEFAULT_STALE_AFTER_SECS, RunLock};
use crate::storage::pointer::load_pointer;
use crate::storage::{TraceFilter, TraceStore, record};

#[derive(Parser)]
#[command(
    name = "commitflow",
    version,
    about = "State-machine runs with crash-consistent artifact commits"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to commitflow.yaml (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage volume root
    #[arg(long, global = true, env = "COMMITFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Trace store directory (default: <data-dir>/traces)
    #[arg(long, global = true, env = "COMMITFLOW_TRACE_DIR")]
    trace_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rebuild, write and commit the index and score set
    Pipeline {
        /// JSON snapshot file the index is built from
        #[arg(short, long)]
        source: PathBuf,

        /// Publish mode (local, publish)
        #[arg(long)]
        mode: Option<String>,

        /// Webhook notified after a successful commit
        #[arg(long, env = "COMMITFLOW_PUBLISH_URL")]
        publish_url: Option<String>,

        /// Step budget for the run
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// Evaluate a request against the admission gate
    #[command(allow_negative_numbers = true)]
    Govern {
        #[arg(long)]
        safety: f64,
        #[arg(long)]
        regime_alignment: f64,
        #[arg(long)]
        conviction: f64,
        #[arg(long)]
        risk_budget: f64,
        #[arg(long)]
        execution_allowance: f64,
        /// PRIVATE or PUBLIC
        #[arg(long, default_value = "PRIVATE")]
        mode: String,
        /// ACCUMULATION, EXPANSION, DISTRIBUTION or COLLAPSE
        #[arg(long, default_value = "ACCUMULATION")]
        regime: String,
    },

    /// Inspect recorded run traces
    Traces {
        #[command(subcommand)]
        command: TracesCommand,
    },

    /// Show the last-good pointer
    Status {
        /// Recompute artifact checksums
        #[arg(long)]
        verify: bool,
    },

    /// Start the read-only REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
pub enum TracesCommand {
    /// List recent traces, newest first
    List {
        /// Only traces whose specification name starts with this
        #[arg(long)]
        skill: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Print one trace
    Show { trace_id: String },

    /// Delete old traces beyond a per-specification retention count
    Prune {
        #[arg(long, default_value_t = DEFAULT_TRACE_RETENTION)]
        keep: usize,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let settings = CommitFlowConfig::load(cli.config.as_deref())?
        .resolve(cli.data_dir, cli.trace_dir)?;

    match cli.command {
        Commands::Pipeline {
            source,
            mode,
            publish_url,
            max_steps,
        } => cmd_pipeline(settings, source, mode, publish_url, max_steps).await,
        Commands::Govern {
            safety,
            regime_alignment,
            conviction,
            risk_budget,
            execution_allowance,
            mode,
            regime,
        } => {
            let input = GovernorInput {
                safety,
                regime_alignment,
                conviction,
                risk_budget,
                execution_allowance,
                mode: mode.parse()?,
                regime: regime.parse()?,
            };
            cmd_govern(settings, input).await
        }
        Commands::Traces { command } => cmd_traces(settings, command).await,
        Commands::Status { verify } => cmd_status(settings, verify).await,
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.host.clone());
            let port = port.unwrap_or(settings.port);
            crate::api::serve(&host, port, &settings).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (warn if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn cmd_pipeline(
    mut settings: Settings,
    source: PathBuf,
    mode: Option<String>,
    publish_url: Option<String>,
    max_steps: Option<usize>,
) -> Result<()> {
    if let Some(mode) = mode {
        settings.mode = mode.parse()?;
    }
    if let Some(max_steps) = max_steps {
        settings.max_steps = max_steps;
    }
    let publish_url = publish_url.or_else(|| settings.publish_url.clone());

    let _lock = RunLock::acquire(
        &settings.lock_path,
        chrono::Duration::seconds(DEFAULT_STALE_AFTER_SECS),
    )?;

    let mut adapters = FsAdapters::new(Arc::new(SnapshotSource::new(&source)));
    if settings.mode == PublishMode::Publish {
        match publish_url {
            Some(url) => adapters = adapters.with_publisher(Arc::new(WebhookPublisher::new(url))),
            None => warn!("Publish mode without a publish URL; publishing will be skipped"),
        }
    }

    let pipeline = Pipeline::new()?
        .with_options(RunOptions::default().with_max_steps(settings.max_steps));
    let result = pipeline.execute(settings.pipeline_config(), &adapters).await;

    let store = JsonTraceStore::new(&settings.trace_dir);
    let trace_id = record(&store, &result).await;
    prune_quietly(&store, settings.trace_retention).await;

    println!("Pipeline: {} (trace {})", result.spec, trace_id);
    println!("Path:     {}", result.path().join(" → "));
    println!("End:      {} after {} step(s)", result.end, result.steps);
    println!("Entries:  {} indexed, {} scored", result.ctx.index_count, result.ctx.scored_count);
    if let Some(rolled_back) = result.ctx.rolled_back {
        println!("Rollback: {}", if rolled_back { "restored" } else { "nothing restored" });
    }
    for note in &result.ctx.notes {
        println!("  [{:?}] {}", note.stage, note.note);
    }

    if !result.ok {
        anyhow::bail!(
            "Pipeline ended in {}: {}",
            result.end,
            result.note.clone().unwrap_or_else(|| {
                result
                    .ctx
                    .failure
                    .as_ref()
                    .map(|f| f.note.clone())
                    .unwrap_or_default()
            })
        );
    }
    Ok(())
}

async fn cmd_govern(settings: Settings, input: GovernorInput) -> Result<()> {
    let governor = Governor::new()?;
    let result = governor.evaluate(input).await;

    let store = JsonTraceStore::new(&settings.trace_dir);
    let trace_id = record(&store, &result).await;
    prune_quietly(&store, settings.trace_retention).await;

    println!("Governor: {} (trace {})", result.end, trace_id);
    if let Some(composite) = result.ctx.composite {
        println!("Composite: {:.2}", composite);
    }
    if let Some(decision) = result.ctx.decision {
        println!("Decision: {}", decision);
    }
    if let Some(delay) = result.ctx.suggested_delay_secs {
        println!("Retry in: {}s", delay);
    }
    for reason in &result.ctx.reasons {
        println!("  - {}", reason);
    }

    if !result.ok {
        anyhow::bail!(
            "Governor ended in {}: {}",
            result.end,
            result.note.unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_traces(settings: Settings, command: TracesCommand) -> Result<()> {
    let store = JsonTraceStore::new(&settings.trace_dir);

    match command {
        TracesCommand::List {
            skill,
            limit,
            format,
        } => {
            let records = store
                .list(&TraceFilter {
                    skill_prefix: skill,
                    limit,
                })
                .await?;

            if records.is_empty() {
                println!("No traces found.");
                return Ok(());
            }

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }

            println!(
                "{:<34} {:<16} {:<5} {:<16} {:<6} {:<20}",
                "TRACE ID", "SKILL", "OK", "END", "STEPS", "RECORDED"
            );
            println!("{}", "-".repeat(102));
            for r in &records {
                println!(
                    "{:<34} {:<16} {:<5} {:<16} {:<6} {:<20}",
                    r.trace_id,
                    r.skill,
                    r.ok,
                    r.end_state,
                    r.steps,
                    r.ts.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("\nTotal: {} trace(s)", records.len());
        }
        TracesCommand::Show { trace_id } => {
            let record = store
                .get(&trace_id)
                .await?
                .with_context(|| format!("Trace '{}' not found", trace_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        TracesCommand::Prune { keep } => {
            let deleted = store.prune(keep).await?;
            println!("Pruned {} trace(s), keeping {} per skill", deleted, keep);
        }
    }
    Ok(())
}

async fn cmd_status(settings: Settings, verify: bool) -> Result<()> {
    let Some(pointer) = load_pointer(&settings.pointer_path).await? else {
        println!("No last-good pointer at {}", settings.pointer_path.display());
        return Ok(());
    };

    println!("{}", serde_json::to_string_pretty(&pointer)?);
    println!("Age: {}s", pointer.age_secs(Utc::now()));

    if verify {
        let problems = pointer.verify().await;
        if problems.is_empty() {
            println!("Verification: OK");
        } else {
            println!("Verification: FAILED");
            for p in &problems {
                println!("  - {}", p);
            }
            anyhow::bail!("{} artifact problem(s) found", problems.len());
        }
    }
    Ok(())
}

async fn prune_quietly(store: &JsonTraceStore, keep: usize) {
    if let Err(e) = store.prune(keep).await {
        warn!(error = %e, "Trace pruning failed");
    }
}
