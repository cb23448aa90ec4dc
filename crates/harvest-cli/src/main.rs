use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::FetchKind;
use harvest_sync::{orchestrator_from_env, IngestionOrchestrator, RunFilter};

mod telemetry;

/// Shown under every help screen.
const STORE_NOTE: &str = "Records and cache entries live in memory for one invocation. \
Each command starts from the source registry (HARVEST_SOURCES_FILE), so clear-cache, \
warm-cache, sources and stats only reflect work done by that same process.";

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Opportunity ingestion command-line interface")]
#[command(after_help = STORE_NOTE)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over the registered sources.
    Sync(SyncArgs),
    /// Drop every cached entry held by this process.
    #[command(after_help = STORE_NOTE)]
    ClearCache,
    /// Pre-populate this process's source summaries and statistics.
    #[command(after_help = STORE_NOTE)]
    WarmCache,
    /// List registered sources; sync state starts fresh from the registry.
    #[command(after_help = STORE_NOTE)]
    Sources,
    /// Print record statistics for this process (empty without a prior sync).
    #[command(after_help = STORE_NOTE)]
    Stats,
}

#[derive(Debug, Default, clap::Args)]
struct SyncArgs {
    /// Only this source; processed even when not due.
    #[arg(long)]
    source: Option<String>,
    /// Only sources of this kind (api, rss, scrape).
    #[arg(long)]
    kind: Option<FetchKind>,
    /// Ignore cadence and backoff.
    #[arg(long)]
    force_all: bool,
    /// Due once the last success is older than this.
    #[arg(long)]
    max_age_hours: Option<u32>,
    /// Cap on records processed per source.
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dry_run: bool,
}

impl From<SyncArgs> for RunFilter {
    fn from(args: SyncArgs) -> Self {
        RunFilter {
            source_id: args.source,
            kind: args.kind,
            force_all: args.force_all,
            max_age_hours: args.max_age_hours,
            batch_size: args.batch_size,
            dry_run: args.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(telemetry::LogFormat::from_env())?;
    let cli = Cli::parse();
    let orchestrator = orchestrator_from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(&orchestrator, args.into()).await?,
        Commands::ClearCache => {
            orchestrator.clear_cache();
            println!("cache cleared");
        }
        Commands::WarmCache => {
            let entries = orchestrator.warm_cache().await?;
            println!("cache warmed: entries={entries}");
        }
        Commands::Sources => {
            let stats = orchestrator.statistics().await?;
            println!("sources={} healthy={}", stats.sources_total, stats.sources_healthy);
            for summary in orchestrator.source_summaries().await? {
                let source = &summary.source;
                println!(
                    "{:<24} {:<7} active={:<5} status={:?} failures={} records={}",
                    source.source_id,
                    source.kind.as_str(),
                    source.is_active,
                    source.status,
                    source.consecutive_failures,
                    summary.record_count
                );
            }
        }
        Commands::Stats => {
            let stats = orchestrator.statistics().await?;
            println!("{}", serde_json::to_string_pretty(&stats).context("serializing statistics")?);
        }
    }

    Ok(())
}

async fn run_sync(orchestrator: &IngestionOrchestrator, filter: RunFilter) -> Result<()> {
    let report = orchestrator.run_ingestion(filter).await?;
    if report.dry_run {
        println!(
            "dry run: run_id={} planned={}",
            report.run_id,
            report.planned_sources.join(",")
        );
        return Ok(());
    }
    println!(
        "sync complete: run_id={} processed={} skipped={} added={} updated={} unchanged={} removed={} duplicates={} errors={}",
        report.run_id,
        report.sources_processed,
        report.sources_skipped,
        report.added,
        report.updated,
        report.unchanged,
        report.removed,
        report.duplicates,
        report.errors
    );
    for err in &report.source_errors {
        eprintln!("source {} failed ({:?}): {}", err.source_id, err.kind, err.message);
    }
    Ok(())
}
