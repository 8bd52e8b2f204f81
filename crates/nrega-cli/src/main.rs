use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Offset, Utc};
use clap::{Parser, Subcommand};
use nrega_adapters::{DataGovSource, FixtureSource, UpstreamConfig, UpstreamSource};
use nrega_storage::{AggregationMode, DatabaseConfig, PgStore, PipelineStore};
use nrega_sync::{
    shutdown_signal, ChildProcessRunner, Daemon, IngestPath, IngestionPipeline, RunSummary,
    ScheduleConfig, SyncConfig,
};
use tracing::{error, info};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "nrega")]
#[command(about = "MGNREGA district performance ingestion pipeline")]
struct Cli {
    /// Log file receiving `[timestamp] [LEVEL] message` lines.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Daily incremental pass (default).
    Ingest {
        /// Replay recorded upstream pages instead of calling the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Full re-sync: replace on conflict, rebuild derived tables at the end.
    Resync {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Recompute derived tables from the raw table.
    Aggregate {
        #[arg(long)]
        full: bool,
    },
    /// Run the daily scheduler until SIGINT/SIGTERM.
    Daemon,
    /// Serve the manual trigger endpoint.
    Serve,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let schedule = ScheduleConfig::from_env();
    let offset = schedule
        .as_ref()
        .map(|config| config.schedule.utc_offset())
        .unwrap_or_else(|_| Utc.fix());
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| std::env::var("NREGA_LOG_FILE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./logs/cron.log"));
    logging::init(&log_file, offset)?;
    logging::install_fatal_panic_hook();

    let result = match cli.command.unwrap_or(Commands::Ingest { fixture: None }) {
        Commands::Ingest { fixture } => run_pass(IngestPath::Incremental, fixture).await,
        Commands::Resync { fixture } => run_pass(IngestPath::FullResync, fixture).await,
        Commands::Aggregate { full } => aggregate(full).await,
        Commands::Daemon => match schedule {
            Ok(config) => run_daemon(config, &log_file).await,
            Err(err) => Err(err).context("reading schedule configuration"),
        },
        Commands::Serve => nrega_web::serve_from_env().await,
        Commands::Migrate => migrate().await,
    };

    if let Err(err) = &result {
        error!("FATAL: {err:#}");
    }
    result
}

async fn connect() -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&DatabaseConfig::from_env())
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn run_pass(path: IngestPath, fixture: Option<PathBuf>) -> Result<()> {
    let source: Arc<dyn UpstreamSource> = match fixture {
        Some(fixture_path) => Arc::new(FixtureSource::load(fixture_path)?),
        None => Arc::new(DataGovSource::new(&UpstreamConfig::from_env())?),
    };
    let store = connect().await?;
    let pipeline = IngestionPipeline::new(store.clone(), source, SyncConfig::from_env());

    let result = pipeline.run(path).await;
    store.close().await;
    let summary = result?;
    print_summary(&summary);
    if !summary.succeeded() {
        bail!(
            "ingestion aborted after {} consecutive failed page fetches",
            summary.failed_pages
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "ingestion {:?}: run_id={} pages={} received={} inserted={} updated={} skipped={} malformed={}",
        summary.state,
        summary.run_id,
        summary.pages_fetched,
        summary.records_received,
        summary.rows_inserted,
        summary.rows_updated,
        summary.rows_skipped,
        summary.malformed_records
    );
    println!(
        "tables: mgnrega_data={} district_monthly_performance={} state_monthly_averages={}",
        summary.table_counts.raw_rows,
        summary.table_counts.district_rows,
        summary.table_counts.state_rows
    );
}

async fn aggregate(full: bool) -> Result<()> {
    let mode = if full {
        AggregationMode::Full
    } else {
        AggregationMode::Incremental
    };
    let store = connect().await?;
    let result = store.aggregate(mode).await;
    store.close().await;
    let summary = result.context("aggregating derived tables")?;
    println!(
        "aggregation {:?}: district rows={} state rows={} latest rows={}",
        summary.mode, summary.district_rows, summary.state_rows, summary.latest_rows
    );
    Ok(())
}

async fn run_daemon(config: ScheduleConfig, log_file: &Path) -> Result<()> {
    let args = vec![
        "--log-file".to_string(),
        log_file.display().to_string(),
        "ingest".to_string(),
    ];
    let runner = ChildProcessRunner::current_exe(args).context("locating current executable")?;
    info!(state_file = %config.state_file.display(), "starting scheduler daemon");
    let daemon = Daemon::new(&config, Arc::new(runner));
    daemon.run_until_shutdown(shutdown_signal()).await;
    Ok(())
}

async fn migrate() -> Result<()> {
    let store = connect().await?;
    let result = store.migrate().await;
    store.close().await;
    result.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}
