//! Ingestion orchestration: the paginated incremental and full-resync runs,
//! plus the daily scheduler daemon in [`scheduler`].

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nrega_adapters::{UpstreamPage, UpstreamSource};
use nrega_core::ConflictPolicy;
use nrega_storage::{
    env_parse, ingest_records, AggregationMode, IngestOutcome, PipelineStore, TableCounts,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod scheduler;

pub use scheduler::{
    describe_wait, shutdown_signal, ChildProcessRunner, Daemon, DaemonState, IngestionRunner,
    Schedule, ScheduleConfig, SchedulerError,
};

pub const CRATE_NAME: &str = "nrega-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: usize,
    pub max_consecutive_failures: usize,
    pub empty_page_streak: usize,
    /// Conflict policy of the incremental path; the full resync always
    /// replaces.
    pub daily_policy: ConflictPolicy,
    pub progress_every_pages: usize,
    pub progress_insert_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: nrega_adapters::DEFAULT_PAGE_SIZE,
            max_consecutive_failures: 5,
            empty_page_streak: 2,
            daily_policy: ConflictPolicy::Skip,
            progress_every_pages: 10,
            progress_insert_threshold: 100,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let daily_policy = match std::env::var("NREGA_DAILY_CONFLICT_POLICY") {
            Ok(raw) => ConflictPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown NREGA_DAILY_CONFLICT_POLICY; using skip");
                ConflictPolicy::Skip
            }),
            Err(_) => defaults.daily_policy,
        };
        Self {
            page_size: env_parse("NREGA_PAGE_SIZE")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.page_size),
            max_consecutive_failures: env_parse("NREGA_MAX_CONSECUTIVE_FAILURES")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.max_consecutive_failures),
            empty_page_streak: env_parse("NREGA_EMPTY_PAGE_STREAK")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.empty_page_streak),
            daily_policy,
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPath {
    /// Path A: conflict policy from config, per-page incremental aggregation,
    /// fast-forward over pages that changed nothing.
    Incremental,
    /// Path B: replace on conflict, stop at the first failed fetch, one full
    /// rebuild at the end.
    FullResync,
}

impl IngestPath {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incremental" | "daily" => Some(Self::Incremental),
            "full" | "resync" | "full_resync" => Some(Self::FullResync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Done,
    Aborted,
}

/// States of one run. `Done` and `Aborted` are terminal.
#[derive(Debug)]
enum RunState {
    Fetching,
    Ingesting(UpstreamPage),
    Aggregating { last_page: bool },
    Finished(TerminalState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub path: IngestPath,
    pub state: TerminalState,
    pub pages_fetched: usize,
    pub empty_pages: usize,
    pub failed_pages: usize,
    pub records_received: usize,
    pub malformed_records: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_skipped: usize,
    pub aggregation_runs: usize,
    pub derived_rows_touched: usize,
    pub table_counts: TableCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn started(path: IngestPath) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            path,
            state: TerminalState::Done,
            pages_fetched: 0,
            empty_pages: 0,
            failed_pages: 0,
            records_received: 0,
            malformed_records: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_skipped: 0,
            aggregation_runs: 0,
            derived_rows_touched: 0,
            table_counts: TableCounts::default(),
            started_at: now,
            finished_at: now,
        }
    }

    fn absorb(&mut self, outcome: &IngestOutcome, page_malformed: usize) {
        self.records_received += outcome.received + page_malformed;
        self.malformed_records += outcome.malformed + page_malformed;
        self.rows_inserted += outcome.inserted;
        self.rows_updated += outcome.updated;
        self.rows_skipped += outcome.skipped;
    }

    pub fn succeeded(&self) -> bool {
        self.state == TerminalState::Done
    }
}

/// One upstream source feeding one store, page by page. Pages are strictly
/// sequential; each store call is its own transaction.
pub struct IngestionPipeline {
    store: Arc<dyn PipelineStore>,
    source: Arc<dyn UpstreamSource>,
    config: SyncConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        source: Arc<dyn UpstreamSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub async fn run_incremental(&self) -> Result<RunSummary> {
        self.run(IngestPath::Incremental).await
    }

    pub async fn run_full_resync(&self) -> Result<RunSummary> {
        self.run(IngestPath::FullResync).await
    }

    /// Runs one pass to a terminal state. Upstream failures are absorbed by
    /// the state machine; store failures end the run with an error.
    pub async fn run(&self, path: IngestPath) -> Result<RunSummary> {
        let summary = RunSummary::started(path);
        let span = info_span!("ingestion_run", run_id = %summary.run_id, ?path, source = self.source.source_id());
        self.drive(summary).instrument(span).await
    }

    async fn drive(&self, mut summary: RunSummary) -> Result<RunSummary> {
        let path = summary.path;
        let policy = match path {
            IngestPath::Incremental => self.config.daily_policy,
            IngestPath::FullResync => ConflictPolicy::Replace,
        };
        let page_size = self.config.page_size.max(1);
        info!(page_size, ?policy, "ingestion run started");

        let mut offset = 0usize;
        let mut empty_streak = 0usize;
        let mut failure_streak = 0usize;
        let mut state = RunState::Fetching;

        let terminal = loop {
            state = match state {
                RunState::Fetching => {
                    summary.pages_fetched += 1;
                    match self.source.fetch_page(offset, page_size).await {
                        Ok(page) if page.is_empty() => {
                            failure_streak = 0;
                            empty_streak += 1;
                            summary.empty_pages += 1;
                            warn!(offset, empty_streak, limit = self.config.empty_page_streak, "empty page");
                            offset += page_size;
                            if empty_streak >= self.config.empty_page_streak {
                                info!("upstream has no more data");
                                RunState::Finished(TerminalState::Done)
                            } else {
                                RunState::Fetching
                            }
                        }
                        Ok(page) => {
                            failure_streak = 0;
                            empty_streak = 0;
                            RunState::Ingesting(page)
                        }
                        Err(err) => {
                            failure_streak += 1;
                            summary.failed_pages += 1;
                            warn!(offset, error = %err, failure_streak, "page fetch failed; skipping to next offset");
                            offset += page_size;
                            if path == IngestPath::FullResync {
                                error!("page fetch failed during full resync; aborting run");
                                RunState::Finished(TerminalState::Aborted)
                            } else if failure_streak >= self.config.max_consecutive_failures {
                                error!(failure_streak, "too many consecutive failures; aborting run");
                                RunState::Finished(TerminalState::Aborted)
                            } else {
                                RunState::Fetching
                            }
                        }
                    }
                }
                RunState::Ingesting(page) => {
                    let last_page = page.entries() < page_size;
                    let outcome = ingest_records(self.store.as_ref(), &page.records, policy)
                        .await
                        .with_context(|| format!("storing page at offset {offset}"))?;
                    summary.absorb(&outcome, page.malformed);
                    info!(
                        offset,
                        received = page.entries(),
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        skipped = outcome.skipped,
                        "page stored"
                    );
                    offset += page_size;

                    if path == IngestPath::Incremental && outcome.changed_rows() > 0 {
                        self.log_progress(&summary, outcome.inserted);
                        RunState::Aggregating { last_page }
                    } else {
                        if path == IngestPath::Incremental {
                            info!(offset, "fast-forward: page changed nothing");
                        }
                        self.log_progress(&summary, outcome.inserted);
                        Self::after_page(last_page)
                    }
                }
                RunState::Aggregating { last_page } => {
                    let aggregation = self
                        .store
                        .aggregate(AggregationMode::Incremental)
                        .await
                        .context("incremental aggregation")?;
                    summary.aggregation_runs += 1;
                    summary.derived_rows_touched += aggregation.district_rows;
                    info!(district_rows = aggregation.district_rows, state_rows = aggregation.state_rows, "derived rows updated");
                    Self::after_page(last_page)
                }
                RunState::Finished(terminal) => break terminal,
            };
        };
        summary.state = terminal;

        if path == IngestPath::FullResync {
            // Committed pages stay committed on abort, so the rebuild runs either way.
            let aggregation = self
                .store
                .aggregate(AggregationMode::Full)
                .await
                .context("full aggregation rebuild")?;
            summary.aggregation_runs += 1;
            summary.derived_rows_touched += aggregation.district_rows;
        }

        summary.table_counts = self.store.table_counts().await.context("reading table counts")?;
        summary.finished_at = Utc::now();
        info!(
            state = ?summary.state,
            pages = summary.pages_fetched,
            received = summary.records_received,
            inserted = summary.rows_inserted,
            updated = summary.rows_updated,
            skipped = summary.rows_skipped,
            malformed = summary.malformed_records,
            raw_rows = summary.table_counts.raw_rows,
            district_rows = summary.table_counts.district_rows,
            state_rows = summary.table_counts.state_rows,
            "ingestion run finished"
        );
        Ok(summary)
    }

    fn after_page(last_page: bool) -> RunState {
        if last_page {
            info!("short page received; upstream exhausted");
            RunState::Finished(TerminalState::Done)
        } else {
            RunState::Fetching
        }
    }

    fn log_progress(&self, summary: &RunSummary, inserted: usize) {
        let every = self.config.progress_every_pages.max(1);
        if summary.pages_fetched % every == 0 || inserted > self.config.progress_insert_threshold {
            info!(
                pages = summary.pages_fetched,
                received = summary.records_received,
                inserted = summary.rows_inserted,
                derived = summary.derived_rows_touched,
                "progress"
            );
        }
    }
}
