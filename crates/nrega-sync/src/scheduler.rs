//! Daily scheduler daemon.
//!
//! The daemon cycles `Idle(next) -> Running -> Idle(next')`. The next fire
//! time is computed only after the previous run has returned, so runs never
//! overlap.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, FixedOffset, NaiveTime, TimeZone, Utc};
use nrega_storage::{env_parse, LastRunState, StateFile};
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },
    #[error("invalid utc offset of {0} minutes")]
    InvalidOffset(i32),
    #[error("failed to start ingestion process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("ingestion process exited with {0}")]
    ChildFailed(ExitStatus),
    #[error("ingestion run failed: {0}")]
    Run(String),
}

/// Fixed wall-clock time in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    at: NaiveTime,
    utc_offset: FixedOffset,
}

impl Schedule {
    pub fn new(hour: u32, minute: u32, utc_offset_minutes: i32) -> Result<Self, SchedulerError> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or(SchedulerError::InvalidTime { hour, minute })?;
        let utc_offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or(SchedulerError::InvalidOffset(utc_offset_minutes))?;
        Ok(Self { at, utc_offset })
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// First occurrence of the configured time strictly after `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_today = now.with_timezone(&self.utc_offset).date_naive();
        let offset = TimeDelta::seconds(i64::from(self.utc_offset.local_minus_utc()));
        let candidate = Utc.from_utc_datetime(&(local_today.and_time(self.at) - offset));
        if candidate > now {
            candidate
        } else {
            candidate + TimeDelta::days(1)
        }
    }
}

/// `"next run at 2026-03-02 03:00:00 +05:30 (in 7 hours and 12 minutes)"`.
pub fn describe_wait(now: DateTime<Utc>, next: DateTime<Utc>, offset: FixedOffset) -> String {
    let minutes = (next - now).num_minutes().max(0);
    format!(
        "next run at {} (in {} hours and {} minutes)",
        next.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S %:z"),
        minutes / 60,
        minutes % 60
    )
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub schedule: Schedule,
    pub state_file: PathBuf,
    pub catch_up_after: TimeDelta,
}

impl ScheduleConfig {
    pub fn from_env() -> Result<Self, SchedulerError> {
        let hour = env_parse("NREGA_SCHEDULE_HOUR").unwrap_or(3);
        let minute = env_parse("NREGA_SCHEDULE_MINUTE").unwrap_or(0);
        let offset = env_parse("NREGA_SCHEDULE_UTC_OFFSET_MINUTES").unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);
        Ok(Self {
            schedule: Schedule::new(hour, minute, offset)?,
            state_file: std::env::var("NREGA_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs/last-run.json")),
            catch_up_after: TimeDelta::hours(24),
        })
    }
}

/// One ingestion pass as seen by the daemon.
#[async_trait]
pub trait IngestionRunner: Send + Sync {
    async fn run_ingestion(&self) -> Result<(), SchedulerError>;
}

/// Runs ingestion in a child process and waits for its exit status.
#[derive(Debug, Clone)]
pub struct ChildProcessRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildProcessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invokes the running executable with `args`.
    pub fn current_exe(args: Vec<String>) -> Result<Self, SchedulerError> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

#[async_trait]
impl IngestionRunner for ChildProcessRunner {
    async fn run_ingestion(&self) -> Result<(), SchedulerError> {
        info!(program = %self.program.display(), args = ?self.args, "starting ingestion process");
        let status = Command::new(&self.program).args(&self.args).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(SchedulerError::ChildFailed(status))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle { next: DateTime<Utc> },
    Running,
    Stopped,
}

pub struct Daemon {
    schedule: Schedule,
    state_file: StateFile,
    catch_up_after: TimeDelta,
    runner: Arc<dyn IngestionRunner>,
}

impl Daemon {
    pub fn new(config: &ScheduleConfig, runner: Arc<dyn IngestionRunner>) -> Self {
        Self {
            schedule: config.schedule,
            state_file: StateFile::new(config.state_file.clone()),
            catch_up_after: config.catch_up_after,
            runner,
        }
    }

    async fn last_run(&self) -> Option<DateTime<Utc>> {
        match self.state_file.load().await {
            Ok(state) => state.map(|s| s.last_run),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unreadable state file; treating as absent");
                None
            }
        }
    }

    /// Runs one catch-up pass when the last successful run is older than the
    /// catch-up window. No state at all means a first start: nothing runs.
    pub async fn catch_up_if_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run().await {
            Some(last) if now - last > self.catch_up_after => {
                let hours = (now - last).num_hours();
                info!(hours_since_last_run = hours, "last run is stale; running catch-up");
                self.run_and_record().await;
                true
            }
            Some(_) => false,
            None => {
                info!("no previous run recorded; waiting for the schedule");
                false
            }
        }
    }

    /// One supervised run. Failures are logged; only success advances the
    /// persisted last-run time.
    async fn run_and_record(&self) {
        let started = Utc::now();
        match self.runner.run_ingestion().await {
            Ok(()) => {
                let finished = Utc::now();
                info!(elapsed_secs = (finished - started).num_seconds(), "scheduled ingestion succeeded");
                let state = LastRunState { last_run: finished };
                if let Err(err) = self.state_file.save(&state).await {
                    warn!(error = %format!("{err:#}"), path = %self.state_file.path().display(), "could not persist last run");
                }
            }
            Err(err) => error!(error = %err, "scheduled ingestion failed; will retry at next slot"),
        }
    }

    /// Catch-up, then the daily loop, until `shutdown` resolves. A shutdown
    /// that arrives during a run takes effect once the run has returned.
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> DaemonState
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(utc_offset = %self.schedule.utc_offset(), "scheduler daemon started");
        self.catch_up_if_due(Utc::now()).await;

        let mut state = DaemonState::Idle {
            next: self.schedule.next_run(Utc::now()),
        };
        loop {
            state = match state {
                DaemonState::Idle { next } => {
                    let now = Utc::now();
                    info!("{}", describe_wait(now, next, self.schedule.utc_offset()));
                    let wait = (next - now).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => DaemonState::Running,
                        _ = &mut shutdown => DaemonState::Stopped,
                    }
                }
                DaemonState::Running => {
                    self.run_and_record().await;
                    DaemonState::Idle {
                        next: self.schedule.next_run(Utc::now()),
                    }
                }
                DaemonState::Stopped => {
                    info!("shutdown requested; scheduler stopped");
                    return DaemonState::Stopped;
                }
            };
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
