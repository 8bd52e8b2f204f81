use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Utc};
use tracing::{error, Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `[2026-03-02 03:00:05] [INFO] message key=value`, timestamp in the
/// schedule's offset.
pub struct BracketedLine {
    offset: FixedOffset,
}

impl BracketedLine {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl<S, N> FormatEvent<S, N> for BracketedLine
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = Utc::now().with_timezone(&self.offset);
        write!(
            writer,
            "[{}] [{}] ",
            now.format("%Y-%m-%d %H:%M:%S"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

/// Console plus append-only file logging. `RUST_LOG` overrides the default
/// `info` level for both.
pub fn init(log_file: &Path, offset: FixedOffset) -> Result<()> {
    let file = open_log_file(log_file)?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .event_format(BracketedLine::new(offset))
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

/// Panics anywhere are fatal: log and exit with status 1.
pub fn install_fatal_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("FATAL: {info}");
        eprintln!("FATAL: {info}");
        std::process::exit(1);
    }));
}
