//! Stderr logging for the calibration tools.
//!
//! [`init_with_level`] installs a small `log` backend printing
//! `[elapsed LEVEL crate] message`. The level applies to the `pianocal*`
//! crates; records from every other crate are shown from `warn` up so
//! decoder and detector internals stay quiet at `-v`.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt, EnvFilter};

const WORKSPACE_PREFIX: &str = "pianocal";

#[cfg(feature = "tracing")]
const DEFAULT_TRACING_FILTER: &str = "warn,pianocal=info";

struct StderrLogger {
    level: LevelFilter,
    started: Instant,
}

impl StderrLogger {
    fn level_for(&self, target: &str) -> LevelFilter {
        if target.starts_with(WORKSPACE_PREFIX) {
            self.level
        } else {
            self.level.min(LevelFilter::Warn)
        }
    }
}

fn crate_name(target: &str) -> &str {
    target.split("::").next().unwrap_or(target)
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{elapsed:7.3}s {:>5} {}] {}",
            record.level(),
            crate_name(record.target()),
            record.args()
        );
        if record.level() == Level::Error {
            let _ = stderr.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Install the stderr logger. Only the first call has an effect.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = LOGGER.get_or_init(|| StderrLogger {
        level,
        started: Instant::now(),
    });
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber. `RUST_LOG` overrides the default filter,
/// which shows the workspace crates at `info` and everything else at `warn`.
/// Closing spans are reported so instrumented steps log their duration.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_TRACING_FILTER));
    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder
            .with_timer(fmt::time::Uptime::default())
            .finish()
            .try_init()
    };
}
