//! Tracing subscriber setup.
//!
//! Events go to stderr (filtered by `RUST_LOG`, default `info`) and to a
//! daily rolling file under `<home>/logs`. The returned guard flushes the
//! file writer on drop and must outlive the driver.

use crate::config::LparkitOptions;
use lparkit_shared::errors::LparkitResult;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Keeps the non-blocking file writer alive.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber once per process.
///
/// Later calls return an empty guard and leave the first subscriber in place.
pub fn init_logging(options: &LparkitOptions) -> LparkitResult<LogGuard> {
    if INSTALLED.get().is_some() {
        return Ok(LogGuard { _file_guard: None });
    }

    let logs_dir = options.logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "lparkit.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init();

    // Another subscriber may already be installed by the host process.
    if installed.is_err() {
        tracing::debug!("global tracing subscriber already set, keeping it");
    }
    let _ = INSTALLED.set(());

    Ok(LogGuard {
        _file_guard: Some(guard),
    })
}
