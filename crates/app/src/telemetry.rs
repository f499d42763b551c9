//! Tracing subscriber and Prometheus exporter setup.

use std::{
    fs::{self, File},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber: env-filtered console output, an optional
/// plain-text copy written to `log_file`, and the span-trace error layer.
pub(crate) fn init_tracing(log_file: Option<&File>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = log_file
        .map(File::try_clone)
        .transpose()
        .context("duplicating log file handle")?
        .map(|file| {
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("installing tracing subscriber")
}

/// Create `<dir>/watchdog_YYYYmmdd_HHMMSS.log`, creating `dir` if needed.
pub(crate) fn create_log_file(dir: &Path) -> Result<(PathBuf, File)> {
    fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    let path = dir.join(log_file_name(chrono::Local::now()));
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    Ok((path, file))
}

fn log_file_name<Tz>(now: chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("watchdog_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Serve Prometheus metrics on `addr`. Without an address metrics calls are no-ops.
pub(crate) fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("starting Prometheus exporter on {addr}"))?;
    info!("Prometheus metrics available at http://{addr}/metrics");
    Ok(())
}
