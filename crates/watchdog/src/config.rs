//! Configuration for the `watchdog` command.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Args;

use crate::{policy::RestartPolicy, process::CommandSpec};

pub const DEFAULT_SCRIPT_PATH: &str = "./run_integrated_detection_system.sh";
/// Flag appended to the supervised command unless `--no-camera-only` is set.
pub const CAMERA_ONLY_FLAG: &str = "--camera-only";

#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// Absolute path of the supervised script.
    pub script_path: PathBuf,
    pub command: CommandSpec,
    pub policy: RestartPolicy,
    pub test_mode: bool,
    /// Directory receiving a timestamped copy of the log, if any.
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI arguments accepted by the `watchdog` subcommand.
#[derive(Debug, Args)]
pub struct WatchdogCliArgs {
    /// Script or program to keep running.
    #[arg(short = 's', long = "script-path", default_value = DEFAULT_SCRIPT_PATH)]
    pub script_path: PathBuf,
    /// Do not pass `--camera-only` to the supervised program.
    #[arg(long = "no-camera-only", action = clap::ArgAction::SetTrue)]
    pub no_camera_only: bool,
    /// Seconds to wait between restarts.
    #[arg(short = 'd', long = "restart-delay", default_value_t = 5)]
    pub restart_delay: u64,
    /// Maximum number of starts (unlimited when omitted).
    #[arg(short = 'm', long = "max-restarts")]
    pub max_restarts: Option<u32>,
    /// Run once without restarting.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub test: bool,
    /// Also write the log to a timestamped file in this directory.
    #[arg(long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
    /// Extra arguments passed through to the supervised program.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

impl TryFrom<WatchdogCliArgs> for WatchdogConfig {
    type Error = anyhow::Error;

    fn try_from(args: WatchdogCliArgs) -> Result<Self> {
        if !args.script_path.exists() {
            bail!("Script not found: {}", args.script_path.display());
        }
        let script_path = args
            .script_path
            .canonicalize()
            .with_context(|| format!("resolving {}", args.script_path.display()))?;

        let mut command = CommandSpec::new(&script_path);
        if !args.no_camera_only {
            command = command.arg(CAMERA_ONLY_FLAG);
        }
        command = command.args(args.extra_args);

        let max_restarts = if args.test { Some(1) } else { args.max_restarts };

        Ok(Self {
            script_path,
            command,
            policy: RestartPolicy::new(Duration::from_secs(args.restart_delay), max_restarts),
            test_mode: args.test,
            log_dir: args.log_dir,
            metrics_addr: args.metrics_addr,
        })
    }
}

/// Set the script's mode to 0o755. Failure is logged, not fatal.
#[cfg(unix)]
pub fn make_executable(path: &Path) {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tracing::warn;

    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
        warn!("Could not make {} executable: {err}", path.display());
    }
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) {}
