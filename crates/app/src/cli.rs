use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use vision::{DetectCliArgs, DetectConfig, ListenCliArgs, TelemetryListener};
use watchdog::{
    ProcessSupervisor, Shutdown, StopReason, WatchdogCliArgs, WatchdogConfig, make_executable,
};

use crate::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "proximity-guard",
    version,
    about = "Sound and telemetry alerts when road users appear on camera"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the detection loop against a camera.
    Detect(DetectCliArgs),
    /// Keep the detection program running, restarting it when it exits.
    Watchdog(WatchdogCliArgs),
    /// Print danger levels received from a detection instance.
    Listen(ListenCliArgs),
}

pub fn handle_command(command: Command) -> Result<()> {
    match command {
        Command::Detect(args) => run_detect(args),
        Command::Watchdog(args) => run_watchdog(args),
        Command::Listen(args) => run_listen(args),
    }
}

fn run_detect(args: DetectCliArgs) -> Result<()> {
    telemetry::init_tracing(None)?;
    let config = DetectConfig::try_from(args)?;
    telemetry::init_metrics(config.metrics_addr)?;
    let shutdown = install_shutdown_handler();
    vision::run(config, shutdown.flag())
}

fn run_watchdog(args: WatchdogCliArgs) -> Result<()> {
    let log_file = args
        .log_dir
        .as_deref()
        .map(telemetry::create_log_file)
        .transpose()?;
    telemetry::init_tracing(log_file.as_ref().map(|(_, file)| file))?;
    if let Some((path, _)) = &log_file {
        info!("Logging to {}", path.display());
    }

    let config = WatchdogConfig::try_from(args)?;
    telemetry::init_metrics(config.metrics_addr)?;
    make_executable(&config.script_path);

    info!("Script: {}", config.script_path.display());
    info!("Command: {}", config.command);
    info!("Restart delay: {}s", config.policy.restart_delay.as_secs());
    match config.policy.max_restarts {
        Some(max) => info!("Max restarts: {max}"),
        None => info!("Max restarts: unlimited"),
    }
    if config.test_mode {
        info!("Test mode: the program will not be restarted");
    }

    let shutdown = install_shutdown_handler();
    let mut supervisor = ProcessSupervisor::new(config.command, config.policy, shutdown);
    match supervisor.run() {
        StopReason::ShutdownRequested => info!("Watchdog stopped on request"),
        StopReason::RestartLimitReached => warn!(
            "Watchdog gave up after {} starts",
            supervisor.process().restart_count
        ),
    }
    Ok(())
}

fn run_listen(args: ListenCliArgs) -> Result<()> {
    telemetry::init_tracing(None)?;
    let addr = args.addr();
    let listener =
        TelemetryListener::bind(addr).with_context(|| format!("binding telemetry socket {addr}"))?;
    info!("Listening for telemetry on {}", listener.local_addr()?);

    let shutdown = install_shutdown_handler();
    listener.run(&shutdown.flag())?;
    info!("Listener stopped");
    Ok(())
}

/// Route Ctrl+C and SIGTERM into a shared shutdown token.
fn install_shutdown_handler() -> Shutdown {
    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handler_shutdown.trigger();
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }
    shutdown
}
