//! Watchdog supervision for the detection program.
//!
//! [`ProcessSupervisor`] keeps one external program running: it starts the
//! program, relays its output, restarts it after a delay when it exits (up to
//! the [`RestartPolicy`] cap) and stops it gracefully, escalating to a kill,
//! when [`Shutdown`] is triggered.

pub mod config;
pub mod policy;
pub mod process;
pub mod shutdown;
pub mod supervisor;

pub use config::{WatchdogCliArgs, WatchdogConfig, make_executable};
pub use policy::RestartPolicy;
pub use process::{ChildExit, ChildHandle, CommandSpec, OsChild, OsLauncher, ProcessLauncher};
pub use shutdown::Shutdown;
pub use supervisor::{
    ProcessState, ProcessSupervisor, StopReason, SupervisedProcess, SupervisorError,
};
