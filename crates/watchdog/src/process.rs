//! Child process capability used by the supervisor.
//!
//! [`ProcessLauncher`] and [`ChildHandle`] separate supervision policy from
//! the OS calls; [`OsLauncher`] is the real implementation.

use std::{
    fmt,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// Output lines buffered per child between polls; extra lines are dropped.
const OUTPUT_BUFFER_LINES: usize = 256;

/// Program and arguments of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// A running child process owned by the supervisor.
pub trait ChildHandle {
    fn pid(&self) -> u32;
    /// Non-blocking liveness check.
    fn poll_exit(&mut self) -> io::Result<Option<ChildExit>>;
    /// Ask the child to terminate (SIGTERM on unix).
    fn request_graceful_stop(&mut self) -> io::Result<()>;
    /// Kill the child outright.
    fn force_stop(&mut self) -> io::Result<()>;
    /// Block until the child has exited.
    fn wait(&mut self) -> io::Result<ChildExit>;
    /// Output lines produced since the last call.
    fn drain_output(&mut self) -> Vec<String> {
        Vec::new()
    }
}

pub trait ProcessLauncher {
    type Child: ChildHandle;

    fn spawn(&mut self, command: &CommandSpec) -> io::Result<Self::Child>;
}

/// Spawns real OS processes with stdout and stderr relayed line by line.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    type Child = OsChild;

    fn spawn(&mut self, command: &CommandSpec) -> io::Result<OsChild> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = bounded(OUTPUT_BUFFER_LINES);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_relay("watchdog-stdout", stdout, tx.clone())?;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_relay("watchdog-stderr", stderr, tx)?;
        }

        Ok(OsChild { child, output: rx })
    }
}

fn spawn_line_relay<R>(name: &str, stream: R, tx: Sender<String>) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            match tx.try_send(line) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    })?;
    Ok(())
}

pub struct OsChild {
    child: Child,
    output: Receiver<String>,
}

impl ChildHandle for OsChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll_exit(&mut self) -> io::Result<Option<ChildExit>> {
        Ok(self.child.try_wait()?.map(ChildExit::from))
    }

    #[cfg(unix)]
    fn request_graceful_stop(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = libc::pid_t::try_from(self.child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain kill(2) on the pid of a child we have not reaped yet.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn request_graceful_stop(&mut self) -> io::Result<()> {
        self.force_stop()
    }

    fn force_stop(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Err(err) if err.kind() != io::ErrorKind::InvalidInput => Err(err),
            _ => Ok(()),
        }
    }

    fn wait(&mut self) -> io::Result<ChildExit> {
        self.child.wait().map(ChildExit::from)
    }

    fn drain_output(&mut self) -> Vec<String> {
        self.output.try_iter().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").args(["-c", script])
    }

    fn wait_exit(child: &mut OsChild) -> ChildExit {
        let started = Instant::now();
        loop {
            if let Some(exit) = child.poll_exit().unwrap() {
                return exit;
            }
            assert!(started.elapsed() < Duration::from_secs(5), "child did not exit");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn exit_code_and_output_are_captured() {
        let mut child = OsLauncher
            .spawn(&sh("echo hello; echo oops >&2; exit 3"))
            .unwrap();
        let exit = wait_exit(&mut child);
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());

        // Relay threads may lag the exit slightly.
        let mut lines = Vec::new();
        let started = Instant::now();
        while lines.len() < 2 && started.elapsed() < Duration::from_secs(2) {
            lines.extend(child.drain_output());
            thread::sleep(Duration::from_millis(10));
        }
        lines.sort();
        assert_eq!(lines, vec!["hello".to_string(), "oops".to_string()]);
    }

    #[test]
    fn graceful_stop_terminates_cooperative_child() {
        let mut child = OsLauncher.spawn(&CommandSpec::new("sleep").arg("30")).unwrap();
        child.request_graceful_stop().unwrap();
        let exit = wait_exit(&mut child);
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        // Already gone: both stop requests are harmless.
        child.request_graceful_stop().unwrap();
        child.force_stop().unwrap();
    }

    #[test]
    fn spawn_of_missing_program_fails() {
        assert!(OsLauncher
            .spawn(&CommandSpec::new("/nonexistent/detector"))
            .is_err());
    }

    #[test]
    fn command_spec_displays_as_command_line() {
        let spec = CommandSpec::new("./run.sh").arg("--camera-only");
        assert_eq!(spec.to_string(), "./run.sh --camera-only");
    }
}
