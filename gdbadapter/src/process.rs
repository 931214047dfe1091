/// Process management for GDB
///
/// This module handles GDB process creation and lifecycle, and delivers
/// signals to the debuggee directly (out of band of the MI protocol).

use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start GDB process: {0}")]
    StartError(#[from] std::io::Error),
    #[error("Process terminated unexpectedly")]
    Terminated,
    #[error("Failed to send {signal} to {pid}: {source}")]
    SignalError {
        pid: i32,
        signal: Signal,
        source: nix::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

pub struct GdbProcess {
    child: Child,
}

impl GdbProcess {
    /// Start a new GDB process speaking MI on its standard streams
    pub fn start(gdb_path: &str, args: &[String]) -> Result<Self> {
        log::debug!("Starting GDB process: {} {}", gdb_path, args.join(" "));

        let child = Command::new(gdb_path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        log::debug!("GDB process started with PID: {:?}", child.id());

        Ok(GdbProcess { child })
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the three standard streams; fails if already taken
    pub fn take_streams(&mut self) -> Result<(ChildStdin, ChildStdout, ChildStderr)> {
        match (
            self.child.stdin.take(),
            self.child.stdout.take(),
            self.child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok((stdin, stdout, stderr)),
            _ => Err(ProcessError::Terminated),
        }
    }

    /// Kill the GDB process
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Send `signal` to the process `pid`
pub fn signal_process(pid: i32, signal: Signal) -> Result<()> {
    log::debug!("Sending {} to PID {}", signal, pid);
    kill(Pid::from_raw(pid), signal).map_err(|source| {
        log::error!("Failed to send {} to PID {}", signal, pid);
        ProcessError::SignalError { pid, signal, source }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_missing_process_fails() {
        // PID space tops out well below i32::MAX on Linux
        let err = signal_process(i32::MAX, Signal::SIGCONT).unwrap_err();
        assert!(matches!(err, ProcessError::SignalError { .. }));
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let result = GdbProcess::start("/nonexistent/gdb", &[]);
        assert!(matches!(result, Err(ProcessError::StartError(_))));
    }
}
