/// Helper side of the launch handshake
///
/// Runs inside the terminal opened by [`crate::launcher::LaunchSession`].
/// For every request it starts the target under `PTRACE_TRACEME`, waits for
/// the post-exec trap, stops the target with `SIGSTOP` and detaches, so the
/// target sits stopped in the terminal's foreground group until GDB
/// attaches and continues it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{self, kill, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, setpgid, tcsetpgrp, Pid};
use thiserror::Error;

use crate::launcher::{ACK, END_ENV, LAUNCH_FAILED};

#[derive(Error, Debug)]
pub enum SpawnerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("Empty command line")]
    EmptyCommand,
    #[error("Target did not stop after exec: {0}")]
    UnexpectedStatus(String),
}

pub type Result<T> = std::result::Result<T, SpawnerError>;

/// One launch request read from the controller
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchRequest {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Read a request; `None` once the controller has gone away
pub fn read_request(input: &mut impl BufRead) -> Result<Option<LaunchRequest>> {
    let Some(command) = read_line(input)? else {
        return Ok(None);
    };
    let Some(working_dir) = read_line(input)? else {
        return Ok(None);
    };

    let mut env = Vec::new();
    loop {
        match read_line(input)? {
            None => return Ok(None),
            Some(line) if line == END_ENV => break,
            Some(line) => match line.split_once('=') {
                Some((key, value)) => env.push((key.to_string(), value.to_string())),
                None => log::warn!("Ignoring malformed environment line {:?}", line),
            },
        }
    }

    Ok(Some(LaunchRequest {
        command,
        working_dir: PathBuf::from(working_dir),
        env,
    }))
}

fn read_line(input: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Serve launch requests until the controller closes its end
///
/// `read_fifo` is written here and read by the controller; `write_fifo` the
/// other way round.
pub fn run(read_fifo: &Path, write_fifo: &Path) -> Result<()> {
    let mut to_controller = OpenOptions::new().write(true).open(read_fifo)?;
    writeln!(to_controller, "{}", getpid())?;
    to_controller.flush()?;

    let mut from_controller = BufReader::new(File::open(write_fifo)?);

    loop {
        reap_children();

        writeln!(to_controller, "{}", ACK)?;
        to_controller.flush()?;

        let Some(request) = read_request(&mut from_controller)? else {
            log::info!("Controller closed the launch channel");
            return Ok(());
        };
        log::info!("Launching {:?} in {:?}", request.command, request.working_dir);

        match spawn_stopped(&request) {
            Ok(pid) => writeln!(to_controller, "{}", pid)?,
            Err(e) => {
                log::error!("Launch failed: {}", e);
                writeln!(to_controller, "{}{}", LAUNCH_FAILED, e)?;
            }
        }
        to_controller.flush()?;
    }
}

/// Start the target and leave it stopped and detached
pub fn spawn_stopped(request: &LaunchRequest) -> Result<Pid> {
    let mut words = request.command.split_whitespace();
    let program = words.next().ok_or(SpawnerError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(words)
        .current_dir(&request.working_dir)
        .envs(request.env.iter().map(|(k, v)| (k, v)));

    // SAFETY: the closure only makes async-signal-safe system calls
    unsafe {
        command.pre_exec(|| {
            take_terminal()?;
            ptrace::traceme()?;
            Ok(())
        });
    }

    let child = command.spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    match waitpid(pid, None)? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => return Err(SpawnerError::UnexpectedStatus(format!("{:?}", status))),
    }

    // The pending SIGSTOP takes effect as soon as the tracer lets go
    kill(pid, Signal::SIGSTOP)?;
    ptrace::detach(pid, None)?;

    log::debug!("Target {} stopped and detached", pid);
    Ok(pid)
}

/// Put the calling process in its own group and make that group the
/// terminal's foreground group
///
/// A background process calling `tcsetpgrp` gets `SIGTTOU`, so job-control
/// signals are ignored around the call and restored afterwards.
fn take_terminal() -> nix::Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

    // SAFETY: standard input stays open for the life of the process
    let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };

    unsafe {
        signal::signal(Signal::SIGTTOU, SigHandler::SigIgn)?;
        signal::signal(Signal::SIGTTIN, SigHandler::SigIgn)?;
    }
    let result = tcsetpgrp(stdin, getpid());
    unsafe {
        signal::signal(Signal::SIGTTOU, SigHandler::SigDfl)?;
        signal::signal(Signal::SIGTTIN, SigHandler::SigDfl)?;
    }

    match result {
        // No controlling terminal: nothing to hand over
        Ok(()) | Err(Errno::ENOTTY) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Collect targets that have exited since the last launch
fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => log::debug!("Reaped {:?}", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_request() {
        let mut input = Cursor::new("./test -v\n/tmp\nA=1\nB=x=y\n*** END ENV ***\n");
        let request = read_request(&mut input).unwrap().unwrap();

        assert_eq!(request.command, "./test -v");
        assert_eq!(request.working_dir, PathBuf::from("/tmp"));
        assert_eq!(
            request.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert!(read_request(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_read_request_without_env() {
        let mut input = Cursor::new("./test\n/tmp\n*** END ENV ***\n");
        let request = read_request(&mut input).unwrap().unwrap();
        assert!(request.env.is_empty());
    }

    #[test]
    fn test_truncated_request() {
        let mut input = Cursor::new("./test\n/tmp\nA=1\n");
        assert!(read_request(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_empty_command() {
        let request = LaunchRequest::default();
        assert!(matches!(spawn_stopped(&request), Err(SpawnerError::EmptyCommand)));
    }
}
