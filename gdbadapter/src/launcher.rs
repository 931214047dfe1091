/// Target launching through a helper process
///
/// The debuggee is started by a helper (`gdbfront-spawner`) running inside
/// its own terminal, so the target gets a real TTY. The controller and the
/// helper talk over two named pipes:
///
/// * `read_fifo`, helper to controller: the helper's PID once, then per launch
///   `ACK` followed by the PID of the new, stopped target;
/// * `write_fifo`, controller to helper: per launch the command line, the
///   working directory, `KEY=VALUE` environment lines and [`END_ENV`].
///
/// The helper leaves the target stopped and untraced, ready for GDB to
/// attach to.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::config::{DebuggerConfig, TargetSpec};
use crate::process::signal_process;

/// Sent by the helper when it is ready for the next launch
pub const ACK: &str = "ACK";
/// Terminates the environment block of a launch request
pub const END_ENV: &str = "*** END ENV ***";
/// Prefix of the line the helper sends instead of a PID when a launch fails
pub const LAUNCH_FAILED: &str = "ERROR ";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to create FIFO {path:?}: {source}")]
    Fifo { path: PathBuf, source: nix::Error },
    #[error("Failed to open FIFO {path:?}: {source}")]
    OpenFifo { path: PathBuf, source: std::io::Error },
    #[error("Failed to spawn terminal {command:?}: {source}")]
    Spawn { command: String, source: std::io::Error },
    #[error("No terminal command configured")]
    NoTerminal,
    #[error("Expected {expected} from helper, got {got:?}")]
    Handshake { expected: &'static str, got: String },
    #[error("Helper closed the channel")]
    ChannelClosed,
    #[error("Helper could not start the target: {0}")]
    TargetFailed(String),
    #[error("I/O error talking to helper: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Starts targets stopped, ready to be attached to
#[allow(async_fn_in_trait)]
pub trait Launcher {
    /// Start `target` and return the PID of the stopped process
    async fn launch(&mut self, target: &TargetSpec) -> Result<i32>;

    /// Release everything held for launching
    fn shutdown(&mut self);
}

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Handshake state with one running helper
///
/// Dropping the session tears it down as a whole: the helper is killed,
/// both pipes are closed and the FIFO files removed.
pub struct LaunchSession {
    read_path: PathBuf,
    write_path: PathBuf,
    reader: BufReader<pipe::Receiver>,
    writer: pipe::Sender,
    terminal: Option<Child>,
    spawner_pid: Option<i32>,
    target_pid: Option<i32>,
}

impl LaunchSession {
    /// Create both FIFOs under `dir` and open the controller's ends
    pub fn open(dir: &Path) -> Result<Self> {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let base = format!("gdbfront-{}-{}", std::process::id(), id);
        let read_path = dir.join(format!("{}-read", base));
        let write_path = dir.join(format!("{}-write", base));

        make_fifo(&read_path)?;
        if let Err(e) = make_fifo(&write_path) {
            let _ = std::fs::remove_file(&read_path);
            return Err(e);
        }

        let opened = fifo_options()
            .open_receiver(&read_path)
            .map_err(|source| LaunchError::OpenFifo {
                path: read_path.clone(),
                source,
            })
            .and_then(|receiver| {
                fifo_options()
                    .open_sender(&write_path)
                    .map(|sender| (receiver, sender))
                    .map_err(|source| LaunchError::OpenFifo {
                        path: write_path.clone(),
                        source,
                    })
            });

        let (receiver, sender) = match opened {
            Ok(ends) => ends,
            Err(e) => {
                let _ = std::fs::remove_file(&read_path);
                let _ = std::fs::remove_file(&write_path);
                return Err(e);
            }
        };

        log::debug!("Created FIFOs {:?} and {:?}", read_path, write_path);

        Ok(Self {
            read_path,
            write_path,
            reader: BufReader::new(receiver),
            writer: sender,
            terminal: None,
            spawner_pid: None,
            target_pid: None,
        })
    }

    pub fn read_path(&self) -> &Path {
        &self.read_path
    }

    pub fn write_path(&self) -> &Path {
        &self.write_path
    }

    pub fn spawner_pid(&self) -> Option<i32> {
        self.spawner_pid
    }

    pub fn target_pid(&self) -> Option<i32> {
        self.target_pid
    }

    /// Open a terminal running the helper on this session's FIFOs
    pub fn spawn_helper(&mut self, terminal: &[String], spawner: &Path) -> Result<()> {
        let (program, args) = terminal.split_first().ok_or(LaunchError::NoTerminal)?;

        let child = Command::new(program)
            .args(args)
            .arg(spawner)
            .arg(&self.read_path)
            .arg(&self.write_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: format!("{} {}", terminal.join(" "), spawner.display()),
                source,
            })?;

        log::debug!("Terminal started with PID {:?}", child.id());
        self.terminal = Some(child);
        Ok(())
    }

    /// Wait for the helper to announce itself
    pub async fn wait_for_helper(&mut self) -> Result<i32> {
        let line = self.read_line().await?;
        let pid = parse_pid(&line, "helper PID")?;
        log::debug!("Helper running as PID {}", pid);
        self.spawner_pid = Some(pid);
        Ok(pid)
    }

    /// Run one launch exchange and return the target's PID
    pub async fn request_launch(&mut self, target: &TargetSpec) -> Result<i32> {
        let line = self.read_line().await?;
        if line != ACK {
            return Err(LaunchError::Handshake {
                expected: ACK,
                got: line,
            });
        }

        let mut request = String::new();
        request.push_str(target.command());
        request.push('\n');
        request.push_str(&target.working_dir().to_string_lossy());
        request.push('\n');
        for (key, value) in target.env() {
            request.push_str(&format!("{}={}\n", key, value));
        }
        request.push_str(END_ENV);
        request.push('\n');

        self.writer.write_all(request.as_bytes()).await?;
        self.writer.flush().await?;
        log::debug!("Launch request sent for {:?}", target.command());

        let line = self.read_line().await?;
        if let Some(message) = line.strip_prefix(LAUNCH_FAILED) {
            return Err(LaunchError::TargetFailed(message.to_string()));
        }
        let pid = parse_pid(&line, "target PID")?;
        log::debug!("Target running as PID {}", pid);
        self.target_pid = Some(pid);
        Ok(pid)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(LaunchError::ChannelClosed);
        }
        Ok(line.trim_end().to_string())
    }
}

impl Drop for LaunchSession {
    fn drop(&mut self) {
        if let Some(pid) = self.spawner_pid.take() {
            let _ = signal_process(pid, Signal::SIGKILL);
        }
        if let Some(mut terminal) = self.terminal.take() {
            let _ = terminal.start_kill();
        }
        let _ = std::fs::remove_file(&self.read_path);
        let _ = std::fs::remove_file(&self.write_path);
        log::debug!("Launch session {:?} torn down", self.read_path);
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|source| {
        log::error!("mkfifo {:?} failed: {}", path, source);
        LaunchError::Fifo {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Opening both ends read-write keeps either side from seeing EOF or
/// `ENXIO` before the helper has opened its ends.
fn fifo_options() -> pipe::OpenOptions {
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options
}

fn parse_pid(line: &str, expected: &'static str) -> Result<i32> {
    match line.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(LaunchError::Handshake {
            expected,
            got: line.to_string(),
        }),
    }
}

/// Launches targets through a helper in a terminal, reusing the helper
/// across relaunches
pub struct FifoLauncher {
    terminal: Vec<String>,
    spawner_path: PathBuf,
    fifo_dir: PathBuf,
    session: Option<LaunchSession>,
}

impl FifoLauncher {
    pub fn new(config: &DebuggerConfig) -> Self {
        Self {
            terminal: config.terminal.clone(),
            spawner_path: config.spawner_path.clone(),
            fifo_dir: config.fifo_dir.clone(),
            session: None,
        }
    }

    pub fn session(&self) -> Option<&LaunchSession> {
        self.session.as_ref()
    }

    async fn start_session(&self) -> Result<LaunchSession> {
        let mut session = LaunchSession::open(&self.fifo_dir)?;
        session.spawn_helper(&self.terminal, &self.spawner_path)?;
        session.wait_for_helper().await?;
        Ok(session)
    }
}

impl Launcher for FifoLauncher {
    async fn launch(&mut self, target: &TargetSpec) -> Result<i32> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.start_session().await?,
        };

        // A failed exchange leaves the helper in an unknown state, so the
        // session is dropped (and torn down) rather than kept
        let pid = session.request_launch(target).await?;
        self.session = Some(session);
        Ok(pid)
    }

    fn shutdown(&mut self) {
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader as StdBufReader, Write};

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("4242", "x").unwrap(), 4242);
        assert!(parse_pid("0", "x").is_err());
        assert!(parse_pid("ACK", "x").is_err());
    }

    #[tokio::test]
    async fn test_session_removes_fifos_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let session = LaunchSession::open(dir.path()).unwrap();
        let (read_path, write_path) = (session.read_path().to_path_buf(), session.write_path().to_path_buf());
        assert!(read_path.exists() && write_path.exists());

        drop(session);
        assert!(!read_path.exists());
        assert!(!write_path.exists());
    }

    #[tokio::test]
    async fn test_missing_fifo_dir_fails() {
        let result = LaunchSession::open(Path::new("/nonexistent/fifo/dir"));
        assert!(matches!(result, Err(LaunchError::Fifo { .. })));
    }

    #[tokio::test]
    async fn test_no_terminal_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = LaunchSession::open(dir.path()).unwrap();
        let result = session.spawn_helper(&[], Path::new("spawner"));
        assert!(matches!(result, Err(LaunchError::NoTerminal)));
    }

    #[tokio::test]
    async fn test_helper_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = LaunchSession::open(dir.path()).unwrap();
        let (read_path, write_path) = (session.read_path().to_path_buf(), session.write_path().to_path_buf());

        let helper = std::thread::spawn(move || {
            let mut out = std::fs::OpenOptions::new().write(true).open(read_path).unwrap();
            let input = StdBufReader::new(std::fs::File::open(write_path).unwrap());
            writeln!(out, "ACK").unwrap();
            for line in input.lines() {
                if line.unwrap() == END_ENV {
                    break;
                }
            }
            writeln!(out, "ERROR no such file").unwrap();
        });

        let target = TargetSpec::new("./missing", "/tmp");
        let err = session.request_launch(&target).await.unwrap_err();
        assert!(matches!(err, LaunchError::TargetFailed(ref m) if m == "no such file"));
        helper.join().unwrap();
    }
}
