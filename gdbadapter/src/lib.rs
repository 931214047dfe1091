/// GDB Adapter
///
/// This crate drives GDB through its machine interface (GDB/MI): it starts
/// targets through a helper in a terminal, attaches GDB to them, issues
/// numbered commands, parses GDB's output and keeps a consistent view of
/// the debuggee (run state, call stack, current source location).
///
/// Everything runs on the caller's task. Commands that need up-to-date
/// state (steps, breakpoints, stack refresh) drain GDB's output before
/// returning; the rest are sent and their output is picked up by the
/// caller's event loop through [`GdbAdapter::next_output`].

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

pub mod commands;
pub mod communication;
pub mod config;
pub mod events;
pub mod launcher;
pub mod parser;
pub mod process;
pub mod spawner;
pub mod types;

pub use commands::{Breakpoint, BreakpointLocation, MiCommand, StackFrame};
pub use communication::{CommunicationError, GdbCommunication};
pub use config::{DebuggerConfig, TargetSpec};
pub use events::{CommandFailed, DebugEvent, DebuggerState, GdbEventHandler, Location};
pub use launcher::{FifoLauncher, LaunchError, Launcher};
pub use parser::{parse_output, parse_outputs, ParseError, PROMPT};
pub use process::{GdbProcess, ProcessError};
pub use types::*;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("Failed to start GDB process: {0}")]
    ProcessStartError(#[from] ProcessError),
    #[error("GDB command failed: {0}")]
    CommandError(#[from] CommandFailed),
    #[error("Communication error: {0}")]
    CommunicationError(#[from] CommunicationError),
    #[error("Launch failed: {0}")]
    LaunchError(#[from] LaunchError),
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DebuggerState,
    },
    #[error("No target has been started")]
    NoTarget,
}

pub type Result<T> = std::result::Result<T, GdbError>;

/// Adapter talking to a local GDB process and launching through a terminal
pub type LocalGdbAdapter = GdbAdapter<ChildStdout, ChildStdin, FifoLauncher>;

/// Main GDB adapter that owns the GDB channel and the debuggee's state
pub struct GdbAdapter<R, W, L> {
    comm: GdbCommunication<R, W>,
    events: GdbEventHandler,
    launcher: L,
    entry_point: String,
    process: Option<GdbProcess>,
    target: Option<TargetSpec>,
    target_pid: Option<i32>,
}

impl LocalGdbAdapter {
    /// Start GDB and build an adapter around it
    pub async fn start(config: DebuggerConfig) -> Result<Self> {
        let mut process = GdbProcess::start(&config.gdb_path, &config.gdb_args)?;
        let (stdin, stdout, stderr) = process.take_streams()?;

        Self::start_stderr_reader(stderr);

        let launcher = FifoLauncher::new(&config);
        let mut adapter = GdbAdapter::new(stdout, stdin, launcher, &config);
        adapter.process = Some(process);
        Ok(adapter)
    }

    /// Forward GDB's stderr to the log
    fn start_stderr_reader(stderr: ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::warn!("GDB stderr: {}", line);
            }
            log::debug!("GDB stderr reader finished");
        });
    }
}

impl<R, W, L> GdbAdapter<R, W, L>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: Launcher,
{
    /// Build an adapter over already connected GDB streams
    pub fn new(reader: R, writer: W, launcher: L, config: &DebuggerConfig) -> Self {
        Self {
            comm: GdbCommunication::new(reader, writer, config.initial_token)
                .with_prompt(config.prompt.clone()),
            events: GdbEventHandler::new(),
            launcher,
            entry_point: config.entry_point.clone(),
            process: None,
            target: None,
            target_pid: None,
        }
    }

    pub fn state(&self) -> DebuggerState {
        self.events.state()
    }

    pub fn stack(&self) -> Vec<StackFrame> {
        self.events.stack()
    }

    pub fn location(&self) -> Option<Location> {
        self.events.location()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.events.breakpoints()
    }

    pub fn target_pid(&self) -> Option<i32> {
        self.target_pid
    }

    /// Receive state, location and stack notifications
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DebugEvent> {
        self.events.subscribe()
    }

    /// Send an MI command without waiting for its output
    pub async fn execute(&mut self, command: &MiCommand) -> Result<u32> {
        Ok(self.comm.send_command(&command.to_command()).await?)
    }

    /// Read, parse and dispatch the next batch of GDB output
    ///
    /// Malformed batches are logged and skipped. A `^error` reply is applied
    /// and then returned as [`GdbError::CommandError`].
    pub async fn next_output(&mut self) -> Result<Output> {
        loop {
            let batch = self.comm.read_batch().await?;
            match parse_output(&batch) {
                Ok(output) => {
                    self.events.dispatch(&output)?;
                    return Ok(output);
                }
                Err(e) => log::warn!("GDB_PARSE_ERROR: {} in {:?}", e, batch),
            }
        }
    }

    /// Process output until the result record carrying `token` arrives
    async fn wait_for_result(&mut self, token: u32) -> Result<ResultRecord> {
        loop {
            match self.next_output().await {
                Ok(output) => {
                    if let Some(result) = output.result {
                        if result.token == token {
                            return Ok(result);
                        }
                        log::debug!("RECV[{}]: not the awaited {}", result.token, token);
                    }
                }
                Err(GdbError::CommandError(failed)) if failed.token != token => {
                    log::warn!("Unrelated command failed: {}", failed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a resuming command and process output until the target stops
    /// again, then refresh the stack
    async fn execute_and_wait(&mut self, command: MiCommand) -> Result<DebuggerState> {
        let token = self.execute(&command).await?;
        self.wait_for_result(token).await?;

        while command.resumes() && self.state() == DebuggerState::Running {
            self.next_output().await?;
        }

        if self.state() == DebuggerState::Interrupted {
            self.refresh_stack().await?;
        }
        Ok(self.state())
    }

    fn require_state(&self, operation: &'static str, expected: DebuggerState) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(GdbError::InvalidState { operation, state });
        }
        Ok(())
    }

    /// Launch `target` stopped, attach GDB to it and let it run to the
    /// entry point
    pub async fn run(&mut self, target: TargetSpec) -> Result<i32> {
        let program = target.program().ok_or(GdbError::NoTarget)?.to_string();
        let pid = self.launcher.launch(&target).await?;
        self.target = Some(target);
        self.target_pid = Some(pid);
        log::info!("Target {} started, attaching", pid);

        let token = self.execute(&MiCommand::FileExecAndSymbols(program)).await?;
        self.wait_for_result(token).await?;

        // CLI attach: MI's -target-attach does not pick up the stopped state
        self.comm.send_cli(&format!("attach {}", pid)).await?;
        self.wait_for_result(0).await?;
        self.events.set_state(DebuggerState::Running);

        let entry = BreakpointLocation::Function(self.entry_point.clone());
        let token = self.execute(&MiCommand::BreakInsert(entry)).await?;
        self.wait_for_result(token).await?;

        self.comm.send_cli("signal SIGCONT").await?;
        // Attaching leaves one extra stop behind; the second continue
        // absorbs it
        self.execute(&MiCommand::ExecContinue).await?;
        self.execute(&MiCommand::ExecContinue).await?;

        Ok(pid)
    }

    /// Detach from the current target and start it again
    pub async fn restart(&mut self) -> Result<i32> {
        let target = self.target.clone().ok_or(GdbError::NoTarget)?;

        if self.state() != DebuggerState::NotRunning {
            let token = self.execute(&MiCommand::TargetDetach).await?;
            self.wait_for_result(token).await?;
        }
        if let Some(pid) = self.target_pid.take() {
            // Already gone if it exited on its own
            let _ = process::signal_process(pid, Signal::SIGKILL);
        }
        self.events.reset();

        self.run(target).await
    }

    /// Insert a breakpoint and return it as GDB reported it
    pub async fn insert_breakpoint(&mut self, location: BreakpointLocation) -> Result<Breakpoint> {
        let token = self.execute(&MiCommand::BreakInsert(location)).await?;
        let result = self.wait_for_result(token).await?;

        result
            .get("bkpt")
            .and_then(Value::as_tuple)
            .and_then(|tuple| Breakpoint::from_tuple(tuple).ok())
            .ok_or_else(|| {
                GdbError::CommandError(CommandFailed {
                    token,
                    message: "reply carries no breakpoint".to_string(),
                })
            })
    }

    pub async fn break_at_line(&mut self, file: &str, line: u32) -> Result<Breakpoint> {
        self.insert_breakpoint(BreakpointLocation::Line {
            file: file.to_string(),
            line,
        })
        .await
    }

    pub async fn break_at_function(&mut self, function: &str) -> Result<Breakpoint> {
        self.insert_breakpoint(BreakpointLocation::Function(function.to_string()))
            .await
    }

    pub async fn break_at_address(&mut self, address: u64) -> Result<Breakpoint> {
        self.insert_breakpoint(BreakpointLocation::Address(address)).await
    }

    pub async fn delete_breakpoint(&mut self, number: u32) -> Result<()> {
        let token = self.execute(&MiCommand::BreakDelete(number)).await?;
        self.wait_for_result(token).await?;
        self.events.remove_breakpoint(number);
        Ok(())
    }

    /// Step into the next source line
    pub async fn step_into(&mut self) -> Result<DebuggerState> {
        self.require_state("step", DebuggerState::Interrupted)?;
        self.execute_and_wait(MiCommand::ExecStep).await
    }

    /// Step over the next source line
    pub async fn step_over(&mut self) -> Result<DebuggerState> {
        self.require_state("step", DebuggerState::Interrupted)?;
        self.execute_and_wait(MiCommand::ExecNext).await
    }

    pub async fn step_instruction(&mut self) -> Result<DebuggerState> {
        self.require_state("step", DebuggerState::Interrupted)?;
        self.execute_and_wait(MiCommand::ExecStepInstruction).await
    }

    pub async fn next_instruction(&mut self) -> Result<DebuggerState> {
        self.require_state("step", DebuggerState::Interrupted)?;
        self.execute_and_wait(MiCommand::ExecNextInstruction).await
    }

    /// Run until the current function returns
    pub async fn finish(&mut self) -> Result<DebuggerState> {
        self.require_state("finish", DebuggerState::Interrupted)?;
        self.execute_and_wait(MiCommand::ExecFinish).await
    }

    /// Resume the target; the stop is picked up by the event loop
    pub async fn continue_execution(&mut self) -> Result<u32> {
        self.require_state("continue", DebuggerState::Interrupted)?;
        self.execute(&MiCommand::ExecContinue).await
    }

    /// Stop the running target by signalling it directly
    pub fn interrupt(&mut self) -> Result<()> {
        self.require_state("interrupt", DebuggerState::Running)?;
        let pid = self.target_pid.ok_or(GdbError::NoTarget)?;
        process::signal_process(pid, Signal::SIGINT)?;
        Ok(())
    }

    /// Replace the stack with GDB's current backtrace
    pub async fn refresh_stack(&mut self) -> Result<Vec<StackFrame>> {
        let token = self.execute(&MiCommand::StackListFrames).await?;
        self.wait_for_result(token).await?;
        Ok(self.stack())
    }

    /// Ask GDB to exit and release the launcher
    pub async fn shutdown(&mut self) -> Result<()> {
        self.launcher.shutdown();
        let _ = self.execute(&MiCommand::GdbExit).await;
        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
        self.events.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::{Builder, Mock};

    /// Launcher that pretends a target is already stopped
    struct FixedLauncher {
        pid: i32,
        launches: u32,
        shut_down: bool,
    }

    impl Launcher for FixedLauncher {
        async fn launch(&mut self, _target: &TargetSpec) -> launcher::Result<i32> {
            self.launches += 1;
            Ok(self.pid)
        }

        fn shutdown(&mut self) {
            self.shut_down = true;
        }
    }

    fn adapter(reader: Mock, writer: Mock) -> GdbAdapter<Mock, Mock, FixedLauncher> {
        let launcher = FixedLauncher {
            pid: 4242,
            launches: 0,
            shut_down: false,
        };
        GdbAdapter::new(reader, writer, launcher, &DebuggerConfig::default())
    }

    #[tokio::test]
    async fn test_run_attaches_to_launched_target() {
        let writer = Builder::new()
            .write(b"1-file-exec-and-symbols \"./test\"\n")
            .write(b"attach 4242\n")
            .write(b"2-break-insert \"main\"\n")
            .write(b"signal SIGCONT\n")
            .write(b"3-exec-continue\n")
            .write(b"4-exec-continue\n")
            .build();
        let reader = Builder::new()
            .read(b"1^done\n(gdb)\n")
            .read(b"=thread-group-started,id=\"i1\",pid=\"4242\"\n^done\n(gdb)\n")
            .read(b"2^done,bkpt={number=\"1\",type=\"breakpoint\",func=\"main\",file=\"test.c\",line=\"5\"}\n(gdb)\n")
            .build();
        let mut gdb = adapter(reader, writer);

        let pid = gdb.run(TargetSpec::new("./test", "/tmp")).await.unwrap();

        assert_eq!(pid, 4242);
        assert_eq!(gdb.target_pid(), Some(4242));
        assert_eq!(gdb.state(), DebuggerState::Running);
        assert_eq!(gdb.breakpoints()[0].func.as_deref(), Some("main"));
        assert_eq!(gdb.launcher.launches, 1);
    }

    #[tokio::test]
    async fn test_step_drains_until_stopped() {
        let writer = Builder::new()
            .write(b"1-exec-next\n")
            .write(b"2-stack-list-frames\n")
            .build();
        let reader = Builder::new()
            .read(b"1^running\n*running,thread-id=\"all\"\n(gdb)\n")
            .read(b"*stopped,reason=\"end-stepping-range\",frame={addr=\"0x0804844f\",func=\"main\",fullname=\"/tmp/test.c\",line=\"36\"}\n(gdb)\n")
            .read(b"2^done,stack=[frame={level=\"0\",addr=\"0x0804844f\",func=\"main\"}]\n(gdb)\n")
            .build();
        let mut gdb = adapter(reader, writer);
        gdb.events.set_state(DebuggerState::Interrupted);

        let state = gdb.step_over().await.unwrap();

        assert_eq!(state, DebuggerState::Interrupted);
        assert_eq!(gdb.location().unwrap().line, 36);
        let stack = gdb.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].address, 0x0804844f);
    }

    #[tokio::test]
    async fn test_step_until_exit_skips_stack_refresh() {
        let writer = Builder::new().write(b"1-exec-step\n").build();
        let reader = Builder::new()
            .read(b"1^running\n(gdb)\n")
            .read(b"*stopped,reason=\"exited-normally\"\n(gdb)\n")
            .build();
        let mut gdb = adapter(reader, writer);
        gdb.events.set_state(DebuggerState::Interrupted);

        assert_eq!(gdb.step_into().await.unwrap(), DebuggerState::NotRunning);
    }

    #[tokio::test]
    async fn test_error_reply_is_returned() {
        let writer = Builder::new().write(b"1-exec-finish\n").build();
        let reader = Builder::new()
            .read(b"1^error,msg=\"\\\"finish\\\" not meaningful in the outermost frame.\"\n(gdb)\n")
            .build();
        let mut gdb = adapter(reader, writer);
        gdb.events.set_state(DebuggerState::Interrupted);

        match gdb.finish().await {
            Err(GdbError::CommandError(failed)) => {
                assert_eq!(failed.token, 1);
                assert_eq!(failed.message, "\"finish\" not meaningful in the outermost frame.");
            }
            other => panic!("Expected command error, got {:?}", other),
        }
        assert_eq!(gdb.state(), DebuggerState::Interrupted);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_skipped() {
        let reader = Builder::new()
            .read(b"1^done,bkpt={number=\"1\"\n(gdb)\n")
            .read(b"~\"ok\"\n(gdb)\n")
            .build();
        let mut gdb = adapter(reader, Builder::new().build());

        let output = gdb.next_output().await.unwrap();
        assert_eq!(output.oob_records.len(), 1);
        assert!(gdb.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn test_operations_check_state() {
        let mut gdb = adapter(Builder::new().build(), Builder::new().build());

        assert!(matches!(
            gdb.interrupt(),
            Err(GdbError::InvalidState { operation: "interrupt", .. })
        ));
        assert!(matches!(
            gdb.step_over().await,
            Err(GdbError::InvalidState { state: DebuggerState::NotRunning, .. })
        ));
        assert!(matches!(gdb.restart().await, Err(GdbError::NoTarget)));

        gdb.events.set_state(DebuggerState::Running);
        assert!(matches!(gdb.interrupt(), Err(GdbError::NoTarget)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_launcher() {
        let writer = Builder::new().write(b"1-gdb-exit\n").build();
        let mut gdb = adapter(Builder::new().build(), writer);

        gdb.shutdown().await.unwrap();
        assert!(gdb.launcher.shut_down);
    }
}
