/// Controller configuration

use std::path::PathBuf;

use serde::Deserialize;

use crate::parser::PROMPT;

/// Name of the helper binary that hosts launched targets
pub const SPAWNER_BIN: &str = "gdbfront-spawner";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub gdb_path: String,
    pub gdb_args: Vec<String>,
    /// Command prefix that opens a terminal running the rest of the line
    pub terminal: Vec<String>,
    pub spawner_path: PathBuf,
    /// Directory the handshake FIFOs are created in
    pub fifo_dir: PathBuf,
    /// Breakpoint placed after attaching
    pub entry_point: String,
    pub initial_token: u32,
    pub prompt: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            gdb_path: "gdb".to_string(),
            gdb_args: vec!["-q".to_string(), "--interpreter=mi".to_string()],
            terminal: vec!["xterm".to_string(), "-e".to_string()],
            spawner_path: default_spawner_path(),
            fifo_dir: std::env::temp_dir(),
            entry_point: "main".to_string(),
            initial_token: 1,
            prompt: PROMPT.to_string(),
        }
    }
}

/// The helper installed next to the running executable, else a PATH lookup
fn default_spawner_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SPAWNER_BIN)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(SPAWNER_BIN))
}

/// What to launch: the session object handed in by the front end
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetSpec {
    command: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl TargetSpec {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.working_dir
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// The executable: first word of the command line
    pub fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }
}
