/// GDB command construction and reply decoding
///
/// This module provides the MI commands the controller issues and decodes
/// the payloads of their `^done` replies into typed values.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{find, MiResult, Value};

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Type conversion error: {0}")]
    TypeError(String),
}

/// Where a breakpoint should be placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Line { file: String, line: u32 },
    Function(String),
    Address(u64),
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointLocation::Line { file, line } => write!(f, "{}:{}", file, line),
            BreakpointLocation::Function(name) => write!(f, "{}", name),
            BreakpointLocation::Address(addr) => write!(f, "*{:#x}", addr),
        }
    }
}

/// MI commands issued by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum MiCommand {
    FileExecAndSymbols(String),
    BreakInsert(BreakpointLocation),
    BreakDelete(u32),
    ExecContinue,
    ExecStep,
    ExecNext,
    ExecStepInstruction,
    ExecNextInstruction,
    ExecFinish,
    StackListFrames,
    TargetDetach,
    GdbExit,
}

impl MiCommand {
    /// Command text without token or leading dash
    pub fn to_command(&self) -> String {
        match self {
            MiCommand::FileExecAndSymbols(path) => {
                format!("file-exec-and-symbols {}", quote(path))
            }
            MiCommand::BreakInsert(location) => {
                format!("break-insert {}", quote(&location.to_string()))
            }
            MiCommand::BreakDelete(number) => format!("break-delete {}", number),
            MiCommand::ExecContinue => "exec-continue".to_string(),
            MiCommand::ExecStep => "exec-step".to_string(),
            MiCommand::ExecNext => "exec-next".to_string(),
            MiCommand::ExecStepInstruction => "exec-step-instruction".to_string(),
            MiCommand::ExecNextInstruction => "exec-next-instruction".to_string(),
            MiCommand::ExecFinish => "exec-finish".to_string(),
            MiCommand::StackListFrames => "stack-list-frames".to_string(),
            MiCommand::TargetDetach => "target-detach".to_string(),
            MiCommand::GdbExit => "gdb-exit".to_string(),
        }
    }

    /// Whether the command resumes the target and should be waited on
    /// until it stops again
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            MiCommand::ExecContinue
                | MiCommand::ExecStep
                | MiCommand::ExecNext
                | MiCommand::ExecStepInstruction
                | MiCommand::ExecNextInstruction
                | MiCommand::ExecFinish
        )
    }
}

/// Quote an MI command parameter as a C string
fn quote(param: &str) -> String {
    let mut quoted = String::with_capacity(param.len() + 2);
    quoted.push('"');
    for ch in param.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

fn string_field(tuple: &[MiResult], name: &str) -> Option<String> {
    find(tuple, name).and_then(Value::as_string).map(str::to_string)
}

/// Represents a breakpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub number: u32,
    pub enabled: bool,
    pub addr: Option<String>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub times: u32,
}

impl Breakpoint {
    pub fn from_tuple(tuple: &[MiResult]) -> Result<Self> {
        let number = find(tuple, "number")
            .and_then(Value::as_string)
            .ok_or_else(|| CommandError::MissingField("number".to_string()))?;
        // Sub-locations of a multi-location breakpoint look like "1.2"
        let number = number
            .split('.')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| CommandError::TypeError(format!("Invalid breakpoint number {:?}", number)))?;

        let enabled = find(tuple, "enabled")
            .and_then(Value::as_string)
            .map(|s| s == "y")
            .unwrap_or(true);

        let line = find(tuple, "line")
            .and_then(Value::as_string)
            .and_then(|s| s.parse().ok());

        let times = find(tuple, "times")
            .and_then(Value::as_string)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Breakpoint {
            number,
            enabled,
            addr: string_field(tuple, "addr"),
            func: string_field(tuple, "func"),
            file: string_field(tuple, "file"),
            fullname: string_field(tuple, "fullname"),
            line,
            times,
        })
    }
}

/// Represents a stack frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub level: u32,
    pub address: u64,
    pub function: String,
    pub fullname: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    /// Decode one `frame={...}` tuple: `level` is decimal, `addr` hexadecimal
    pub fn from_tuple(tuple: &[MiResult]) -> Result<Self> {
        let level = find(tuple, "level")
            .and_then(Value::as_string)
            .ok_or_else(|| CommandError::MissingField("level".to_string()))?;
        let level = level
            .parse()
            .map_err(|_| CommandError::TypeError(format!("Invalid frame level {:?}", level)))?;

        let addr = find(tuple, "addr")
            .and_then(Value::as_string)
            .ok_or_else(|| CommandError::MissingField("addr".to_string()))?;
        let address = parse_hex(addr)
            .ok_or_else(|| CommandError::TypeError(format!("Invalid frame address {:?}", addr)))?;

        let function = string_field(tuple, "func").unwrap_or_else(|| "??".to_string());

        Ok(StackFrame {
            level,
            address,
            function,
            fullname: string_field(tuple, "fullname"),
            line: find(tuple, "line")
                .and_then(Value::as_string)
                .and_then(|s| s.parse().ok()),
        })
    }
}

/// Decode the list carried by a `stack=[...]` reply, innermost frame first
pub fn stack_from_value(stack: &Value) -> Result<Vec<StackFrame>> {
    let frames = stack
        .as_list()
        .ok_or_else(|| CommandError::TypeError("Expected list for stack".to_string()))?;

    frames
        .iter()
        .map(|item| {
            item.value()
                .as_tuple()
                .ok_or_else(|| CommandError::TypeError("Expected tuple for frame".to_string()))
                .and_then(StackFrame::from_tuple)
        })
        .collect()
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}
