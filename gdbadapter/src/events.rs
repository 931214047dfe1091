/// Event handling and state management for GDB adapter
///
/// This module walks parsed output, drives the run-state machine and keeps
/// the state derived from it (stack, current location, breakpoints).
/// Changes are published to subscribers as [`DebugEvent`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::commands::{stack_from_value, Breakpoint, StackFrame};
use crate::types::{
    AsyncClass, AsyncRecord, OobRecord, Output, ResultClass, ResultRecord, StopReason,
    StreamRecord, StreamType, Value,
};

/// Run state of the debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggerState {
    NotRunning,
    Running,
    Interrupted,
}

/// Source position the debuggee is stopped at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: Url,
    pub line: u32,
}

/// Notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DebugEvent {
    StateChanged(DebuggerState),
    LocationChanged(Location),
    StackChanged(Vec<StackFrame>),
    BreakpointAdded(Breakpoint),
    Stream(StreamRecord),
    CommandFailed { token: u32, message: String },
}

/// A `^error` reply, passed on to the caller unchanged
#[derive(Error, Debug, Clone, PartialEq)]
#[error("GDB command {token} failed: {message}")]
pub struct CommandFailed {
    pub token: u32,
    pub message: String,
}

/// Event handler for GDB output
pub struct GdbEventHandler {
    state: DebuggerState,
    location: Option<Location>,
    stack: Vec<StackFrame>,
    breakpoints: Vec<Breakpoint>,
    stop_reason: Option<String>,
    exit_code: Option<i32>,
    subscribers: Vec<mpsc::UnboundedSender<DebugEvent>>,
}

impl Default for GdbEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl GdbEventHandler {
    pub fn new() -> Self {
        Self {
            state: DebuggerState::NotRunning,
            location: None,
            stack: Vec::new(),
            breakpoints: Vec::new(),
            stop_reason: None,
            exit_code: None,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn location(&self) -> Option<Location> {
        self.location.clone()
    }

    pub fn stack(&self) -> Vec<StackFrame> {
        self.stack.clone()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.clone()
    }

    /// Raw reason string of the last stop
    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Register a new subscriber
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DebugEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    fn publish(&mut self, event: DebugEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    /// Move to `state`, notifying only on an actual change
    pub fn set_state(&mut self, state: DebuggerState) {
        if self.state != state {
            log::debug!("State {:?} -> {:?}", self.state, state);
            self.state = state;
            self.publish(DebugEvent::StateChanged(state));
        }
    }

    /// Forget breakpoints and stack when a session is torn down
    pub fn reset(&mut self) {
        self.set_state(DebuggerState::NotRunning);
        self.stack.clear();
        self.breakpoints.clear();
        self.location = None;
        self.stop_reason = None;
    }

    /// Apply a parsed batch: out-of-band records first, then the result
    pub fn dispatch(&mut self, output: &Output) -> Result<(), CommandFailed> {
        for record in &output.oob_records {
            match record {
                OobRecord::Async(record) => self.handle_async_record(record),
                OobRecord::Stream(record) => self.handle_stream_record(record),
            }
        }

        match &output.result {
            Some(result) => self.handle_result_record(result),
            None => Ok(()),
        }
    }

    /// Handle async records (execution state changes, etc.)
    fn handle_async_record(&mut self, record: &AsyncRecord) {
        match &record.class {
            AsyncClass::Stopped => self.handle_stopped(record),
            AsyncClass::Running => self.set_state(DebuggerState::Running),
            AsyncClass::Other(name) => {
                log::warn!("Unknown async record {:?}, ignoring", name);
            }
            class => log::trace!("Unhandled async class: {:?}", class),
        }
    }

    fn handle_stopped(&mut self, record: &AsyncRecord) {
        let reason = match record.get("reason").and_then(Value::as_string) {
            Some(reason) => reason,
            None => {
                log::warn!("Stop notification without a reason, ignoring");
                return;
            }
        };

        let Some(stop_reason) = StopReason::from_str(reason) else {
            log::warn!("Unrecognized stop reason {:?}, ignoring", reason);
            return;
        };
        self.stop_reason = Some(reason.to_string());

        match stop_reason {
            StopReason::BreakpointHit
            | StopReason::EndSteppingRange
            | StopReason::SignalReceived
            | StopReason::LocationReached
            | StopReason::WatchpointTrigger => {
                if let Some(signal) = record.get("signal-name").and_then(Value::as_string) {
                    log::debug!("Target received {}", signal);
                }
                if let Some(frame) = record.get("frame") {
                    self.update_location(frame);
                }
                self.set_state(DebuggerState::Interrupted);
            }
            StopReason::FunctionFinished => self.set_state(DebuggerState::Interrupted),
            StopReason::ExitedNormally | StopReason::Exited | StopReason::ExitedSignalled => {
                // GDB prints the exit code in octal
                self.exit_code = Some(
                    record
                        .get("exit-code")
                        .and_then(Value::as_string)
                        .and_then(|code| i32::from_str_radix(code, 8).ok())
                        .unwrap_or(0),
                );
                if !self.stack.is_empty() {
                    self.stack.clear();
                    self.publish(DebugEvent::StackChanged(Vec::new()));
                }
                self.set_state(DebuggerState::NotRunning);
            }
        }
    }

    fn update_location(&mut self, frame: &Value) {
        let fullname = frame.get("fullname").and_then(Value::as_string);
        let line = frame
            .get("line")
            .and_then(Value::as_string)
            .and_then(|l| l.parse::<u32>().ok());

        let (Some(fullname), Some(line)) = (fullname, line) else {
            log::debug!("Stop frame carries no source position");
            return;
        };

        let file = match Url::from_file_path(fullname) {
            Ok(file) => file,
            Err(()) => {
                log::warn!("Cannot turn {:?} into a file URL", fullname);
                return;
            }
        };

        let location = Location { file, line };
        if self.location.as_ref() != Some(&location) {
            self.location = Some(location.clone());
            self.publish(DebugEvent::LocationChanged(location));
        }
    }

    /// Handle stream records (console output, etc.)
    fn handle_stream_record(&mut self, record: &StreamRecord) {
        match record.stream_type {
            StreamType::Console => log::debug!("CONSOLE: {}", record.content.trim_end()),
            StreamType::Target => log::debug!("TARGET: {}", record.content.trim_end()),
            StreamType::Log => log::debug!("LOG: {}", record.content.trim_end()),
        }
        self.publish(DebugEvent::Stream(record.clone()));
    }

    /// Handle result records
    fn handle_result_record(&mut self, result: &ResultRecord) -> Result<(), CommandFailed> {
        match &result.class {
            ResultClass::Done => {
                if let Some(payload) = result.payload() {
                    match payload.name.as_str() {
                        "bkpt" => self.record_breakpoint(&payload.value),
                        "stack" => self.replace_stack(&payload.value),
                        other => log::trace!("Ignoring done payload {:?}", other),
                    }
                }
            }
            ResultClass::Running => self.set_state(DebuggerState::Running),
            ResultClass::Error => {
                let message = result
                    .get("msg")
                    .and_then(Value::as_string)
                    .unwrap_or("Unknown error")
                    .to_string();
                log::error!("RECV[{}]: GDB ERROR -> {}", result.token, message);
                self.publish(DebugEvent::CommandFailed {
                    token: result.token,
                    message: message.clone(),
                });
                return Err(CommandFailed {
                    token: result.token,
                    message,
                });
            }
            ResultClass::Connected | ResultClass::Exit => {
                log::debug!("RECV[{}]: {}", result.token, result.class.as_str());
            }
            ResultClass::Other(name) => {
                log::warn!("RECV[{}]: unknown result class {:?}, ignoring", result.token, name);
            }
        }
        Ok(())
    }

    fn record_breakpoint(&mut self, bkpt: &Value) {
        let Some(tuple) = bkpt.as_tuple() else {
            log::warn!("Breakpoint payload is not a tuple");
            return;
        };
        match Breakpoint::from_tuple(tuple) {
            Ok(breakpoint) => {
                log::debug!("Breakpoint {} recorded", breakpoint.number);
                self.breakpoints.retain(|b| b.number != breakpoint.number);
                self.breakpoints.push(breakpoint.clone());
                self.publish(DebugEvent::BreakpointAdded(breakpoint));
            }
            Err(e) => log::warn!("Malformed breakpoint payload: {}", e),
        }
    }

    /// Forget a breakpoint removed with `break-delete`
    pub fn remove_breakpoint(&mut self, number: u32) {
        self.breakpoints.retain(|b| b.number != number);
    }

    fn replace_stack(&mut self, stack: &Value) {
        match stack_from_value(stack) {
            Ok(frames) => {
                self.stack = frames;
                self.publish(DebugEvent::StackChanged(self.stack.clone()));
            }
            Err(e) => log::warn!("Malformed stack payload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_output;

    fn dispatch(handler: &mut GdbEventHandler, text: &str) -> Result<(), CommandFailed> {
        handler.dispatch(&parse_output(text).unwrap())
    }

    #[test]
    fn test_breakpoint_hit_sets_location() {
        let mut handler = GdbEventHandler::new();
        let mut events = handler.subscribe();

        dispatch(
            &mut handler,
            "*stopped,reason=\"breakpoint-hit\",frame={addr=\"0x0804844f\",func=\"main\",fullname=\"/tmp/test.c\",line=\"35\"}\n(gdb)\n",
        )
        .unwrap();

        assert_eq!(handler.state(), DebuggerState::Interrupted);
        let location = handler.location().unwrap();
        assert_eq!(location.file.as_str(), "file:///tmp/test.c");
        assert_eq!(location.line, 35);

        assert!(matches!(events.try_recv(), Ok(DebugEvent::LocationChanged(_))));
        assert_eq!(
            events.try_recv().unwrap(),
            DebugEvent::StateChanged(DebuggerState::Interrupted)
        );
    }

    #[test]
    fn test_location_only_published_on_change() {
        let mut handler = GdbEventHandler::new();
        let stop = "*stopped,reason=\"end-stepping-range\",frame={fullname=\"/tmp/a.c\",line=\"3\"}\n(gdb)\n";
        dispatch(&mut handler, stop).unwrap();
        let mut events = handler.subscribe();

        dispatch(&mut handler, stop).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_exited_normally_from_any_state() {
        for start in [
            DebuggerState::NotRunning,
            DebuggerState::Running,
            DebuggerState::Interrupted,
        ] {
            let mut handler = GdbEventHandler::new();
            handler.set_state(start);
            dispatch(&mut handler, "*stopped,reason=\"exited-normally\"\n(gdb)\n").unwrap();
            assert_eq!(handler.state(), DebuggerState::NotRunning);
        }
    }

    #[test]
    fn test_exited_records_exit_code() {
        let mut handler = GdbEventHandler::new();
        handler.set_state(DebuggerState::Running);
        dispatch(&mut handler, "*stopped,reason=\"exited\",exit-code=\"01\"\n(gdb)\n").unwrap();
        assert_eq!(handler.state(), DebuggerState::NotRunning);
        assert_eq!(handler.exit_code(), Some(1));
    }

    #[test]
    fn test_function_finished_keeps_location() {
        let mut handler = GdbEventHandler::new();
        handler.set_state(DebuggerState::Running);
        dispatch(
            &mut handler,
            "*stopped,reason=\"function-finished\",frame={fullname=\"/tmp/x.c\",line=\"9\"}\n(gdb)\n",
        )
        .unwrap();
        assert_eq!(handler.state(), DebuggerState::Interrupted);
        assert!(handler.location().is_none());
    }

    #[test]
    fn test_unknown_stop_reason_is_ignored() {
        let mut handler = GdbEventHandler::new();
        handler.set_state(DebuggerState::Running);
        dispatch(&mut handler, "*stopped,reason=\"solib-event\"\n(gdb)\n").unwrap();
        dispatch(&mut handler, "*stopped,thread-id=\"1\"\n(gdb)\n").unwrap();
        assert_eq!(handler.state(), DebuggerState::Running);
    }

    #[test]
    fn test_running_result_and_notification() {
        let mut handler = GdbEventHandler::new();
        dispatch(&mut handler, "3^running\n(gdb)\n").unwrap();
        assert_eq!(handler.state(), DebuggerState::Running);

        handler.set_state(DebuggerState::Interrupted);
        dispatch(&mut handler, "*running,thread-id=\"all\"\n(gdb)\n").unwrap();
        assert_eq!(handler.state(), DebuggerState::Running);
    }

    #[test]
    fn test_stack_replaced_wholesale() {
        let mut handler = GdbEventHandler::new();
        dispatch(
            &mut handler,
            "4^done,stack=[frame={level=\"0\",addr=\"0x10\",func=\"f\"},frame={level=\"1\",addr=\"0x20\",func=\"main\"}]\n(gdb)\n",
        )
        .unwrap();
        assert_eq!(handler.stack().len(), 2);

        dispatch(
            &mut handler,
            "5^done,stack=[frame={level=\"0\",addr=\"0x30\",func=\"main\"}]\n(gdb)\n",
        )
        .unwrap();
        let stack = handler.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].address, 0x30);
    }

    #[test]
    fn test_error_is_surfaced() {
        let mut handler = GdbEventHandler::new();
        let mut events = handler.subscribe();
        let err = dispatch(&mut handler, "7^error,msg=\"No symbol table is loaded.\"\n(gdb)\n").unwrap_err();

        assert_eq!(err.token, 7);
        assert_eq!(err.message, "No symbol table is loaded.");
        assert!(matches!(events.try_recv(), Ok(DebugEvent::CommandFailed { token: 7, .. })));
        assert_eq!(handler.state(), DebuggerState::NotRunning);
    }

    #[test]
    fn test_oob_dispatched_before_result() {
        let mut handler = GdbEventHandler::new();
        let mut events = handler.subscribe();
        dispatch(
            &mut handler,
            "~\"hello\\n\"\n*stopped,reason=\"signal-received\",frame={fullname=\"/tmp/b.c\",line=\"1\"}\n2^running\n(gdb)\n",
        )
        .unwrap();
        assert_eq!(handler.state(), DebuggerState::Running);
        assert!(matches!(events.try_recv(), Ok(DebugEvent::Stream(_))));
        assert!(matches!(events.try_recv(), Ok(DebugEvent::LocationChanged(_))));
        assert_eq!(events.try_recv().unwrap(), DebugEvent::StateChanged(DebuggerState::Interrupted));
        assert_eq!(events.try_recv().unwrap(), DebugEvent::StateChanged(DebuggerState::Running));
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let mut handler = GdbEventHandler::new();
        drop(handler.subscribe());
        handler.set_state(DebuggerState::Running);
        assert!(handler.subscribers.is_empty());
    }

    #[test]
    fn test_events_serialize_for_front_ends() {
        let event = DebugEvent::LocationChanged(Location {
            file: Url::parse("file:///tmp/test.c").unwrap(),
            line: 35,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"LocationChanged":{"file":"file:///tmp/test.c","line":35}}"#
        );
        assert_eq!(serde_json::from_str::<DebugEvent>(&json).unwrap(), event);
    }
}
