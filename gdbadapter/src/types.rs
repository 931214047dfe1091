/// GDB/MI types and data structures
///
/// This module defines the parse tree produced from GDB/MI protocol output.
/// Every node is exclusively owned by its parent, so dropping an `Output`
/// releases the whole tree, including trees abandoned half-way through a
/// failed parse.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root of one parsed transaction: the out-of-band records of a batch plus
/// at most one result record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Output {
    pub oob_records: Vec<OobRecord>,
    pub result: Option<ResultRecord>,
}

/// Out-of-band record
#[derive(Debug, Clone, PartialEq)]
pub enum OobRecord {
    Async(AsyncRecord),
    Stream(StreamRecord),
}

/// Represents a GDB/MI result record
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    /// Echoed sequence number, 0 when the debugger sent none
    pub token: u32,
    pub class: ResultClass,
    pub results: Vec<MiResult>,
}

impl ResultRecord {
    /// First named payload, which is the one the controller acts on
    pub fn payload(&self) -> Option<&MiResult> {
        self.results.first()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        find(&self.results, name)
    }
}

/// GDB/MI result classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    /// Anything outside the documented set, kept so callers can log it
    Other(String),
}

impl ResultClass {
    pub fn from_name(name: &str) -> Self {
        match name {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => ResultClass::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResultClass::Done => "done",
            ResultClass::Running => "running",
            ResultClass::Connected => "connected",
            ResultClass::Error => "error",
            ResultClass::Exit => "exit",
            ResultClass::Other(name) => name,
        }
    }
}

/// Represents a GDB/MI async record
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub token: u32,
    pub kind: AsyncKind,
    pub class: AsyncClass,
    pub results: Vec<MiResult>,
}

impl AsyncRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        find(&self.results, name)
    }
}

/// Which of the three async channels a record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    Status, // + prefix
    Exec,   // * prefix
    Notify, // = prefix
}

impl AsyncKind {
    pub fn prefix(self) -> char {
        match self {
            AsyncKind::Status => '+',
            AsyncKind::Exec => '*',
            AsyncKind::Notify => '=',
        }
    }
}

/// GDB/MI async classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncClass {
    Running,
    Stopped,
    ThreadGroupAdded,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadExited,
    LibraryLoaded,
    BreakpointModified,
    Other(String),
}

impl AsyncClass {
    pub fn from_name(name: &str) -> Self {
        match name {
            "running" => AsyncClass::Running,
            "stopped" => AsyncClass::Stopped,
            "thread-group-added" => AsyncClass::ThreadGroupAdded,
            "thread-group-started" => AsyncClass::ThreadGroupStarted,
            "thread-group-exited" => AsyncClass::ThreadGroupExited,
            "thread-created" => AsyncClass::ThreadCreated,
            "thread-exited" => AsyncClass::ThreadExited,
            "library-loaded" => AsyncClass::LibraryLoaded,
            "breakpoint-modified" => AsyncClass::BreakpointModified,
            other => AsyncClass::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AsyncClass::Running => "running",
            AsyncClass::Stopped => "stopped",
            AsyncClass::ThreadGroupAdded => "thread-group-added",
            AsyncClass::ThreadGroupStarted => "thread-group-started",
            AsyncClass::ThreadGroupExited => "thread-group-exited",
            AsyncClass::ThreadCreated => "thread-created",
            AsyncClass::ThreadExited => "thread-exited",
            AsyncClass::LibraryLoaded => "library-loaded",
            AsyncClass::BreakpointModified => "breakpoint-modified",
            AsyncClass::Other(name) => name,
        }
    }
}

/// Represents a GDB/MI stream record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

/// Types of GDB/MI streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Console,  // ~ prefix
    Target,   // @ prefix
    Log,      // & prefix
}

impl StreamType {
    pub fn prefix(self) -> char {
        match self {
            StreamType::Console => '~',
            StreamType::Target => '@',
            StreamType::Log => '&',
        }
    }
}

/// A `name=value` pair
#[derive(Debug, Clone, PartialEq)]
pub struct MiResult {
    pub name: String,
    pub value: Value,
}

impl MiResult {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self { name: name.into(), value }
    }
}

/// Represents values in GDB/MI output
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Tuple(Vec<MiResult>),
    List(Vec<ListItem>),
}

/// A list element: GDB emits both `[...,...]` and `[name=...,name=...]`
#[derive(Debug, Clone, PartialEq)]
pub enum ListItem {
    Value(Value),
    Result(MiResult),
}

impl ListItem {
    /// The element's value, ignoring the name of a named element
    pub fn value(&self) -> &Value {
        match self {
            ListItem::Value(value) => value,
            ListItem::Result(result) => &result.value,
        }
    }
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&[ListItem]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&[MiResult]> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Look up a field of a tuple by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_tuple().and_then(|tuple| find(tuple, name))
    }

    /// Append to a tuple; a no-op on other variants
    pub fn push_result(&mut self, result: MiResult) {
        if let Value::Tuple(tuple) = self {
            tuple.push(result);
        }
    }

    /// Append to a list; a no-op on other variants
    pub fn push_item(&mut self, item: ListItem) {
        if let Value::List(list) = self {
            list.push(item);
        }
    }
}

/// Find the first result called `name`
pub fn find<'a>(results: &'a [MiResult], name: &str) -> Option<&'a Value> {
    results.iter().find(|r| r.name == name).map(|r| &r.value)
}

/// Stop reason for stopped events
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    FunctionFinished,
    LocationReached,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
}

impl StopReason {
    /// Parse a stop reason from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "breakpoint-hit" => Some(StopReason::BreakpointHit),
            "watchpoint-trigger" => Some(StopReason::WatchpointTrigger),
            "function-finished" => Some(StopReason::FunctionFinished),
            "location-reached" => Some(StopReason::LocationReached),
            "end-stepping-range" => Some(StopReason::EndSteppingRange),
            "exited-signalled" => Some(StopReason::ExitedSignalled),
            "exited" => Some(StopReason::Exited),
            "exited-normally" => Some(StopReason::ExitedNormally),
            "signal-received" => Some(StopReason::SignalReceived),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::BreakpointHit => "breakpoint-hit",
            StopReason::WatchpointTrigger => "watchpoint-trigger",
            StopReason::FunctionFinished => "function-finished",
            StopReason::LocationReached => "location-reached",
            StopReason::EndSteppingRange => "end-stepping-range",
            StopReason::ExitedSignalled => "exited-signalled",
            StopReason::Exited => "exited",
            StopReason::ExitedNormally => "exited-normally",
            StopReason::SignalReceived => "signal-received",
        };
        write!(f, "{}", s)
    }
}

// Printing back to MI syntax. Strings are re-escaped, so parsing the printed
// form yields the same tree.

fn write_c_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            other => write!(f, "{}", other)?,
        }
    }
    f.write_str("\"")
}

fn write_results(f: &mut fmt::Formatter<'_>, results: &[MiResult]) -> fmt::Result {
    for result in results {
        write!(f, ",{}", result)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write_c_string(f, s),
            Value::Tuple(tuple) => {
                f.write_str("{")?;
                for (i, result) in tuple.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", result)?;
                }
                f.write_str("}")
            }
            Value::List(list) => {
                f.write_str("[")?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match item {
                        ListItem::Value(value) => write!(f, "{}", value)?,
                        ListItem::Result(result) => write!(f, "{}", result)?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Display for MiResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

impl fmt::Display for OobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OobRecord::Async(record) => {
                if record.token != 0 {
                    write!(f, "{}", record.token)?;
                }
                write!(f, "{}{}", record.kind.prefix(), record.class.as_str())?;
                write_results(f, &record.results)
            }
            OobRecord::Stream(record) => {
                write!(f, "{}", record.stream_type.prefix())?;
                write_c_string(f, &record.content)
            }
        }
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token != 0 {
            write!(f, "{}", self.token)?;
        }
        write!(f, "^{}", self.class.as_str())?;
        write_results(f, &self.results)
    }
}

/// Prints the whole transaction, prompt line included
impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.oob_records {
            writeln!(f, "{}", record)?;
        }
        if let Some(result) = &self.result {
            writeln!(f, "{}", result)?;
        }
        writeln!(f, "{}", crate::parser::PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_lookup_preserves_order() {
        let mut tuple = Value::Tuple(Vec::new());
        tuple.push_result(MiResult::new("b", Value::String("2".into())));
        tuple.push_result(MiResult::new("a", Value::String("1".into())));

        let names: Vec<_> = tuple.as_tuple().unwrap().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(tuple.get("a").and_then(Value::as_string), Some("1"));
        assert!(tuple.get("c").is_none());
    }

    #[test]
    fn test_push_on_wrong_variant_is_ignored() {
        let mut s = Value::String("x".into());
        s.push_item(ListItem::Value(Value::String("y".into())));
        assert_eq!(s, Value::String("x".into()));
    }

    #[test]
    fn test_display_escapes_strings() {
        let value = Value::Tuple(vec![MiResult::new("msg", Value::String("say \"hi\"\n".into()))]);
        assert_eq!(value.to_string(), r#"{msg="say \"hi\"\n"}"#);
    }

    #[test]
    fn test_display_list_items() {
        let value = Value::List(vec![
            ListItem::Value(Value::String("i1".into())),
            ListItem::Result(MiResult::new("frame", Value::Tuple(Vec::new()))),
        ]);
        assert_eq!(value.to_string(), r#"["i1",frame={}]"#);
    }

    #[test]
    fn test_unknown_classes_are_kept() {
        assert_eq!(ResultClass::from_name("weird"), ResultClass::Other("weird".into()));
        assert_eq!(AsyncClass::from_name("cmd-param-changed").as_str(), "cmd-param-changed");
    }
}
