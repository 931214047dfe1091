/// GDB/MI output parser
///
/// This module turns one prompt-terminated batch of GDB/MI output into an
/// [`Output`] parse tree. A batch either parses completely or not at all:
/// on any error the partially built tree is dropped and a [`ParseError`]
/// is returned.

use crate::types::*;
use regex::Regex;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::OnceLock;
use thiserror::Error;

/// Line that terminates every batch of debugger output
pub const PROMPT: &str = "(gdb)";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Expected '{expected}' but found {found:?}")]
    Unexpected { expected: char, found: Option<char> },
    #[error("Unbalanced '{0}'")]
    Unbalanced(char),
    #[error("Empty identifier")]
    EmptyIdentifier,
    #[error("Unknown GDB/MI output format: {0}")]
    UnknownRecord(String),
    #[error("More than one result record in a batch")]
    MultipleResults,
    #[error("Batch is not terminated by the prompt")]
    MissingPrompt,
    #[error("Trailing input after record: {0}")]
    TrailingInput(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

type Cursor<'a> = Peekable<Chars<'a>>;

fn record_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^(\d*)([\^*+=])([A-Za-z0-9_-]+)(.*)$").expect("static regex is valid")
    })
}

/// Parse one complete batch, prompt line included
pub fn parse_output(text: &str) -> Result<Output> {
    let mut output = Output::default();
    let mut terminated = false;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if terminated {
            return Err(ParseError::TrailingInput(line.to_string()));
        }
        if line.trim_end() == PROMPT {
            terminated = true;
            continue;
        }
        match parse_record(line)? {
            Record::Oob(record) => output.oob_records.push(record),
            Record::Result(record) => {
                if output.result.is_some() {
                    return Err(ParseError::MultipleResults);
                }
                output.result = Some(record);
            }
        }
    }

    if !terminated {
        return Err(ParseError::MissingPrompt);
    }
    Ok(output)
}

/// Parse text holding any number of prompt-terminated batches
pub fn parse_outputs(text: &str) -> Result<Vec<Output>> {
    let mut outputs = Vec::new();
    let mut batch = String::new();

    for line in text.lines() {
        batch.push_str(line);
        batch.push('\n');
        if line.trim_end() == PROMPT {
            outputs.push(parse_output(&batch)?);
            batch.clear();
        }
    }

    if !batch.trim().is_empty() {
        return Err(ParseError::MissingPrompt);
    }
    Ok(outputs)
}

enum Record {
    Oob(OobRecord),
    Result(ResultRecord),
}

/// Parse a single non-prompt line
fn parse_record(line: &str) -> Result<Record> {
    if let Some(stream) = parse_stream_record(line)? {
        return Ok(Record::Oob(OobRecord::Stream(stream)));
    }

    let caps = record_header()
        .captures(line)
        .ok_or_else(|| ParseError::UnknownRecord(line.to_string()))?;

    // An empty or oversized token is treated as absent
    let token = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let class = caps.get(3).map_or("", |m| m.as_str());
    let results = parse_results(caps.get(4).map_or("", |m| m.as_str()))?;

    let record = match caps.get(2).map(|m| m.as_str()) {
        Some("^") => Record::Result(ResultRecord {
            token,
            class: ResultClass::from_name(class),
            results,
        }),
        Some(prefix) => {
            let kind = match prefix {
                "*" => AsyncKind::Exec,
                "=" => AsyncKind::Notify,
                _ => AsyncKind::Status,
            };
            Record::Oob(OobRecord::Async(AsyncRecord {
                token,
                kind,
                class: AsyncClass::from_name(class),
                results,
            }))
        }
        None => return Err(ParseError::UnknownRecord(line.to_string())),
    };
    Ok(record)
}

/// Parse a stream record (console, target, or log output)
fn parse_stream_record(line: &str) -> Result<Option<StreamRecord>> {
    let stream_type = match line.chars().next() {
        Some('~') => StreamType::Console,
        Some('@') => StreamType::Target,
        Some('&') => StreamType::Log,
        _ => return Ok(None),
    };

    let mut chars = line[1..].chars().peekable();
    let content = parse_c_string(&mut chars)?;
    expect_end(&mut chars)?;

    Ok(Some(StreamRecord {
        stream_type,
        content,
    }))
}

/// Parse the `,name=value,...` tail of a record
fn parse_results(input: &str) -> Result<Vec<MiResult>> {
    let mut chars = input.chars().peekable();
    let mut results = Vec::new();

    while let Some(&ch) = chars.peek() {
        if ch != ',' {
            return Err(ParseError::TrailingInput(chars.collect()));
        }
        chars.next();
        results.push(parse_result(&mut chars)?);
    }

    Ok(results)
}

fn parse_result(chars: &mut Cursor) -> Result<MiResult> {
    let name = parse_identifier(chars)?;
    expect(chars, '=')?;
    let value = parse_value(chars)?;
    Ok(MiResult { name, value })
}

/// Parse an identifier (key name)
fn parse_identifier(chars: &mut Cursor) -> Result<String> {
    let mut identifier = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            identifier.push(ch);
            chars.next();
        } else {
            break;
        }
    }

    if identifier.is_empty() {
        return Err(ParseError::EmptyIdentifier);
    }

    Ok(identifier)
}

/// Parse a value (string, list, or tuple)
fn parse_value(chars: &mut Cursor) -> Result<Value> {
    match chars.peek() {
        Some('"') => parse_c_string(chars).map(Value::String),
        Some('{') => {
            chars.next();
            let mut tuple = Vec::new();
            if chars.peek() == Some(&'}') {
                chars.next();
                return Ok(Value::Tuple(tuple));
            }
            loop {
                tuple.push(parse_result(chars)?);
                match chars.next() {
                    Some(',') => continue,
                    Some('}') => return Ok(Value::Tuple(tuple)),
                    _ => return Err(ParseError::Unbalanced('{')),
                }
            }
        }
        Some('[') => {
            chars.next();
            let mut list = Vec::new();
            if chars.peek() == Some(&']') {
                chars.next();
                return Ok(Value::List(list));
            }
            loop {
                let item = match chars.peek() {
                    Some('"') | Some('{') | Some('[') => ListItem::Value(parse_value(chars)?),
                    _ => ListItem::Result(parse_result(chars)?),
                };
                list.push(item);
                match chars.next() {
                    Some(',') => continue,
                    Some(']') => return Ok(Value::List(list)),
                    _ => return Err(ParseError::Unbalanced('[')),
                }
            }
        }
        other => Err(ParseError::Unexpected {
            expected: '"',
            found: other.copied(),
        }),
    }
}

/// Parse a C-style quoted string, unescaping its contents
///
/// GDB escapes non-printable bytes as three-digit octal, so the content is
/// collected as bytes and decoded once at the end.
fn parse_c_string(chars: &mut Cursor) -> Result<String> {
    expect(chars, '"')?;
    let mut bytes = Vec::new();
    let mut buf = [0u8; 4];

    loop {
        match chars.next() {
            None => return Err(ParseError::UnterminatedString),
            Some('"') => break,
            Some('\\') => match chars.next() {
                None => return Err(ParseError::UnterminatedString),
                Some('n') => bytes.push(b'\n'),
                Some('t') => bytes.push(b'\t'),
                Some('r') => bytes.push(b'\r'),
                Some('\\') => bytes.push(b'\\'),
                Some('"') => bytes.push(b'"'),
                Some(d @ '0'..='7') => {
                    let mut code = d as u32 - '0' as u32;
                    for _ in 0..2 {
                        match chars.peek() {
                            Some(&d @ '0'..='7') => {
                                code = code * 8 + (d as u32 - '0' as u32);
                                chars.next();
                            }
                            _ => break,
                        }
                    }
                    bytes.push(code as u8);
                }
                Some(other) => {
                    bytes.push(b'\\');
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            },
            Some(ch) => bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes()),
        }
    }

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn expect(chars: &mut Cursor, expected: char) -> Result<()> {
    match chars.next() {
        Some(ch) if ch == expected => Ok(()),
        found => Err(ParseError::Unexpected { expected, found }),
    }
}

fn expect_end(chars: &mut Cursor) -> Result<()> {
    if chars.peek().is_some() {
        return Err(ParseError::TrailingInput(chars.collect()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c_string(input: &str) -> Result<String> {
        parse_c_string(&mut input.chars().peekable())
    }

    #[test]
    fn test_parse_c_string() {
        assert_eq!(c_string("\"Hello\""), Ok("Hello".to_string()));
        assert_eq!(c_string("\"Hello\\nWorld\""), Ok("Hello\nWorld".to_string()));
        assert_eq!(c_string("\"Hello\\\\World\""), Ok("Hello\\World".to_string()));
        assert_eq!(c_string("\"Hello\\\"World\""), Ok("Hello\"World".to_string()));
        assert_eq!(c_string("\"\\033[0m\""), Ok("\u{1b}[0m".to_string()));
        assert_eq!(c_string("\"Hello"), Err(ParseError::UnterminatedString));
        assert!(c_string("Hello").is_err());
    }

    #[test]
    fn test_parse_simple_results() {
        let results = parse_results(",msg=\"test message\"").unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "msg");
        assert_eq!(results[0].value.as_string(), Some("test message"));
    }

    #[test]
    fn test_parse_multiple_results_keeps_order() {
        let results = parse_results(",reason=\"breakpoint-hit\",thread-id=\"1\"").unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(find(&results, "reason").unwrap().as_string(), Some("breakpoint-hit"));
        assert_eq!(results[1].name, "thread-id");
    }

    #[test]
    fn test_parse_tuple_value() {
        let results = parse_results(",bkpt={number=\"1\",type=\"breakpoint\"}").unwrap();

        let bkpt = &results[0].value;
        assert_eq!(bkpt.get("number").unwrap().as_string(), Some("1"));
        assert_eq!(bkpt.get("type").unwrap().as_string(), Some("breakpoint"));
    }

    #[test]
    fn test_parse_list_value() {
        let results = parse_results(",thread-groups=[\"i1\"],frames=[frame={level=\"0\"}],e=[],t={}").unwrap();

        let groups = results[0].value.as_list().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].value().as_string(), Some("i1"));

        let frames = results[1].value.as_list().unwrap();
        assert!(matches!(&frames[0], ListItem::Result(r) if r.name == "frame"));
        assert_eq!(results[2].value, Value::List(Vec::new()));
        assert_eq!(results[3].value, Value::Tuple(Vec::new()));
    }

    #[test]
    fn test_parse_nested_lists() {
        let results = parse_results(",x=[[\"a\"],[{b=\"c\"}]]").unwrap();
        let outer = results[0].value.as_list().unwrap();
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[1].value().as_list().unwrap()[0].value().get("b").unwrap().as_string(), Some("c"));
    }

    #[test]
    fn test_parse_unbalanced() {
        assert_eq!(parse_results(",bkpt={number=\"1\""), Err(ParseError::Unbalanced('{')));
        assert_eq!(parse_results(",groups=[\"i1\""), Err(ParseError::Unbalanced('[')));
        assert!(parse_results(",=\"x\"").is_err());
        assert!(parse_results(",a=b").is_err());
    }

    #[test]
    fn test_parse_output_requires_prompt() {
        assert_eq!(parse_output("^done\n"), Err(ParseError::MissingPrompt));
        assert!(parse_output("^done\n(gdb)\n").is_ok());
        assert!(parse_output("^done\r\n(gdb) \r\n").is_ok());
    }

    #[test]
    fn test_parse_output_rejects_second_result() {
        assert_eq!(
            parse_output("1^done\n2^done\n(gdb)\n"),
            Err(ParseError::MultipleResults)
        );
    }

    #[test]
    fn test_parse_output_token_defaults_to_zero() {
        let output = parse_output("*stopped,reason=\"exited-normally\"\n^done\n(gdb)\n").unwrap();
        match &output.oob_records[0] {
            OobRecord::Async(record) => {
                assert_eq!(record.token, 0);
                assert_eq!(record.kind, AsyncKind::Exec);
                assert_eq!(record.class, AsyncClass::Stopped);
            }
            other => panic!("Expected async record, got {:?}", other),
        }
        assert_eq!(output.result.unwrap().token, 0);
    }

    #[test]
    fn test_parse_status_record() {
        let output = parse_output("+download,section=\".text\"\n(gdb)\n").unwrap();
        match &output.oob_records[0] {
            OobRecord::Async(record) => {
                assert_eq!(record.kind, AsyncKind::Status);
                assert_eq!(record.class, AsyncClass::Other("download".into()));
            }
            other => panic!("Expected async record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_outputs_chains_batches() {
        let text = "1^running\n*running,thread-id=\"all\"\n(gdb)\n*stopped,reason=\"end-stepping-range\"\n(gdb)\n";
        let outputs = parse_outputs(text).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].result.as_ref().unwrap().class, ResultClass::Running);
        assert!(outputs[1].result.is_none());

        assert_eq!(parse_outputs("^done\n(gdb)\n~\"x\"\n"), Err(ParseError::MissingPrompt));
    }

    #[test]
    fn test_unknown_record_format() {
        assert!(matches!(
            parse_output("garbage\n(gdb)\n"),
            Err(ParseError::UnknownRecord(_))
        ));
    }
}
