//! Splits a request line into the command name and its arguments.
//!
//! Arguments are separated by spaces or tabs; a `"…"` quoted argument
//! preserves whitespace and understands `\\` and `\"` escapes. Embedded NUL
//! and newline bytes are rejected outright.

use crate::protocol::{Ack, AckError, AckResult};

pub fn tokenize(line: &str) -> AckResult<Vec<String>> {
    if line.contains(['\0', '\n', '\r']) {
        return Err(AckError::new(Ack::Arg, "line contains invalid characters"));
    }

    let bytes = line.as_bytes();
    let mut args = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b'"' => {
                let (arg, next) = quoted(line, i + 1)?;
                args.push(arg);
                i = next;
            }
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != b' ' && bytes[i] != b'\t' {
                    i += 1;
                }
                args.push(line[start..i].to_string());
            }
        }
    }

    Ok(args)
}

/// Scan a quoted argument starting just after the opening quote; returns the
/// unescaped text and the index after the closing quote.
fn quoted(line: &str, mut i: usize) -> AckResult<(String, usize)> {
    let bytes = line.as_bytes();
    let mut out = String::new();
    let mut start = i;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => match bytes.get(i + 1) {
                Some(escaped @ (b'\\' | b'"')) => {
                    out.push_str(&line[start..i]);
                    out.push(*escaped as char);
                    i += 2;
                    start = i;
                }
                // a lone backslash stays literal
                _ => i += 1,
            },
            b'"' => {
                out.push_str(&line[start..i]);
                // the quote must end the token
                match bytes.get(i + 1) {
                    None | Some(b' ' | b'\t') => return Ok((out, i + 1)),
                    Some(_) => {
                        return Err(AckError::new(Ack::Arg, "space expected after closing '\"'"));
                    }
                }
            }
            _ => i += 1,
        }
    }

    Err(AckError::new(Ack::Arg, "missing closing '\"'"))
}
