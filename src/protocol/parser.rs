//! Incremental Protocol Parser
//!
//! The parser works on whatever bytes have arrived so far and returns:
//!
//! - `Ok(Some((value, consumed)))`: a complete value was decoded from the
//!   first `consumed` bytes
//! - `Ok(None)`: the value is incomplete, wait for more data
//! - `Err(ParseError)`: the bytes can never form a valid value
//!
//! Because an incomplete value is reported rather than guessed at, a frame
//! split across any number of socket reads decodes exactly as if it had
//! arrived in one piece. The connection keeps appending to its buffer and
//! retries until a value comes out.
//!
//! ## Failure modes
//!
//! | Input                                         | Error             |
//! |-----------------------------------------------|-------------------|
//! | a line terminated by a bare `\n`              | `InvalidSyntax`   |
//! | a bulk payload not followed by `\r\n`         | `InvalidSyntax`   |
//! | a length with a non-digit (other than `-1`)   | `MalformedLength` |
//! | a first byte that is not a type prefix        | `UnknownPrefix`   |

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A line does not end in CRLF, or a bulk payload is not followed by one
    #[error("invalid syntax")]
    InvalidSyntax,

    /// A bulk string or array length is not a non-negative decimal or `-1`
    #[error("malformed length")]
    MalformedLength,

    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer value
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Arrays nested deeper than [`MAX_NESTING_DEPTH`]
    #[error("maximum nesting depth exceeded: {0}")]
    NestingTooDeep(usize),

    /// A value exceeds its size limit
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size of a single bulk string (512 MB)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in one array
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum length of a header or simple line
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum array nesting depth
pub const MAX_NESTING_DEPTH: usize = 32;

/// Incremental decoder for protocol values.
///
/// # Example
///
/// ```
/// use kvstore::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let frame = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
///
/// // Half a frame is not an error, just not a value yet
/// assert!(parser.parse(&frame[..10]).unwrap().is_none());
///
/// let (value, consumed) = parser.parse(frame).unwrap().unwrap();
/// assert_eq!(consumed, frame.len());
/// assert_eq!(value, RespValue::bulk_array(["GET", "name"]));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct RespParser;

impl RespParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self
    }

    /// Attempts to decode one value from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        parse_value(buf, 0)
    }
}

fn parse_value(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::NestingTooDeep(MAX_NESTING_DEPTH));
    }

    match buf[0] {
        prefix::SIMPLE_STRING => parse_text(buf, RespValue::SimpleString),
        prefix::ERROR => parse_text(buf, RespValue::Error),
        prefix::INTEGER => parse_integer(buf),
        prefix::BULK_STRING => parse_bulk_string(buf),
        prefix::ARRAY => parse_array(buf, depth),
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Parses `+<text>\r\n` or `-<text>\r\n`.
fn parse_text(
    buf: &[u8],
    wrap: fn(String) -> RespValue,
) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, consumed)) = read_line(&buf[1..])? else {
        return Ok(None);
    };

    let text =
        std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

    Ok(Some((wrap(text.to_string()), 1 + consumed)))
}

/// Parses `:<integer>\r\n`.
fn parse_integer(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, consumed)) = read_line(&buf[1..])? else {
        return Ok(None);
    };

    let n = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))?;

    Ok(Some((RespValue::Integer(n), 1 + consumed)))
}

/// Parses `$<length>\r\n<data>\r\n` or the null `$-1\r\n`.
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, header)) = read_line(&buf[1..])? else {
        return Ok(None);
    };

    let Some(length) = parse_length(line)? else {
        return Ok(Some((RespValue::Null, 1 + header)));
    };

    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let data_start = 1 + header;
    let total = data_start + length + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }

    if &buf[data_start + length..total] != CRLF {
        return Err(ParseError::InvalidSyntax);
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// Parses `*<count>\r\n<elements...>`; the null array `*-1\r\n` decodes to Null.
fn parse_array(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    let Some((line, header)) = read_line(&buf[1..])? else {
        return Ok(None);
    };

    let Some(count) = parse_length(line)? else {
        return Ok(Some((RespValue::Null, 1 + header)));
    };

    if count > MAX_ARRAY_LEN {
        return Err(ParseError::MessageTooLarge {
            size: count,
            max: MAX_ARRAY_LEN,
        });
    }

    let mut elements = Vec::with_capacity(count.min(64));
    let mut consumed = 1 + header;

    for _ in 0..count {
        match parse_value(&buf[consumed..], depth + 1)? {
            Some((value, used)) => {
                elements.push(value);
                consumed += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(elements), consumed)))
}

/// Splits off one line terminated by `\r\n`.
///
/// Returns the line without its terminator and the number of bytes used
/// including the terminator.
fn read_line(buf: &[u8]) -> ParseResult<Option<(&[u8], usize)>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE_LEN {
            return Err(ParseError::MessageTooLarge {
                size: buf.len(),
                max: MAX_LINE_LEN,
            });
        }
        return Ok(None);
    };

    if newline == 0 || buf[newline - 1] != b'\r' {
        return Err(ParseError::InvalidSyntax);
    }

    Ok(Some((&buf[..newline - 1], newline + 1)))
}

/// Parses a length field. `-1` is the null sentinel and yields `None`.
fn parse_length(line: &[u8]) -> ParseResult<Option<usize>> {
    if line == b"-1" {
        return Ok(None);
    }

    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::MalformedLength);
    }

    line.iter()
        .try_fold(0usize, |acc, &b| {
            acc.checked_mul(10)?.checked_add((b - b'0') as usize)
        })
        .map(Some)
        .ok_or(ParseError::MalformedLength)
}

/// Decodes a single value from the front of `buf`.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
