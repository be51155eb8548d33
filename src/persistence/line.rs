//! Textual command lines.
//!
//! The append-only log stores one command per line: the lower-cased command
//! name followed by its arguments, separated by single spaces. Arguments
//! that would not survive a whitespace split (empty ones, or ones holding
//! whitespace, quotes, backslashes or non-printable bytes) are written in
//! double quotes with escapes:
//!
//! ```text
//! set greeting "hello world"
//! set blob "\x00\xff\r\n"
//! del "user:*"
//! ```
//!
//! [`split_args`] parses the same grammar back into an argument vector, so
//! `split_args(&format_command(argv)) == argv` for any arguments.

use bytes::Bytes;
use thiserror::Error;

/// A line that cannot be split into arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("unbalanced quotes")]
    UnbalancedQuotes,

    #[error("closing quote must be followed by a space")]
    TrailingAfterQuote,

    #[error("invalid escape sequence")]
    InvalidEscape,
}

/// Formats a command as a single log line (without the trailing newline).
pub fn format_command<A: AsRef<[u8]>>(argv: &[A]) -> Vec<u8> {
    let mut line = Vec::new();

    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            line.push(b' ');
        }

        let arg = arg.as_ref();
        if i == 0 {
            // Command names are plain words
            line.extend(arg.iter().map(u8::to_ascii_lowercase));
        } else if needs_quotes(arg) {
            write_quoted(&mut line, arg);
        } else {
            line.extend_from_slice(arg);
        }
    }

    line
}

fn needs_quotes(arg: &[u8]) -> bool {
    arg.is_empty()
        || arg
            .iter()
            .any(|&b| !b.is_ascii_graphic() || b == b'"' || b == b'\\' || b == b'\'')
}

fn write_quoted(line: &mut Vec<u8>, arg: &[u8]) {
    line.push(b'"');
    for &b in arg {
        match b {
            b'"' => line.extend_from_slice(b"\\\""),
            b'\\' => line.extend_from_slice(b"\\\\"),
            b'\n' => line.extend_from_slice(b"\\n"),
            b'\r' => line.extend_from_slice(b"\\r"),
            b'\t' => line.extend_from_slice(b"\\t"),
            b' ' => line.push(b' '),
            b if b.is_ascii_graphic() => line.push(b),
            b => line.extend_from_slice(format!("\\x{:02x}", b).as_bytes()),
        }
    }
    line.push(b'"');
}

/// Splits a command line into its arguments.
///
/// Leading, trailing and repeated whitespace is ignored. A blank line
/// yields an empty vector.
pub fn split_args(line: &[u8]) -> Result<Vec<Bytes>, LineError> {
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            return Ok(args);
        }

        let mut current = Vec::new();
        if line[i] == b'"' {
            i += 1;
            loop {
                match line.get(i) {
                    None => return Err(LineError::UnbalancedQuotes),
                    Some(b'"') => {
                        i += 1;
                        if line.get(i).is_some_and(|b| !b.is_ascii_whitespace()) {
                            return Err(LineError::TrailingAfterQuote);
                        }
                        break;
                    }
                    Some(b'\\') => {
                        let (byte, used) = unescape(&line[i + 1..])?;
                        current.push(byte);
                        i += 1 + used;
                    }
                    Some(&b) => {
                        current.push(b);
                        i += 1;
                    }
                }
            }
        } else {
            while i < line.len() && !line[i].is_ascii_whitespace() {
                current.push(line[i]);
                i += 1;
            }
        }

        args.push(Bytes::from(current));
    }
}

/// Decodes the escape following a backslash. Returns the byte and the
/// number of input bytes used.
fn unescape(rest: &[u8]) -> Result<(u8, usize), LineError> {
    match rest.first() {
        None => Err(LineError::UnbalancedQuotes),
        Some(b'n') => Ok((b'\n', 1)),
        Some(b'r') => Ok((b'\r', 1)),
        Some(b't') => Ok((b'\t', 1)),
        Some(b'x') => {
            let hex = rest.get(1..3).ok_or(LineError::InvalidEscape)?;
            let hex = std::str::from_utf8(hex).map_err(|_| LineError::InvalidEscape)?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| LineError::InvalidEscape)?;
            Ok((byte, 3))
        }
        Some(&other) => Ok((other, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&[u8]]) -> Vec<Bytes> {
        items.iter().map(|a| Bytes::copy_from_slice(a)).collect()
    }

    #[test]
    fn test_format_plain() {
        let line = format_command(&["SET", "key", "value"]);
        assert_eq!(line, b"set key value");
    }

    #[test]
    fn test_format_quotes_when_needed() {
        let line = format_command(&[&b"set"[..], b"greeting", b"hello world"]);
        assert_eq!(line, b"set greeting \"hello world\"");

        let line = format_command(&[&b"set"[..], b"k", b""]);
        assert_eq!(line, b"set k \"\"");

        let line = format_command(&[&b"set"[..], b"k", b"a\"b\\c\n\x00\xff"]);
        assert_eq!(line, b"set k \"a\\\"b\\\\c\\n\\x00\\xff\"");
    }

    #[test]
    fn test_split_plain() {
        assert_eq!(
            split_args(b"  set   key value  ").unwrap(),
            args(&[b"set", b"key", b"value"])
        );
        assert!(split_args(b"").unwrap().is_empty());
        assert!(split_args(b"   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_quoted() {
        assert_eq!(
            split_args(b"set k \"hello world\" \"\"").unwrap(),
            args(&[b"set", b"k", b"hello world", b""])
        );
        assert_eq!(
            split_args(b"set k \"\\x41\\t\\\"\"").unwrap(),
            args(&[b"set", b"k", b"A\t\""])
        );
    }

    #[test]
    fn test_split_errors() {
        assert_eq!(split_args(b"set k \"open"), Err(LineError::UnbalancedQuotes));
        assert_eq!(split_args(b"set k \"a\"b"), Err(LineError::TrailingAfterQuote));
        assert_eq!(split_args(b"set k \"\\xZZ\""), Err(LineError::InvalidEscape));
    }

    #[test]
    fn test_format_then_split() {
        let argv = args(&[b"set", b"weird key", b"\x00\x01\x02\r\n\t \"'\\", b"", b"plain"]);
        let line = format_command(&argv);

        assert!(!line.contains(&b'\n'));
        assert_eq!(split_args(&line).unwrap(), argv);
    }
}
