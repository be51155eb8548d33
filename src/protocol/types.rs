//! Wire Value Types
//!
//! Every value exchanged with a client is one of the tagged types below.
//! Each starts with a type prefix byte and line-oriented parts end in CRLF:
//!
//! | Type          | Prefix | Example                              |
//! |---------------|--------|--------------------------------------|
//! | Simple String | `+`    | `+OK\r\n`                            |
//! | Error         | `-`    | `-ERR unknown command 'foo'\r\n`     |
//! | Integer       | `:`    | `:1000\r\n`                          |
//! | Bulk String   | `$`    | `$5\r\nhello\r\n`                    |
//! | Null          | `$`    | `$-1\r\n`                            |
//! | Array         | `*`    | `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`  |
//!
//! Booleans travel as the integers `1` and `0`.

use bytes::Bytes;

/// The CRLF terminator
pub const CRLF: &[u8] = b"\r\n";

/// Type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single protocol value.
///
/// Used both for decoded requests and for replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe line of text. Cannot contain CR or LF.
    SimpleString(String),

    /// Error reply, conventionally prefixed with an error kind (`ERR ...`).
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe string.
    BulkString(Bytes),

    /// The null bulk string (`$-1\r\n`). A null array (`*-1\r\n`) decodes
    /// to this as well.
    Null,

    /// Ordered sequence of values, possibly nested.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a simple string reply.
    ///
    /// # Example
    /// ```
    /// use kvstore::protocol::RespValue;
    /// assert_eq!(RespValue::simple_string("OK").serialize(), b"+OK\r\n");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates an integer reply.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a bulk string reply.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates the null reply.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array reply.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Creates an array of bulk strings.
    pub fn bulk_array<I, B>(items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        RespValue::Array(items.into_iter().map(RespValue::bulk_string).collect())
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the value to its wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns the text of a SimpleString, or of a BulkString holding UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the payload of a BulkString.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the elements of an Array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the elements of an Array.
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the bytes of a string-like value.
    ///
    /// Integers are rendered in decimal so clients may send numeric
    /// arguments either way.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(Bytes::from(s)),
            RespValue::Integer(n) => Some(Bytes::from(n.to_string())),
            _ => None,
        }
    }
}

#[inline]
fn write_line(buf: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    buf.push(prefix);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

/// Encodes a command as an array of bulk strings, the form clients send.
///
/// # Example
/// ```
/// use kvstore::protocol::encode_command;
/// assert_eq!(
///     encode_command(["GET", "name"]),
///     b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n".to_vec()
/// );
/// ```
pub fn encode_command<I, A>(args: I) -> Vec<u8>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let args: Vec<A> = args.into_iter().collect();
    let mut buf = Vec::new();

    write_line(&mut buf, prefix::ARRAY, args.len().to_string().as_bytes());
    for arg in &args {
        let arg = arg.as_ref();
        write_line(&mut buf, prefix::BULK_STRING, arg.len().to_string().as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }

    buf
}
