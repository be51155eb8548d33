//! Type-Length-Value framing.
//!
//! An alternative envelope for a single `(type, payload)` pair:
//!
//! ```text
//! ┌──────────────┬────────────────┬─────────────────────┐
//! │ type (N B)   │ length (M B)   │ payload (length B)  │
//! └──────────────┴────────────────┴─────────────────────┘
//! ```
//!
//! Both integers are big-endian with widths of 1, 2, 4 or 8 bytes. The
//! default codec uses a 2-byte type and a 4-byte length.
//!
//! [`Packet`] layers a command on top: the type carries an [`Op`] code and
//! the payload holds the arguments as a command line.

use crate::persistence::line::{split_args, LineError};
use crate::protocol::parser::MAX_BULK_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors from TLV encoding and decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("type {value} does not fit in {width} byte(s)")]
    TypeOverflow { value: u64, width: usize },

    #[error("payload of {len} bytes does not fit a {width}-byte length field")]
    LengthOverflow { len: usize, width: usize },

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("unknown packet op: {0}")]
    UnknownOp(u64),

    #[error("invalid packet arguments: {0}")]
    Args(#[from] LineError),
}

/// Width of a fixed-size integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ByteSize {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl ByteSize {
    /// Field width in bytes.
    #[inline]
    pub fn len(self) -> usize {
        self as usize
    }

    /// Largest value representable in this width.
    pub fn max_value(self) -> u64 {
        match self {
            ByteSize::Eight => u64::MAX,
            width => (1u64 << (8 * width.len())) - 1,
        }
    }
}

/// A decoded TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: u64,
    pub payload: Bytes,
}

impl Record {
    pub fn new(record_type: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            record_type,
            payload: payload.into(),
        }
    }
}

/// Field widths used to encode and decode records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    pub type_bytes: ByteSize,
    pub len_bytes: ByteSize,
}

/// 2-byte type, 4-byte length.
pub const DEFAULT_CODEC: Codec = Codec::new(ByteSize::Two, ByteSize::Four);

impl Default for Codec {
    fn default() -> Self {
        DEFAULT_CODEC
    }
}

impl Codec {
    pub const fn new(type_bytes: ByteSize, len_bytes: ByteSize) -> Self {
        Self {
            type_bytes,
            len_bytes,
        }
    }

    /// Size of the type and length fields together.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.type_bytes.len() + self.len_bytes.len()
    }

    /// Appends the encoded record to `dst`.
    pub fn encode(&self, record: &Record, dst: &mut BytesMut) -> Result<(), TlvError> {
        if record.record_type > self.type_bytes.max_value() {
            return Err(TlvError::TypeOverflow {
                value: record.record_type,
                width: self.type_bytes.len(),
            });
        }

        let len = record.payload.len();
        if len as u64 > self.len_bytes.max_value() {
            return Err(TlvError::LengthOverflow {
                len,
                width: self.len_bytes.len(),
            });
        }

        dst.reserve(self.header_len() + len);
        dst.put_uint(record.record_type, self.type_bytes.len());
        dst.put_uint(len as u64, self.len_bytes.len());
        dst.put_slice(&record.payload);
        Ok(())
    }

    /// Removes one complete record from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched if the record has not
    /// fully arrived yet.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Record>, TlvError> {
        let header = self.header_len();
        if src.len() < header {
            return Ok(None);
        }

        let mut peek = &src[self.type_bytes.len()..header];
        let len = peek.get_uint(self.len_bytes.len());
        if len > MAX_BULK_SIZE as u64 {
            return Err(TlvError::PayloadTooLarge {
                size: len,
                max: MAX_BULK_SIZE,
            });
        }

        let len = len as usize;
        if src.len() < header + len {
            src.reserve(header + len - src.len());
            return Ok(None);
        }

        let record_type = src.get_uint(self.type_bytes.len());
        src.advance(self.len_bytes.len());
        let payload = src.split_to(len).freeze();

        Ok(Some(Record {
            record_type,
            payload,
        }))
    }
}

/// Packet operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Set = 0,
    Get = 1,
    Del = 2,
    List = 3,
    Keys = 4,
}

impl Op {
    /// Command name the op dispatches to.
    pub fn command_name(self) -> &'static str {
        match self {
            Op::Set => "set",
            Op::Get => "get",
            Op::Del => "del",
            Op::List | Op::Keys => "keys",
        }
    }
}

impl TryFrom<u64> for Op {
    type Error = TlvError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Op::Set),
            1 => Ok(Op::Get),
            2 => Ok(Op::Del),
            3 => Ok(Op::List),
            4 => Ok(Op::Keys),
            other => Err(TlvError::UnknownOp(other)),
        }
    }
}

/// A command carried in a TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: Op,
    /// Space-separated arguments, quoted like a log line
    pub args: Bytes,
}

impl Packet {
    pub fn new(op: Op, args: impl Into<Bytes>) -> Self {
        Self {
            op,
            args: args.into(),
        }
    }

    /// Encodes the packet with the default codec.
    pub fn encode(&self) -> Result<Bytes, TlvError> {
        let mut buf = BytesMut::new();
        DEFAULT_CODEC.encode(&Record::new(self.op as u64, self.args.clone()), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes one packet from the front of `src` with the default codec.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, TlvError> {
        match DEFAULT_CODEC.decode(src)? {
            Some(record) => Ok(Some(Self {
                op: Op::try_from(record.record_type)?,
                args: record.payload,
            })),
            None => Ok(None),
        }
    }

    /// Expands the packet into an argument vector, command name first.
    ///
    /// `LIST` takes no arguments and lists every key.
    pub fn into_argv(self) -> Result<Vec<Bytes>, TlvError> {
        let mut argv = vec![Bytes::from_static(self.op.command_name().as_bytes())];

        match self.op {
            Op::List => argv.push(Bytes::from_static(b"*")),
            _ => argv.extend(split_args(&self.args)?),
        }

        Ok(argv)
    }
}
