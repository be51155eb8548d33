//! Wire Protocol
//!
//! Two envelopes are provided:
//!
//! - **RESP-like** (`types`, `parser`): typed, CRLF-terminated values. This
//!   is what the server speaks on the wire; a command is an array of bulk
//!   strings and every reply is exactly one value.
//! - **TLV** (`tlv`): `[type][length][payload]` records with configurable
//!   big-endian field widths, plus the `Packet` command envelope built on
//!   top of it.
//!
//! ## Example
//!
//! ```
//! use kvstore::protocol::{encode_command, parse_message, RespValue};
//!
//! let frame = encode_command(["SET", "name", "kvstore"]);
//! let (value, consumed) = parse_message(&frame).unwrap().unwrap();
//!
//! assert_eq!(consumed, frame.len());
//! assert_eq!(value, RespValue::bulk_array(["SET", "name", "kvstore"]));
//! ```

pub mod parser;
pub mod tlv;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_command, RespValue};
