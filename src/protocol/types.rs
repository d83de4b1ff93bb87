//! Wire Response Types
//!
//! This module defines the closed set of shapes a response can take on the
//! wire, and how each one is encoded. The protocol is a Redis-like framing:
//! every reply starts with a one-byte type prefix and every line ends with
//! CRLF (`\r\n`).
//!
//! ## Encodings
//!
//! - Status: `+OK\r\n`
//! - Error: `-ERR unknown command\r\n`
//! - Integer: `:1000\r\n`
//! - Bulk string: `$5\r\nhello\r\n`
//! - Null: `$-1\r\n`
//! - Array: `*2\r\n<element1><element2>`
//!
//! Requests are decoded by [`crate::protocol::parser`]; this type only ever
//! flows server → client. Because the enum is closed and the encoder matches
//! it exhaustively, "encoding an unsupported value" is unrepresentable.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used throughout the wire protocol
pub const CRLF: &[u8] = b"\r\n";

/// Wire protocol type prefixes
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A value encodable as a wire response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Fixed status symbols such as OK, PONG, QUEUED.
    /// Format: `+<STATUS>\r\n`
    Status(&'static str),

    /// Client-facing error. Format: `-<message>\r\n`
    Error(String),

    /// 64-bit signed integer. Format: `:<n>\r\n`
    Integer(i64),

    /// Binary-safe string. Format: `$<len>\r\n<bytes>\r\n`
    Bulk(Bytes),

    /// Null bulk string: `$-1\r\n`
    Null,

    /// Array of replies, recursively encoded.
    /// Format: `*<count>\r\n<elements...>`
    Array(Vec<Reply>),
}

impl Reply {
    /// The `+OK` acknowledgement.
    pub fn ok() -> Self {
        Reply::Status("OK")
    }

    /// The `+PONG` reply to PING.
    pub fn pong() -> Self {
        Reply::Status("PONG")
    }

    /// The `+QUEUED` acknowledgement for commands buffered inside MULTI.
    pub fn queued() -> Self {
        Reply::Status("QUEUED")
    }

    /// Builds an error reply with the conventional `ERR ` prefix.
    pub fn error(message: impl fmt::Display) -> Self {
        Reply::Error(format!("ERR {}", message))
    }

    /// Builds a bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Bulk string from owned text.
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Bulk(Bytes::from(s.into()))
    }

    /// Bulk string or null, for operations that may find nothing.
    pub fn maybe_text(value: Option<String>) -> Self {
        match value {
            Some(v) => Reply::text(v),
            None => Reply::Null,
        }
    }

    /// Integer reply.
    pub fn int(n: i64) -> Self {
        Reply::Integer(n)
    }

    /// Array reply.
    pub fn array(elements: Vec<Reply>) -> Self {
        Reply::Array(elements)
    }

    /// Returns true if this reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Encodes the reply to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes the reply into an existing buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(prefix::STATUS);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(message) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(message.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(data) => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Reply::Null => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            Reply::Array(elements) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for element in elements {
                    element.encode_into(buf);
                }
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(message) => write!(f, "(error) {}", message),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Null => write!(f, "(nil)"),
            Reply::Array(elements) => {
                if elements.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, element) in elements.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, element)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
