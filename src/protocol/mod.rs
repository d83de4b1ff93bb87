//! Wire Protocol Implementation
//!
//! A Redis-like, CRLF-terminated framing with five reply shapes and a single
//! request shape (arrays of bulk strings).
//!
//! ## Modules
//!
//! - `types`: the closed [`Reply`] sum type and its byte-stable encoder
//! - `parser`: incremental request decoder with a consumed-bytes cursor
//!
//! ## Example
//!
//! ```
//! use cinderkv::protocol::{decode_commands, Reply};
//!
//! let decoded = decode_commands(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//! assert_eq!(decoded.commands.len(), 1);
//!
//! let response = Reply::bulk("value");
//! assert_eq!(response.encode(), b"$5\r\nvalue\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{decode_commands, CommandArgv, Decoded, FrameError};
pub use types::Reply;
