//! Incremental Request Decoder
//!
//! Requests on the wire are arrays of bulk strings, one array per command:
//!
//! ```text
//! *<argc>\r\n$<len>\r\n<bytes>\r\n...
//! ```
//!
//! TCP is a stream, so the buffer handed to the decoder may hold zero, one,
//! or many complete commands plus a trailing partial one. [`decode_commands`]
//! parses as many complete commands as it can and reports the byte offset
//! just past the last fully parsed command. The caller keeps everything after
//! that offset and prepends it to the next read.
//!
//! Two conditions stop decoding:
//!
//! - **Incomplete**: not enough bytes to finish the current command. Not an
//!   error; wait for more data. When the partial command's headers already
//!   determine its total size, that size is reported (relative to the
//!   unconsumed remainder) so the caller can skip re-decoding a large
//!   in-flight frame until enough bytes have actually arrived.
//! - **Malformed**: the framing itself is wrong (header not `*`, bulk marker
//!   not `$`, bad length, missing CRLF). Reported as a [`FrameError`]
//!   alongside whatever commands decoded cleanly before it; there is no
//!   resynchronization point in this framing, so the connection should be
//!   dropped.

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::types::{prefix, CRLF};

/// One decoded command: its arguments in order, command name first.
pub type CommandArgv = Vec<Bytes>;

/// Maximum size for a single bulk string (512 MB)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum argument count for a single command
pub const MAX_ARGV_LEN: usize = 1024 * 1024;

/// Errors for frames that violate the request grammar.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A command header or bulk marker had the wrong prefix byte
    #[error("expected '{expected}' prefix, found {found:#04x}")]
    UnexpectedPrefix { expected: char, found: u8 },

    /// A length field did not parse as a non-negative integer
    #[error("invalid length field: {0:?}")]
    InvalidLength(String),

    /// A bulk payload was not followed by CRLF
    #[error("bulk payload missing trailing CRLF")]
    MissingTerminator,

    /// A length field exceeded the configured limit
    #[error("frame too large: {size} (max: {max})")]
    TooLarge { size: usize, max: usize },
}

/// The outcome of one decoding pass over a buffer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Complete commands, in arrival order
    pub commands: Vec<CommandArgv>,
    /// Offset just past the last fully parsed command
    pub consumed: usize,
    /// Set when decoding stopped on malformed framing rather than
    /// on an incomplete trailing command
    pub error: Option<FrameError>,
    /// When decoding stopped on an incomplete command whose total size is
    /// already known from its headers: the number of bytes the unconsumed
    /// remainder must reach before the command can complete
    pub needed: Option<usize>,
}

/// Progress of parsing one element from the front of a buffer slice.
enum Progress<T> {
    /// The element and the bytes it occupied
    Complete(T, usize),
    /// More bytes are required; carries the element's total size when its
    /// headers have already been parsed
    Incomplete(Option<usize>),
}

/// Decodes as many complete commands as the buffer holds.
///
/// ```
/// use cinderkv::protocol::decode_commands;
///
/// let decoded = decode_commands(b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET");
/// assert_eq!(decoded.commands.len(), 1);
/// assert_eq!(decoded.consumed, 14);
/// assert!(decoded.error.is_none());
/// ```
pub fn decode_commands(buf: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();

    loop {
        match parse_command(&buf[decoded.consumed..]) {
            Ok(Progress::Complete(argv, used)) => {
                decoded.commands.push(argv);
                decoded.consumed += used;
            }
            Ok(Progress::Incomplete(needed)) => {
                decoded.needed = needed;
                break;
            }
            Err(e) => {
                decoded.error = Some(e);
                break;
            }
        }
    }

    decoded
}

/// Parses a single command from the front of `buf`.
fn parse_command(buf: &[u8]) -> Result<Progress<CommandArgv>, FrameError> {
    if buf.is_empty() {
        return Ok(Progress::Incomplete(None));
    }

    if buf[0] != prefix::ARRAY {
        return Err(FrameError::UnexpectedPrefix {
            expected: '*',
            found: buf[0],
        });
    }

    let (argc, mut offset) = match parse_length(&buf[1..])? {
        Progress::Complete(n, line_used) => (n, 1 + line_used),
        Progress::Incomplete(_) => return Ok(Progress::Incomplete(None)),
    };

    if argc > MAX_ARGV_LEN {
        return Err(FrameError::TooLarge {
            size: argc,
            max: MAX_ARGV_LEN,
        });
    }

    let mut argv = Vec::with_capacity(argc);

    for _ in 0..argc {
        match parse_bulk(&buf[offset..])? {
            Progress::Complete(arg, used) => {
                argv.push(arg);
                offset += used;
            }
            // Size hints from bulks are relative to the bulk; rebase them
            // onto the command start.
            Progress::Incomplete(needed) => {
                return Ok(Progress::Incomplete(needed.map(|n| offset + n)));
            }
        }
    }

    Ok(Progress::Complete(argv, offset))
}

/// Parses one bulk string: `$<len>\r\n<len bytes>\r\n`.
fn parse_bulk(buf: &[u8]) -> Result<Progress<Bytes>, FrameError> {
    if buf.is_empty() {
        return Ok(Progress::Incomplete(None));
    }

    if buf[0] != prefix::BULK {
        return Err(FrameError::UnexpectedPrefix {
            expected: '$',
            found: buf[0],
        });
    }

    let (len, line_used) = match parse_length(&buf[1..])? {
        Progress::Complete(n, used) => (n, used),
        Progress::Incomplete(_) => return Ok(Progress::Incomplete(None)),
    };

    if len > MAX_BULK_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_BULK_SIZE,
        });
    }

    let data_start = 1 + line_used;
    let total = data_start + len + CRLF.len();
    if buf.len() < total {
        return Ok(Progress::Incomplete(Some(total)));
    }

    if &buf[data_start + len..total] != CRLF {
        return Err(FrameError::MissingTerminator);
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + len]);
    Ok(Progress::Complete(data, total))
}

/// Parses a `<digits>\r\n` length line, returning the value and the bytes
/// used including the terminator. Incomplete (with no size hint, since the
/// line itself has no length header) when the terminator has not arrived.
fn parse_length(buf: &[u8]) -> Result<Progress<usize>, FrameError> {
    let pos = match find_crlf(buf) {
        Some(pos) => pos,
        None => return Ok(Progress::Incomplete(None)),
    };

    let line = &buf[..pos];
    let text = std::str::from_utf8(line)
        .map_err(|_| FrameError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;

    let n: usize = text
        .parse()
        .map_err(|_| FrameError::InvalidLength(text.to_string()))?;

    Ok(Progress::Complete(n, pos + CRLF.len()))
}

/// Finds the position of `\r\n` in the buffer, or None.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
