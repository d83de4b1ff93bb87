//! Per-client connection tasks: socket I/O, frame decoding and reply
//! writing. All state lives with the reactor; these tasks are stateless
//! pumps.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, MAX_BUFFER_SIZE};
