//! Command Layer
//!
//! - `table`: the static command table, argv validation and dispatch
//! - `transaction`: per-connection MULTI/EXEC/WATCH state

pub mod table;
pub mod transaction;

pub use table::{dispatch, CommandError, Dispatch, DispatchMode};
pub use transaction::Transaction;
