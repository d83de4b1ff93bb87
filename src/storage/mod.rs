//! Storage Layer
//!
//! The keyspace engine and its supporting pieces:
//!
//! - `keyspace`: the single-owner engine holding values, expiry, blocking-pop
//!   wait queues, WATCH records, pub/sub registries and the mutation log
//! - `zset`: the sorted-set value type
//! - `clock`: the time source seam used by expiry
//! - `glob`: pattern matching for PSUBSCRIBE channels

pub mod clock;
pub mod glob;
pub mod keyspace;
pub mod zset;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keyspace::{
    ConnectionId, Delivery, Keyspace, PopResult, SetCondition, StoreError, SubscriptionAck, Value,
    WatchToken,
};
pub use zset::ZSet;

/// Normalizes an inclusive `[start, stop]` index pair against a sequence of
/// `len` items, Redis-range style: negative indices count from the end, both
/// ends clamp to the sequence, and `None` means the window is empty.
pub(crate) fn slice_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;

    let mut lo = if start < 0 { len + start } else { start };
    let mut hi = if stop < 0 { len + stop } else { stop };

    lo = lo.max(0);
    hi = hi.min(len - 1);

    if lo >= len || hi < 0 || lo > hi {
        return None;
    }
    Some((lo as usize, hi as usize))
}
