//! The Keyspace Engine
//!
//! A single [`Keyspace`] owns every stored value together with all the
//! bookkeeping that command dispatch needs: the expiry table, blocking-pop
//! wait queues, the per-command ready-key queue, the WATCH registry, the
//! pub/sub registries, a delivery outbox and the mutation log.
//!
//! The engine is pure logic: it never touches a socket. Anything that must
//! reach another client (a pub/sub message, a blocking-pop wakeup) is pushed
//! into the outbox as a `(connection, Delivery)` pair for the reactor to
//! route. The engine is only ever mutated from the reactor's single logical
//! execution context, which is the correctness basis for every invariant
//! below: no lock is taken and none is needed.
//!
//! ## Expiry
//!
//! A key in the expiry table maps to an absolute deadline in float seconds
//! from the injected [`Clock`]. Every lookup path first lazily evicts the key
//! if its deadline has passed; [`Keyspace::expire_keys_active`] additionally
//! sweeps the table from the reactor's timer so untouched keys are reclaimed.
//!
//! ## Blocking pops
//!
//! BRPOP/BRPOPLPUSH on an empty list register an explicit waiter record (the
//! connection plus a deferred-action descriptor) in that key's FIFO wait
//! queue and report [`PopResult::Blocked`]. A later LPUSH onto a key with
//! waiters marks it ready; [`Keyspace::drain_list_watches`] runs after every
//! command and pairs queued waiters with available items, in registration
//! order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::storage::clock::Clock;
use crate::storage::glob::glob_match;
use crate::storage::slice_bounds;
use crate::storage::zset::ZSet;

/// Identifies one client connection across the engine's registries.
pub type ConnectionId = u64;

/// Keys sampled from the expiry table per active-sweep round
pub const ACTIVE_EXPIRE_SAMPLE: usize = 100;

/// The sweep keeps going while more than this fraction of a round expired
pub const ACTIVE_EXPIRE_THRESHOLD: f64 = 0.25;

/// Type-level failures raised by keyspace operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key holds a value of the wrong variant for this operation
    #[error("wrong type for command")]
    WrongType,

    /// A stored field was expected to be an integer and is not
    #[error("value is not an integer or out of range")]
    NotAnInteger,
}

/// A stored value. One value per key; operations fail with
/// [`StoreError::WrongType`] when applied to the wrong variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    ZSet(ZSet),
}

/// SET's optional existence condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// NX: only set when the key does not exist
    IfAbsent,
    /// XX: only set when the key already exists
    IfPresent,
}

/// The deferred action a blocked client is waiting to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPop {
    RPop { key: String },
    RPopLPush { source: String, destination: String },
}

#[derive(Debug, Clone)]
struct Waiter {
    conn: ConnectionId,
    action: PendingPop,
}

/// Outcome of a blocking pop attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopResult {
    /// The source had an item; same as the non-blocking variant
    Ready(String),
    /// A waiter was registered; the caller must not reply
    Blocked,
}

/// Identifies one transaction instance for WATCH bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken {
    pub conn: ConnectionId,
    pub tx: u64,
}

/// An out-of-band payload for some connection, queued in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Pub/sub fan-out: `["message", channel, payload]` on the wire
    Message { channel: String, payload: String },
    /// A blocking-pop wakeup carrying the popped value
    Popped { value: String },
    /// A deferred pop that could not run (e.g. the transfer destination
    /// changed type while the client was suspended); the waiter gets an
    /// error reply instead of staying suspended forever
    Failed { error: StoreError },
}

/// Acknowledgement for the four subscription commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    pub action: &'static str,
    pub channel: String,
    pub count: usize,
}

/// The keyspace engine. See the module docs for the ownership story.
pub struct Keyspace {
    data: HashMap<String, Value>,
    expires: HashMap<String, f64>,
    clock: Arc<dyn Clock>,

    waiters: HashMap<String, VecDeque<Waiter>>,
    ready_keys: Vec<String>,

    watches: HashMap<String, Vec<WatchToken>>,
    dirtied: Vec<WatchToken>,

    subscribers: HashMap<String, HashSet<ConnectionId>>,
    psubscribers: HashMap<String, HashSet<ConnectionId>>,
    channels: HashMap<ConnectionId, HashSet<String>>,
    pchannels: HashMap<ConnectionId, HashSet<String>>,

    outbox: Vec<(ConnectionId, Delivery)>,
    log: Vec<Vec<String>>,

    expire_cursor: usize,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("keys", &self.data.len())
            .field("expires", &self.expires.len())
            .field("waiters", &self.waiters.len())
            .field("watches", &self.watches.len())
            .finish()
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    data: &'a HashMap<String, Value>,
    expires: &'a HashMap<String, f64>,
}

#[derive(Deserialize)]
struct Snapshot {
    data: HashMap<String, Value>,
    expires: HashMap<String, f64>,
}

impl Keyspace {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: HashMap::new(),
            expires: HashMap::new(),
            clock,
            waiters: HashMap::new(),
            ready_keys: Vec::new(),
            watches: HashMap::new(),
            dirtied: Vec::new(),
            subscribers: HashMap::new(),
            psubscribers: HashMap::new(),
            channels: HashMap::new(),
            pchannels: HashMap::new(),
            outbox: Vec::new(),
            log: Vec::new(),
            expire_cursor: 0,
        }
    }

    /// Number of live keys. Expired-but-unevicted keys still count until a
    /// lookup or sweep removes them.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ========================================================================
    // Lazy expiry
    // ========================================================================

    /// Removes the key if its expiry deadline has passed. Every read or
    /// write path that observes a key goes through here first.
    fn evict_if_expired(&mut self, key: &str) -> bool {
        if let Some(&deadline) = self.expires.get(key) {
            if self.clock.now() >= deadline {
                self.expires.remove(key);
                self.data.remove(key);
                trace!(key, "lazily evicted expired key");
                return true;
            }
        }
        false
    }

    fn lookup(&mut self, key: &str) -> Option<&Value> {
        self.evict_if_expired(key);
        self.data.get(key)
    }

    fn lookup_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.evict_if_expired(key);
        self.data.get_mut(key)
    }

    /// Probabilistic active sweep: sample up to [`ACTIVE_EXPIRE_SAMPLE`]
    /// keys from the expiry table, evict the expired ones, and repeat while
    /// the expired fraction of the round exceeds
    /// [`ACTIVE_EXPIRE_THRESHOLD`]. A cursor rotates the sampling window
    /// through map iteration order, so successive sweeps cover the whole
    /// table instead of re-examining the same prefix.
    pub fn expire_keys_active(&mut self) -> usize {
        let mut total = 0;

        loop {
            if self.expires.is_empty() {
                break;
            }
            let offset = self.expire_cursor % self.expires.len();
            let sample: Vec<String> = self
                .expires
                .keys()
                .cycle()
                .skip(offset)
                .take(ACTIVE_EXPIRE_SAMPLE.min(self.expires.len()))
                .cloned()
                .collect();
            self.expire_cursor = offset + sample.len();

            let mut expired = 0;
            for key in &sample {
                if self.evict_if_expired(key) {
                    expired += 1;
                }
            }
            total += expired;

            if (expired as f64) <= (sample.len() as f64) * ACTIVE_EXPIRE_THRESHOLD {
                break;
            }
        }

        total
    }

    // ========================================================================
    // Strings and generic key commands
    // ========================================================================

    /// Stores a string value, subject to the NX/XX condition. Returns
    /// `false` when the condition refused the write (a null on the wire).
    /// A successful set clears any expiry and touches the key's watchers.
    pub fn set(&mut self, key: &str, value: &str, condition: SetCondition) -> bool {
        self.evict_if_expired(key);
        let exists = self.data.contains_key(key);

        match condition {
            SetCondition::IfAbsent if exists => return false,
            SetCondition::IfPresent if !exists => return false,
            _ => {}
        }

        self.expires.remove(key);
        self.touch(key);
        self.data.insert(key.to_string(), Value::Str(value.to_string()));
        true
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Removes the given keys; returns how many existed.
    pub fn del(&mut self, keys: &[String]) -> usize {
        let mut removed = 0;
        for key in keys {
            self.evict_if_expired(key);
            self.expires.remove(key);
            if self.data.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Sets an absolute expiry `seconds` from now. Returns `false` when the
    /// key does not exist.
    pub fn expire(&mut self, key: &str, seconds: i64) -> bool {
        self.pexpire(key, seconds.saturating_mul(1000))
    }

    /// Millisecond-resolution variant of [`Keyspace::expire`].
    pub fn pexpire(&mut self, key: &str, millis: i64) -> bool {
        if self.lookup(key).is_none() {
            return false;
        }
        let deadline = self.clock.now() + millis as f64 / 1000.0;
        self.expires.insert(key.to_string(), deadline);
        true
    }

    /// All live keys. Only the match-all pattern is supported; anything
    /// else is a programming error at this layer, not a client error.
    pub fn keys(&mut self, pattern: &str) -> Vec<String> {
        if pattern != "*" {
            unimplemented!("KEYS supports only the '*' pattern");
        }

        let stale: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, &deadline)| self.clock.now() >= deadline)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.evict_if_expired(&key);
        }

        self.data.keys().cloned().collect()
    }

    // ========================================================================
    // Hashes
    // ========================================================================

    /// Sets a hash field, creating the hash lazily.
    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.evict_if_expired(key);
        let slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        let Value::Hash(hash) = slot else {
            return Err(StoreError::WrongType);
        };
        hash.insert(field.to_string(), value.to_string());
        Ok(())
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Fetches several fields at once; a missing key yields all-null.
    pub fn hmget(&mut self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        match self.lookup(key) {
            None => Ok(fields.iter().map(|_| None).collect()),
            Some(Value::Hash(hash)) => {
                Ok(fields.iter().map(|f| hash.get(f).cloned()).collect())
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Adds `delta` to an integer hash field (absent field counts as 0).
    /// Returns `None` when the key itself does not exist.
    pub fn hincrby(
        &mut self,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<Option<i64>, StoreError> {
        let Some(value) = self.lookup_mut(key) else {
            return Ok(None);
        };
        let Value::Hash(hash) = value else {
            return Err(StoreError::WrongType);
        };

        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger)?,
            None => 0,
        };
        let next = current.saturating_add(delta);
        hash.insert(field.to_string(), next.to_string());
        Ok(Some(next))
    }

    // ========================================================================
    // Lists
    // ========================================================================

    /// Prepends a value, creating the list lazily. Marks the key ready when
    /// blocked clients are waiting on it, touches watchers, and returns the
    /// new length.
    pub fn lpush(&mut self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.evict_if_expired(key);
        let len = {
            let slot = self
                .data
                .entry(key.to_string())
                .or_insert_with(|| Value::List(VecDeque::new()));
            let Value::List(list) = slot else {
                return Err(StoreError::WrongType);
            };
            list.push_front(value.to_string());
            list.len()
        };

        if self.waiters.get(key).is_some_and(|queue| !queue.is_empty()) {
            self.ready_keys.push(key.to_string());
        }
        self.touch(key);
        Ok(len)
    }

    pub fn llen(&mut self, key: &str) -> Result<usize, StoreError> {
        match self.lookup(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Removes and returns the last element; touches watchers when an
    /// element was actually removed.
    pub fn rpop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let popped = match self.lookup_mut(key) {
            None => None,
            Some(Value::List(list)) => list.pop_back(),
            Some(_) => return Err(StoreError::WrongType),
        };
        if popped.is_some() {
            self.touch(key);
        }
        Ok(popped)
    }

    /// Inclusive, clamped index slice; negative indices count from the end.
    /// A missing key or an out-of-range window yields an empty sequence.
    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        match self.lookup(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                let Some((lo, hi)) = slice_bounds(list.len(), start, stop) else {
                    return Ok(Vec::new());
                };
                Ok(list.iter().skip(lo).take(hi - lo + 1).cloned().collect())
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Pops the last element of `source` and prepends it to `destination`
    /// within one dispatch. With `source == destination` this rotates the
    /// list left by one. The destination's type is checked before anything
    /// is popped, so a refused transfer leaves the source intact.
    pub fn rpoplpush(
        &mut self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        self.evict_if_expired(destination);
        if matches!(self.data.get(destination), Some(value) if !matches!(value, Value::List(_))) {
            return Err(StoreError::WrongType);
        }
        let Some(item) = self.rpop(source)? else {
            return Ok(None);
        };
        self.lpush(destination, &item)?;
        Ok(Some(item))
    }

    // ========================================================================
    // Blocking pops
    // ========================================================================

    /// BRPOP: pops immediately when the source has an item, otherwise
    /// registers a FIFO waiter for the key and reports `Blocked`. The
    /// timeout argument is accepted by the command layer but not enforced.
    pub fn brpop(&mut self, key: &str, conn: ConnectionId) -> Result<PopResult, StoreError> {
        match self.rpop(key)? {
            Some(value) => Ok(PopResult::Ready(value)),
            None => {
                self.register_waiter(
                    key,
                    Waiter {
                        conn,
                        action: PendingPop::RPop {
                            key: key.to_string(),
                        },
                    },
                );
                Ok(PopResult::Blocked)
            }
        }
    }

    /// BRPOPLPUSH: like [`Keyspace::brpop`] but the deferred action is the
    /// two-list transfer.
    pub fn brpoplpush(
        &mut self,
        source: &str,
        destination: &str,
        conn: ConnectionId,
    ) -> Result<PopResult, StoreError> {
        match self.rpoplpush(source, destination)? {
            Some(value) => Ok(PopResult::Ready(value)),
            None => {
                self.register_waiter(
                    source,
                    Waiter {
                        conn,
                        action: PendingPop::RPopLPush {
                            source: source.to_string(),
                            destination: destination.to_string(),
                        },
                    },
                );
                Ok(PopResult::Blocked)
            }
        }
    }

    fn register_waiter(&mut self, key: &str, waiter: Waiter) {
        self.waiters
            .entry(key.to_string())
            .or_default()
            .push_back(waiter);
    }

    /// Pairs ready keys with their queued waiters, front-of-queue first,
    /// queueing each result in the outbox. Runs after every fully processed
    /// command and loops to a fixpoint so that a wakeup whose deferred
    /// RPOPLPUSH feeds another watched key is delivered in the same cycle.
    pub fn drain_list_watches(&mut self) {
        while !self.ready_keys.is_empty() {
            let ready = std::mem::take(&mut self.ready_keys);

            for key in ready {
                loop {
                    let has_items =
                        matches!(self.data.get(&key), Some(Value::List(list)) if !list.is_empty());
                    if !has_items {
                        break;
                    }
                    let Some(waiter) = self
                        .waiters
                        .get_mut(&key)
                        .and_then(|queue| queue.pop_front())
                    else {
                        break;
                    };

                    let result = match &waiter.action {
                        PendingPop::RPop { key } => self.rpop(key),
                        PendingPop::RPopLPush {
                            source,
                            destination,
                        } => self.rpoplpush(source, destination),
                    };

                    match result {
                        Ok(Some(value)) => {
                            self.log_deferred(&waiter.action);
                            self.outbox.push((waiter.conn, Delivery::Popped { value }));
                        }
                        Ok(None) => {}
                        // The item stays in its source list; the waiter is
                        // unblocked with the error rather than starved.
                        Err(error) => {
                            self.outbox.push((waiter.conn, Delivery::Failed { error }));
                        }
                    }
                }

                if self.waiters.get(&key).is_some_and(|queue| queue.is_empty()) {
                    self.waiters.remove(&key);
                }
            }
        }
    }

    // ========================================================================
    // Sorted sets
    // ========================================================================

    /// Adds or updates a member; the sorted set is created lazily.
    /// Returns `true` when the member was new.
    pub fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        self.evict_if_expired(key);
        let slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(ZSet::new()));
        let Value::ZSet(zset) = slot else {
            return Err(StoreError::WrongType);
        };
        Ok(zset.add(score, member))
    }

    pub fn zrank(&mut self, key: &str, member: &str) -> Result<Option<usize>, StoreError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(zset.rank(member)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(zset.score(member)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        match self.lookup(key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => Ok(zset.range(start, stop)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    // ========================================================================
    // Watches (optimistic locking)
    // ========================================================================

    /// Registers a watch record for the key, bound to one transaction
    /// instance. The record is one-shot: the first touch of the key clears
    /// the whole watcher list and queues the tokens as dirtied.
    pub fn watch(&mut self, key: &str, token: WatchToken) {
        self.watches.entry(key.to_string()).or_default().push(token);
    }

    /// Tokens dirtied since the last call. The reactor reconciles these
    /// against each connection's current transaction.
    pub fn take_dirtied(&mut self) -> Vec<WatchToken> {
        std::mem::take(&mut self.dirtied)
    }

    /// Fires and clears the key's watchers. Called from every successful
    /// mutation path, never from reads.
    fn touch(&mut self, key: &str) {
        if let Some(tokens) = self.watches.remove(key) {
            self.dirtied.extend(tokens);
        }
    }

    // ========================================================================
    // Pub/sub
    // ========================================================================

    pub fn subscribe(&mut self, channel: &str, conn: ConnectionId) -> SubscriptionAck {
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .insert(conn);
        self.channels
            .entry(conn)
            .or_default()
            .insert(channel.to_string());
        self.ack("subscribe", channel, conn)
    }

    pub fn unsubscribe(&mut self, channel: &str, conn: ConnectionId) -> SubscriptionAck {
        if let Some(subs) = self.subscribers.get_mut(channel) {
            subs.remove(&conn);
            if subs.is_empty() {
                self.subscribers.remove(channel);
            }
        }
        if let Some(channels) = self.channels.get_mut(&conn) {
            channels.remove(channel);
        }
        self.ack("unsubscribe", channel, conn)
    }

    pub fn psubscribe(&mut self, pattern: &str, conn: ConnectionId) -> SubscriptionAck {
        self.psubscribers
            .entry(pattern.to_string())
            .or_default()
            .insert(conn);
        self.pchannels
            .entry(conn)
            .or_default()
            .insert(pattern.to_string());
        self.ack("psubscribe", pattern, conn)
    }

    pub fn punsubscribe(&mut self, pattern: &str, conn: ConnectionId) -> SubscriptionAck {
        if let Some(subs) = self.psubscribers.get_mut(pattern) {
            subs.remove(&conn);
            if subs.is_empty() {
                self.psubscribers.remove(pattern);
            }
        }
        if let Some(patterns) = self.pchannels.get_mut(&conn) {
            patterns.remove(pattern);
        }
        self.ack("punsubscribe", pattern, conn)
    }

    fn ack(&self, action: &'static str, channel: &str, conn: ConnectionId) -> SubscriptionAck {
        SubscriptionAck {
            action,
            channel: channel.to_string(),
            count: self.subscription_count(conn),
        }
    }

    /// Total exact plus pattern subscriptions held by one connection.
    pub fn subscription_count(&self, conn: ConnectionId) -> usize {
        self.channels.get(&conn).map_or(0, HashSet::len)
            + self.pchannels.get(&conn).map_or(0, HashSet::len)
    }

    /// Fans a message out to the channel's exact subscribers and to the
    /// subscribers of every pattern that matches it, via the outbox.
    /// Returns the number of connections the message was queued for.
    pub fn publish(&mut self, channel: &str, message: &str) -> usize {
        let mut targets: Vec<ConnectionId> = Vec::new();
        let mut seen = HashSet::new();

        if let Some(subs) = self.subscribers.get(channel) {
            for &conn in subs {
                if seen.insert(conn) {
                    targets.push(conn);
                }
            }
        }
        for (pattern, subs) in &self.psubscribers {
            if glob_match(pattern, channel) {
                for &conn in subs {
                    if seen.insert(conn) {
                        targets.push(conn);
                    }
                }
            }
        }

        for conn in &targets {
            self.outbox.push((
                *conn,
                Delivery::Message {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                },
            ));
        }
        targets.len()
    }

    // ========================================================================
    // Connection lifecycle, outbox, mutation log
    // ========================================================================

    /// Removes every trace of a connection: wait-queue entries, watch
    /// records, subscriptions and undelivered outbox entries. A released
    /// connection can never be woken or published to again.
    pub fn release_connection(&mut self, conn: ConnectionId) {
        for queue in self.waiters.values_mut() {
            queue.retain(|waiter| waiter.conn != conn);
        }
        self.waiters.retain(|_, queue| !queue.is_empty());

        for tokens in self.watches.values_mut() {
            tokens.retain(|token| token.conn != conn);
        }
        self.watches.retain(|_, tokens| !tokens.is_empty());
        self.dirtied.retain(|token| token.conn != conn);

        if let Some(channels) = self.channels.remove(&conn) {
            for channel in channels {
                if let Some(subs) = self.subscribers.get_mut(&channel) {
                    subs.remove(&conn);
                    if subs.is_empty() {
                        self.subscribers.remove(&channel);
                    }
                }
            }
        }
        if let Some(patterns) = self.pchannels.remove(&conn) {
            for pattern in patterns {
                if let Some(subs) = self.psubscribers.get_mut(&pattern) {
                    subs.remove(&conn);
                    if subs.is_empty() {
                        self.psubscribers.remove(&pattern);
                    }
                }
            }
        }

        self.outbox.retain(|(target, _)| *target != conn);
    }

    /// Drains the queued out-of-band deliveries.
    pub fn take_outbox(&mut self) -> Vec<(ConnectionId, Delivery)> {
        std::mem::take(&mut self.outbox)
    }

    /// Appends an applied mutating command to the log; an external writer
    /// serializes entries to wire format and persists them.
    pub fn log_command(&mut self, argv: &[String]) {
        self.log.push(argv.to_vec());
    }

    fn log_deferred(&mut self, action: &PendingPop) {
        let argv = match action {
            PendingPop::RPop { key } => vec!["rpop".to_string(), key.clone()],
            PendingPop::RPopLPush {
                source,
                destination,
            } => vec![
                "rpoplpush".to_string(),
                source.clone(),
                destination.clone(),
            ],
        };
        self.log.push(argv);
    }

    /// Drains the mutation log.
    pub fn take_log(&mut self) -> Vec<Vec<String>> {
        std::mem::take(&mut self.log)
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Serializes the entire keyspace plus expiry table. Used by an
    /// external background-save mechanism operating on a copy of the state,
    /// never concurrently with command dispatch.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SnapshotRef {
            data: &self.data,
            expires: &self.expires,
        })
    }

    /// Replaces the keyspace and expiry table from a serialized snapshot.
    /// Registries (waiters, watches, subscriptions) are connection state
    /// and are left untouched.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<(), serde_json::Error> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        self.data = snapshot.data;
        self.expires = snapshot.expires;
        Ok(())
    }
}
