//! Transaction State
//!
//! Per-connection MULTI/EXEC bookkeeping. A [`Transaction`] is a queue of
//! deferred commands plus two flags: whether the client is inside a MULTI
//! block, and whether a watched key was modified since WATCH (the dirty
//! flag). The keyspace identifies one transaction instance by its numeric id,
//! so a stale watch firing after the transaction was replaced cannot dirty
//! its successor.
//!
//! The state machine itself lives in the reactor; this type only holds the
//! per-connection record.

/// One transaction instance. Replaced wholesale after EXEC or a reset.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    active: bool,
    dirty: bool,
    queued: Vec<Vec<String>>,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            active: false,
            dirty: false,
            queued: Vec::new(),
        }
    }

    /// The instance id WATCH records are bound to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enters the MULTI block. Returns `false` when already inside one
    /// (MULTI does not nest).
    pub fn begin(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Defers a command for EXEC.
    pub fn queue(&mut self, argv: Vec<String>) {
        self.queued.push(argv);
    }

    /// Marks the transaction doomed: a watched key changed.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Hands the deferred queue to EXEC.
    pub fn take_queued(&mut self) -> Vec<Vec<String>> {
        std::mem::take(&mut self.queued)
    }
}
