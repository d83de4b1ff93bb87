//! The Reactor
//!
//! One task owns the [`Keyspace`] and every per-connection session record.
//! Connection handlers never touch shared state: they forward decoded
//! commands over an mpsc queue as [`EngineMessage`]s and receive replies on
//! their own channel. The queue's single consumer is this task, so commands
//! from all connections execute strictly one at a time and the keyspace
//! needs no locking at all.
//!
//! The reply channel registered at connect time carries everything a
//! connection can be sent: direct command replies, pub/sub messages and
//! blocking-pop wakeups, already ordered by the reactor.
//!
//! ## Command cycle
//!
//! Each command runs through a fixed sequence: execute (or queue, inside
//! MULTI), flush keyspace deliveries, send the reply unless the client
//! blocked, drain list watches to a fixpoint, flush again, then reconcile
//! dirtied watch tokens against their transactions. Pub/sub fan-out from a
//! PUBLISH is therefore delivered before the publisher sees its receiver
//! count, and a blocked client woken by an LPUSH gets its value in the same
//! cycle as the push.
//!
//! A 100ms timer drives the active expiry sweep between commands.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::commands::{dispatch, CommandError, Dispatch, DispatchMode, Transaction};
use crate::protocol::{decode_commands, Reply};
use crate::storage::{ConnectionId, Delivery, Keyspace, WatchToken};

/// Reserved id for log replay; it never has a session, so replies from
/// replayed commands are discarded.
pub const REPLAY_CONNECTION: ConnectionId = 0;

/// Everything a connection handler can ask of the engine.
#[derive(Debug)]
pub enum EngineMessage {
    /// A new connection and the channel its replies go out on
    Connect {
        id: ConnectionId,
        replies: mpsc::UnboundedSender<Reply>,
    },
    /// One decoded command from the connection
    Command { id: ConnectionId, argv: Vec<Bytes> },
    /// The connection went away; release all of its engine state
    Disconnect { id: ConnectionId },
}

struct Session {
    replies: mpsc::UnboundedSender<Reply>,
    tx: Transaction,
}

/// The single owner of the keyspace and all sessions.
pub struct Reactor {
    keyspace: Keyspace,
    sessions: HashMap<ConnectionId, Session>,
    next_tx_id: u64,
}

impl Reactor {
    pub fn new(keyspace: Keyspace) -> Self {
        Self {
            keyspace,
            sessions: HashMap::new(),
            next_tx_id: 1,
        }
    }

    /// Runs until every message sender is dropped or shutdown is signalled.
    pub async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<EngineMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_millis(100));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = sweep.tick() => {
                    let evicted = self.keyspace.expire_keys_active();
                    if evicted > 0 {
                        debug!(evicted, "active expiry sweep");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("reactor shutting down");
                    break;
                }
            }
        }
    }

    /// Processes one engine message. Separated from [`Reactor::run`] so
    /// tests can drive the reactor synchronously.
    pub(crate) fn handle(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Connect { id, replies } => {
                trace!(conn = id, "session registered");
                let tx = self.new_transaction();
                self.sessions.insert(id, Session { replies, tx });
            }
            EngineMessage::Disconnect { id } => {
                trace!(conn = id, "session released");
                self.sessions.remove(&id);
                self.keyspace.release_connection(id);
            }
            EngineMessage::Command { id, argv } => match decode_argv(argv) {
                Ok(argv) => self.handle_command(id, argv),
                Err(()) => self.send(id, Reply::error("invalid argument encoding")),
            },
        }
    }

    fn handle_command(&mut self, conn: ConnectionId, argv: Vec<String>) {
        if argv.is_empty() {
            return;
        }

        let reply = self.exec_command(conn, &argv);
        self.flush_outbox();
        if let Some(reply) = reply {
            self.send(conn, reply);
        }

        self.keyspace.drain_list_watches();
        self.flush_outbox();
        self.reconcile_dirty();
    }

    /// Executes one command for a connection, routing MULTI/EXEC/WATCH to
    /// the transaction state machine and everything else through the
    /// command table (or the transaction queue when one is open). `None`
    /// means the client blocked and must not be replied to.
    fn exec_command(&mut self, conn: ConnectionId, argv: &[String]) -> Option<Reply> {
        match argv[0].to_ascii_lowercase().as_str() {
            "multi" => {
                let session = self.sessions.get_mut(&conn)?;
                if session.tx.begin() {
                    Some(Reply::ok())
                } else {
                    Some(Reply::error("MULTI calls can not be nested"))
                }
            }

            "exec" => {
                let (dirty, queued) = {
                    let session = self.sessions.get_mut(&conn)?;
                    if !session.tx.is_active() {
                        return Some(Reply::error("EXEC without MULTI"));
                    }
                    (session.tx.is_dirty(), session.tx.take_queued())
                };

                // The transaction is spent either way; watches bound to the
                // old id can no longer dirty anything.
                let fresh = self.new_transaction();
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.tx = fresh;
                }

                if dirty {
                    return Some(Reply::Null);
                }

                let mut replies = Vec::with_capacity(queued.len());
                for queued_argv in &queued {
                    let reply = match dispatch(
                        &mut self.keyspace,
                        conn,
                        queued_argv,
                        DispatchMode::InExec,
                    ) {
                        Dispatch::Reply(reply) => reply,
                        // InExec never blocks; the table degrades blocking
                        // pops to their plain forms.
                        Dispatch::Blocked => Reply::Null,
                    };
                    replies.push(reply);
                }
                Some(Reply::array(replies))
            }

            "watch" => {
                if argv.len() < 2 {
                    return Some(Reply::error(
                        "wrong number of arguments for 'watch' command",
                    ));
                }
                let tx_id = {
                    let session = self.sessions.get(&conn)?;
                    if session.tx.is_active() {
                        return Some(Reply::error("WATCH inside MULTI is not allowed"));
                    }
                    session.tx.id()
                };
                for key in &argv[1..] {
                    self.keyspace.watch(key, WatchToken { conn, tx: tx_id });
                }
                Some(Reply::ok())
            }

            _ => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    if session.tx.is_active() {
                        session.tx.queue(argv.to_vec());
                        return Some(Reply::queued());
                    }
                }
                match dispatch(&mut self.keyspace, conn, argv, DispatchMode::Direct) {
                    Dispatch::Reply(reply) => Some(reply),
                    Dispatch::Blocked => None,
                }
            }
        }
    }

    /// Routes queued keyspace deliveries to their sessions.
    fn flush_outbox(&mut self) {
        for (conn, delivery) in self.keyspace.take_outbox() {
            let reply = match delivery {
                Delivery::Message { channel, payload } => Reply::array(vec![
                    Reply::bulk("message"),
                    Reply::text(channel),
                    Reply::text(payload),
                ]),
                Delivery::Popped { value } => Reply::text(value),
                Delivery::Failed { error } => {
                    Reply::Error(CommandError::from(error).to_string())
                }
            };
            self.send(conn, reply);
        }
    }

    /// Marks transactions doomed for every watch token fired since the
    /// last command. A token whose transaction id no longer matches the
    /// session's current transaction is stale and ignored.
    fn reconcile_dirty(&mut self) {
        for token in self.keyspace.take_dirtied() {
            if let Some(session) = self.sessions.get_mut(&token.conn) {
                if session.tx.id() == token.tx {
                    session.tx.mark_dirty();
                }
            }
        }
    }

    fn send(&mut self, conn: ConnectionId, reply: Reply) {
        if let Some(session) = self.sessions.get(&conn) {
            if session.replies.send(reply).is_err() {
                trace!(conn, "reply channel closed, dropping reply");
            }
        }
    }

    fn new_transaction(&mut self) -> Transaction {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        Transaction::new(id)
    }

    /// Replays a wire-format command stream against the keyspace, e.g. a
    /// persisted mutation log. Replies are discarded and nothing is
    /// re-logged. Returns the number of commands applied.
    pub fn apply_wire(&mut self, bytes: &[u8]) -> usize {
        let decoded = decode_commands(bytes);
        let mut applied = 0;

        for argv in decoded.commands {
            let Ok(argv) = decode_argv(argv) else {
                continue;
            };
            if argv.is_empty() {
                continue;
            }
            dispatch(
                &mut self.keyspace,
                REPLAY_CONNECTION,
                &argv,
                DispatchMode::InExec,
            );
            applied += 1;
        }

        self.keyspace.take_log();
        applied
    }

    /// Direct keyspace access for snapshot save and load.
    pub fn keyspace_mut(&mut self) -> &mut Keyspace {
        &mut self.keyspace
    }
}

fn decode_argv(argv: Vec<Bytes>) -> Result<Vec<String>, ()> {
    argv.into_iter()
        .map(|arg| String::from_utf8(arg.to_vec()).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ManualClock;
    use std::sync::Arc;

    fn reactor() -> Reactor {
        Reactor::new(Keyspace::new(Arc::new(ManualClock::default())))
    }

    fn connect(reactor: &mut Reactor, id: ConnectionId) -> mpsc::UnboundedReceiver<Reply> {
        let (tx, rx) = mpsc::unbounded_channel();
        reactor.handle(EngineMessage::Connect { id, replies: tx });
        rx
    }

    fn send(reactor: &mut Reactor, id: ConnectionId, parts: &[&str]) {
        let argv = parts.iter().map(|s| Bytes::from(s.to_string())).collect();
        reactor.handle(EngineMessage::Command { id, argv });
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<Reply>) -> Reply {
        rx.try_recv().expect("expected a reply")
    }

    #[test]
    fn test_plain_command_roundtrip() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["SET", "k", "v"]);
        send(&mut reactor, 1, &["GET", "k"]);

        assert_eq!(recv(&mut rx), Reply::ok());
        assert_eq!(recv(&mut rx), Reply::bulk("v"));
    }

    #[test]
    fn test_multi_queues_then_exec_runs() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["SET", "a", "1"]);
        send(&mut reactor, 1, &["GET", "a"]);
        send(&mut reactor, 1, &["EXEC"]);

        assert_eq!(recv(&mut rx), Reply::ok());
        assert_eq!(recv(&mut rx), Reply::queued());
        assert_eq!(recv(&mut rx), Reply::queued());
        assert_eq!(
            recv(&mut rx),
            Reply::array(vec![Reply::ok(), Reply::bulk("1")])
        );
    }

    #[test]
    fn test_queued_commands_do_not_run_early() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["SET", "a", "1"]);
        recv(&mut rx);
        recv(&mut rx);

        let mut rx2 = connect(&mut reactor, 2);
        send(&mut reactor, 2, &["GET", "a"]);
        assert_eq!(recv(&mut rx2), Reply::Null);
    }

    #[test]
    fn test_nested_multi_is_an_error() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["MULTI"]);

        assert_eq!(recv(&mut rx), Reply::ok());
        assert_eq!(
            recv(&mut rx),
            Reply::Error("ERR MULTI calls can not be nested".to_string())
        );
    }

    #[test]
    fn test_exec_without_multi_is_an_error() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["EXEC"]);
        assert_eq!(
            recv(&mut rx),
            Reply::Error("ERR EXEC without MULTI".to_string())
        );
    }

    #[test]
    fn test_watch_aborts_on_outside_write() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);

        send(&mut reactor, 1, &["WATCH", "k"]);
        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["SET", "k", "mine"]);

        send(&mut reactor, 2, &["SET", "k", "theirs"]);
        send(&mut reactor, 1, &["EXEC"]);

        assert_eq!(recv(&mut rx1), Reply::ok()); // WATCH
        assert_eq!(recv(&mut rx1), Reply::ok()); // MULTI
        assert_eq!(recv(&mut rx1), Reply::queued());
        assert_eq!(recv(&mut rx2), Reply::ok());
        assert_eq!(recv(&mut rx1), Reply::Null); // aborted

        send(&mut reactor, 2, &["GET", "k"]);
        assert_eq!(recv(&mut rx2), Reply::bulk("theirs"));
    }

    #[test]
    fn test_watch_untouched_exec_commits() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["WATCH", "k"]);
        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["SET", "k", "v"]);
        send(&mut reactor, 1, &["EXEC"]);

        recv(&mut rx);
        recv(&mut rx);
        recv(&mut rx);
        assert_eq!(recv(&mut rx), Reply::array(vec![Reply::ok()]));
    }

    #[test]
    fn test_own_write_inside_exec_does_not_abort() {
        // The watched key is only modified by the transaction itself; the
        // dirty tokens produced during EXEC are stale by the time they are
        // reconciled.
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["WATCH", "k"]);
        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["SET", "k", "v"]);
        send(&mut reactor, 1, &["EXEC"]);
        recv(&mut rx);
        recv(&mut rx);
        recv(&mut rx);
        assert_eq!(recv(&mut rx), Reply::array(vec![Reply::ok()]));

        // And the connection is immediately usable for a fresh transaction.
        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["EXEC"]);
        assert_eq!(recv(&mut rx), Reply::ok());
        assert_eq!(recv(&mut rx), Reply::array(vec![]));
    }

    #[test]
    fn test_watch_inside_multi_is_an_error() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["WATCH", "k"]);

        recv(&mut rx);
        assert_eq!(
            recv(&mut rx),
            Reply::Error("ERR WATCH inside MULTI is not allowed".to_string())
        );
    }

    #[test]
    fn test_brpop_blocks_until_push_from_other_connection() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);

        send(&mut reactor, 1, &["BRPOP", "q", "0"]);
        assert!(rx1.try_recv().is_err());

        send(&mut reactor, 2, &["LPUSH", "q", "job"]);
        assert_eq!(recv(&mut rx2), Reply::int(1));
        assert_eq!(recv(&mut rx1), Reply::bulk("job"));
    }

    #[test]
    fn test_blocked_waiters_wake_in_fifo_order() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);
        let mut rx3 = connect(&mut reactor, 3);

        send(&mut reactor, 1, &["BRPOP", "q", "0"]);
        send(&mut reactor, 2, &["BRPOP", "q", "0"]);

        send(&mut reactor, 3, &["LPUSH", "q", "a"]);
        send(&mut reactor, 3, &["LPUSH", "q", "b"]);
        recv(&mut rx3);
        recv(&mut rx3);

        assert_eq!(recv(&mut rx1), Reply::bulk("a"));
        assert_eq!(recv(&mut rx2), Reply::bulk("b"));
    }

    #[test]
    fn test_disconnect_releases_blocked_waiter() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);

        send(&mut reactor, 1, &["BRPOP", "q", "0"]);
        send(&mut reactor, 2, &["BRPOP", "q", "0"]);
        reactor.handle(EngineMessage::Disconnect { id: 1 });

        let mut rx3 = connect(&mut reactor, 3);
        send(&mut reactor, 3, &["LPUSH", "q", "a"]);
        recv(&mut rx3);

        assert!(rx1.try_recv().is_err());
        assert_eq!(recv(&mut rx2), Reply::bulk("a"));
    }

    #[test]
    fn test_blocked_transfer_failure_sends_error_reply() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);

        send(&mut reactor, 1, &["BRPOPLPUSH", "q", "dst", "0"]);
        assert!(rx1.try_recv().is_err());

        send(&mut reactor, 2, &["SET", "dst", "oops"]);
        send(&mut reactor, 2, &["LPUSH", "q", "job"]);
        recv(&mut rx2);
        recv(&mut rx2);

        assert_eq!(
            recv(&mut rx1),
            Reply::Error(
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string()
            )
        );
    }

    #[test]
    fn test_publish_delivers_before_publisher_reply() {
        let mut reactor = reactor();
        let mut rx1 = connect(&mut reactor, 1);
        let mut rx2 = connect(&mut reactor, 2);

        send(&mut reactor, 1, &["SUBSCRIBE", "news"]);
        assert_eq!(
            recv(&mut rx1),
            Reply::array(vec![
                Reply::bulk("subscribe"),
                Reply::bulk("news"),
                Reply::int(1)
            ])
        );

        send(&mut reactor, 2, &["PUBLISH", "news", "hello"]);
        assert_eq!(
            recv(&mut rx1),
            Reply::array(vec![
                Reply::bulk("message"),
                Reply::bulk("news"),
                Reply::bulk("hello")
            ])
        );
        assert_eq!(recv(&mut rx2), Reply::int(1));
    }

    #[test]
    fn test_brpop_inside_exec_does_not_block() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        send(&mut reactor, 1, &["MULTI"]);
        send(&mut reactor, 1, &["BRPOP", "q", "0"]);
        send(&mut reactor, 1, &["EXEC"]);

        recv(&mut rx);
        recv(&mut rx);
        assert_eq!(recv(&mut rx), Reply::array(vec![Reply::Null]));
    }

    #[test]
    fn test_invalid_utf8_argument() {
        let mut reactor = reactor();
        let mut rx = connect(&mut reactor, 1);

        let argv = vec![Bytes::from_static(b"get"), Bytes::from_static(b"\xff\xfe")];
        reactor.handle(EngineMessage::Command { id: 1, argv });

        assert_eq!(
            recv(&mut rx),
            Reply::error("invalid argument encoding")
        );
    }

    #[test]
    fn test_apply_wire_replays_mutations() {
        let mut reactor = reactor();

        let stream = b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n\
                       *3\r\n$5\r\nlpush\r\n$1\r\nl\r\n$1\r\na\r\n";
        assert_eq!(reactor.apply_wire(stream), 2);

        let mut rx = connect(&mut reactor, 1);
        send(&mut reactor, 1, &["GET", "k"]);
        send(&mut reactor, 1, &["LLEN", "l"]);
        assert_eq!(recv(&mut rx), Reply::bulk("v"));
        assert_eq!(recv(&mut rx), Reply::int(1));
    }

    #[test]
    fn test_apply_wire_does_not_relog() {
        let mut reactor = reactor();
        reactor.apply_wire(b"*3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n");
        assert!(reactor.keyspace_mut().take_log().is_empty());
    }
}
