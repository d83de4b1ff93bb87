//! Command Table and Dispatch
//!
//! Every executable command is an entry in a static table: its name, an
//! arity window, whether it mutates the keyspace, and a handler function
//! taking the keyspace, the calling connection and the argv. Dispatch is a
//! lowercase lookup plus an arity check; there is no reflection and no
//! dynamic registration, so the full command surface is visible in one
//! place.
//!
//! MULTI, EXEC and WATCH are not in the table: they manipulate
//! per-connection transaction state and are intercepted by the reactor
//! before dispatch ever runs.
//!
//! Mutating commands that return success are appended to the keyspace's
//! mutation log here, so replay and persistence see exactly the writes that
//! were applied.

use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

use crate::protocol::Reply;
use crate::storage::keyspace::PopResult;
use crate::storage::{ConnectionId, Keyspace, SetCondition, StoreError, SubscriptionAck};

/// Client-facing command failures. The `Display` form is the exact message
/// sent on the wire (including the `ERR`/`WRONGTYPE` code word).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR syntax error")]
    Syntax,
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WrongType => CommandError::WrongType,
            StoreError::NotAnInteger => CommandError::NotAnInteger,
        }
    }
}

/// What dispatch produced: a reply to send now, or nothing yet because the
/// client blocked on an empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Reply(Reply),
    Blocked,
}

/// Whether the command runs directly or from inside an EXEC. Blocking
/// commands degrade to their non-blocking form inside EXEC, since a
/// transaction cannot suspend mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Direct,
    InExec,
}

type Handler =
    fn(&mut Keyspace, ConnectionId, &[String], DispatchMode) -> Result<Dispatch, CommandError>;

/// One table entry. Arity counts include the command name itself.
pub struct CommandSpec {
    pub name: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    writes: bool,
    handler: Handler,
}

impl CommandSpec {
    fn arity_ok(&self, argc: usize) -> bool {
        argc >= self.min_args && self.max_args.map_or(true, |max| argc <= max)
    }
}

/// Looks up a command by (case-insensitive) name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    table().get(name.to_ascii_lowercase().as_str())
}

/// Runs one command against the keyspace. Errors become error replies here;
/// the caller only ever sees a reply to send or a blocked marker.
pub fn dispatch(
    keyspace: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    mode: DispatchMode,
) -> Dispatch {
    match try_dispatch(keyspace, conn, argv, mode) {
        Ok(outcome) => outcome,
        Err(err) => Dispatch::Reply(Reply::Error(err.to_string())),
    }
}

fn try_dispatch(
    keyspace: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    mode: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let Some(name) = argv.first() else {
        return Err(CommandError::UnknownCommand(String::new()));
    };
    let spec = lookup(name).ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;
    if !spec.arity_ok(argv.len()) {
        return Err(CommandError::WrongArity(spec.name));
    }

    let outcome = (spec.handler)(keyspace, conn, argv, mode)?;

    // A blocked client has not mutated anything yet; the deferred pop is
    // logged when it actually runs.
    if spec.writes && !matches!(outcome, Dispatch::Blocked) {
        keyspace.log_command(argv);
    }
    Ok(outcome)
}

fn table() -> &'static HashMap<&'static str, CommandSpec> {
    static TABLE: OnceLock<HashMap<&'static str, CommandSpec>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        let mut add = |spec: CommandSpec| {
            table.insert(spec.name, spec);
        };

        add(read("ping", 1, Some(1), cmd_ping));
        add(read("echo", 2, Some(2), cmd_echo));

        add(write("set", 3, Some(4), cmd_set));
        add(read("get", 2, Some(2), cmd_get));
        add(write("del", 2, None, cmd_del));
        add(read("exists", 2, Some(2), cmd_exists));
        add(write("expire", 3, Some(3), cmd_expire));
        add(write("pexpire", 3, Some(3), cmd_pexpire));
        add(read("keys", 2, Some(2), cmd_keys));

        add(write("hset", 4, Some(4), cmd_hset));
        add(read("hget", 3, Some(3), cmd_hget));
        add(read("hmget", 3, None, cmd_hmget));
        add(write("hincrby", 4, Some(4), cmd_hincrby));

        add(write("lpush", 3, None, cmd_lpush));
        add(read("llen", 2, Some(2), cmd_llen));
        add(write("rpop", 2, Some(2), cmd_rpop));
        add(read("lrange", 4, Some(4), cmd_lrange));
        add(write("rpoplpush", 3, Some(3), cmd_rpoplpush));
        add(write("brpop", 3, Some(3), cmd_brpop));
        add(write("brpoplpush", 4, Some(4), cmd_brpoplpush));

        add(write("zadd", 4, Some(4), cmd_zadd));
        add(read("zrank", 3, Some(3), cmd_zrank));
        add(read("zscore", 3, Some(3), cmd_zscore));
        add(read("zrange", 4, Some(4), cmd_zrange));

        add(read("subscribe", 2, Some(2), cmd_subscribe));
        add(read("unsubscribe", 2, Some(2), cmd_unsubscribe));
        add(read("psubscribe", 2, Some(2), cmd_psubscribe));
        add(read("punsubscribe", 2, Some(2), cmd_punsubscribe));
        add(read("publish", 3, Some(3), cmd_publish));

        table
    })
}

fn read(
    name: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    handler: Handler,
) -> CommandSpec {
    CommandSpec {
        name,
        min_args,
        max_args,
        writes: false,
        handler,
    }
}

fn write(
    name: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    handler: Handler,
) -> CommandSpec {
    CommandSpec {
        name,
        min_args,
        max_args,
        writes: true,
        handler,
    }
}

// ============================================================================
// Argument parsing helpers
// ============================================================================

fn arg_i64(argv: &[String], index: usize) -> Result<i64, CommandError> {
    argv[index]
        .parse::<i64>()
        .map_err(|_| CommandError::NotAnInteger)
}

fn arg_score(argv: &[String], index: usize) -> Result<f64, CommandError> {
    let score = argv[index]
        .parse::<f64>()
        .map_err(|_| CommandError::NotAFloat)?;
    if score.is_nan() {
        return Err(CommandError::NotAFloat);
    }
    Ok(score)
}

fn reply(reply: Reply) -> Result<Dispatch, CommandError> {
    Ok(Dispatch::Reply(reply))
}

// ============================================================================
// Handlers
// ============================================================================

fn cmd_ping(
    _: &mut Keyspace,
    _: ConnectionId,
    _: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::pong())
}

fn cmd_echo(
    _: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::text(argv[1].clone()))
}

fn cmd_set(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let condition = match argv.get(3) {
        None => SetCondition::Always,
        Some(flag) if flag.eq_ignore_ascii_case("nx") => SetCondition::IfAbsent,
        Some(flag) if flag.eq_ignore_ascii_case("xx") => SetCondition::IfPresent,
        Some(_) => return Err(CommandError::Syntax),
    };
    if ks.set(&argv[1], &argv[2], condition) {
        reply(Reply::ok())
    } else {
        reply(Reply::Null)
    }
}

fn cmd_get(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::maybe_text(ks.get(&argv[1])?))
}

fn cmd_del(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::int(ks.del(&argv[1..]) as i64))
}

fn cmd_exists(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::int(ks.exists(&argv[1]) as i64))
}

fn cmd_expire(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let seconds = arg_i64(argv, 2)?;
    reply(Reply::int(ks.expire(&argv[1], seconds) as i64))
}

fn cmd_pexpire(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let millis = arg_i64(argv, 2)?;
    reply(Reply::int(ks.pexpire(&argv[1], millis) as i64))
}

fn cmd_keys(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let keys = ks.keys(&argv[1]);
    reply(Reply::array(keys.into_iter().map(Reply::text).collect()))
}

fn cmd_hset(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    ks.hset(&argv[1], &argv[2], &argv[3])?;
    reply(Reply::ok())
}

fn cmd_hget(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::maybe_text(ks.hget(&argv[1], &argv[2])?))
}

fn cmd_hmget(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let values = ks.hmget(&argv[1], &argv[2..])?;
    reply(Reply::array(
        values.into_iter().map(Reply::maybe_text).collect(),
    ))
}

fn cmd_hincrby(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let delta = arg_i64(argv, 3)?;
    match ks.hincrby(&argv[1], &argv[2], delta)? {
        Some(value) => reply(Reply::int(value)),
        None => reply(Reply::Null),
    }
}

fn cmd_lpush(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let mut len = 0;
    for value in &argv[2..] {
        len = ks.lpush(&argv[1], value)?;
    }
    reply(Reply::int(len as i64))
}

fn cmd_llen(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::int(ks.llen(&argv[1])? as i64))
}

fn cmd_rpop(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::maybe_text(ks.rpop(&argv[1])?))
}

fn cmd_lrange(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let start = arg_i64(argv, 2)?;
    let stop = arg_i64(argv, 3)?;
    let items = ks.lrange(&argv[1], start, stop)?;
    reply(Reply::array(items.into_iter().map(Reply::text).collect()))
}

fn cmd_rpoplpush(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::maybe_text(ks.rpoplpush(&argv[1], &argv[2])?))
}

fn cmd_brpop(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    mode: DispatchMode,
) -> Result<Dispatch, CommandError> {
    // The timeout argument is validated but not enforced.
    arg_i64(argv, 2)?;
    if mode == DispatchMode::InExec {
        return reply(Reply::maybe_text(ks.rpop(&argv[1])?));
    }
    match ks.brpop(&argv[1], conn)? {
        PopResult::Ready(value) => reply(Reply::text(value)),
        PopResult::Blocked => Ok(Dispatch::Blocked),
    }
}

fn cmd_brpoplpush(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    mode: DispatchMode,
) -> Result<Dispatch, CommandError> {
    arg_i64(argv, 3)?;
    if mode == DispatchMode::InExec {
        return reply(Reply::maybe_text(ks.rpoplpush(&argv[1], &argv[2])?));
    }
    match ks.brpoplpush(&argv[1], &argv[2], conn)? {
        PopResult::Ready(value) => reply(Reply::text(value)),
        PopResult::Blocked => Ok(Dispatch::Blocked),
    }
}

fn cmd_zadd(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let score = arg_score(argv, 2)?;
    let added = ks.zadd(&argv[1], score, &argv[3])?;
    reply(Reply::int(added as i64))
}

fn cmd_zrank(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    match ks.zrank(&argv[1], &argv[2])? {
        Some(rank) => reply(Reply::int(rank as i64)),
        None => reply(Reply::Null),
    }
}

fn cmd_zscore(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    match ks.zscore(&argv[1], &argv[2])? {
        Some(score) => reply(Reply::text(score.to_string())),
        None => reply(Reply::Null),
    }
}

fn cmd_zrange(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    let start = arg_i64(argv, 2)?;
    let stop = arg_i64(argv, 3)?;
    let members = ks.zrange(&argv[1], start, stop)?;
    reply(Reply::array(members.into_iter().map(Reply::text).collect()))
}

fn ack_reply(ack: SubscriptionAck) -> Result<Dispatch, CommandError> {
    reply(Reply::array(vec![
        Reply::text(ack.action),
        Reply::text(ack.channel),
        Reply::int(ack.count as i64),
    ]))
}

fn cmd_subscribe(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    ack_reply(ks.subscribe(&argv[1], conn))
}

fn cmd_unsubscribe(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    ack_reply(ks.unsubscribe(&argv[1], conn))
}

fn cmd_psubscribe(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    ack_reply(ks.psubscribe(&argv[1], conn))
}

fn cmd_punsubscribe(
    ks: &mut Keyspace,
    conn: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    ack_reply(ks.punsubscribe(&argv[1], conn))
}

fn cmd_publish(
    ks: &mut Keyspace,
    _: ConnectionId,
    argv: &[String],
    _: DispatchMode,
) -> Result<Dispatch, CommandError> {
    reply(Reply::int(ks.publish(&argv[1], &argv[2]) as i64))
}
