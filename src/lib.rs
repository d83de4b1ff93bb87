//! # CinderKV - An In-Memory Key-Value Server
//!
//! CinderKV is a Redis-like, in-memory key-value server written in Rust.
//! It speaks a RESP-style wire protocol and supports strings, hashes,
//! lists, sorted sets, key expiry, optimistic transactions, blocking list
//! pops and pub/sub.
//!
//! ## Architecture
//!
//! All keyspace state is owned by exactly one task, the reactor. Connection
//! tasks decode frames and forward commands over an mpsc queue; the queue's
//! single consumer executes them strictly one at a time, so no data
//! structure in the engine is ever locked or shared.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            CinderKV                              │
//! │                                                                  │
//! │  ┌────────────┐   ┌──────────────┐  commands   ┌─────────────┐   │
//! │  │ TCP Server │──>│  Connection  │────────────>│   Reactor   │   │
//! │  │ (Listener) │   │    Tasks     │   (mpsc)    │ (one task)  │   │
//! │  └────────────┘   └──────────────┘             └──────┬──────┘   │
//! │                      ▲       ▲                        │          │
//! │                      │       │  replies, wakeups,     ▼          │
//! │                      │       │  pub/sub messages  ┌──────────┐   │
//! │                      └───────┴────────────────────│ Keyspace │   │
//! │                        (per-connection channel)   │  engine  │   │
//! │                                                   └──────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection registers a reply channel with the reactor at connect
//! time. Direct replies, blocking-pop wakeups and pub/sub messages all
//! travel down that one channel, already ordered, so a connection task is
//! nothing but a pump between its socket and its channels.
//!
//! ## Supported Commands
//!
//! - Strings and keys: `SET` (with `NX`/`XX`), `GET`, `DEL`, `EXISTS`,
//!   `EXPIRE`, `PEXPIRE`, `KEYS`
//! - Hashes: `HSET`, `HGET`, `HMGET`, `HINCRBY`
//! - Lists: `LPUSH`, `LLEN`, `RPOP`, `LRANGE`, `RPOPLPUSH`, `BRPOP`,
//!   `BRPOPLPUSH`
//! - Sorted sets: `ZADD`, `ZRANK`, `ZSCORE`, `ZRANGE`
//! - Transactions: `MULTI`, `EXEC`, `WATCH`
//! - Pub/sub: `SUBSCRIBE`, `UNSUBSCRIBE`, `PSUBSCRIBE`, `PUNSUBSCRIBE`,
//!   `PUBLISH`
//! - Server: `PING`, `ECHO`
//!
//! ## Quick Start
//!
//! ```ignore
//! use cinderkv::server::Server;
//! use cinderkv::storage::SystemClock;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::start("127.0.0.1:6379", Arc::new(SystemClock)).await?;
//!     println!("listening on {}", server.local_addr());
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: wire framing, request decoding and the reply encoder
//! - [`storage`]: the keyspace engine, sorted sets, expiry and the clock seam
//! - [`commands`]: the command table and per-connection transaction state
//! - [`server`]: the reactor and the TCP listener
//! - [`connection`]: per-client socket tasks

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

pub use protocol::Reply;
pub use server::Server;
pub use storage::Keyspace;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default host the server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port, matching the protocol's lineage
pub const DEFAULT_PORT: u16 = 6379;
