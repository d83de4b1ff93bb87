//! TCP Server
//!
//! Wires the pieces together: a listener task accepting sockets, one
//! connection task per client, and the single reactor task that owns the
//! keyspace. The [`Server`] handle owns the shutdown signal; dropping it
//! does not stop the server, call [`Server::shutdown`].

pub mod reactor;

pub use reactor::{EngineMessage, Reactor, REPLAY_CONNECTION};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::handle_connection;
use crate::storage::{Clock, ConnectionId, Keyspace};

/// A running server: the bound address plus handles to its tasks.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Binds the listener and spawns the reactor and accept tasks. Failing
    /// to bind is fatal; everything after that runs until shutdown.
    pub async fn start(addr: &str, clock: Arc<dyn Clock>) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        let local_addr = listener.local_addr().context("listener has no address")?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reactor = Reactor::new(Keyspace::new(clock));
        tokio::spawn(reactor.run(engine_rx, shutdown_rx.clone()));
        tokio::spawn(accept_loop(listener, engine_tx, shutdown_rx));

        info!(%local_addr, "listening");
        Ok(Server {
            local_addr,
            shutdown: shutdown_tx,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals every server task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    engine: mpsc::UnboundedSender<EngineMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Id 0 is reserved for replay.
    let mut next_id: ConnectionId = 1;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let id = next_id;
                    next_id += 1;
                    debug!(conn = id, %addr, "accepted connection");
                    tokio::spawn(handle_connection(stream, addr, id, engine.clone()));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
            _ = shutdown.changed() => {
                debug!("accept loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SystemClock;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn create_test_server() -> Server {
        Server::start("127.0.0.1:0", Arc::new(SystemClock))
            .await
            .unwrap()
    }

    async fn read_exactly(client: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        read_exactly(&mut client, b"+PONG\r\n").await;
    }

    #[tokio::test]
    async fn test_set_get() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$5\r\nalice\r\n")
            .await
            .unwrap();
        read_exactly(&mut client, b"+OK\r\n").await;

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        read_exactly(&mut client, b"$5\r\nalice\r\n").await;
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client
            .write_all(
                b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
                  *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
                  *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n\
                  *2\r\n$3\r\nGET\r\n$2\r\nk2\r\n",
            )
            .await
            .unwrap();

        read_exactly(&mut client, b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n").await;
    }

    #[tokio::test]
    async fn test_transaction_over_socket() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"*1\r\n$5\r\nMULTI\r\n").await.unwrap();
        read_exactly(&mut client, b"+OK\r\n").await;

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n")
            .await
            .unwrap();
        read_exactly(&mut client, b"+QUEUED\r\n").await;

        client.write_all(b"*1\r\n$4\r\nEXEC\r\n").await.unwrap();
        read_exactly(&mut client, b"*1\r\n+OK\r\n").await;
    }

    #[tokio::test]
    async fn test_brpop_woken_by_other_client() {
        let server = create_test_server().await;
        let mut blocked = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut pusher = TcpStream::connect(server.local_addr()).await.unwrap();

        blocked
            .write_all(b"*3\r\n$5\r\nBRPOP\r\n$1\r\nq\r\n$1\r\n0\r\n")
            .await
            .unwrap();
        // Let the blocked client register before the push arrives.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pusher
            .write_all(b"*3\r\n$5\r\nLPUSH\r\n$1\r\nq\r\n$3\r\njob\r\n")
            .await
            .unwrap();
        read_exactly(&mut pusher, b":1\r\n").await;

        read_exactly(&mut blocked, b"$3\r\njob\r\n").await;
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let server = create_test_server().await;
        let mut subscriber = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut publisher = TcpStream::connect(server.local_addr()).await.unwrap();

        subscriber
            .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n")
            .await
            .unwrap();
        read_exactly(
            &mut subscriber,
            b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n",
        )
        .await;

        publisher
            .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nnews\r\n$5\r\nhello\r\n")
            .await
            .unwrap();
        read_exactly(&mut publisher, b":1\r\n").await;

        read_exactly(
            &mut subscriber,
            b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_connection() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"hello there\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let server = create_test_server().await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"*1\r\n$5\r\nBOGUS\r\n").await.unwrap();
        read_exactly(&mut client, b"-ERR unknown command 'BOGUS'\r\n").await;

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        read_exactly(&mut client, b"+PONG\r\n").await;
    }
}
