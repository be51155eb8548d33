//! Helpers shared by the integration tests.

#![allow(dead_code)]

use bytes::BytesMut;
use kvstore::persistence::{PersistenceConfig, PersistenceMode};
use kvstore::protocol::{encode_command, parse_message, RespValue};
use kvstore::storage::ExpiryConfig;
use kvstore::{Dispatcher, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<kvstore::Result<()>>,
}

impl TestServer {
    pub async fn start(persistence: PersistenceConfig) -> Self {
        let config = ServerConfig {
            port: 0,
            workers: 2,
            expiry: ExpiryConfig {
                interval: Duration::from_millis(50),
            },
            persistence,
            ..ServerConfig::default()
        };

        Self::start_with(config).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let dispatcher = Arc::clone(server.dispatcher());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            dispatcher,
            shutdown: Some(tx),
            handle,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient {
            stream: TcpStream::connect(self.addr).await.unwrap(),
            buffer: BytesMut::new(),
        }
    }

    /// Triggers graceful shutdown and waits for it to finish.
    pub async fn stop(mut self) -> kvstore::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap()
    }
}

pub fn no_persistence() -> PersistenceConfig {
    PersistenceConfig {
        mode: PersistenceMode::None,
        ..PersistenceConfig::default()
    }
}

pub fn aof_at(path: &Path) -> PersistenceConfig {
    PersistenceConfig {
        mode: PersistenceMode::Aof,
        aof_path: path.to_path_buf(),
        aof_flush_interval: Duration::from_millis(20),
        ..PersistenceConfig::default()
    }
}

pub fn snapshot_at(path: &Path) -> PersistenceConfig {
    PersistenceConfig {
        mode: PersistenceMode::Snapshot,
        snapshot_path: path.to_path_buf(),
        ..PersistenceConfig::default()
    }
}

/// A connection that sends commands and decodes one reply per command.
pub struct TestClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TestClient {
    pub async fn command(&mut self, args: &[&str]) -> RespValue {
        self.send_raw(&encode_command(args)).await;
        self.read_reply().await.expect("connection closed")
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Reads the next reply, or `None` once the server closed the socket.
    pub async fn read_reply(&mut self) -> Option<RespValue> {
        loop {
            if let Some((value, consumed)) = parse_message(&self.buffer).unwrap() {
                let _ = self.buffer.split_to(consumed);
                return Some(value);
            }

            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buffer))
                .await
                .expect("timed out waiting for a reply")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
        }
    }
}

pub fn bulk(s: &str) -> RespValue {
    RespValue::bulk_string(s.to_string())
}
