//! Per-connection task.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. accept()          ──> register a Client
//! 2. ┌───────────────────────────────────────┐
//!    │ parse every complete frame in buffer  │
//!    │   ──> dispatch to the worker pool     │
//!    │   ──> write the reply                 │
//!    │ read more bytes  |  close requested   │
//!    └───────────────────────────────────────┘
//! 3. EOF / error / kill ──> unregister the Client
//! ```
//!
//! Frames are dispatched one at a time and each reply is awaited before the
//! next frame is sent, so a connection's commands run and reply in the order
//! they arrived. A malformed frame gets an error reply and the buffered
//! bytes are discarded; the connection stays open.

use crate::commands::{Client, ClientHandle, Dispatcher, PoolError};
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum bytes buffered for one incomplete frame (64 MB)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Frames rejected by the parser
    pub protocol_errors: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    dispatcher: Arc<Dispatcher>,
    parser: RespParser,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            dispatcher,
            parser: RespParser::new(),
            stats,
        }
    }

    /// Runs the connection until the client leaves, an error occurs or the
    /// client is killed.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let client = self.dispatcher.clients().register(self.addr.to_string());
        let id = client.id();
        let handle = Arc::clone(client.handle());
        info!(client = %self.addr, id, "Client connected");

        let result = self.main_loop(client, &handle).await;

        match &result {
            Ok(()) => info!(client = %self.addr, id, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, id, "Client disconnected")
            }
            Err(ConnectionError::Killed) => info!(client = %self.addr, id, "Client killed"),
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, id, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, id, error = %e, "Connection error"),
        }

        self.dispatcher.clients().unregister(id);
        if let Err(e) = self.stream.shutdown().await {
            trace!(client = %self.addr, error = %e, "Socket shutdown failed");
        }
        self.stats.connection_closed();
        result
    }

    /// The read-dispatch-respond loop.
    async fn main_loop(
        &mut self,
        mut client: Client,
        handle: &ClientHandle,
    ) -> Result<(), ConnectionError> {
        loop {
            while let Some(parsed) = self.try_parse_command() {
                if handle.is_closing() {
                    return Err(ConnectionError::Killed);
                }

                let frame = match parsed {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.stats.protocol_error();
                        let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                        self.send_response(&reply).await?;
                        continue;
                    }
                };

                let (returned, reply) = self.dispatcher.dispatch(frame, client).await?;
                client = returned;
                self.stats.command_processed();

                self.send_response(&reply).await?;
            }

            if handle.is_closing() {
                return Err(ConnectionError::Killed);
            }

            tokio::select! {
                read = self.read_more_data() => read?,
                _ = handle.closed() => return Err(ConnectionError::Killed),
            }
        }
    }

    /// Takes one frame off the buffer, if a complete one is there.
    ///
    /// On a parse error the whole buffer is discarded, since the stream can
    /// no longer be resynchronised.
    fn try_parse_command(&mut self) -> Option<Result<RespValue, ParseError>> {
        if self.buffer.is_empty() {
            return None;
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Some(Ok(value))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                None
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(())
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command execution failed: {0}")]
    Pool(#[from] PoolError),

    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// Closed by `CLIENT KILL` or server shutdown
    #[error("Client killed")]
    Killed,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, dispatcher, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected | ConnectionError::Killed => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
