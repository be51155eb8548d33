//! Connection Handling
//!
//! Each accepted socket gets its own Tokio task that owns the socket, a
//! read buffer and the connection's [`Client`](crate::commands::Client).
//! Commands themselves run on the dispatcher's worker pool, never on the
//! task that reads the socket.
//!
//! ```text
//!  TcpListener (server.rs)
//!        │ accept()
//!        ▼
//!  ConnectionHandler ──frame──> Dispatcher ──> WorkerPool
//!        ▲                                        │
//!        └──────────────── reply ─────────────────┘
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
