//! Command Processing
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │ frame + Client
//!          ▼
//! ┌─────────────────┐      ┌──────────────┐
//! │   Dispatcher    │─────>│  WorkerPool  │
//! │  (CommandTable) │<─────│  (threads)   │
//! └────────┬────────┘      └──────────────┘
//!          │
//!          ├──> KeyValueStore   (storage module)
//!          └──> Persistor       (persistence module)
//! ```
//!
//! - `client`: connection contexts and the registry used by `CLIENT`
//! - `pool`: the bounded worker pool commands run on
//! - `table`: the static command table
//! - `handler`: the dispatcher and every command implementation

pub mod client;
pub mod handler;
pub mod pool;
pub mod table;

pub use client::{Client, ClientFlags, ClientHandle, ClientRegistry, KillFilter};
pub use handler::Dispatcher;
pub use pool::{PoolError, WorkerPool};
pub use table::{CommandKind, CommandTable};
