//! Connection contexts.
//!
//! Each connection owns a [`Client`] and moves it into the worker that runs
//! its current command, so a handler has exclusive access to the argument
//! vector for the whole command. The parts other connections may touch
//! (name, flags, close signal) live in a shared [`ClientHandle`] that the
//! [`ClientRegistry`] indexes by id.
//!
//! ```text
//!   Opened ──> Idle ──begin──> Busy ──after──> Idle ──> ... ──> Closed
//!                                │
//!                        kill while busy
//!                                ▼
//!                       Busy + CloseASAP ──after──> Closed
//! ```

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

/// Bit set describing a client's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientFlags(u8);

impl ClientFlags {
    pub const NONE: ClientFlags = ClientFlags(0);
    /// A command is executing
    pub const BUSY: ClientFlags = ClientFlags(1);
    /// Close once the executing command finishes
    pub const CLOSE_ASAP: ClientFlags = ClientFlags(1 << 1);

    pub fn contains(self, other: ClientFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for ClientFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("N");
        }
        for (flag, letter) in [(ClientFlags::BUSY, 'b'), (ClientFlags::CLOSE_ASAP, 'A')] {
            if self.contains(flag) {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

/// The shared part of a connection context.
#[derive(Debug)]
pub struct ClientHandle {
    id: u64,
    addr: String,
    name: Mutex<Option<String>>,
    flags: AtomicU8,
    created_at: Instant,
    closing: AtomicBool,
    close: Notify,
}

impl ClientHandle {
    fn new(id: u64, addr: String) -> Self {
        Self {
            id,
            addr,
            name: Mutex::new(None),
            flags: AtomicU8::new(0),
            created_at: Instant::now(),
            closing: AtomicBool::new(false),
            close: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub fn flags(&self) -> ClientFlags {
        ClientFlags(self.flags.load(Ordering::Acquire))
    }

    /// Seconds since the connection was opened.
    pub fn age(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Asks the owning connection to close.
    ///
    /// A busy client is only marked `CLOSE_ASAP`; the close happens when its
    /// command completes.
    pub fn request_close(&self) {
        let deferred = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags & ClientFlags::BUSY.0 != 0).then_some(flags | ClientFlags::CLOSE_ASAP.0)
            })
            .is_ok();

        if deferred {
            debug!(client = self.id, "Close deferred until command completes");
        } else {
            self.signal_close();
        }
    }

    /// Returns true once the owning connection should close.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once the owning connection should close.
    pub async fn closed(&self) {
        if !self.is_closing() {
            self.close.notified().await
        }
    }

    fn signal_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.close.notify_one();
    }

    fn begin_command(&self) {
        self.flags.fetch_or(ClientFlags::BUSY.0, Ordering::AcqRel);
    }

    fn after_command(&self) {
        let previous = self.flags.fetch_and(
            !(ClientFlags::BUSY.0 | ClientFlags::CLOSE_ASAP.0),
            Ordering::AcqRel,
        );

        if previous & ClientFlags::CLOSE_ASAP.0 != 0 {
            self.signal_close();
        }
    }

    /// `id=<id> addr=<addr> name=<name> age=<secs> flags=<flags>`
    pub fn info(&self) -> String {
        format!(
            "id={} addr={} name={} age={} flags={}",
            self.id,
            self.addr,
            self.name().unwrap_or_default(),
            self.age(),
            self.flags()
        )
    }
}

/// A connection context, owned by its connection and lent to one command at
/// a time.
#[derive(Debug)]
pub struct Client {
    handle: Arc<ClientHandle>,
    command: String,
    argv: Vec<Bytes>,
}

impl Client {
    /// A context that is not registered anywhere, used for log replay.
    pub fn detached(addr: impl Into<String>) -> Self {
        Self::from_handle(Arc::new(ClientHandle::new(0, addr.into())))
    }

    fn from_handle(handle: Arc<ClientHandle>) -> Self {
        Self {
            handle,
            command: String::new(),
            argv: Vec::new(),
        }
    }

    pub fn handle(&self) -> &Arc<ClientHandle> {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// Canonical name of the executing command (`client|kill` for
    /// subcommands).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments of the executing command, excluding its name.
    pub fn args(&self) -> &[Bytes] {
        &self.argv
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    pub(crate) fn set_command(&mut self, command: impl Into<String>, argv: Vec<Bytes>) {
        self.command = command.into();
        self.argv = argv;
    }

    /// Drops the first argument after it has selected a subcommand.
    pub(crate) fn enter_subcommand(&mut self, name: &str) {
        self.command = format!("{}|{}", self.command, name);
        if !self.argv.is_empty() {
            self.argv.remove(0);
        }
    }

    pub(crate) fn begin_command(&self) {
        self.handle.begin_command();
    }

    pub(crate) fn after_command(&mut self) {
        self.argv.clear();
        self.handle.after_command();
    }
}

/// How `CLIENT KILL` selects its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillFilter {
    Id(u64),
    Addr(String),
    Name(String),
}

impl KillFilter {
    fn matches(&self, handle: &ClientHandle) -> bool {
        match self {
            KillFilter::Id(id) => handle.id == *id,
            KillFilter::Addr(addr) => handle.addr == *addr,
            KillFilter::Name(name) => handle.name.lock().as_deref() == Some(name.as_str()),
        }
    }
}

/// Every live connection, keyed by client id.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<u64, Arc<ClientHandle>>,
    next_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection and returns its context.
    pub fn register(&self, addr: impl Into<String>) -> Client {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle::new(id, addr.into()));
        self.clients.insert(id, Arc::clone(&handle));
        Client::from_handle(handle)
    }

    pub fn unregister(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn get(&self, id: u64) -> Option<Arc<ClientHandle>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All connections, ordered by id.
    pub fn list(&self) -> Vec<Arc<ClientHandle>> {
        let mut clients: Vec<_> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Requests the close of every client matching `filter`, except the
    /// requester. Returns how many were targeted.
    pub fn kill(&self, filter: &KillFilter, requester: u64) -> u64 {
        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|entry| *entry.key() != requester && filter.matches(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for target in &targets {
            debug!(client = target.id, addr = %target.addr, "Killing client");
            target.request_close();
        }
        targets.len() as u64
    }

    /// Requests the close of every client.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().request_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_assigns_increasing_ids() {
        let registry = ClientRegistry::new();
        let a = registry.register("127.0.0.1:5001");
        let b = registry.register("127.0.0.1:5002");

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(registry.len(), 2);

        registry.unregister(a.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(2).unwrap().addr(), "127.0.0.1:5002");
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(ClientFlags::NONE.to_string(), "N");
        assert_eq!(ClientFlags::BUSY.to_string(), "b");
        assert_eq!(
            ClientFlags(ClientFlags::BUSY.0 | ClientFlags::CLOSE_ASAP.0).to_string(),
            "bA"
        );
    }

    #[test]
    fn test_info_line() {
        let registry = ClientRegistry::new();
        let client = registry.register("10.0.0.1:4000");
        client.handle().set_name(Some("worker".to_string()));

        assert_eq!(
            client.handle().info(),
            "id=1 addr=10.0.0.1:4000 name=worker age=0 flags=N"
        );
    }

    #[test]
    fn test_subcommand_shifts_argv() {
        let mut client = Client::detached("test");
        client.set_command("client", vec![Bytes::from("setname"), Bytes::from("x")]);
        client.enter_subcommand("setname");

        assert_eq!(client.command(), "client|setname");
        assert_eq!(client.args(), &[Bytes::from("x")]);
        assert_eq!(client.argc(), 1);
    }

    #[test]
    fn test_kill_skips_requester() {
        let registry = ClientRegistry::new();
        let me = registry.register("127.0.0.1:1");
        let other = registry.register("127.0.0.1:2");
        other.handle().set_name(Some("bob".to_string()));

        assert_eq!(registry.kill(&KillFilter::Id(me.id()), me.id()), 0);
        assert_eq!(registry.kill(&KillFilter::Id(99), me.id()), 0);
        assert_eq!(registry.kill(&KillFilter::Addr("127.0.0.1:2".into()), me.id()), 1);
        assert_eq!(registry.kill(&KillFilter::Name("bob".into()), me.id()), 1);
        assert_eq!(registry.kill(&KillFilter::Name("alice".into()), me.id()), 0);
    }

    #[tokio::test]
    async fn test_idle_client_closes_immediately() {
        let registry = ClientRegistry::new();
        let client = registry.register("127.0.0.1:1");

        assert!(!client.handle().is_closing());
        client.handle().request_close();
        assert!(client.handle().is_closing());

        tokio::time::timeout(Duration::from_secs(1), client.handle().closed())
            .await
            .expect("close should be signalled");
    }

    #[tokio::test]
    async fn test_busy_client_closes_after_command() {
        let registry = ClientRegistry::new();
        let mut client = registry.register("127.0.0.1:1");

        client.begin_command();
        assert!(client.handle().flags().contains(ClientFlags::BUSY));

        client.handle().request_close();
        assert!(client.handle().flags().contains(ClientFlags::CLOSE_ASAP));
        assert!(!client.handle().is_closing());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), client.handle().closed())
                .await
                .is_err()
        );

        client.after_command();
        assert_eq!(client.handle().flags(), ClientFlags::NONE);
        assert!(client.handle().is_closing());
        tokio::time::timeout(Duration::from_secs(1), client.handle().closed())
            .await
            .expect("close should be signalled after the command");
    }
}
