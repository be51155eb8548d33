//! Command Dispatcher
//!
//! Turns a decoded frame into a command invocation, runs it on the worker
//! pool and forwards successful writes to the active persistor.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                           │
//! │                                                               │
//! │  frame ──> argv ──> table lookup ──> [subcommand] ──> handler │
//! │                                                        │      │
//! │                        Write commands ──> Persistor::record   │
//! │                        FLUSHALL       ──> Persistor::truncate │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Write commands hold the write lock from execution until their line is
//! recorded, so the log holds writes in the order they were applied.
//! `FLUSHALL` holds the same lock while it clears the store and truncates
//! the log, so a truncate never drops the record of a write that survived
//! the flush.
//!
//! ## Supported Commands
//!
//! - `GET key`
//! - `SET key value [EX seconds | PX milliseconds] [NX | XX]`
//! - `SETEX key seconds value`
//! - `DEL key [key ...]` (a key containing `*`, `?` or `[` that does not
//!   exist is used as a pattern)
//! - `KEYS pattern`
//! - `EXPIRE key seconds`, `PEXPIRE key milliseconds`
//! - `TTL key`, `PTTL key`
//! - `FLUSHALL`
//! - `PING [message]`
//! - `INFO [section]`
//! - `COMMAND`
//! - `CLIENT ID | INFO | LIST | KILL ... | SETNAME name | GETNAME`
//! - `CONFIG GET pattern`

use crate::commands::client::{Client, ClientRegistry, KillFilter};
use crate::commands::pool::{PoolError, WorkerPool};
use crate::commands::table::{Action, CommandKind, CommandTable};
use crate::error::{Error, Result};
use crate::persistence::{Persistor, Recovery};
use crate::protocol::RespValue;
use crate::storage::{GlobPattern, Item, KeyValueStore, SetCondition};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Jobs each worker may have queued before connections wait for a slot.
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// Executes commands against the store on behalf of connections.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<KeyValueStore>,
    persistor: Arc<dyn Persistor>,
    clients: ClientRegistry,
    table: CommandTable,
    pool: WorkerPool,
    /// Orders apply-then-record for writes against each other and `FLUSHALL`
    write_lock: Mutex<()>,
    /// Dotted configuration names and values, for `CONFIG GET`
    settings: BTreeMap<String, String>,
    started_at: Instant,
    commands_processed: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher running commands on `workers` threads.
    pub fn new(
        store: Arc<KeyValueStore>,
        persistor: Arc<dyn Persistor>,
        workers: usize,
    ) -> std::io::Result<Self> {
        let pool = WorkerPool::new(workers, workers.max(1) * QUEUE_DEPTH_PER_WORKER)?;

        Ok(Self {
            store,
            persistor,
            clients: ClientRegistry::new(),
            table: CommandTable::new(),
            pool,
            write_lock: Mutex::new(()),
            settings: BTreeMap::new(),
            started_at: Instant::now(),
            commands_processed: AtomicU64::new(0),
        })
    }

    /// Sets the configuration reported by `CONFIG GET`.
    pub fn with_settings(mut self, settings: BTreeMap<String, String>) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    pub fn persistor(&self) -> &Arc<dyn Persistor> {
        &self.persistor
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Total commands executed for connections (replay excluded).
    pub fn commands_processed(&self) -> u64 {
        self.commands_processed.load(Ordering::Relaxed)
    }

    /// Runs one frame on the worker pool.
    ///
    /// The client travels to the worker and back with the reply, so a
    /// connection must await this before dispatching its next frame.
    pub async fn dispatch(
        self: &Arc<Self>,
        frame: RespValue,
        mut client: Client,
    ) -> std::result::Result<(Client, RespValue), PoolError> {
        let args = match command_args(frame) {
            Ok(args) => args,
            Err(reply) => return Ok((client, reply)),
        };

        let dispatcher = Arc::clone(self);
        self.pool
            .run(move || {
                let reply = dispatcher.execute(&mut client, args);
                (client, reply)
            })
            .await
    }

    /// Executes a command on the calling thread.
    ///
    /// `args[0]` is the command name. The client is marked busy for the
    /// duration, and closed afterwards if a kill arrived meanwhile.
    pub fn execute(&self, client: &mut Client, args: Vec<Bytes>) -> RespValue {
        client.begin_command();
        let reply = self.run(client, args, true);
        client.after_command();

        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        reply
    }

    /// Re-executes a logged command without forwarding it to persistence.
    pub fn replay(&self, argv: Vec<Bytes>) -> RespValue {
        self.run(&mut Client::detached("replay"), argv, false)
    }

    /// Loads recovered state into the store. Returns the number of items
    /// loaded or commands replayed.
    ///
    /// Corrupt log lines are skipped with a warning; I/O errors abort.
    pub fn restore(&self, recovery: Recovery) -> Result<u64> {
        match recovery {
            Recovery::Nothing => Ok(0),
            Recovery::Items(items) => {
                let loaded = items.len() as u64;
                for item in items {
                    self.store.store(item);
                }
                info!(items = loaded, "Restored snapshot");
                Ok(loaded)
            }
            Recovery::Commands(log) => {
                let mut client = Client::detached("replay");
                let mut replayed = 0u64;

                for entry in log {
                    match entry {
                        Ok(argv) => {
                            if let RespValue::Error(e) = self.run(&mut client, argv, false) {
                                warn!(error = %e, "Replayed command failed");
                            }
                            replayed += 1;
                        }
                        Err(e @ Error::CorruptLog { .. }) => {
                            warn!(error = %e, "Skipping corrupt log entry");
                        }
                        Err(e) => return Err(e),
                    }
                }

                info!(commands = replayed, keys = self.store.len(), "Replayed append-only log");
                Ok(replayed)
            }
        }
    }

    /// Stops the worker pool after the queued commands finish.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn run(&self, client: &mut Client, mut args: Vec<Bytes>, forward: bool) -> RespValue {
        if args.is_empty() {
            return RespValue::error("ERR empty command");
        }

        let raw_name = args.remove(0);
        let name = String::from_utf8_lossy(&raw_name).to_ascii_lowercase();
        let Some(mut command) = self.table.get(&name) else {
            debug!(command = %name, "Unknown command");
            return RespValue::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&raw_name)
            ));
        };
        client.set_command(command.name, args);

        let handler = loop {
            match command.action {
                Action::Run(handler) => break handler,
                Action::Dispatch(_) => {
                    let Some(sub) = client.args().first() else {
                        return wrong_args(client);
                    };
                    let sub_name = String::from_utf8_lossy(sub).to_ascii_lowercase();

                    match command.sub_command(&sub_name) {
                        Some(sub) => {
                            client.enter_subcommand(sub.name);
                            command = sub;
                        }
                        None => {
                            return RespValue::error(format!(
                                "ERR unknown subcommand '{}' for '{}' command",
                                String::from_utf8_lossy(sub),
                                command.name
                            ))
                        }
                    }
                }
            }
        };

        if command.kind != CommandKind::Write || !forward {
            return handler(self, client);
        }

        let _order = self.write_lock.lock();
        let reply = handler(self, client);
        if !reply.is_error() {
            let mut line = Vec::with_capacity(client.argc() + 1);
            line.push(Bytes::from_static(command.name.as_bytes()));
            line.extend(client.args().iter().cloned());
            self.persistor.record(&line);
        }
        reply
    }
}

/// Extracts the argument vector from a command frame.
fn command_args(frame: RespValue) -> std::result::Result<Vec<Bytes>, RespValue> {
    let items = match frame {
        RespValue::Array(items) => items,
        _ => return Err(RespValue::error("ERR invalid command format")),
    };

    if items.is_empty() {
        return Err(RespValue::error("ERR empty command"));
    }

    items
        .into_iter()
        .map(|item| {
            item.into_bytes()
                .ok_or_else(|| RespValue::error("ERR invalid argument type"))
        })
        .collect()
}

// ============================================================================
// Helper functions
// ============================================================================

fn wrong_args(client: &Client) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        client.command()
    ))
}

fn syntax_error() -> RespValue {
    RespValue::error("ERR syntax error")
}

fn parse_integer(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// Converts a client TTL to a duration. None if it is not positive or the
/// resulting deadline does not fit in an `Instant`.
fn expire_duration(amount: i64, unit: fn(u64) -> Duration) -> Option<Duration> {
    if amount <= 0 {
        return None;
    }
    let ttl = unit(amount as u64);
    Instant::now().checked_add(ttl).map(|_| ttl)
}

fn lossy(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

// ============================================================================
// Key Commands
// ============================================================================

/// GET key
pub(crate) fn get(d: &Dispatcher, client: &mut Client) -> RespValue {
    let [key] = client.args() else {
        return wrong_args(client);
    };

    match d.store.get(key) {
        Some(item) => RespValue::bulk_string(item.data),
        None => RespValue::null(),
    }
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
pub(crate) fn set(d: &Dispatcher, client: &mut Client) -> RespValue {
    let [key, value, options @ ..] = client.args() else {
        return wrong_args(client);
    };

    let mut ttl: Option<Duration> = None;
    let mut condition = SetCondition::Always;

    let mut options = options.iter();
    while let Some(option) = options.next() {
        match option.to_ascii_uppercase().as_slice() {
            unit @ (b"EX" | b"PX") if ttl.is_none() => {
                let Some(amount) = options.next().and_then(|n| parse_integer(n)) else {
                    return syntax_error();
                };
                let unit: fn(u64) -> Duration = match unit {
                    b"EX" => Duration::from_secs,
                    _ => Duration::from_millis,
                };
                let Some(duration) = expire_duration(amount, unit) else {
                    return RespValue::error("ERR invalid expire time in 'set' command");
                };
                ttl = Some(duration);
            }
            b"NX" if condition == SetCondition::Always => condition = SetCondition::IfAbsent,
            b"XX" if condition == SetCondition::Always => condition = SetCondition::IfPresent,
            _ => return syntax_error(),
        }
    }

    let item = Item::with_ttl(key.clone(), value.clone(), ttl.unwrap_or(Duration::ZERO));
    if d.store.store_if(item, condition) {
        RespValue::ok()
    } else {
        RespValue::null()
    }
}

/// SETEX key seconds value
pub(crate) fn setex(d: &Dispatcher, client: &mut Client) -> RespValue {
    let [key, seconds, value] = client.args() else {
        return wrong_args(client);
    };

    let Some(seconds) = parse_integer(seconds) else {
        return RespValue::error("ERR value is not an integer or out of range");
    };
    let Some(ttl) = expire_duration(seconds, Duration::from_secs) else {
        return RespValue::error("ERR invalid expire time in 'setex' command");
    };

    d.store.set_with_ttl(key.clone(), value.clone(), ttl);
    RespValue::ok()
}

/// DEL key [key ...]
pub(crate) fn del(d: &Dispatcher, client: &mut Client) -> RespValue {
    if client.argc() == 0 {
        return wrong_args(client);
    }

    let deleted: u64 = client.args().iter().map(|key| d.store.delete(key)).sum();
    RespValue::integer(deleted as i64)
}

/// KEYS pattern
pub(crate) fn keys(d: &Dispatcher, client: &mut Client) -> RespValue {
    let [pattern] = client.args() else {
        return wrong_args(client);
    };

    match d.store.keys_with_pattern(pattern) {
        Ok(keys) => RespValue::bulk_array(keys),
        Err(e) => RespValue::error(format!("ERR invalid pattern: {}", e)),
    }
}

fn expire_with(d: &Dispatcher, client: &Client, unit: fn(u64) -> Duration) -> RespValue {
    let [key, amount] = client.args() else {
        return wrong_args(client);
    };

    let Some(amount) = parse_integer(amount) else {
        return RespValue::error("ERR invalid expire time");
    };

    // A non-positive TTL deletes the key
    let ttl = if amount > 0 {
        match expire_duration(amount, unit) {
            Some(ttl) => ttl,
            None => {
                return RespValue::error(format!(
                    "ERR invalid expire time in '{}' command",
                    client.command()
                ))
            }
        }
    } else {
        Duration::ZERO
    };
    RespValue::integer(d.store.expire(key, ttl) as i64)
}

/// EXPIRE key seconds
pub(crate) fn expire(d: &Dispatcher, client: &mut Client) -> RespValue {
    expire_with(d, client, Duration::from_secs)
}

/// PEXPIRE key milliseconds
pub(crate) fn pexpire(d: &Dispatcher, client: &mut Client) -> RespValue {
    expire_with(d, client, Duration::from_millis)
}

fn ttl_with(d: &Dispatcher, client: &Client, unit: fn(Duration) -> u128) -> RespValue {
    let [key] = client.args() else {
        return wrong_args(client);
    };

    match d.store.get(key) {
        None => RespValue::integer(-2),
        Some(item) => match item.ttl_remaining() {
            None => RespValue::integer(-1),
            Some(remaining) => RespValue::integer(unit(remaining) as i64),
        },
    }
}

/// TTL key
pub(crate) fn ttl(d: &Dispatcher, client: &mut Client) -> RespValue {
    ttl_with(d, client, |remaining| remaining.as_secs() as u128)
}

/// PTTL key
pub(crate) fn pttl(d: &Dispatcher, client: &mut Client) -> RespValue {
    ttl_with(d, client, |remaining| remaining.as_millis())
}

// ============================================================================
// Server Commands
// ============================================================================

/// FLUSHALL
pub(crate) fn flushall(d: &Dispatcher, client: &mut Client) -> RespValue {
    if client.argc() != 0 {
        return wrong_args(client);
    }

    let _order = d.write_lock.lock();
    let removed = d.store.clear();

    // The keyspace is already empty; a failed reset must not fail the reply
    if let Err(e) = d.persistor.truncate() {
        error!(persistor = d.persistor.name(), error = %e, "Failed to reset persistence");
    }

    info!(removed, "Flushed all keys");
    RespValue::integer(removed as i64)
}

/// PING [message]
pub(crate) fn ping(_d: &Dispatcher, client: &mut Client) -> RespValue {
    match client.args() {
        [] => RespValue::pong(),
        [message] => RespValue::bulk_string(message.clone()),
        _ => wrong_args(client),
    }
}

/// INFO [section]
pub(crate) fn info(d: &Dispatcher, client: &mut Client) -> RespValue {
    let section = match client.args() {
        [] => None,
        [section] => Some(lossy(section).to_ascii_lowercase()),
        _ => return wrong_args(client),
    };
    let wanted = |name: &str| section.as_deref().map_or(true, |s| s == name);

    let stats = d.store.stats();
    let mut out = String::new();

    if wanted("server") {
        let _ = write!(
            out,
            "# Server\r\n\
             kvstore_version:{}\r\n\
             os:{}\r\n\
             process_id:{}\r\n\
             uptime_in_seconds:{}\r\n\
             worker_threads:{}\r\n\
             persistence:{}\r\n\
             \r\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::process::id(),
            d.started_at.elapsed().as_secs(),
            d.pool.size(),
            d.persistor.name(),
        );
    }

    if wanted("clients") {
        let _ = write!(
            out,
            "# Clients\r\nconnected_clients:{}\r\n\r\n",
            d.clients.len()
        );
    }

    if wanted("stats") {
        let _ = write!(
            out,
            "# Stats\r\n\
             total_commands_processed:{}\r\n\
             get_ops:{}\r\n\
             set_ops:{}\r\n\
             del_ops:{}\r\n\
             expired_keys:{}\r\n\
             \r\n",
            d.commands_processed(),
            stats.get_ops,
            stats.set_ops,
            stats.del_ops,
            stats.expired,
        );
    }

    if wanted("keyspace") {
        let _ = write!(
            out,
            "# Keyspace\r\ndb0:keys={},expires={},buckets={}\r\n",
            stats.keys, stats.expiring_keys, stats.buckets
        );
    }

    RespValue::bulk_string(Bytes::from(out))
}

/// COMMAND
pub(crate) fn command(d: &Dispatcher, client: &mut Client) -> RespValue {
    if client.argc() != 0 {
        return wrong_args(client);
    }

    let entries = d
        .table
        .sorted()
        .into_iter()
        .map(|c| {
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from_static(c.name.as_bytes())),
                RespValue::simple_string(c.kind.to_string()),
                RespValue::bulk_string(Bytes::from_static(c.description.as_bytes())),
            ])
        })
        .collect();

    RespValue::array(entries)
}

/// CONFIG GET pattern
pub(crate) fn config_get(d: &Dispatcher, client: &mut Client) -> RespValue {
    let [pattern] = client.args() else {
        return wrong_args(client);
    };

    let pattern = match GlobPattern::new(pattern) {
        Ok(pattern) => pattern,
        Err(e) => return RespValue::error(format!("ERR invalid pattern: {}", e)),
    };

    let pairs = d
        .settings
        .iter()
        .filter(|(name, _)| pattern.matches(name))
        .flat_map(|(name, value)| [name.clone(), value.clone()]);

    RespValue::bulk_array(pairs)
}

// ============================================================================
// Client Commands
// ============================================================================

/// CLIENT ID
pub(crate) fn client_id(_d: &Dispatcher, client: &mut Client) -> RespValue {
    RespValue::integer(client.id() as i64)
}

/// CLIENT INFO
pub(crate) fn client_info(_d: &Dispatcher, client: &mut Client) -> RespValue {
    RespValue::bulk_string(Bytes::from(client.handle().info()))
}

/// CLIENT LIST
pub(crate) fn client_list(d: &Dispatcher, _client: &mut Client) -> RespValue {
    let mut out = String::new();
    for handle in d.clients.list() {
        out.push_str(&handle.info());
        out.push_str("\r\n");
    }
    RespValue::bulk_string(Bytes::from(out))
}

/// CLIENT KILL addr | CLIENT KILL ID id | ADDR addr | USER name
pub(crate) fn client_kill(d: &Dispatcher, client: &mut Client) -> RespValue {
    let filter = match client.args() {
        [] => return wrong_args(client),
        [addr] => KillFilter::Addr(lossy(addr)),
        [kind, value] => match kind.to_ascii_lowercase().as_slice() {
            b"id" => match parse_integer(value) {
                Some(id) if id > 0 => KillFilter::Id(id as u64),
                _ => return RespValue::error("ERR client-id should be greater than 0"),
            },
            b"addr" | b"address" => KillFilter::Addr(lossy(value)),
            b"user" | b"name" => KillFilter::Name(lossy(value)),
            _ => return syntax_error(),
        },
        _ => return syntax_error(),
    };

    RespValue::integer(d.clients.kill(&filter, client.id()) as i64)
}

/// CLIENT SETNAME name
pub(crate) fn client_setname(_d: &Dispatcher, client: &mut Client) -> RespValue {
    let [name] = client.args() else {
        return wrong_args(client);
    };

    if !name.iter().all(u8::is_ascii_graphic) {
        return RespValue::error(
            "ERR Client names cannot contain spaces, newlines or special characters.",
        );
    }

    let name = (!name.is_empty()).then(|| lossy(name));
    client.handle().set_name(name);
    RespValue::ok()
}

/// CLIENT GETNAME
pub(crate) fn client_getname(_d: &Dispatcher, client: &mut Client) -> RespValue {
    match client.handle().name() {
        Some(name) => RespValue::bulk_string(Bytes::from(name)),
        None => RespValue::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::client::ClientFlags;
    use crate::persistence::{AofPersistor, NoopPersistor};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Remembers what it was asked to persist.
    #[derive(Debug, Default)]
    struct RecordingPersistor {
        lines: Mutex<Vec<Vec<Bytes>>>,
        truncated: AtomicUsize,
        /// Pause between a write being applied and being recorded
        record_delay: Duration,
    }

    impl RecordingPersistor {
        fn lines(&self) -> Vec<Vec<String>> {
            self.lines
                .lock()
                .iter()
                .map(|argv| argv.iter().map(|a| lossy(a)).collect())
                .collect()
        }
    }

    impl Persistor for RecordingPersistor {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn record(&self, argv: &[Bytes]) {
            if !self.record_delay.is_zero() {
                std::thread::sleep(self.record_delay);
            }
            self.lines.lock().push(argv.to_vec());
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }

        fn truncate(&self) -> Result<()> {
            self.lines.lock().clear();
            self.truncated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load(&self) -> Result<Recovery> {
            Ok(Recovery::Nothing)
        }

        fn save(&self, _store: &KeyValueStore) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn create_dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(KeyValueStore::new()), Arc::new(NoopPersistor), 2).unwrap()
    }

    fn make_command(args: &[&str]) -> RespValue {
        RespValue::Array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    fn exec(d: &Dispatcher, client: &mut Client, args: &[&str]) -> RespValue {
        match command_args(make_command(args)) {
            Ok(args) => d.execute(client, args),
            Err(reply) => reply,
        }
    }

    #[test]
    fn test_ping() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["PING"]), RespValue::pong());
        assert_eq!(
            exec(&d, &mut c, &["ping", "hello"]),
            RespValue::bulk_string(Bytes::from("hello"))
        );
        assert!(exec(&d, &mut c, &["PING", "a", "b"]).is_error());
    }

    #[test]
    fn test_set_get_del() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["SET", "k", "v"]), RespValue::ok());
        assert_eq!(
            exec(&d, &mut c, &["GET", "k"]),
            RespValue::bulk_string(Bytes::from("v"))
        );
        assert_eq!(exec(&d, &mut c, &["GET", "missing"]), RespValue::null());
        assert_eq!(exec(&d, &mut c, &["DEL", "missing"]), RespValue::integer(0));
        assert_eq!(exec(&d, &mut c, &["DEL", "k", "k"]), RespValue::integer(1));
        assert_eq!(exec(&d, &mut c, &["GET", "k"]), RespValue::null());
    }

    #[test]
    fn test_command_names_are_case_insensitive() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["sEt", "k", "v"]), RespValue::ok());
        assert_eq!(
            exec(&d, &mut c, &["get", "k"]),
            RespValue::bulk_string(Bytes::from("v"))
        );
    }

    #[test]
    fn test_unknown_command() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(
            exec(&d, &mut c, &["foo"]),
            RespValue::error("ERR unknown command 'foo'")
        );
        assert_eq!(
            exec(&d, &mut c, &["LPUSH", "list", "a"]),
            RespValue::error("ERR unknown command 'LPUSH'")
        );
    }

    #[test]
    fn test_arity_errors() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(
            exec(&d, &mut c, &["GET"]),
            RespValue::error("ERR wrong number of arguments for 'get' command")
        );
        assert!(exec(&d, &mut c, &["GET", "a", "b"]).is_error());
        assert!(exec(&d, &mut c, &["SET", "k"]).is_error());
        assert!(exec(&d, &mut c, &["DEL"]).is_error());
        assert!(exec(&d, &mut c, &["KEYS"]).is_error());
        assert!(exec(&d, &mut c, &["TTL"]).is_error());
        assert!(exec(&d, &mut c, &["EXPIRE", "k"]).is_error());
        assert!(exec(&d, &mut c, &["FLUSHALL", "now"]).is_error());
    }

    #[test]
    fn test_non_array_frames() {
        assert_eq!(
            command_args(RespValue::simple_string("PING")),
            Err(RespValue::error("ERR invalid command format"))
        );
        assert_eq!(
            command_args(RespValue::array(vec![])),
            Err(RespValue::error("ERR empty command"))
        );
        assert_eq!(
            command_args(RespValue::array(vec![RespValue::null()])),
            Err(RespValue::error("ERR invalid argument type"))
        );
    }

    #[test]
    fn test_set_with_expiry() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["SET", "a", "1", "EX", "100"]), RespValue::ok());
        let ttl = exec(&d, &mut c, &["TTL", "a"]).as_integer().unwrap();
        assert!((99..=100).contains(&ttl));

        assert_eq!(exec(&d, &mut c, &["SET", "b", "1", "px", "5000"]), RespValue::ok());
        let pttl = exec(&d, &mut c, &["PTTL", "b"]).as_integer().unwrap();
        assert!(pttl > 4900 && pttl <= 5000);

        assert_eq!(exec(&d, &mut c, &["SET", "c", "1", "EX"]), RespValue::error("ERR syntax error"));
        assert_eq!(exec(&d, &mut c, &["SET", "c", "1", "EX", "soon"]), RespValue::error("ERR syntax error"));
        assert_eq!(
            exec(&d, &mut c, &["SET", "c", "1", "EX", "0"]),
            RespValue::error("ERR invalid expire time in 'set' command")
        );
        assert_eq!(exec(&d, &mut c, &["SET", "c", "1", "EX", "1", "PX", "1"]), RespValue::error("ERR syntax error"));
        assert_eq!(exec(&d, &mut c, &["SET", "c", "1", "KEEPTTL"]), RespValue::error("ERR syntax error"));
        assert_eq!(exec(&d, &mut c, &["GET", "c"]), RespValue::null());
    }

    #[test]
    fn test_set_nx_xx() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["SET", "k", "1", "XX"]), RespValue::null());
        assert_eq!(exec(&d, &mut c, &["SET", "k", "1", "NX"]), RespValue::ok());
        assert_eq!(exec(&d, &mut c, &["SET", "k", "2", "NX"]), RespValue::null());
        assert_eq!(exec(&d, &mut c, &["SET", "k", "3", "XX", "EX", "10"]), RespValue::ok());
        assert_eq!(
            exec(&d, &mut c, &["GET", "k"]),
            RespValue::bulk_string(Bytes::from("3"))
        );
        assert_eq!(exec(&d, &mut c, &["SET", "k", "4", "NX", "XX"]), RespValue::error("ERR syntax error"));
    }

    #[test]
    fn test_setex() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["SETEX", "k", "60", "v"]), RespValue::ok());
        let ttl = exec(&d, &mut c, &["TTL", "k"]).as_integer().unwrap();
        assert!((59..=60).contains(&ttl));

        assert!(exec(&d, &mut c, &["SETEX", "k", "abc", "v"]).is_error());
        assert!(exec(&d, &mut c, &["SETEX", "k", "-1", "v"]).is_error());
        assert!(exec(&d, &mut c, &["SETEX", "k", "10"]).is_error());
    }

    #[test]
    fn test_unrepresentable_ttl_is_rejected() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");
        let huge = i64::MAX.to_string();

        assert_eq!(
            exec(&d, &mut c, &["SET", "k", "v", "EX", &huge]),
            RespValue::error("ERR invalid expire time in 'set' command")
        );
        assert_eq!(
            exec(&d, &mut c, &["SETEX", "k", &huge, "v"]),
            RespValue::error("ERR invalid expire time in 'setex' command")
        );
        assert!(!d.store().exists(b"k"));

        exec(&d, &mut c, &["SET", "k", "v"]);
        assert_eq!(
            exec(&d, &mut c, &["EXPIRE", "k", &huge]),
            RespValue::error("ERR invalid expire time in 'expire' command")
        );
        assert_eq!(exec(&d, &mut c, &["TTL", "k"]), RespValue::integer(-1));
        assert_eq!(exec(&d, &mut c, &["GET", "k"]), RespValue::bulk_string("v"));
    }

    #[test]
    fn test_expire_and_ttl() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(exec(&d, &mut c, &["TTL", "missing"]), RespValue::integer(-2));
        assert_eq!(exec(&d, &mut c, &["PTTL", "missing"]), RespValue::integer(-2));
        assert_eq!(exec(&d, &mut c, &["EXPIRE", "missing", "10"]), RespValue::integer(0));

        exec(&d, &mut c, &["SET", "k", "v"]);
        assert_eq!(exec(&d, &mut c, &["TTL", "k"]), RespValue::integer(-1));

        assert_eq!(exec(&d, &mut c, &["EXPIRE", "k", "100"]), RespValue::integer(1));
        let ttl = exec(&d, &mut c, &["TTL", "k"]).as_integer().unwrap();
        assert!((99..=100).contains(&ttl));

        assert_eq!(exec(&d, &mut c, &["PEXPIRE", "k", "1500"]), RespValue::integer(1));
        let pttl = exec(&d, &mut c, &["PTTL", "k"]).as_integer().unwrap();
        assert!(pttl > 1400 && pttl <= 1500);

        assert_eq!(
            exec(&d, &mut c, &["EXPIRE", "k", "later"]),
            RespValue::error("ERR invalid expire time")
        );

        assert_eq!(exec(&d, &mut c, &["EXPIRE", "k", "0"]), RespValue::integer(1));
        assert_eq!(exec(&d, &mut c, &["GET", "k"]), RespValue::null());
    }

    #[test]
    fn test_pexpire_elapses() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        exec(&d, &mut c, &["SET", "k", "v"]);
        exec(&d, &mut c, &["PEXPIRE", "k", "20"]);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(exec(&d, &mut c, &["GET", "k"]), RespValue::null());
        assert_eq!(exec(&d, &mut c, &["TTL", "k"]), RespValue::integer(-2));
    }

    #[test]
    fn test_keys_and_pattern_delete() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        for key in ["hello", "hallo", "hbllo", "hllo", "hxllo", "heeeeello"] {
            exec(&d, &mut c, &["SET", key, "1"]);
        }

        let mut keys: Vec<_> = exec(&d, &mut c, &["KEYS", "h?llo"])
            .into_array()
            .unwrap()
            .into_iter()
            .map(|k| k.into_bytes().unwrap())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["hallo", "hbllo", "hello", "hxllo"]);

        assert!(exec(&d, &mut c, &["KEYS", "[abc"]).is_error());

        assert_eq!(exec(&d, &mut c, &["DEL", "h[a-e]llo"]), RespValue::integer(3));
        assert_eq!(exec(&d, &mut c, &["DEL", "*"]), RespValue::integer(3));
        assert_eq!(exec(&d, &mut c, &["KEYS", "*"]), RespValue::array(vec![]));
    }

    #[test]
    fn test_flushall() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        for i in 0..5 {
            exec(&d, &mut c, &["SET", &format!("k{}", i), "v"]);
        }

        assert_eq!(exec(&d, &mut c, &["FLUSHALL"]), RespValue::integer(5));
        assert_eq!(exec(&d, &mut c, &["FLUSHALL"]), RespValue::integer(0));
        assert!(d.store().is_empty());
    }

    #[test]
    fn test_only_successful_writes_are_recorded() {
        let persistor = Arc::new(RecordingPersistor::default());
        let d = Dispatcher::new(Arc::new(KeyValueStore::new()), persistor.clone(), 1).unwrap();
        let mut c = d.clients().register("127.0.0.1:5000");

        exec(&d, &mut c, &["SET", "a", "1"]);
        exec(&d, &mut c, &["GET", "a"]);
        exec(&d, &mut c, &["SET", "b"]);
        exec(&d, &mut c, &["SETEX", "b", "x", "2"]);
        exec(&d, &mut c, &["EXPIRE", "a", "100"]);
        exec(&d, &mut c, &["CLIENT", "SETNAME", "me"]);
        exec(&d, &mut c, &["DEL", "a"]);

        assert_eq!(
            persistor.lines(),
            vec![
                vec!["set", "a", "1"],
                vec!["expire", "a", "100"],
                vec!["del", "a"],
            ]
        );

        exec(&d, &mut c, &["FLUSHALL"]);
        assert_eq!(persistor.truncated.load(Ordering::SeqCst), 1);
        assert!(persistor.lines().is_empty());
    }

    #[test]
    fn test_replay_is_not_recorded() {
        let persistor = Arc::new(RecordingPersistor::default());
        let d = Dispatcher::new(Arc::new(KeyValueStore::new()), persistor.clone(), 1).unwrap();

        let reply = d.replay(vec![Bytes::from("set"), Bytes::from("k"), Bytes::from("v")]);
        assert_eq!(reply, RespValue::ok());
        assert!(d.store().exists(b"k"));
        assert!(persistor.lines().is_empty());
        assert_eq!(d.commands_processed(), 0);
    }

    #[test]
    fn test_aof_replay_equivalence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.aof");

        let live = {
            let aof = Arc::new(AofPersistor::open(&path, Duration::from_secs(1)).unwrap());
            let d = Dispatcher::new(Arc::new(KeyValueStore::new()), aof.clone(), 1).unwrap();
            let mut c = d.clients().register("127.0.0.1:5000");

            exec(&d, &mut c, &["SET", "a", "1"]);
            exec(&d, &mut c, &["SET", "b", "2"]);
            exec(&d, &mut c, &["DEL", "a"]);
            aof.close().unwrap();

            d.store().values()
        };

        let aof: Arc<dyn Persistor> =
            Arc::new(AofPersistor::open(&path, Duration::from_secs(1)).unwrap());
        let recovery = aof.load().unwrap();
        let d = Dispatcher::new(Arc::new(KeyValueStore::new()), aof, 1).unwrap();
        assert_eq!(d.restore(recovery).unwrap(), 3);

        let pairs = |items: Vec<Item>| {
            let mut pairs: Vec<_> = items.into_iter().map(|i| (i.key, i.data)).collect();
            pairs.sort();
            pairs
        };
        assert_eq!(pairs(d.store().values()), pairs(live));
        assert_eq!(pairs(d.store().values()), vec![(Bytes::from("b"), Bytes::from("2"))]);
    }

    #[test]
    fn test_concurrent_writes_are_recorded_in_apply_order() {
        let persistor = Arc::new(RecordingPersistor {
            record_delay: Duration::from_micros(20),
            ..Default::default()
        });
        let d = Arc::new(
            Dispatcher::new(Arc::new(KeyValueStore::new()), persistor.clone(), 1).unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let d = Arc::clone(&d);
                std::thread::spawn(move || {
                    let mut c = d.clients().register(format!("127.0.0.1:{}", 6000 + t));
                    for i in 0..50 {
                        let value = format!("{}-{}", t, i);
                        assert_eq!(exec(&d, &mut c, &["SET", "k", &value]), RespValue::ok());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let replayed = create_dispatcher();
        for argv in persistor.lines.lock().iter() {
            assert_eq!(replayed.replay(argv.clone()), RespValue::ok());
        }

        assert_eq!(persistor.lines().len(), 200);
        assert_eq!(
            replayed.store().get(b"k").map(|item| item.data),
            d.store().get(b"k").map(|item| item.data)
        );
    }

    #[test]
    fn test_restore_items() {
        let d = create_dispatcher();
        let items = vec![
            Item::new(Bytes::from("a"), Bytes::from("1")),
            Item::with_ttl(Bytes::from("b"), Bytes::from("2"), Duration::from_secs(60)),
        ];

        assert_eq!(d.restore(Recovery::Items(items)).unwrap(), 2);
        assert_eq!(d.restore(Recovery::Nothing).unwrap(), 0);
        assert!(d.store().get(b"b").unwrap().expires());
        assert_eq!(d.store().len(), 2);
    }

    #[test]
    fn test_restore_skips_corrupt_lines() {
        let d = create_dispatcher();
        let log: Vec<Result<Vec<Bytes>>> = vec![
            Ok(vec![Bytes::from("set"), Bytes::from("a"), Bytes::from("1")]),
            Err(Error::CorruptLog {
                line: 2,
                reason: "unbalanced quotes".to_string(),
            }),
            Ok(vec![Bytes::from("set"), Bytes::from("b"), Bytes::from("2")]),
        ];

        let replayed = d.restore(Recovery::Commands(Box::new(log.into_iter()))).unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(d.store().len(), 2);
    }

    #[test]
    fn test_info() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");
        exec(&d, &mut c, &["SET", "k", "v"]);

        let info = exec(&d, &mut c, &["INFO"]);
        let text = info.as_str().unwrap();
        assert!(text.contains("# Server"));
        assert!(text.contains("connected_clients:1"));
        assert!(text.contains("db0:keys=1,expires=0"));

        let info = exec(&d, &mut c, &["INFO", "Keyspace"]);
        let text = info.as_str().unwrap();
        assert!(text.starts_with("# Keyspace"));
        assert!(!text.contains("# Server"));
    }

    #[test]
    fn test_command_listing() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        let entries = exec(&d, &mut c, &["COMMAND"]).into_array().unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.as_array().unwrap()[0].as_str().unwrap().to_string())
            .collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"set".to_string()));

        let set = entries
            .iter()
            .find(|e| e.as_array().unwrap()[0].as_str() == Some("set"))
            .unwrap();
        assert_eq!(set.as_array().unwrap()[1], RespValue::simple_string("write"));
    }

    #[test]
    fn test_client_subcommands() {
        let d = create_dispatcher();
        let mut me = d.clients().register("127.0.0.1:5000");
        let _other = d.clients().register("127.0.0.1:5001");

        assert_eq!(exec(&d, &mut me, &["CLIENT", "ID"]), RespValue::integer(1));
        assert_eq!(exec(&d, &mut me, &["CLIENT", "GETNAME"]), RespValue::null());
        assert_eq!(exec(&d, &mut me, &["CLIENT", "SETNAME", "alpha"]), RespValue::ok());
        assert_eq!(
            exec(&d, &mut me, &["client", "getname"]),
            RespValue::bulk_string(Bytes::from("alpha"))
        );
        assert!(exec(&d, &mut me, &["CLIENT", "SETNAME", "has space"]).is_error());

        let info = exec(&d, &mut me, &["CLIENT", "INFO"]);
        let info = info.as_str().unwrap();
        assert!(info.starts_with("id=1 addr=127.0.0.1:5000 name=alpha age="));
        // Busy while CLIENT INFO itself runs
        assert!(info.ends_with("flags=b"));

        let list = exec(&d, &mut me, &["CLIENT", "LIST"]);
        let lines: Vec<_> = list.as_str().unwrap().split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("id=2 addr=127.0.0.1:5001 name= "));
        assert!(lines[1].ends_with("flags=N"));
    }

    #[test]
    fn test_client_subcommand_errors() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(
            exec(&d, &mut c, &["CLIENT"]),
            RespValue::error("ERR wrong number of arguments for 'client' command")
        );
        assert_eq!(
            exec(&d, &mut c, &["CLIENT", "PAUSE"]),
            RespValue::error("ERR unknown subcommand 'PAUSE' for 'client' command")
        );
        assert_eq!(
            exec(&d, &mut c, &["CLIENT", "SETNAME"]),
            RespValue::error("ERR wrong number of arguments for 'client|setname' command")
        );
    }

    #[test]
    fn test_client_kill() {
        let d = create_dispatcher();
        let mut me = d.clients().register("127.0.0.1:5000");
        let other = d.clients().register("127.0.0.1:5001");
        let mut named = d.clients().register("127.0.0.1:5002");
        exec(&d, &mut named, &["CLIENT", "SETNAME", "target"]);

        assert_eq!(exec(&d, &mut me, &["CLIENT", "KILL", "ID", "1"]), RespValue::integer(0));
        assert_eq!(exec(&d, &mut me, &["CLIENT", "KILL", "ID", "42"]), RespValue::integer(0));
        assert!(exec(&d, &mut me, &["CLIENT", "KILL", "ID", "x"]).is_error());
        assert!(exec(&d, &mut me, &["CLIENT", "KILL", "COLOR", "red"]).is_error());
        assert!(exec(&d, &mut me, &["CLIENT", "KILL"]).is_error());

        assert_eq!(
            exec(&d, &mut me, &["CLIENT", "KILL", "ADDR", "127.0.0.1:5001"]),
            RespValue::integer(1)
        );
        assert_eq!(
            exec(&d, &mut me, &["CLIENT", "KILL", "USER", "target"]),
            RespValue::integer(1)
        );
        assert_eq!(
            exec(&d, &mut me, &["CLIENT", "KILL", "127.0.0.1:5002"]),
            RespValue::integer(1)
        );
        assert_eq!(other.handle().flags(), ClientFlags::NONE);
    }

    #[test]
    fn test_config_get() {
        let settings = BTreeMap::from([
            ("hashtable.buckets".to_string(), "16".to_string()),
            ("server.port".to_string(), "7275".to_string()),
        ]);
        let d = create_dispatcher().with_settings(settings);
        let mut c = d.clients().register("127.0.0.1:5000");

        assert_eq!(
            exec(&d, &mut c, &["CONFIG", "GET", "hashtable.*"]),
            RespValue::bulk_array(["hashtable.buckets", "16"])
        );
        assert_eq!(
            exec(&d, &mut c, &["CONFIG", "GET", "*"]).into_array().unwrap().len(),
            4
        );
        assert!(exec(&d, &mut c, &["CONFIG", "SET", "x", "y"]).is_error());
    }

    #[test]
    fn test_busy_flag_cleared_after_execute() {
        let d = create_dispatcher();
        let mut c = d.clients().register("127.0.0.1:5000");

        exec(&d, &mut c, &["SET", "k", "v"]);
        assert_eq!(c.handle().flags(), ClientFlags::NONE);
        assert!(c.args().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_through_pool() {
        let d = Arc::new(create_dispatcher());
        let client = d.clients().register("127.0.0.1:5000");

        let (client, reply) = d.dispatch(make_command(&["SET", "k", "v"]), client).await.unwrap();
        assert_eq!(reply, RespValue::ok());

        let (client, reply) = d.dispatch(make_command(&["GET", "k"]), client).await.unwrap();
        assert_eq!(reply, RespValue::bulk_string(Bytes::from("v")));

        let (_, reply) = d.dispatch(RespValue::integer(3), client).await.unwrap();
        assert!(reply.is_error());
        assert_eq!(d.commands_processed(), 2);
    }

    #[tokio::test]
    async fn test_kill_of_busy_client_is_deferred() {
        let d = Arc::new(create_dispatcher());
        let mut victim = d.clients().register("127.0.0.1:5000");
        let mut killer = d.clients().register("127.0.0.1:5001");

        // The victim is mid-command while the kill arrives
        victim.begin_command();
        assert_eq!(
            exec(&d, &mut killer, &["CLIENT", "KILL", "ID", "1"]),
            RespValue::integer(1)
        );
        assert!(victim.handle().flags().contains(ClientFlags::CLOSE_ASAP));

        victim.after_command();
        tokio::time::timeout(Duration::from_secs(1), victim.handle().closed())
            .await
            .unwrap();
    }
}
