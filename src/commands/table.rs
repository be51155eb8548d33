//! The static command table.
//!
//! Built once at start-up and never mutated, so lookups need no lock.

use crate::commands::client::Client;
use crate::commands::handler::{self as h, Dispatcher};
use crate::protocol::RespValue;
use std::collections::HashMap;
use std::fmt;

/// A command implementation.
pub type Handler = fn(&Dispatcher, &mut Client) -> RespValue;

/// How a command interacts with persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Never persisted
    Read,
    /// Forwarded to the persistor after a successful execution
    Write,
    /// Manages persistence itself (`FLUSHALL`)
    Admin,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Read => "read",
            CommandKind::Write => "write",
            CommandKind::Admin => "admin",
        })
    }
}

/// What a table entry does when selected.
#[derive(Clone, Copy)]
pub enum Action {
    Run(Handler),
    /// `argv[0]` selects one of these
    Dispatch(&'static [Command]),
}

#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: CommandKind,
    pub action: Action,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Command {
    const fn run(
        name: &'static str,
        kind: CommandKind,
        description: &'static str,
        handler: Handler,
    ) -> Self {
        Self {
            name,
            description,
            kind,
            action: Action::Run(handler),
        }
    }

    /// Finds a subcommand by its lower-cased name.
    pub fn sub_command(&self, name: &str) -> Option<&'static Command> {
        match self.action {
            Action::Dispatch(subs) => subs.iter().find(|c| c.name == name),
            Action::Run(_) => None,
        }
    }
}

use CommandKind::{Admin, Read, Write};

static CLIENT_COMMANDS: &[Command] = &[
    Command::run("id", Read, "Returns the connection's client id", h::client_id),
    Command::run("info", Read, "Describes the current connection", h::client_info),
    Command::run("list", Read, "Describes every open connection", h::client_list),
    Command::run("kill", Read, "Closes connections by id, address or name", h::client_kill),
    Command::run("setname", Read, "Names the current connection", h::client_setname),
    Command::run("getname", Read, "Returns the current connection's name", h::client_getname),
];

static CONFIG_COMMANDS: &[Command] = &[Command::run(
    "get",
    Read,
    "Returns the configuration parameters matching a pattern",
    h::config_get,
)];

static COMMANDS: &[Command] = &[
    Command::run("get", Read, "Returns the value of a key", h::get),
    Command::run("set", Write, "Sets a key, optionally with a TTL or a condition", h::set),
    Command::run("setex", Write, "Sets a key with a TTL in seconds", h::setex),
    Command::run("del", Write, "Deletes keys, or the keys matching a pattern", h::del),
    Command::run("keys", Read, "Lists the keys matching a pattern", h::keys),
    Command::run("expire", Write, "Sets a key's TTL in seconds", h::expire),
    Command::run("pexpire", Write, "Sets a key's TTL in milliseconds", h::pexpire),
    Command::run("ttl", Read, "Returns a key's remaining TTL in seconds", h::ttl),
    Command::run("pttl", Read, "Returns a key's remaining TTL in milliseconds", h::pttl),
    Command::run("flushall", Admin, "Deletes every key and resets persistence", h::flushall),
    Command::run("ping", Read, "Returns PONG or the given message", h::ping),
    Command::run("info", Read, "Returns server information", h::info),
    Command::run("command", Read, "Lists the supported commands", h::command),
    Command {
        name: "client",
        description: "Manages client connections",
        kind: Read,
        action: Action::Dispatch(CLIENT_COMMANDS),
    },
    Command {
        name: "config",
        description: "Inspects server configuration",
        kind: Read,
        action: Action::Dispatch(CONFIG_COMMANDS),
    },
];

/// Case-insensitive index over the command table.
#[derive(Debug)]
pub struct CommandTable {
    commands: HashMap<&'static str, &'static Command>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            commands: COMMANDS.iter().map(|c| (c.name, c)).collect(),
        }
    }

    /// Looks up a command by its lower-cased name.
    pub fn get(&self, name: &str) -> Option<&'static Command> {
        self.commands.get(name).copied()
    }

    /// All commands, sorted by name.
    pub fn sorted(&self) -> Vec<&'static Command> {
        let mut commands: Vec<_> = self.commands.values().copied().collect();
        commands.sort_by_key(|c| c.name);
        commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let table = CommandTable::new();

        assert_eq!(table.get("set").unwrap().kind, CommandKind::Write);
        assert_eq!(table.get("get").unwrap().kind, CommandKind::Read);
        assert_eq!(table.get("flushall").unwrap().kind, CommandKind::Admin);
        assert!(table.get("SET").is_none());
        assert!(table.get("lpush").is_none());
    }

    #[test]
    fn test_sub_commands() {
        let table = CommandTable::new();
        let client = table.get("client").unwrap();

        for name in ["id", "info", "list", "kill", "setname", "getname"] {
            let sub = client.sub_command(name).unwrap();
            assert_eq!(sub.kind, CommandKind::Read);
        }
        assert!(client.sub_command("pause").is_none());
        assert!(table.get("get").unwrap().sub_command("id").is_none());
    }

    #[test]
    fn test_sorted() {
        let table = CommandTable::new();
        let names: Vec<_> = table.sorted().iter().map(|c| c.name).collect();

        let mut expected = names.clone();
        expected.sort_unstable();
        assert_eq!(names, expected);
        assert_eq!(names.len(), table.len());
    }
}
