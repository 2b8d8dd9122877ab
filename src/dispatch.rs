//! Command dispatch: maps command names to handler functions.
//!
//! Registration happens once, before serving begins; the resulting table
//! is immutable and can be shared across connection tasks without locking.

use std::collections::HashMap;

type HandlerFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Capability interface satisfied by any concrete dispatcher.
///
/// Handlers inspect only their argument and return the response text
/// (without a trailing newline); they perform no socket I/O.
pub trait CommandHandler: Send + Sync {
    fn handle_command(&self, name: &str, arg: &str) -> String;
}

/// Immutable mapping from command name to handler function.
///
/// Names are case-sensitive and unique; re-registering a name replaces
/// the previous handler. The argument passed to a handler may be empty,
/// and each handler decides its own empty-argument behavior.
pub struct CommandTable {
    handlers: HashMap<String, HandlerFn>,
    names: Vec<String>,
}

impl CommandTable {
    pub fn builder() -> CommandTableBuilder {
        CommandTableBuilder {
            handlers: HashMap::new(),
            names: Vec::new(),
        }
    }

    /// Registered command names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl CommandHandler for CommandTable {
    fn handle_command(&self, name: &str, arg: &str) -> String {
        match self.handlers.get(name) {
            Some(handler) => handler(arg),
            None => format!("ERROR: Unknown command '{name}'. Type 'help' for a list of commands."),
        }
    }
}

/// Builder for a [`CommandTable`].
pub struct CommandTableBuilder {
    handlers: HashMap<String, HandlerFn>,
    names: Vec<String>,
}

impl CommandTableBuilder {
    pub fn command<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        if self.handlers.insert(name.to_string(), Box::new(handler)).is_none() {
            self.names.push(name.to_string());
        }
        self
    }

    /// Names registered so far, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn build(self) -> CommandTable {
        CommandTable {
            handlers: self.handlers,
            names: self.names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CommandTable {
        CommandTable::builder()
            .command("echo", |arg| format!("echo: {arg}"))
            .command("ping", |_| "pong".to_string())
            .build()
    }

    #[test]
    fn test_dispatch_known_command() {
        let table = table();
        assert_eq!(table.handle_command("echo", "hello"), "echo: hello");
        assert_eq!(table.handle_command("ping", ""), "pong");
    }

    #[test]
    fn test_dispatch_unknown_command() {
        let table = table();
        assert_eq!(
            table.handle_command("bogus", ""),
            "ERROR: Unknown command 'bogus'. Type 'help' for a list of commands."
        );
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let table = table();
        assert!(table.contains("echo"));
        assert!(!table.contains("ECHO"));
        assert!(table
            .handle_command("ECHO", "x")
            .contains("Unknown command 'ECHO'"));
    }

    #[test]
    fn test_empty_argument_reaches_handler() {
        let table = table();
        assert_eq!(table.handle_command("echo", ""), "echo: ");
    }

    #[test]
    fn test_reregistration_replaces_handler_keeps_order() {
        let table = CommandTable::builder()
            .command("a", |_| "one".to_string())
            .command("b", |_| "two".to_string())
            .command("a", |_| "three".to_string())
            .build();

        assert_eq!(table.handle_command("a", ""), "three");
        assert_eq!(table.names(), ["a", "b"]);
    }
}
