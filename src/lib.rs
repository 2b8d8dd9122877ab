//! cmdwire: a single-shot TCP command server.
//!
//! Accepts text commands over TCP, dispatches each to a registered
//! handler, and returns one textual response per connection:
//!
//! - One request per connection: `<command>[ <argument>]`
//! - One response per connection: the handler's result plus a newline,
//!   then the server closes the connection
//!
//! The command set is pluggable: anything implementing [`CommandHandler`]
//! can be served, and [`CommandTable`] provides an immutable name-to-handler
//! registry built once before serving. Operational events are delivered to
//! an injected status sink rather than logged directly.

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod server;
pub mod status;

pub use config::{Config, ConfigError};
pub use dispatch::{CommandHandler, CommandTable};
pub use server::{Server, ServerError};
pub use status::{Severity, StatusEvent, StatusSink};
