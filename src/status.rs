//! Status event reporting.
//!
//! The server core never writes to a log directly. Every significant
//! lifecycle and per-connection event is delivered to an injected sink
//! as a [`StatusEvent`] carrying a severity, a message, and a success
//! flag. The sink runs inline with server operations and must not block.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Severity attached to a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// One operational event emitted by the server.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub severity: Severity,
    pub message: String,
    pub success: bool,
}

impl StatusEvent {
    pub fn new(severity: Severity, message: impl Into<String>, success: bool) -> Self {
        Self {
            severity,
            message: message.into(),
            success,
        }
    }
}

/// Sink invoked synchronously from whichever task produced the event.
pub type StatusSink = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Sink that forwards events to `tracing` at the mapped level.
pub fn tracing_sink() -> StatusSink {
    Arc::new(|event| match event.severity {
        Severity::Debug => debug!(success = event.success, "{}", event.message),
        Severity::Info => info!(success = event.success, "{}", event.message),
        Severity::Warn => warn!(success = event.success, "{}", event.message),
        Severity::Error | Severity::Fatal => {
            error!(success = event.success, "{}", event.message)
        }
    })
}

/// Sink that drops every event. Useful when no reporting is wanted.
pub fn null_sink() -> StatusSink {
    Arc::new(|_| {})
}

/// Queue-and-dispatch stage for consumers that are not thread-safe.
///
/// Events are enqueued from any task without blocking; a dedicated task
/// drains the queue and invokes `consumer` one event at a time. The task
/// exits once every clone of the returned sink has been dropped and the
/// queue is empty.
///
/// Must be called from within a tokio runtime.
pub fn channel_sink<F>(mut consumer: F) -> (StatusSink, tokio::task::JoinHandle<()>)
where
    F: FnMut(StatusEvent) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    let worker = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            consumer(event);
        }
    });

    let sink: StatusSink = Arc::new(move |event| {
        // Send fails only after the worker is gone; nothing to report then.
        let _ = tx.send(event);
    });

    (sink, worker)
}
