//! Server lifecycle controller and per-connection handling.
//!
//! The server owns the listening socket and one accept-loop task. Every
//! accepted connection is handed to its own detached task, which performs
//! exactly one read / dispatch / write cycle and then closes the stream.
//!
//! Lifecycle is a four-state machine (Idle, Starting, Running, Stopping).
//! The accept loop polls with a bounded timeout instead of blocking
//! indefinitely, so a stop request is observed within one polling interval.

use crate::config::{Config, SchedPolicy};
use crate::dispatch::CommandHandler;
use crate::status::{Severity, StatusEvent, StatusSink};
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;

tokio::task_local! {
    /// Set for the duration of the accept loop, so that a `stop` issued
    /// from inside the loop's own task can skip joining itself.
    static IN_ACCEPT_LOOP: ();
}

/// Errors surfaced by [`Server::start`].
#[derive(Debug)]
pub enum ServerError {
    /// `start` was called while the server was not idle.
    AlreadyRunning,
    /// Socket creation, bind, or listen failed.
    Bind(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "Server is already running"),
            ServerError::Bind(e) => write!(f, "Failed to bind listening socket: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// State shared between the controller and the accept-loop task.
struct Shared {
    config: Config,
    handler: Arc<dyn CommandHandler>,
    status: StatusSink,
    state: AtomicU8,
}

impl Shared {
    fn emit(&self, severity: Severity, message: impl Into<String>, success: bool) {
        (self.status)(StatusEvent::new(severity, message, success));
    }
}

/// A single-shot TCP command server.
///
/// Constructed idle; `start` binds the socket and launches the accept
/// loop, `stop` shuts both down. At most one accept loop is ever active
/// per instance.
pub struct Server {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config, handler: Arc<dyn CommandHandler>, status: StatusSink) -> Self {
        Server {
            shared: Arc::new(Shared {
                config,
                handler,
                status,
                state: AtomicU8::new(IDLE),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listening socket and launch the accept loop.
    ///
    /// Returns the bound local address (useful with port 0). Fails if the
    /// server is not idle or if the socket cannot be bound; either way the
    /// failure is also reported through the status sink and the server is
    /// left idle with any previously running accept loop untouched.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let shared = &self.shared;

        if shared
            .state
            .compare_exchange(IDLE, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            shared.emit(
                Severity::Error,
                "start requested but server is already running",
                false,
            );
            return Err(ServerError::AlreadyRunning);
        }

        let listener = match bind_listener(&shared.config) {
            Ok(listener) => listener,
            Err(e) => {
                shared.emit(
                    Severity::Error,
                    format!(
                        "failed to bind {}:{}: {e}",
                        shared.config.bind_addr, shared.config.port
                    ),
                    false,
                );
                shared.state.store(IDLE, Ordering::Release);
                return Err(ServerError::Bind(e));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                shared.emit(Severity::Error, format!("failed to read local address: {e}"), false);
                shared.state.store(IDLE, Ordering::Release);
                return Err(ServerError::Bind(e));
            }
        };

        shared.emit(Severity::Info, format!("listening on {local_addr}"), true);

        // The loop only runs while the state reads Running, so the
        // transition must happen before the task is spawned.
        shared.state.store(RUNNING, Ordering::Release);
        let loop_shared = Arc::clone(shared);
        let handle = tokio::spawn(IN_ACCEPT_LOOP.scope((), accept_loop(listener, loop_shared)));

        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(local_addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    ///
    /// Idempotent: stopping an idle server is a no-op. In-flight connection
    /// tasks are not tracked and may complete after `stop` returns. Safe to
    /// call from any task, including the accept loop's own.
    pub async fn stop(&self) {
        let shared = &self.shared;

        if shared
            .state
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        shared.emit(Severity::Info, "stopping server", true);

        let handle = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        // Joining our own task would deadlock; the loop exits on its own
        // once it observes the state change.
        let called_from_loop = IN_ACCEPT_LOOP.try_with(|_| ()).is_ok();
        if let Some(handle) = handle {
            if called_from_loop {
                drop(handle);
            } else {
                let _ = handle.await;
            }
        }

        shared.state.store(IDLE, Ordering::Release);
        shared.emit(Severity::Info, "server stopped", true);
    }

    /// Lock-free status query, usable concurrently with `start`/`stop`.
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == RUNNING
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Destruction implies stop, but Drop cannot await the join; the
        // accept loop is aborted instead and the listener closes with it.
        if let Ok(mut guard) = self.accept_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.shared.state.store(IDLE, Ordering::Release);
    }
}

/// Build the listening socket: address/port reuse, non-blocking mode,
/// bounded backlog.
fn bind_listener(config: &Config) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::new(config.bind_addr, config.port);

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog as i32)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections until the lifecycle state leaves Running.
///
/// Each accept attempt is bounded by the polling interval so shutdown is
/// observed within one interval. Accept errors are reported and the loop
/// continues; only a state change ends it. The listener is dropped (and
/// the socket closed) when the loop returns.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    #[cfg(unix)]
    if let Some(policy) = shared.config.accept_policy {
        apply_accept_priority(&shared, policy, shared.config.accept_priority);
    }

    let poll_interval = Duration::from_millis(shared.config.poll_interval_ms);

    while shared.state.load(Ordering::Acquire) == RUNNING {
        match timeout(poll_interval, listener.accept()).await {
            // Polling interval elapsed; loop around and re-check the state.
            Err(_) => continue,

            Ok(Ok((stream, peer))) => {
                shared.emit(Severity::Debug, format!("client connected: {peer}"), true);

                // Fire-and-forget: connection tasks are not tracked and may
                // outlive a stop() call.
                let conn_shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    handle_connection(stream, conn_shared).await;
                });
            }

            Ok(Err(e)) => {
                shared.emit(Severity::Error, format!("accept failed: {e}"), false);
            }
        }
    }

    shared.emit(Severity::Info, "accept loop exited", true);
}

/// Handle one client connection: a single read, dispatch, write cycle.
///
/// Every exit path closes the connection (the stream drops with the task)
/// and nothing propagates to the accept loop. Read and write are each
/// bounded by the configured I/O timeout.
async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let io_timeout = Duration::from_millis(shared.config.io_timeout_ms);
    let mut buf = BytesMut::with_capacity(shared.config.max_request_bytes);

    let n = match timeout(io_timeout, stream.read_buf(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            shared.emit(Severity::Debug, format!("read failed: {e}"), false);
            return;
        }
        Err(_) => {
            shared.emit(Severity::Debug, "read timed out", false);
            return;
        }
    };

    if n == 0 {
        shared.emit(Severity::Debug, "client closed without sending a request", false);
        return;
    }

    let input = String::from_utf8_lossy(&buf);
    let (command, arg) = parse_request(&input);
    shared.emit(
        Severity::Debug,
        format!("command received: '{command}', arg: '{arg}'"),
        true,
    );

    let mut response = shared.handler.handle_command(command, arg);
    response.push('\n');

    match timeout(io_timeout, stream.write_all(response.as_bytes())).await {
        Ok(Ok(())) => {
            shared.emit(Severity::Debug, "response sent", true);
        }
        Ok(Err(e)) => {
            shared.emit(Severity::Debug, format!("write failed: {e}"), false);
        }
        Err(_) => {
            shared.emit(Severity::Debug, "write timed out", false);
        }
    }
}

/// Split one raw request into command name and argument.
///
/// Outer whitespace (spaces, tabs, CR, LF) is trimmed first. The command
/// is the text before the first space; the argument is the remainder,
/// trimmed once. Without a space the whole input is the command.
fn parse_request(input: &str) -> (&str, &str) {
    const OUTER: &[char] = &[' ', '\t', '\r', '\n'];

    let trimmed = input.trim_matches(OUTER);
    match trimmed.split_once(' ') {
        Some((command, arg)) => (command, arg.trim_matches(OUTER)),
        None => (trimmed, ""),
    }
}

/// Apply a scheduling policy to the thread currently running the accept
/// loop. Failure (typically missing privileges for real-time policies) is
/// reported through the status sink and is not fatal.
#[cfg(unix)]
fn apply_accept_priority(shared: &Shared, policy: SchedPolicy, priority: i32) {
    let native = match policy {
        SchedPolicy::Other => libc::SCHED_OTHER,
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
    };

    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;

    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), native, &param) };
    if rc == 0 {
        shared.emit(
            Severity::Debug,
            format!("accept loop scheduling set to {policy:?} priority {priority}"),
            true,
        );
    } else {
        let e = std::io::Error::from_raw_os_error(rc);
        shared.emit(
            Severity::Warn,
            format!("failed to set accept loop scheduling: {e}"),
            false,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::example_commands;
    use crate::status::null_sink;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio_test::assert_ok;

    fn test_config() -> Config {
        Config {
            port: 0, // let the kernel pick
            ..Config::default()
        }
    }

    fn test_server(config: Config) -> Server {
        Server::new(config, Arc::new(example_commands()), null_sink())
    }

    async fn send_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        // The server closes the connection after one response.
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[test]
    fn test_parse_request_command_and_argument() {
        assert_eq!(parse_request("power 100\n"), ("power", "100"));
        assert_eq!(parse_request("version"), ("version", ""));
        assert_eq!(parse_request("power\r\n"), ("power", ""));
    }

    #[test]
    fn test_parse_request_irregular_whitespace() {
        assert_eq!(parse_request("  freq   14074000  "), ("freq", "14074000"));
        assert_eq!(parse_request("\t call  N0CALL \r\n"), ("call", "N0CALL"));
    }

    #[test]
    fn test_parse_request_argument_keeps_inner_spacing() {
        assert_eq!(parse_request("grid AA00 bb11"), ("grid", "AA00 bb11"));
    }

    #[test]
    fn test_parse_request_empty_input() {
        assert_eq!(parse_request("\r\n"), ("", ""));
        assert_eq!(parse_request(""), ("", ""));
    }

    #[tokio::test]
    async fn test_round_trip_with_argument() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        let response = send_request(addr, "power 100").await;
        assert_eq!(response, "Power set to 100\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_round_trip_without_argument() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        let response = send_request(addr, "power").await;
        assert_eq!(response, "Power <example response>\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_command_response() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        let response = send_request(addr, "bogus").await;
        assert!(response.contains("Unknown command 'bogus'"));
        assert!(response.contains("help"));
        assert!(response.ends_with('\n'));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_close_without_request() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.shutdown().await.unwrap();

        // No request means no response; the server just closes.
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_client_is_timed_out() {
        let config = Config {
            io_timeout_ms: 100,
            ..test_config()
        };
        let server = test_server(config);
        let addr = assert_ok!(server.start().await);

        let mut stream = TcpStream::connect(addr).await.unwrap();

        // Send nothing; the server should give up and close the connection.
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = test_server(test_config());

        // Stopping a never-started server is a no-op.
        server.stop().await;
        assert!(!server.is_running());

        assert_ok!(server.start().await);
        assert!(server.is_running());

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_second_start_fails_and_first_keeps_serving() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyRunning)
        ));

        // The original listener must be untouched.
        let response = send_request(addr, "version").await;
        assert_eq!(response, format!("Version {}\n", env!("CARGO_PKG_VERSION")));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_reverts_to_idle() {
        let config = Config {
            // TEST-NET-1, not assigned to any local interface.
            bind_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            ..test_config()
        };
        let server = test_server(config);

        assert!(matches!(server.start().await, Err(ServerError::Bind(_))));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_default_bind_is_loopback() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);
        assert!(addr.ip().is_loopback());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = test_server(test_config());

        let addr = assert_ok!(server.start().await);
        assert_eq!(send_request(addr, "xmit").await, "Xmit <example response>\n");
        server.stop().await;

        let addr = assert_ok!(server.start().await);
        assert_eq!(send_request(addr, "xmit").await, "Xmit <example response>\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_within_polling_interval() {
        let server = test_server(test_config());
        assert_ok!(server.start().await);

        // Let the loop settle into its accept poll.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        server.stop().await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stop took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_concurrent_connections_no_cross_talk() {
        let server = test_server(test_config());
        let addr = assert_ok!(server.start().await);

        let mut tasks = Vec::new();
        for i in 0..50 {
            tasks.push(tokio::spawn(async move {
                let response = send_request(addr, &format!("call client{i}")).await;
                assert_eq!(response, format!("Call set to client{i}\n"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_status_events_reported() {
        use std::sync::Mutex as StdMutex;

        let events: Arc<StdMutex<Vec<StatusEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sink: StatusSink = Arc::new(move |event| {
            events_clone.lock().unwrap().push(event);
        });

        let server = Server::new(test_config(), Arc::new(example_commands()), sink);
        let addr = assert_ok!(server.start().await);
        send_request(addr, "freq 14074000").await;
        server.stop().await;

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.severity == Severity::Info && e.message.starts_with("listening on")));
        assert!(events
            .iter()
            .any(|e| e.severity == Severity::Debug && e.message.starts_with("client connected")));
        assert!(events
            .iter()
            .any(|e| e.message.contains("command received: 'freq'")));
        assert!(events
            .iter()
            .any(|e| e.severity == Severity::Info && e.message == "server stopped"));
    }
}
