//! cmdwire server binary.
//!
//! Loads configuration, wires the example command set into the server,
//! and runs until interrupted.

use cmdwire::commands::example_commands;
use cmdwire::config::Config;
use cmdwire::server::Server;
use cmdwire::status;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        bind = %config.bind_addr,
        port = config.port,
        poll_interval_ms = config.poll_interval_ms,
        io_timeout_ms = config.io_timeout_ms,
        "Starting cmdwire server"
    );

    let server = Server::new(config, Arc::new(example_commands()), status::tracing_sink());
    let addr = server.start().await?;
    info!(address = %addr, "Server running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}
