//! completion-server: demo binary for the completion-queue server engine.
//!
//! Serves one of the demo protocols:
//! - `echo`: length-prefixed payloads echoed back
//! - `ping`: `PING` / `PONG` health check
//!
//! The server runs until stdin reaches EOF (Ctrl-D), then shuts down cleanly.
//! Configuration via command-line arguments or TOML file.

use completion_server::config::{Config, ProtocolType};
use completion_server::protocols::{EchoHandler, PingHandler};
use completion_server::Server;
use std::io::Read;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Room left in the receive cache for an echo header.
const ECHO_HEADER_RESERVE: usize = 32;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        workers = config.worker_count(),
        io_buffer_size = config.io_buffer_size,
        recv_cache_limit = config.recv_cache_limit,
        "Starting completion-server"
    );

    let mut server = match config.protocol {
        ProtocolType::Echo => {
            let max_payload = config.recv_cache_limit.saturating_sub(ECHO_HEADER_RESERVE);
            Server::startup(&config, EchoHandler::new(max_payload))?
        }
        ProtocolType::Ping => Server::startup(&config, PingHandler)?,
    };

    info!(addr = %server.local_addr(), "Press Ctrl-D to stop");
    wait_for_eof()?;

    server.shutdown();
    Ok(())
}

/// Block until stdin is closed.
fn wait_for_eof() -> std::io::Result<()> {
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 256];
    while stdin.read(&mut buf)? > 0 {}
    Ok(())
}
