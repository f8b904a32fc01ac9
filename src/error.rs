//! Error types surfaced by the server.
//!
//! Nothing crosses the asynchronous boundary: connection-level failures end
//! in a teardown reported through `on_disconnect`, and only the synchronous
//! entry points (`Server::startup`, `Connection::send`) return errors.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;

/// Failure to bring the server up. Nothing is left running or open.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create completion port: {0}")]
    Port(#[source] io::Error),
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failure of `Connection::send`.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Disconnected,
    #[error("failed to post send: {0}")]
    Io(#[from] io::Error),
}

/// Received bytes would push the reassembly cache past its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("receive cache overflow: {cached} cached + {incoming} incoming > {limit}")]
pub struct CacheOverflow {
    pub cached: usize,
    pub incoming: usize,
    pub limit: usize,
}

/// Failure on the receive path; fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Overflow(#[from] CacheOverflow),
    #[error("failed to post receive: {0}")]
    Post(#[source] io::Error),
}
