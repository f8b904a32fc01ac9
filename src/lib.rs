//! completion-server: a completion-queue driven TCP server engine.
//!
//! A fixed pool of worker threads drains a shared completion queue fed by
//! posted accept, receive and send operations. Applications plug in through
//! [`ConnectionHandler`]:
//!
//! - `on_receive` sees the byte stream, reassembled across receives, and
//!   reports how many bytes it consumed
//! - `on_disconnect` runs exactly once per accepted connection
//! - `Connection::send` queues outbound bytes without blocking
//!
//! Configuration via CLI arguments or TOML file, see [`config`].

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;
mod server;

pub use config::Config;
pub use error::{CacheOverflow, ReceiveError, SendError, StartupError};
pub use runtime::{handler_fn, Connection, ConnectionHandler, ConnectionId, SendOutcome};
pub use server::Server;
