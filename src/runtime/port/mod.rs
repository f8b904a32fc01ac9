//! Completion port abstraction.
//!
//! The core never touches sockets directly. It posts operations to a
//! [`CompletionPort`] and later pops their [`Completion`]s from the port's
//! shared queue. Posting never blocks; only [`CompletionPort::wait`] does.
//!
//! Implementations:
//! - [`MioPort`]: proactor emulation over mio readiness (epoll/kqueue).
//! - `FakePort` (tests only): scripted completions with socket accounting.

mod mio_port;

#[cfg(test)]
pub(crate) mod fake;

pub use self::mio_port::MioPort;

use crate::runtime::connection::ConnectionId;
use crate::runtime::token::{AcceptOp, Completion, Operation, SocketHandle};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// An accept that could not be posted. The operation is handed back so its
/// reserved socket is never lost.
#[derive(Debug, thiserror::Error)]
#[error("failed to post accept: {error}")]
pub struct PostAcceptError {
    pub op: AcceptOp,
    #[source]
    pub error: io::Error,
}

/// A queue of completed asynchronous socket operations.
pub trait CompletionPort: Send + Sync {
    /// Bind and listen on `addr`. Returns the address actually bound.
    fn listen(&self, addr: SocketAddr, backlog: i32) -> io::Result<SocketAddr>;

    /// Close the listening socket. Accepts still pending complete with an error.
    fn close_listener(&self);

    /// Allocate a new, unconnected socket slot.
    fn create_socket(&self) -> io::Result<SocketHandle>;

    /// Deliver future completions for `socket` under `key`.
    fn associate(&self, socket: &SocketHandle, key: ConnectionId) -> io::Result<()>;

    /// Wait for the next client on the listener, handing it the op's socket.
    fn post_accept(&self, op: AcceptOp) -> Result<(), PostAcceptError>;

    /// Receive up to `buf.len()` bytes.
    fn post_recv(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()>;

    /// Send the whole of `buf`.
    fn post_send(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()>;

    /// Enqueue the wake sentinel.
    fn post_wake(&self) -> io::Result<()>;

    /// Block until a completion is available.
    ///
    /// Errors carry no operation: `TimedOut` when `timeout` elapsed, anything
    /// else means the queue itself failed.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Completion>;

    /// Drop the connection on `socket` and leave the slot reusable.
    /// Operations in flight on it complete with an error.
    fn disconnect(&self, socket: &SocketHandle) -> io::Result<()>;

    /// Release the socket slot for good.
    fn close(&self, socket: SocketHandle);

    /// Stop the port. Returns every operation that was still in flight or
    /// queued, so the caller can release what they own.
    fn shutdown(&self) -> Vec<Operation>;

    /// Number of socket slots currently allocated (listener excluded).
    fn open_sockets(&self) -> usize;
}
