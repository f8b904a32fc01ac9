//! Completion tokens.
//!
//! Every operation posted to a completion port travels there by value and
//! comes back inside a [`Completion`] when it finishes. The operation owns
//! whatever resources the kernel side needs while it is in flight: the
//! reserved socket of an accept, or the I/O buffer of a receive or send.

use crate::runtime::connection::ConnectionId;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Identifier of a socket slot inside a completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub usize);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Exclusive ownership of one socket slot.
///
/// At any time a handle is held by exactly one of: the socket pool, a
/// connection, or an accept operation in flight. It is deliberately neither
/// `Clone` nor `Copy`; giving it away means giving up the socket.
#[derive(Debug, PartialEq, Eq)]
pub struct SocketHandle(SocketId);

impl SocketHandle {
    /// Wrap a slot id. Only completion port implementations mint handles.
    pub fn new(id: SocketId) -> Self {
        Self(id)
    }

    pub fn id(&self) -> SocketId {
        self.0
    }
}

/// Identity a completion is delivered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKey {
    /// No key; used by the wake sentinel.
    None,
    /// The listening socket.
    Listener,
    /// A socket associated with a live connection.
    Connection(ConnectionId),
}

/// A pending accept: the socket reserved for the next client, plus the
/// address pair filled in by the port once a client arrives.
#[derive(Debug, Default)]
pub struct AcceptOp {
    socket: Option<SocketHandle>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl AcceptOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the operation around a freshly reserved socket.
    pub fn arm(&mut self, socket: SocketHandle) {
        self.socket = Some(socket);
        self.local = None;
        self.peer = None;
    }

    pub fn socket(&self) -> Option<&SocketHandle> {
        self.socket.as_ref()
    }

    pub fn take_socket(&mut self) -> Option<SocketHandle> {
        self.socket.take()
    }

    /// Record the negotiated local and remote addresses.
    pub fn set_addresses(&mut self, local: SocketAddr, peer: SocketAddr) {
        self.local = Some(local);
        self.peer = Some(peer);
    }

    /// Returns `(local, peer)` once the accept has completed.
    pub fn addresses(&self) -> Option<(SocketAddr, SocketAddr)> {
        Some((self.local?, self.peer?))
    }
}

/// Kind of a completed operation, with the resources it carried.
#[derive(Debug)]
pub enum Operation {
    /// Accept on the listening socket.
    Accept(AcceptOp),
    /// Receive into the buffer; on success it is truncated to the bytes read.
    Receive(BytesMut),
    /// Send of the buffer contents.
    Send(BytesMut),
    /// No-op sentinel, posted to wake a worker.
    Wake,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Accept(_) => "accept",
            Operation::Receive(_) => "receive",
            Operation::Send(_) => "send",
            Operation::Wake => "wake",
        }
    }
}

/// A finished operation as popped from the completion queue.
#[derive(Debug)]
pub struct Completion {
    pub key: CompletionKey,
    pub op: Operation,
    /// Bytes transferred, or the error the operation failed with.
    pub result: io::Result<usize>,
}

impl Completion {
    /// The sentinel used to wake exactly one worker.
    pub fn wake() -> Self {
        Self {
            key: CompletionKey::None,
            op: Operation::Wake,
            result: Ok(0),
        }
    }

    pub fn accept(op: AcceptOp, result: io::Result<usize>) -> Self {
        Self {
            key: CompletionKey::Listener,
            op: Operation::Accept(op),
            result,
        }
    }

    pub fn receive(key: CompletionKey, buf: BytesMut, result: io::Result<usize>) -> Self {
        Self {
            key,
            op: Operation::Receive(buf),
            result,
        }
    }

    pub fn send(key: CompletionKey, buf: BytesMut, result: io::Result<usize>) -> Self {
        Self {
            key,
            op: Operation::Send(buf),
            result,
        }
    }
}
