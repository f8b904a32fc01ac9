//! Per-client connection state and the registry of live connections.
//!
//! A [`Connection`] owns its socket, its receive reassembly cache and its
//! outbound buffers. The receive and send paths have separate locks, so one
//! worker can deliver bytes while another finishes a send on the same
//! connection, and unrelated connections never contend at all.

use crate::error::{ReceiveError, SendError};
use crate::runtime::buffer::{OutboundBuffer, ReceiveCache};
use crate::runtime::handler::ConnectionHandler;
use crate::runtime::port::CompletionPort;
use crate::runtime::token::SocketHandle;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Stable, generation-checked handle of a registered connection.
///
/// The slot index is reused once a connection leaves the registry; the
/// generation is not, so a stale id never resolves to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u64,
}

impl ConnectionId {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Result of a successful [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmission started right away.
    Sent,
    /// Another transmission is in progress; the bytes will follow it.
    Queued,
}

/// Sizes every connection is created with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionLimits {
    /// Largest single receive or send handed to the port.
    pub io_buffer_size: usize,
    /// Largest number of unconsumed bytes kept for the handler.
    pub recv_cache_limit: usize,
}

struct SendState {
    outbound: OutboundBuffer,
    /// The send I/O buffer while no transmission holds it.
    io: Option<BytesMut>,
}

/// A connected client.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    socket: Mutex<Option<SocketHandle>>,
    recv: Mutex<ReceiveCache>,
    send: Mutex<SendState>,
    port: Arc<dyn CompletionPort>,
    io_buffer_size: usize,
    closing: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        socket: SocketHandle,
        port: Arc<dyn CompletionPort>,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            socket: Mutex::new(Some(socket)),
            recv: Mutex::new(ReceiveCache::new(limits.recv_cache_limit)),
            send: Mutex::new(SendState {
                outbound: OutboundBuffer::new(limits.io_buffer_size),
                io: None,
            }),
            port,
            io_buffer_size: limits.io_buffer_size,
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether teardown has started.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of received bytes waiting for the handler.
    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.recv.lock().len()
    }

    /// Transmit `data`.
    ///
    /// If a transmission is already in progress the bytes are queued behind
    /// it and go out in call order. Payloads larger than the I/O buffer are
    /// split across completions.
    pub fn send(&self, data: &[u8]) -> Result<SendOutcome, SendError> {
        if self.is_closing() {
            return Err(SendError::Disconnected);
        }
        if data.is_empty() {
            return Ok(SendOutcome::Sent);
        }

        let mut send = self.send.lock();
        let mut io = send
            .io
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.io_buffer_size));

        match send.outbound.push(data, &mut io) {
            SendOutcome::Queued => {
                send.io = Some(io);
                Ok(SendOutcome::Queued)
            }
            SendOutcome::Sent => match self.post_send(io) {
                Ok(()) => Ok(SendOutcome::Sent),
                Err(e) => {
                    send.outbound.abort();
                    Err(e)
                }
            },
        }
    }

    /// The send holding `io` finished after transferring `transferred` bytes.
    ///
    /// Fails if the next chunk could not be posted. Unsent bytes are dropped
    /// then, and the caller must tear the connection down.
    pub(crate) fn on_send_complete(
        &self,
        mut io: BytesMut,
        transferred: usize,
    ) -> Result<(), SendError> {
        let mut send = self.send.lock();

        // A short write leaves the tail of the chunk to go out first.
        if transferred < io.len() {
            io.advance(transferred);
            return self.resume_send(&mut send, io);
        }

        if !send.outbound.complete(&mut io) {
            send.io = Some(io);
            return Ok(());
        }

        self.resume_send(&mut send, io)
    }

    fn resume_send(&self, send: &mut SendState, io: BytesMut) -> Result<(), SendError> {
        self.post_send(io).map_err(|e| {
            debug!(conn_id = %self.id, error = %e, "Failed to continue send");
            send.outbound.abort();
            e
        })
    }

    /// Run freshly received bytes through the reassembly cache and the
    /// handler, then post the next receive with the same buffer.
    pub(crate) fn on_receive(
        self: &Arc<Self>,
        buf: BytesMut,
        handler: &dyn ConnectionHandler,
    ) -> Result<(), ReceiveError> {
        let mut cache = self.recv.lock();
        cache.deliver(&buf, |data| handler.on_receive(self, data))?;
        self.post_receive(buf).map_err(ReceiveError::Post)
    }

    /// Deliver completions for this connection's socket under its id.
    pub(crate) fn associate(&self) -> io::Result<()> {
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or_else(not_connected)?;
        self.port.associate(socket, self.id)
    }

    /// Post the first receive.
    pub(crate) fn start_receiving(&self) -> io::Result<()> {
        self.post_receive(BytesMut::with_capacity(self.io_buffer_size))
    }

    fn post_receive(&self, mut buf: BytesMut) -> io::Result<()> {
        buf.clear();
        buf.resize(self.io_buffer_size, 0);
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or_else(not_connected)?;
        self.port.post_recv(socket, buf)
    }

    fn post_send(&self, io: BytesMut) -> Result<(), SendError> {
        let socket = self.socket.lock();
        let socket = socket.as_ref().ok_or(SendError::Disconnected)?;
        self.port.post_send(socket, io)?;
        Ok(())
    }

    /// Mark the connection as closing. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Give up the socket. Later posts fail with `NotConnected`.
    pub(crate) fn take_socket(&self) -> Option<SocketHandle> {
        self.socket.lock().take()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

struct Entry {
    generation: u64,
    connection: Arc<Connection>,
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove. Lookups check the generation,
/// so removing one connection never affects the id held for another, and a
/// stale id is simply not found.
pub struct ConnectionRegistry {
    connections: Slab<Entry>,
    max_connections: usize,
    next_generation: u64,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            next_generation: 1,
        }
    }

    /// Id the next inserted connection will get, or `None` at capacity.
    pub fn vacant_id(&self) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(ConnectionId::new(
            self.connections.vacant_key(),
            self.next_generation,
        ))
    }

    /// Insert a connection built with the id returned by [`vacant_id`].
    ///
    /// Returns `false`, leaving the registry untouched, if the id is not the
    /// vacant one.
    ///
    /// [`vacant_id`]: ConnectionRegistry::vacant_id
    pub fn insert(&mut self, connection: Arc<Connection>) -> bool {
        if self.vacant_id() != Some(connection.id()) {
            return false;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.connections.insert(Entry {
            generation,
            connection,
        });
        true
    }

    /// Get a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.connections
            .get(id.index)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &entry.connection)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        if !self.contains(id) {
            return None;
        }
        Some(self.connections.remove(id.index).connection)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.connections
            .drain()
            .map(|entry| entry.connection)
            .collect()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
