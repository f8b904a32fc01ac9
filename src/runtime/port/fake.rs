//! Scripted completion port for tests.
//!
//! Nothing completes on its own: tests post through the normal
//! [`CompletionPort`] methods, then decide when and how each operation
//! finishes (`accept`, `deliver`, `hang_up`, `complete_send`, ...). Socket
//! slots are counted so tests can check that nothing leaks.

use super::{CompletionPort, PostAcceptError};
use crate::runtime::connection::{Connection, ConnectionId, ConnectionLimits};
use crate::runtime::token::{
    AcceptOp, Completion, CompletionKey, Operation, SocketHandle, SocketId,
};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FakeSlot {
    connected: bool,
    key: Option<ConnectionId>,
    recv: Option<BytesMut>,
    send: Option<BytesMut>,
    transmitted: Vec<Vec<u8>>,
}

impl FakeSlot {
    fn completion_key(&self) -> CompletionKey {
        self.key.map_or(CompletionKey::None, CompletionKey::Connection)
    }
}

#[derive(Default)]
struct FakeState {
    slots: Slab<FakeSlot>,
    listening: Option<SocketAddr>,
    accepts: VecDeque<AcceptOp>,
    last: Option<usize>,
    shut: bool,
}

pub(crate) struct FakePort {
    state: Mutex<FakeState>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    fail_listen: AtomicBool,
    fail_create: AtomicBool,
    fail_recv: AtomicBool,
    fail_send: AtomicBool,
    fail_wait: AtomicBool,
}

impl FakePort {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            state: Mutex::new(FakeState::default()),
            tx,
            rx,
            fail_listen: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_recv: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            fail_wait: AtomicBool::new(false),
        }
    }

    pub fn set_fail_listen(&self, fail: bool) {
        self.fail_listen.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_recv(&self, fail: bool) {
        self.fail_recv.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Make the next `wait` fail with a queue error.
    pub fn fail_next_wait(&self) {
        self.fail_wait.store(true, Ordering::SeqCst);
    }

    /// A socket that is already connected, outside of any accept.
    pub fn connected_socket(&self) -> SocketHandle {
        let mut state = self.state.lock();
        let id = state.slots.insert(FakeSlot {
            connected: true,
            ..FakeSlot::default()
        });
        state.last = Some(id);
        SocketHandle::new(SocketId(id))
    }

    /// The most recently connected socket.
    pub fn last_socket(&self) -> SocketId {
        SocketId(self.state.lock().last.unwrap_or(usize::MAX))
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening.is_some()
    }

    pub fn pending_accepts(&self) -> usize {
        self.state.lock().accepts.len()
    }

    /// A client from `peer` arrives; completes the oldest pending accept.
    pub fn accept(&self, peer: SocketAddr) -> Option<SocketId> {
        let mut state = self.state.lock();
        let local = state.listening?;
        let mut op = state.accepts.pop_front()?;
        let id = op.socket()?.id();
        let slot = state.slots.get_mut(id.0)?;
        slot.connected = true;
        state.last = Some(id.0);
        op.set_addresses(local, peer);
        self.push(Completion::accept(op, Ok(0)));
        Some(id)
    }

    /// Fail the oldest pending accept.
    pub fn fail_accept(&self) -> Option<SocketId> {
        let op = self.state.lock().accepts.pop_front()?;
        let id = op.socket().map(SocketHandle::id);
        self.push(Completion::accept(
            op,
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ));
        id
    }

    /// Complete the pending receive on `socket` with `data`. Returns how many
    /// bytes fit into the posted buffer, or `None` without a pending receive.
    pub fn deliver(&self, socket: SocketId, data: &[u8]) -> Option<usize> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(socket.0)?;
        let mut buf = slot.recv.take()?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        buf.truncate(n);
        self.push(Completion::receive(slot.completion_key(), buf, Ok(n)));
        Some(n)
    }

    /// The peer closes gracefully: the pending receive reads 0 bytes.
    pub fn hang_up(&self, socket: SocketId) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(socket.0) else {
            return false;
        };
        let Some(mut buf) = slot.recv.take() else {
            return false;
        };
        buf.clear();
        self.push(Completion::receive(slot.completion_key(), buf, Ok(0)));
        true
    }

    /// The connection is reset: the pending receive fails.
    pub fn reset(&self, socket: SocketId) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(socket.0) else {
            return false;
        };
        let Some(buf) = slot.recv.take() else {
            return false;
        };
        self.push(Completion::receive(
            slot.completion_key(),
            buf,
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        ));
        true
    }

    pub fn take_recv(&self, socket: SocketId) -> Option<BytesMut> {
        self.state.lock().slots.get_mut(socket.0)?.recv.take()
    }

    pub fn recv_posted(&self, socket: SocketId) -> bool {
        self.state
            .lock()
            .slots
            .get(socket.0)
            .is_some_and(|slot| slot.recv.is_some())
    }

    pub fn send_in_flight(&self, socket: SocketId) -> bool {
        self.state
            .lock()
            .slots
            .get(socket.0)
            .is_some_and(|slot| slot.send.is_some())
    }

    /// Every buffer posted for sending on `socket`, in order.
    pub fn transmitted(&self, socket: SocketId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .slots
            .get(socket.0)
            .map(|slot| slot.transmitted.clone())
            .unwrap_or_default()
    }

    /// Complete the pending send on `socket` in full.
    pub fn complete_send(&self, socket: SocketId) -> bool {
        self.finish_send(socket, |buf| Ok(buf.len()))
    }

    /// Complete the pending send on `socket` after only `n` bytes.
    pub fn complete_send_partial(&self, socket: SocketId, n: usize) -> bool {
        self.finish_send(socket, |buf| Ok(n.min(buf.len())))
    }

    pub fn fail_send(&self, socket: SocketId) -> bool {
        self.finish_send(socket, |_| {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        })
    }

    fn finish_send<F>(&self, socket: SocketId, result: F) -> bool
    where
        F: FnOnce(&BytesMut) -> io::Result<usize>,
    {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(socket.0) else {
            return false;
        };
        let Some(buf) = slot.send.take() else {
            return false;
        };
        let result = result(&buf);
        self.push(Completion::send(slot.completion_key(), buf, result));
        true
    }

    pub fn try_next(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    fn push(&self, completion: Completion) {
        let _ = self.tx.send(completion);
    }

    fn abort_slot(&self, slot: &mut FakeSlot) {
        let key = slot.completion_key();
        if let Some(buf) = slot.recv.take() {
            self.push(Completion::receive(key, buf, Err(aborted())));
        }
        if let Some(buf) = slot.send.take() {
            self.push(Completion::send(key, buf, Err(aborted())));
        }
        slot.connected = false;
        slot.key = None;
    }
}

/// A live connection over a fresh connected socket of `port`.
pub(crate) fn connection(port: &Arc<FakePort>, io_buffer_size: usize) -> (Arc<Connection>, SocketId) {
    let socket = port.connected_socket();
    let id = socket.id();
    let port_dyn: Arc<dyn CompletionPort> = port.clone();
    let conn = Connection::new(
        ConnectionId::new(id.0, 1),
        "127.0.0.1:7878".parse().unwrap(),
        "127.0.0.1:40000".parse().unwrap(),
        socket,
        port_dyn,
        ConnectionLimits {
            io_buffer_size,
            recv_cache_limit: io_buffer_size * 4,
        },
    );
    (Arc::new(conn), id)
}

fn aborted() -> io::Error {
    io::Error::from(io::ErrorKind::ConnectionAborted)
}

fn unknown_slot() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "unknown socket slot")
}

impl CompletionPort for FakePort {
    fn listen(&self, addr: SocketAddr, _backlog: i32) -> io::Result<SocketAddr> {
        if self.fail_listen.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let mut bound = addr;
        if bound.port() == 0 {
            bound.set_port(7878);
        }
        self.state.lock().listening = Some(bound);
        Ok(bound)
    }

    fn close_listener(&self) {
        let mut state = self.state.lock();
        state.listening = None;
        for op in state.accepts.drain(..) {
            self.push(Completion::accept(
                op,
                Err(io::Error::from(io::ErrorKind::NotConnected)),
            ));
        }
    }

    fn create_socket(&self) -> io::Result<SocketHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(io::Error::other("socket creation disabled"));
        }
        let id = self.state.lock().slots.insert(FakeSlot::default());
        Ok(SocketHandle::new(SocketId(id)))
    }

    fn associate(&self, socket: &SocketHandle, key: ConnectionId) -> io::Result<()> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(socket.id().0).ok_or_else(unknown_slot)?;
        slot.key = Some(key);
        Ok(())
    }

    fn post_accept(&self, op: AcceptOp) -> Result<(), PostAcceptError> {
        let mut state = self.state.lock();
        if state.shut || state.listening.is_none() {
            return Err(PostAcceptError {
                op,
                error: io::Error::from(io::ErrorKind::NotConnected),
            });
        }
        if op.socket().is_none() {
            return Err(PostAcceptError {
                op,
                error: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        state.accepts.push_back(op);
        Ok(())
    }

    fn post_recv(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()> {
        if self.fail_recv.load(Ordering::SeqCst) {
            return Err(io::Error::other("receive disabled"));
        }
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(socket.id().0).ok_or_else(unknown_slot)?;
        if !slot.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if slot.recv.is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        slot.recv = Some(buf);
        Ok(())
    }

    fn post_send(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(io::Error::other("send disabled"));
        }
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(socket.id().0).ok_or_else(unknown_slot)?;
        if !slot.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if slot.send.is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        slot.transmitted.push(buf.to_vec());
        slot.send = Some(buf);
        Ok(())
    }

    fn post_wake(&self) -> io::Result<()> {
        self.push(Completion::wake());
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Completion> {
        if self.fail_wait.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("completion queue failed"));
        }
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "completion queue closed");
        match timeout {
            None => self.rx.recv().map_err(|_| closed()),
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
                RecvTimeoutError::Disconnected => closed(),
            }),
        }
    }

    fn disconnect(&self, socket: &SocketHandle) -> io::Result<()> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(socket.id().0).ok_or_else(unknown_slot)?;
        self.abort_slot(slot);
        Ok(())
    }

    fn close(&self, socket: SocketHandle) {
        let mut state = self.state.lock();
        let id = socket.id().0;
        if let Some(slot) = state.slots.get_mut(id) {
            self.abort_slot(slot);
            state.slots.remove(id);
        }
    }

    fn shutdown(&self) -> Vec<Operation> {
        let mut leftovers = Vec::new();
        {
            let mut state = self.state.lock();
            state.shut = true;
            state.listening = None;
            leftovers.extend(state.accepts.drain(..).map(Operation::Accept));
            for (_, slot) in state.slots.iter_mut() {
                if let Some(buf) = slot.recv.take() {
                    leftovers.push(Operation::Receive(buf));
                }
                if let Some(buf) = slot.send.take() {
                    leftovers.push(Operation::Send(buf));
                }
            }
        }
        leftovers.extend(self.rx.try_iter().map(|completion| completion.op));
        leftovers
    }

    fn open_sockets(&self) -> usize {
        self.state.lock().slots.len()
    }
}
