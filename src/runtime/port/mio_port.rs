//! Completion port emulated on top of mio readiness.
//!
//! Readiness-based I/O (epoll on Linux, kqueue on macOS) is turned into a
//! completion model: a posted operation is attempted immediately; if the
//! socket is not ready it is parked in its slot and retried by the driver
//! thread when mio reports readiness. Either way, the result is pushed to a
//! shared MPMC queue as a [`Completion`].
//!
//! All socket state lives behind one lock, which stands in for the kernel.
//! Posting and retrying under the same lock means a readiness edge can never
//! slip between a `WouldBlock` and the op being parked.

use super::{CompletionPort, PostAcceptError};
use crate::runtime::connection::ConnectionId;
use crate::runtime::token::{
    AcceptOp, Completion, CompletionKey, Operation, SocketHandle, SocketId,
};
use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness events drained per poll.
const EVENTS_CAPACITY: usize = 1024;

/// A send in progress; `written` bytes of `buf` are already on the wire.
struct PendingSend {
    buf: BytesMut,
    written: usize,
}

/// One socket slot. The stream is absent until an accept lands in it.
#[derive(Default)]
struct Slot {
    stream: Option<TcpStream>,
    key: Option<ConnectionId>,
    recv: Option<BytesMut>,
    send: Option<PendingSend>,
}

impl Slot {
    fn completion_key(&self) -> CompletionKey {
        self.key.map_or(CompletionKey::None, CompletionKey::Connection)
    }
}

struct State {
    slots: Slab<Slot>,
    listener: Option<TcpListener>,
    accepts: VecDeque<AcceptOp>,
}

impl State {
    /// Complete as many pending accepts as the listener has clients for.
    fn try_accept(&mut self, registry: &Registry, tx: &Sender<Completion>) {
        while let Some(mut op) = self.accepts.pop_front() {
            let Some(listener) = self.listener.as_ref() else {
                let err = io::Error::new(io::ErrorKind::NotConnected, "listener closed");
                push(tx, Completion::accept(op, Err(err)));
                continue;
            };

            match listener.accept() {
                Ok((stream, peer)) => {
                    let result = install(&mut self.slots, registry, &mut op, stream, peer);
                    push(tx, Completion::accept(op, result));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accepts.push_front(op);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.accepts.push_front(op);
                }
                Err(e) => push(tx, Completion::accept(op, Err(e))),
            }
        }
    }

    fn try_recv(&mut self, id: usize, tx: &Sender<Completion>) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(mut buf) = slot.recv.take() else {
            return;
        };

        let result = match slot.stream.as_mut() {
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            Some(stream) => loop {
                match stream.read(&mut buf[..]) {
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            },
        };

        match result {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => slot.recv = Some(buf),
            Ok(n) => {
                buf.truncate(n);
                push(tx, Completion::receive(slot.completion_key(), buf, Ok(n)));
            }
            Err(e) => push(tx, Completion::receive(slot.completion_key(), buf, Err(e))),
        }
    }

    fn try_send(&mut self, id: usize, tx: &Sender<Completion>) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let Some(mut pending) = slot.send.take() else {
            return;
        };

        let result = match slot.stream.as_mut() {
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            Some(stream) => loop {
                if pending.written >= pending.buf.len() {
                    break Ok(pending.written);
                }
                match stream.write(&pending.buf[pending.written..]) {
                    Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => pending.written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            },
        };

        match result {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => slot.send = Some(pending),
            result => push(tx, Completion::send(slot.completion_key(), pending.buf, result)),
        }
    }

    /// Tear down the stream in a slot, failing whatever was in flight on it.
    fn reset_slot(&mut self, id: usize, registry: &Registry, tx: &Sender<Completion>) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let key = slot.completion_key();

        if let Some(mut stream) = slot.stream.take() {
            let _ = registry.deregister(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(buf) = slot.recv.take() {
            push(tx, Completion::receive(key, buf, Err(aborted())));
        }
        if let Some(pending) = slot.send.take() {
            push(tx, Completion::send(key, pending.buf, Err(aborted())));
        }
        slot.key = None;
    }
}

/// Move an accepted stream into the slot reserved by `op`.
fn install(
    slots: &mut Slab<Slot>,
    registry: &Registry,
    op: &mut AcceptOp,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> io::Result<usize> {
    let id = op
        .socket()
        .map(SocketHandle::id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "accept without a socket"))?;
    let slot = slots
        .get_mut(id.0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket slot"))?;

    let local = stream.local_addr()?;
    registry.register(
        &mut stream,
        Token(id.0),
        Interest::READABLE | Interest::WRITABLE,
    )?;

    slot.stream = Some(stream);
    op.set_addresses(local, peer);
    Ok(0)
}

fn push(tx: &Sender<Completion>, completion: Completion) {
    // The port holds a receiver for its whole lifetime.
    let _ = tx.send(completion);
}

fn aborted() -> io::Error {
    io::Error::from(io::ErrorKind::ConnectionAborted)
}

/// Completion port backed by mio and a driver thread.
pub struct MioPort {
    state: Arc<Mutex<State>>,
    registry: Registry,
    waker: Waker,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    stop: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MioPort {
    /// Create the port and start its driver thread.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (tx, rx) = crossbeam_channel::unbounded();

        let state = Arc::new(Mutex::new(State {
            slots: Slab::new(),
            listener: None,
            accepts: VecDeque::new(),
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let driver = {
            let state = Arc::clone(&state);
            let tx = tx.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("completion-port".to_string())
                .spawn(move || drive(poll, state, tx, stop))?
        };

        Ok(Self {
            state,
            registry,
            waker,
            tx,
            rx,
            stop,
            driver: Mutex::new(Some(driver)),
        })
    }

    fn stop_driver(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake completion port driver");
        }
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                error!("Completion port driver panicked");
            }
        }
    }
}

/// Driver loop: turn readiness into completions until stopped.
fn drive(mut poll: Poll, state: Arc<Mutex<State>>, tx: Sender<Completion>, stop: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "Completion port poll failed");
            break;
        }

        if stop.load(Ordering::Acquire) {
            break;
        }

        let mut state = state.lock();
        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => state.try_accept(poll.registry(), &tx),
                Token(id) => {
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        state.try_recv(id, &tx);
                    }
                    if event.is_writable() || event.is_write_closed() || event.is_error() {
                        state.try_send(id, &tx);
                    }
                }
            }
        }
    }

    trace!("Completion port driver stopped");
}

impl CompletionPort for MioPort {
    fn listen(&self, addr: SocketAddr, backlog: i32) -> io::Result<SocketAddr> {
        let mut state = self.state.lock();
        if state.listener.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "port is already listening",
            ));
        }

        let mut listener = TcpListener::from_std(create_listener(addr, backlog)?);
        self.registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener.local_addr()?;
        state.listener = Some(listener);

        debug!(addr = %local, "Listening");
        Ok(local)
    }

    fn close_listener(&self) {
        let mut state = self.state.lock();
        if let Some(mut listener) = state.listener.take() {
            let _ = self.registry.deregister(&mut listener);
        }
        // Pending accepts fail now that there is nothing to accept from.
        state.try_accept(&self.registry, &self.tx);
    }

    fn create_socket(&self) -> io::Result<SocketHandle> {
        let mut state = self.state.lock();
        let id = state.slots.insert(Slot::default());
        Ok(SocketHandle::new(SocketId(id)))
    }

    fn associate(&self, socket: &SocketHandle, key: ConnectionId) -> io::Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(socket.id().0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket slot"))?;
        slot.key = Some(key);
        Ok(())
    }

    fn post_accept(&self, op: AcceptOp) -> Result<(), PostAcceptError> {
        let mut state = self.state.lock();
        if state.listener.is_none() {
            return Err(PostAcceptError {
                op,
                error: io::Error::new(io::ErrorKind::NotConnected, "listener closed"),
            });
        }
        if op.socket().is_none() {
            return Err(PostAcceptError {
                op,
                error: io::Error::new(io::ErrorKind::InvalidInput, "accept without a socket"),
            });
        }

        state.accepts.push_back(op);
        state.try_accept(&self.registry, &self.tx);
        Ok(())
    }

    fn post_recv(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "receive buffer has no room",
            ));
        }

        let mut state = self.state.lock();
        let id = socket.id().0;
        let slot = state.slots.get_mut(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "unknown socket slot")
        })?;
        if slot.stream.is_none() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if slot.recv.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "receive already in flight",
            ));
        }

        slot.recv = Some(buf);
        state.try_recv(id, &self.tx);
        Ok(())
    }

    fn post_send(&self, socket: &SocketHandle, buf: BytesMut) -> io::Result<()> {
        let mut state = self.state.lock();
        let id = socket.id().0;
        let slot = state.slots.get_mut(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "unknown socket slot")
        })?;
        if slot.stream.is_none() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if slot.send.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "send already in flight",
            ));
        }

        slot.send = Some(PendingSend { buf, written: 0 });
        state.try_send(id, &self.tx);
        Ok(())
    }

    fn post_wake(&self) -> io::Result<()> {
        self.tx
            .send(Completion::wake())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "completion queue closed"))
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Completion> {
        match timeout {
            None => self
                .rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "completion queue closed")),
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => io::Error::from(io::ErrorKind::TimedOut),
                RecvTimeoutError::Disconnected => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "completion queue closed")
                }
            }),
        }
    }

    fn disconnect(&self, socket: &SocketHandle) -> io::Result<()> {
        let mut state = self.state.lock();
        let id = socket.id().0;
        if !state.slots.contains(id) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown socket slot"));
        }
        state.reset_slot(id, &self.registry, &self.tx);
        Ok(())
    }

    fn close(&self, socket: SocketHandle) {
        let mut state = self.state.lock();
        let id = socket.id().0;
        if state.slots.contains(id) {
            state.reset_slot(id, &self.registry, &self.tx);
            state.slots.remove(id);
        }
    }

    fn shutdown(&self) -> Vec<Operation> {
        self.stop_driver();

        let mut leftovers = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(mut listener) = state.listener.take() {
                let _ = self.registry.deregister(&mut listener);
            }
            leftovers.extend(state.accepts.drain(..).map(Operation::Accept));
            for (_, slot) in state.slots.iter_mut() {
                if let Some(buf) = slot.recv.take() {
                    leftovers.push(Operation::Receive(buf));
                }
                if let Some(pending) = slot.send.take() {
                    leftovers.push(Operation::Send(pending.buf));
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

impl Drop for MioPort {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
