//! Completion dispatch.
//!
//! Every worker thread runs [`Dispatcher::run_worker`]: pop a completion from
//! the shared port, match on the operation it carries, and route it to the
//! accept, receive or send path, or to connection teardown.

use crate::runtime::accept::AcceptPipeline;
use crate::runtime::connection::{Connection, ConnectionLimits, ConnectionRegistry};
use crate::runtime::handler::ConnectionHandler;
use crate::runtime::port::CompletionPort;
use crate::runtime::socket_pool::SocketPool;
use crate::runtime::token::{AcceptOp, Completion, CompletionKey, Operation};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) struct Dispatcher {
    port: Arc<dyn CompletionPort>,
    handler: Arc<dyn ConnectionHandler>,
    registry: Mutex<ConnectionRegistry>,
    pool: Arc<SocketPool>,
    pipeline: AcceptPipeline,
    limits: ConnectionLimits,
    should_quit: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        port: Arc<dyn CompletionPort>,
        handler: Arc<dyn ConnectionHandler>,
        limits: ConnectionLimits,
        max_connections: usize,
        accept_depth: usize,
    ) -> Self {
        let pool = Arc::new(SocketPool::new());
        let pipeline = AcceptPipeline::new(Arc::clone(&port), Arc::clone(&pool), accept_depth);
        Self {
            port,
            handler,
            registry: Mutex::new(ConnectionRegistry::new(max_connections)),
            pool,
            pipeline,
            limits,
            should_quit: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> &Arc<dyn CompletionPort> {
        &self.port
    }

    pub fn pipeline(&self) -> &AcceptPipeline {
        &self.pipeline
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    #[cfg(test)]
    pub fn pooled_sockets(&self) -> usize {
        self.pool.len()
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit.load(Ordering::Acquire)
    }

    /// Raise the shutdown flag and stop replenishing accepts.
    pub fn quit(&self) {
        self.should_quit.store(true, Ordering::Release);
        self.pipeline.close();
    }

    /// Post the initial accepts.
    pub fn begin_accept(&self) -> usize {
        self.pipeline.fill()
    }

    /// Worker loop. Returns when the shutdown flag is seen or the queue fails.
    pub fn run_worker(&self, worker_id: usize, timeout: Option<Duration>) {
        debug!(worker = worker_id, "Worker started");

        while !self.should_quit() {
            match self.port.wait(timeout) {
                Ok(completion) => self.dispatch(completion),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Completion queue failed, worker exiting");
                    return;
                }
            }
        }

        debug!(worker = worker_id, "Worker stopped");
    }

    /// Route one completion.
    pub fn dispatch(&self, completion: Completion) {
        let Completion { key, op, result } = completion;
        trace!(op = op.name(), ?key, "Completion");

        match op {
            Operation::Wake => {}
            Operation::Accept(op) => self.on_accept(op, result),
            Operation::Receive(buf) => self.on_receive(key, buf, result),
            Operation::Send(buf) => self.on_send(key, buf, result),
        }
    }

    fn on_accept(&self, mut op: AcceptOp, result: io::Result<usize>) {
        self.pipeline.completed();

        if let Err(e) = result {
            debug!(error = %e, "Accept failed");
            if let Some(socket) = op.take_socket() {
                self.pool.recycle(self.port.as_ref(), socket);
            }
            self.pipeline.repost(op);
            return;
        }

        self.complete_accept(&mut op);
        self.pipeline.repost(op);
    }

    /// Turn the socket of a completed accept into a registered connection.
    fn complete_accept(&self, op: &mut AcceptOp) {
        let Some(socket) = op.take_socket() else {
            warn!("Accept completed without a socket");
            return;
        };
        let Some((local, peer)) = op.addresses() else {
            warn!(socket = %socket.id(), "Accept completed without addresses");
            self.pool.recycle(self.port.as_ref(), socket);
            return;
        };
        if self.should_quit() {
            self.pool.recycle(self.port.as_ref(), socket);
            return;
        }

        let (conn, live) = {
            let mut registry = self.registry.lock();
            let Some(id) = registry.vacant_id() else {
                drop(registry);
                warn!(peer = %peer, "Connection limit reached");
                self.pool.recycle(self.port.as_ref(), socket);
                return;
            };
            let conn = Arc::new(Connection::new(
                id,
                local,
                peer,
                socket,
                Arc::clone(&self.port),
                self.limits,
            ));
            registry.insert(Arc::clone(&conn));
            (conn, registry.len())
        };

        info!(conn_id = %conn.id(), peer = %peer, local = %local, live, "Client connected");

        if let Err(e) = conn.associate().and_then(|()| conn.start_receiving()) {
            debug!(conn_id = %conn.id(), error = %e, "Failed to start connection");
            self.remove_connection(&conn);
        }
    }

    fn on_receive(&self, key: CompletionKey, mut buf: BytesMut, result: io::Result<usize>) {
        let Some(conn) = self.lookup(key) else {
            return;
        };

        match result {
            Ok(0) => {
                debug!(conn_id = %conn.id(), "Peer closed connection");
                self.remove_connection(&conn);
            }
            Ok(n) => {
                buf.truncate(n);
                if let Err(e) = conn.on_receive(buf, self.handler.as_ref()) {
                    debug!(conn_id = %conn.id(), error = %e, "Receive failed");
                    self.remove_connection(&conn);
                }
            }
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Connection error");
                self.remove_connection(&conn);
            }
        }
    }

    fn on_send(&self, key: CompletionKey, buf: BytesMut, result: io::Result<usize>) {
        let Some(conn) = self.lookup(key) else {
            return;
        };

        match result {
            Ok(n) => {
                if let Err(e) = conn.on_send_complete(buf, n) {
                    debug!(conn_id = %conn.id(), error = %e, "Send failed");
                    self.remove_connection(&conn);
                }
            }
            Err(e) => {
                debug!(conn_id = %conn.id(), error = %e, "Send failed");
                self.remove_connection(&conn);
            }
        }
    }

    /// Live connection a completion belongs to. Completions of connections
    /// already torn down resolve to nothing and are dropped with their buffer.
    fn lookup(&self, key: CompletionKey) -> Option<Arc<Connection>> {
        match key {
            CompletionKey::Connection(id) => self.registry.lock().get(id).cloned(),
            CompletionKey::None | CompletionKey::Listener => None,
        }
    }

    /// Tear a connection down: notify the handler once, unregister it, and
    /// recycle its socket.
    fn remove_connection(&self, conn: &Arc<Connection>) {
        if !conn.begin_close() {
            return;
        }

        self.handler.on_disconnect(conn);

        let live = {
            let mut registry = self.registry.lock();
            registry.remove(conn.id());
            registry.len()
        };
        if let Some(socket) = conn.take_socket() {
            self.pool.recycle(self.port.as_ref(), socket);
        }

        debug!(conn_id = %conn.id(), live, "Connection closed");
    }

    /// Release everything once all workers have stopped: operations left in
    /// the port, live connections and pooled sockets.
    pub fn release_all(&self) {
        let mut leftovers = 0;
        for op in self.port.shutdown() {
            leftovers += 1;
            if let Operation::Accept(mut op) = op {
                if let Some(socket) = op.take_socket() {
                    self.port.close(socket);
                }
            }
        }

        let connections = self.registry.lock().drain();
        let closed = connections.len();
        for conn in connections {
            if conn.begin_close() {
                self.handler.on_disconnect(&conn);
            }
            if let Some(socket) = conn.take_socket() {
                self.port.close(socket);
            }
        }

        for socket in self.pool.drain() {
            self.port.close(socket);
        }

        debug!(
            leftovers,
            connections = closed,
            open_sockets = self.port.open_sockets(),
            "Released server resources"
        );
    }
}
