//! Server control: startup and shutdown sequencing.
//!
//! Startup binds the listener, spawns the worker pool and posts the initial
//! accepts. Shutdown closes the listener, posts one wake per worker, joins
//! them all, then releases every connection and socket still around.

use crate::config::Config;
use crate::error::StartupError;
use crate::runtime::{CompletionPort, ConnectionHandler, ConnectionLimits, Dispatcher, MioPort};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// A running server.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    workers: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    stopped: bool,
}

impl Server {
    /// Start serving on `config.listen_addr()` with the mio completion port.
    pub fn startup<H: ConnectionHandler>(config: &Config, handler: H) -> Result<Self, StartupError> {
        config.validate()?;
        let port = MioPort::new().map_err(StartupError::Port)?;
        Self::startup_with_port(config, Arc::new(handler), Arc::new(port))
    }

    /// Start serving on an explicit completion port.
    ///
    /// On failure the port has been shut down and every worker spawned so far
    /// has been joined.
    pub fn startup_with_port(
        config: &Config,
        handler: Arc<dyn ConnectionHandler>,
        port: Arc<dyn CompletionPort>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let addr = config.listen_addr();
        let local_addr = match port.listen(addr, config.listen_backlog) {
            Ok(local_addr) => local_addr,
            Err(source) => {
                port.shutdown();
                return Err(StartupError::Bind { addr, source });
            }
        };

        let limits = ConnectionLimits {
            io_buffer_size: config.io_buffer_size,
            recv_cache_limit: config.recv_cache_limit,
        };
        let dispatcher = Arc::new(Dispatcher::new(
            port,
            handler,
            limits,
            config.max_connections,
            config.accept_depth,
        ));

        let worker_count = config.worker_count();
        let timeout = config.wait_timeout();
        let mut server = Server {
            dispatcher,
            workers: Vec::with_capacity(worker_count),
            local_addr,
            stopped: false,
        };

        for worker_id in 0..worker_count {
            let dispatcher = Arc::clone(&server.dispatcher);
            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || dispatcher.run_worker(worker_id, timeout));

            match spawned {
                Ok(handle) => server.workers.push(handle),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    server.shutdown();
                    return Err(StartupError::Spawn(e));
                }
            }
        }

        let posted = server.dispatcher.begin_accept();
        if posted < config.accept_depth {
            warn!(posted, depth = config.accept_depth, "Accept pipeline not full at startup");
        }

        info!(
            addr = %local_addr,
            workers = worker_count,
            accept_depth = config.accept_depth,
            max_connections = config.max_connections,
            "Server started"
        );

        Ok(server)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.dispatcher.connection_count()
    }

    /// Stop the server and release everything it owns. Returns once all
    /// workers have exited. Calling it again does nothing.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!(connections = self.connection_count(), "Shutting down");

        let port = Arc::clone(self.dispatcher.port());
        self.dispatcher.quit();
        port.close_listener();

        for _ in 0..self.workers.len() {
            if let Err(e) = port.post_wake() {
                warn!(error = %e, "Failed to post wake");
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        self.dispatcher.release_all();
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
