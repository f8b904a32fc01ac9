//! Pre-posted accepts.
//!
//! The listener always has up to `depth` accepts outstanding, each carrying a
//! socket reserved for the next client. Every completed accept is replaced,
//! so bursts of new clients never wait for a worker to post the next one.

use crate::runtime::port::{CompletionPort, PostAcceptError};
use crate::runtime::socket_pool::SocketPool;
use crate::runtime::token::AcceptOp;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AcceptPipeline {
    port: Arc<dyn CompletionPort>,
    pool: Arc<SocketPool>,
    depth: usize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl AcceptPipeline {
    pub fn new(port: Arc<dyn CompletionPort>, pool: Arc<SocketPool>, depth: usize) -> Self {
        Self {
            port,
            pool,
            depth,
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Accepts currently posted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop posting accepts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Post accepts until `depth` are outstanding. Returns how many were posted.
    pub fn fill(&self) -> usize {
        let mut posted = 0;
        while self.post_accept(AcceptOp::new()) {
            posted += 1;
        }
        posted
    }

    /// An accept completed and its operation left the port.
    pub fn completed(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Reuse a completed operation for the next accept, then top up.
    pub fn repost(&self, op: AcceptOp) {
        self.post_accept(op);
        self.fill();
    }

    /// Arm `op` with a pooled or fresh socket and post it.
    ///
    /// Returns `false` when nothing was posted: the pipeline is closed or
    /// full, or no socket could be obtained, or the port refused the accept.
    fn post_accept(&self, mut op: AcceptOp) -> bool {
        if self.is_closed() || !self.reserve() {
            return false;
        }

        let socket = match self.pool.pop() {
            Some(socket) => socket,
            None => match self.port.create_socket() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "Failed to create socket for accept");
                    self.completed();
                    return false;
                }
            },
        };

        op.arm(socket);
        match self.port.post_accept(op) {
            Ok(()) => true,
            Err(PostAcceptError { mut op, error }) => {
                debug!(error = %error, "Failed to post accept");
                if let Some(socket) = op.take_socket() {
                    self.pool.push(socket);
                }
                self.completed();
                false
            }
        }
    }

    /// Claim one outstanding slot, never exceeding `depth`.
    fn reserve(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.depth).then_some(n + 1)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::port::fake::FakePort;

    fn pipeline(depth: usize) -> (Arc<FakePort>, Arc<SocketPool>, AcceptPipeline) {
        let port = Arc::new(FakePort::new());
        port.listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let pool = Arc::new(SocketPool::new());
        let port_dyn: Arc<dyn CompletionPort> = port.clone();
        let pipeline = AcceptPipeline::new(port_dyn, Arc::clone(&pool), depth);
        (port, pool, pipeline)
    }

    #[test]
    fn test_fill_posts_depth_accepts() {
        let (port, _pool, pipeline) = pipeline(10);
        assert_eq!(pipeline.fill(), 10);
        assert_eq!(pipeline.outstanding(), 10);
        assert_eq!(port.pending_accepts(), 10);
        assert_eq!(port.open_sockets(), 10);

        // Already full.
        assert_eq!(pipeline.fill(), 0);
        assert_eq!(port.pending_accepts(), 10);
    }

    #[test]
    fn test_pooled_sockets_are_reused() {
        let (port, pool, pipeline) = pipeline(2);
        pool.push(port.create_socket().unwrap());

        assert_eq!(pipeline.fill(), 2);
        assert!(pool.is_empty());
        assert_eq!(port.open_sockets(), 2);
    }

    #[test]
    fn test_repost_keeps_depth() {
        let (port, _pool, pipeline) = pipeline(3);
        pipeline.fill();

        port.accept("10.0.0.1:5000".parse().unwrap()).unwrap();
        pipeline.completed();
        assert_eq!(pipeline.outstanding(), 2);

        pipeline.repost(AcceptOp::new());
        assert_eq!(pipeline.outstanding(), 3);
        assert_eq!(port.pending_accepts(), 3);
    }

    #[test]
    fn test_socket_failure_releases_reservation() {
        let (port, _pool, pipeline) = pipeline(4);
        port.set_fail_create(true);
        assert_eq!(pipeline.fill(), 0);
        assert_eq!(pipeline.outstanding(), 0);

        port.set_fail_create(false);
        assert_eq!(pipeline.fill(), 4);
    }

    #[test]
    fn test_refused_accept_returns_socket_to_pool() {
        let (port, pool, pipeline) = pipeline(4);
        port.close_listener();

        assert_eq!(pipeline.fill(), 0);
        assert_eq!(pipeline.outstanding(), 0);
        assert_eq!(pool.len(), 1);
        assert_eq!(port.open_sockets(), 1);
    }

    #[test]
    fn test_closed_pipeline_posts_nothing() {
        let (port, _pool, pipeline) = pipeline(4);
        pipeline.close();
        assert_eq!(pipeline.fill(), 0);
        assert_eq!(port.open_sockets(), 0);
    }
}
